//! Kernel route programming boundary
//!
//! The engine talks to the kernel through the [`RouteKernel`] trait:
//! idempotent replace, idempotent delete, a full dump of one table, and a
//! best-match query for next-hop resolution. The Linux implementation
//! drives an rtnetlink socket directly; every send and receive is bounded
//! by a socket timeout so a wedged kernel query surfaces as a transient
//! failure instead of a stall.

use std::net::IpAddr;

use async_trait::async_trait;
use ipnet::IpNet;

use crate::error::Result;
use crate::types::{ResolvedRoute, TableId};

/// One route entry as observed in the kernel table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelRoute {
    pub destination: IpNet,
    pub gateway: Option<IpAddr>,
    pub oif: Option<u32>,
    pub table: u32,
    /// True when the entry carries the static protocol marker this daemon
    /// stamps on everything it installs.
    pub protocol_static: bool,
}

/// Kernel routing-table access used by the engine and the gateway resolver.
///
/// Implementations must make `replace_route` install-or-update (never
/// duplicate) and `delete_route` succeed when the entry is already absent.
#[async_trait]
pub trait RouteKernel: Send {
    /// Installs the route, replacing any existing entry for the same
    /// destination and table.
    async fn replace_route(&mut self, route: &ResolvedRoute) -> Result<()>;

    /// Removes the entry for the route's destination and table. Absence is
    /// not an error.
    async fn delete_route(&mut self, route: &ResolvedRoute) -> Result<()>;

    /// Dumps all current entries of the given table.
    async fn list_routes(&mut self, table: TableId) -> Result<Vec<KernelRoute>>;

    /// Returns the route the kernel would currently use to reach the
    /// destination, or `None` when no path exists.
    async fn query_route(&mut self, destination: IpAddr) -> Result<Option<KernelRoute>>;
}

#[cfg(target_os = "linux")]
mod linux {
    use std::net::IpAddr;
    use std::os::fd::AsRawFd;
    use std::time::Duration;

    use async_trait::async_trait;
    use ipnet::{IpNet, Ipv4Net, Ipv6Net};
    use netlink_packet_core::{
        NetlinkHeader, NetlinkMessage, NetlinkPayload, NLM_F_ACK, NLM_F_CREATE, NLM_F_DUMP,
        NLM_F_REPLACE, NLM_F_REQUEST,
    };
    use netlink_packet_route::route::{
        RouteAddress, RouteAttribute, RouteMessage, RouteProtocol, RouteScope, RouteType,
    };
    use netlink_packet_route::{AddressFamily, RouteNetlinkMessage};
    use netlink_sys::{protocols::NETLINK_ROUTE, Socket, SocketAddr};
    use tracing::{debug, instrument, trace};

    use super::{KernelRoute, RouteKernel};
    use crate::error::{Result, RoutesyncError};
    use crate::types::{ResolvedRoute, TableId};

    /// Receive buffer size; route dumps on busy tables come in bursts.
    const SOCKET_RECV_BUFFER_SIZE: usize = 64 * 1024;

    const ERRNO_ESRCH: i32 = 3;
    const ERRNO_ENETUNREACH: i32 = 101;
    const ERRNO_EHOSTUNREACH: i32 = 113;

    /// rtnetlink-backed kernel access. Requires CAP_NET_ADMIN for mutations.
    pub struct NetlinkRouteKernel {
        socket: Socket,
        buffer: Vec<u8>,
        sequence: u32,
        timeout: Duration,
    }

    impl NetlinkRouteKernel {
        /// Opens and binds the rtnetlink socket, bounding every send and
        /// receive by `timeout`.
        #[instrument]
        pub fn new(timeout: Duration) -> Result<Self> {
            let mut socket = Socket::new(NETLINK_ROUTE)
                .map_err(|e| RoutesyncError::Netlink(format!("failed to create socket: {e}")))?;
            let addr = SocketAddr::new(0, 0);
            socket
                .bind(&addr)
                .map_err(|e| RoutesyncError::Netlink(format!("failed to bind socket: {e}")))?;

            let kernel = Self {
                socket,
                buffer: Vec::with_capacity(SOCKET_RECV_BUFFER_SIZE),
                sequence: 0,
                timeout,
            };
            kernel.set_timeouts()?;
            debug!(?timeout, "rtnetlink socket ready");
            Ok(kernel)
        }

        /// Applies SO_RCVTIMEO/SO_SNDTIMEO so no kernel call stalls
        /// indefinitely.
        fn set_timeouts(&self) -> Result<()> {
            let fd = self.socket.as_raw_fd();
            let tv = libc::timeval {
                tv_sec: self.timeout.as_secs() as libc::time_t,
                tv_usec: self.timeout.subsec_micros() as libc::suseconds_t,
            };
            for opt in [libc::SO_RCVTIMEO, libc::SO_SNDTIMEO] {
                let ret = unsafe {
                    libc::setsockopt(
                        fd,
                        libc::SOL_SOCKET,
                        opt,
                        &tv as *const _ as *const libc::c_void,
                        std::mem::size_of::<libc::timeval>() as libc::socklen_t,
                    )
                };
                if ret < 0 {
                    return Err(RoutesyncError::Netlink(
                        "failed to set socket timeout".into(),
                    ));
                }
            }
            Ok(())
        }

        fn next_sequence(&mut self) -> u32 {
            self.sequence = self.sequence.wrapping_add(1);
            self.sequence
        }

        fn send_request(&mut self, payload: RouteNetlinkMessage, flags: u16) -> Result<()> {
            let mut header = NetlinkHeader::default();
            header.flags = flags;
            header.sequence_number = self.next_sequence();

            let mut packet = NetlinkMessage::new(header, NetlinkPayload::InnerMessage(payload));
            packet.finalize();

            let mut buf = vec![0u8; packet.buffer_len()];
            packet.serialize(&mut buf);

            self.socket.send(&buf, 0).map_err(|e| self.map_io(e))?;
            Ok(())
        }

        fn recv(&mut self) -> Result<usize> {
            // recv appends through BufMut, writing into the vec's spare
            // capacity after its current length. Reset the length first so
            // each reply lands at the front, where the parsers read.
            self.buffer.clear();
            self.socket
                .recv(&mut self.buffer, 0)
                .map_err(|e| self.map_io(e))
        }

        /// Socket timeouts arrive as WouldBlock; report them as the bounded
        /// timeout they are so the engine classifies them transient.
        fn map_io(&self, e: std::io::Error) -> RoutesyncError {
            match e.kind() {
                std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut => {
                    RoutesyncError::KernelTimeout(self.timeout)
                }
                _ => RoutesyncError::Io(e),
            }
        }

        /// Reads the acknowledgement for a mutating request.
        fn recv_ack(&mut self, op: &'static str) -> Result<()> {
            let len = self.recv()?;
            let mut offset = 0;
            while offset < len {
                let msg = NetlinkMessage::<RouteNetlinkMessage>::deserialize(
                    &self.buffer[offset..len],
                )
                .map_err(|e| RoutesyncError::Netlink(format!("failed to parse ack: {e}")))?;
                offset = align(offset + msg.header.length as usize);

                if let NetlinkPayload::Error(err) = msg.payload {
                    return match err.code {
                        None => Ok(()),
                        Some(code) => Err(RoutesyncError::Kernel {
                            op,
                            errno: -code.get(),
                        }),
                    };
                }
            }
            Err(RoutesyncError::Netlink(format!(
                "no acknowledgement received for {op}"
            )))
        }

        /// Builds the rtnetlink message for a resolved route.
        fn route_message(&self, route: &ResolvedRoute) -> Result<RouteMessage> {
            let mut msg = RouteMessage::default();
            msg.header.table = route.table.as_u8();
            msg.header.protocol = RouteProtocol::Static;
            msg.header.kind = RouteType::Unicast;
            msg.header.scope = if route.gateway.is_some() {
                RouteScope::Universe
            } else {
                RouteScope::Link
            };

            match route.destination {
                IpNet::V4(net) => {
                    msg.header.address_family = AddressFamily::Inet;
                    msg.header.destination_prefix_length = net.prefix_len();
                    msg.attributes
                        .push(RouteAttribute::Destination(RouteAddress::Inet(
                            net.network(),
                        )));
                }
                IpNet::V6(net) => {
                    msg.header.address_family = AddressFamily::Inet6;
                    msg.header.destination_prefix_length = net.prefix_len();
                    msg.attributes
                        .push(RouteAttribute::Destination(RouteAddress::Inet6(
                            net.network(),
                        )));
                }
            }

            match (route.gateway, &route.destination) {
                (Some(IpAddr::V4(gw)), IpNet::V4(_)) => {
                    msg.attributes
                        .push(RouteAttribute::Gateway(RouteAddress::Inet(gw)));
                }
                (Some(IpAddr::V6(gw)), IpNet::V6(_)) => {
                    msg.attributes
                        .push(RouteAttribute::Gateway(RouteAddress::Inet6(gw)));
                }
                (Some(gw), _) => {
                    return Err(RoutesyncError::Netlink(format!(
                        "gateway {gw} does not match destination family of {}",
                        route.destination
                    )));
                }
                (None, _) => {}
            }

            if let Some(oif) = route.oif {
                msg.attributes.push(RouteAttribute::Oif(oif));
            }

            Ok(msg)
        }
    }

    #[async_trait]
    impl RouteKernel for NetlinkRouteKernel {
        #[instrument(skip(self), fields(route = %route))]
        async fn replace_route(&mut self, route: &ResolvedRoute) -> Result<()> {
            let msg = self.route_message(route)?;
            self.send_request(
                RouteNetlinkMessage::NewRoute(msg),
                NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_REPLACE,
            )?;
            self.recv_ack("route replace")?;
            trace!("route replaced");
            Ok(())
        }

        #[instrument(skip(self), fields(route = %route))]
        async fn delete_route(&mut self, route: &ResolvedRoute) -> Result<()> {
            // Deletion matches on destination and table only; a stale
            // gateway in the request would make the kernel miss the entry.
            let mut target = route.clone();
            target.gateway = None;
            target.oif = None;
            let mut msg = self.route_message(&target)?;
            msg.header.scope = RouteScope::Universe;
            self.send_request(
                RouteNetlinkMessage::DelRoute(msg),
                NLM_F_REQUEST | NLM_F_ACK,
            )?;
            match self.recv_ack("route delete") {
                // Idempotent delete: the entry was already gone.
                Err(RoutesyncError::Kernel { errno, .. }) if errno == ERRNO_ESRCH => Ok(()),
                other => other,
            }
        }

        #[instrument(skip(self))]
        async fn list_routes(&mut self, table: TableId) -> Result<Vec<KernelRoute>> {
            let msg = RouteMessage::default();
            self.send_request(
                RouteNetlinkMessage::GetRoute(msg),
                NLM_F_REQUEST | NLM_F_DUMP,
            )?;

            let mut routes = Vec::new();
            'dump: loop {
                let len = self.recv()?;
                let mut offset = 0;
                while offset < len {
                    let msg = NetlinkMessage::<RouteNetlinkMessage>::deserialize(
                        &self.buffer[offset..len],
                    )
                    .map_err(|e| {
                        RoutesyncError::Netlink(format!("failed to parse route dump: {e}"))
                    })?;
                    offset = align(offset + msg.header.length as usize);

                    match msg.payload {
                        NetlinkPayload::Done(_) => break 'dump,
                        NetlinkPayload::Error(err) => {
                            let errno = err.code.map(|c| -c.get()).unwrap_or(0);
                            return Err(RoutesyncError::Kernel {
                                op: "route dump",
                                errno,
                            });
                        }
                        NetlinkPayload::InnerMessage(RouteNetlinkMessage::NewRoute(rm)) => {
                            if route_table(&rm) == table.as_u32() {
                                if let Some(kernel_route) = parse_kernel_route(&rm) {
                                    routes.push(kernel_route);
                                }
                            }
                        }
                        _ => {}
                    }
                }
            }
            trace!(count = routes.len(), table = %table, "dumped routes");
            Ok(routes)
        }

        #[instrument(skip(self))]
        async fn query_route(&mut self, destination: IpAddr) -> Result<Option<KernelRoute>> {
            let mut msg = RouteMessage::default();
            match destination {
                IpAddr::V4(addr) => {
                    msg.header.address_family = AddressFamily::Inet;
                    msg.header.destination_prefix_length = 32;
                    msg.attributes
                        .push(RouteAttribute::Destination(RouteAddress::Inet(addr)));
                }
                IpAddr::V6(addr) => {
                    msg.header.address_family = AddressFamily::Inet6;
                    msg.header.destination_prefix_length = 128;
                    msg.attributes
                        .push(RouteAttribute::Destination(RouteAddress::Inet6(addr)));
                }
            }
            self.send_request(RouteNetlinkMessage::GetRoute(msg), NLM_F_REQUEST)?;

            let len = self.recv()?;
            let mut offset = 0;
            while offset < len {
                let msg = NetlinkMessage::<RouteNetlinkMessage>::deserialize(
                    &self.buffer[offset..len],
                )
                .map_err(|e| RoutesyncError::Netlink(format!("failed to parse route get: {e}")))?;
                offset = align(offset + msg.header.length as usize);

                match msg.payload {
                    NetlinkPayload::Error(err) => {
                        let errno = err.code.map(|c| -c.get()).unwrap_or(0);
                        return match errno {
                            0 => Ok(None),
                            ERRNO_ESRCH | ERRNO_ENETUNREACH | ERRNO_EHOSTUNREACH => Ok(None),
                            _ => Err(RoutesyncError::Kernel {
                                op: "route get",
                                errno,
                            }),
                        };
                    }
                    NetlinkPayload::InnerMessage(RouteNetlinkMessage::NewRoute(rm)) => {
                        return Ok(parse_kernel_route(&rm));
                    }
                    _ => {}
                }
            }
            Ok(None)
        }
    }

    /// Netlink messages are 4-byte aligned within a receive buffer.
    fn align(offset: usize) -> usize {
        (offset + 3) & !3
    }

    /// Table id of a route message, honoring the extended table attribute.
    fn route_table(msg: &RouteMessage) -> u32 {
        for attr in &msg.attributes {
            if let RouteAttribute::Table(table) = attr {
                return *table;
            }
        }
        u32::from(msg.header.table)
    }

    fn route_address_to_ip(addr: &RouteAddress) -> Option<IpAddr> {
        match addr {
            RouteAddress::Inet(a) => Some(IpAddr::V4(*a)),
            RouteAddress::Inet6(a) => Some(IpAddr::V6(*a)),
            _ => None,
        }
    }

    /// Converts a kernel route message into the engine's observation type.
    fn parse_kernel_route(msg: &RouteMessage) -> Option<KernelRoute> {
        let mut destination = None;
        let mut gateway = None;
        let mut oif = None;

        for attr in &msg.attributes {
            match attr {
                RouteAttribute::Destination(addr) => destination = route_address_to_ip(addr),
                RouteAttribute::Gateway(addr) => gateway = route_address_to_ip(addr),
                RouteAttribute::Oif(index) => oif = Some(*index),
                _ => {}
            }
        }

        let prefix = msg.header.destination_prefix_length;
        let destination = match (destination, msg.header.address_family) {
            (Some(IpAddr::V4(a)), _) => IpNet::V4(Ipv4Net::new(a, prefix).ok()?),
            (Some(IpAddr::V6(a)), _) => IpNet::V6(Ipv6Net::new(a, prefix).ok()?),
            // Missing destination attribute means the default route.
            (None, AddressFamily::Inet) => {
                IpNet::V4(Ipv4Net::new(std::net::Ipv4Addr::UNSPECIFIED, 0).ok()?)
            }
            (None, AddressFamily::Inet6) => {
                IpNet::V6(Ipv6Net::new(std::net::Ipv6Addr::UNSPECIFIED, 0).ok()?)
            }
            _ => return None,
        };

        Some(KernelRoute {
            destination,
            gateway,
            oif,
            table: route_table(msg),
            protocol_static: msg.header.protocol == RouteProtocol::Static,
        })
    }

}

#[cfg(target_os = "linux")]
pub use linux::NetlinkRouteKernel;

/// Stub for non-Linux development hosts; route programming is a no-op.
#[cfg(not(target_os = "linux"))]
mod stub {
    use std::net::IpAddr;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::{KernelRoute, RouteKernel};
    use crate::error::Result;
    use crate::types::{ResolvedRoute, TableId};

    pub struct NetlinkRouteKernel;

    impl NetlinkRouteKernel {
        pub fn new(_timeout: Duration) -> Result<Self> {
            Ok(Self)
        }
    }

    #[async_trait]
    impl RouteKernel for NetlinkRouteKernel {
        async fn replace_route(&mut self, _route: &ResolvedRoute) -> Result<()> {
            Ok(())
        }

        async fn delete_route(&mut self, _route: &ResolvedRoute) -> Result<()> {
            Ok(())
        }

        async fn list_routes(&mut self, _table: TableId) -> Result<Vec<KernelRoute>> {
            Ok(Vec::new())
        }

        async fn query_route(&mut self, _destination: IpAddr) -> Result<Option<KernelRoute>> {
            Ok(None)
        }
    }
}

#[cfg(not(target_os = "linux"))]
pub use stub::NetlinkRouteKernel;

mod mock {
    use std::collections::{HashMap, VecDeque};
    use std::net::IpAddr;
    use std::sync::Arc;

    use async_trait::async_trait;
    use ipnet::IpNet;
    use parking_lot::Mutex;

    use super::{KernelRoute, RouteKernel};
    use crate::error::{Result, RoutesyncError};
    use crate::types::{ResolvedRoute, TableId};

    #[derive(Default)]
    struct MockKernelState {
        /// Entries keyed by (destination, table), like the kernel's own
        /// uniqueness guarantee under replace semantics.
        routes: HashMap<(IpNet, u32), KernelRoute>,
        /// Read-only FIB entries consulted by `query_route`.
        fib: Vec<KernelRoute>,
        /// Scripted failures returned by the next mutations, in order.
        fail_queue: VecDeque<RoutesyncError>,
        /// Every operation applied, for test assertions.
        operations: Vec<String>,
    }

    /// In-memory kernel double. Clones share state, so tests keep one clone
    /// while the engine owns another.
    #[derive(Clone, Default)]
    pub struct MockRouteKernel {
        inner: Arc<Mutex<MockKernelState>>,
    }

    impl MockRouteKernel {
        pub fn new() -> Self {
            Self::default()
        }

        /// Seeds a FIB entry used for next-hop lookups.
        pub fn seed_fib(&self, route: KernelRoute) {
            self.inner.lock().fib.push(route);
        }

        /// Simulates an external actor writing the managed table directly.
        pub fn insert_external(&self, route: KernelRoute) {
            let mut state = self.inner.lock();
            state
                .routes
                .insert((route.destination, route.table), route);
        }

        /// Simulates an external actor removing an entry.
        pub fn remove_external(&self, destination: &IpNet, table: TableId) {
            self.inner
                .lock()
                .routes
                .remove(&(*destination, table.as_u32()));
        }

        /// Queues an error for the next mutating call.
        pub fn fail_next(&self, error: RoutesyncError) {
            self.inner.lock().fail_queue.push_back(error);
        }

        pub fn routes_in(&self, table: TableId) -> Vec<KernelRoute> {
            let state = self.inner.lock();
            let mut routes: Vec<KernelRoute> = state
                .routes
                .values()
                .filter(|r| r.table == table.as_u32())
                .cloned()
                .collect();
            routes.sort_by_key(|r| r.destination.to_string());
            routes
        }

        pub fn contains(&self, destination: &IpNet, table: TableId) -> bool {
            self.inner
                .lock()
                .routes
                .contains_key(&(*destination, table.as_u32()))
        }

        pub fn operations(&self) -> Vec<String> {
            self.inner.lock().operations.clone()
        }
    }

    #[async_trait]
    impl RouteKernel for MockRouteKernel {
        async fn replace_route(&mut self, route: &ResolvedRoute) -> Result<()> {
            let mut state = self.inner.lock();
            if let Some(err) = state.fail_queue.pop_front() {
                state.operations.push(format!("replace failed: {route}"));
                return Err(err);
            }
            state.operations.push(format!("replace {route}"));
            state.routes.insert(
                (route.destination, route.table.as_u32()),
                KernelRoute {
                    destination: route.destination,
                    gateway: route.gateway,
                    oif: route.oif,
                    table: route.table.as_u32(),
                    protocol_static: true,
                },
            );
            Ok(())
        }

        async fn delete_route(&mut self, route: &ResolvedRoute) -> Result<()> {
            let mut state = self.inner.lock();
            if let Some(err) = state.fail_queue.pop_front() {
                state.operations.push(format!("delete failed: {route}"));
                return Err(err);
            }
            state.operations.push(format!("delete {route}"));
            state
                .routes
                .remove(&(route.destination, route.table.as_u32()));
            Ok(())
        }

        async fn list_routes(&mut self, table: TableId) -> Result<Vec<KernelRoute>> {
            Ok(self.routes_in(table))
        }

        async fn query_route(&mut self, destination: IpAddr) -> Result<Option<KernelRoute>> {
            let state = self.inner.lock();
            let best = state
                .fib
                .iter()
                .filter(|r| r.destination.contains(&destination))
                .max_by_key(|r| r.destination.prefix_len())
                .cloned();
            Ok(best)
        }
    }
}

pub use mock::MockRouteKernel;
