//! Gateway resolution
//!
//! When an intent carries no explicit gateway, the next hop is discovered
//! from the kernel's current routing state: the route the kernel would use
//! to reach the destination supplies the gateway, or the output interface
//! for directly connected destinations.

use std::net::IpAddr;

use tracing::debug;

use crate::error::{Result, RoutesyncError};
use crate::netlink::RouteKernel;

/// Next hop discovered for a destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NextHop {
    /// Gateway address; `None` when the destination is on-link.
    pub gateway: Option<IpAddr>,
    /// Output interface index, when the kernel reported one.
    pub oif: Option<u32>,
}

/// Looks up the path the kernel would currently take to `destination`.
///
/// Fails with [`RoutesyncError::UnreachableDestination`] when no route
/// exists. The underlying kernel query is bounded by the socket timeout;
/// a timeout surfaces as a transient error, not as unreachable.
pub async fn resolve<K>(kernel: &mut K, destination: IpAddr) -> Result<NextHop>
where
    K: RouteKernel + ?Sized,
{
    let route = kernel
        .query_route(destination)
        .await?
        .ok_or(RoutesyncError::UnreachableDestination(destination))?;

    // A matching route with neither gateway nor interface gives the engine
    // nothing to program with.
    if route.gateway.is_none() && route.oif.is_none() {
        return Err(RoutesyncError::UnreachableDestination(destination));
    }

    debug!(
        destination = %destination,
        gateway = ?route.gateway,
        oif = ?route.oif,
        "resolved next hop"
    );

    Ok(NextHop {
        gateway: route.gateway,
        oif: route.oif,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netlink::{KernelRoute, MockRouteKernel};

    fn fib_route(dest: &str, gateway: Option<&str>, oif: Option<u32>) -> KernelRoute {
        KernelRoute {
            destination: dest.parse().unwrap(),
            gateway: gateway.map(|g| g.parse().unwrap()),
            oif,
            table: 254,
            protocol_static: false,
        }
    }

    #[tokio::test]
    async fn test_resolves_via_best_match() {
        let kernel = MockRouteKernel::new();
        kernel.seed_fib(fib_route("0.0.0.0/0", Some("192.168.0.1"), Some(2)));
        kernel.seed_fib(fib_route("192.168.0.0/16", Some("192.168.0.254"), Some(3)));

        let mut k = kernel.clone();
        let hop = resolve(&mut k, "192.168.7.1".parse().unwrap()).await.unwrap();
        assert_eq!(hop.gateway, Some("192.168.0.254".parse().unwrap()));
        assert_eq!(hop.oif, Some(3));

        let hop = resolve(&mut k, "8.8.8.8".parse().unwrap()).await.unwrap();
        assert_eq!(hop.gateway, Some("192.168.0.1".parse().unwrap()));
    }

    #[tokio::test]
    async fn test_on_link_destination_has_no_gateway() {
        let kernel = MockRouteKernel::new();
        kernel.seed_fib(fib_route("10.5.0.0/24", None, Some(4)));

        let mut k = kernel.clone();
        let hop = resolve(&mut k, "10.5.0.9".parse().unwrap()).await.unwrap();
        assert_eq!(hop.gateway, None);
        assert_eq!(hop.oif, Some(4));
    }

    #[tokio::test]
    async fn test_unreachable_destination() {
        let mut kernel = MockRouteKernel::new();
        let err = resolve(&mut kernel, "203.0.113.9".parse().unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, RoutesyncError::UnreachableDestination(_)));
        assert!(err.is_permanent_rejection());
    }
}
