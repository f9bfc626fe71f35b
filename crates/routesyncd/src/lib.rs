//! Static route synchronization daemon
//!
//! routesyncd keeps one kernel IP routing table consistent with
//! declarative static-route intents scoped to this node. Intents arrive
//! from an external watch boundary; the daemon owns the managed table,
//! serializes every mutation through a single engine loop, heals drift on
//! a periodic tick, and refuses destinations that overlap
//! administrator-protected subnets.
//!
//! ```text
//! watch boundary ──▶ Reconciler ──▶ RouteSyncEngine ──▶ RouteKernel (rtnetlink)
//!                        │                 │
//!                  StatusReporter    reconcile tick
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod guard;
pub mod netlink;
pub mod reconciler;
pub mod resolver;
pub mod types;

pub use config::Config;
pub use engine::{CommandTicket, EngineHandle, EngineState, RouteSyncEngine};
pub use error::{Result, RoutesyncError};
pub use guard::ProtectedSubnets;
pub use netlink::{KernelRoute, MockRouteKernel, NetlinkRouteKernel, RouteKernel};
pub use reconciler::{
    IntentEvent, LogStatusReporter, ReconcileOutcome, Reconciler, StatusReporter,
};
pub use types::{ResolvedRoute, RouteCommand, RouteIntent, TableId};
