//! Error types for routesyncd

use std::net::IpAddr;
use std::time::Duration;

use ipnet::IpNet;
use thiserror::Error;

/// Errors that can occur while synchronizing routes.
#[derive(Debug, Error)]
pub enum RoutesyncError {
    /// Invalid or missing process configuration. Fatal at startup.
    #[error("configuration error: {0}")]
    Config(String),

    /// The requested destination overlaps an administrator-protected subnet.
    /// Permanent; never retried.
    #[error("destination {destination} overlaps protected subnet {subnet}")]
    ProtectedSubnet { destination: IpNet, subnet: IpNet },

    /// Gateway resolution found no kernel route toward the destination.
    #[error("destination {0} is unreachable: no matching kernel route")]
    UnreachableDestination(IpAddr),

    /// A kernel route operation was rejected with an errno.
    #[error("kernel {op} failed: errno {errno}")]
    Kernel { op: &'static str, errno: i32 },

    /// A bounded kernel query or mutation exceeded its timeout.
    #[error("kernel operation timed out after {0:?}")]
    KernelTimeout(Duration),

    /// Netlink message construction or parsing failed.
    #[error("netlink error: {0}")]
    Netlink(String),

    /// Submit was called on an engine that has already stopped.
    #[error("engine stopped")]
    EngineStopped,

    /// The command was still queued when the engine stopped.
    #[error("command cancelled: engine shut down before it was applied")]
    Cancelled,

    /// IO error from the kernel socket.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl RoutesyncError {
    /// Returns true if retrying the same operation may succeed.
    ///
    /// Transient errors are retried with bounded backoff inside the engine;
    /// everything else surfaces immediately.
    pub fn is_transient(&self) -> bool {
        match self {
            RoutesyncError::KernelTimeout(_) => true,
            RoutesyncError::Kernel { errno, .. } => matches!(
                *errno,
                ERRNO_EAGAIN | ERRNO_EBUSY | ERRNO_ENOBUFS | ERRNO_ENOMEM | ERRNO_ETIMEDOUT
            ),
            RoutesyncError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::Interrupted
            ),
            _ => false,
        }
    }

    /// Returns true for failures that can never succeed for this intent,
    /// no matter how often it is re-delivered unchanged.
    pub fn is_permanent_rejection(&self) -> bool {
        matches!(
            self,
            RoutesyncError::ProtectedSubnet { .. } | RoutesyncError::UnreachableDestination(_)
        )
    }
}

// Errno values used for transient classification, kept literal so the
// non-Linux build of the library classifies identically.
const ERRNO_EAGAIN: i32 = 11;
const ERRNO_EBUSY: i32 = 16;
const ERRNO_ENOBUFS: i32 = 105;
const ERRNO_ENOMEM: i32 = 12;
const ERRNO_ETIMEDOUT: i32 = 110;

/// Result type alias for routesyncd operations.
pub type Result<T> = std::result::Result<T, RoutesyncError>;
