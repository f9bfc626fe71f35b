//! Core types for route synchronization

use std::fmt;
use std::net::IpAddr;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::error::{Result, RoutesyncError};

/// Identifier of the kernel routing table the engine manages.
///
/// Valid ids are 0..=254; 254 is the kernel's main table and the default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableId(u8);

impl TableId {
    /// The kernel main routing table (RT_TABLE_MAIN).
    pub const MAIN: Self = Self(254);

    /// Validates and wraps a raw table id.
    pub fn new(raw: i64) -> Result<Self> {
        if !(0..=254).contains(&raw) {
            return Err(RoutesyncError::Config(format!(
                "target table must be between 0 and 254, got {raw}"
            )));
        }
        Ok(Self(raw as u8))
    }

    pub fn as_u8(self) -> u8 {
        self.0
    }

    pub fn as_u32(self) -> u32 {
        u32::from(self.0)
    }
}

impl Default for TableId {
    fn default() -> Self {
        Self::MAIN
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A declarative static-route request, scoped to one node.
///
/// Delivered by the external watch mechanism; read-only input to the
/// reconciler for the duration of one reconciliation pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteIntent {
    /// Stable name of the intent resource.
    pub name: String,
    /// Destination network.
    pub destination: IpNet,
    /// Explicit next-hop gateway. When absent the engine resolves the
    /// gateway from the kernel's current routing state.
    #[serde(default)]
    pub gateway: Option<IpAddr>,
    /// Hostname of the node this intent targets.
    pub node: String,
}

/// A concrete route derived from an intent, ready for the kernel.
///
/// Recomputed whenever the intent or kernel state changes; never persisted
/// independently of its intent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedRoute {
    pub destination: IpNet,
    /// `None` means the engine resolves the gateway before installing.
    pub gateway: Option<IpAddr>,
    pub table: TableId,
    /// Output interface index, when known.
    pub oif: Option<u32>,
}

impl ResolvedRoute {
    /// Builds the candidate route for an intent against a managed table.
    pub fn from_intent(intent: &RouteIntent, table: TableId) -> Self {
        Self {
            destination: intent.destination,
            gateway: intent.gateway,
            table,
            oif: None,
        }
    }
}

impl fmt::Display for ResolvedRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.gateway {
            Some(gw) => write!(f, "{} via {} table {}", self.destination, gw, self.table),
            None => write!(f, "{} table {}", self.destination, self.table),
        }
    }
}

/// Unit of work flowing through the engine's serialized queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteCommand {
    Add(ResolvedRoute),
    Delete(ResolvedRoute),
}

impl RouteCommand {
    pub fn route(&self) -> &ResolvedRoute {
        match self {
            RouteCommand::Add(r) | RouteCommand::Delete(r) => r,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            RouteCommand::Add(_) => "add",
            RouteCommand::Delete(_) => "delete",
        }
    }
}
