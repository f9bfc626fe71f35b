//! Protected subnet guard
//!
//! Administrators can declare networks that must never become a managed
//! route destination. The guard is a pure predicate over that immutable
//! set; malformed CIDRs are rejected at configuration load, never here.

use ipnet::IpNet;

/// Immutable, ordered set of administrator-protected networks.
#[derive(Debug, Clone, Default)]
pub struct ProtectedSubnets {
    subnets: Vec<IpNet>,
}

impl ProtectedSubnets {
    pub fn new(subnets: Vec<IpNet>) -> Self {
        Self { subnets }
    }

    pub fn is_empty(&self) -> bool {
        self.subnets.is_empty()
    }

    pub fn len(&self) -> usize {
        self.subnets.len()
    }

    /// Returns true if the candidate destination overlaps any protected
    /// subnet.
    pub fn is_protected(&self, candidate: &IpNet) -> bool {
        self.find_overlap(candidate).is_some()
    }

    /// Returns the first protected subnet the candidate overlaps, if any.
    ///
    /// The overlap test is bidirectional: a candidate containing a protected
    /// subnet redirects protected traffic just as surely as one contained by
    /// it. For aligned CIDR blocks the two containment checks cover every
    /// overlap case.
    pub fn find_overlap(&self, candidate: &IpNet) -> Option<&IpNet> {
        self.subnets
            .iter()
            .find(|p| p.contains(candidate) || candidate.contains(*p))
    }
}
