//! Shared identifiers used across the heartbeat and replication subsystems.
//!
//! These are small newtypes rather than raw `u64`/`String`, following the
//! strong-typing convention used throughout the replication layer: a
//! [`NodeId`] and a [`Lsa`] are never accidentally interchangeable with a
//! plain integer.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Unique identifier for a cluster node, as listed in the heartbeat node
/// table (base spec §3 "Node").
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A page identifier on the active log volume or an archive. Monotonically
/// increasing; never negative because the header page occupies physical
/// slot 0, not a pageid.
pub type PageId = u64;

/// Log sequence address: `(pageid, offset)` identifying a record on the
/// replica's persisted log (base spec §3 "Log record").
///
/// Ordered lexicographically by `(pageid, offset)`, matching the way the
/// analyzer compares `source_lsa` against `committed_lsa`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Lsa {
    pub pageid: PageId,
    pub offset: u32,
}

impl Lsa {
    pub const NULL: Lsa = Lsa { pageid: u64::MAX, offset: u32::MAX };

    pub fn new(pageid: PageId, offset: u32) -> Self {
        Self { pageid, offset }
    }

    pub fn is_null(&self) -> bool {
        *self == Self::NULL
    }
}

impl Default for Lsa {
    fn default() -> Self {
        Self::NULL
    }
}

impl PartialOrd for Lsa {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Lsa {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.pageid, self.offset).cmp(&(other.pageid, other.offset))
    }
}

impl fmt::Display for Lsa {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "NULL_LSA")
        } else {
            write!(f, "{}|{}", self.pageid, self.offset)
        }
    }
}

/// Transaction identifier as assigned by the master database; replayed
/// verbatim into the transaction table (base spec §3 "Transaction entry").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub struct Trid(pub i64);

impl fmt::Display for Trid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lsa_ordering_is_lexicographic() {
        let a = Lsa::new(10, 5);
        let b = Lsa::new(10, 6);
        let c = Lsa::new(11, 0);
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn null_lsa_is_default_and_reports_null() {
        assert!(Lsa::default().is_null());
        assert!(Lsa::NULL.is_null());
        assert!(!Lsa::new(1, 0).is_null());
    }
}
