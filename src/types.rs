use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Transaction identifier handed out by the executor. Identifiers grow with
/// transaction start order, so a larger id is a younger transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TxnId(pub u64);

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn-{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceIdentity {
    pub service_id: String,
    pub service_address: String,
}

impl ServiceIdentity {
    pub fn new(service_id: impl Into<String>, service_address: impl Into<String>) -> Self {
        Self {
            service_id: service_id.into(),
            service_address: service_address.into(),
        }
    }
}

/// A key-range partition of one logical table: the unit of binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LockTableShard {
    pub group: u32,
    pub table_id: u64,
}

impl LockTableShard {
    pub fn new(group: u32, table_id: u64) -> Self {
        Self { group, table_id }
    }
}

impl fmt::Display for LockTableShard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.group, self.table_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockMode {
    Exclusive,
    Shared,
}

impl LockMode {
    pub fn conflicts_with(self, other: LockMode) -> bool {
        self == LockMode::Exclusive || other == LockMode::Exclusive
    }
}

/// Inclusive key range `[start, end]`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct KeyRange {
    pub start: Bytes,
    pub end: Bytes,
}

impl KeyRange {
    pub fn new(start: impl Into<Bytes>, end: impl Into<Bytes>) -> Self {
        let start = start.into();
        let end = end.into();
        if start <= end {
            Self { start, end }
        } else {
            Self {
                start: end,
                end: start,
            }
        }
    }

    pub fn point(key: impl Into<Bytes>) -> Self {
        let key = key.into();
        Self {
            start: key.clone(),
            end: key,
        }
    }

    pub fn overlaps(&self, other: &KeyRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        &self.start[..] <= key && key <= &self.end[..]
    }

    pub fn intersection(&self, other: &KeyRange) -> Option<KeyRange> {
        if !self.overlaps(other) {
            return None;
        }
        Some(KeyRange {
            start: self.start.clone().max(other.start.clone()),
            end: self.end.clone().min(other.end.clone()),
        })
    }
}

impl fmt::Display for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?}, {:?}]", self.start, self.end)
    }
}

/// Assignment of a shard to the node that owns its lock table. Only the
/// registry advances `version`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Binding {
    pub shard: LockTableShard,
    pub owner: ServiceIdentity,
    pub version: u64,
    /// Lease expiry in milliseconds since the unix epoch.
    pub lease_expiry_ms: u64,
}

impl Binding {
    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.lease_expiry_ms
    }

    pub fn is_owned_by(&self, service_id: &str) -> bool {
        self.owner.service_id == service_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ranges_overlap_inclusively() {
        let a = KeyRange::new("a", "c");
        assert!(a.overlaps(&KeyRange::point("c")));
        assert!(!a.overlaps(&KeyRange::new("d", "f")));
        assert_eq!(
            a.intersection(&KeyRange::new("b", "z")),
            Some(KeyRange::new("b", "c"))
        );
    }

    #[test]
    fn reversed_bounds_are_normalized() {
        let r = KeyRange::new("z", "a");
        assert_eq!(r.start, Bytes::from("a"));
        assert!(r.contains(b"m"));
    }

    #[test]
    fn shared_modes_are_compatible() {
        assert!(!LockMode::Shared.conflicts_with(LockMode::Shared));
        assert!(LockMode::Shared.conflicts_with(LockMode::Exclusive));
        assert!(LockMode::Exclusive.conflicts_with(LockMode::Exclusive));
    }
}
