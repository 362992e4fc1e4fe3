use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Identifier of a named store, assigned from a backend-resident counter at
/// creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StoreId(u64);

impl StoreId {
    #[must_use]
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    #[must_use]
    pub fn value(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for StoreId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for StoreId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<u64>().map(Self)
    }
}

/// Identifier of a named distributed lock.
///
/// Derived deterministically from the lock name, so every process computes
/// the same id without a registration round-trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockId(u64);

impl LockId {
    #[must_use]
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    #[must_use]
    pub fn value(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for LockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Derive the [`LockId`] for a lock name: the first eight bytes of
/// SHA-256(name), big-endian. Zero is remapped so ids are always non-zero
/// (zero means "unowned" in inspection APIs).
#[must_use]
pub fn lock_id_for_name(name: &str) -> LockId {
    let digest = Sha256::digest(name.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    let id = u64::from_be_bytes(bytes);
    LockId(if id == 0 { 1 } else { id })
}

/// Metadata recorded when a store is created.
///
/// The key/value type hints are opaque to the engine; they exist so callers
/// sharing a store by name can validate that they agree on its domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreMeta {
    pub name: String,
    pub key_type: String,
    pub value_type: String,
}

/// The persisted record of a held distributed lock.
///
/// Serialized to JSON and stored under the lock's meta key. `expires_at` is
/// epoch seconds; `None` means an infinite lease that only an explicit
/// release clears.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    /// OS process id of the owner.
    pub pid: u32,
    /// Per-acquisition fencing token; release and extension compare it.
    pub token: String,
    /// The lock's human-readable name, kept for inspection.
    pub name: String,
    /// Lease deadline in epoch seconds, if any.
    pub expires_at: Option<i64>,
}

impl LockRecord {
    /// Whether this record's lease has elapsed at `now` (epoch seconds).
    /// Infinite leases never expire.
    #[must_use]
    pub fn is_expired_at(&self, now: i64) -> bool {
        self.expires_at.is_some_and(|deadline| now > deadline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_id_is_deterministic() {
        let a = lock_id_for_name("my-lock");
        let b = lock_id_for_name("my-lock");
        assert_eq!(a, b);
        assert_ne!(a, lock_id_for_name("other-lock"));
        assert_ne!(a.value(), 0);
    }

    #[test]
    fn store_id_round_trips_through_string() {
        let id = StoreId::new(42);
        let parsed: StoreId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn infinite_lease_never_expires() {
        let record = LockRecord {
            pid: 100,
            token: "t".into(),
            name: "L".into(),
            expires_at: None,
        };
        assert!(!record.is_expired_at(i64::MAX));
    }

    #[test]
    fn lease_expires_after_deadline() {
        let record = LockRecord {
            pid: 100,
            token: "t".into(),
            name: "L".into(),
            expires_at: Some(1_000),
        };
        assert!(!record.is_expired_at(1_000));
        assert!(record.is_expired_at(1_001));
    }

    #[test]
    fn lock_record_serde_round_trip() {
        let record = LockRecord {
            pid: 7,
            token: "abc".into(),
            name: "L".into(),
            expires_at: Some(99),
        };
        let json = serde_json::to_string(&record).unwrap();
        let back: LockRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }
}
