/*
    value.rs - versioned value record and the deterministic preference order

    Responsibilities:
    `value.rs` defines the fundamental datum replicated across an area:
    a byte payload tagged with (version, originator, ttl, ttl-version) and
    a deterministic hash over the immutable part of the record.

    Every replica of a key must settle on the same record regardless of
    delivery order, so two records are compared field by field on the
    tuple (version, originatorId, hash-of-value, ttlVersion). A record
    that carries only a hash cannot be ordered against a record with a
    different hash; that outcome is reported as Unknown and the side
    lacking the bytes is expected to fetch the full record.

    Inputs:
    - originator writes (version bumps, ttl-version refreshes)
    - records received from peers (possibly hash-only)

    Outputs:
    - ordering decisions used by merge and by sync difference dumps
    - deterministic hashes for hash-dump exchanges
*/

use serde::{Deserialize, Serialize};

/// Sentinel for a record that never expires. Such records are never
/// enqueued on the TTL countdown queue.
pub const TTL_INFINITY: i64 = i64::MAX;

/// Remaining TTL below this threshold marks a record "about to expire";
/// outgoing dumps may omit such records.
pub const TTL_THRESHOLD_MS: i64 = 500;

/// A replicated value record for one key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Value {
    /// Monotonically increasing counter chosen by the originator; starts at 1
    pub version: i64,

    /// Stable identifier of the writing node
    pub originator_id: String,

    /// Opaque payload; absent when only the hash is carried (hash dumps)
    pub value: Option<Vec<u8>>,

    /// Lifetime in milliseconds at origination, or [`TTL_INFINITY`]
    pub ttl_ms: i64,

    /// Counter bumped by the originator for TTL-refresh-only updates
    pub ttl_version: i64,

    /// Deterministic hash over (version, originator_id, value)
    pub hash: Option<i64>,
}

/// Outcome of ordering two records of the same key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueOrdering {
    /// First record is strictly preferred
    First,
    /// Second record is strictly preferred
    Second,
    /// Identical on all four tuple fields
    Tied,
    /// Hashes differ but value bytes are missing on at least one side
    Unknown,
}

impl Value {
    /// Create a new record with a computed hash
    pub fn new(
        version: i64,
        originator_id: impl Into<String>,
        value: Option<Vec<u8>>,
        ttl_ms: i64,
        ttl_version: i64,
    ) -> Self {
        let originator_id = originator_id.into();
        let hash = Some(hash_value(version, &originator_id, value.as_deref()));
        Value { version, originator_id, value, ttl_ms, ttl_version, hash }
    }

    /// Return the stored hash, computing it from the bytes if absent
    pub fn hash_or_computed(&self) -> Option<i64> {
        match self.hash {
            Some(h) => Some(h),
            None => self
                .value
                .as_deref()
                .map(|v| hash_value(self.version, &self.originator_id, Some(v))),
        }
    }

    /// Fill in the hash field if it is missing and the bytes are present
    pub fn ensure_hash(&mut self) {
        if self.hash.is_none() {
            self.hash = self.hash_or_computed();
        }
    }

    /// A copy of this record with the payload stripped (hash retained)
    pub fn as_hash_only(&self) -> Value {
        let mut v = self.clone();
        v.ensure_hash();
        v.value = None;
        v
    }

    /// Whether the record carries actual payload bytes
    pub fn has_value(&self) -> bool {
        self.value.is_some()
    }

    /// TTL is valid if infinite or strictly positive
    pub fn has_valid_ttl(&self) -> bool {
        self.ttl_ms == TTL_INFINITY || self.ttl_ms > 0
    }

    /// Whether the record never expires
    pub fn is_immortal(&self) -> bool {
        self.ttl_ms == TTL_INFINITY
    }
}

/// Deterministic hash over the immutable part of a record.
///
/// All nodes must agree on this value for identical records, so the
/// input encoding is fixed: little-endian version, originator bytes,
/// then the payload. Truncated to the first eight hash bytes.
pub fn hash_value(version: i64, originator_id: &str, value: Option<&[u8]>) -> i64 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&version.to_le_bytes());
    hasher.update(originator_id.as_bytes());
    if let Some(bytes) = value {
        hasher.update(bytes);
    }
    let digest = hasher.finalize();
    let mut first = [0u8; 8];
    first.copy_from_slice(&digest.as_bytes()[..8]);
    i64::from_le_bytes(first)
}

/// Order two records of the same key.
///
/// The preference tuple is (version, originatorId, hash-of-value,
/// ttlVersion), compared lexicographically. When the hashes differ the
/// byte payloads break the tie; if either side lacks its payload the
/// comparison is [`ValueOrdering::Unknown`].
pub fn compare_values(v1: &Value, v2: &Value) -> ValueOrdering {
    if v1.version != v2.version {
        return if v1.version > v2.version { ValueOrdering::First } else { ValueOrdering::Second };
    }

    if v1.originator_id != v2.originator_id {
        return if v1.originator_id > v2.originator_id {
            ValueOrdering::First
        } else {
            ValueOrdering::Second
        };
    }

    let h1 = v1.hash_or_computed();
    let h2 = v2.hash_or_computed();
    let hashes_agree = match (h1, h2) {
        (Some(a), Some(b)) => a == b,
        // A record with neither hash nor value cannot be ordered on content
        _ => false,
    };

    if !hashes_agree {
        match (v1.value.as_deref(), v2.value.as_deref()) {
            (Some(b1), Some(b2)) => {
                if b1 != b2 {
                    return if b1 > b2 { ValueOrdering::First } else { ValueOrdering::Second };
                }
            }
            _ => return ValueOrdering::Unknown,
        }
    }

    if v1.ttl_version != v2.ttl_version {
        return if v1.ttl_version > v2.ttl_version {
            ValueOrdering::First
        } else {
            ValueOrdering::Second
        };
    }

    ValueOrdering::Tied
}

#[cfg(test)]
mod tests {
    use super::*;

    fn val(version: i64, originator: &str, bytes: &[u8], ttl_version: i64) -> Value {
        Value::new(version, originator, Some(bytes.to_vec()), 10_000, ttl_version)
    }

    #[test]
    fn test_hash_is_deterministic() {
        let a = hash_value(3, "node-a", Some(b"payload"));
        let b = hash_value(3, "node-a", Some(b"payload"));
        assert_eq!(a, b);
        assert_ne!(a, hash_value(4, "node-a", Some(b"payload")));
        assert_ne!(a, hash_value(3, "node-b", Some(b"payload")));
        assert_ne!(a, hash_value(3, "node-a", Some(b"other")));
    }

    #[test]
    fn test_higher_version_wins() {
        let v1 = val(2, "a", b"x", 0);
        let v2 = val(1, "b", b"y", 5);
        assert_eq!(compare_values(&v1, &v2), ValueOrdering::First);
        assert_eq!(compare_values(&v2, &v1), ValueOrdering::Second);
    }

    #[test]
    fn test_originator_breaks_version_tie() {
        let v1 = val(1, "a", b"x", 0);
        let v2 = val(1, "b", b"x", 0);
        assert_eq!(compare_values(&v1, &v2), ValueOrdering::Second);
        assert_eq!(compare_values(&v2, &v1), ValueOrdering::First);
    }

    #[test]
    fn test_value_bytes_break_originator_tie() {
        let v1 = val(1, "a", b"bb", 0);
        let v2 = val(1, "a", b"aa", 0);
        assert_eq!(compare_values(&v1, &v2), ValueOrdering::First);
    }

    #[test]
    fn test_ttl_version_breaks_full_tie() {
        let v1 = val(5, "a", b"x", 1);
        let v2 = val(5, "a", b"x", 0);
        assert_eq!(compare_values(&v1, &v2), ValueOrdering::First);
        assert_eq!(compare_values(&v2, &v2.clone()), ValueOrdering::Tied);
    }

    #[test]
    fn test_hash_only_mismatch_is_unknown() {
        let v1 = val(1, "a", b"left", 0);
        let v2 = val(1, "a", b"right", 0).as_hash_only();
        assert_eq!(compare_values(&v1, &v2), ValueOrdering::Unknown);
        assert_eq!(compare_values(&v2, &v1), ValueOrdering::Unknown);
    }

    #[test]
    fn test_hash_only_equal_compares_ttl_version() {
        let full = val(1, "a", b"same", 2);
        let hash_only = val(1, "a", b"same", 1).as_hash_only();
        assert_eq!(compare_values(&full, &hash_only), ValueOrdering::First);
    }

    #[test]
    fn test_ttl_validity() {
        assert!(val(1, "a", b"x", 0).has_valid_ttl());
        let mut v = val(1, "a", b"x", 0);
        v.ttl_ms = 0;
        assert!(!v.has_valid_ttl());
        v.ttl_ms = TTL_INFINITY;
        assert!(v.has_valid_ttl());
        assert!(v.is_immortal());
    }

    #[test]
    fn test_as_hash_only_keeps_hash() {
        let v = val(7, "a", b"payload", 0);
        let stripped = v.as_hash_only();
        assert!(stripped.value.is_none());
        assert_eq!(stripped.hash, v.hash);
        assert_eq!(stripped.version, v.version);
    }
}
