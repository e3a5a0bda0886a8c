/*
    merge.rs - deterministic reconciliation of incoming key-value maps

    Merge is the heart of eventual consistency: every replica applies
    the same preference order, so any interleaving of deliveries
    converges to the same map. The function never fails; records that
    cannot be accepted (filtered, dead TTL, stale, hash-only for an
    unknown key) are dropped and accounted in the returned stats.

    Inputs:
    - the live key->value map of one area
    - a received or locally originated update map
    - the optional area import filters

    Outputs:
    - mutations applied to the live map
    - the delta map of accepted records, ready to flood and publish
    - per-reason drop counts
*/

use std::collections::HashMap;

use tracing::trace;

use super::filters::KvFilters;
use super::value::Value;

/// Per-reason accounting of a merge pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    /// Records rejected by the import filters
    pub filtered: u64,
    /// Records with a zero or negative finite TTL
    pub invalid_ttl: u64,
    /// Hash-only records for keys we have never seen
    pub no_value: u64,
    /// Records losing to (or tied with) the local copy
    pub stale: u64,
    /// Records accepted in full
    pub updated: u64,
    /// Records accepted as TTL-only refreshes
    pub ttl_refreshed: u64,
}

impl MergeStats {
    /// Total records dropped for any reason
    pub fn dropped(&self) -> u64 {
        self.filtered + self.invalid_ttl + self.no_value + self.stale
    }
}

/// Merge `updates` into `store` under the deterministic preference order.
///
/// Returns the changed map: for each accepted key, the record as it now
/// stands in the store (full records for overwrites, the refreshing
/// record for TTL-only updates). Applying the same input twice yields
/// an empty changed map.
pub fn merge_key_values(
    store: &mut HashMap<String, Value>,
    updates: HashMap<String, Value>,
    filters: Option<&KvFilters>,
) -> (HashMap<String, Value>, MergeStats) {
    let mut changed = HashMap::new();
    let mut stats = MergeStats::default();

    for (key, mut incoming) in updates {
        if let Some(filters) = filters {
            if !filters.key_match_any(&key, &incoming) {
                stats.filtered += 1;
                continue;
            }
        }

        if !incoming.has_valid_ttl() {
            stats.invalid_ttl += 1;
            continue;
        }

        incoming.ensure_hash();

        let mut update_all = false;
        let mut update_ttl = false;

        match store.get(&key) {
            None => {
                // First sighting: a hash alone is not enough to adopt the key
                if !incoming.has_value() {
                    stats.no_value += 1;
                    continue;
                }
                update_all = true;
            }
            Some(current) => {
                if incoming.version > current.version {
                    update_all = true;
                } else if incoming.version == current.version {
                    if incoming.originator_id > current.originator_id {
                        update_all = true;
                    } else if incoming.originator_id == current.originator_id {
                        // Same writer, same version: the byte payload is the
                        // deterministic tie-break, then the ttl-version.
                        if let (Some(new_bytes), Some(cur_bytes)) =
                            (incoming.value.as_deref(), current.value.as_deref())
                        {
                            if new_bytes > cur_bytes {
                                update_all = true;
                            }
                        }
                        if !update_all && incoming.ttl_version > current.ttl_version {
                            update_ttl = true;
                        }
                    }
                }
            }
        }

        if update_all {
            // Overwrites need the payload; a better hash-only record is
            // dropped here and fetched in full during the next sync.
            if !incoming.has_value() {
                stats.no_value += 1;
                continue;
            }
            trace!(key = %key, version = incoming.version, originator = %incoming.originator_id,
                   "merge accepted full update");
            store.insert(key.clone(), incoming.clone());
            changed.insert(key, incoming);
            stats.updated += 1;
        } else if update_ttl {
            let current = store.get_mut(&key).expect("ttl refresh requires a live record");
            current.ttl_ms = incoming.ttl_ms;
            current.ttl_version = incoming.ttl_version;
            trace!(key = %key, ttl_version = incoming.ttl_version, "merge accepted ttl refresh");
            changed.insert(key, incoming);
            stats.ttl_refreshed += 1;
        } else {
            stats.stale += 1;
        }
    }

    (changed, stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_kvstore::value::TTL_INFINITY;
    use std::collections::BTreeSet;

    fn val(version: i64, originator: &str, bytes: &[u8], ttl_version: i64) -> Value {
        Value::new(version, originator, Some(bytes.to_vec()), 10_000, ttl_version)
    }

    fn map(entries: Vec<(&str, Value)>) -> HashMap<String, Value> {
        entries.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
    }

    #[test]
    fn test_new_key_accepted() {
        let mut store = HashMap::new();
        let (changed, stats) =
            merge_key_values(&mut store, map(vec![("k", val(1, "a", b"x", 0))]), None);
        assert_eq!(changed.len(), 1);
        assert_eq!(stats.updated, 1);
        assert_eq!(store.get("k").unwrap().value.as_deref(), Some(b"x".as_slice()));
    }

    #[test]
    fn test_hash_only_new_key_dropped() {
        let mut store = HashMap::new();
        let hash_only = val(1, "a", b"x", 0).as_hash_only();
        let (changed, stats) = merge_key_values(&mut store, map(vec![("k", hash_only)]), None);
        assert!(changed.is_empty());
        assert_eq!(stats.no_value, 1);
        assert!(store.is_empty());
    }

    #[test]
    fn test_higher_version_overwrites() {
        let mut store = map(vec![("k", val(1, "a", b"old", 0))]);
        let (changed, _) = merge_key_values(&mut store, map(vec![("k", val(2, "a", b"new", 0))]), None);
        assert_eq!(changed.len(), 1);
        assert_eq!(store.get("k").unwrap().version, 2);
    }

    #[test]
    fn test_lower_version_dropped() {
        let mut store = map(vec![("k", val(3, "a", b"keep", 0))]);
        let (changed, stats) =
            merge_key_values(&mut store, map(vec![("k", val(2, "a", b"lose", 0))]), None);
        assert!(changed.is_empty());
        assert_eq!(stats.stale, 1);
        assert_eq!(store.get("k").unwrap().value.as_deref(), Some(b"keep".as_slice()));
    }

    #[test]
    fn test_originator_tie_break() {
        // Two writers collide on version 1: the greater originator wins
        let mut store = map(vec![("x", val(1, "a", b"from-a", 0))]);
        let (changed, _) = merge_key_values(&mut store, map(vec![("x", val(1, "b", b"from-b", 0))]), None);
        assert_eq!(changed.len(), 1);
        assert_eq!(store.get("x").unwrap().originator_id, "b");

        // A later version from the lesser originator still wins
        let (changed, _) = merge_key_values(&mut store, map(vec![("x", val(2, "a", b"v2", 0))]), None);
        assert_eq!(changed.len(), 1);
        assert_eq!(store.get("x").unwrap().originator_id, "a");
    }

    #[test]
    fn test_ttl_refresh_keeps_payload() {
        let mut store = map(vec![("y", val(5, "a", b"body", 0))]);
        let mut refresh = val(5, "a", b"body", 1).as_hash_only();
        refresh.ttl_ms = 10_000;
        let (changed, stats) = merge_key_values(&mut store, map(vec![("y", refresh)]), None);
        assert_eq!(stats.ttl_refreshed, 1);
        assert_eq!(changed.len(), 1);
        let live = store.get("y").unwrap();
        assert_eq!(live.ttl_version, 1);
        assert_eq!(live.ttl_ms, 10_000);
        assert_eq!(live.value.as_deref(), Some(b"body".as_slice()));
    }

    #[test]
    fn test_invalid_ttl_dropped() {
        let mut store = HashMap::new();
        let mut dead = val(1, "a", b"x", 0);
        dead.ttl_ms = 0;
        let (changed, stats) = merge_key_values(&mut store, map(vec![("k", dead)]), None);
        assert!(changed.is_empty());
        assert_eq!(stats.invalid_ttl, 1);

        let mut immortal = val(1, "a", b"x", 0);
        immortal.ttl_ms = TTL_INFINITY;
        let (changed, _) = merge_key_values(&mut store, map(vec![("k", immortal)]), None);
        assert_eq!(changed.len(), 1);
    }

    #[test]
    fn test_filters_reject() {
        let filters = KvFilters::new(vec!["adj:".to_string()], BTreeSet::new());
        let mut store = HashMap::new();
        let updates = map(vec![("adj:n1", val(1, "a", b"x", 0)), ("prefix:n1", val(1, "a", b"y", 0))]);
        let (changed, stats) = merge_key_values(&mut store, updates, Some(&filters));
        assert_eq!(changed.len(), 1);
        assert_eq!(stats.filtered, 1);
        assert!(store.contains_key("adj:n1"));
        assert!(!store.contains_key("prefix:n1"));
    }

    #[test]
    fn test_idempotent() {
        let mut store = HashMap::new();
        let updates = map(vec![("k1", val(1, "a", b"x", 0)), ("k2", val(2, "b", b"y", 3))]);
        let (first, _) = merge_key_values(&mut store, updates.clone(), None);
        assert_eq!(first.len(), 2);
        let (second, stats) = merge_key_values(&mut store, updates, None);
        assert!(second.is_empty());
        assert_eq!(stats.stale, 2);
    }

    #[test]
    fn test_associative_and_commutative() {
        let a = map(vec![("k", val(1, "a", b"1", 0)), ("only-a", val(1, "a", b"a", 0))]);
        let b = map(vec![("k", val(2, "b", b"2", 0)), ("only-b", val(1, "b", b"b", 0))]);
        let c = map(vec![("k", val(2, "c", b"3", 0))]);

        // (A + B) + C
        let mut left = HashMap::new();
        merge_key_values(&mut left, a.clone(), None);
        merge_key_values(&mut left, b.clone(), None);
        merge_key_values(&mut left, c.clone(), None);

        // A + (C + B), different grouping and order
        let mut inner = HashMap::new();
        merge_key_values(&mut inner, c, None);
        merge_key_values(&mut inner, b, None);
        let mut right = HashMap::new();
        merge_key_values(&mut right, a, None);
        merge_key_values(&mut right, inner, None);

        assert_eq!(left, right);
        assert_eq!(left.get("k").unwrap().originator_id, "c");
    }
}
