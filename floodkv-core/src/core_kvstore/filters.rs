/*
    filters.rs - key prefix and originator filters

    A filter set restricts which (key, value) pairs a store accepts or
    dumps. It carries a list of key prefixes and a set of originator
    node IDs; an empty prefix list matches every key and an empty
    originator set matches every node. The same type serves as the
    per-area import policy and as the filter payload of dump requests.
*/

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use super::value::Value;

/// How the prefix and originator predicates combine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterOperator {
    /// Match if either predicate matches
    Or,
    /// Match only if both predicates match
    And,
}

impl Default for FilterOperator {
    fn default() -> Self {
        FilterOperator::Or
    }
}

/// Key prefix and originator-id filter set
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvFilters {
    key_prefixes: Vec<String>,
    originator_ids: BTreeSet<String>,
}

impl KvFilters {
    /// Create a filter set from key prefixes and originator IDs
    pub fn new(key_prefixes: Vec<String>, originator_ids: BTreeSet<String>) -> Self {
        KvFilters { key_prefixes, originator_ids }
    }

    /// Filter set that matches everything
    pub fn match_all() -> Self {
        KvFilters::default()
    }

    /// Whether the key matches any configured prefix (vacuously true when empty)
    fn prefix_match(&self, key: &str) -> bool {
        self.key_prefixes.is_empty() || self.key_prefixes.iter().any(|p| key.starts_with(p))
    }

    /// Whether the value's originator is in the configured set (vacuously true when empty)
    fn originator_match(&self, value: &Value) -> bool {
        self.originator_ids.is_empty() || self.originator_ids.contains(&value.originator_id)
    }

    /// Match if the key matches a prefix or the originator is listed
    pub fn key_match_any(&self, key: &str, value: &Value) -> bool {
        if self.key_prefixes.is_empty() && self.originator_ids.is_empty() {
            return true;
        }
        (!self.key_prefixes.is_empty() && self.prefix_match(key))
            || (!self.originator_ids.is_empty() && self.originator_match(value))
    }

    /// Match only if the key matches a prefix and the originator is listed
    pub fn key_match_all(&self, key: &str, value: &Value) -> bool {
        self.prefix_match(key) && self.originator_match(value)
    }

    /// Match under the given operator
    pub fn key_match(&self, key: &str, value: &Value, operator: FilterOperator) -> bool {
        match operator {
            FilterOperator::Or => self.key_match_any(key, value),
            FilterOperator::And => self.key_match_all(key, value),
        }
    }

    /// Configured key prefixes
    pub fn key_prefixes(&self) -> &[String] {
        &self.key_prefixes
    }

    /// Configured originator IDs
    pub fn originator_ids(&self) -> &BTreeSet<String> {
        &self.originator_ids
    }
}

impl fmt::Display for KvFilters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "prefixes=[{}] originators=[{}]",
            self.key_prefixes.join(","),
            self.originator_ids.iter().cloned().collect::<Vec<_>>().join(",")
        )
    }
}
