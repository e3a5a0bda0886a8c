//! floodkv - replicated key-value store for a link-state routing domain
//!
//! Each area of the routing domain runs an independent, eventually
//! consistent store. Versioned values flood between peers, replicas
//! reconcile through a deterministic total order, per-key TTLs expire
//! records that stop being refreshed, and an optional dual-plane
//! spanning tree bounds flooding fan-out.

pub mod config;
pub mod core_kvstore;
pub mod logging;
pub mod metrics;
pub mod shutdown;
pub mod test_utils;

pub use config::{AreaConfig, Config, ConfigError};
pub use core_kvstore::{KvStore, KvStoreError, KvStoreResult, Publication, Value};
pub use logging::{init_logging, LogLevel};
