pub mod backoff;
pub mod dual;
pub mod errors;
pub mod events;
pub mod filters;
pub mod merge;
pub mod message;
pub mod peer;
pub mod publication;
pub mod rate_limiter;
pub mod store_db;
pub mod supervisor;
pub mod transport;
pub mod ttl_queue;
pub mod value;

#[cfg(test)]
pub mod tests;

pub use backoff::ExponentialBackoff;
pub use dual::{DualAction, DualMessage, DualMessageBody, DualMessages, DualState, DISTANCE_INFINITY};
pub use errors::{KvStoreError, KvStoreResult};
pub use events::{KvStoreSyncEvent, PeerEvent};
pub use filters::{FilterOperator, KvFilters};
pub use merge::{merge_key_values, MergeStats};
pub use message::{KvStoreCommand, KvStoreReply, KvStoreRequest};
pub use peer::{KvStorePeer, PeerState, PeerSyncEvent};
pub use publication::{
    FloodTopoSetParams, KeyDumpParams, KeyGetParams, KeySetParams, PeerSpec, Publication, SptInfo,
    SptInfos,
};
pub use rate_limiter::{FloodLimiter, FloodRate};
pub use store_db::{StoreDb, StoreDbParams};
pub use supervisor::KvStore;
pub use transport::{InboundRequest, MemoryTransport, PeerTransport};
pub use ttl_queue::{TtlCountdownEntry, TtlCountdownQueue};
pub use value::{compare_values, hash_value, Value, ValueOrdering, TTL_INFINITY};
