/*
    message.rs - peer-to-peer request/reply envelope

    Every exchange between stores is one request and one reply. The
    request is a tagged variant; dispatch is a match in the receiving
    area's loop. Payloads reuse the Publication parameter shapes and
    are encoded with bincode on the wire.
*/

use serde::{Deserialize, Serialize};

use super::dual::DualMessages;
use super::publication::{
    FloodTopoSetParams, KeyDumpParams, KeyGetParams, KeySetParams, Publication,
};

/// Request envelope sent between stores
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KvStoreRequest {
    /// Target area on the receiving node
    pub area: String,

    /// Sending node, so the receiver can exclude it from re-floods
    pub sender_id: String,

    /// The operation itself
    pub command: KvStoreCommand,
}

/// The operation carried by a request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum KvStoreCommand {
    /// Multi-get of specific keys
    KeyGet(KeyGetParams),

    /// Merge payload: originator writes and steady-state floods
    KeySet(KeySetParams),

    /// Filtered full dump; with `key_val_hashes` set, a three-way sync request
    KeyDump(KeyDumpParams),

    /// Filtered hash-only dump
    HashDump(KeyDumpParams),

    /// Dual protocol payload for the flood spanning trees
    DualMsg(DualMessages),

    /// Child set/unset maintenance for a flood root
    FloodTopoSet(FloodTopoSetParams),
}

impl KvStoreCommand {
    /// Short name for logs and counters
    pub fn name(&self) -> &'static str {
        match self {
            KvStoreCommand::KeyGet(_) => "KEY_GET",
            KvStoreCommand::KeySet(_) => "KEY_SET",
            KvStoreCommand::KeyDump(_) => "KEY_DUMP",
            KvStoreCommand::HashDump(_) => "HASH_DUMP",
            KvStoreCommand::DualMsg(_) => "DUAL_MSG",
            KvStoreCommand::FloodTopoSet(_) => "FLOOD_TOPO_SET",
        }
    }
}

/// Reply envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum KvStoreReply {
    /// Response carrying key/value data
    Publication(Publication),

    /// Success without data
    Ack,

    /// Request failed on the remote store
    Error(String),
}

impl KvStoreRequest {
    pub fn new(area: impl Into<String>, sender_id: impl Into<String>, command: KvStoreCommand) -> Self {
        KvStoreRequest { area: area.into(), sender_id: sender_id.into(), command }
    }

    /// Encode for the wire
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Decode from the wire
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_names() {
        let get = KvStoreCommand::KeyGet(KeyGetParams { keys: vec!["k".to_string()] });
        assert_eq!(get.name(), "KEY_GET");
        let dump = KvStoreCommand::KeyDump(KeyDumpParams::default());
        assert_eq!(dump.name(), "KEY_DUMP");
    }

    #[test]
    fn test_request_round_trip() {
        let request = KvStoreRequest::new(
            "area0",
            "node-a",
            KvStoreCommand::KeyGet(KeyGetParams { keys: vec!["adj:n1".to_string()] }),
        );
        let bytes = request.to_bytes().unwrap();
        let decoded = KvStoreRequest::from_bytes(&bytes).unwrap();
        assert_eq!(request, decoded);
    }

    #[test]
    fn test_reply_round_trip() {
        let reply = KvStoreReply::Error("no such area".to_string());
        let bytes = bincode::serialize(&reply).unwrap();
        let decoded: KvStoreReply = bincode::deserialize(&bytes).unwrap();
        assert_eq!(reply, decoded);
    }
}
