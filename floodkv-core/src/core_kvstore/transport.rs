/*
    transport.rs - peer transport seam

    The store never talks to a socket directly; it goes through this
    trait. Authorization and connection management are the transport's
    problem. The in-memory implementation wires nodes of one process
    together through per-endpoint queues and still round-trips every
    request through the wire encoding, so tests exercise the same
    serialization path a network transport would.
*/

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

use super::errors::{KvStoreError, KvStoreResult};
use super::message::{KvStoreReply, KvStoreRequest};
use super::publication::PeerSpec;

/// How long the in-memory transport waits for the remote store to answer
const MEMORY_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// A request delivered to a node, with the channel to answer on
#[derive(Debug)]
pub struct InboundRequest {
    pub request: KvStoreRequest,
    pub reply_tx: oneshot::Sender<KvStoreReply>,
}

/// Request/reply channel to remote stores
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Send one request to the peer at `spec` and wait for its reply
    async fn request(&self, spec: &PeerSpec, request: KvStoreRequest)
        -> KvStoreResult<KvStoreReply>;
}

/// In-process transport: a registry of endpoints keyed by cmd URL
#[derive(Clone, Default)]
pub struct MemoryTransport {
    endpoints: Arc<RwLock<HashMap<String, mpsc::Sender<InboundRequest>>>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        MemoryTransport::default()
    }

    /// Register an endpoint; the returned receiver yields inbound requests
    pub fn register(&self, cmd_url: impl Into<String>, capacity: usize) -> mpsc::Receiver<InboundRequest> {
        let (tx, rx) = mpsc::channel(capacity);
        self.endpoints
            .write()
            .expect("transport registry lock poisoned")
            .insert(cmd_url.into(), tx);
        rx
    }

    /// Remove an endpoint; in-flight requests to it fail with Transport
    pub fn unregister(&self, cmd_url: &str) {
        self.endpoints
            .write()
            .expect("transport registry lock poisoned")
            .remove(cmd_url);
    }

    fn endpoint(&self, cmd_url: &str) -> Option<mpsc::Sender<InboundRequest>> {
        self.endpoints
            .read()
            .expect("transport registry lock poisoned")
            .get(cmd_url)
            .cloned()
    }
}

#[async_trait]
impl PeerTransport for MemoryTransport {
    async fn request(
        &self,
        spec: &PeerSpec,
        request: KvStoreRequest,
    ) -> KvStoreResult<KvStoreReply> {
        let endpoint = self
            .endpoint(&spec.cmd_url)
            .ok_or_else(|| KvStoreError::Transport(format!("no endpoint at {}", spec.cmd_url)))?;

        // Round-trip the wire encoding even in-process
        let bytes = request.to_bytes()?;
        let decoded = KvStoreRequest::from_bytes(&bytes)?;

        let (reply_tx, reply_rx) = oneshot::channel();
        endpoint
            .send(InboundRequest { request: decoded, reply_tx })
            .await
            .map_err(|_| KvStoreError::Transport(format!("endpoint {} closed", spec.cmd_url)))?;

        match tokio::time::timeout(MEMORY_REQUEST_TIMEOUT, reply_rx).await {
            Err(_) => Err(KvStoreError::Transport(format!(
                "request to {} timed out",
                spec.cmd_url
            ))),
            Ok(Err(_)) => Err(KvStoreError::Transport(format!(
                "endpoint {} dropped the request",
                spec.cmd_url
            ))),
            Ok(Ok(reply)) => {
                let bytes = bincode::serialize(&reply)?;
                Ok(bincode::deserialize(&bytes)?)
            }
        }
    }
}
