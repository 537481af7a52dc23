use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Weak},
};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::RwLock;

use crate::error::{LockError, Result};

use super::codec::{decode, encode, Request, Response};

/// Moves encoded requests to the lock service listening at an address.
#[async_trait]
pub trait LockTransport: Send + Sync {
    async fn send(&self, address: &str, payload: Bytes) -> Result<Bytes>;
}

/// Server side of a transport: turns a request payload into a response payload.
#[async_trait]
pub trait PayloadHandler: Send + Sync {
    async fn handle_payload(&self, payload: Bytes) -> Bytes;
}

/// Encodes `request`, sends it and decodes the answer. An error response is
/// returned as `Err`.
pub async fn call(transport: &dyn LockTransport, address: &str, request: &Request) -> Result<Response> {
    let payload = encode(request)?;
    let reply = transport.send(address, payload).await?;
    decode::<Response>(&reply)?.into_result()
}

/// Transport between services living in one process. Addresses can be cut off
/// to simulate a partition.
#[derive(Default)]
pub struct InProcessTransport {
    handlers: RwLock<HashMap<String, Weak<dyn PayloadHandler>>>,
    partitioned: RwLock<HashSet<String>>,
}

impl InProcessTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, address: impl Into<String>, handler: Arc<dyn PayloadHandler>) {
        self.handlers
            .write()
            .await
            .insert(address.into(), Arc::downgrade(&handler));
    }

    pub async fn deregister(&self, address: &str) {
        self.handlers.write().await.remove(address);
    }

    pub async fn partition(&self, address: impl Into<String>) {
        self.partitioned.write().await.insert(address.into());
    }

    pub async fn heal(&self, address: &str) {
        self.partitioned.write().await.remove(address);
    }
}

#[async_trait]
impl LockTransport for InProcessTransport {
    async fn send(&self, address: &str, payload: Bytes) -> Result<Bytes> {
        let unreachable = |reason: &str| LockError::Unreachable {
            address: address.to_string(),
            reason: reason.to_string(),
        };
        if self.partitioned.read().await.contains(address) {
            return Err(unreachable("partitioned"));
        }
        let handler = self
            .handlers
            .read()
            .await
            .get(address)
            .and_then(Weak::upgrade)
            .ok_or_else(|| unreachable("no service listening"))?;
        Ok(handler.handle_payload(payload).await)
    }
}
