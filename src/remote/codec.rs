use bytes::Bytes;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::{
    deadlock::WaitEdge,
    error::{LockError, Result},
    types::{Binding, KeyRange, LockMode, LockTableShard, ServiceIdentity, TxnId},
};

/// Every request kind a lock service answers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    Lock {
        txn: TxnId,
        shard: LockTableShard,
        range: KeyRange,
        mode: LockMode,
        /// Zero asks for an immediate answer without queuing.
        timeout_ms: u64,
    },
    Unlock {
        txn: TxnId,
        shard: Option<LockTableShard>,
    },
    QueryBinding {
        shard: LockTableShard,
    },
    RenewBinding {
        shard: LockTableShard,
        owner: ServiceIdentity,
        expected_version: u64,
    },
    WaitForEdges,
    AbortWaiter {
        txn: TxnId,
        shard: LockTableShard,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    Lock { granted: bool, waited_ms: u64 },
    Unlock,
    Binding(Option<Binding>),
    Renewed { new_version: u64 },
    Edges(Vec<WaitEdge>),
    Aborted { found: bool },
    Error(LockError),
}

impl Response {
    pub(crate) fn into_result(self) -> Result<Response> {
        match self {
            Response::Error(e) => Err(e),
            other => Ok(other),
        }
    }
}

pub fn encode<T: Serialize>(value: &T) -> Result<Bytes> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map(Bytes::from)
        .map_err(|e| LockError::MalformedPayload(e.to_string()))
}

/// Decodes a whole payload. Trailing bytes are rejected along with anything
/// that does not parse.
pub fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T> {
    let (value, read) = bincode::serde::decode_from_slice(payload, bincode::config::standard())
        .map_err(|e| LockError::MalformedPayload(e.to_string()))?;
    if read != payload.len() {
        return Err(LockError::MalformedPayload(format!(
            "{} trailing bytes",
            payload.len() - read
        )));
    }
    Ok(value)
}
