use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{Binding, LockTableShard, TxnId};

/// Everything that can go wrong between the executor asking for a lock and the
/// owning lock table answering.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum LockError {
    #[error("invalid lock service config: {0}")]
    InvalidConfig(String),

    #[error("txn {txn} timed out waiting for a lock on {shard}")]
    LockTimeout { txn: TxnId, shard: LockTableShard },

    #[error("txn {txn} aborted to break a deadlock")]
    DeadlockAbort { txn: TxnId },

    #[error("binding for {shard} is stale")]
    BindingStale { shard: LockTableShard },

    #[error("binding for {shard} was lost")]
    BindingLost { shard: LockTableShard },

    #[error("remote lock service unavailable for {shard}: {reason}")]
    RemoteUnavailable { shard: LockTableShard, reason: String },

    #[error("{} is bound to {} at version {}", .current.shard, .current.owner.service_id, .current.version)]
    Conflict { current: Binding },

    #[error("{address} is unreachable: {reason}")]
    Unreachable { address: String, reason: String },

    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    #[error("txn {txn} terminated while a lock was being granted")]
    TxnTerminated { txn: TxnId },

    #[error("lock service is closed")]
    ServiceClosed,
}

impl LockError {
    /// Transport-level failures worth another attempt after a delay.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LockError::Unreachable { .. } | LockError::RemoteUnavailable { .. }
        )
    }

    pub(crate) fn is_binding_error(&self) -> bool {
        matches!(
            self,
            LockError::BindingStale { .. } | LockError::BindingLost { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, LockError>;
