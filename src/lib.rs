//! Pessimistic lock service for a shared-nothing database cluster.
//!
//! Lock state is partitioned into shards. Each shard's lock table lives on the
//! one node its binding names; the [`LockTableKeeper`] keeps those leases
//! renewed, the [`RemoteLockProxy`] forwards requests for shards owned
//! elsewhere, and the [`DeadlockDetector`] breaks wait-for cycles. The
//! [`LockService`] ties them together for the query executor.

pub mod clock;
pub mod config;
pub mod deadlock;
pub mod error;
pub mod lease;
pub mod remote;
pub mod service;
pub mod table;
pub mod txn;
pub mod types;
mod util;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use deadlock::{DeadlockDetector, WaitEdge};
pub use error::{LockError, Result};
pub use lease::{BindingRegistry, ClusterBindingRegistry, LockTableKeeper};
pub use remote::{
    Forwarded, InProcessTransport, LockTransport, PayloadHandler, RemoteLockProxy, Request,
    Response,
};
pub use service::LockService;
pub use table::LockTable;
pub use txn::TxnLockSet;
pub use types::{Binding, KeyRange, LockMode, LockTableShard, ServiceIdentity, TxnId};
