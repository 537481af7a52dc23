use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use futures_retry::FutureRetry;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use crate::{
    clock::Clock,
    deadlock::WaitEdge,
    error::{LockError, Result},
    table::LockTable,
    types::{Binding, LockTableShard, ServiceIdentity, TxnId},
    util::{retry::FixedCountWithDelayStrategy, runnable::PeriodicRunnable},
};

use super::registry::BindingRegistry;

const RENEW_ATTEMPTS: usize = 2;

/// Owns the lock tables bound to this node and keeps their leases alive.
///
/// A table whose renewal failed is retired rather than forgotten: its holders
/// can still release, and if the registry hands the same version back the
/// table is revived with its locks intact.
pub struct LockTableKeeper {
    identity: ServiceIdentity,
    registry: Arc<dyn BindingRegistry>,
    tables: RwLock<HashMap<LockTableShard, Arc<LockTable>>>,
    retired: Mutex<HashMap<LockTableShard, Arc<LockTable>>>,
    clock: Arc<dyn Clock>,
    max_fixed_slice_size: usize,
    retry_delay: Duration,
}

impl LockTableKeeper {
    pub fn new(
        identity: ServiceIdentity,
        registry: Arc<dyn BindingRegistry>,
        clock: Arc<dyn Clock>,
        max_fixed_slice_size: usize,
        retry_delay: Duration,
    ) -> Self {
        Self {
            identity,
            registry,
            tables: RwLock::new(HashMap::new()),
            retired: Mutex::new(HashMap::new()),
            clock,
            max_fixed_slice_size,
            retry_delay,
        }
    }

    /// Binds `shard` to this node, creating its lock table. A live binding held
    /// by another node comes back as `Conflict`.
    pub async fn bind(&self, shard: LockTableShard) -> Result<Arc<LockTable>> {
        if let Some(table) = self.live_table(shard).await {
            return Ok(table);
        }

        let binding = self.registry.try_bind(shard, &self.identity).await?;
        let mut tables = self.tables.write().await;
        if let Some(table) = tables.get(&shard) {
            if table.version() == binding.version {
                table.extend_lease(binding.lease_expiry_ms).await;
                return Ok(table.clone());
            }
        }

        let table = match self.retired.lock().await.remove(&shard) {
            Some(retired) if retired.version() == binding.version => {
                info!(%shard, version = binding.version, "lock table revived");
                retired.revive(binding.lease_expiry_ms).await;
                retired
            }
            _ => {
                info!(%shard, version = binding.version, "lock table bound");
                Arc::new(LockTable::new(
                    shard,
                    binding.version,
                    binding.lease_expiry_ms,
                    self.max_fixed_slice_size,
                    self.clock.clone(),
                ))
            }
        };
        if let Some(stale) = tables.insert(shard, table.clone()) {
            stale.mark_lost().await;
        }
        Ok(table)
    }

    pub async fn table(&self, shard: LockTableShard) -> Option<Arc<LockTable>> {
        self.tables.read().await.get(&shard).cloned()
    }

    /// The table of `shard` if this node may still grant on it. A table whose
    /// lease ran out is renewed first, and dropped when that fails.
    pub async fn live_table(&self, shard: LockTableShard) -> Option<Arc<LockTable>> {
        let table = self.table(shard).await?;
        if !table.lease_expired() {
            return Some(table);
        }
        match self.renew(&table).await {
            Ok(binding) if binding.version == table.version() => {
                table.extend_lease(binding.lease_expiry_ms).await;
                Some(table)
            }
            Ok(_) => {
                warn!(%shard, "lease expired and the binding moved on");
                self.drop_table(shard).await;
                None
            }
            Err(e) => {
                warn!(%shard, error = %e, "lease expired and could not be renewed");
                self.drop_table(shard).await;
                None
            }
        }
    }

    pub async fn tables(&self) -> Vec<Arc<LockTable>> {
        self.tables.read().await.values().cloned().collect()
    }

    pub async fn wait_for_edges(&self) -> Vec<WaitEdge> {
        let mut edges = Vec::new();
        for table in self.tables().await {
            edges.extend(table.wait_for_edges().await);
        }
        edges
    }

    /// Stops granting on `shard` and fails its queued requests. Granted locks
    /// stay with the retired table until their holders release them.
    pub async fn drop_table(&self, shard: LockTableShard) -> Option<Arc<LockTable>> {
        let table = self.tables.write().await.remove(&shard)?;
        table.mark_lost().await;
        if table.has_holders().await {
            self.retired.lock().await.insert(shard, table.clone());
        }
        Some(table)
    }

    /// Releases what `txn` holds in the local table of `shard`, live or
    /// retired, leaving its queued requests alone. `None` when this node has
    /// no table for the shard.
    pub async fn release(&self, txn: TxnId, shard: LockTableShard) -> Option<bool> {
        self.release_in(txn, shard, false).await
    }

    /// Like `release`, but also fails the transaction's queued requests.
    pub async fn terminate(&self, txn: TxnId, shard: LockTableShard) -> Option<bool> {
        self.release_in(txn, shard, true).await
    }

    /// Terminates `txn` in every local table.
    pub async fn terminate_all(&self, txn: TxnId) {
        for table in self.tables().await {
            table.terminate(txn).await;
        }
        let retired: Vec<Arc<LockTable>> = self.retired.lock().await.values().cloned().collect();
        for table in retired {
            table.terminate(txn).await;
            if !table.has_holders().await {
                self.retired.lock().await.remove(&table.shard());
            }
        }
    }

    async fn release_in(&self, txn: TxnId, shard: LockTableShard, end_txn: bool) -> Option<bool> {
        let table = match self.table(shard).await {
            Some(table) => table,
            None => {
                let retired = self.retired.lock().await.get(&shard).cloned()?;
                let released = release_from(&retired, txn, end_txn).await;
                if !retired.has_holders().await {
                    self.retired.lock().await.remove(&shard);
                }
                return Some(released);
            }
        };
        Some(release_from(&table, txn, end_txn).await)
    }

    /// Gives every binding back to the registry.
    pub async fn shutdown(&self) {
        self.retired.lock().await.clear();
        let tables: Vec<Arc<LockTable>> = self.tables.write().await.drain().map(|(_, t)| t).collect();
        for table in tables {
            table.mark_lost().await;
            if let Err(e) = self
                .registry
                .release(table.shard(), &self.identity.service_id, table.version())
                .await
            {
                warn!(shard = %table.shard(), error = %e, "failed to release binding");
            }
        }
    }

    /// Renews every binding once. Shards that cannot be renewed are dropped so
    /// nothing new is granted on them.
    pub async fn renew_all(&self) {
        // Step 1: Renew every binding, remembering the ones we could not keep
        let mut lost = Vec::new();
        for table in self.tables().await {
            match self.renew(&table).await {
                Ok(binding) if binding.version == table.version() => {
                    table.extend_lease(binding.lease_expiry_ms).await;
                }
                Ok(_) => lost.push((table.shard(), LockError::BindingStale { shard: table.shard() })),
                Err(e) => lost.push((table.shard(), e)),
            }
        }

        // Step 2: Retire the lost shards
        for (shard, error) in lost {
            warn!(%shard, error = %error, "lock table binding lost");
            self.drop_table(shard).await;
        }
    }

    async fn renew(&self, table: &LockTable) -> Result<Binding> {
        let shard = table.shard();
        let owner = self.identity.service_id.as_str();
        let version = table.version();
        let registry = &self.registry;
        let (binding, _) = FutureRetry::new(
            || registry.renew(shard, owner, version),
            FixedCountWithDelayStrategy::new(RENEW_ATTEMPTS, self.retry_delay),
        )
        .await
        .map_err(|(e, _)| e)?;
        Ok(binding)
    }
}

async fn release_from(table: &LockTable, txn: TxnId, end_txn: bool) -> bool {
    if end_txn {
        table.terminate(txn).await
    } else {
        table.release(txn).await
    }
}

#[async_trait]
impl PeriodicRunnable for LockTableKeeper {
    async fn run_once(&self) {
        self.renew_all().await;
    }

    async fn before_shutdown_complete(&self) {
        self.shutdown().await;
    }
}
