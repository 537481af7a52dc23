use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::{
    clock::Clock,
    error::{LockError, Result},
    types::{Binding, LockTableShard, ServiceIdentity},
};

/// Source of truth for which node owns which shard.
#[async_trait]
pub trait BindingRegistry: Send + Sync {
    /// Binds `shard` to `requester` unless another node holds a live lease,
    /// in which case the current binding comes back inside `Conflict`.
    async fn try_bind(&self, shard: LockTableShard, requester: &ServiceIdentity) -> Result<Binding>;

    /// Extends the lease of a binding the caller still owns at `expected_version`.
    async fn renew(
        &self,
        shard: LockTableShard,
        owner: &str,
        expected_version: u64,
    ) -> Result<Binding>;

    async fn query(&self, shard: LockTableShard) -> Result<Option<Binding>>;

    /// Gives a binding up before its lease runs out.
    async fn release(&self, shard: LockTableShard, owner: &str, version: u64) -> Result<()>;

    /// Bindings whose lease has not expired.
    async fn list(&self) -> Result<Vec<Binding>>;
}

#[derive(Default)]
struct RegistryState {
    bindings: HashMap<LockTableShard, Binding>,
    // outlives released bindings so versions never repeat
    versions: HashMap<LockTableShard, u64>,
    closed: bool,
}

/// In-process registry. One mutex serializes every bind and renewal, so the
/// first writer for a shard wins.
pub struct ClusterBindingRegistry {
    lease: Duration,
    clock: Arc<dyn Clock>,
    state: Mutex<RegistryState>,
}

impl ClusterBindingRegistry {
    pub fn new(lease: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            lease,
            clock,
            state: Mutex::new(RegistryState::default()),
        }
    }

    /// Drops every binding and refuses new ones.
    pub async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        state.closed = true;
        state.bindings.clear();
        info!("binding registry closed");
    }

    fn lease_expiry(&self, now: u64) -> u64 {
        now + self.lease.as_millis() as u64
    }
}

#[async_trait]
impl BindingRegistry for ClusterBindingRegistry {
    async fn try_bind(&self, shard: LockTableShard, requester: &ServiceIdentity) -> Result<Binding> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(LockError::ServiceClosed);
        }
        let now = self.clock.now_millis();
        if let Some(current) = state.bindings.get(&shard) {
            if !current.is_expired(now) {
                if current.owner == *requester {
                    return Ok(current.clone());
                }
                return Err(LockError::Conflict {
                    current: current.clone(),
                });
            }
        }

        let version = state.versions.get(&shard).copied().unwrap_or(0) + 1;
        state.versions.insert(shard, version);
        let binding = Binding {
            shard,
            owner: requester.clone(),
            version,
            lease_expiry_ms: self.lease_expiry(now),
        };
        state.bindings.insert(shard, binding.clone());
        info!(%shard, owner = %requester.service_id, version, "shard bound");
        Ok(binding)
    }

    async fn renew(
        &self,
        shard: LockTableShard,
        owner: &str,
        expected_version: u64,
    ) -> Result<Binding> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(LockError::ServiceClosed);
        }
        let now = self.clock.now_millis();
        let expiry = self.lease_expiry(now);
        let current = state
            .bindings
            .get_mut(&shard)
            .ok_or(LockError::BindingLost { shard })?;
        if !current.is_owned_by(owner) || current.version != expected_version {
            return Err(LockError::Conflict {
                current: current.clone(),
            });
        }
        // a lapsed lease nobody else picked up still carries this version
        current.lease_expiry_ms = expiry;
        debug!(%shard, owner, version = expected_version, "binding renewed");
        Ok(current.clone())
    }

    async fn query(&self, shard: LockTableShard) -> Result<Option<Binding>> {
        Ok(self.state.lock().await.bindings.get(&shard).cloned())
    }

    async fn release(&self, shard: LockTableShard, owner: &str, version: u64) -> Result<()> {
        let mut state = self.state.lock().await;
        let matches = state
            .bindings
            .get(&shard)
            .map_or(false, |b| b.is_owned_by(owner) && b.version == version);
        if matches {
            state.bindings.remove(&shard);
            info!(%shard, owner, version, "binding released");
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Binding>> {
        let now = self.clock.now_millis();
        let state = self.state.lock().await;
        let mut bindings: Vec<Binding> = state
            .bindings
            .values()
            .filter(|b| !b.is_expired(now))
            .cloned()
            .collect();
        bindings.sort_by_key(|b| b.shard);
        Ok(bindings)
    }
}
