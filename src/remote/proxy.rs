use std::{sync::Arc, time::Duration};

use futures_retry::{ErrorHandler, FutureRetry, RetryPolicy};
use rand::Rng;
use tokio::sync::RwLock;
use tracing::debug;

use crate::{
    clock::Clock,
    error::{LockError, Result},
    lease::BindingRegistry,
    types::{Binding, LockTableShard},
};

use super::{
    cache::BindingCache,
    codec::{Request, Response},
    transport::{call, LockTransport},
};

/// Outcome of forwarding a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Forwarded {
    Response(Response),
    /// The shard has no live remote owner (unbound, or bound to this node).
    NotRemote(Option<Binding>),
}

/// Sends requests for remotely owned shards to their owner.
pub struct RemoteLockProxy {
    local_service_id: String,
    registry: Arc<dyn BindingRegistry>,
    transport: Arc<dyn LockTransport>,
    clock: Arc<dyn Clock>,
    cache: RwLock<BindingCache>,
    retry_attempts: usize,
    retry_backoff: Duration,
    call_timeout: Duration,
}

impl RemoteLockProxy {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        local_service_id: String,
        registry: Arc<dyn BindingRegistry>,
        transport: Arc<dyn LockTransport>,
        clock: Arc<dyn Clock>,
        cache_ttl: Duration,
        retry_attempts: usize,
        retry_backoff: Duration,
        call_timeout: Duration,
    ) -> Self {
        Self {
            local_service_id,
            registry,
            transport,
            clock,
            cache: RwLock::new(BindingCache::new(cache_ttl)),
            retry_attempts,
            retry_backoff,
            call_timeout,
        }
    }

    /// Current live binding of `shard`, from the cache while it is fresh.
    /// A cached binding whose lease has run out is not trusted.
    pub async fn resolve(&self, shard: LockTableShard) -> Result<Option<Binding>> {
        let cached = self.cache.read().await.get(shard);
        if let Some(binding) = cached {
            if !binding.is_expired(self.clock.now_millis()) {
                return Ok(Some(binding));
            }
        }
        self.refresh(shard).await
    }

    pub async fn remember(&self, binding: Binding) {
        self.cache.write().await.refresh(binding);
    }

    pub async fn invalidate(&self, shard: LockTableShard) {
        self.cache.write().await.invalidate(shard);
    }

    /// Sends `request` to the owner of `shard`. `wait` is how long the owner
    /// may legitimately take before answering (a lock wait).
    pub async fn forward(
        &self,
        shard: LockTableShard,
        request: Request,
        wait: Duration,
    ) -> Result<Forwarded> {
        let request = &request;
        let strategy = RemoteRetryStrategy::new(shard, self.retry_attempts, self.retry_backoff);
        FutureRetry::new(|| self.attempt(shard, request, wait), strategy)
            .await
            .map(|(forwarded, _)| forwarded)
            .map_err(|(e, _)| e)
    }

    async fn refresh(&self, shard: LockTableShard) -> Result<Option<Binding>> {
        let now = self.clock.now_millis();
        let binding = self
            .registry
            .query(shard)
            .await?
            .filter(|b| !b.is_expired(now));
        let mut cache = self.cache.write().await;
        match &binding {
            Some(b) => cache.refresh(b.clone()),
            None => cache.invalidate(shard),
        }
        Ok(binding)
    }

    async fn attempt(
        &self,
        shard: LockTableShard,
        request: &Request,
        wait: Duration,
    ) -> Result<Forwarded> {
        let binding = match self.resolve(shard).await? {
            Some(b) if !b.is_owned_by(&self.local_service_id) => b,
            other => return Ok(Forwarded::NotRemote(other)),
        };

        let address = binding.owner.service_address.as_str();
        let sent = tokio::time::timeout(
            wait.saturating_add(self.call_timeout),
            call(self.transport.as_ref(), address, request),
        )
        .await
        .unwrap_or_else(|_| {
            Err(LockError::Unreachable {
                address: address.to_string(),
                reason: "timed out".to_string(),
            })
        });

        match sent {
            Ok(response) => Ok(Forwarded::Response(response)),
            Err(e) => {
                if e.is_binding_error() || e.is_retryable() {
                    debug!(%shard, owner = %binding.owner.service_id, error = %e, "remote lock call failed");
                    self.invalidate(shard).await;
                }
                Err(e)
            }
        }
    }
}

/// Stale bindings get exactly one retry against a refreshed binding; transport
/// failures are retried with growing, jittered backoff. Running out of either
/// surfaces `RemoteUnavailable`.
struct RemoteRetryStrategy {
    shard: LockTableShard,
    max_attempts: usize,
    backoff: Duration,
    binding_retried: bool,
}

impl RemoteRetryStrategy {
    fn new(shard: LockTableShard, max_attempts: usize, backoff: Duration) -> Self {
        Self {
            shard,
            max_attempts,
            backoff,
            binding_retried: false,
        }
    }

    fn exhausted(&self, e: LockError) -> LockError {
        LockError::RemoteUnavailable {
            shard: self.shard,
            reason: e.to_string(),
        }
    }
}

impl ErrorHandler<LockError> for RemoteRetryStrategy {
    type OutError = LockError;

    fn handle(&mut self, attempt: usize, e: LockError) -> RetryPolicy<LockError> {
        if e.is_binding_error() {
            if self.binding_retried {
                return RetryPolicy::ForwardError(self.exhausted(e));
            }
            self.binding_retried = true;
            return RetryPolicy::Repeat;
        }
        if !e.is_retryable() {
            return RetryPolicy::ForwardError(e);
        }
        if attempt >= self.max_attempts {
            return RetryPolicy::ForwardError(self.exhausted(e));
        }

        let base = self.backoff * attempt as u32;
        let jitter = rand::thread_rng().gen_range(0..=base.as_millis() as u64 / 2);
        RetryPolicy::WaitRetry(base + Duration::from_millis(jitter))
    }
}
