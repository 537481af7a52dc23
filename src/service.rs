use std::convert::TryFrom;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{
    clock::Clock,
    config::Config,
    deadlock::DeadlockDetector,
    error::{LockError, Result},
    lease::{BindingRegistry, LockTableKeeper},
    remote::{decode, encode, Forwarded, LockTransport, PayloadHandler, RemoteLockProxy, Request, Response},
    table::LockTable,
    txn::{TxnLockSet, TxnRegistry},
    types::{Binding, KeyRange, LockMode, LockTableShard, ServiceIdentity, TxnId},
    util::runnable::PeriodicTask,
};

// enough to rebind locally after a remote owner disappears
const ROUTE_ATTEMPTS: usize = 3;

enum Route {
    Local(Arc<LockTable>),
    Remote,
}

/// The lock service of one node: the surface the query executor locks through,
/// and the handler remote nodes forward their requests to.
pub struct LockService {
    config: Config,
    identity: ServiceIdentity,
    registry: Arc<dyn BindingRegistry>,
    keeper: Arc<LockTableKeeper>,
    proxy: Arc<RemoteLockProxy>,
    detector: Arc<DeadlockDetector>,
    txns: TxnRegistry,
    tasks: Mutex<Vec<PeriodicTask>>,
    closed: AtomicBool,
}

impl LockService {
    pub fn new(
        mut config: Config,
        registry: Arc<dyn BindingRegistry>,
        transport: Arc<dyn LockTransport>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.adjust();
        config.validate()?;
        let identity = config.identity();

        let keeper = Arc::new(LockTableKeeper::new(
            identity.clone(),
            registry.clone(),
            clock.clone(),
            config.max_fixed_slice_size,
            config.remote_retry_backoff,
        ));
        let proxy = Arc::new(RemoteLockProxy::new(
            identity.service_id.clone(),
            registry.clone(),
            transport.clone(),
            clock,
            config.keep_remote_lock_duration,
            config.remote_retry_attempts,
            config.remote_retry_backoff,
            config.remote_lock_timeout,
        ));
        let detector = Arc::new(DeadlockDetector::new(
            identity.clone(),
            keeper.clone(),
            registry.clone(),
            transport,
            proxy.clone(),
        ));

        Ok(Self {
            config,
            identity,
            registry,
            keeper,
            proxy,
            detector,
            txns: TxnRegistry::default(),
            tasks: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn identity(&self) -> &ServiceIdentity {
        &self.identity
    }

    pub fn keeper(&self) -> &Arc<LockTableKeeper> {
        &self.keeper
    }

    pub fn detector(&self) -> &Arc<DeadlockDetector> {
        &self.detector
    }

    /// Starts lease renewal and deadlock detection.
    pub async fn start(&self) {
        let mut tasks = self.tasks.lock().await;
        if !tasks.is_empty() {
            return;
        }
        tasks.push(PeriodicTask::spawn(
            self.keeper.clone(),
            self.config.renew_interval(),
        ));
        tasks.push(PeriodicTask::spawn(
            self.detector.clone(),
            self.config.deadlock_detect_interval,
        ));
        info!(service = %self.identity.service_id, address = %self.identity.service_address, "lock service started");
    }

    /// Stops background work, aborts live transactions and gives every binding
    /// back. Later requests fail with `ServiceClosed`.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let tasks: Vec<PeriodicTask> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            task.stop().await;
        }
        for set in self.txns.clear().await {
            self.release_shards(set.txn, set.shards.into_iter().collect(), true)
                .await
                .ok();
        }
        self.keeper.shutdown().await;
        info!(service = %self.identity.service_id, "lock service stopped");
    }

    /// Locks `range` of `shard` for `txn`, waiting at most `timeout` behind
    /// conflicting locks. Returns how long the request waited.
    pub async fn lock(
        &self,
        txn: TxnId,
        shard: LockTableShard,
        range: KeyRange,
        mode: LockMode,
        timeout: Duration,
    ) -> Result<Duration> {
        match self.lock_with(txn, shard, range, mode, timeout).await? {
            Some(waited) => Ok(waited),
            None => Err(LockError::LockTimeout { txn, shard }),
        }
    }

    /// Locks `range` only if no waiting is needed.
    pub async fn try_lock(
        &self,
        txn: TxnId,
        shard: LockTableShard,
        range: KeyRange,
        mode: LockMode,
    ) -> Result<bool> {
        Ok(self
            .lock_with(txn, shard, range, mode, Duration::ZERO)
            .await?
            .is_some())
    }

    /// Releases what `txn` holds in `shard`; requests it has in flight there
    /// keep waiting. With `None` the transaction is over: everything it holds
    /// is released, its pending requests fail and its lock set is dropped.
    pub async fn unlock(&self, txn: TxnId, shard: Option<LockTableShard>) -> Result<()> {
        match shard {
            Some(shard) => {
                self.txns.forget_shard(txn, shard).await;
                self.release_shards(txn, vec![shard], false).await
            }
            None => {
                let shards = self
                    .txns
                    .terminate(txn)
                    .await
                    .map(|set| set.shards.into_iter().collect())
                    .unwrap_or_default();
                self.release_shards(txn, shards, true).await
            }
        }
    }

    pub async fn txn_lock_set(&self, txn: TxnId) -> Option<TxnLockSet> {
        self.txns.get(txn).await
    }

    pub async fn query_binding(&self, shard: LockTableShard) -> Result<Option<Binding>> {
        self.registry.query(shard).await
    }

    pub async fn renew_binding(
        &self,
        shard: LockTableShard,
        owner: &ServiceIdentity,
        expected_version: u64,
    ) -> Result<u64> {
        let binding = self
            .registry
            .renew(shard, &owner.service_id, expected_version)
            .await?;
        Ok(binding.version)
    }

    /// Answers a request from another node. Lock requests are only served for
    /// shards bound here; they are never forwarded again.
    pub async fn handle(&self, request: Request) -> Response {
        let result = match request {
            Request::Lock {
                txn,
                shard,
                range,
                mode,
                timeout_ms,
            } => self.serve_lock(txn, shard, range, mode, timeout_ms).await,
            Request::Unlock { txn, shard } => {
                match shard {
                    Some(shard) => {
                        self.keeper.release(txn, shard).await;
                    }
                    None => self.keeper.terminate_all(txn).await,
                }
                Ok(Response::Unlock)
            }
            Request::QueryBinding { shard } => self.query_binding(shard).await.map(Response::Binding),
            Request::RenewBinding {
                shard,
                owner,
                expected_version,
            } => self
                .renew_binding(shard, &owner, expected_version)
                .await
                .map(|new_version| Response::Renewed { new_version }),
            Request::WaitForEdges => Ok(Response::Edges(self.keeper.wait_for_edges().await)),
            Request::AbortWaiter { txn, shard } => match self.keeper.table(shard).await {
                Some(table) => Ok(Response::Aborted {
                    found: table.abort_waiter(txn).await,
                }),
                None => Err(LockError::BindingStale { shard }),
            },
        };
        result.unwrap_or_else(Response::Error)
    }

    async fn serve_lock(
        &self,
        txn: TxnId,
        shard: LockTableShard,
        range: KeyRange,
        mode: LockMode,
        timeout_ms: u64,
    ) -> Result<Response> {
        self.ensure_open()?;
        let table = self
            .keeper
            .live_table(shard)
            .await
            .ok_or(LockError::BindingStale { shard })?;
        if timeout_ms == 0 {
            let granted = table.try_acquire(txn, range, mode).await?;
            return Ok(Response::Lock {
                granted,
                waited_ms: 0,
            });
        }
        let waited = table
            .acquire(txn, range, mode, Duration::from_millis(timeout_ms))
            .await?;
        Ok(Response::Lock {
            granted: true,
            waited_ms: saturating_millis(waited),
        })
    }

    /// `Ok(None)` means blocked under a zero timeout.
    async fn lock_with(
        &self,
        txn: TxnId,
        shard: LockTableShard,
        range: KeyRange,
        mode: LockMode,
        timeout: Duration,
    ) -> Result<Option<Duration>> {
        self.ensure_open()?;
        let generation = self.txns.register(txn, shard).await;
        let granted = self.acquire(txn, shard, range, mode, timeout).await?;
        if granted.is_some() && !self.txns.record_grant(txn, shard, generation).await {
            // the transaction ended while this grant was in flight
            warn!(%txn, %shard, "lock granted after transaction terminated, releasing");
            self.release_shards(txn, vec![shard], false).await.ok();
            return Err(LockError::TxnTerminated { txn });
        }
        Ok(granted)
    }

    async fn acquire(
        &self,
        txn: TxnId,
        shard: LockTableShard,
        range: KeyRange,
        mode: LockMode,
        timeout: Duration,
    ) -> Result<Option<Duration>> {
        for _ in 0..ROUTE_ATTEMPTS {
            match self.route(shard).await? {
                Route::Local(table) => {
                    let result = if timeout == Duration::ZERO {
                        table
                            .try_acquire(txn, range.clone(), mode)
                            .await
                            .map(|granted| if granted { Some(Duration::ZERO) } else { None })
                    } else {
                        table.acquire(txn, range.clone(), mode, timeout).await.map(Some)
                    };
                    match result {
                        // the keeper lost the binding mid-request; route again
                        Err(LockError::BindingLost { .. }) => {
                            debug!(%txn, %shard, "local binding lost, rerouting");
                        }
                        other => return other,
                    }
                }
                Route::Remote => {
                    let request = Request::Lock {
                        txn,
                        shard,
                        range: range.clone(),
                        mode,
                        timeout_ms: saturating_millis(timeout),
                    };
                    match self.proxy.forward(shard, request, timeout).await? {
                        Forwarded::Response(Response::Lock { granted, waited_ms }) => {
                            return Ok(if granted {
                                Some(Duration::from_millis(waited_ms))
                            } else {
                                None
                            });
                        }
                        Forwarded::Response(other) => {
                            return Err(LockError::MalformedPayload(format!(
                                "unexpected lock response {:?}",
                                other
                            )));
                        }
                        Forwarded::NotRemote(_) => {
                            debug!(%txn, %shard, "shard no longer remote, rerouting");
                        }
                    }
                }
            }
        }
        Err(ownership_kept_moving(shard))
    }

    async fn route(&self, shard: LockTableShard) -> Result<Route> {
        if let Some(table) = self.keeper.live_table(shard).await {
            return Ok(Route::Local(table));
        }
        if let Some(binding) = self.proxy.resolve(shard).await? {
            if !binding.is_owned_by(&self.identity.service_id) {
                return Ok(Route::Remote);
            }
        }
        match self.keeper.bind(shard).await {
            Ok(table) => Ok(Route::Local(table)),
            Err(LockError::Conflict { current }) => {
                self.proxy.remember(current).await;
                Ok(Route::Remote)
            }
            Err(e) => Err(e),
        }
    }

    /// Best effort over every shard; the first failure is reported. With
    /// `end_txn` the owners also fail the transaction's queued requests.
    async fn release_shards(
        &self,
        txn: TxnId,
        shards: Vec<LockTableShard>,
        end_txn: bool,
    ) -> Result<()> {
        let mut first_error = None;
        for shard in shards {
            let local = if end_txn {
                self.keeper.terminate(txn, shard).await
            } else {
                self.keeper.release(txn, shard).await
            };
            if local.is_some() {
                continue;
            }
            let request = Request::Unlock {
                txn,
                shard: if end_txn { None } else { Some(shard) },
            };
            if let Err(e) = self.proxy.forward(shard, request, Duration::ZERO).await {
                warn!(%txn, %shard, error = %e, "failed to release remote lock");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(LockError::ServiceClosed)
        } else {
            Ok(())
        }
    }
}

fn ownership_kept_moving(shard: LockTableShard) -> LockError {
    LockError::RemoteUnavailable {
        shard,
        reason: format!("ownership kept moving over {} attempts", ROUTE_ATTEMPTS),
    }
}

fn saturating_millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[async_trait]
impl PayloadHandler for LockService {
    async fn handle_payload(&self, payload: Bytes) -> Bytes {
        let response = match decode::<Request>(&payload) {
            Ok(request) => self.handle(request).await,
            Err(e) => {
                warn!(error = %e, "rejecting malformed lock request");
                Response::Error(e)
            }
        };
        encode(&response).unwrap_or_else(|e| {
            warn!(error = %e, "failed to encode lock response");
            Bytes::new()
        })
    }
}
