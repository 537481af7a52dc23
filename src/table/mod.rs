use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::{
    sync::{oneshot, Mutex},
    time::Instant,
};
use tracing::debug;

use crate::{
    clock::Clock,
    deadlock::WaitEdge,
    error::{LockError, Result},
    types::{KeyRange, LockMode, LockTableShard, TxnId},
};

mod keyset;

pub(crate) use keyset::KeySet;

/// Ranges one transaction holds in this shard, split by mode.
#[derive(Debug, Default)]
struct HeldLocks {
    exclusive: KeySet,
    shared: KeySet,
}

impl HeldLocks {
    fn blocks(&self, range: &KeyRange, mode: LockMode) -> bool {
        self.exclusive.overlaps(range) || (mode == LockMode::Exclusive && self.shared.overlaps(range))
    }

    /// Whether `range` is already held at `mode` or stronger.
    fn covers(&self, range: &KeyRange, mode: LockMode) -> bool {
        self.exclusive.covers(range) || (mode == LockMode::Shared && self.shared.covers(range))
    }

    fn conflicting_range(&self, range: &KeyRange, mode: LockMode) -> Option<KeyRange> {
        let mut held = self.exclusive.split(range);
        if mode == LockMode::Exclusive && held.is_empty() {
            held = self.shared.split(range);
        }
        held.ranges().first().cloned()
    }

    fn is_empty(&self) -> bool {
        self.exclusive.is_empty() && self.shared.is_empty()
    }
}

struct Waiter {
    id: u64,
    txn: TxnId,
    range: KeyRange,
    mode: LockMode,
    enqueued_at: Instant,
    notify: oneshot::Sender<Result<()>>,
}

#[derive(Default)]
struct TableState {
    holders: HashMap<TxnId, HeldLocks>,
    waiters: VecDeque<Waiter>,
    next_waiter_id: u64,
    lost: bool,
}

/// Lock state of one shard. A single mutex covers holders and the wait queue,
/// so grants and releases are atomic with respect to queued waiters.
///
/// Nothing is granted once the local copy of the lease has run out; the keeper
/// extends it on every successful renewal.
pub struct LockTable {
    shard: LockTableShard,
    version: u64,
    max_fixed_slice_size: usize,
    lease_expiry_ms: AtomicU64,
    clock: Arc<dyn Clock>,
    state: Mutex<TableState>,
}

/// Takes a queued request out again if its caller stops waiting.
struct QueuedRequest<'a> {
    table: &'a LockTable,
    id: u64,
}

impl Drop for QueuedRequest<'_> {
    fn drop(&mut self) {
        // a busy table drops the entry on its next pass instead
        if let Ok(mut state) = self.table.state.try_lock() {
            if let Some(pos) = state.waiters.iter().position(|w| w.id == self.id) {
                state.waiters.remove(pos);
                self.table.wake_waiters(&mut state);
            }
        }
    }
}

impl LockTable {
    pub(crate) fn new(
        shard: LockTableShard,
        version: u64,
        lease_expiry_ms: u64,
        max_fixed_slice_size: usize,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            shard,
            version,
            max_fixed_slice_size,
            lease_expiry_ms: AtomicU64::new(lease_expiry_ms),
            clock,
            state: Mutex::new(TableState::default()),
        }
    }

    pub fn shard(&self) -> LockTableShard {
        self.shard
    }

    /// Binding version this table was created under.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn lease_expiry_ms(&self) -> u64 {
        self.lease_expiry_ms.load(Ordering::SeqCst)
    }

    pub fn lease_expired(&self) -> bool {
        self.clock.now_millis() >= self.lease_expiry_ms()
    }

    /// Records a renewed lease and grants whatever waited for it.
    pub(crate) async fn extend_lease(&self, expiry_ms: u64) {
        self.lease_expiry_ms.fetch_max(expiry_ms, Ordering::SeqCst);
        let mut state = self.state.lock().await;
        self.wake_waiters(&mut state);
    }

    /// Acquires `range` for `txn`, queuing behind conflicting holders and
    /// earlier conflicting waiters. Returns how long the caller waited.
    pub async fn acquire(
        &self,
        txn: TxnId,
        range: KeyRange,
        mode: LockMode,
        timeout: Duration,
    ) -> Result<Duration> {
        let started = Instant::now();
        let (id, mut rx) = {
            let mut state = self.state.lock().await;
            self.ensure_grantable(&state)?;
            self.purge_abandoned(&mut state);
            if self.grant_if_free(&mut state, txn, &range, mode) {
                return Ok(Duration::ZERO);
            }
            if timeout == Duration::ZERO {
                return Err(LockError::LockTimeout {
                    txn,
                    shard: self.shard,
                });
            }

            let (tx, rx) = oneshot::channel();
            let id = state.next_waiter_id;
            state.next_waiter_id += 1;
            debug!(shard = %self.shard, %txn, %range, ?mode, "lock conflict, waiting");
            state.waiters.push_back(Waiter {
                id,
                txn,
                range,
                mode,
                enqueued_at: started,
                notify: tx,
            });
            (id, rx)
        };
        let _queued = QueuedRequest { table: self, id };

        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(result)) => result.map(|_| started.elapsed()),
            Ok(Err(_)) => Err(LockError::BindingLost { shard: self.shard }),
            Err(_) => {
                let mut state = self.state.lock().await;
                if let Some(pos) = state.waiters.iter().position(|w| w.id == id) {
                    state.waiters.remove(pos);
                    self.wake_waiters(&mut state);
                    return Err(LockError::LockTimeout {
                        txn,
                        shard: self.shard,
                    });
                }
                // Resolved while the timer fired; the outcome was sent under
                // this same mutex, so it is already in the channel.
                match rx.try_recv() {
                    Ok(result) => result.map(|_| started.elapsed()),
                    Err(_) => Err(LockError::BindingLost { shard: self.shard }),
                }
            }
        }
    }

    /// Grants `range` only if that needs no waiting. Nothing is queued.
    pub async fn try_acquire(&self, txn: TxnId, range: KeyRange, mode: LockMode) -> Result<bool> {
        let mut state = self.state.lock().await;
        self.ensure_grantable(&state)?;
        self.purge_abandoned(&mut state);
        Ok(self.grant_if_free(&mut state, txn, &range, mode))
    }

    /// Releases every range `txn` holds in this shard. Requests it still has
    /// queued keep waiting. Returns whether anything was released.
    pub async fn release(&self, txn: TxnId) -> bool {
        let mut state = self.state.lock().await;
        let held = state.holders.remove(&txn).is_some();
        if held {
            self.wake_waiters(&mut state);
        }
        held
    }

    /// Releases `txn` for good: its ranges are freed and its queued requests
    /// fail with `TxnTerminated`.
    pub async fn terminate(&self, txn: TxnId) -> bool {
        let mut state = self.state.lock().await;
        let held = state.holders.remove(&txn).is_some();
        let aborted = fail_waiters(&mut state, txn, || LockError::TxnTerminated { txn });
        if held || aborted {
            self.wake_waiters(&mut state);
        }
        held
    }

    /// Fails the pending requests of `txn` with a deadlock abort.
    pub async fn abort_waiter(&self, txn: TxnId) -> bool {
        let mut state = self.state.lock().await;
        let found = fail_waiters(&mut state, txn, || LockError::DeadlockAbort { txn });
        if found {
            self.wake_waiters(&mut state);
        }
        found
    }

    /// Stops granting: every queued request fails with `BindingLost`, as does
    /// every later acquire. Locks already granted stay recorded.
    pub async fn mark_lost(&self) {
        let mut state = self.state.lock().await;
        state.lost = true;
        let shard = self.shard;
        for waiter in state.waiters.drain(..) {
            let _ = waiter.notify.send(Err(LockError::BindingLost { shard }));
        }
    }

    /// Resumes granting after the same binding version was handed back.
    pub(crate) async fn revive(&self, expiry_ms: u64) {
        self.lease_expiry_ms.fetch_max(expiry_ms, Ordering::SeqCst);
        self.state.lock().await.lost = false;
    }

    pub async fn has_holders(&self) -> bool {
        !self.state.lock().await.holders.is_empty()
    }

    pub async fn is_lost(&self) -> bool {
        self.state.lock().await.lost
    }

    pub async fn is_held(&self, txn: TxnId, key: &[u8]) -> bool {
        let state = self.state.lock().await;
        state
            .holders
            .get(&txn)
            .map_or(false, |h| h.exclusive.contains(key) || h.shared.contains(key))
    }

    /// Whether the transaction's held set switched to the coalesced form.
    pub async fn is_coalesced(&self, txn: TxnId) -> bool {
        let state = self.state.lock().await;
        state
            .holders
            .get(&txn)
            .map_or(false, |h| h.exclusive.is_coalesced() || h.shared.is_coalesced())
    }

    pub async fn waiter_count(&self) -> usize {
        let mut state = self.state.lock().await;
        self.purge_abandoned(&mut state);
        state.waiters.len()
    }

    /// Wait-for edges visible in this shard: each waiter waits on the holders
    /// it conflicts with and on earlier conflicting waiters it queues behind.
    pub async fn wait_for_edges(&self) -> Vec<WaitEdge> {
        let mut state = self.state.lock().await;
        self.purge_abandoned(&mut state);
        let mut edges = Vec::new();
        for (i, waiter) in state.waiters.iter().enumerate() {
            for (holder, held) in state.holders.iter() {
                if *holder == waiter.txn {
                    continue;
                }
                if let Some(range) = held.conflicting_range(&waiter.range, waiter.mode) {
                    edges.push(WaitEdge {
                        waiter: waiter.txn,
                        holder: *holder,
                        shard: self.shard,
                        range,
                    });
                }
            }
            for earlier in state.waiters.iter().take(i) {
                if !queues_behind(&state, waiter.txn, &waiter.range, waiter.mode, earlier) {
                    continue;
                }
                if let Some(range) = earlier.range.intersection(&waiter.range) {
                    edges.push(WaitEdge {
                        waiter: waiter.txn,
                        holder: earlier.txn,
                        shard: self.shard,
                        range,
                    });
                }
            }
        }
        edges.sort();
        edges.dedup();
        edges
    }

    fn ensure_grantable(&self, state: &TableState) -> Result<()> {
        if state.lost || self.lease_expired() {
            return Err(LockError::BindingLost { shard: self.shard });
        }
        Ok(())
    }

    /// Grants on the spot when `txn` already holds `range` or nothing blocks it.
    fn grant_if_free(&self, state: &mut TableState, txn: TxnId, range: &KeyRange, mode: LockMode) -> bool {
        if state.holders.get(&txn).map_or(false, |h| h.covers(range, mode)) {
            return true;
        }
        if is_blocked(state, txn, range, mode, state.waiters.len()) {
            return false;
        }
        self.grant(state, txn, range.clone(), mode);
        true
    }

    fn grant(&self, state: &mut TableState, txn: TxnId, range: KeyRange, mode: LockMode) {
        let held = state.holders.entry(txn).or_default();
        match mode {
            LockMode::Exclusive => held.exclusive.insert(range, self.max_fixed_slice_size),
            LockMode::Shared => held.shared.insert(range, self.max_fixed_slice_size),
        }
    }

    /// Drops queued requests whose callers went away.
    fn purge_abandoned(&self, state: &mut TableState) {
        let queued = state.waiters.len();
        state.waiters.retain(|w| !w.notify.is_closed());
        if state.waiters.len() != queued {
            self.wake_waiters(state);
        }
    }

    /// Grants queued requests in FIFO order. A waiter is skipped while it
    /// conflicts with a holder or with any earlier waiter still queued.
    fn wake_waiters(&self, state: &mut TableState) {
        let mut i = 0;
        while !state.lost && !self.lease_expired() && i < state.waiters.len() {
            let blocked = {
                let w = &state.waiters[i];
                is_blocked(state, w.txn, &w.range, w.mode, i)
            };
            if blocked {
                i += 1;
                continue;
            }
            let waiter = match state.waiters.remove(i) {
                Some(waiter) => waiter,
                None => break,
            };
            // abandoned by a caller that stopped waiting
            if waiter.notify.is_closed() {
                continue;
            }
            debug!(
                shard = %self.shard,
                txn = %waiter.txn,
                waited = ?waiter.enqueued_at.elapsed(),
                "granting queued lock"
            );
            self.grant(state, waiter.txn, waiter.range, waiter.mode);
            let _ = waiter.notify.send(Ok(()));
        }
        state.holders.retain(|_, held| !held.is_empty());
    }
}

/// Whether a request must wait: it conflicts with another transaction's held
/// ranges, or with one of the first `queued_before` waiters.
fn is_blocked(
    state: &TableState,
    txn: TxnId,
    range: &KeyRange,
    mode: LockMode,
    queued_before: usize,
) -> bool {
    let held_conflict = state
        .holders
        .iter()
        .any(|(holder, held)| *holder != txn && held.blocks(range, mode));
    held_conflict
        || state
            .waiters
            .iter()
            .take(queued_before)
            .any(|w| queues_behind(state, txn, range, mode, w))
}

/// Whether a request by `txn` has to let the queued `earlier` go first. A
/// waiter that is itself blocked by what `txn` already holds is no reason to
/// wait: it cannot be granted before `txn` releases anyway.
fn queues_behind(
    state: &TableState,
    txn: TxnId,
    range: &KeyRange,
    mode: LockMode,
    earlier: &Waiter,
) -> bool {
    earlier.txn != txn
        && earlier.mode.conflicts_with(mode)
        && earlier.range.overlaps(range)
        && !state
            .holders
            .get(&txn)
            .map_or(false, |held| held.blocks(&earlier.range, earlier.mode))
}

fn fail_waiters<F>(state: &mut TableState, txn: TxnId, err: F) -> bool
where
    F: Fn() -> LockError,
{
    let mut found = false;
    let mut kept = VecDeque::with_capacity(state.waiters.len());
    for waiter in state.waiters.drain(..) {
        if waiter.txn == txn {
            found = true;
            let _ = waiter.notify.send(Err(err()));
        } else {
            kept.push_back(waiter);
        }
    }
    state.waiters = kept;
    found
}
