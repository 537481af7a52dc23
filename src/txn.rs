use std::collections::{BTreeSet, HashMap};

use tokio::sync::Mutex;

use crate::types::{LockTableShard, TxnId};

/// Shards a live transaction has asked for locks in. Dropped when the
/// transaction terminates, which is when every one of its locks is released.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxnLockSet {
    pub txn: TxnId,
    pub shards: BTreeSet<LockTableShard>,
    generation: u64,
}

/// Per-service record of live transactions.
#[derive(Default)]
pub(crate) struct TxnRegistry {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    txns: HashMap<TxnId, TxnLockSet>,
    next_generation: u64,
}

impl TxnRegistry {
    /// Records that `txn` is locking in `shard` and returns the generation of
    /// its lock set. The shard is recorded before the lock is requested, so a
    /// racing terminate always knows to release it.
    pub(crate) async fn register(&self, txn: TxnId, shard: LockTableShard) -> u64 {
        let mut inner = self.inner.lock().await;
        let generation = inner.next_generation;
        let set = inner.txns.entry(txn).or_insert_with(|| TxnLockSet {
            txn,
            shards: BTreeSet::new(),
            generation,
        });
        set.shards.insert(shard);
        let current = set.generation;
        if current == generation {
            inner.next_generation += 1;
        }
        current
    }

    /// Records a grant in `shard` for the lock set `generation` of `txn`.
    /// `false` when that lock set has ended in the meantime. The shard is put
    /// back if a partial unlock dropped it while the grant was in flight.
    pub(crate) async fn record_grant(&self, txn: TxnId, shard: LockTableShard, generation: u64) -> bool {
        let mut inner = self.inner.lock().await;
        match inner.txns.get_mut(&txn) {
            Some(set) if set.generation == generation => {
                set.shards.insert(shard);
                true
            }
            _ => false,
        }
    }

    pub(crate) async fn terminate(&self, txn: TxnId) -> Option<TxnLockSet> {
        self.inner.lock().await.txns.remove(&txn)
    }

    /// Drops `shard` from the lock set. Returns whether it was there. The set
    /// itself lives on until the transaction terminates.
    pub(crate) async fn forget_shard(&self, txn: TxnId, shard: LockTableShard) -> bool {
        self.inner
            .lock()
            .await
            .txns
            .get_mut(&txn)
            .map_or(false, |set| set.shards.remove(&shard))
    }

    pub(crate) async fn get(&self, txn: TxnId) -> Option<TxnLockSet> {
        self.inner.lock().await.txns.get(&txn).cloned()
    }

    pub(crate) async fn clear(&self) -> Vec<TxnLockSet> {
        self.inner.lock().await.txns.drain().map(|(_, set)| set).collect()
    }
}
