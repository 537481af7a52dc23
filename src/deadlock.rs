//! Periodic wait-for graph search.
//!
//! Every node builds its graph from the wait queues of the lock tables it owns
//! plus the edges it pulls from each other node that currently owns a shard.
//! Edges that need more than that one hop to be seen are not detected here;
//! the lock timeout of the waiting request breaks such cycles instead.

use std::{
    collections::{BTreeMap, BTreeSet, HashSet},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    lease::{BindingRegistry, LockTableKeeper},
    remote::{call, Forwarded, LockTransport, RemoteLockProxy, Request, Response},
    types::{KeyRange, LockTableShard, ServiceIdentity, TxnId},
    util::runnable::PeriodicRunnable,
};

/// `waiter` is queued in `shard` behind `holder`, which holds (or is queued
/// for) `range`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WaitEdge {
    pub waiter: TxnId,
    pub holder: TxnId,
    pub shard: LockTableShard,
    pub range: KeyRange,
}

#[derive(Debug, Default)]
pub(crate) struct WaitForGraph {
    edges: BTreeMap<TxnId, BTreeSet<TxnId>>,
}

impl WaitForGraph {
    pub(crate) fn from_edges<'a>(edges: impl IntoIterator<Item = &'a WaitEdge>) -> Self {
        let mut graph = WaitForGraph::default();
        for edge in edges {
            graph.edges.entry(edge.waiter).or_default().insert(edge.holder);
        }
        graph
    }

    /// Some cycle in the graph, as the transactions along it. The search keeps
    /// its own stack so long wait chains cannot exhaust the thread stack.
    pub(crate) fn find_cycle(&self) -> Option<Vec<TxnId>> {
        let mut done = HashSet::new();
        for &start in self.edges.keys() {
            if done.contains(&start) {
                continue;
            }
            if let Some(cycle) = self.search_from(start, &mut done) {
                return Some(cycle);
            }
        }
        None
    }

    fn search_from(&self, start: TxnId, done: &mut HashSet<TxnId>) -> Option<Vec<TxnId>> {
        let mut path = vec![start];
        let mut on_path = HashSet::new();
        on_path.insert(start);
        let mut pending = vec![self.holders_of(start)];

        while let Some(next) = pending.last_mut() {
            match next.next() {
                Some(holder) if on_path.contains(&holder) => {
                    let pos = path.iter().position(|t| *t == holder)?;
                    return Some(path[pos..].to_vec());
                }
                Some(holder) if done.contains(&holder) => {}
                Some(holder) => {
                    path.push(holder);
                    on_path.insert(holder);
                    pending.push(self.holders_of(holder));
                }
                None => {
                    pending.pop();
                    if let Some(txn) = path.pop() {
                        on_path.remove(&txn);
                        done.insert(txn);
                    }
                }
            }
        }
        None
    }

    fn holders_of(&self, txn: TxnId) -> impl Iterator<Item = TxnId> + '_ {
        self.edges.get(&txn).into_iter().flatten().copied()
    }

    fn remove(&mut self, txn: TxnId) {
        self.edges.remove(&txn);
        for holders in self.edges.values_mut() {
            holders.remove(&txn);
        }
    }

    /// One victim per cycle: the youngest transaction on it. Victims are taken
    /// out of the graph before the next search.
    pub(crate) fn victims(mut self) -> Vec<TxnId> {
        let mut victims = Vec::new();
        while let Some(cycle) = self.find_cycle() {
            let victim = match cycle.iter().max() {
                Some(victim) => *victim,
                None => break,
            };
            debug!(?cycle, %victim, "deadlock cycle found");
            self.remove(victim);
            victims.push(victim);
        }
        victims
    }
}

pub struct DeadlockDetector {
    identity: ServiceIdentity,
    keeper: Arc<LockTableKeeper>,
    registry: Arc<dyn BindingRegistry>,
    transport: Arc<dyn LockTransport>,
    proxy: Arc<RemoteLockProxy>,
}

impl DeadlockDetector {
    pub fn new(
        identity: ServiceIdentity,
        keeper: Arc<LockTableKeeper>,
        registry: Arc<dyn BindingRegistry>,
        transport: Arc<dyn LockTransport>,
        proxy: Arc<RemoteLockProxy>,
    ) -> Self {
        Self {
            identity,
            keeper,
            registry,
            transport,
            proxy,
        }
    }

    /// Runs one detection pass and returns the transactions it aborted.
    pub async fn detect_once(&self) -> Vec<TxnId> {
        let edges = self.collect_edges().await;
        if edges.is_empty() {
            return Vec::new();
        }
        let victims = WaitForGraph::from_edges(&edges).victims();
        for &victim in &victims {
            let shards: BTreeSet<LockTableShard> = edges
                .iter()
                .filter(|e| e.waiter == victim)
                .map(|e| e.shard)
                .collect();
            warn!(%victim, ?shards, "aborting transaction to break deadlock");
            for shard in shards {
                self.abort(victim, shard).await;
            }
        }
        victims
    }

    async fn collect_edges(&self) -> Vec<WaitEdge> {
        let mut edges = self.keeper.wait_for_edges().await;

        let bindings = match self.registry.list().await {
            Ok(bindings) => bindings,
            Err(e) => {
                warn!(error = %e, "cannot list bindings, using local wait-for edges only");
                return edges;
            }
        };
        let peers: BTreeSet<String> = bindings
            .into_iter()
            .filter(|b| !b.is_owned_by(&self.identity.service_id))
            .map(|b| b.owner.service_address)
            .collect();
        let request = Request::WaitForEdges;
        let replies = join_all(
            peers
                .iter()
                .map(|address| call(self.transport.as_ref(), address, &request)),
        )
        .await;
        for (address, reply) in peers.iter().zip(replies) {
            match reply {
                Ok(Response::Edges(remote)) => edges.extend(remote),
                Ok(other) => warn!(%address, ?other, "unexpected wait-for edge response"),
                Err(e) => debug!(%address, error = %e, "skipping unreachable peer"),
            }
        }
        edges.sort();
        edges.dedup();
        edges
    }

    async fn abort(&self, txn: TxnId, shard: LockTableShard) {
        if let Some(table) = self.keeper.table(shard).await {
            table.abort_waiter(txn).await;
            return;
        }
        let request = Request::AbortWaiter { txn, shard };
        match self.proxy.forward(shard, request, Duration::ZERO).await {
            Ok(Forwarded::Response(_)) | Ok(Forwarded::NotRemote(_)) => {}
            Err(e) => warn!(%txn, %shard, error = %e, "failed to deliver deadlock abort"),
        }
    }
}

#[async_trait]
impl PeriodicRunnable for DeadlockDetector {
    async fn run_once(&self) {
        self.detect_once().await;
    }
}
