use std::{sync::Arc, time::Duration};

use lockservice::{
    ClusterBindingRegistry, Config, InProcessTransport, KeyRange, LockError, LockMode,
    LockService, LockTableShard, ManualClock, PayloadHandler, TxnId,
};

const LEASE: Duration = Duration::from_secs(1);
const WAIT: Duration = Duration::from_secs(10);

struct Cluster {
    clock: ManualClock,
    registry: Arc<ClusterBindingRegistry>,
    transport: Arc<InProcessTransport>,
    nodes: Vec<Arc<LockService>>,
}

impl Cluster {
    async fn new(size: usize) -> Self {
        Self::with_config(size, |_| {}).await
    }

    async fn with_config(size: usize, tweak: impl Fn(&mut Config)) -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("lockservice=debug")
            .with_test_writer()
            .try_init();

        let clock = ManualClock::new(1_000_000);
        let registry = Arc::new(ClusterBindingRegistry::new(LEASE, Arc::new(clock.clone())));
        let transport = Arc::new(InProcessTransport::new());
        let mut nodes = Vec::new();
        for i in 1..=size {
            let mut config = Config::new(format!("cn-{}", i), format!("cn-{}:6001", i));
            config.keep_lock_table_bind_duration = LEASE;
            config.keep_remote_lock_duration = Duration::from_millis(50);
            config.remote_retry_backoff = Duration::from_millis(5);
            tweak(&mut config);
            let address = config.service_address.clone();
            let node = Arc::new(
                LockService::new(config, registry.clone(), transport.clone(), Arc::new(clock.clone()))
                    .unwrap(),
            );
            let handler: Arc<dyn PayloadHandler> = node.clone();
            transport.register(address, handler).await;
            nodes.push(node);
        }
        Self {
            clock,
            registry,
            transport,
            nodes,
        }
    }

    fn node(&self, i: usize) -> &Arc<LockService> {
        &self.nodes[i - 1]
    }
}

async fn wait_for_waiters(node: &LockService, shard: LockTableShard, count: usize) {
    let table = node.keeper().table(shard).await.unwrap();
    tokio::time::timeout(WAIT, async {
        while table.waiter_count().await < count {
            tokio::task::yield_now().await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn remote_lock_waits_on_the_owning_node() {
    let c = Cluster::new(2).await;
    let shard = LockTableShard::new(0, 100);
    let (n1, n2) = (c.node(1).clone(), c.node(2).clone());

    n1.lock(TxnId(1), shard, KeyRange::new("a", "m"), LockMode::Exclusive, WAIT)
        .await
        .unwrap();
    assert!(n1.keeper().table(shard).await.is_some());

    let remote = tokio::spawn({
        let n2 = n2.clone();
        async move {
            n2.lock(TxnId(2), shard, KeyRange::point("c"), LockMode::Exclusive, WAIT)
                .await
        }
    });
    wait_for_waiters(&n1, shard, 1).await;
    assert!(n2.keeper().table(shard).await.is_none());

    n1.unlock(TxnId(1), None).await.unwrap();
    remote.await.unwrap().unwrap();
    let table = n1.keeper().table(shard).await.unwrap();
    assert!(table.is_held(TxnId(2), b"c").await);
    assert!(n2.txn_lock_set(TxnId(2)).await.unwrap().shards.contains(&shard));

    // the remote holder releases through its own node
    n2.unlock(TxnId(2), None).await.unwrap();
    assert!(!table.is_held(TxnId(2), b"c").await);
}

#[tokio::test]
async fn disjoint_ranges_across_nodes_never_block() {
    let c = Cluster::new(2).await;
    let shard = LockTableShard::new(0, 100);
    c.node(1)
        .lock(TxnId(1), shard, KeyRange::new("a", "c"), LockMode::Exclusive, WAIT)
        .await
        .unwrap();
    let waited = c
        .node(2)
        .lock(TxnId(2), shard, KeyRange::new("d", "f"), LockMode::Exclusive, WAIT)
        .await
        .unwrap();
    assert_eq!(waited, Duration::ZERO);
    assert!(!c
        .node(2)
        .try_lock(TxnId(3), shard, KeyRange::point("b"), LockMode::Shared)
        .await
        .unwrap());
}

#[tokio::test]
async fn cross_node_deadlock_aborts_exactly_one() {
    let c = Cluster::new(2).await;
    let (n1, n2) = (c.node(1).clone(), c.node(2).clone());
    let x = LockTableShard::new(0, 1);
    let y = LockTableShard::new(0, 2);

    n1.lock(TxnId(1), x, KeyRange::point("x"), LockMode::Exclusive, WAIT)
        .await
        .unwrap();
    n2.lock(TxnId(2), y, KeyRange::point("y"), LockMode::Exclusive, WAIT)
        .await
        .unwrap();

    let t1 = tokio::spawn({
        let n1 = n1.clone();
        async move { n1.lock(TxnId(1), y, KeyRange::point("y"), LockMode::Exclusive, WAIT).await }
    });
    let t2 = tokio::spawn({
        let n2 = n2.clone();
        async move { n2.lock(TxnId(2), x, KeyRange::point("x"), LockMode::Exclusive, WAIT).await }
    });
    wait_for_waiters(&n1, x, 1).await;
    wait_for_waiters(&n2, y, 1).await;

    let victims = n1.detector().detect_once().await;
    assert_eq!(victims, vec![TxnId(2)]);
    assert_eq!(
        t2.await.unwrap(),
        Err(LockError::DeadlockAbort { txn: TxnId(2) })
    );

    // the victim's executor aborts it, and the survivor gets its lock
    n2.unlock(TxnId(2), None).await.unwrap();
    t1.await.unwrap().unwrap();
    assert!(n2
        .keeper()
        .table(y)
        .await
        .unwrap()
        .is_held(TxnId(1), b"y")
        .await);
}

#[tokio::test]
async fn background_detector_breaks_local_deadlock() {
    let c = Cluster::with_config(1, |config| {
        config.deadlock_detect_interval = Duration::from_millis(20);
    })
    .await;
    let n1 = c.node(1).clone();
    n1.start().await;
    let shard = LockTableShard::new(3, 3);

    n1.lock(TxnId(10), shard, KeyRange::point("a"), LockMode::Exclusive, WAIT)
        .await
        .unwrap();
    n1.lock(TxnId(11), shard, KeyRange::point("b"), LockMode::Exclusive, WAIT)
        .await
        .unwrap();
    let older = tokio::spawn({
        let n1 = n1.clone();
        async move { n1.lock(TxnId(10), shard, KeyRange::point("b"), LockMode::Exclusive, WAIT).await }
    });
    let younger = tokio::spawn({
        let n1 = n1.clone();
        async move { n1.lock(TxnId(11), shard, KeyRange::point("a"), LockMode::Exclusive, WAIT).await }
    });

    let aborted = tokio::time::timeout(WAIT, younger).await.unwrap().unwrap();
    assert_eq!(aborted, Err(LockError::DeadlockAbort { txn: TxnId(11) }));
    n1.unlock(TxnId(11), None).await.unwrap();
    tokio::time::timeout(WAIT, older).await.unwrap().unwrap().unwrap();
    n1.shutdown().await;
}

#[tokio::test]
async fn expired_lease_moves_shard_to_another_node() {
    let c = Cluster::new(2).await;
    let (n1, n2) = (c.node(1).clone(), c.node(2).clone());
    let shard = LockTableShard::new(1, 7);

    n1.lock(TxnId(1), shard, KeyRange::point("k"), LockMode::Exclusive, WAIT)
        .await
        .unwrap();
    let first = c.registry_binding(shard).await;

    // renewals inside the lease keep the owner and version
    for _ in 0..3 {
        c.clock.advance(LEASE / 2);
        n1.keeper().renew_all().await;
    }
    assert_eq!(c.registry_binding(shard).await.version, first.version);

    // node 1 stops renewing; once the lease is gone node 2 can take over
    c.clock.advance(LEASE);
    n2.lock(TxnId(2), shard, KeyRange::point("z"), LockMode::Exclusive, WAIT)
        .await
        .unwrap();
    let second = c.registry_binding(shard).await;
    assert!(second.is_owned_by("cn-2"));
    assert!(second.version > first.version);

    // node 1 learns it lost the shard and now forwards to node 2
    n1.keeper().renew_all().await;
    assert!(n1.keeper().table(shard).await.is_none());
    assert!(!n1
        .try_lock(TxnId(3), shard, KeyRange::point("z"), LockMode::Shared)
        .await
        .unwrap());
    assert!(n1
        .try_lock(TxnId(3), shard, KeyRange::point("y"), LockMode::Shared)
        .await
        .unwrap());
    assert!(n2.keeper().table(shard).await.unwrap().is_held(TxnId(3), b"y").await);
}

#[tokio::test]
async fn stale_cached_binding_is_refreshed() {
    let c = Cluster::with_config(3, |config| {
        config.keep_remote_lock_duration = WAIT;
    })
    .await;
    let (n1, n2, n3) = (c.node(1).clone(), c.node(2).clone(), c.node(3).clone());
    let shard = LockTableShard::new(2, 9);

    n1.lock(TxnId(1), shard, KeyRange::point("a"), LockMode::Shared, WAIT)
        .await
        .unwrap();
    // node 2 caches node 1 as the owner
    n2.lock(TxnId(2), shard, KeyRange::point("b"), LockMode::Shared, WAIT)
        .await
        .unwrap();

    c.clock.advance(LEASE);
    n3.lock(TxnId(3), shard, KeyRange::point("c"), LockMode::Exclusive, WAIT)
        .await
        .unwrap();
    n1.keeper().renew_all().await;

    // node 2's cached entry still names node 1, which answers stale
    n2.lock(TxnId(4), shard, KeyRange::point("d"), LockMode::Exclusive, WAIT)
        .await
        .unwrap();
    assert!(n3.keeper().table(shard).await.unwrap().is_held(TxnId(4), b"d").await);
}

#[tokio::test]
async fn unreachable_owner_surfaces_remote_unavailable() {
    let c = Cluster::new(2).await;
    let shard = LockTableShard::new(0, 5);
    c.node(2)
        .lock(TxnId(1), shard, KeyRange::point("k"), LockMode::Exclusive, WAIT)
        .await
        .unwrap();
    c.transport.partition("cn-2:6001").await;

    let err = c
        .node(1)
        .lock(TxnId(2), shard, KeyRange::point("q"), LockMode::Exclusive, WAIT)
        .await
        .unwrap_err();
    assert!(matches!(err, LockError::RemoteUnavailable { .. }), "{:?}", err);

    c.transport.heal("cn-2:6001").await;
    c.node(1)
        .lock(TxnId(2), shard, KeyRange::point("q"), LockMode::Exclusive, WAIT)
        .await
        .unwrap();
}

#[tokio::test]
async fn remote_timeout_is_reported_to_the_requester() {
    let c = Cluster::new(2).await;
    let shard = LockTableShard::new(0, 6);
    c.node(1)
        .lock(TxnId(1), shard, KeyRange::point("k"), LockMode::Exclusive, WAIT)
        .await
        .unwrap();
    let err = c
        .node(2)
        .lock(TxnId(2), shard, KeyRange::point("k"), LockMode::Exclusive, Duration::from_millis(30))
        .await
        .unwrap_err();
    assert!(matches!(err, LockError::LockTimeout { txn: TxnId(2), .. }));
    let table = c.node(1).keeper().table(shard).await.unwrap();
    assert_eq!(table.waiter_count().await, 0);
}

#[tokio::test]
async fn node_with_lapsed_lease_stops_granting_locally() {
    let c = Cluster::new(2).await;
    let (n1, n2) = (c.node(1).clone(), c.node(2).clone());
    let shard = LockTableShard::new(1, 8);

    n1.lock(TxnId(1), shard, KeyRange::point("k"), LockMode::Exclusive, WAIT)
        .await
        .unwrap();

    // node 1 never renews; node 2 takes the shard and locks "z"
    c.clock.advance(LEASE * 2);
    n2.lock(TxnId(2), shard, KeyRange::point("z"), LockMode::Exclusive, WAIT)
        .await
        .unwrap();

    // node 1 still has its old table, but must not grant from it
    assert!(!n1
        .try_lock(TxnId(5), shard, KeyRange::point("z"), LockMode::Exclusive)
        .await
        .unwrap());
    assert!(n1.keeper().table(shard).await.is_none());
    let table = n2.keeper().table(shard).await.unwrap();
    assert!(table.is_held(TxnId(2), b"z").await);
    assert!(!table.is_held(TxnId(5), b"z").await);
}

#[tokio::test]
async fn remote_lock_without_deadline_is_granted() {
    let c = Cluster::new(2).await;
    let shard = LockTableShard::new(0, 11);
    c.node(1)
        .lock(TxnId(1), shard, KeyRange::point("a"), LockMode::Shared, WAIT)
        .await
        .unwrap();
    let waited = c
        .node(2)
        .lock(TxnId(2), shard, KeyRange::point("a"), LockMode::Shared, Duration::MAX)
        .await
        .unwrap();
    assert_eq!(waited, Duration::ZERO);
    assert!(c.node(1).keeper().table(shard).await.unwrap().is_held(TxnId(2), b"a").await);
}

#[tokio::test]
async fn holder_relocks_and_upgrades_past_remote_waiter() {
    let c = Cluster::new(2).await;
    let (n1, n2) = (c.node(1).clone(), c.node(2).clone());
    let shard = LockTableShard::new(0, 12);

    n1.lock(TxnId(1), shard, KeyRange::new("a", "f"), LockMode::Shared, WAIT)
        .await
        .unwrap();
    let remote = tokio::spawn({
        let n2 = n2.clone();
        async move {
            n2.lock(TxnId(2), shard, KeyRange::point("c"), LockMode::Exclusive, WAIT)
                .await
        }
    });
    wait_for_waiters(&n1, shard, 1).await;

    assert!(n1
        .try_lock(TxnId(1), shard, KeyRange::point("c"), LockMode::Shared)
        .await
        .unwrap());
    assert!(n1
        .try_lock(TxnId(1), shard, KeyRange::point("c"), LockMode::Exclusive)
        .await
        .unwrap());

    n1.unlock(TxnId(1), None).await.unwrap();
    remote.await.unwrap().unwrap();
}

impl Cluster {
    async fn registry_binding(&self, shard: LockTableShard) -> lockservice::Binding {
        use lockservice::BindingRegistry;
        self.registry.query(shard).await.unwrap().unwrap()
    }
}
