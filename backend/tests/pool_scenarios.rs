//! End-to-end pool behaviour against the in-process coordinator.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use vrf_proof_pool::allocation::{AllocationTable, Category, GameFamily};
use vrf_proof_pool::config::PoolSettings;
use vrf_proof_pool::error::{BatchFailureReason, PoolError};
use vrf_proof_pool::monitor::RefillOutcome;
use vrf_proof_pool::oracle::fake::{FakeFailure, FakeOracle};
use vrf_proof_pool::store::{JsonFileBackend, MemoryBackend, RecordBackend};
use vrf_proof_pool::{ProofPool, ProofState, ProofStore};

fn settings(call_timeout: Duration) -> PoolSettings {
    PoolSettings {
        batch_cooldown: Duration::ZERO,
        call_timeout,
        ..PoolSettings::default()
    }
}

async fn pool_with(
    table: &str,
    backend: Arc<dyn RecordBackend>,
    settings: PoolSettings,
) -> (Arc<ProofPool>, Arc<FakeOracle>) {
    let oracle = Arc::new(FakeOracle::new());
    let store = Arc::new(ProofStore::open(backend).await.unwrap());
    let pool = ProofPool::new(
        oracle.clone(),
        oracle.clone(),
        store,
        AllocationTable::parse(table).unwrap(),
        settings,
    );
    (Arc::new(pool), oracle)
}

async fn pool(table: &str) -> (Arc<ProofPool>, Arc<FakeOracle>) {
    pool_with(
        table,
        Arc::new(MemoryBackend::new()),
        settings(Duration::from_secs(5)),
    )
    .await
}

async fn deliver_all(pool: &ProofPool, oracle: &FakeOracle) {
    let correlator = pool.correlator();
    for event in oracle.drain_fulfillments() {
        correlator.handle(event).await;
    }
}

async fn wait_until_idle(pool: &ProofPool, category: &Category) {
    for _ in 0..200 {
        if !pool.monitor().is_in_flight(category) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("refill for {category} never finished");
}

#[tokio::test]
async fn empty_pool_fills_then_refills_below_threshold() {
    let (pool, oracle) = pool("MINES=50:25").await;
    let mines = Category::family(GameFamily::Mines);

    let results = pool.monitor().tick().await;
    assert_eq!(results.len(), 1);
    match &results[0].1 {
        RefillOutcome::Requested { deficit, outcome } => {
            assert_eq!(*deficit, 50);
            assert!(outcome.is_complete());
            assert_eq!(outcome.records.len(), 50);
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    assert_eq!(oracle.call_sizes(), vec![25, 25]);
    assert_eq!(pool.store().count_pending(&mines).await, 50);

    deliver_all(&pool, &oracle).await;
    assert_eq!(pool.store().count_active(&mines).await, 50);
    assert_eq!(pool.store().count_pending(&mines).await, 0);

    for _ in 0..25 {
        pool.acquire(&mines).await.unwrap();
    }
    // Still at threshold: nothing requested yet.
    assert_eq!(oracle.call_sizes(), vec![25, 25]);

    pool.acquire(&mines).await.unwrap();
    wait_until_idle(&pool, &mines).await;

    assert_eq!(oracle.call_sizes(), vec![25, 25, 25, 1]);
    let counts = pool.store().counts(&mines).await;
    assert_eq!(counts.active, 24);
    assert_eq!(counts.pending, 26);
    assert_eq!(counts.consumed, 26);
}

#[tokio::test]
async fn timed_out_sub_batch_leaves_remainder_for_next_tick() {
    let (pool, oracle) = pool_with(
        "MINES=50:40",
        Arc::new(MemoryBackend::new()),
        settings(Duration::from_millis(100)),
    )
    .await;
    let mines = Category::family(GameFamily::Mines);
    oracle.fail_call(1, FakeFailure::Stall);

    let results = pool.monitor().tick().await;
    let RefillOutcome::Requested { outcome, .. } = &results[0].1 else {
        panic!("unexpected outcome {:?}", results[0].1);
    };
    assert_eq!(outcome.records.len(), 25);
    assert_eq!(outcome.failed.len(), 1);
    assert_eq!(outcome.failed[0].index, 1);
    assert_eq!(outcome.failed[0].count, 25);
    assert_eq!(outcome.failed[0].reason, BatchFailureReason::Timeout);
    assert_eq!(pool.store().count_pending(&mines).await, 25);

    let results = pool.monitor().tick().await;
    match &results[0].1 {
        RefillOutcome::Requested { deficit, outcome } => {
            assert_eq!(*deficit, 25);
            assert!(outcome.is_complete());
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    assert_eq!(oracle.call_sizes(), vec![25, 25, 25]);
    // The tick also picked up the first 25, fulfilled while unnoticed.
    let counts = pool.store().counts(&mines).await;
    assert_eq!((counts.active, counts.pending), (25, 25));
}

#[tokio::test]
async fn lost_notifications_do_not_starve_a_category() {
    let (pool, oracle) = pool("MINES=4:2").await;
    let mines = Category::family(GameFamily::Mines);
    pool.monitor().tick().await;
    let mut delivered = oracle.drain_fulfillments();
    let lost = delivered.pop().unwrap();

    let correlator = pool.correlator();
    for event in delivered {
        correlator.handle(event).await;
    }
    for _ in 0..3 {
        pool.acquire(&mines).await.unwrap();
    }
    assert!(matches!(pool.acquire(&mines).await, Err(PoolError::Exhausted(_))));
    assert!(pool.store().pending_request_ids().await.contains(&lost.request_id));

    pool.monitor().tick().await;
    let record = pool.acquire(&mines).await.unwrap();
    assert_eq!(record.request_id, lost.request_id);
    assert_eq!(record.random_value, Some(lost.random_value));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_exhaustion_triggers_one_refill() {
    let (pool, oracle) = pool("WHEEL=50:25").await;
    let wheel = Category::family(GameFamily::Wheel);
    oracle.hold();

    let mut handles = Vec::new();
    for _ in 0..10 {
        let pool = pool.clone();
        let wheel = wheel.clone();
        handles.push(tokio::spawn(async move { pool.acquire(&wheel).await }));
    }
    for handle in handles {
        let result = handle.await.unwrap();
        assert!(matches!(result, Err(PoolError::Exhausted(_))));
    }

    oracle.release();
    wait_until_idle(&pool, &wheel).await;

    let metrics = pool.metrics();
    assert_eq!(metrics.refills_triggered.load(Ordering::SeqCst), 1);
    assert_eq!(metrics.exhaustions.load(Ordering::SeqCst), 10);
    assert_eq!(metrics.refills_coalesced.load(Ordering::SeqCst), 9);
    assert_eq!(oracle.call_sizes(), vec![25, 25]);
    assert_eq!(pool.store().count_pending(&wheel).await, 50);
}

#[tokio::test]
async fn records_are_conserved_across_states() {
    let (pool, oracle) = pool("PLINKO=20:10,ROULETTE=10:5").await;
    pool.monitor().tick().await;
    deliver_all(&pool, &oracle).await;

    let plinko = Category::family(GameFamily::Plinko);
    for _ in 0..7 {
        pool.acquire(&plinko).await.unwrap();
    }
    // Redelivery changes nothing.
    let correlator = pool.correlator();
    for id in 1..=5 {
        correlator.handle(oracle.fulfillment(id)).await;
    }

    let stats = pool.stats().await;
    let requested = pool.metrics().proofs_requested.load(Ordering::SeqCst) as usize;
    assert_eq!(requested, 30);
    assert_eq!(
        stats.total_pending + stats.total_active + stats.total_consumed,
        requested
    );
    assert_eq!(stats.total_consumed, 7);
}

#[tokio::test]
async fn sub_variants_are_served_from_their_own_stock() {
    let (pool, oracle) = pool("MINES/classic=4:2,MINES/hardcore=4:2").await;
    pool.monitor().tick().await;
    // One call per category, classic before hardcore.
    assert_eq!(oracle.call_sizes(), vec![4, 4]);
    deliver_all(&pool, &oracle).await;

    let hardcore = Category::variant(GameFamily::Mines, "hardcore");
    let record = pool.acquire(&hardcore).await.unwrap();
    assert_eq!(record.sub_variant.as_deref(), Some("hardcore"));
    assert_eq!(record.state, ProofState::Consumed);
    assert!(record.label.starts_with("mines_hardcore_"));

    let classic = Category::variant(GameFamily::Mines, "classic");
    assert_eq!(pool.store().count_active(&classic).await, 4);
    assert_eq!(pool.store().count_active(&hardcore).await, 3);
}

#[tokio::test]
async fn inventory_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("proofs.json");
    let roulette = Category::family(GameFamily::Roulette);

    let consumed = {
        let backend = Arc::new(JsonFileBackend::open(&path).await.unwrap());
        let (pool, oracle) = pool_with("ROULETTE=6:3", backend, settings(Duration::from_secs(5))).await;
        pool.monitor().tick().await;
        deliver_all(&pool, &oracle).await;
        pool.acquire(&roulette).await.unwrap()
    };

    let backend = Arc::new(JsonFileBackend::open(&path).await.unwrap());
    let (pool, _) = pool_with("ROULETTE=6:3", backend, settings(Duration::from_secs(5))).await;
    let counts = pool.store().counts(&roulette).await;
    assert_eq!(counts.active, 5);
    assert_eq!(counts.consumed, 1);

    let next = pool.acquire(&roulette).await.unwrap();
    assert_ne!(next.id, consumed.id);
    assert_eq!(next.state, ProofState::Consumed);
}
