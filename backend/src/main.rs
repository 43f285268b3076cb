//! VRF Proof Pool service
//!
//! Keeps per-category stocks of fulfilled VRF proofs ready for game rounds.
//! Runs four concurrent subsystems:
//!
//! - **Listener**: WebSocket subscription to fulfillment events + startup catch-up scan.
//! - **Correlator**: Applies fulfillments to pending records.
//! - **Refill monitor**: Periodically tops categories back up to their targets.
//! - **HTTP server**: Probes, stats, metrics, backup export and proof acquisition.

use actix_web::{App, HttpResponse, HttpServer, web};
use solana_sdk::signature::Signer;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use vrf_proof_pool::config::{AppConfig, OracleMode};
use vrf_proof_pool::listener;
use vrf_proof_pool::oracle::fake::FakeOracle;
use vrf_proof_pool::oracle::solana::SolanaOracle;
use vrf_proof_pool::oracle::{Oracle, SignerStatus};
use vrf_proof_pool::store::JsonFileBackend;
use vrf_proof_pool::{Category, PoolError, PoolEvent, ProofPool, ProofStore};

/// Delay before the fake coordinator fulfills a call.
const FAKE_FULFILL_DELAY: Duration = Duration::from_millis(500);

/// Shared application state accessible from HTTP handlers.
struct AppState {
    pool: Arc<ProofPool>,
}

/// Liveness probe: returns 200 if the process is running.
async fn health() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({"status": "ok"}))
}

/// Inventory counts per category plus refills currently in flight.
async fn status(data: web::Data<AppState>) -> HttpResponse {
    let stats = data.pool.stats().await;
    let in_flight: Vec<String> = data
        .pool
        .monitor()
        .in_flight()
        .iter()
        .map(ToString::to_string)
        .collect();
    HttpResponse::Ok().json(serde_json::json!({
        "status": "running",
        "signer_available": data.pool.monitor().signer_available(),
        "refills_in_flight": in_flight,
        "inventory": stats,
    }))
}

async fn metrics(data: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(data.pool.metrics().to_json())
}

/// Full JSON backup of the store.
async fn export(data: web::Data<AppState>) -> HttpResponse {
    match data.pool.store().export_json().await {
        Ok(doc) => HttpResponse::Ok()
            .content_type("application/json")
            .body(doc),
        Err(e) => error_response(&e),
    }
}

/// Take one proof for the category in the path, e.g. `mines` or `wheel/classic`.
async fn acquire(data: web::Data<AppState>, path: web::Path<String>) -> HttpResponse {
    let raw = path.into_inner();
    let category: Category = match raw.parse() {
        Ok(category) => category,
        Err(e) => return error_response(&e),
    };
    match data.pool.acquire(&category).await {
        Ok(record) => HttpResponse::Ok().json(serde_json::json!({
            "random_value_hex": record.random_value_hex(),
            "record": record,
        })),
        Err(e) => error_response(&e),
    }
}

fn error_response(err: &PoolError) -> HttpResponse {
    let (mut builder, code) = match err {
        PoolError::Exhausted(_) => (HttpResponse::Conflict(), "exhausted"),
        PoolError::SignerUnavailable => (HttpResponse::ServiceUnavailable(), "signer_unavailable"),
        PoolError::UnknownCategory(_) => (HttpResponse::BadRequest(), "unknown_category"),
        _ => (HttpResponse::InternalServerError(), "internal"),
    };
    builder.json(serde_json::json!({"error": code, "message": err.to_string()}))
}

/// Log pool events at debug level so the feed is visible with `RUST_LOG=debug`.
async fn log_events(mut rx: tokio::sync::broadcast::Receiver<PoolEvent>) {
    use tokio::sync::broadcast::error::RecvError;
    loop {
        match rx.recv().await {
            Ok(event) => match &event {
                PoolEvent::BatchFailed { category, index, count, reason } => {
                    warn!(category = %category, index, count, reason = %reason, "Sub-batch failed");
                }
                other => tracing::debug!(event = ?other, "Pool event"),
            },
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "Event log lagged"),
            Err(RecvError::Closed) => return,
        }
    }
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,solana_client=warn,solana_rpc_client=warn,hyper=warn")),
        )
        .with_target(true)
        .with_ansi(true)
        .init();

    let config = AppConfig::from_env()?;

    info!(
        mode = ?config.oracle_mode,
        program = %config.program_id,
        payer = ?config.payer_keypair.as_ref().map(|kp| kp.pubkey()),
        "Starting VRF proof pool"
    );
    for (category, allocation) in config.allocations.iter() {
        info!(
            category = %category,
            target = allocation.target,
            refill_threshold = allocation.refill_threshold,
            "Allocation configured"
        );
    }

    let backend = JsonFileBackend::open(&config.store_path).await?;
    let store = Arc::new(ProofStore::open(Arc::new(backend)).await?);
    info!(path = %config.store_path.display(), "Proof store opened");

    let (tx, rx) = mpsc::channel(256);

    let (oracle, signer): (Arc<dyn Oracle>, Arc<dyn SignerStatus>) = match config.oracle_mode {
        OracleMode::Solana => {
            info!(rpc = %config.rpc_url, ws = %config.ws_url, "Endpoints configured");
            let oracle = Arc::new(SolanaOracle::new(config.clone()));
            (oracle.clone(), oracle)
        }
        OracleMode::Fake => {
            warn!("Using the in-process fake coordinator, proofs are not verifiable");
            let oracle = Arc::new(FakeOracle::new().with_auto_fulfill(tx.clone(), FAKE_FULFILL_DELAY));
            (oracle.clone(), oracle)
        }
    };

    let pool = Arc::new(ProofPool::new(
        oracle,
        signer,
        store.clone(),
        config.allocations.clone(),
        config.pool.clone(),
    ));

    tokio::spawn(log_events(pool.subscribe()));

    // Background: apply fulfillments to pending records.
    let correlator = pool.correlator();
    tokio::spawn(async move {
        correlator.run(rx).await;
    });

    if config.oracle_mode == OracleMode::Solana {
        // Background: stream on-chain fulfillments to the correlator, with a
        // catch-up scan after every (re)connect.
        let listener_config = config.clone();
        let listener_tx = tx.clone();
        let payer = config.payer_keypair.as_ref().map(|kp| kp.pubkey());
        tokio::spawn(async move {
            listener::listen_for_fulfillments(listener_config, payer, listener_tx).await;
        });
    }
    drop(tx);

    let pending = store.pending_request_ids().await;
    if !pending.is_empty() {
        info!(count = pending.len(), "Pending requests awaiting fulfillment, reconciled on each tick");
    }

    // Background: periodic reconcile, retention prune and refill ticks.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let monitor = pool.monitor().clone();
    let refill_interval = config.pool.refill_interval;
    let monitor_task = tokio::spawn(async move {
        monitor.run(refill_interval, shutdown_rx).await;
    });

    let state = web::Data::new(AppState { pool: pool.clone() });
    let addr = ("0.0.0.0", config.http_port);

    info!(port = config.http_port, "Starting HTTP server");

    let server = HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .route("/health", web::get().to(health))
            .route("/status", web::get().to(status))
            .route("/metrics", web::get().to(metrics))
            .route("/export", web::get().to(export))
            .route("/acquire/{category:.+}", web::post().to(acquire))
    })
    .bind(addr)?
    .run();

    let server_result = server.await;

    info!("HTTP server stopped, shutting down refill monitor");
    let _ = shutdown_tx.send(true);
    if let Err(e) = monitor_task.await {
        error!(error = %e, "Refill monitor task failed");
    }

    server_result?;
    Ok(())
}
