//! Application configuration loaded from environment variables.
//!
//! Required (Solana mode): `PROGRAM_ID`
//! Optional: `RPC_URL`, `WS_URL`, `PAYER_KEYPAIR_PATH`, `SUBSCRIPTION_ID`,
//!           `CLUSTER`, `HTTP_PORT`, `MAX_RETRIES`, `INITIAL_RETRY_DELAY_MS`,
//!           `PRIORITY_FEE_MICRO_LAMPORTS`, `MAX_PER_CALL`, `BATCH_COOLDOWN_MS`,
//!           `CALL_TIMEOUT_SECS`, `REFILL_INTERVAL_SECS`, `STORE_PATH`,
//!           `ALLOCATIONS`, `RETENTION_DAYS`, `ORACLE_MODE`

use anyhow::{Context, Result, bail};
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::{Keypair, read_keypair_file};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::allocation::AllocationTable;

/// Items the coordinator accepts in one request call.
pub const DEFAULT_MAX_PER_CALL: u32 = 25;

/// Knobs of the pool itself, independent of the chain binding.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    /// Maximum proofs per oracle call.
    pub max_per_call: u32,
    /// Pause between consecutive sub-batch calls.
    pub batch_cooldown: Duration,
    /// Execution timeout of one oracle call, confirmation included.
    pub call_timeout: Duration,
    /// Period of the refill monitor's tick.
    pub refill_interval: Duration,
    /// Consumed records older than this are pruned on every tick.
    pub retention: Option<chrono::Duration>,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_per_call: DEFAULT_MAX_PER_CALL,
            batch_cooldown: Duration::from_secs(2),
            call_timeout: Duration::from_secs(90),
            refill_interval: Duration::from_secs(60),
            retention: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OracleMode {
    /// Real coordinator over Solana RPC.
    Solana,
    /// In-process fake coordinator with automatic fulfillment.
    Fake,
}

impl FromStr for OracleMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "solana" => Ok(Self::Solana),
            "fake" => Ok(Self::Fake),
            other => bail!("unknown ORACLE_MODE: {other}"),
        }
    }
}

/// Application configuration for the proof pool service.
#[derive(Clone)]
pub struct AppConfig {
    /// Solana JSON-RPC endpoint (HTTP).
    pub rpc_url: String,
    /// Solana PubSub endpoint (WebSocket) for log subscriptions.
    pub ws_url: String,
    /// Keypair paying for request calls. `None` leaves the signer unavailable.
    pub payer_keypair: Option<Arc<Keypair>>,
    /// The deployed VRF coordinator program ID.
    pub program_id: Pubkey,
    /// Coordinator subscription funding the requests.
    pub subscription_id: u64,
    /// Cluster name for explorer URLs.
    pub cluster: String,
    /// HTTP server port.
    pub http_port: u16,
    /// Maximum send attempts per request call.
    pub max_retries: u32,
    /// Initial retry delay in milliseconds.
    pub initial_retry_delay_ms: u64,
    /// Priority fee in micro-lamports per compute unit.
    pub priority_fee_micro_lamports: u64,
    /// JSON document holding the proof inventory.
    pub store_path: PathBuf,
    /// Per-category inventory targets.
    pub allocations: AllocationTable,
    pub oracle_mode: OracleMode,
    pub pool: PoolSettings,
}

fn env_parse<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let rpc_url = std::env::var("RPC_URL").unwrap_or_else(|_| "http://127.0.0.1:8899".into());
        let ws_url = std::env::var("WS_URL").unwrap_or_else(|_| "ws://127.0.0.1:8900".into());

        let oracle_mode = match std::env::var("ORACLE_MODE") {
            Ok(v) => v.parse()?,
            Err(_) => OracleMode::Solana,
        };

        let keypair_path = std::env::var("PAYER_KEYPAIR_PATH")
            .unwrap_or_else(|_| "~/.config/solana/id.json".into());
        let keypair_path = shellexpand::tilde(&keypair_path).to_string();
        let payer_keypair = match read_keypair_file(&keypair_path) {
            Ok(kp) => Some(Arc::new(kp)),
            Err(e) => {
                warn!(path = %keypair_path, error = %e, "Payer keypair unavailable, requests disabled");
                None
            }
        };

        let program_id = match (std::env::var("PROGRAM_ID"), oracle_mode) {
            (Ok(s), _) => {
                Pubkey::from_str(&s).with_context(|| format!("invalid PROGRAM_ID: {s}"))?
            }
            (Err(_), OracleMode::Fake) => Pubkey::default(),
            (Err(_), OracleMode::Solana) => bail!("PROGRAM_ID env var must be set"),
        };

        let allocations = match std::env::var("ALLOCATIONS") {
            Ok(raw) => AllocationTable::parse(&raw).context("invalid ALLOCATIONS")?,
            Err(_) => AllocationTable::default(),
        };

        let retention = std::env::var("RETENTION_DAYS")
            .ok()
            .map(|v| v.parse::<i64>().with_context(|| format!("invalid RETENTION_DAYS: {v}")))
            .transpose()?
            .map(chrono::Duration::days);

        let max_per_call = env_parse("MAX_PER_CALL", DEFAULT_MAX_PER_CALL);
        if max_per_call == 0 {
            bail!("MAX_PER_CALL must be positive");
        }

        let pool = PoolSettings {
            max_per_call,
            batch_cooldown: Duration::from_millis(env_parse("BATCH_COOLDOWN_MS", 2_000)),
            call_timeout: Duration::from_secs(env_parse("CALL_TIMEOUT_SECS", 90)),
            refill_interval: Duration::from_secs(env_parse("REFILL_INTERVAL_SECS", 60)),
            retention,
        };

        Ok(Self {
            rpc_url,
            ws_url,
            payer_keypair,
            program_id,
            subscription_id: env_parse("SUBSCRIPTION_ID", 1),
            cluster: std::env::var("CLUSTER").unwrap_or_else(|_| "devnet".into()),
            http_port: env_parse("HTTP_PORT", 8080),
            max_retries: env_parse("MAX_RETRIES", 5),
            initial_retry_delay_ms: env_parse("INITIAL_RETRY_DELAY_MS", 500),
            priority_fee_micro_lamports: env_parse("PRIORITY_FEE_MICRO_LAMPORTS", 0),
            store_path: std::env::var("STORE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data/proofs.json")),
            allocations,
            oracle_mode,
            pool,
        })
    }

    /// Return the Solscan explorer URL for a given transaction signature.
    pub fn explorer_url(&self, signature: &str) -> String {
        match self.cluster.as_str() {
            "mainnet-beta" => format!("https://solscan.io/tx/{signature}"),
            cluster => format!("https://solscan.io/tx/{signature}?cluster={cluster}"),
        }
    }
}
