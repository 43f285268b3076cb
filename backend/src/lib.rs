//! Pre-generated VRF proof pool.
//!
//! Keeps a stock of fulfilled randomness proofs per game category so game
//! rounds never wait on the coordinator. Requests are batched, fulfillments
//! arrive asynchronously and are matched back by request id, and a refill
//! monitor tops each category back up to its target.

pub mod allocation;
pub mod batcher;
pub mod config;
pub mod correlator;
pub mod error;
pub mod events;
pub mod listener;
pub mod metrics;
pub mod monitor;
pub mod oracle;
pub mod pool;
pub mod record;
pub mod store;
pub mod vrf;

pub use allocation::{Allocation, AllocationTable, Category, GameFamily};
pub use correlator::{FulfillmentCorrelator, FulfillmentEvent};
pub use error::{PoolError, PoolResult};
pub use events::PoolEvent;
pub use pool::{PoolStats, ProofPool};
pub use record::{ProofRecord, ProofState};
pub use store::ProofStore;
