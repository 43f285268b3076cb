//! Error types for the proof pool.
//!
//! [`PoolError`] is what the pool's operations return. Sub-batch failures
//! are not errors of the whole request: they are collected as
//! [`SubBatchFailure`] values inside a successful batch outcome.

use thiserror::Error;

use crate::allocation::Category;
use crate::record::{ProofState, RequestId};

/// Result alias for pool operations.
pub type PoolResult<T> = Result<T, PoolError>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// The category has no allocation configured.
    #[error("unknown category: {0}")]
    UnknownCategory(String),

    /// An allocation entry violates `0 < threshold < target`, or overlaps
    /// another entry.
    #[error("invalid allocation for {category}: {reason}")]
    InvalidAllocation { category: String, reason: String },

    /// A proof request asked for zero proofs.
    #[error("proof count must be positive")]
    InvalidCount,

    /// No signer is available to submit oracle requests.
    #[error("signer unavailable")]
    SignerUnavailable,

    /// A pending or active record already carries this request id.
    #[error("duplicate request id {0}")]
    DuplicateRequestId(RequestId),

    /// No pending record carries this request id.
    #[error("unknown request id {0}")]
    UnknownRequestId(RequestId),

    /// No active proof is left for the category.
    #[error("no active proofs for {0}, try again shortly")]
    Exhausted(Category),

    /// A record was asked to move against the state machine.
    #[error("invalid transition from {from} to {to}")]
    InvalidTransition { from: ProofState, to: ProofState },

    /// The persistence backend failed.
    #[error("storage error: {0}")]
    Storage(String),
}

impl PoolError {
    pub fn storage(err: impl std::fmt::Display) -> Self {
        Self::Storage(err.to_string())
    }
}

/// Why a single sub-batch produced no (or too few) records.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BatchFailureReason {
    #[error("network failure: {0}")]
    Network(String),

    #[error("rejected by oracle: {0}")]
    Rejected(String),

    #[error("oracle call timed out")]
    Timeout,

    #[error("signer became unavailable")]
    SignerUnavailable,

    #[error("receipt parse failure: {0}")]
    ReceiptParse(String),

    #[error("storage failure: {0}")]
    Storage(String),
}

/// One failed sub-batch of a proof request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubBatchFailure {
    pub category: Category,
    /// Zero-based sub-batch index within the request.
    pub index: usize,
    /// Number of proofs this failure leaves unrequested.
    pub count: u32,
    pub reason: BatchFailureReason,
}
