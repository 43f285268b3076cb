//! The VRF coordinator as seen from the pool.
//!
//! A request call submits one `(category_id, label)` pair per proof and
//! returns a receipt whose log lines carry one `RandomWordsRequested` entry
//! per pair. Fulfillments arrive later and separately, as
//! `RandomWordsFulfilled` log entries (see [`crate::listener`]).

pub mod fake;
pub mod logs;
pub mod solana;

use async_trait::async_trait;
use thiserror::Error;

use crate::correlator::FulfillmentEvent;
use crate::record::RequestId;

/// Outcome of a confirmed request call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallReceipt {
    /// Transaction signature.
    pub transaction_ref: String,
    /// Slot the transaction landed in.
    pub block_ref: u64,
    /// Program log lines emitted by the call.
    pub logs: Vec<String>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OracleError {
    /// Transport or confirmation failure; the call may be retried.
    #[error("{0}")]
    Network(String),
    /// The coordinator refused the call.
    #[error("{0}")]
    Rejected(String),
}

#[async_trait]
pub trait Oracle: Send + Sync {
    /// Submit one batch request. `category_ids` and `labels` have equal
    /// length, at most the coordinator's per-call maximum.
    async fn request_batch(
        &self,
        category_ids: &[u8],
        labels: &[String],
    ) -> Result<CallReceipt, OracleError>;

    /// Fulfillments the coordinator has already recorded for any of
    /// `request_ids`. Ids still unfulfilled are simply absent.
    async fn fulfillments(
        &self,
        request_ids: &[RequestId],
    ) -> Result<Vec<FulfillmentEvent>, OracleError>;
}

/// Whether a signer is ready to pay for and sign request calls.
pub trait SignerStatus: Send + Sync {
    fn is_available(&self) -> bool;
}
