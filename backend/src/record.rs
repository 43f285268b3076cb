//! The proof record and its three-state lifecycle.
//!
//! ```text
//! Pending --fulfill--> Active --consume--> Consumed
//! ```
//!
//! `random_value` is present exactly when the record is `Active` or
//! `Consumed`; every timestamp is written once.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::allocation::{Category, GameFamily};
use crate::error::{PoolError, PoolResult};

/// Oracle-assigned request identifier.
pub type RequestId = u64;

/// 32-byte randomness delivered by the oracle.
pub type RandomValue = [u8; 32];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProofState {
    Pending,
    Active,
    Consumed,
}

impl fmt::Display for ProofState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Consumed => "consumed",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofRecord {
    pub id: Uuid,
    pub family: GameFamily,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_variant: Option<String>,
    /// Label sent to the oracle with the request.
    pub label: String,
    pub request_id: RequestId,
    /// Signature of the request transaction.
    pub transaction_ref: String,
    /// Slot the request transaction landed in.
    pub block_ref: u64,
    pub random_value: Option<RandomValue>,
    pub state: ProofState,
    pub requested_at: DateTime<Utc>,
    pub fulfilled_at: Option<DateTime<Utc>>,
    pub consumed_at: Option<DateTime<Utc>>,
}

impl ProofRecord {
    /// A freshly requested record, not yet fulfilled.
    pub fn pending(
        category: &Category,
        label: String,
        request_id: RequestId,
        transaction_ref: String,
        block_ref: u64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            family: category.family,
            sub_variant: category.variant.clone(),
            label,
            request_id,
            transaction_ref,
            block_ref,
            random_value: None,
            state: ProofState::Pending,
            requested_at: Utc::now(),
            fulfilled_at: None,
            consumed_at: None,
        }
    }

    /// The narrowest category this record belongs to.
    pub fn category(&self) -> Category {
        Category {
            family: self.family,
            variant: self.sub_variant.clone(),
        }
    }

    pub fn fulfill(&mut self, value: RandomValue, at: DateTime<Utc>) -> PoolResult<()> {
        self.expect_state(ProofState::Pending, ProofState::Active)?;
        self.random_value = Some(value);
        self.fulfilled_at = Some(at);
        self.state = ProofState::Active;
        Ok(())
    }

    pub fn consume(&mut self, at: DateTime<Utc>) -> PoolResult<()> {
        self.expect_state(ProofState::Active, ProofState::Consumed)?;
        self.consumed_at = Some(at);
        self.state = ProofState::Consumed;
        Ok(())
    }

    /// Whether the record satisfies the state/value invariant.
    pub fn is_consistent(&self) -> bool {
        match self.state {
            ProofState::Pending => self.random_value.is_none() && self.fulfilled_at.is_none(),
            ProofState::Active => self.random_value.is_some() && self.consumed_at.is_none(),
            ProofState::Consumed => self.random_value.is_some() && self.consumed_at.is_some(),
        }
    }

    /// Lowercase hex of the random value, if any.
    pub fn random_value_hex(&self) -> Option<String> {
        self.random_value
            .map(|v| v.iter().map(|b| format!("{b:02x}")).collect())
    }

    /// Time from request to fulfillment in milliseconds.
    pub fn fulfillment_latency_ms(&self) -> Option<u64> {
        let fulfilled = self.fulfilled_at?;
        u64::try_from((fulfilled - self.requested_at).num_milliseconds()).ok()
    }

    fn expect_state(&self, from: ProofState, to: ProofState) -> PoolResult<()> {
        if self.state != from {
            return Err(PoolError::InvalidTransition {
                from: self.state,
                to,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> ProofRecord {
        ProofRecord::pending(
            &Category::family(GameFamily::Mines),
            "mines_1".into(),
            7,
            "sig".into(),
            100,
        )
    }

    #[test]
    fn lifecycle_moves_forward_only() {
        let mut r = record();
        assert!(r.is_consistent());

        r.fulfill([1u8; 32], Utc::now()).unwrap();
        assert_eq!(r.state, ProofState::Active);
        assert!(r.is_consistent());

        r.consume(Utc::now()).unwrap();
        assert_eq!(r.state, ProofState::Consumed);
        assert!(r.is_consistent());

        assert_eq!(
            r.fulfill([2u8; 32], Utc::now()),
            Err(PoolError::InvalidTransition {
                from: ProofState::Consumed,
                to: ProofState::Active
            })
        );
        assert_eq!(r.random_value, Some([1u8; 32]));
    }

    #[test]
    fn pending_cannot_be_consumed() {
        let mut r = record();
        assert!(r.consume(Utc::now()).is_err());
        assert_eq!(r.state, ProofState::Pending);
        assert!(r.consumed_at.is_none());
    }

    #[test]
    fn hex_rendering() {
        let mut r = record();
        assert_eq!(r.random_value_hex(), None);
        r.fulfill([0xab; 32], Utc::now()).unwrap();
        assert_eq!(r.random_value_hex().unwrap(), "ab".repeat(32));
    }
}
