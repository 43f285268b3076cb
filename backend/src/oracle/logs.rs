//! Coordinator event codec.
//!
//! Anchor emits events as base64-encoded `Program data:` log entries. The
//! first 8 bytes of each payload are `sha256("event:<Name>")[..8]`; the rest
//! is the Borsh-encoded event body.

use base64::Engine;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::correlator::FulfillmentEvent;
use crate::record::RequestId;

const PROGRAM_DATA_PREFIX: &str = "Program data: ";

pub const REQUESTED_EVENT: &str = "RandomWordsRequested";
pub const FULFILLED_EVENT: &str = "RandomWordsFulfilled";

/// Compute the Anchor event discriminator: `sha256("event:<Name>")[..8]`.
pub fn event_discriminator(event_name: &str) -> [u8; 8] {
    let mut hasher = Sha256::new();
    hasher.update(format!("event:{event_name}"));
    let hash = hasher.finalize();
    let mut disc = [0u8; 8];
    disc.copy_from_slice(&hash[..8]);
    disc
}

/// One "request accepted" entry of a request call's receipt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestAccepted {
    pub request_id: RequestId,
    pub category_id: u8,
    pub label: String,
    pub requester: [u8; 32],
}

impl RequestAccepted {
    /// Body layout: `request_id (8) + category_id (1) + label (4 + n) + requester (32)`.
    fn decode(data: &[u8]) -> Option<Self> {
        let request_id = u64::from_le_bytes(data.get(0..8)?.try_into().ok()?);
        let category_id = *data.get(8)?;
        let label_len = u32::from_le_bytes(data.get(9..13)?.try_into().ok()?) as usize;
        let label_end = 13usize.checked_add(label_len)?;
        let label = String::from_utf8(data.get(13..label_end)?.to_vec()).ok()?;
        let requester = data.get(label_end..label_end + 32)?.try_into().ok()?;
        Some(Self {
            request_id,
            category_id,
            label,
            requester,
        })
    }

    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(8 + 1 + 4 + self.label.len() + 32);
        buf.extend_from_slice(&self.request_id.to_le_bytes());
        buf.push(self.category_id);
        buf.extend_from_slice(&(self.label.len() as u32).to_le_bytes());
        buf.extend_from_slice(self.label.as_bytes());
        buf.extend_from_slice(&self.requester);
        buf
    }

    pub fn to_log_line(&self) -> String {
        log_line(REQUESTED_EVENT, &self.encode())
    }
}

impl FulfillmentEvent {
    /// Body layout: `request_id (8) + randomness (32)`.
    fn decode(data: &[u8]) -> Option<Self> {
        let request_id = u64::from_le_bytes(data.get(0..8)?.try_into().ok()?);
        let random_value = data.get(8..40)?.try_into().ok()?;
        Some(Self {
            request_id,
            random_value,
        })
    }

    pub fn to_log_line(&self) -> String {
        let mut body = Vec::with_capacity(40);
        body.extend_from_slice(&self.request_id.to_le_bytes());
        body.extend_from_slice(&self.random_value);
        log_line(FULFILLED_EVENT, &body)
    }
}

fn log_line(event_name: &str, body: &[u8]) -> String {
    let mut payload = event_discriminator(event_name).to_vec();
    payload.extend_from_slice(body);
    format!(
        "{PROGRAM_DATA_PREFIX}{}",
        base64::engine::general_purpose::STANDARD.encode(payload)
    )
}

/// Payload bodies of every `Program data:` entry tagged with `discriminator`.
fn event_bodies<'a>(
    logs: &'a [String],
    discriminator: [u8; 8],
) -> impl Iterator<Item = Vec<u8>> + 'a {
    logs.iter().filter_map(move |line| {
        let data = line.strip_prefix(PROGRAM_DATA_PREFIX)?;
        let decoded = match base64::engine::general_purpose::STANDARD.decode(data.trim()) {
            Ok(d) => d,
            Err(e) => {
                debug!(error = %e, "Failed to decode base64 log data");
                return None;
            }
        };
        if decoded.len() < 8 || decoded[..8] != discriminator {
            return None;
        }
        Some(decoded[8..].to_vec())
    })
}

/// Extract every `RandomWordsRequested` entry from a receipt.
///
/// A tagged entry that does not decode is an error: dropping it silently
/// would lose track of a request the coordinator accepted.
pub fn extract_requests(logs: &[String]) -> Result<Vec<RequestAccepted>, String> {
    event_bodies(logs, event_discriminator(REQUESTED_EVENT))
        .map(|body| {
            RequestAccepted::decode(&body)
                .ok_or_else(|| format!("malformed {REQUESTED_EVENT} entry ({} bytes)", body.len()))
        })
        .collect()
}

/// Extract every well-formed `RandomWordsFulfilled` entry.
pub fn extract_fulfillments(logs: &[String]) -> Vec<FulfillmentEvent> {
    event_bodies(logs, event_discriminator(FULFILLED_EVENT))
        .filter_map(|body| {
            let event = FulfillmentEvent::decode(&body);
            if event.is_none() {
                debug!(len = body.len(), "Skipping malformed fulfillment entry");
            }
            event
        })
        .collect()
}
