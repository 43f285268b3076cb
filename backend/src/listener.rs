//! Fulfillment notification source for the VRF coordinator.
//!
//! Two complementary strategies ensure no fulfillment is missed:
//!
//! 1. **Catch-up scan** ([`catch_up_fulfillments`]): on every (re)connect,
//!    once the subscription is live, queries `getProgramAccounts` for request
//!    accounts paid by this service that are already `Fulfilled`, covering
//!    fulfillments that landed while the service was offline or the socket
//!    was down.
//!
//! 2. **Live stream** ([`listen_for_fulfillments`]): subscribes to program
//!    log events via WebSocket, parses `RandomWordsFulfilled` events in
//!    real-time, and auto-reconnects on disconnection.
//!
//! Both may report the same fulfillment; the correlator treats repeats as
//! no-ops.

use anyhow::{Context, Result};
use solana_account_decoder::UiAccountEncoding;
use solana_client::nonblocking::pubsub_client::PubsubClient;
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_client::rpc_config::{
    RpcAccountInfoConfig, RpcProgramAccountsConfig, RpcTransactionLogsConfig,
    RpcTransactionLogsFilter,
};
use solana_client::rpc_filter::{Memcmp, RpcFilterType};
use solana_commitment_config::CommitmentConfig;
use solana_sdk::pubkey::Pubkey;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::config::AppConfig;
use crate::correlator::FulfillmentEvent;
use crate::oracle::logs::extract_fulfillments;

/// Compute the Anchor account discriminator: `sha256("account:<Name>")[..8]`.
fn account_discriminator(account_name: &str) -> [u8; 8] {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(format!("account:{account_name}"));
    let hash = hasher.finalize();
    let mut disc = [0u8; 8];
    disc.copy_from_slice(&hash[..8]);
    disc
}

/// Delay before reconnecting to the WebSocket after a disconnect or error.
const WS_RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Request account layout (offsets include the 8-byte discriminator):
///   [0..8]     discriminator
///   [8..16]    request_id   (u64)
///   [16..48]   requester    (Pubkey)
///   [48]       category_id  (u8)
///   [49]       status       (u8) : 1 = Fulfilled
///   [50..82]   randomness   ([u8; 32])
const REQUESTER_OFFSET: usize = 16;
const STATUS_OFFSET: usize = 49;
const STATUS_FULFILLED: u8 = 1;
const MIN_ACCOUNT_DATA_LEN: usize = 82;

/// Decode a fulfilled request account into a notification.
fn parse_fulfilled_account(data: &[u8]) -> Option<FulfillmentEvent> {
    if data.len() < MIN_ACCOUNT_DATA_LEN || data[STATUS_OFFSET] != STATUS_FULFILLED {
        return None;
    }
    let request_id = u64::from_le_bytes(data[8..16].try_into().ok()?);
    let random_value = data[50..82].try_into().ok()?;
    Some(FulfillmentEvent {
        request_id,
        random_value,
    })
}

/// Every request account paid by `payer` that the coordinator has fulfilled.
pub async fn fetch_fulfilled(
    client: &RpcClient,
    program_id: &Pubkey,
    payer: &Pubkey,
) -> Result<Vec<FulfillmentEvent>> {
    let disc = account_discriminator("RandomnessRequest");

    let filters = vec![
        RpcFilterType::Memcmp(Memcmp::new_raw_bytes(0, disc.to_vec())),
        RpcFilterType::Memcmp(Memcmp::new_raw_bytes(REQUESTER_OFFSET, payer.to_bytes().to_vec())),
        RpcFilterType::Memcmp(Memcmp::new_raw_bytes(STATUS_OFFSET, vec![STATUS_FULFILLED])),
    ];

    let account_config = RpcProgramAccountsConfig {
        filters: Some(filters),
        account_config: RpcAccountInfoConfig {
            encoding: Some(UiAccountEncoding::Base64),
            commitment: Some(CommitmentConfig::confirmed()),
            ..Default::default()
        },
        ..Default::default()
    };

    let accounts = client
        .get_program_ui_accounts_with_config(program_id, account_config)
        .await
        .context("failed to fetch fulfilled request accounts")?;

    let mut events = Vec::with_capacity(accounts.len());
    for (pubkey, ui_account) in accounts {
        let Some(data) = ui_account.data.decode() else {
            warn!(account = %pubkey, "Failed to decode account data, skipping");
            continue;
        };
        let Some(event) = parse_fulfilled_account(&data) else {
            warn!(account = %pubkey, len = data.len(), "Unexpected request account layout, skipping");
            continue;
        };
        events.push(event);
    }
    Ok(events)
}

/// Forward every fulfilled request account paid by `payer`. Returns false
/// once the correlator channel has closed.
pub async fn catch_up_fulfillments(
    client: &RpcClient,
    config: &AppConfig,
    payer: &Pubkey,
    tx: &mpsc::Sender<FulfillmentEvent>,
) -> bool {
    info!("Scanning for fulfillments the stream may have missed");

    match fetch_fulfilled(client, &config.program_id, payer).await {
        Ok(events) => {
            info!(count = events.len(), "Found fulfilled requests");
            for event in events {
                if tx.send(event).await.is_err() {
                    error!("Channel closed while catching up fulfillments");
                    return false;
                }
            }
        }
        Err(e) => {
            error!(error = ?e, "Fulfillment catch-up scan failed");
        }
    }
    true
}

/// Subscribe to program logs via WebSocket and forward `RandomWordsFulfilled`
/// events to the correlator. Automatically reconnects on disconnection.
///
/// Each (re)connection subscribes first and then runs the catch-up scan for
/// `payer`, so nothing fulfilled before or between connections is lost.
pub async fn listen_for_fulfillments(
    config: AppConfig,
    payer: Option<Pubkey>,
    tx: mpsc::Sender<FulfillmentEvent>,
) {
    let client = RpcClient::new(config.rpc_url.clone());
    if payer.is_none() {
        warn!("No payer keypair, fulfillment catch-up disabled");
    }

    loop {
        info!(url = %config.ws_url, "Connecting to WebSocket");

        match PubsubClient::new(&config.ws_url).await {
            Ok(pubsub) => {
                info!("WebSocket connected");

                let filter =
                    RpcTransactionLogsFilter::Mentions(vec![config.program_id.to_string()]);
                let logs_config = RpcTransactionLogsConfig {
                    commitment: Some(CommitmentConfig::confirmed()),
                };

                match pubsub.logs_subscribe(filter, logs_config).await {
                    Ok((mut stream, _unsub)) => {
                        if let Some(payer) = &payer {
                            if !catch_up_fulfillments(&client, &config, payer, &tx).await {
                                return;
                            }
                        }

                        use futures_util::StreamExt;
                        while let Some(log_result) = stream.next().await {
                            for event in extract_fulfillments(&log_result.value.logs) {
                                info!(
                                    request_id = event.request_id,
                                    signature = %log_result.value.signature,
                                    "Received RandomWordsFulfilled event"
                                );
                                if tx.send(event).await.is_err() {
                                    error!("Channel closed, stopping listener");
                                    return;
                                }
                            }
                        }
                        warn!("WebSocket stream ended, reconnecting");
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to subscribe to logs");
                    }
                }
            }
            Err(e) => {
                error!(error = %e, "Failed to connect to WebSocket");
            }
        }

        info!(delay = ?WS_RECONNECT_DELAY, "Reconnecting");
        tokio::time::sleep(WS_RECONNECT_DELAY).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account(status: u8) -> Vec<u8> {
        let mut data = account_discriminator("RandomnessRequest").to_vec();
        data.extend_from_slice(&42u64.to_le_bytes());
        data.extend_from_slice(&[9u8; 32]);
        data.push(3);
        data.push(status);
        data.extend_from_slice(&[0xcd; 32]);
        data
    }

    #[test]
    fn fulfilled_account_decodes() {
        assert_eq!(
            parse_fulfilled_account(&account(STATUS_FULFILLED)),
            Some(FulfillmentEvent {
                request_id: 42,
                random_value: [0xcd; 32],
            })
        );
    }

    #[test]
    fn pending_or_short_accounts_are_skipped() {
        assert_eq!(parse_fulfilled_account(&account(0)), None);
        assert_eq!(parse_fulfilled_account(&account(STATUS_FULFILLED)[..60]), None);
    }
}
