//! Request calls against the on-chain VRF coordinator.
//!
//! Each call is one transaction containing:
//! 1. (Optional) A `set_compute_unit_price` instruction for priority fees.
//! 2. The `request_random_words_batch` coordinator instruction, which emits
//!    one `RandomWordsRequested` event per `(category_id, label)` pair.
//!
//! After confirmation the transaction is fetched back so its log messages
//! and slot can serve as the call receipt.

use anyhow::{Context, Result};
use async_trait::async_trait;
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_client::rpc_config::RpcTransactionConfig;
use solana_commitment_config::CommitmentConfig;
use solana_sdk::instruction::{AccountMeta, Instruction};
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::{Keypair, Signature, Signer};
use solana_sdk::transaction::Transaction;
use std::collections::HashSet;
use std::time::Duration;
use tracing::{info, instrument, warn};

use super::{CallReceipt, Oracle, OracleError, SignerStatus};
use crate::config::AppConfig;
use crate::correlator::FulfillmentEvent;
use crate::listener::fetch_fulfilled;
use crate::record::RequestId;

/// Known non-retryable coordinator error codes.
const ERROR_UNAUTHORIZED: u32 = 6009;
const ERROR_NUM_WORDS_TOO_LARGE: u32 = 6013;
const ERROR_INSUFFICIENT_BALANCE: u32 = 6014;

/// The system program id is the all-zero key.
const SYSTEM_PROGRAM_ID: Pubkey = Pubkey::new_from_array([0u8; 32]);

/// Compute the Anchor instruction discriminator for `request_random_words_batch`.
fn request_batch_discriminator() -> [u8; 8] {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(b"global:request_random_words_batch");
    let hash = hasher.finalize();
    let mut disc = [0u8; 8];
    disc.copy_from_slice(&hash[..8]);
    disc
}

/// Check if an error string contains a known non-retryable error.
fn is_rejection(err_str: &str) -> bool {
    let codes = [
        ERROR_UNAUTHORIZED,
        ERROR_NUM_WORDS_TOO_LARGE,
        ERROR_INSUFFICIENT_BALANCE,
    ];
    if codes
        .iter()
        .any(|code| err_str.contains(&format!("0x{code:x}")))
    {
        return true;
    }
    err_str.contains("Unauthorized")
        || err_str.contains("NumWordsTooLarge")
        || err_str.contains("InsufficientSubscriptionBalance")
        || err_str.contains("insufficient funds")
}

pub struct SolanaOracle {
    rpc: RpcClient,
    config: AppConfig,
}

impl SolanaOracle {
    pub fn new(config: AppConfig) -> Self {
        let rpc = RpcClient::new_with_commitment(config.rpc_url.clone(), CommitmentConfig::confirmed());
        Self { rpc, config }
    }

    async fn submit(&self, payer: &Keypair, category_ids: &[u8], labels: &[String]) -> Result<CallReceipt> {
        let mut instructions = Vec::with_capacity(2);
        if self.config.priority_fee_micro_lamports > 0 {
            instructions.push(build_set_compute_unit_price_instruction(
                self.config.priority_fee_micro_lamports,
            )?);
        }
        instructions.push(build_request_batch_instruction(
            &self.config.program_id,
            &payer.pubkey(),
            self.config.subscription_id,
            category_ids,
            labels,
        ));

        let signature = send_with_retries(&self.rpc, &self.config, payer, &instructions).await?;
        info!(
            signature = %signature,
            explorer = %self.config.explorer_url(&signature.to_string()),
            "Request batch confirmed"
        );

        let tx = self
            .rpc
            .get_transaction_with_config(
                &signature,
                RpcTransactionConfig {
                    commitment: Some(CommitmentConfig::confirmed()),
                    max_supported_transaction_version: Some(0),
                    ..Default::default()
                },
            )
            .await
            .context("failed to fetch confirmed request transaction")?;

        let logs = tx
            .transaction
            .meta
            .and_then(|meta| Option::<Vec<String>>::from(meta.log_messages))
            .unwrap_or_default();

        Ok(CallReceipt {
            transaction_ref: signature.to_string(),
            block_ref: tx.slot,
            logs,
        })
    }
}

#[async_trait]
impl Oracle for SolanaOracle {
    #[instrument(skip_all, fields(count = labels.len()))]
    async fn request_batch(
        &self,
        category_ids: &[u8],
        labels: &[String],
    ) -> Result<CallReceipt, OracleError> {
        let Some(payer) = self.config.payer_keypair.clone() else {
            return Err(OracleError::Rejected("no payer keypair loaded".into()));
        };

        self.submit(&payer, category_ids, labels).await.map_err(|e| {
            let err_str = format!("{e:#}");
            if is_rejection(&err_str) {
                OracleError::Rejected(err_str)
            } else {
                OracleError::Network(err_str)
            }
        })
    }

    #[instrument(skip_all, fields(count = request_ids.len()))]
    async fn fulfillments(
        &self,
        request_ids: &[RequestId],
    ) -> Result<Vec<FulfillmentEvent>, OracleError> {
        let Some(payer) = self.config.payer_keypair.as_ref() else {
            return Ok(Vec::new());
        };
        let wanted: HashSet<RequestId> = request_ids.iter().copied().collect();
        let fulfilled = fetch_fulfilled(&self.rpc, &self.config.program_id, &payer.pubkey())
            .await
            .map_err(|e| OracleError::Network(format!("{e:#}")))?;
        Ok(fulfilled
            .into_iter()
            .filter(|event| wanted.contains(&event.request_id))
            .collect())
    }
}

impl SignerStatus for SolanaOracle {
    fn is_available(&self) -> bool {
        self.config.payer_keypair.is_some()
    }
}

/// Send a transaction with exponential backoff on BlockhashNotFound.
async fn send_with_retries(
    rpc_client: &RpcClient,
    config: &AppConfig,
    payer: &Keypair,
    instructions: &[Instruction],
) -> Result<Signature> {
    let mut retry_delay = Duration::from_millis(config.initial_retry_delay_ms);

    for attempt in 0..config.max_retries {
        let blockhash = rpc_client
            .get_latest_blockhash()
            .await
            .context("failed to fetch latest blockhash")?;

        let tx = Transaction::new_signed_with_payer(
            instructions,
            Some(&payer.pubkey()),
            &[payer],
            blockhash,
        );

        match rpc_client.send_and_confirm_transaction(&tx).await {
            Ok(sig) => return Ok(sig),
            Err(e) if e.to_string().contains("BlockhashNotFound") && attempt + 1 < config.max_retries => {
                warn!(
                    attempt = attempt + 1,
                    delay = ?retry_delay,
                    "BlockhashNotFound, retrying"
                );
                tokio::time::sleep(retry_delay).await;
                retry_delay = retry_delay.saturating_mul(2).min(Duration::from_secs(60));
            }
            Err(e) => return Err(e).context("send_and_confirm_transaction failed"),
        }
    }

    anyhow::bail!("max retries ({}) exceeded for request batch", config.max_retries)
}

/// Build a `SetComputeUnitPrice` instruction.
fn build_set_compute_unit_price_instruction(micro_lamports: u64) -> Result<Instruction> {
    let compute_budget_id: Pubkey = "ComputeBudget111111111111111111111111111111"
        .parse()
        .context("invalid compute budget program id")?;
    let mut data = Vec::with_capacity(9);
    data.push(3u8);
    data.extend_from_slice(&micro_lamports.to_le_bytes());
    Ok(Instruction {
        program_id: compute_budget_id,
        accounts: vec![],
        data,
    })
}

/// Borsh encoding of the instruction arguments:
/// `Vec<u8>` (u32 length + bytes) followed by `Vec<String>` (u32 count, then
/// u32 length + UTF-8 bytes per label).
fn encode_batch_args(category_ids: &[u8], labels: &[String]) -> Vec<u8> {
    let label_bytes: usize = labels.iter().map(|l| 4 + l.len()).sum();
    let mut data = Vec::with_capacity(8 + 4 + category_ids.len() + 4 + label_bytes);
    data.extend_from_slice(&(category_ids.len() as u32).to_le_bytes());
    data.extend_from_slice(category_ids);
    data.extend_from_slice(&(labels.len() as u32).to_le_bytes());
    for label in labels {
        data.extend_from_slice(&(label.len() as u32).to_le_bytes());
        data.extend_from_slice(label.as_bytes());
    }
    data
}

/// Build the `request_random_words_batch` coordinator instruction.
fn build_request_batch_instruction(
    program_id: &Pubkey,
    payer: &Pubkey,
    subscription_id: u64,
    category_ids: &[u8],
    labels: &[String],
) -> Instruction {
    let sub_seed = subscription_id.to_le_bytes();
    let (config_pda, _) = Pubkey::find_program_address(&[b"coordinator-config"], program_id);
    let (subscription_pda, _) =
        Pubkey::find_program_address(&[b"subscription", &sub_seed], program_id);
    let (consumer_pda, _) =
        Pubkey::find_program_address(&[b"consumer", &sub_seed, payer.as_ref()], program_id);

    let mut data = request_batch_discriminator().to_vec();
    data.extend_from_slice(&encode_batch_args(category_ids, labels));

    Instruction {
        program_id: *program_id,
        accounts: vec![
            AccountMeta::new(*payer, true),                       // requester (signer, payer)
            AccountMeta::new(config_pda, false),                  // coordinator config PDA
            AccountMeta::new(subscription_pda, false),            // subscription PDA
            AccountMeta::new_readonly(consumer_pda, false),       // consumer registration PDA
            AccountMeta::new_readonly(SYSTEM_PROGRAM_ID, false),  // system program
        ],
        data,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_args_are_borsh_encoded() {
        let data = encode_batch_args(&[0, 0], &["mines_1".into(), "mines_2".into()]);
        assert_eq!(&data[0..4], &2u32.to_le_bytes());
        assert_eq!(&data[4..6], &[0, 0]);
        assert_eq!(&data[6..10], &2u32.to_le_bytes());
        assert_eq!(&data[10..14], &7u32.to_le_bytes());
        assert_eq!(&data[14..21], b"mines_1");
        assert_eq!(data.len(), 4 + 2 + 4 + 2 * (4 + 7));
    }

    #[test]
    fn instruction_starts_with_discriminator() {
        let program = Pubkey::new_unique();
        let payer = Pubkey::new_unique();
        let ix = build_request_batch_instruction(&program, &payer, 1, &[3], &["wheel_1".into()]);
        assert_eq!(&ix.data[..8], &request_batch_discriminator());
        assert_eq!(ix.accounts[0].pubkey, payer);
        assert!(ix.accounts[0].is_signer);
    }

    #[test]
    fn rejection_classification() {
        assert!(is_rejection("custom program error: 0x1779"));
        assert!(is_rejection("Error: InsufficientSubscriptionBalance"));
        assert!(!is_rejection("connection refused"));
        assert!(!is_rejection("BlockhashNotFound"));
    }
}
