//! Submitter (C9): builds, signs, and sends the RPC transaction for a
//! SubmissionBatch.

use crate::chain::{PrfiClient, PrfiToken};
use crate::errors::{PrfiError, Result};
use crate::store::{Block, BlockStatus, BlockStore};
use ethers::providers::Middleware;
use ethers::types::{Address, H256, U256};
use std::sync::Arc;

#[derive(Debug, Clone, Copy)]
pub struct SubmitterConfig {
    pub gas_limit: u64,
    pub gas_price_multiplier: f64,
    pub max_gas_price: U256,
    pub confirmation_blocks: u64,
    pub max_retries: u32,
    pub retry_delay_secs: u64,
    pub exponential_backoff: bool,
}

impl Default for SubmitterConfig {
    fn default() -> Self {
        Self {
            gas_limit: 500_000,
            gas_price_multiplier: 1.1,
            max_gas_price: U256::from(100_000_000_000u64),
            confirmation_blocks: 12,
            max_retries: 3,
            retry_delay_secs: 60,
            exponential_backoff: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmissionStatus {
    Pending,
    Submitting,
    Submitted,
    Confirmed,
    Failed,
    Retry,
}

#[derive(Debug, Clone)]
pub struct SubmissionBatch {
    pub submission_id: String,
    pub block_ids: Vec<String>,
    pub tx_hash: Option<H256>,
    pub status: SubmissionStatus,
    pub retry_count: u32,
    pub gas_used: Option<U256>,
    pub gas_price: Option<U256>,
    pub created_at: u64,
    pub submitted_at: Option<u64>,
    pub confirmed_at: Option<u64>,
}

impl SubmissionBatch {
    pub fn new(block_ids: Vec<String>) -> Self {
        Self {
            submission_id: uuid::Uuid::new_v4().to_string(),
            block_ids,
            tx_hash: None,
            status: SubmissionStatus::Pending,
            retry_count: 0,
            gas_used: None,
            gas_price: None,
            created_at: now_millis(),
            submitted_at: None,
            confirmed_at: None,
        }
    }

    pub fn can_retry(&self, cfg: &SubmitterConfig) -> bool {
        self.retry_count < cfg.max_retries
    }
}

/// Submits one block of a batch via `mintBatch`. The narrow ABI (§6) names
/// only `mintBatch`, so a multi-block SubmissionBatch is realized as one
/// `mintBatch` call per block within the same logical submission, all
/// tracked under a single `SubmissionBatch` record.
pub async fn submit(
    client: Arc<PrfiClient>,
    contract_address: Address,
    store: &BlockStore,
    batch: &mut SubmissionBatch,
    cfg: &SubmitterConfig,
) -> Result<()> {
    batch.status = SubmissionStatus::Submitting;

    let contract = PrfiToken::new(contract_address, client.clone());

    let mut blocks = Vec::with_capacity(batch.block_ids.len());
    for block_id in &batch.block_ids {
        let block = store
            .get(block_id)?
            .ok_or_else(|| PrfiError::terminal("submitter", "submit", format!("unknown block {block_id}")))?;
        if block.status != BlockStatus::Pending {
            return Err(PrfiError::terminal(
                "submitter",
                "submit",
                format!("block {block_id} is not PENDING (status={:?})", block.status),
            ));
        }
        blocks.push(block);
    }

    let gas_price = estimate_gas_price(client.as_ref(), cfg).await?;

    let mut last_tx_hash = None;
    for block in &blocks {
        let merkle_root = decode_merkle_root(&block.merkle_root)?;
        let call = contract
            .mint_batch(block.batch_id.clone(), U256::from(block.events_count), U256::from(block.nonce), merkle_root)
            .gas_price(gas_price);

        let estimated = call
            .estimate_gas()
            .await
            .map_err(|e| PrfiError::RpcUnavailable {
                message: format!("eth_estimateGas failed: {e}"),
            })?;
        let with_margin = (estimated * U256::from(120u64)) / U256::from(100u64);
        let capped = with_margin.min(U256::from(cfg.gas_limit));
        let call = call.gas(capped);

        let pending = call
            .send()
            .await
            .map_err(|e| PrfiError::RpcUnavailable {
                message: format!("eth_sendRawTransaction failed: {e}"),
            })?;
        last_tx_hash = Some(pending.tx_hash());

        store.update_status(&block.block_id, BlockStatus::Submitted, Some(format!("{:#x}", pending.tx_hash())), None)?;
    }

    batch.tx_hash = last_tx_hash;
    batch.status = SubmissionStatus::Submitted;
    batch.submitted_at = Some(now_millis());
    batch.gas_price = Some(gas_price);

    Ok(())
}

async fn estimate_gas_price(client: &PrfiClient, cfg: &SubmitterConfig) -> Result<U256> {
    let rpc_price = client.get_gas_price().await.map_err(|e| PrfiError::RpcUnavailable {
        message: format!("eth_gasPrice failed: {e}"),
    })?;
    let scaled = scale_u256(rpc_price, cfg.gas_price_multiplier);
    Ok(scaled.min(cfg.max_gas_price))
}

fn scale_u256(value: U256, multiplier: f64) -> U256 {
    // U256 has no native float multiply; approximate via a fixed-point
    // scale factor, matching the precision the gas-price heuristic needs.
    let scaled_multiplier = (multiplier * 1000.0).round() as u64;
    (value * U256::from(scaled_multiplier)) / U256::from(1000u64)
}

fn decode_merkle_root(merkle_root_hex: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(merkle_root_hex).map_err(|e| {
        PrfiError::terminal("submitter", "decode_merkle_root", format!("invalid hex: {e}"))
    })?;
    if bytes.len() != 32 {
        return Err(PrfiError::terminal(
            "submitter",
            "decode_merkle_root",
            "merkle root must be 32 bytes",
        ));
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes);
    Ok(out)
}

/// `retry_delay * 2^retry_count` when exponential backoff is enabled,
/// otherwise a flat `retry_delay`.
pub fn retry_delay_secs(cfg: &SubmitterConfig, retry_count: u32) -> u64 {
    if !cfg.exponential_backoff {
        return cfg.retry_delay_secs;
    }
    cfg.retry_delay_secs.saturating_mul(1u64 << retry_count.min(20))
}

fn now_millis() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delay_doubles_with_exponential_backoff() {
        let cfg = SubmitterConfig {
            exponential_backoff: true,
            retry_delay_secs: 60,
            ..Default::default()
        };
        assert_eq!(retry_delay_secs(&cfg, 0), 60);
        assert_eq!(retry_delay_secs(&cfg, 1), 120);
        assert_eq!(retry_delay_secs(&cfg, 2), 240);
    }

    #[test]
    fn retry_delay_flat_without_exponential_backoff() {
        let cfg = SubmitterConfig {
            exponential_backoff: false,
            retry_delay_secs: 60,
            ..Default::default()
        };
        assert_eq!(retry_delay_secs(&cfg, 0), 60);
        assert_eq!(retry_delay_secs(&cfg, 5), 60);
    }

    #[test]
    fn can_retry_respects_max_retries() {
        let cfg = SubmitterConfig {
            max_retries: 3,
            ..Default::default()
        };
        let mut batch = SubmissionBatch::new(vec!["b1".to_string()]);
        assert!(batch.can_retry(&cfg));
        batch.retry_count = 3;
        assert!(!batch.can_retry(&cfg));
    }

    #[test]
    fn merkle_root_round_trips_through_hex() {
        let root = crate::crypto::sha256(b"batch");
        let hex_str = hex::encode(root);
        let decoded = decode_merkle_root(&hex_str).unwrap();
        assert_eq!(decoded, root);
    }
}
