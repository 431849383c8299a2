//! Proof-of-work miner (C7): finds a nonce meeting difficulty and produces
//! a signed Block.

use crate::crypto::{hour_bucket, leading_hex_zeros, pow_preimage, sha256};
use crate::errors::{PrfiError, Result};
use crate::ledger::Batch;
use crate::store::{Block, BlockStatus};
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy)]
pub struct MinerConfig {
    pub min_difficulty: u32,
    pub iteration_cap: u64,
}

impl Default for MinerConfig {
    fn default() -> Self {
        Self {
            min_difficulty: 4,
            iteration_cap: 1_000_000,
        }
    }
}

/// Result of a successful mine: the nonce, resulting hash, and the hour
/// bucket it was bound to (needed by the caller to reproduce the hash).
pub struct MineResult {
    pub nonce: u64,
    pub block_hash: [u8; 32],
    pub bucket: u64,
}

/// Searches `nonce = 0, 1, 2, ...` for a hash with >= `min_difficulty`
/// leading hex zeros. Yields cooperatively every 10ms's worth of work (here
/// approximated by a fixed iteration chunk) so callers running this on a
/// blocking thread pool don't starve other blocking tasks indefinitely.
pub fn mine(
    miner_address: &str,
    batch: &Batch,
    cfg: &MinerConfig,
) -> Result<MineResult> {
    let bucket = hour_bucket(now_unix());
    const YIELD_CHUNK: u64 = 5_000;

    let mut nonce = 0u64;
    while nonce < cfg.iteration_cap {
        let chunk_end = (nonce + YIELD_CHUNK).min(cfg.iteration_cap);
        while nonce < chunk_end {
            let preimage = pow_preimage(
                miner_address,
                &batch.batch_id,
                batch.events_count,
                &batch.merkle_root,
                bucket,
                nonce,
            );
            let hash = sha256(&preimage);
            if leading_hex_zeros(&hash) >= cfg.min_difficulty {
                return Ok(MineResult {
                    nonce,
                    block_hash: hash,
                    bucket,
                });
            }
            nonce += 1;
        }
        std::thread::yield_now();
    }

    Err(PrfiError::MiningTimeout {
        batch_id: batch.batch_id.clone(),
        iterations: cfg.iteration_cap,
    })
}

/// Recomputes the hash for `(miner, batch_id, events_count, nonce,
/// merkle_root, bucket)` and checks leading-zero difficulty. Used both by
/// the miner itself (self-check) and by verifiers.
pub fn verify(miner_address: &str, batch: &Batch, nonce: u64, bucket: u64, min_difficulty: u32) -> bool {
    let preimage = pow_preimage(
        miner_address,
        &batch.batch_id,
        batch.events_count,
        &batch.merkle_root,
        bucket,
        nonce,
    );
    let hash = sha256(&preimage);
    leading_hex_zeros(&hash) >= min_difficulty
}

/// Builds the message signed/verified over a mined block:
/// `block_id ∥ batch_id ∥ miner ∥ merkle_root ∥ nonce`.
fn block_signing_message(block_id: &str, batch_id: &str, miner_address: &str, merkle_root: &[u8; 32], nonce: u64) -> Vec<u8> {
    let mut msg = Vec::with_capacity(block_id.len() + batch_id.len() + miner_address.len() + 32 + 8);
    msg.extend_from_slice(block_id.as_bytes());
    msg.extend_from_slice(batch_id.as_bytes());
    msg.extend_from_slice(miner_address.as_bytes());
    msg.extend_from_slice(merkle_root);
    msg.extend_from_slice(&nonce.to_be_bytes());
    msg
}

/// HMAC-SHA-256 over `(block_id, batch_id, miner, merkle_root, nonce)` using
/// the company's signing key, per the same scheme `envelope::Signer` uses
/// for events.
pub fn sign_block(secret: &[u8], block_id: &str, batch_id: &str, miner_address: &str, merkle_root: &[u8; 32], nonce: u64) -> String {
    let message = block_signing_message(block_id, batch_id, miner_address, merkle_root, nonce);
    crate::crypto::hmac_sha256_hex(secret, &message)
}

/// Verifies a block's HMAC signature in constant time.
pub fn verify_block_signature(secret: &[u8], block_id: &str, batch_id: &str, miner_address: &str, merkle_root: &[u8; 32], nonce: u64, signature: &str) -> bool {
    let message = block_signing_message(block_id, batch_id, miner_address, merkle_root, nonce);
    crate::crypto::hmac_sha256_verify(secret, &message, signature)
}

/// Mines `batch` off the async executor via `tokio::task::spawn_blocking`,
/// then builds a signed `Block` around the result. `secret` is the
/// company's HMAC signing key (the same one `envelope::Signer` uses).
pub async fn mine_block(
    miner_address: String,
    public_key: String,
    batch: Batch,
    cfg: MinerConfig,
    points: f64,
    secret: Vec<u8>,
) -> Result<Block> {
    let batch_for_mine = batch.clone();
    let miner_for_mine = miner_address.clone();
    let mine_result = tokio::task::spawn_blocking(move || mine(&miner_for_mine, &batch_for_mine, &cfg))
        .await
        .map_err(|e| PrfiError::terminal("miner", "mine_block", format!("mining task panicked: {e}")))??;

    let block_id = uuid::Uuid::new_v4().to_string();
    let signature = sign_block(&secret, &block_id, &batch.batch_id, &miner_address, &batch.merkle_root, mine_result.nonce);

    Ok(Block {
        block_id,
        batch_id: batch.batch_id.clone(),
        miner_address,
        nonce: mine_result.nonce,
        block_hash: hex::encode(mine_result.block_hash),
        events_count: batch.events_count,
        merkle_root: hex::encode(batch.merkle_root),
        difficulty: cfg.min_difficulty,
        signature,
        public_key,
        points,
        mined_at: now_millis(),
        status: BlockStatus::Pending,
        tx_hash: None,
        confirmation_block: None,
        retry_count: 0,
    })
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_batch() -> Batch {
        Batch {
            batch_id: "co-1-1".to_string(),
            company_id: "co-1".to_string(),
            events_count: 3,
            merkle_root: crate::crypto::sha256(b"merkle"),
            created_at: 0,
        }
    }

    #[test]
    fn mining_finds_nonce_meeting_difficulty() {
        let batch = sample_batch();
        let cfg = MinerConfig {
            min_difficulty: 2,
            iteration_cap: 2_000_000,
        };
        let result = mine("0xminer", &batch, &cfg).expect("should find a nonce");
        assert!(leading_hex_zeros(&result.block_hash) >= 2);
        assert!(verify("0xminer", &batch, result.nonce, result.bucket, 2));
    }

    #[test]
    fn mining_times_out_when_cap_too_low() {
        let batch = sample_batch();
        let cfg = MinerConfig {
            min_difficulty: 8,
            iteration_cap: 10,
        };
        let result = mine("0xminer", &batch, &cfg);
        assert!(matches!(result, Err(PrfiError::MiningTimeout { .. })));
    }

    #[test]
    fn block_signature_round_trips_and_rejects_tampering() {
        let secret = b"0123456789abcdef0123456789abcdef".to_vec();
        let merkle_root = crate::crypto::sha256(b"merkle");
        let sig = sign_block(&secret, "block-1", "co-1-1", "0xminer", &merkle_root, 7);
        assert!(verify_block_signature(&secret, "block-1", "co-1-1", "0xminer", &merkle_root, 7, &sig));
        assert!(!verify_block_signature(&secret, "block-1", "co-1-1", "0xminer", &merkle_root, 8, &sig));
    }

    #[tokio::test]
    async fn mine_block_populates_batch_derived_fields() {
        let batch = sample_batch();
        let secret = b"0123456789abcdef0123456789abcdef".to_vec();
        let cfg = MinerConfig {
            min_difficulty: 2,
            iteration_cap: 2_000_000,
        };
        let block = mine_block("0xminer".to_string(), "0xminer".to_string(), batch.clone(), cfg, 0.5, secret.clone())
            .await
            .unwrap();

        assert_eq!(block.events_count, batch.events_count);
        assert_eq!(block.merkle_root, hex::encode(batch.merkle_root));
        assert!(verify_block_signature(
            &secret,
            &block.block_id,
            &block.batch_id,
            &block.miner_address,
            &batch.merkle_root,
            block.nonce,
            &block.signature,
        ));
    }

    #[test]
    fn verify_rejects_wrong_nonce_at_high_difficulty() {
        let batch = sample_batch();
        let cfg = MinerConfig {
            min_difficulty: 2,
            iteration_cap: 2_000_000,
        };
        let result = mine("0xminer", &batch, &cfg).unwrap();
        // Checking against a difficulty far above what the found nonce
        // actually satisfies must fail deterministically.
        assert!(!verify("0xminer", &batch, result.nonce, result.bucket, 20));
    }
}
