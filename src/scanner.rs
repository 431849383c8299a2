//! Scanner & batcher (C8): selects pending Blocks and groups them into
//! gas-bounded SubmissionBatches.

use crate::miner::verify_block_signature;
use crate::store::{Block, BlockStatus, BlockStore};
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy)]
pub struct BatcherConfig {
    pub batch_size: usize,
    pub min_batch_size: usize,
    pub max_batch_size: usize,
    pub gas_limit: u64,
    pub gas_per_block: u64,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            min_batch_size: 1,
            max_batch_size: 50,
            gas_limit: 500_000,
            gas_per_block: 21_000,
        }
    }
}

/// Scans the block store for `PENDING` blocks, filtering by validity: a
/// genuine HMAC signature over `(block_id, batch_id, miner, merkle_root,
/// nonce)` verified against `secret`, a `mined_at` no older than
/// `max_age_secs`, and `difficulty >= min_difficulty`. Invalid blocks are
/// logged and skipped, not returned.
pub fn scan_pending(store: &BlockStore, min_difficulty: u32, secret: &[u8], max_age_secs: u64) -> crate::errors::Result<Vec<Block>> {
    let candidates = store.list_by_status(BlockStatus::Pending)?;
    let mut valid = Vec::with_capacity(candidates.len());
    let now = now_millis();
    for block in candidates {
        let Some(merkle_root) = decode_hex32(&block.merkle_root) else {
            tracing::warn!(block_id = %block.block_id, "skipping block with malformed merkle_root");
            continue;
        };
        if !verify_block_signature(
            secret,
            &block.block_id,
            &block.batch_id,
            &block.miner_address,
            &merkle_root,
            block.nonce,
            &block.signature,
        ) {
            tracing::warn!(block_id = %block.block_id, "skipping block with invalid signature");
            continue;
        }
        if now.saturating_sub(block.mined_at) > max_age_secs.saturating_mul(1000) {
            tracing::warn!(block_id = %block.block_id, mined_at = block.mined_at, "skipping stale block");
            continue;
        }
        if block.difficulty < min_difficulty {
            tracing::warn!(block_id = %block.block_id, difficulty = block.difficulty, min_difficulty, "skipping block below minimum difficulty");
            continue;
        }
        valid.push(block);
    }
    Ok(valid)
}

fn decode_hex32(hex_str: &str) -> Option<[u8; 32]> {
    let bytes = hex::decode(hex_str).ok()?;
    if bytes.len() != 32 {
        return None;
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes);
    Some(out)
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Orders blocks oldest-`mined_at`-first, then higher-`points`-first, then
/// round-robins across distinct miners to avoid starving any one miner's
/// older blocks.
pub fn prioritize(mut blocks: Vec<Block>) -> Vec<Block> {
    blocks.sort_by(|a, b| {
        a.mined_at
            .cmp(&b.mined_at)
            .then(b.points.partial_cmp(&a.points).unwrap_or(std::cmp::Ordering::Equal))
            .then(a.block_id.cmp(&b.block_id))
    });

    // Round-robin across miners, preserving each miner's internal
    // oldest-first/highest-points-first order established above.
    let mut by_miner: HashMap<String, Vec<Block>> = HashMap::new();
    let mut miner_order: Vec<String> = Vec::new();
    for block in blocks {
        if !by_miner.contains_key(&block.miner_address) {
            miner_order.push(block.miner_address.clone());
        }
        by_miner.entry(block.miner_address.clone()).or_default().push(block);
    }

    let mut out = Vec::new();
    loop {
        let mut progressed = false;
        for miner in &miner_order {
            if let Some(queue) = by_miner.get_mut(miner) {
                if !queue.is_empty() {
                    out.push(queue.remove(0));
                    progressed = true;
                }
            }
        }
        if !progressed {
            break;
        }
    }
    out
}

#[derive(Debug, Clone)]
pub struct SubmissionBatchPlan {
    pub block_ids: Vec<String>,
    pub estimated_gas: u64,
}

/// Groups prioritized blocks into submission batches bounded by target
/// size, hard min/max, estimated gas, and miner diversity.
pub fn build_batches(blocks: Vec<Block>, cfg: &BatcherConfig) -> Vec<SubmissionBatchPlan> {
    let distinct_miners = blocks
        .iter()
        .map(|b| b.miner_address.as_str())
        .collect::<std::collections::HashSet<_>>()
        .len()
        .max(1);
    let max_per_miner = cfg.batch_size.div_ceil(distinct_miners).max(1);

    let mut plans = Vec::new();
    let mut current: Vec<Block> = Vec::new();
    let mut current_miner_counts: HashMap<String, usize> = HashMap::new();

    let flush = |current: &mut Vec<Block>, current_miner_counts: &mut HashMap<String, usize>, plans: &mut Vec<SubmissionBatchPlan>| {
        if current.is_empty() {
            return;
        }
        let estimated_gas = current.len() as u64 * cfg.gas_per_block;
        plans.push(SubmissionBatchPlan {
            block_ids: current.iter().map(|b| b.block_id.clone()).collect(),
            estimated_gas,
        });
        current.clear();
        current_miner_counts.clear();
    };

    for block in blocks {
        let miner_count = current_miner_counts.get(&block.miner_address).copied().unwrap_or(0);
        let distinct_in_current = current_miner_counts.len().max(1);
        let diversity_limit = cfg.batch_size.div_ceil(distinct_in_current).max(1).max(max_per_miner.min(cfg.batch_size));

        let would_exceed_gas = (current.len() as u64 + 1) * cfg.gas_per_block > cfg.gas_limit;
        let would_exceed_max = current.len() + 1 > cfg.max_batch_size;
        let would_exceed_diversity = miner_count >= diversity_limit && current.len() >= cfg.min_batch_size;

        if !current.is_empty() && (would_exceed_gas || would_exceed_max || would_exceed_diversity) {
            flush(&mut current, &mut current_miner_counts, &mut plans);
        }

        *current_miner_counts.entry(block.miner_address.clone()).or_insert(0) += 1;
        current.push(block);

        if current.len() >= cfg.batch_size {
            flush(&mut current, &mut current_miner_counts, &mut plans);
        }
    }
    flush(&mut current, &mut current_miner_counts, &mut plans);

    plans
}
