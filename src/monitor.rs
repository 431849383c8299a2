//! Monitor (C9): watches submitted transactions for confirmation, handles
//! reverts and timeouts.

use crate::chain::PrfiClient;
use crate::errors::{PrfiError, Result};
use crate::store::{BlockStatus, BlockStore};
use crate::submitter::{SubmissionBatch, SubmissionStatus};
use ethers::providers::Middleware;
use ethers::types::H256;
use std::time::{SystemTime, UNIX_EPOCH};

const TIMEOUT_SECS: u64 = 30 * 60;

pub enum PollOutcome {
    StillPending,
    Confirmed { block_number: u64 },
    Reverted,
    TimedOut,
}

/// Polls `transaction_receipt` once. Callers drive the `poll_interval`
/// sleep between calls; this function does not sleep itself so it can be
/// unit tested with a fake client.
pub async fn poll_once(client: &PrfiClient, tx_hash: H256, confirmation_blocks: u64, submitted_at: u64) -> Result<PollOutcome> {
    let receipt = client
        .get_transaction_receipt(tx_hash)
        .await
        .map_err(|e| PrfiError::RpcUnavailable {
            message: format!("eth_getTransactionReceipt failed: {e}"),
        })?;

    let Some(receipt) = receipt else {
        if now_unix().saturating_sub(submitted_at) > TIMEOUT_SECS {
            return Ok(PollOutcome::TimedOut);
        }
        return Ok(PollOutcome::StillPending);
    };

    let status = receipt.status.map(|s| s.as_u64()).unwrap_or(0);
    if status == 0 {
        return Ok(PollOutcome::Reverted);
    }

    let latest = client
        .get_block_number()
        .await
        .map_err(|e| PrfiError::RpcUnavailable {
            message: format!("eth_blockNumber failed: {e}"),
        })?
        .as_u64();
    let receipt_block = receipt.block_number.map(|b| b.as_u64()).unwrap_or(latest);

    if latest.saturating_sub(receipt_block) >= confirmation_blocks {
        Ok(PollOutcome::Confirmed { block_number: receipt_block })
    } else {
        Ok(PollOutcome::StillPending)
    }
}

/// Applies a poll outcome to the batch and its member blocks in the store.
pub fn apply_outcome(store: &BlockStore, batch: &mut SubmissionBatch, outcome: PollOutcome) -> Result<()> {
    match outcome {
        PollOutcome::StillPending => {}
        PollOutcome::Confirmed { block_number } => {
            batch.status = SubmissionStatus::Confirmed;
            batch.confirmed_at = Some(now_unix() * 1000);
            for block_id in &batch.block_ids {
                store.update_status(block_id, BlockStatus::Confirmed, None, Some(block_number))?;
            }
        }
        PollOutcome::Reverted => {
            batch.status = SubmissionStatus::Failed;
            batch.retry_count += 1;
            for block_id in &batch.block_ids {
                store.update_status(block_id, BlockStatus::Pending, None, None)?;
            }
        }
        PollOutcome::TimedOut => {
            for block_id in &batch.block_ids {
                store.update_status(block_id, BlockStatus::Pending, None, None)?;
            }
        }
    }
    Ok(())
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Block;

    fn block(id: &str) -> Block {
        Block {
            block_id: id.to_string(),
            batch_id: "b".to_string(),
            miner_address: "0xabc".to_string(),
            nonce: 1,
            block_hash: "00abc".to_string(),
            events_count: 3,
            merkle_root: "aa".repeat(32),
            difficulty: 2,
            signature: "sig".to_string(),
            public_key: "pub".to_string(),
            points: 0.5,
            mined_at: 1,
            status: BlockStatus::Submitted,
            tx_hash: Some("0xdead".to_string()),
            confirmation_block: None,
            retry_count: 0,
        }
    }

    fn tempdir() -> std::path::PathBuf {
        let mut dir = std::env::temp_dir();
        dir.push(format!("prfi-monitor-test-{}", uuid::Uuid::new_v4()));
        dir
    }

    #[test]
    fn reverted_outcome_reverts_blocks_to_pending_and_increments_retry() {
        let dir = tempdir();
        let store = BlockStore::new(&dir, false).unwrap();
        store.put(&block("b1")).unwrap();

        let mut batch = SubmissionBatch::new(vec!["b1".to_string()]);
        batch.status = SubmissionStatus::Submitted;

        apply_outcome(&store, &mut batch, PollOutcome::Reverted).unwrap();

        assert_eq!(batch.status, SubmissionStatus::Failed);
        assert_eq!(batch.retry_count, 1);
        let reloaded = store.get("b1").unwrap().unwrap();
        assert_eq!(reloaded.status, BlockStatus::Pending);
    }

    #[test]
    fn confirmed_outcome_marks_blocks_confirmed_with_block_number() {
        let dir = tempdir();
        let store = BlockStore::new(&dir, false).unwrap();
        store.put(&block("b1")).unwrap();

        let mut batch = SubmissionBatch::new(vec!["b1".to_string()]);
        batch.status = SubmissionStatus::Submitted;

        apply_outcome(&store, &mut batch, PollOutcome::Confirmed { block_number: 42 }).unwrap();

        assert_eq!(batch.status, SubmissionStatus::Confirmed);
        let reloaded = store.get("b1").unwrap().unwrap();
        assert_eq!(reloaded.status, BlockStatus::Confirmed);
        assert_eq!(reloaded.confirmation_block, Some(42));
    }

    #[test]
    fn timeout_outcome_reverts_blocks_to_pending() {
        let dir = tempdir();
        let store = BlockStore::new(&dir, false).unwrap();
        store.put(&block("b1")).unwrap();

        let mut batch = SubmissionBatch::new(vec!["b1".to_string()]);
        batch.status = SubmissionStatus::Submitted;

        apply_outcome(&store, &mut batch, PollOutcome::TimedOut).unwrap();

        let reloaded = store.get("b1").unwrap().unwrap();
        assert_eq!(reloaded.status, BlockStatus::Pending);
    }
}
