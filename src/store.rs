//! Durable, crash-safe persistence of mined blocks and batches (C6).

use crate::errors::{PrfiError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BlockStatus {
    Pending,
    Submitted,
    Confirmed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Block {
    pub block_id: String,
    pub batch_id: String,
    pub miner_address: String,
    pub nonce: u64,
    pub block_hash: String,
    pub events_count: u64,
    pub merkle_root: String,
    pub difficulty: u32,
    pub signature: String,
    pub public_key: String,
    pub points: f64,
    pub mined_at: u64,
    pub status: BlockStatus,
    pub tx_hash: Option<String>,
    pub confirmation_block: Option<u64>,
    pub retry_count: u32,
}

/// On-disk envelope: schema version + CRC32 of the canonical body, so
/// corruption is detectable without trusting the OS filesystem alone.
#[derive(Debug, Serialize, Deserialize)]
struct StoredRecord {
    schema_version: u32,
    saved_at: u64,
    crc32: u32,
    block: Block,
}

pub struct BlockStore {
    blocks_directory: PathBuf,
    backup_enabled: bool,
}

impl BlockStore {
    pub fn new(blocks_directory: impl Into<PathBuf>, backup_enabled: bool) -> Result<Self> {
        let blocks_directory = blocks_directory.into();
        fs::create_dir_all(&blocks_directory).map_err(|e| {
            PrfiError::terminal("store", "init", format!("failed to create {}: {e}", blocks_directory.display()))
        })?;
        if backup_enabled {
            fs::create_dir_all(blocks_directory.join("backups")).map_err(|e| {
                PrfiError::terminal("store", "init", format!("failed to create backups dir: {e}"))
            })?;
        }
        Ok(Self {
            blocks_directory,
            backup_enabled,
        })
    }

    fn path_for(&self, block_id: &str) -> PathBuf {
        self.blocks_directory.join(format!("{block_id}.json"))
    }

    fn backup_path_for(&self, block_id: &str) -> PathBuf {
        self.blocks_directory.join("backups").join(format!("{block_id}.json"))
    }

    /// Writes `block`, fsyncing the write. Idempotent: writing identical
    /// content twice succeeds without error.
    pub fn put(&self, block: &Block) -> Result<()> {
        let body = serde_json::to_vec(block).map_err(|e| {
            PrfiError::terminal("store", "put", format!("serialize failed: {e}"))
        })?;
        let crc = crc32fast::hash(&body);
        let record = StoredRecord {
            schema_version: SCHEMA_VERSION,
            saved_at: now_millis(),
            crc32: crc,
            block: block.clone(),
        };
        let json = serde_json::to_string_pretty(&record).map_err(|e| {
            PrfiError::terminal("store", "put", format!("serialize record failed: {e}"))
        })?;

        let path = self.path_for(&block.block_id);
        atomic_write(&path, &json)?;

        if self.backup_enabled {
            atomic_write(&self.backup_path_for(&block.block_id), &json)?;
        }
        Ok(())
    }

    /// Reads a block by id. A CRC mismatch returns `StorageCorrupt`; the
    /// file is left in place (quarantined, not deleted).
    pub fn get(&self, block_id: &str) -> Result<Option<Block>> {
        let path = self.path_for(block_id);
        if !path.exists() {
            return Ok(None);
        }
        self.read_record(&path).map(|r| Some(r.block))
    }

    fn read_record(&self, path: &Path) -> Result<StoredRecord> {
        let raw = fs::read_to_string(path).map_err(|e| {
            PrfiError::terminal("store", "get", format!("read failed: {e}"))
        })?;
        let record: StoredRecord = serde_json::from_str(&raw).map_err(|e| {
            PrfiError::terminal("store", "get", format!("parse failed: {e}"))
        })?;
        let body = serde_json::to_vec(&record.block).map_err(|e| {
            PrfiError::terminal("store", "get", format!("reserialize failed: {e}"))
        })?;
        let actual = crc32fast::hash(&body);
        if actual != record.crc32 {
            return Err(PrfiError::StorageCorrupt {
                entity_id: record.block.block_id.clone(),
                expected: record.crc32,
                actual,
            });
        }
        Ok(record)
    }

    /// Lists all blocks with `status`. Corrupt records are skipped and
    /// logged rather than failing the whole scan.
    pub fn list_by_status(&self, status: BlockStatus) -> Result<Vec<Block>> {
        let mut out = Vec::new();
        let entries = fs::read_dir(&self.blocks_directory).map_err(|e| {
            PrfiError::terminal("store", "list_by_status", format!("read_dir failed: {e}"))
        })?;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match self.read_record(&path) {
                Ok(record) if record.block.status == status => out.push(record.block),
                Ok(_) => {}
                Err(PrfiError::StorageCorrupt { entity_id, .. }) => {
                    tracing::warn!(block_id = %entity_id, "quarantined corrupt block record");
                }
                Err(e) => {
                    tracing::warn!(error = %e, path = %path.display(), "failed to read block record");
                }
            }
        }
        Ok(out)
    }

    /// Transitions `block_id` to `new_status`, fsyncing the write.
    pub fn update_status(&self, block_id: &str, new_status: BlockStatus, tx_hash: Option<String>, confirmation_block: Option<u64>) -> Result<Block> {
        let mut block = self.get(block_id)?.ok_or_else(|| {
            PrfiError::terminal("store", "update_status", format!("unknown block {block_id}"))
        })?;
        block.status = new_status;
        if tx_hash.is_some() {
            block.tx_hash = tx_hash;
        }
        if confirmation_block.is_some() {
            block.confirmation_block = confirmation_block;
        }
        self.put(&block)?;
        Ok(block)
    }
}

fn atomic_write(path: &Path, contents: &str) -> Result<()> {
    let tmp_path = path.with_extension("json.tmp");
    {
        let file = fs::File::create(&tmp_path).map_err(|e| {
            PrfiError::terminal("store", "atomic_write", format!("create tmp failed: {e}"))
        })?;
        use std::io::Write;
        let mut file = file;
        file.write_all(contents.as_bytes()).map_err(|e| {
            PrfiError::terminal("store", "atomic_write", format!("write tmp failed: {e}"))
        })?;
        file.sync_all().map_err(|e| {
            PrfiError::terminal("store", "atomic_write", format!("fsync failed: {e}"))
        })?;
    }
    if let Err(err) = fs::rename(&tmp_path, path) {
        if cfg!(windows) {
            let _ = fs::remove_file(path);
            fs::rename(&tmp_path, path).map_err(|e| {
                PrfiError::terminal("store", "atomic_write", format!("replace failed: {e}"))
            })?;
        } else {
            return Err(PrfiError::terminal(
                "store",
                "atomic_write",
                format!("rename failed: {err}"),
            ));
        }
    }
    Ok(())
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

    fn sample_block(id: &str) -> Block {
        Block {
            block_id: id.to_string(),
            batch_id: "co-1-1".to_string(),
            miner_address: "0xabc".to_string(),
            nonce: 42,
            block_hash: "00deadbeef".to_string(),
            events_count: 3,
            merkle_root: "aa".repeat(32),
            difficulty: 2,
            signature: "sig".to_string(),
            public_key: "pub".to_string(),
            points: 0.4,
            mined_at: 1,
            status: BlockStatus::Pending,
            tx_hash: None,
            confirmation_block: None,
            retry_count: 0,
        }
    }

    #[test]
    fn round_trip_preserves_all_fields() {
        let dir = tempdir();
        let store = BlockStore::new(&dir, false).unwrap();
        let block = sample_block("b1");
        store.put(&block).unwrap();
        let loaded = store.get("b1").unwrap().unwrap();
        assert_eq!(loaded.block_id, block.block_id);
        assert_eq!(loaded.block_hash, block.block_hash);
        assert_eq!(loaded.points, block.points);
    }

    #[test]
    fn list_by_status_filters_correctly() {
        let dir = tempdir();
        let store = BlockStore::new(&dir, false).unwrap();
        store.put(&sample_block("b1")).unwrap();
        let mut confirmed = sample_block("b2");
        confirmed.status = BlockStatus::Confirmed;
        store.put(&confirmed).unwrap();

        let pending = store.list_by_status(BlockStatus::Pending).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].block_id, "b1");
    }

    #[test]
    fn corrupt_record_is_quarantined_not_deleted() {
        let dir = tempdir();
        let store = BlockStore::new(&dir, false).unwrap();
        store.put(&sample_block("b1")).unwrap();

        let path = store.path_for("b1");
        let mut raw: serde_json::Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        raw["crc32"] = serde_json::json!(0xdeadbeef_u32);
        fs::write(&path, serde_json::to_string_pretty(&raw).unwrap()).unwrap();

        let result = store.get("b1");
        assert!(matches!(result, Err(PrfiError::StorageCorrupt { .. })));
        assert!(path.exists());
    }

    fn tempdir() -> PathBuf {
        let mut dir = std::env::temp_dir();
        dir.push(format!("prfi-store-test-{}", uuid::Uuid::new_v4()));
        dir
    }
}
