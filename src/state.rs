//! Persisted runtime state (C6 adjacent): restart bookkeeping distinct
//! from the Block store. Tracks in-flight SubmissionBatches so a restart
//! does not double-submit, and per-company ledger sequence numbers.

use crate::errors::{PrfiError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InFlightSubmission {
    pub tx_hash: String,
    pub sent_at: u64,
    pub block_ids: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeState {
    /// Next batch sequence number per company, so restarts keep producing
    /// deterministic `batch_id`s instead of colliding with prior runs.
    #[serde(default)]
    pub batch_sequence: BTreeMap<String, u64>,

    /// In-flight SubmissionBatches keyed by `submission_id`.
    #[serde(default)]
    pub in_flight: BTreeMap<String, InFlightSubmission>,
}

impl RuntimeState {
    pub fn load_or_init(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            let raw = fs::read_to_string(path).map_err(|e| {
                PrfiError::terminal("state", "load_or_init", format!("failed to read {}: {e}", path.display()))
            })?;
            let state: RuntimeState = serde_json::from_str(&raw).map_err(|e| {
                PrfiError::terminal("state", "load_or_init", format!("failed to parse {}: {e}", path.display()))
            })?;
            return Ok(state);
        }

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| {
                    PrfiError::terminal("state", "load_or_init", format!("failed to create {}: {e}", parent.display()))
                })?;
            }
        }

        let init = RuntimeState::default();
        init.save(path)?;
        Ok(init)
    }

    /// Atomic write: write to a temp file, fsync, then rename over the
    /// destination. Never leaves a partially-written state file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| {
                    PrfiError::terminal("state", "save", format!("failed to create {}: {e}", parent.display()))
                })?;
            }
        }

        let json = serde_json::to_string_pretty(self).map_err(|e| {
            PrfiError::terminal("state", "save", format!("failed to serialize state: {e}"))
        })?;

        let tmp_path = path.with_extension("json.tmp");
        {
            use std::io::Write;
            let mut file = fs::File::create(&tmp_path).map_err(|e| {
                PrfiError::terminal("state", "save", format!("failed to create temp file: {e}"))
            })?;
            file.write_all(json.as_bytes()).map_err(|e| {
                PrfiError::terminal("state", "save", format!("failed to write temp file: {e}"))
            })?;
            file.sync_all().map_err(|e| {
                PrfiError::terminal("state", "save", format!("failed to fsync temp file: {e}"))
            })?;
        }

        if let Err(err) = fs::rename(&tmp_path, path) {
            if cfg!(windows) {
                let _ = fs::remove_file(path);
                fs::rename(&tmp_path, path).map_err(|e| {
                    PrfiError::terminal("state", "save", format!("failed to replace state file: {e}"))
                })?;
            } else {
                return Err(PrfiError::terminal("state", "save", format!("failed to replace state file: {err}")));
            }
        }
        Ok(())
    }

    pub fn next_batch_sequence(&mut self, company_id: &str) -> u64 {
        let entry = self.batch_sequence.entry(company_id.to_string()).or_insert(0);
        *entry += 1;
        *entry
    }

    pub fn mark_in_flight(&mut self, submission_id: String, tx_hash: String, block_ids: Vec<String>, sent_at: u64) {
        self.in_flight.insert(
            submission_id,
            InFlightSubmission {
                tx_hash,
                sent_at,
                block_ids,
            },
        );
    }

    pub fn clear_in_flight(&mut self, submission_id: &str) {
        self.in_flight.remove(submission_id);
    }
}
