//! Append-only per-company event ledger and batch-threshold counter (C5).

use crate::crypto::{merkle_root, sha256};
use crate::state::RuntimeState;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Company {
    pub company_id: String,
    pub name: String,
    pub wallet_address: String,
    pub events_per_token: u64,
    pub total_events: u64,
    pub current_batch_events: u64,
    pub total_tokens_earned: f64,
    pub registered: bool,
}

impl Company {
    pub fn new(company_id: impl Into<String>, name: impl Into<String>, wallet_address: impl Into<String>, events_per_token: u64) -> Self {
        Self {
            company_id: company_id.into(),
            name: name.into(),
            wallet_address: wallet_address.into(),
            events_per_token: events_per_token.max(1),
            total_events: 0,
            current_batch_events: 0,
            total_tokens_earned: 0.0,
            registered: false,
        }
    }
}

/// A ledger row for a successful event. Append-only: once `batch_id` is set
/// it is never cleared.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub record_id: String,
    pub event_id: String,
    pub company_id: String,
    pub processed_at: u64,
    pub payload_hash: String,
    pub status_code: u16,
    pub request_duration_ms: u64,
    pub response_size: usize,
    pub batch_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    pub batch_id: String,
    pub company_id: String,
    pub events_count: u64,
    pub merkle_root: [u8; 32],
    pub created_at: u64,
}

/// In-memory ledger for a single company. Callers are responsible for
/// persisting `Company`/`Batch` state if it must survive a restart; the
/// block store (C6) persists the resulting mined Blocks.
pub struct EventLedger {
    company: Company,
    records: Vec<EventRecord>,
}

impl EventLedger {
    pub fn new(company: Company) -> Self {
        Self {
            company,
            records: Vec::new(),
        }
    }

    pub fn company(&self) -> &Company {
        &self.company
    }

    /// Appends a successful event to the ledger and advances counters.
    /// Returns a freshly-constituted `Batch` if the threshold was reached.
    /// `batch_id`s are drawn from `runtime_state`'s per-company sequence so
    /// they stay unique across restarts.
    pub fn append(
        &mut self,
        event_id: impl Into<String>,
        payload_hash: String,
        status_code: u16,
        request_duration_ms: u64,
        response_size: usize,
        runtime_state: &mut RuntimeState,
    ) -> (String, Option<Batch>) {
        let record_id = uuid::Uuid::new_v4().to_string();
        let record = EventRecord {
            record_id: record_id.clone(),
            event_id: event_id.into(),
            company_id: self.company.company_id.clone(),
            processed_at: now_millis(),
            payload_hash,
            status_code,
            request_duration_ms,
            response_size,
            batch_id: None,
        };
        self.records.push(record);
        self.company.total_events += 1;
        self.company.current_batch_events += 1;

        let batch = if self.company.current_batch_events == self.company.events_per_token {
            Some(self.constitute_batch(runtime_state))
        } else {
            None
        };

        (record_id, batch)
    }

    /// Selects exactly `events_per_token` most-recent unassigned records in
    /// insertion order, computes the Merkle root over their payload hashes,
    /// assigns them to a new Batch, and resets the counter.
    fn constitute_batch(&mut self, runtime_state: &mut RuntimeState) -> Batch {
        let sequence = runtime_state.next_batch_sequence(&self.company.company_id);
        let batch_id = format!("{}-{}", self.company.company_id, sequence);

        let events_per_token = self.company.events_per_token as usize;
        let unassigned_indices: Vec<usize> = self
            .records
            .iter()
            .enumerate()
            .filter(|(_, r)| r.batch_id.is_none())
            .map(|(i, _)| i)
            .collect();
        let selected = &unassigned_indices[unassigned_indices.len().saturating_sub(events_per_token)..];

        let leaves: Vec<[u8; 32]> = selected
            .iter()
            .map(|&i| {
                let mut hash = [0u8; 32];
                let bytes = hex::decode(&self.records[i].payload_hash).unwrap_or_default();
                if bytes.len() == 32 {
                    hash.copy_from_slice(&bytes);
                } else {
                    hash = sha256(self.records[i].payload_hash.as_bytes());
                }
                hash
            })
            .collect();
        let root = merkle_root(&leaves);

        for &i in selected {
            self.records[i].batch_id = Some(batch_id.clone());
        }

        self.company.current_batch_events = 0;

        Batch {
            batch_id,
            company_id: self.company.company_id.clone(),
            events_count: self.company.events_per_token,
            merkle_root: root,
            created_at: now_millis(),
        }
    }

    pub fn records(&self) -> &[EventRecord] {
        &self.records
    }
}

/// Registry of per-company ledgers, keyed by `company_id`. Ledger writes for
/// a given company are single-writer (a `&mut EventLedger` borrow enforces
/// this at compile time); readers of `records()` may run concurrently with
/// a consistent snapshot once the write borrow is released.
#[derive(Default)]
pub struct LedgerRegistry {
    ledgers: HashMap<String, EventLedger>,
}

impl LedgerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&mut self, company: Company) -> &mut EventLedger {
        self.ledgers
            .entry(company.company_id.clone())
            .or_insert_with(|| EventLedger::new(company))
    }

    pub fn get(&self, company_id: &str) -> Option<&EventLedger> {
        self.ledgers.get(company_id)
    }
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
    use crate::crypto::sha256_hex;

    #[test]
    fn batch_formation_matches_scenario_s4() {
        let company = Company::new("co-1", "Acme", "0xabc", 3);
        let mut ledger = EventLedger::new(company);
        let mut runtime_state = RuntimeState::default();

        let h1 = sha256_hex(b"e1");
        let h2 = sha256_hex(b"e2");
        let h3 = sha256_hex(b"e3");

        let (_, batch1) = ledger.append("e1", h1, 200, 500, 10, &mut runtime_state);
        assert!(batch1.is_none());
        let (_, batch2) = ledger.append("e2", h2, 200, 500, 10, &mut runtime_state);
        assert!(batch2.is_none());
        let (_, batch3) = ledger.append("e3", h3, 200, 500, 10, &mut runtime_state);
        let batch = batch3.expect("batch should form at threshold");

        assert_eq!(batch.events_count, 3);
        assert_eq!(ledger.company().current_batch_events, 0);
        assert_eq!(ledger.company().total_events, 3);

        for record in ledger.records() {
            assert_eq!(record.batch_id.as_deref(), Some(batch.batch_id.as_str()));
        }
    }

    #[test]
    fn total_events_invariant_holds_across_many_batches() {
        let company = Company::new("co-2", "Acme", "0xabc", 2);
        let mut ledger = EventLedger::new(company);
        let mut runtime_state = RuntimeState::default();
        let mut batches_created = 0u64;
        for i in 0..7 {
            let hash = sha256_hex(format!("e{i}").as_bytes());
            let (_, batch) = ledger.append(format!("e{i}"), hash, 200, 500, 10, &mut runtime_state);
            if batch.is_some() {
                batches_created += 1;
            }
        }
        let company = ledger.company();
        assert_eq!(company.total_events, 7);
        assert!(batches_created * company.events_per_token <= company.total_events);
        assert_eq!(
            company.total_events,
            batches_created * company.events_per_token + company.current_batch_events
        );
    }

    #[test]
    fn batch_ids_stay_unique_across_a_simulated_restart() {
        let mut runtime_state = RuntimeState::default();

        let company = Company::new("co-3", "Acme", "0xabc", 1);
        let mut ledger = EventLedger::new(company.clone());
        let (_, batch) = ledger.append("e0", sha256_hex(b"e0"), 200, 500, 10, &mut runtime_state);
        let first_batch_id = batch.unwrap().batch_id;

        // Simulate a restart: a fresh EventLedger (in-memory state lost) but
        // the same persisted RuntimeState (loaded from disk).
        let mut ledger = EventLedger::new(company);
        let (_, batch) = ledger.append("e1", sha256_hex(b"e1"), 200, 500, 10, &mut runtime_state);
        let second_batch_id = batch.unwrap().batch_id;

        assert_ne!(first_batch_id, second_batch_id);
    }
}
