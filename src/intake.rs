//! Event intake orchestrator: wires C3 (send) through C4 (guard), C5
//! (ledger), C7 (mine) and C6 (store) into a single pipeline, matching
//! `cliente_descentralizado.py`'s `request()` -> `_mine_block_for_response()`
//! composition on the Rust side.

use crate::antifraud::{calculate_points, AntifraudGuard, AntifraudRules, Candidate};
use crate::envelope::{Event, Signer};
use crate::errors::Result;
use crate::http_client::RequestEngine;
use crate::ledger::{Company, LedgerRegistry};
use crate::metrics::Metrics;
use crate::miner::{mine_block, MinerConfig};
use crate::state::RuntimeState;
use crate::store::{Block, BlockStore};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy)]
pub struct IntakeConfig {
    pub miner: MinerConfig,
    pub min_points: f64,
    pub max_points: f64,
}

/// Owns the antifraud history and per-company ledgers that drive the
/// event -> token pipeline. One `Intake` per process, shared across cycles.
pub struct Intake {
    engine: RequestEngine,
    signer: Signer,
    secret: Vec<u8>,
    guard: AntifraudGuard,
    ledgers: LedgerRegistry,
    metrics: Arc<Metrics>,
}

impl Intake {
    pub fn new(engine: RequestEngine, signer: Signer, secret: Vec<u8>, metrics: Arc<Metrics>) -> Self {
        Self {
            engine,
            signer,
            secret,
            guard: AntifraudGuard::new(),
            ledgers: LedgerRegistry::new(),
            metrics,
        }
    }

    /// Sends `event` through the resilient engine. On a successful
    /// response, runs it through the anti-fraud guard and the company's
    /// ledger; when that append constitutes a Batch, mines and stores the
    /// resulting Block. Returns `Ok(None)` whenever the event succeeded but
    /// did not complete a Batch (the common case between batch boundaries).
    pub async fn process(
        &mut self,
        mut event: Event,
        company: Company,
        rules: &AntifraudRules,
        cfg: &IntakeConfig,
        store: &BlockStore,
        runtime_state: &mut RuntimeState,
    ) -> Result<Option<Block>> {
        let outcome = self.engine.send(&mut event, &self.signer).await?;
        self.metrics.record_request(true, outcome.retries_used, outcome.fallback_used, outcome.elapsed_ms);

        let payload_hash = crate::crypto::sha256_hex(event.canonical_json()?.as_bytes());
        let candidate = Candidate {
            miner: &company.wallet_address,
            request_duration_ms: outcome.elapsed_ms,
            payload_hash: &payload_hash,
            now_unix: now_unix(),
        };
        let violations = self.guard.check_and_record(&candidate, rules);
        if !violations.is_empty() {
            tracing::info!(event_id = %event.event_id, ?violations, "event rejected by antifraud guard");
            return Err(crate::errors::PrfiError::FraudReject {
                entity_id: event.event_id.clone(),
                rules: violations,
            });
        }
        self.metrics.record_event_counted();

        let points = calculate_points(
            outcome.retries_used,
            outcome.fallback_used,
            Duration::from_millis(outcome.elapsed_ms),
            cfg.min_points,
            cfg.max_points,
        );

        let ledger = self.ledgers.get_or_create(company.clone());
        let (_record_id, batch) = ledger.append(
            event.event_id.clone(),
            payload_hash,
            outcome.status_code,
            outcome.elapsed_ms,
            outcome.body.len(),
            runtime_state,
        );

        let Some(batch) = batch else {
            return Ok(None);
        };
        self.metrics.record_batch_created();
        tracing::info!(batch_id = %batch.batch_id, company_id = %company.company_id, "batch constituted, mining");

        let started = Instant::now();
        let block = mine_block(
            company.wallet_address.clone(),
            company.wallet_address.clone(),
            batch,
            cfg.miner,
            points,
            self.secret.clone(),
        )
        .await?;
        self.metrics.record_block_mined(started.elapsed().as_millis() as u64);

        store.put(&block)?;
        tracing::info!(block_id = %block.block_id, nonce = block.nonce, "block mined and stored");
        Ok(Some(block))
    }
}

fn now_unix() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::HttpMethod;
    use crate::http_client::FallbackConfig;
    use crate::retry::RetryConfig;
    use crate::store::BlockStatus;
    use serde_json::json;
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};

    fn secret() -> Vec<u8> {
        b"0123456789abcdef0123456789abcdef".to_vec()
    }

    fn tempdir() -> std::path::PathBuf {
        let mut dir = std::env::temp_dir();
        dir.push(format!("prfi-intake-test-{}", uuid::Uuid::new_v4()));
        dir
    }

    /// Serves `count` consecutive 200 responses on an ephemeral port, the
    /// same minimal HTTP/1.1 shape `tests/common` uses.
    fn start_ok_server(count: usize) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind mock server");
        let addr = listener.local_addr().expect("local_addr");
        std::thread::spawn(move || {
            for _ in 0..count {
                match listener.accept() {
                    Ok((stream, _)) => serve_ok(stream),
                    Err(_) => return,
                }
            }
        });
        format!("http://{addr}/")
    }

    fn serve_ok(mut stream: TcpStream) {
        let mut buf = [0u8; 4096];
        let _ = stream.read(&mut buf);
        let body = "ok";
        let response = format!("HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}", body.len());
        let _ = stream.write_all(response.as_bytes());
        let _ = stream.flush();
    }

    fn permissive_rules() -> AntifraudRules {
        AntifraudRules {
            max_events_per_hour: 1000,
            max_events_per_day: 10000,
            min_duration_ms: 0,
            burst_window_secs: 1,
            max_events_per_burst_window: 1000,
        }
    }

    fn intake_cfg() -> IntakeConfig {
        IntakeConfig {
            miner: MinerConfig {
                min_difficulty: 1,
                iteration_cap: 2_000_000,
            },
            min_points: 0.1,
            max_points: 1.0,
        }
    }

    #[tokio::test]
    async fn a_full_batch_of_events_mines_and_stores_a_block() {
        let url = start_ok_server(3);

        let engine = RequestEngine::new(RetryConfig::default(), FallbackConfig::default(), Duration::from_secs(2)).unwrap();
        let signer = Signer::new(secret(), 300).unwrap();
        let metrics = Arc::new(Metrics::new());
        let mut intake = Intake::new(engine, signer, secret(), metrics);

        let company = Company::new("co-intake", "Acme", "0xminer-intake", 3);
        let rules = permissive_rules();
        let cfg = intake_cfg();
        let dir = tempdir();
        let store = BlockStore::new(&dir, false).unwrap();
        let mut runtime_state = RuntimeState::default();

        let mut last = None;
        for _ in 0..3 {
            let event = Event::new("webhook", url.clone(), HttpMethod::Get, json!({}), 3);
            last = intake
                .process(event, company.clone(), &rules, &cfg, &store, &mut runtime_state)
                .await
                .unwrap();
        }

        let block = last.expect("third event should constitute a batch and mine a block");
        assert_eq!(block.events_count, 3);
        assert_eq!(block.status, BlockStatus::Pending);
        let stored = store.get(&block.block_id).unwrap().unwrap();
        assert_eq!(stored.block_id, block.block_id);
    }

    #[tokio::test]
    async fn fraud_rejection_short_circuits_before_the_ledger() {
        let url = start_ok_server(2);

        let engine = RequestEngine::new(RetryConfig::default(), FallbackConfig::default(), Duration::from_secs(2)).unwrap();
        let signer = Signer::new(secret(), 300).unwrap();
        let metrics = Arc::new(Metrics::new());
        let mut intake = Intake::new(engine, signer, secret(), metrics);

        let company = Company::new("co-burst", "Acme", "0xminer-burst", 1000);
        let rules = AntifraudRules {
            max_events_per_hour: 1000,
            max_events_per_day: 10000,
            min_duration_ms: 0,
            burst_window_secs: 3600,
            max_events_per_burst_window: 1,
        };
        let cfg = intake_cfg();
        let dir = tempdir();
        let store = BlockStore::new(&dir, false).unwrap();
        let mut runtime_state = RuntimeState::default();

        let first = Event::new("webhook", url.clone(), HttpMethod::Get, json!({}), 3);
        intake
            .process(first, company.clone(), &rules, &cfg, &store, &mut runtime_state)
            .await
            .unwrap();

        let second = Event::new("webhook", url, HttpMethod::Get, json!({}), 3);
        let result = intake.process(second, company, &rules, &cfg, &store, &mut runtime_state).await;
        assert!(matches!(result, Err(crate::errors::PrfiError::FraudReject { .. })));
    }
}
