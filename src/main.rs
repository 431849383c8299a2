use clap::Parser;
use ethers::types::H256;
use eyre::{eyre, Result};
use fs2::FileExt;
use prfi_core::antifraud::AntifraudRules;
use prfi_core::config::{NodeConfig, NodeConfigArgs};
use prfi_core::envelope::Event;
use prfi_core::http_client::{FallbackConfig, RequestEngine};
use prfi_core::intake::{Intake, IntakeConfig};
use prfi_core::ledger::Company;
use prfi_core::metrics::Metrics;
use prfi_core::miner::MinerConfig;
use prfi_core::retry::RetryConfig;
use prfi_core::state::RuntimeState;
use prfi_core::store::BlockStore;
use prfi_core::submitter::{SubmissionBatch, SubmitterConfig};
use prfi_core::{chain, envelope, monitor, scanner, submitter};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// PRFI node: runs the ledger/mining/submission/monitoring loop for one
/// signing identity against one chain.
#[derive(Parser, Debug)]
#[command(name = "prfi-node", version, about = "PRFI resilient event pipeline and proof-of-work minting node")]
struct Args {
    /// JSON-RPC endpoint. Falls back to PRFI_RPC_URL if omitted.
    #[arg(long, env = "PRFI_RPC_URL")]
    rpc_url: Option<String>,

    #[arg(long, env = "PRFI_CONTRACT_ADDRESS")]
    contract_address: String,

    /// Name of the env var holding the signing private key (never passed
    /// directly on the command line).
    #[arg(long, default_value = "PRFI_PRIVATE_KEY")]
    private_key_env: String,

    #[arg(long, env = "PRFI_CHAIN_ID")]
    chain_id: u64,

    /// Name of the env var holding the HMAC signing secret (>= 32 bytes).
    #[arg(long, default_value = "PRFI_SECRET_KEY")]
    secret_key_env: String,

    #[arg(long, default_value_t = 5)]
    max_attempts: u32,
    #[arg(long, default_value_t = 0.5)]
    initial_delay_secs: f64,
    #[arg(long, default_value_t = 30.0)]
    max_delay_secs: f64,
    #[arg(long, default_value_t = 2.0)]
    multiplier: f64,
    #[arg(long, default_value_t = true)]
    jitter: bool,

    #[arg(long)]
    fallback_url: Option<String>,
    #[arg(long, default_value_t = 3)]
    max_fallback_attempts: u32,

    #[arg(long, default_value_t = 4)]
    min_difficulty: u32,
    #[arg(long, default_value_t = 1_000_000)]
    iteration_cap: u64,
    #[arg(long, default_value_t = 1000)]
    events_per_token: u64,

    #[arg(long, default_value_t = 10)]
    batch_size: usize,
    #[arg(long, default_value_t = 1)]
    min_batch_size: usize,
    #[arg(long, default_value_t = 50)]
    max_batch_size: usize,
    #[arg(long, default_value_t = 500_000)]
    gas_limit: u64,
    #[arg(long, default_value_t = 1.1)]
    gas_price_multiplier: f64,
    #[arg(long, default_value_t = 100_000_000_000)]
    max_gas_price_wei: u64,
    #[arg(long, default_value_t = 12)]
    confirmation_blocks: u64,
    #[arg(long, default_value_t = 30)]
    poll_interval_secs: u64,
    #[arg(long, default_value_t = 3)]
    max_retries: u32,
    #[arg(long, default_value_t = 60)]
    retry_delay_secs: u64,
    #[arg(long, default_value_t = true)]
    exponential_backoff: bool,

    #[arg(long, default_value = "./data/blocks")]
    blocks_directory: PathBuf,
    #[arg(long, default_value_t = true)]
    backup_enabled: bool,
    #[arg(long, default_value = "./data/state.json")]
    state_file: PathBuf,

    #[arg(long, default_value_t = 300)]
    signature_validity_window: u64,
    #[arg(long, default_value_t = true)]
    require_https: bool,

    #[arg(long, default_value_t = 30)]
    request_timeout_secs: u64,

    /// URL of the single event this node drives through the guard/ledger/
    /// miner pipeline each cycle. Omit to run a scan/submit-only node.
    #[arg(long)]
    event_url: Option<String>,
    #[arg(long, default_value = "webhook")]
    event_type: String,
    #[arg(long, default_value = "GET")]
    event_method: String,
    /// JSON body sent with the event. Defaults to `{}`.
    #[arg(long)]
    event_data: Option<String>,

    #[arg(long, default_value = "default-company")]
    company_id: String,
    #[arg(long, default_value = "default-company")]
    company_name: String,
    /// Required when `--event-url` is set; identifies the miner/company in
    /// mined Blocks and antifraud history.
    #[arg(long, default_value = "")]
    wallet_address: String,
    #[arg(long, default_value_t = 0.1)]
    min_points: f64,
    #[arg(long, default_value_t = 1.0)]
    max_points: f64,
    #[arg(long, default_value_t = 100)]
    antifraud_max_events_per_hour: u32,
    #[arg(long, default_value_t = 1000)]
    antifraud_max_events_per_day: u32,
    #[arg(long, default_value_t = 100)]
    antifraud_min_duration_ms: u64,
    #[arg(long, default_value_t = 1)]
    antifraud_burst_window_secs: u64,
    #[arg(long, default_value_t = 5)]
    antifraud_max_events_per_burst_window: u32,

    /// Run a single scan/mine/submit/monitor cycle and exit, instead of
    /// looping forever.
    #[arg(long)]
    once: bool,

    /// Skip RPC/contract writes; log what would have happened.
    #[arg(long)]
    dry_run: bool,

    #[arg(long, default_value = "./data/prfi-node.lock")]
    lockfile: PathBuf,
}

impl Args {
    fn into_node_config_args(self) -> NodeConfigArgs {
        NodeConfigArgs {
            rpc_url: self.rpc_url,
            contract_address: self.contract_address,
            private_key_env: self.private_key_env,
            chain_id: self.chain_id,
            secret_key_env: self.secret_key_env,
            max_attempts: self.max_attempts,
            initial_delay_secs: self.initial_delay_secs,
            max_delay_secs: self.max_delay_secs,
            multiplier: self.multiplier,
            jitter: self.jitter,
            fallback_url: self.fallback_url,
            max_fallback_attempts: self.max_fallback_attempts,
            min_difficulty: self.min_difficulty,
            iteration_cap: self.iteration_cap,
            events_per_token: self.events_per_token,
            batch_size: self.batch_size,
            min_batch_size: self.min_batch_size,
            max_batch_size: self.max_batch_size,
            gas_limit: self.gas_limit,
            gas_price_multiplier: self.gas_price_multiplier,
            max_gas_price_wei: self.max_gas_price_wei,
            confirmation_blocks: self.confirmation_blocks,
            poll_interval_secs: self.poll_interval_secs,
            max_retries: self.max_retries,
            retry_delay_secs: self.retry_delay_secs,
            exponential_backoff: self.exponential_backoff,
            blocks_directory: self.blocks_directory,
            backup_enabled: self.backup_enabled,
            state_file: self.state_file,
            signature_validity_window: self.signature_validity_window,
            require_https: self.require_https,
            request_timeout_secs: self.request_timeout_secs,
            event_url: self.event_url,
            event_type: self.event_type,
            event_method: self.event_method,
            event_data: self.event_data,
            company_id: self.company_id,
            company_name: self.company_name,
            wallet_address: self.wallet_address,
            min_points: self.min_points,
            max_points: self.max_points,
            antifraud_max_events_per_hour: self.antifraud_max_events_per_hour,
            antifraud_max_events_per_day: self.antifraud_max_events_per_day,
            antifraud_min_duration_ms: self.antifraud_min_duration_ms,
            antifraud_burst_window_secs: self.antifraud_burst_window_secs,
            antifraud_max_events_per_burst_window: self.antifraud_max_events_per_burst_window,
            once: self.once,
            dry_run: self.dry_run,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env is expected in most deployments; env vars set directly
    // by the process supervisor take precedence either way.
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let lockfile_path = args.lockfile.clone();
    let node_args = args.into_node_config_args();

    if node_args.require_https {
        if let Some(url) = &node_args.rpc_url {
            if url.starts_with("http://") && !url.contains("127.0.0.1") && !url.contains("localhost") {
                warn!(rpc_url = %url, "require_https is set but rpc_url is plaintext http");
            }
        }
    }

    let cfg = NodeConfig::from_args(node_args).map_err(|e| eyre!("invalid configuration: {e}"))?;

    if let Some(parent) = lockfile_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let lockfile = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .open(&lockfile_path)
        .map_err(|e| eyre!("failed to open lockfile {}: {e}", lockfile_path.display()))?;
    lockfile
        .try_lock_exclusive()
        .map_err(|_| eyre!("another prfi-node instance is already running (lockfile: {})", lockfile_path.display()))?;

    let private_key = std::env::var(&cfg.private_key_env)
        .map_err(|_| eyre!("missing env var {} holding the signing private key", cfg.private_key_env))?;
    let secret_key = std::env::var(&cfg.secret_key_env)
        .map_err(|_| eyre!("missing env var {} holding the HMAC signing secret", cfg.secret_key_env))?;
    let secret_bytes = secret_key.into_bytes();

    let client = if cfg.dry_run {
        info!("dry_run enabled: skipping chain connection");
        None
    } else {
        Some(chain::connect(&cfg.rpc_url, &private_key, cfg.chain_id, cfg.contract_address).await?)
    };

    if chain::is_poa_chain(cfg.chain_id) {
        info!(chain_id = cfg.chain_id, "configured chain is a known PoA chain");
    }

    let store = BlockStore::new(&cfg.blocks_directory, cfg.backup_enabled)?;
    let mut runtime_state = RuntimeState::load_or_init(&cfg.state_file).map_err(|e| eyre!("failed to load runtime state: {e}"))?;
    let metrics = Arc::new(Metrics::new());

    let mut intake = if cfg.event_url.is_some() {
        let engine = RequestEngine::new(
            RetryConfig {
                max_attempts: cfg.max_attempts,
                initial_delay: cfg.initial_delay,
                max_delay: cfg.max_delay,
                multiplier: cfg.multiplier,
                jitter: cfg.jitter,
            },
            FallbackConfig {
                enabled: cfg.fallback_enabled,
                fallback_url: cfg.fallback_url.clone(),
                max_fallback_attempts: cfg.max_fallback_attempts,
            },
            Duration::from_secs(cfg.request_timeout_secs),
        )
        .map_err(|e| eyre!("failed to build request engine: {e}"))?;
        let signer = envelope::Signer::new(secret_bytes.clone(), cfg.signature_validity_window)
            .map_err(|e| eyre!("invalid security config: {e}"))?;
        Some(Intake::new(engine, signer, secret_bytes.clone(), metrics.clone()))
    } else {
        None
    };

    info!(
        chain_id = cfg.chain_id,
        blocks_directory = %cfg.blocks_directory.display(),
        once = cfg.once,
        event_intake_enabled = intake.is_some(),
        "prfi-node starting"
    );

    loop {
        if let Err(e) = run_cycle(&cfg, &store, &mut runtime_state, client.as_ref(), &metrics, intake.as_mut(), &secret_bytes).await {
            error!(error = %e, "cycle failed");
        }

        if cfg.once {
            break;
        }
        tokio::time::sleep(cfg.poll_interval).await;
    }

    lockfile.unlock().ok();
    Ok(())
}

/// One intake -> scan -> batch -> submit -> monitor pass.
#[allow(clippy::too_many_arguments)]
async fn run_cycle(
    cfg: &NodeConfig,
    store: &BlockStore,
    runtime_state: &mut RuntimeState,
    client: Option<&Arc<chain::PrfiClient>>,
    metrics: &Arc<Metrics>,
    intake: Option<&mut Intake>,
    secret: &[u8],
) -> Result<()> {
    if let (Some(intake), Some(event_url)) = (intake, &cfg.event_url) {
        let event = Event::new(cfg.event_type.clone(), event_url.clone(), cfg.event_method, cfg.event_data.clone(), cfg.max_attempts);
        let company = Company::new(cfg.company_id.clone(), cfg.company_name.clone(), cfg.wallet_address.clone(), cfg.events_per_token);
        let rules = AntifraudRules {
            max_events_per_hour: cfg.antifraud_max_events_per_hour,
            max_events_per_day: cfg.antifraud_max_events_per_day,
            min_duration_ms: cfg.antifraud_min_duration_ms,
            burst_window_secs: cfg.antifraud_burst_window_secs,
            max_events_per_burst_window: cfg.antifraud_max_events_per_burst_window,
        };
        let intake_cfg = IntakeConfig {
            miner: MinerConfig {
                min_difficulty: cfg.min_difficulty,
                iteration_cap: cfg.iteration_cap,
            },
            min_points: cfg.min_points,
            max_points: cfg.max_points,
        };
        match intake.process(event, company, &rules, &intake_cfg, store, runtime_state).await {
            Ok(Some(block)) => info!(block_id = %block.block_id, "event intake mined a block"),
            Ok(None) => {}
            Err(e) => warn!(error = %e, "event intake failed"),
        }
        runtime_state
            .save(&cfg.state_file)
            .map_err(|e| eyre!("failed to persist runtime state: {e}"))?;
    }

    let pending = scanner::scan_pending(store, cfg.min_difficulty, secret, cfg.signature_validity_window).map_err(|e| eyre!(e.to_string()))?;
    if pending.is_empty() {
        return Ok(());
    }
    info!(count = pending.len(), "found pending blocks");

    let ordered = scanner::prioritize(pending);
    let batcher_cfg = scanner::BatcherConfig {
        batch_size: cfg.batch_size,
        min_batch_size: cfg.min_batch_size,
        max_batch_size: cfg.max_batch_size,
        gas_limit: cfg.gas_limit,
        gas_per_block: 21_000,
    };
    let plans = scanner::build_batches(ordered, &batcher_cfg);
    info!(batches = plans.len(), "built submission batches");

    let Some(client) = client else {
        info!("dry_run enabled: skipping on-chain submission");
        return Ok(());
    };

    let submitter_cfg = SubmitterConfig {
        gas_limit: cfg.gas_limit,
        gas_price_multiplier: cfg.gas_price_multiplier,
        max_gas_price: cfg.max_gas_price,
        confirmation_blocks: cfg.confirmation_blocks,
        max_retries: cfg.max_retries,
        retry_delay_secs: cfg.retry_delay_secs,
        exponential_backoff: cfg.exponential_backoff,
    };

    for plan in plans {
        let mut batch = SubmissionBatch::new(plan.block_ids.clone());
        match submitter::submit(client.clone(), cfg.contract_address, store, &mut batch, &submitter_cfg).await {
            Ok(()) => {
                metrics.record_block_submitted();
                if let Some(tx_hash) = batch.tx_hash {
                    runtime_state.mark_in_flight(
                        batch.submission_id.clone(),
                        format!("{tx_hash:#x}"),
                        batch.block_ids.clone(),
                        batch.submitted_at.unwrap_or(0),
                    );
                    runtime_state
                        .save(&cfg.state_file)
                        .map_err(|e| eyre!("failed to persist runtime state: {e}"))?;

                    poll_until_settled(client, store, &mut batch, tx_hash, cfg.confirmation_blocks).await;

                    runtime_state.clear_in_flight(&batch.submission_id);
                    runtime_state
                        .save(&cfg.state_file)
                        .map_err(|e| eyre!("failed to persist runtime state: {e}"))?;

                    if batch.status == submitter::SubmissionStatus::Confirmed {
                        metrics.record_block_confirmed(0);
                    } else {
                        metrics.record_tx_failed();
                    }
                }
            }
            Err(e) => {
                metrics.record_tx_failed();
                warn!(error = %e, "submission failed for batch");
            }
        }
    }

    Ok(())
}

/// Polls a just-submitted transaction to a terminal outcome (confirmed,
/// reverted, or timed out), applying the outcome to the store as it goes.
async fn poll_until_settled(client: &Arc<chain::PrfiClient>, store: &BlockStore, batch: &mut SubmissionBatch, tx_hash: H256, confirmation_blocks: u64) {
    loop {
        let outcome = match monitor::poll_once(client.as_ref(), tx_hash, confirmation_blocks, batch.submitted_at.unwrap_or(0)).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(error = %e, "poll failed, will retry");
                tokio::time::sleep(Duration::from_secs(5)).await;
                continue;
            }
        };

        let is_terminal = !matches!(outcome, monitor::PollOutcome::StillPending);
        if let Err(e) = monitor::apply_outcome(store, batch, outcome) {
            warn!(error = %e, "failed to apply poll outcome to store");
        }
        if is_terminal {
            return;
        }
        tokio::time::sleep(Duration::from_secs(5)).await;
    }
}
