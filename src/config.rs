//! Typed configuration, key loading, RPC endpoint selection (C11).

use crate::envelope::HttpMethod;
use crate::errors::{PrfiError, Result};
use ethers::types::{Address, U256};
use serde_json::Value;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct NodeConfig {
    // Retry (C3)
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub jitter: bool,

    // Fallback (C3)
    pub fallback_enabled: bool,
    pub fallback_url: Option<String>,
    pub max_fallback_attempts: u32,

    // Miner (C7)
    pub min_difficulty: u32,
    pub iteration_cap: u64,
    pub events_per_token: u64,

    // Submitter (C9)
    pub rpc_url: String,
    pub contract_address: Address,
    pub private_key_env: String,
    pub chain_id: u64,
    pub batch_size: usize,
    pub min_batch_size: usize,
    pub max_batch_size: usize,
    pub gas_limit: u64,
    pub gas_price_multiplier: f64,
    pub max_gas_price: U256,
    pub confirmation_blocks: u64,
    pub poll_interval: Duration,
    pub max_retries: u32,
    pub retry_delay_secs: u64,
    pub exponential_backoff: bool,

    // Storage (C6)
    pub blocks_directory: PathBuf,
    pub backup_enabled: bool,
    pub state_file: PathBuf,

    // Security (C2)
    pub secret_key_env: String,
    pub signature_validity_window: u64,
    pub require_https: bool,

    // Event intake (C2/C4/C5): the single recurring event this node drives
    // through the guard/ledger/miner pipeline each cycle. `None` when the
    // node only scans/submits blocks mined by another process.
    pub request_timeout_secs: u64,
    pub event_url: Option<String>,
    pub event_type: String,
    pub event_method: HttpMethod,
    pub event_data: Value,
    pub company_id: String,
    pub company_name: String,
    pub wallet_address: String,
    pub min_points: f64,
    pub max_points: f64,
    pub antifraud_max_events_per_hour: u32,
    pub antifraud_max_events_per_day: u32,
    pub antifraud_min_duration_ms: u64,
    pub antifraud_burst_window_secs: u64,
    pub antifraud_max_events_per_burst_window: u32,

    // Ambient
    pub once: bool,
    pub dry_run: bool,
}

#[allow(clippy::too_many_arguments)]
pub struct NodeConfigArgs {
    pub rpc_url: Option<String>,
    pub contract_address: String,
    pub private_key_env: String,
    pub chain_id: u64,
    pub secret_key_env: String,
    pub max_attempts: u32,
    pub initial_delay_secs: f64,
    pub max_delay_secs: f64,
    pub multiplier: f64,
    pub jitter: bool,
    pub fallback_url: Option<String>,
    pub max_fallback_attempts: u32,
    pub min_difficulty: u32,
    pub iteration_cap: u64,
    pub events_per_token: u64,
    pub batch_size: usize,
    pub min_batch_size: usize,
    pub max_batch_size: usize,
    pub gas_limit: u64,
    pub gas_price_multiplier: f64,
    pub max_gas_price_wei: u64,
    pub confirmation_blocks: u64,
    pub poll_interval_secs: u64,
    pub max_retries: u32,
    pub retry_delay_secs: u64,
    pub exponential_backoff: bool,
    pub blocks_directory: PathBuf,
    pub backup_enabled: bool,
    pub state_file: PathBuf,
    pub signature_validity_window: u64,
    pub require_https: bool,
    pub request_timeout_secs: u64,
    pub event_url: Option<String>,
    pub event_type: String,
    pub event_method: String,
    pub event_data: Option<String>,
    pub company_id: String,
    pub company_name: String,
    pub wallet_address: String,
    pub min_points: f64,
    pub max_points: f64,
    pub antifraud_max_events_per_hour: u32,
    pub antifraud_max_events_per_day: u32,
    pub antifraud_min_duration_ms: u64,
    pub antifraud_burst_window_secs: u64,
    pub antifraud_max_events_per_burst_window: u32,
    pub once: bool,
    pub dry_run: bool,
}

impl NodeConfig {
    /// Resolves and validates a full config from CLI args, with an
    /// `OPENSUB`-style env-var fallback for the RPC URL (the teacher's
    /// convention of never requiring secrets on the command line).
    pub fn from_args(args: NodeConfigArgs) -> Result<Self> {
        let rpc_url = args
            .rpc_url
            .or_else(|| std::env::var("PRFI_RPC_URL").ok())
            .ok_or_else(|| PrfiError::ConfigInvalid {
                message: "no rpc url provided: pass --rpc-url or set PRFI_RPC_URL".to_string(),
            })?;

        if rpc_url.contains("alchemy.com/v2/") || rpc_url.contains("infura.io/v3/") {
            tracing::warn!("rpc url looks like it may contain an api key; consider an env var instead of committing it");
        }

        let contract_address = Address::from_str(&args.contract_address).map_err(|e| PrfiError::ConfigInvalid {
            message: format!("invalid contract address '{}': {e}", args.contract_address),
        })?;

        if args.max_attempts == 0 || args.max_attempts > 20 {
            return Err(PrfiError::ConfigInvalid {
                message: "max_attempts must be in 1..=20".to_string(),
            });
        }
        if args.initial_delay_secs <= 0.0 {
            return Err(PrfiError::ConfigInvalid {
                message: "initial_delay must be > 0".to_string(),
            });
        }
        if args.max_delay_secs < args.initial_delay_secs {
            return Err(PrfiError::ConfigInvalid {
                message: "max_delay must be >= initial_delay".to_string(),
            });
        }
        if args.multiplier < 1.0 {
            return Err(PrfiError::ConfigInvalid {
                message: "multiplier must be >= 1".to_string(),
            });
        }
        if !(1..=10).contains(&args.min_difficulty) {
            return Err(PrfiError::ConfigInvalid {
                message: "min_difficulty must be in 1..=10".to_string(),
            });
        }
        if args.events_per_token == 0 {
            return Err(PrfiError::ConfigInvalid {
                message: "events_per_token must be >= 1".to_string(),
            });
        }
        if args.min_batch_size == 0 || args.min_batch_size > args.max_batch_size {
            return Err(PrfiError::ConfigInvalid {
                message: "min_batch_size must be > 0 and <= max_batch_size".to_string(),
            });
        }
        if args.batch_size < args.min_batch_size || args.batch_size > args.max_batch_size {
            tracing::warn!(
                batch_size = args.batch_size,
                min_batch_size = args.min_batch_size,
                max_batch_size = args.max_batch_size,
                "batch_size outside [min_batch_size, max_batch_size]; clamping"
            );
        }
        let batch_size = args.batch_size.clamp(args.min_batch_size, args.max_batch_size);

        let event_method = match args.event_method.to_ascii_uppercase().as_str() {
            "GET" => HttpMethod::Get,
            "POST" => HttpMethod::Post,
            "PUT" => HttpMethod::Put,
            "PATCH" => HttpMethod::Patch,
            "DELETE" => HttpMethod::Delete,
            other => {
                return Err(PrfiError::ConfigInvalid {
                    message: format!("invalid event_method '{other}': expected GET/POST/PUT/PATCH/DELETE"),
                })
            }
        };
        let event_data = match args.event_data {
            Some(raw) => serde_json::from_str(&raw).map_err(|e| PrfiError::ConfigInvalid {
                message: format!("invalid event_data JSON: {e}"),
            })?,
            None => Value::Object(Default::default()),
        };
        if args.event_url.is_some() && args.wallet_address.trim().is_empty() {
            return Err(PrfiError::ConfigInvalid {
                message: "wallet_address is required when event_url is set".to_string(),
            });
        }
        if args.min_points > args.max_points {
            return Err(PrfiError::ConfigInvalid {
                message: "min_points must be <= max_points".to_string(),
            });
        }

        Ok(Self {
            max_attempts: args.max_attempts,
            initial_delay: Duration::from_secs_f64(args.initial_delay_secs),
            max_delay: Duration::from_secs_f64(args.max_delay_secs),
            multiplier: args.multiplier,
            jitter: args.jitter,

            fallback_enabled: args.fallback_url.is_some(),
            fallback_url: args.fallback_url,
            max_fallback_attempts: args.max_fallback_attempts,

            min_difficulty: args.min_difficulty,
            iteration_cap: args.iteration_cap,
            events_per_token: args.events_per_token,

            rpc_url,
            contract_address,
            private_key_env: args.private_key_env,
            chain_id: args.chain_id,
            batch_size,
            min_batch_size: args.min_batch_size,
            max_batch_size: args.max_batch_size,
            gas_limit: args.gas_limit,
            gas_price_multiplier: args.gas_price_multiplier,
            max_gas_price: U256::from(args.max_gas_price_wei),
            confirmation_blocks: args.confirmation_blocks,
            poll_interval: Duration::from_secs(args.poll_interval_secs.max(1)),
            max_retries: args.max_retries,
            retry_delay_secs: args.retry_delay_secs,
            exponential_backoff: args.exponential_backoff,

            blocks_directory: args.blocks_directory,
            backup_enabled: args.backup_enabled,
            state_file: args.state_file,

            secret_key_env: args.secret_key_env,
            signature_validity_window: args.signature_validity_window,
            require_https: args.require_https,

            request_timeout_secs: args.request_timeout_secs,
            event_url: args.event_url,
            event_type: args.event_type,
            event_method,
            event_data,
            company_id: args.company_id,
            company_name: args.company_name,
            wallet_address: args.wallet_address,
            min_points: args.min_points,
            max_points: args.max_points,
            antifraud_max_events_per_hour: args.antifraud_max_events_per_hour,
            antifraud_max_events_per_day: args.antifraud_max_events_per_day,
            antifraud_min_duration_ms: args.antifraud_min_duration_ms,
            antifraud_burst_window_secs: args.antifraud_burst_window_secs,
            antifraud_max_events_per_burst_window: args.antifraud_max_events_per_burst_window,

            once: args.once,
            dry_run: args.dry_run,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_args() -> NodeConfigArgs {
        NodeConfigArgs {
            rpc_url: Some("http://localhost:8545".to_string()),
            contract_address: "0x0000000000000000000000000000000000000001".to_string(),
            private_key_env: "PRFI_PRIVATE_KEY".to_string(),
            chain_id: 1,
            secret_key_env: "PRFI_SECRET_KEY".to_string(),
            max_attempts: 5,
            initial_delay_secs: 0.5,
            max_delay_secs: 30.0,
            multiplier: 2.0,
            jitter: true,
            fallback_url: None,
            max_fallback_attempts: 3,
            min_difficulty: 4,
            iteration_cap: 1_000_000,
            events_per_token: 1000,
            batch_size: 10,
            min_batch_size: 1,
            max_batch_size: 50,
            gas_limit: 500_000,
            gas_price_multiplier: 1.1,
            max_gas_price_wei: 100_000_000_000,
            confirmation_blocks: 12,
            poll_interval_secs: 30,
            max_retries: 3,
            retry_delay_secs: 60,
            exponential_backoff: true,
            blocks_directory: PathBuf::from("/tmp/prfi-blocks"),
            backup_enabled: true,
            state_file: PathBuf::from("/tmp/prfi-state.json"),
            signature_validity_window: 300,
            require_https: true,
            request_timeout_secs: 30,
            event_url: None,
            event_type: "webhook".to_string(),
            event_method: "GET".to_string(),
            event_data: None,
            company_id: "default-company".to_string(),
            company_name: "default-company".to_string(),
            wallet_address: String::new(),
            min_points: 0.1,
            max_points: 1.0,
            antifraud_max_events_per_hour: 100,
            antifraud_max_events_per_day: 1000,
            antifraud_min_duration_ms: 100,
            antifraud_burst_window_secs: 1,
            antifraud_max_events_per_burst_window: 5,
            once: false,
            dry_run: false,
        }
    }

    #[test]
    fn valid_args_build_successfully() {
        assert!(NodeConfig::from_args(base_args()).is_ok());
    }

    #[test]
    fn rejects_max_delay_below_initial_delay() {
        let mut args = base_args();
        args.initial_delay_secs = 10.0;
        args.max_delay_secs = 1.0;
        assert!(NodeConfig::from_args(args).is_err());
    }

    #[test]
    fn rejects_difficulty_out_of_range() {
        let mut args = base_args();
        args.min_difficulty = 0;
        assert!(NodeConfig::from_args(args).is_err());
    }

    #[test]
    fn clamps_batch_size_into_range_with_warning() {
        let mut args = base_args();
        args.batch_size = 1000;
        args.max_batch_size = 50;
        let cfg = NodeConfig::from_args(args).unwrap();
        assert_eq!(cfg.batch_size, 50);
    }

    #[test]
    fn rejects_event_url_without_wallet_address() {
        let mut args = base_args();
        args.event_url = Some("https://ok/".to_string());
        assert!(NodeConfig::from_args(args).is_err());
    }

    #[test]
    fn rejects_unknown_event_method() {
        let mut args = base_args();
        args.event_method = "TRACE".to_string();
        assert!(NodeConfig::from_args(args).is_err());
    }

    #[test]
    fn rejects_inverted_points_bounds() {
        let mut args = base_args();
        args.min_points = 0.9;
        args.max_points = 0.1;
        assert!(NodeConfig::from_args(args).is_err());
    }
}
