use thiserror::Error;

/// Error taxonomy shared by every component. Each variant carries enough
/// structured context to log without re-deriving it at the call site.
#[derive(Debug, Error)]
pub enum PrfiError {
    #[error("retryable error in {component}/{operation}: {message}")]
    Retryable {
        component: &'static str,
        operation: &'static str,
        message: String,
    },

    #[error("terminal error in {component}/{operation}: {message}")]
    Terminal {
        component: &'static str,
        operation: &'static str,
        message: String,
    },

    #[error("signature invalid for {entity_id}")]
    SignatureInvalid { entity_id: String },

    #[error("fraud guard rejected {entity_id}: {rules:?}")]
    FraudReject {
        entity_id: String,
        rules: Vec<&'static str>,
    },

    #[error("mining timed out for batch {batch_id} after {iterations} iterations")]
    MiningTimeout { batch_id: String, iterations: u64 },

    #[error("storage corrupt for {entity_id}: crc mismatch (expected {expected:#x}, got {actual:#x})")]
    StorageCorrupt {
        entity_id: String,
        expected: u32,
        actual: u32,
    },

    #[error("rpc unavailable: {message}")]
    RpcUnavailable { message: String },

    #[error("transaction reverted: {tx_hash}")]
    TxReverted { tx_hash: String },

    #[error("invalid configuration: {message}")]
    ConfigInvalid { message: String },
}

impl PrfiError {
    pub fn retryable(component: &'static str, operation: &'static str, message: impl Into<String>) -> Self {
        Self::Retryable {
            component,
            operation,
            message: message.into(),
        }
    }

    pub fn terminal(component: &'static str, operation: &'static str, message: impl Into<String>) -> Self {
        Self::Terminal {
            component,
            operation,
            message: message.into(),
        }
    }

    /// Whether the failure kind is recoverable by a retry loop in C3/C9.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PrfiError::Retryable { .. } | PrfiError::RpcUnavailable { .. })
    }
}

pub type Result<T> = std::result::Result<T, PrfiError>;
