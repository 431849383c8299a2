//! Event envelope construction and HMAC signing/verification (C2).

use crate::crypto::{hmac_sha256_hex, hmac_sha256_verify};
use crate::errors::{PrfiError, Result};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    pub fn as_reqwest(&self) -> reqwest::Method {
        match self {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Patch => reqwest::Method::PATCH,
            HttpMethod::Delete => reqwest::Method::DELETE,
        }
    }
}

/// One outbound HTTP attempt envelope with metadata and signature.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_id: String,
    pub event_type: String,
    pub url: String,
    pub method: HttpMethod,
    pub headers: std::collections::BTreeMap<String, String>,
    pub data: Value,
    pub created_at: u64,
    pub attempts: u32,
    pub max_attempts: u32,
    #[serde(default)]
    pub signature: String,
    #[serde(default)]
    pub nonce: String,
}

impl Event {
    pub fn new(event_type: impl Into<String>, url: impl Into<String>, method: HttpMethod, data: Value, max_attempts: u32) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            event_type: event_type.into(),
            url: url.into(),
            method,
            headers: Default::default(),
            data,
            created_at: now_millis(),
            attempts: 0,
            max_attempts: max_attempts.max(1),
            signature: String::new(),
            nonce: String::new(),
        }
    }

    /// Canonical JSON of every field except `signature`: keys sorted
    /// ascending, no whitespace, UTF-8.
    pub fn canonical_json(&self) -> Result<String> {
        let mut value = serde_json::to_value(self)
            .map_err(|e| PrfiError::terminal("envelope", "canonicalize", e.to_string()))?;
        if let Value::Object(ref mut map) = value {
            map.remove("signature");
            let sorted = sort_object(map);
            return serde_json::to_string(&sorted)
                .map_err(|e| PrfiError::terminal("envelope", "canonicalize", e.to_string()));
        }
        Err(PrfiError::terminal("envelope", "canonicalize", "event did not serialize to an object"))
    }
}

fn sort_object(map: &Map<String, Value>) -> Value {
    let mut sorted = serde_json::Map::new();
    let mut keys: Vec<&String> = map.keys().collect();
    keys.sort();
    for key in keys {
        sorted.insert(key.clone(), map[key].clone());
    }
    Value::Object(sorted)
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Generates `len` random bytes, hex-encoded. Must be >= 16 bytes per §3.
pub fn generate_nonce(len: usize) -> String {
    let mut bytes = vec![0u8; len.max(16)];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Signer/verifier bound to a single company's secret key.
pub struct Signer {
    secret: Vec<u8>,
    pub validity_window_secs: u64,
}

impl Signer {
    pub fn new(secret: impl Into<Vec<u8>>, validity_window_secs: u64) -> Result<Self> {
        let secret = secret.into();
        if secret.len() < 32 {
            return Err(PrfiError::ConfigInvalid {
                message: "secret_key must be at least 32 bytes".to_string(),
            });
        }
        Ok(Self {
            secret,
            validity_window_secs: if validity_window_secs == 0 { 300 } else { validity_window_secs },
        })
    }

    /// Signs `event` in place, assigning `nonce` and `signature`.
    pub fn sign(&self, event: &mut Event) -> Result<()> {
        event.nonce = generate_nonce(16);
        let canonical = event.canonical_json()?;
        let message = format!("{canonical}{}", event.nonce);
        event.signature = hmac_sha256_hex(&self.secret, message.as_bytes());
        Ok(())
    }

    /// Verifies `event.signature` in constant time, and rejects
    /// envelopes whose `created_at` is outside the validity window.
    pub fn verify(&self, event: &Event) -> Result<()> {
        let canonical = event.canonical_json()?;
        let message = format!("{canonical}{}", event.nonce);
        if !hmac_sha256_verify(&self.secret, message.as_bytes(), &event.signature) {
            return Err(PrfiError::SignatureInvalid {
                entity_id: event.event_id.clone(),
            });
        }
        let now = now_millis();
        let age_secs = now.saturating_sub(event.created_at) / 1000;
        if age_secs > self.validity_window_secs {
            return Err(PrfiError::SignatureInvalid {
                entity_id: event.event_id.clone(),
            });
        }
        Ok(())
    }
}
