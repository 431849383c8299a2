//! Resilient HTTP request engine (C3): retry with backoff, fallback URL,
//! HMAC-signed event envelopes.

use crate::envelope::{Event, Signer};
use crate::errors::{PrfiError, Result};
use crate::retry::{classify_status, delay_for_attempt, retry_after_delay, Retryability, RetryConfig};
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct FallbackConfig {
    pub enabled: bool,
    pub fallback_url: Option<String>,
    pub max_fallback_attempts: u32,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            fallback_url: None,
            max_fallback_attempts: 3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SendOutcome {
    pub status_code: u16,
    pub body: String,
    pub elapsed_ms: u64,
    pub retries_used: u32,
    pub fallback_used: bool,
}

/// Shared, pooled HTTP client plus the retry/fallback/signing policy applied
/// to every `send`.
pub struct RequestEngine {
    client: reqwest::Client,
    retry: RetryConfig,
    fallback: FallbackConfig,
    request_timeout: Duration,
}

impl RequestEngine {
    pub fn new(retry: RetryConfig, fallback: FallbackConfig, request_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| PrfiError::ConfigInvalid {
                message: format!("failed to build http client: {e}"),
            })?;
        Ok(Self {
            client,
            retry,
            fallback,
            request_timeout,
        })
    }

    /// Signs `event` and sends it, applying the retry/fallback algorithm
    /// from spec §4.1. Returns on the first response with status in
    /// [200, 400).
    pub async fn send(&self, event: &mut Event, signer: &Signer) -> Result<SendOutcome> {
        signer.sign(event)?;

        let started = Instant::now();
        let mut retries_used = 0u32;
        let mut fallback_used = false;
        let mut url = event.url.clone();
        let mut fallback_attempts_left = self.fallback.max_fallback_attempts;

        let mut attempt = 1u32;
        loop {
            match self.try_once(event, &url).await {
                Ok((status, body, _retry_after)) if (200..400).contains(&status) => {
                    return Ok(SendOutcome {
                        status_code: status,
                        body,
                        elapsed_ms: started.elapsed().as_millis() as u64,
                        retries_used,
                        fallback_used,
                    });
                }
                Ok((status, _body, retry_after)) => {
                    if classify_status(status) == Retryability::Terminal {
                        return Err(PrfiError::terminal(
                            "http_client",
                            "send",
                            format!("terminal status {status}"),
                        ));
                    }
                    if attempt < event.max_attempts {
                        retries_used += 1;
                        let delay = match retry_after {
                            Some(secs) => retry_after_delay(&self.retry, secs),
                            None => delay_for_attempt(&self.retry, retries_used),
                        };
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        event.attempts = attempt;
                        continue;
                    }
                }
                Err(_network_err) => {
                    if attempt < event.max_attempts {
                        retries_used += 1;
                        tokio::time::sleep(delay_for_attempt(&self.retry, retries_used)).await;
                        attempt += 1;
                        event.attempts = attempt;
                        continue;
                    }
                }
            }

            if self.fallback.enabled && !fallback_used && fallback_attempts_left > 0 {
                if let Some(fallback_url) = self.fallback.fallback_url.clone() {
                    url = fallback_url;
                    fallback_used = true;
                    attempt = 1;
                    event.attempts = 0;
                    fallback_attempts_left -= 1;
                    continue;
                }
            }

            return Err(PrfiError::retryable(
                "http_client",
                "send",
                "retry exhausted and no usable fallback",
            ));
        }
    }

    /// Performs a single HTTP attempt. Returns `(status, body, retry_after_secs)`.
    async fn try_once(&self, event: &Event, url: &str) -> std::result::Result<(u16, String, Option<u64>), reqwest::Error> {
        let canonical_body = event.canonical_json().unwrap_or_default();
        let response = self
            .client
            .request(event.method.as_reqwest(), url)
            .timeout(self.request_timeout)
            .header("X-PRFI-Event-Id", &event.event_id)
            .header("X-PRFI-Nonce", &event.nonce)
            .header("X-PRFI-Signature", format!("sha256={}", event.signature))
            .header("X-PRFI-Timestamp", event.created_at.to_string())
            .body(canonical_body)
            .send()
            .await?;

        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get("Retry-After")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        let body = response.text().await.unwrap_or_default();
        Ok((status, body, retry_after))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::HttpMethod;
    use serde_json::json;

    fn secret() -> Vec<u8> {
        b"0123456789abcdef0123456789abcdef".to_vec()
    }

    #[tokio::test]
    async fn unreachable_endpoint_exhausts_retries_as_retryable() {
        let engine = RequestEngine::new(
            RetryConfig {
                max_attempts: 1,
                ..Default::default()
            },
            FallbackConfig::default(),
            Duration::from_millis(50),
        )
        .unwrap();
        let signer = Signer::new(secret(), 300).unwrap();
        let mut event = Event::new("webhook", "http://127.0.0.1:0/", HttpMethod::Get, json!({}), 1);
        let result = engine.send(&mut event, &signer).await;
        assert!(result.is_err());
    }
}
