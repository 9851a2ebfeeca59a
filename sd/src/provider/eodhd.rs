//! EODHD client
//!
//! Thin reqwest wrapper with a minimum-interval rate gate and quota
//! detection. The gate serialises callers so concurrent jobs share one
//! request budget.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{DAILY_LIMIT_TAG, ProviderClient, ProviderError};

/// Configuration for the EODHD client
#[derive(Debug, Clone)]
pub struct EodhdConfig {
    pub base_url: String,
    pub api_token: String,
    /// Minimum spacing between requests
    pub min_interval: Duration,
    /// Per-request timeout
    pub request_timeout: Duration,
}

impl Default for EodhdConfig {
    fn default() -> Self {
        Self {
            base_url: "https://eodhd.com/api".to_string(),
            api_token: String::new(),
            min_interval: Duration::from_millis(100),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Marker phrase EODHD puts in 4xx bodies when the daily budget is spent
const DAILY_LIMIT_PHRASE: &str = "daily api request";

pub struct EodhdClient {
    config: EodhdConfig,
    http: reqwest::Client,
    /// Time the last request was released through the gate
    last_call: Mutex<Option<Instant>>,
}

impl EodhdClient {
    pub fn new(config: EodhdConfig) -> eyre::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self {
            config,
            http,
            last_call: Mutex::new(None),
        })
    }

    /// Sleep until the minimum interval since the previous request elapsed
    async fn rate_gate(&self) {
        let mut last = self.last_call.lock().await;
        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < self.config.min_interval {
                let wait = self.config.min_interval - elapsed;
                debug!(?wait, "rate_gate: throttling");
                tokio::time::sleep(wait).await;
            }
        }
        *last = Some(Instant::now());
    }
}

#[async_trait]
impl ProviderClient for EodhdClient {
    async fn call(&self, endpoint: &str, params: &[(String, String)]) -> Result<Value, ProviderError> {
        self.rate_gate().await;

        let url = format!("{}/{}", self.config.base_url.trim_end_matches('/'), endpoint);
        debug!(%url, "call: requesting");

        let mut query: Vec<(String, String)> = params.to_vec();
        query.push(("api_token".to_string(), self.config.api_token.clone()));
        query.push(("fmt".to_string(), "json".to_string()));

        let response = self
            .http
            .get(&url)
            .query(&query)
            .send()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        let status = response.status();
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_secs);
        let body = response
            .text()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            // 429 is short-window throttling unless the body names the
            // daily limit
            if body.to_lowercase().contains(DAILY_LIMIT_PHRASE) {
                warn!("call: daily request limit reached");
                return Err(ProviderError::QuotaExceeded {
                    tag: DAILY_LIMIT_TAG.to_string(),
                });
            }
            return Err(ProviderError::RateLimited { retry_after });
        }
        if status == reqwest::StatusCode::PAYMENT_REQUIRED {
            warn!("call: quota exhausted (402)");
            return Err(ProviderError::QuotaExceeded {
                tag: DAILY_LIMIT_TAG.to_string(),
            });
        }
        if !status.is_success() {
            return Err(ProviderError::Api {
                status: status.as_u16(),
                message: truncate(&body, 200),
            });
        }

        serde_json::from_str(&body).map_err(|e| ProviderError::Api {
            status: status.as_u16(),
            message: format!("Invalid JSON payload: {}", e),
        })
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &s[..end])
    }
}
