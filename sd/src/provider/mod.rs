//! Market-data provider client
//!
//! The orchestrator treats the provider as an opaque quota-aware callable.
//! Quota exhaustion is a first-class error kind because it pauses the whole
//! cycled list rather than failing a single job.

mod eodhd;
mod mock;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

pub use eodhd::{EodhdClient, EodhdConfig};
pub use mock::MockProvider;

/// Quota tag raised when the provider's daily request budget is spent
pub const DAILY_LIMIT_TAG: &str = "EODHD_DAILY_LIMIT";

/// Errors from provider calls
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Short-window throttling; retry after a delay
    #[error("Provider rate limited")]
    RateLimited { retry_after: Option<std::time::Duration> },

    /// Daily request budget exhausted; the cycled list must pause
    #[error("Quota exceeded: {tag}")]
    QuotaExceeded { tag: String },

    /// Network-level failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// The API answered with a non-success status
    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },
}

impl ProviderError {
    /// Whether a retry can reasonably succeed without operator action
    pub fn is_transient(&self) -> bool {
        match self {
            Self::RateLimited { .. } | Self::Transport(_) => true,
            Self::Api { status, .. } => *status >= 500,
            Self::QuotaExceeded { .. } => false,
        }
    }
}

/// An opaque, quota-aware market-data callable
#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// Perform one API call
    ///
    /// `endpoint` is a path relative to the provider base URL; `params` are
    /// query parameters. The response body is returned as parsed JSON.
    async fn call(&self, endpoint: &str, params: &[(String, String)]) -> Result<Value, ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(ProviderError::RateLimited { retry_after: None }.is_transient());
        assert!(ProviderError::Transport("connection reset".into()).is_transient());
        assert!(
            ProviderError::Api {
                status: 503,
                message: "unavailable".into()
            }
            .is_transient()
        );
        assert!(
            !ProviderError::Api {
                status: 404,
                message: "not found".into()
            }
            .is_transient()
        );
        assert!(
            !ProviderError::QuotaExceeded {
                tag: DAILY_LIMIT_TAG.into()
            }
            .is_transient()
        );
    }
}
