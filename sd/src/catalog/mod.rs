//! Job catalogue
//!
//! Compile-time-typed map from job name to an executable with a uniform
//! signature. Unknown names are a configuration error surfaced when the
//! workflow is validated, never at cycle time.

mod builtin;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::provider::{ProviderClient, ProviderError};

pub use builtin::standard_catalog;

/// How a job failure should be handled
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobErrorKind {
    /// Retry-eligible (network blips, throttling, 5xx)
    Transient,
    /// Programmer error or bad data; fails immediately
    Fatal,
    /// Provider budget spent; pauses the cycled list
    Quota { tag: String },
}

/// Error returned by a job function
#[derive(Debug, Error)]
#[error("{message}")]
pub struct JobError {
    pub kind: JobErrorKind,
    pub message: String,
    pub details: Option<Value>,
}

impl JobError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: JobErrorKind::Transient,
            message: message.into(),
            details: None,
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            kind: JobErrorKind::Fatal,
            message: message.into(),
            details: None,
        }
    }

    pub fn quota(tag: impl Into<String>) -> Self {
        let tag = tag.into();
        Self {
            message: format!("Provider quota exceeded: {}", tag),
            kind: JobErrorKind::Quota { tag },
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl From<ProviderError> for JobError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::QuotaExceeded { tag } => Self::quota(tag),
            ProviderError::RateLimited { .. } | ProviderError::Transport(_) => Self::transient(err.to_string()),
            ProviderError::Api { status, .. } if status >= 500 => Self::transient(err.to_string()),
            ProviderError::Api { status, message } => Self::fatal(format!("API error {}: {}", status, message)),
        }
    }
}

/// Progress reporting handle passed into job functions
///
/// Values are fractions in [0, 1]; out-of-range reports are clamped.
/// Reporting is fire-and-forget so a slow store never stalls a fetch.
#[derive(Clone)]
pub struct ProgressSink {
    tx: mpsc::UnboundedSender<f64>,
}

impl ProgressSink {
    /// Create a sink and the receiver the executor drains
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<f64>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// A sink whose reports go nowhere (tests, ad-hoc probes)
    pub fn discard() -> Self {
        let (tx, _rx) = mpsc::unbounded_channel();
        Self { tx }
    }

    pub fn report(&self, fraction: f64) {
        let _ = self.tx.send(fraction.clamp(0.0, 1.0));
    }
}

/// Execution context handed to every job function
#[derive(Clone)]
pub struct JobContext {
    /// Cancelled when the daemon stops or the job times out
    pub cancel: CancellationToken,
    pub provider: Arc<dyn ProviderClient>,
    pub progress: ProgressSink,
    /// Record metadata (cycledListName, cycleNumber, nodeId for cycle runs)
    pub metadata: Value,
}

/// A registered job executable
#[async_trait]
pub trait JobFn: Send + Sync {
    async fn run(&self, ctx: JobContext) -> Result<Value, JobError>;
}

/// Catalogue entry: the executable plus the descriptive fields that enrich
/// status responses
#[derive(Clone)]
pub struct JobSpec {
    pub name: String,
    pub display_name: String,
    pub description: String,
    pub category: String,
    pub scope: String,
    pub priority: u8,
    pub estimated_duration_secs: Option<u64>,
    pub data_source: String,
    pub tags: Vec<String>,
    pub dependencies: Vec<String>,
    pub cron_definition: Option<String>,
    pub func: Arc<dyn JobFn>,
}

/// Errors from catalogue registration
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CatalogError {
    #[error("Job '{0}' is already registered")]
    Duplicate(String),
}

/// The job catalogue
#[derive(Default, Clone)]
pub struct JobCatalog {
    jobs: HashMap<String, JobSpec>,
}

impl JobCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a job; names are unique
    pub fn register(&mut self, spec: JobSpec) -> Result<(), CatalogError> {
        if self.jobs.contains_key(&spec.name) {
            return Err(CatalogError::Duplicate(spec.name));
        }
        self.jobs.insert(spec.name.clone(), spec);
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Option<&JobSpec> {
        self.jobs.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.jobs.contains_key(name)
    }

    /// Registered names, sorted for stable display
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.jobs.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Noop;

    #[async_trait]
    impl JobFn for Noop {
        async fn run(&self, _ctx: JobContext) -> Result<Value, JobError> {
            Ok(json!({"ok": true}))
        }
    }

    fn spec(name: &str) -> JobSpec {
        JobSpec {
            name: name.to_string(),
            display_name: name.to_string(),
            description: String::new(),
            category: "test".to_string(),
            scope: "exchange".to_string(),
            priority: 5,
            estimated_duration_secs: None,
            data_source: "mock".to_string(),
            tags: vec![],
            dependencies: vec![],
            cron_definition: None,
            func: Arc::new(Noop),
        }
    }

    #[test]
    fn test_register_and_lookup() {
        let mut catalog = JobCatalog::new();
        catalog.register(spec("sync_tickers")).unwrap();
        assert!(catalog.contains("sync_tickers"));
        assert!(catalog.lookup("sync_tickers").is_some());
        assert!(catalog.lookup("nope").is_none());
    }

    #[test]
    fn test_register_duplicate() {
        let mut catalog = JobCatalog::new();
        catalog.register(spec("sync_tickers")).unwrap();
        let err = catalog.register(spec("sync_tickers")).unwrap_err();
        assert_eq!(err, CatalogError::Duplicate("sync_tickers".into()));
    }

    #[test]
    fn test_names_sorted() {
        let mut catalog = JobCatalog::new();
        catalog.register(spec("zeta")).unwrap();
        catalog.register(spec("alpha")).unwrap();
        assert_eq!(catalog.names(), vec!["alpha", "zeta"]);
    }

    #[test]
    fn test_provider_error_mapping() {
        let err: JobError = ProviderError::QuotaExceeded {
            tag: "EODHD_DAILY_LIMIT".into(),
        }
        .into();
        assert_eq!(
            err.kind,
            JobErrorKind::Quota {
                tag: "EODHD_DAILY_LIMIT".into()
            }
        );

        let err: JobError = ProviderError::Transport("reset".into()).into();
        assert_eq!(err.kind, JobErrorKind::Transient);

        let err: JobError = ProviderError::Api {
            status: 500,
            message: "boom".into(),
        }
        .into();
        assert_eq!(err.kind, JobErrorKind::Transient);

        let err: JobError = ProviderError::Api {
            status: 404,
            message: "missing".into(),
        }
        .into();
        assert_eq!(err.kind, JobErrorKind::Fatal);
    }

    #[tokio::test]
    async fn test_progress_sink_clamps() {
        let (sink, mut rx) = ProgressSink::channel();
        sink.report(-0.5);
        sink.report(0.5);
        sink.report(1.5);
        assert_eq!(rx.recv().await.unwrap(), 0.0);
        assert_eq!(rx.recv().await.unwrap(), 0.5);
        assert_eq!(rx.recv().await.unwrap(), 1.0);
    }
}
