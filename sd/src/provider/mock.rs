//! In-memory provider double for tests and dry runs

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use async_trait::async_trait;
use serde_json::{Value, json};

use super::{DAILY_LIMIT_TAG, ProviderClient, ProviderError};

/// A scripted provider
///
/// Responds from a canned endpoint map, counts calls, and can be flipped
/// into quota-exhausted or flaky modes mid-test.
#[derive(Default)]
pub struct MockProvider {
    responses: Mutex<HashMap<String, Value>>,
    calls: AtomicU32,
    quota_exhausted: AtomicBool,
    /// Fail the next N calls with a transport error
    fail_next: AtomicU32,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a canned response for an endpoint
    pub fn respond(&self, endpoint: &str, body: Value) {
        self.responses.lock().unwrap().insert(endpoint.to_string(), body);
    }

    /// Flip the daily-quota flag
    pub fn set_quota_exhausted(&self, exhausted: bool) {
        self.quota_exhausted.store(exhausted, Ordering::SeqCst);
    }

    /// Make the next `n` calls fail with a transport error
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProviderClient for MockProvider {
    async fn call(&self, endpoint: &str, _params: &[(String, String)]) -> Result<Value, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if self.quota_exhausted.load(Ordering::SeqCst) {
            return Err(ProviderError::QuotaExceeded {
                tag: DAILY_LIMIT_TAG.to_string(),
            });
        }

        let remaining = self.fail_next.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_next.store(remaining - 1, Ordering::SeqCst);
            return Err(ProviderError::Transport("injected failure".to_string()));
        }

        let responses = self.responses.lock().unwrap();
        Ok(responses.get(endpoint).cloned().unwrap_or_else(|| json!([])))
    }
}
