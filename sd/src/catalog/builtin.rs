//! Built-in market-data sync jobs
//!
//! Every job fetches through the provider client, reports fractional
//! progress, and exits early on cancellation. Payload parsing stays
//! shallow: these jobs move data into the store's downstream consumers and
//! summarise what they touched, nothing more.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::debug;

use super::{JobCatalog, JobContext, JobError, JobFn, JobSpec};

/// Exchange whose symbol directory drives the per-symbol jobs
const DEFAULT_EXCHANGE: &str = "US";

/// Symbols fetched per bulk request
const BATCH_SIZE: usize = 50;

/// Build the catalogue the shipped pipeline runs
pub fn standard_catalog() -> JobCatalog {
    let mut catalog = JobCatalog::new();
    for spec in [
        sync_exchanges_spec(),
        sync_tickers_spec(),
        sync_eod_prices_spec(),
        sync_fundamentals_spec(),
        sync_splits_dividends_spec(),
        refresh_indices_spec(),
    ] {
        // Names are compile-time constants here, so duplicates are a bug
        catalog.register(spec).expect("built-in job names are unique");
    }
    catalog
}

/// Pull the symbol directory for the default exchange
async fn fetch_symbols(ctx: &JobContext) -> Result<Vec<String>, JobError> {
    let endpoint = format!("exchange-symbol-list/{}", DEFAULT_EXCHANGE);
    let body = ctx.provider.call(&endpoint, &[]).await?;
    let symbols = body
        .as_array()
        .map(|rows| {
            rows.iter()
                .filter_map(|row| row.get("Code").and_then(|c| c.as_str()))
                .map(String::from)
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();
    debug!(count = symbols.len(), "fetch_symbols: directory loaded");
    Ok(symbols)
}

fn cancelled(ctx: &JobContext) -> Result<(), JobError> {
    if ctx.cancel.is_cancelled() {
        return Err(JobError::transient("cancelled"));
    }
    Ok(())
}

// === sync_exchanges ===

struct SyncExchanges;

#[async_trait]
impl JobFn for SyncExchanges {
    async fn run(&self, ctx: JobContext) -> Result<Value, JobError> {
        let body = ctx.provider.call("exchanges-list", &[]).await?;
        let count = body.as_array().map(|a| a.len()).unwrap_or(0);
        ctx.progress.report(1.0);
        Ok(json!({"exchanges": count}))
    }
}

fn sync_exchanges_spec() -> JobSpec {
    JobSpec {
        name: "sync_exchanges".into(),
        display_name: "Sync Exchanges".into(),
        description: "Refresh the list of exchanges and trading hours".into(),
        category: "reference".into(),
        scope: "global".into(),
        priority: 1,
        estimated_duration_secs: Some(10),
        data_source: "eodhd".into(),
        tags: vec!["reference".into(), "exchanges".into()],
        dependencies: vec![],
        cron_definition: None,
        func: Arc::new(SyncExchanges),
    }
}

// === sync_tickers ===

struct SyncTickers;

#[async_trait]
impl JobFn for SyncTickers {
    async fn run(&self, ctx: JobContext) -> Result<Value, JobError> {
        let symbols = fetch_symbols(&ctx).await?;
        ctx.progress.report(1.0);
        Ok(json!({"exchange": DEFAULT_EXCHANGE, "tickers": symbols.len()}))
    }
}

fn sync_tickers_spec() -> JobSpec {
    JobSpec {
        name: "sync_tickers".into(),
        display_name: "Sync Tickers".into(),
        description: "Refresh the symbol directory for the default exchange".into(),
        category: "reference".into(),
        scope: "exchange".into(),
        priority: 2,
        estimated_duration_secs: Some(30),
        data_source: "eodhd".into(),
        tags: vec!["reference".into(), "tickers".into()],
        dependencies: vec!["sync_exchanges".into()],
        cron_definition: None,
        func: Arc::new(SyncTickers),
    }
}

// === sync_eod_prices ===

struct SyncEodPrices;

#[async_trait]
impl JobFn for SyncEodPrices {
    async fn run(&self, ctx: JobContext) -> Result<Value, JobError> {
        let symbols = fetch_symbols(&ctx).await?;
        let batches: Vec<&[String]> = symbols.chunks(BATCH_SIZE).collect();
        let total = batches.len().max(1);

        let mut rows = 0usize;
        for (i, batch) in batches.iter().enumerate() {
            cancelled(&ctx)?;
            let endpoint = format!("eod-bulk-last-day/{}", DEFAULT_EXCHANGE);
            let params = vec![("symbols".to_string(), batch.join(","))];
            let body = ctx.provider.call(&endpoint, &params).await?;
            rows += body.as_array().map(|a| a.len()).unwrap_or(0);
            ctx.progress.report((i + 1) as f64 / total as f64);
        }

        Ok(json!({"symbols": symbols.len(), "batches": total, "rows": rows}))
    }
}

fn sync_eod_prices_spec() -> JobSpec {
    JobSpec {
        name: "sync_eod_prices".into(),
        display_name: "Sync EOD Prices".into(),
        description: "Fetch end-of-day price bars in bulk batches".into(),
        category: "prices".into(),
        scope: "exchange".into(),
        priority: 3,
        estimated_duration_secs: Some(600),
        data_source: "eodhd".into(),
        tags: vec!["prices".into(), "eod".into()],
        dependencies: vec!["sync_tickers".into()],
        cron_definition: None,
        func: Arc::new(SyncEodPrices),
    }
}

// === sync_fundamentals ===

struct SyncFundamentals;

#[async_trait]
impl JobFn for SyncFundamentals {
    async fn run(&self, ctx: JobContext) -> Result<Value, JobError> {
        let symbols = fetch_symbols(&ctx).await?;
        let total = symbols.len().max(1);

        let mut fetched = 0usize;
        for (i, symbol) in symbols.iter().enumerate() {
            cancelled(&ctx)?;
            let endpoint = format!("fundamentals/{}.{}", symbol, DEFAULT_EXCHANGE);
            let body = ctx.provider.call(&endpoint, &[]).await?;
            if !body.is_null() {
                fetched += 1;
            }
            ctx.progress.report((i + 1) as f64 / total as f64);
        }

        Ok(json!({"symbols": symbols.len(), "fetched": fetched}))
    }
}

fn sync_fundamentals_spec() -> JobSpec {
    JobSpec {
        name: "sync_fundamentals".into(),
        display_name: "Sync Fundamentals".into(),
        description: "Fetch fundamentals documents per symbol".into(),
        category: "fundamentals".into(),
        scope: "symbol".into(),
        priority: 5,
        estimated_duration_secs: Some(3600),
        data_source: "eodhd".into(),
        tags: vec!["fundamentals".into()],
        dependencies: vec!["sync_tickers".into()],
        cron_definition: None,
        func: Arc::new(SyncFundamentals),
    }
}

// === sync_splits_dividends ===

struct SyncSplitsDividends;

#[async_trait]
impl JobFn for SyncSplitsDividends {
    async fn run(&self, ctx: JobContext) -> Result<Value, JobError> {
        let endpoint = format!("eod-bulk-last-day/{}", DEFAULT_EXCHANGE);

        cancelled(&ctx)?;
        let splits = ctx
            .provider
            .call(&endpoint, &[("type".to_string(), "splits".to_string())])
            .await?;
        ctx.progress.report(0.5);

        cancelled(&ctx)?;
        let dividends = ctx
            .provider
            .call(&endpoint, &[("type".to_string(), "dividends".to_string())])
            .await?;
        ctx.progress.report(1.0);

        Ok(json!({
            "splits": splits.as_array().map(|a| a.len()).unwrap_or(0),
            "dividends": dividends.as_array().map(|a| a.len()).unwrap_or(0),
        }))
    }
}

fn sync_splits_dividends_spec() -> JobSpec {
    JobSpec {
        name: "sync_splits_dividends".into(),
        display_name: "Sync Splits & Dividends".into(),
        description: "Fetch corporate actions for the default exchange".into(),
        category: "prices".into(),
        scope: "exchange".into(),
        priority: 4,
        estimated_duration_secs: Some(120),
        data_source: "eodhd".into(),
        tags: vec!["splits".into(), "dividends".into()],
        dependencies: vec!["sync_tickers".into()],
        cron_definition: None,
        func: Arc::new(SyncSplitsDividends),
    }
}

// === refresh_indices ===

struct RefreshIndices;

#[async_trait]
impl JobFn for RefreshIndices {
    async fn run(&self, ctx: JobContext) -> Result<Value, JobError> {
        let body = ctx.provider.call("exchange-symbol-list/INDX", &[]).await?;
        let indices = body
            .as_array()
            .map(|rows| {
                rows.iter()
                    .filter_map(|row| row.get("Code").and_then(|c| c.as_str()))
                    .map(String::from)
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        let total = indices.len().max(1);

        let mut components = 0usize;
        for (i, index) in indices.iter().enumerate() {
            cancelled(&ctx)?;
            let endpoint = format!("fundamentals/{}.INDX", index);
            let body = ctx.provider.call(&endpoint, &[]).await?;
            components += body
                .get("Components")
                .and_then(|c| c.as_object())
                .map(|o| o.len())
                .unwrap_or(0);
            ctx.progress.report((i + 1) as f64 / total as f64);
        }

        Ok(json!({"indices": indices.len(), "components": components}))
    }
}

fn refresh_indices_spec() -> JobSpec {
    JobSpec {
        name: "refresh_indices".into(),
        display_name: "Refresh Indices".into(),
        description: "Refresh index membership and components".into(),
        category: "reference".into(),
        scope: "global".into(),
        priority: 6,
        estimated_duration_secs: Some(300),
        data_source: "eodhd".into(),
        tags: vec!["indices".into()],
        dependencies: vec!["sync_tickers".into()],
        cron_definition: None,
        func: Arc::new(RefreshIndices),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ProgressSink;
    use crate::provider::MockProvider;
    use tokio_util::sync::CancellationToken;

    fn ctx(provider: Arc<MockProvider>) -> JobContext {
        JobContext {
            cancel: CancellationToken::new(),
            provider,
            progress: ProgressSink::discard(),
            metadata: json!({}),
        }
    }

    #[test]
    fn test_standard_catalog_contents() {
        let catalog = standard_catalog();
        assert_eq!(catalog.len(), 6);
        for name in [
            "sync_exchanges",
            "sync_tickers",
            "sync_eod_prices",
            "sync_fundamentals",
            "sync_splits_dividends",
            "refresh_indices",
        ] {
            assert!(catalog.contains(name), "missing {}", name);
        }
    }

    #[tokio::test]
    async fn test_sync_exchanges_counts() {
        let provider = Arc::new(MockProvider::new());
        provider.respond("exchanges-list", json!([{"Code": "US"}, {"Code": "LSE"}]));

        let result = SyncExchanges.run(ctx(provider)).await.unwrap();
        assert_eq!(result["exchanges"], 2);
    }

    #[tokio::test]
    async fn test_sync_eod_prices_batches() {
        let provider = Arc::new(MockProvider::new());
        let symbols: Vec<Value> = (0..120).map(|i| json!({"Code": format!("SYM{}", i)})).collect();
        provider.respond("exchange-symbol-list/US", Value::Array(symbols));
        provider.respond("eod-bulk-last-day/US", json!([{"close": 1.0}]));

        let (sink, mut rx) = ProgressSink::channel();
        let provider_dyn: Arc<MockProvider> = provider.clone();
        let ctx = JobContext {
            cancel: CancellationToken::new(),
            provider: provider_dyn,
            progress: sink,
            metadata: json!({}),
        };

        let result = SyncEodPrices.run(ctx).await.unwrap();
        assert_eq!(result["symbols"], 120);
        assert_eq!(result["batches"], 3);
        // 1 directory call + 3 batch calls
        assert_eq!(provider.call_count(), 4);

        let mut last = 0.0;
        while let Ok(p) = rx.try_recv() {
            assert!(p >= last);
            last = p;
        }
        assert_eq!(last, 1.0);
    }

    #[tokio::test]
    async fn test_quota_error_propagates() {
        let provider = Arc::new(MockProvider::new());
        provider.set_quota_exhausted(true);

        let err = SyncTickers.run(ctx(provider)).await.unwrap_err();
        assert!(matches!(err.kind, super::super::JobErrorKind::Quota { .. }));
    }

    #[tokio::test]
    async fn test_cancellation_short_circuits() {
        let provider = Arc::new(MockProvider::new());
        let symbols: Vec<Value> = (0..100).map(|i| json!({"Code": format!("SYM{}", i)})).collect();
        provider.respond("exchange-symbol-list/US", Value::Array(symbols));

        let mut context = ctx(provider.clone());
        context.cancel.cancel();

        let err = SyncEodPrices.run(context).await.unwrap_err();
        assert_eq!(err.message, "cancelled");
        // Only the directory fetch happened
        assert_eq!(provider.call_count(), 1);
    }
}
