//! Configuration for the sync daemon
//!
//! YAML file loaded from an explicit `--config` path or default locations.
//! Every field has a default so a bare `sd daemon start` works against the
//! stock pipeline.

use std::path::{Path, PathBuf};
use std::time::Duration;

use eyre::Result;
use serde::{Deserialize, Serialize};

use crate::controller::ControllerConfig;
use crate::domain::{WorkflowDefinition, WorkflowStep};
use crate::executor::{ExecOptions, RetryPolicy};
use crate::provider::EodhdConfig;

/// Provider connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSettings {
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// API token; also read from SD_API_TOKEN when empty
    #[serde(default)]
    pub api_token: String,

    /// Minimum spacing between requests (milliseconds)
    #[serde(default = "default_min_interval_ms")]
    pub min_interval_ms: u64,

    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_base_url() -> String {
    "https://eodhd.com/api".to_string()
}

fn default_min_interval_ms() -> u64 {
    100
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_token: String::new(),
            min_interval_ms: default_min_interval_ms(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Cycled list name; keys the status document
    #[serde(default = "default_list_name")]
    pub list_name: String,

    /// Identifier stamped into record metadata as nodeId
    #[serde(default = "default_node_id")]
    pub node_id: String,

    /// Begin cycling as soon as the daemon starts
    #[serde(default = "default_autostart")]
    pub autostart: bool,

    /// Stop with overall_status=completed after this many cycles
    #[serde(default)]
    pub max_cycles: Option<u32>,

    /// Delay between cycles in milliseconds; absent means back to back
    #[serde(default)]
    pub cycle_interval_ms: Option<u64>,

    #[serde(default = "default_store_path")]
    pub store_path: PathBuf,

    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,

    #[serde(default = "default_event_log_path")]
    pub event_log_path: PathBuf,

    /// trace | debug | info | warn | error
    #[serde(default)]
    pub log_level: Option<String>,

    #[serde(default)]
    pub retry: RetryPolicy,

    /// Per-job timeout in milliseconds; absent disables timeouts
    #[serde(default)]
    pub job_timeout_ms: Option<u64>,

    #[serde(default)]
    pub provider: ProviderSettings,

    /// Ordered workflow steps of the cycled list
    #[serde(default = "default_workflow")]
    pub workflow: Vec<WorkflowStep>,
}

fn default_list_name() -> String {
    "market-sync".to_string()
}

fn default_node_id() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "local".to_string())
}

fn default_autostart() -> bool {
    true
}

/// Base directory for daemon state
pub fn data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("syncdaemon")
}

fn default_store_path() -> PathBuf {
    data_dir().join("records.db")
}

fn default_socket_path() -> PathBuf {
    data_dir().join("sd.sock")
}

fn default_event_log_path() -> PathBuf {
    data_dir().join("events.jsonl")
}

/// The stock pipeline: reference data first, market data fanned out, then
/// the per-symbol heavyweights
fn default_workflow() -> Vec<WorkflowStep> {
    vec![
        WorkflowStep::new("Exchanges", "sync_exchanges"),
        WorkflowStep::new("Tickers", "sync_tickers"),
        WorkflowStep::new("EOD Prices", "sync_eod_prices").in_group("market-data"),
        WorkflowStep::new("Splits & Dividends", "sync_splits_dividends").in_group("market-data"),
        WorkflowStep::new("Fundamentals", "sync_fundamentals"),
        WorkflowStep::new("Indices", "refresh_indices"),
    ]
}

impl Default for Config {
    fn default() -> Self {
        Self {
            list_name: default_list_name(),
            node_id: default_node_id(),
            autostart: default_autostart(),
            max_cycles: None,
            cycle_interval_ms: None,
            store_path: default_store_path(),
            socket_path: default_socket_path(),
            event_log_path: default_event_log_path(),
            log_level: None,
            retry: RetryPolicy::default(),
            job_timeout_ms: None,
            provider: ProviderSettings::default(),
            workflow: default_workflow(),
        }
    }
}

impl Config {
    /// Load config from an explicit path, default locations, or defaults
    pub fn load(path: Option<&PathBuf>) -> Result<Self> {
        if let Some(config_path) = path {
            let content = std::fs::read_to_string(config_path)?;
            let config: Config = serde_yaml::from_str(&content)?;
            return Ok(config);
        }

        let default_paths = [
            dirs::config_dir().map(|p| p.join("syncdaemon").join("config.yml")),
            Some(PathBuf::from("syncdaemon.yml")),
        ];

        for path in default_paths.iter().flatten() {
            if path.exists() {
                let content = std::fs::read_to_string(path)?;
                let config: Config = serde_yaml::from_str(&content)?;
                return Ok(config);
            }
        }

        Ok(Config::default())
    }

    /// Save config to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Read just the log level without failing on other fields
    pub fn load_log_level(path: Option<&PathBuf>) -> Option<String> {
        Self::load(path).ok().and_then(|c| c.log_level)
    }

    pub fn workflow_definition(&self) -> WorkflowDefinition {
        WorkflowDefinition::new(&self.list_name, self.workflow.clone())
    }

    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            list_name: self.list_name.clone(),
            node_id: self.node_id.clone(),
            autostart: self.autostart,
            max_cycles: self.max_cycles,
            cycle_interval: self.cycle_interval_ms.map(Duration::from_millis),
        }
    }

    pub fn exec_options(&self) -> ExecOptions {
        ExecOptions {
            retry: self.retry.clone(),
            timeout: self.job_timeout_ms.map(Duration::from_millis),
        }
    }

    pub fn provider_config(&self) -> EodhdConfig {
        let api_token = if self.provider.api_token.is_empty() {
            std::env::var("SD_API_TOKEN").unwrap_or_default()
        } else {
            self.provider.api_token.clone()
        };
        EodhdConfig {
            base_url: self.provider.base_url.clone(),
            api_token,
            min_interval: Duration::from_millis(self.provider.min_interval_ms),
            request_timeout: Duration::from_millis(self.provider.request_timeout_ms),
        }
    }
}
