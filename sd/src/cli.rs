//! Command-line interface definitions

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

/// Market-data sync orchestrator
#[derive(Debug, Parser)]
#[command(name = "sd", version, about = "Cycled-list orchestrator for market-data synchronization")]
pub struct Cli {
    /// Path to the YAML configuration file
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level override (trace|debug|info|warn|error)
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Daemon lifecycle
    Daemon {
        #[command(subcommand)]
        command: DaemonCommand,
    },

    /// Cycled-list control
    List {
        #[command(subcommand)]
        command: ListCommand,
    },

    /// Job catalogue and ad-hoc runs
    Jobs {
        #[command(subcommand)]
        command: JobsCommand,
    },

    /// Job record administration
    Records {
        #[command(subcommand)]
        command: RecordsCommand,
    },
}

#[derive(Debug, Subcommand)]
pub enum DaemonCommand {
    /// Start the daemon
    Start {
        /// Stay attached to the terminal instead of detaching
        #[arg(long)]
        foreground: bool,
    },
    /// Stop a running daemon
    Stop,
    /// Show daemon liveness
    Status,
}

#[derive(Debug, Subcommand)]
pub enum ListCommand {
    /// Show the cycled-list status document
    Status {
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
    /// Start cycling
    Start,
    /// Stop cycling
    Stop {
        #[arg(long, default_value = "stopped from CLI")]
        reason: String,
    },
    /// Pause at the next group boundary
    Pause {
        #[arg(long)]
        reason: Option<String>,
    },
    /// Resume a paused list
    Resume,
}

#[derive(Debug, Subcommand)]
pub enum JobsCommand {
    /// List the job catalogue
    List,
    /// Show recent records for one job
    Show {
        name: String,
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Run a job now, outside the cycle
    Run { name: String },
}

#[derive(Debug, Subcommand)]
pub enum RecordsCommand {
    /// Show recent records across all jobs
    List {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Delete one record by id
    Delete { id: String },
    /// Delete all records
    Prune {
        /// Skip the confirmation prompt
        #[arg(long)]
        yes: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_parses() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_daemon_start() {
        let cli = Cli::try_parse_from(["sd", "daemon", "start", "--foreground"]).unwrap();
        match cli.command {
            Command::Daemon {
                command: DaemonCommand::Start { foreground },
            } => assert!(foreground),
            other => panic!("Unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_parse_list_status_json() {
        let cli = Cli::try_parse_from(["sd", "list", "status", "--format", "json"]).unwrap();
        match cli.command {
            Command::List {
                command: ListCommand::Status { format },
            } => assert_eq!(format, OutputFormat::Json),
            other => panic!("Unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_parse_jobs_run() {
        let cli = Cli::try_parse_from(["sd", "jobs", "run", "sync_eod_prices"]).unwrap();
        match cli.command {
            Command::Jobs {
                command: JobsCommand::Run { name },
            } => assert_eq!(name, "sync_eod_prices"),
            other => panic!("Unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_global_config_flag() {
        let cli = Cli::try_parse_from(["sd", "--config", "/tmp/x.yml", "daemon", "status"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/x.yml")));
    }
}
