//! sd - CLI entry point for the sync daemon

use std::fs;
use std::path::PathBuf;

use clap::Parser;
use colored::Colorize;
use eyre::{Context, Result};
use tracing::{debug, info};

use syncdaemon::cli::{Cli, Command, DaemonCommand, JobsCommand, ListCommand, OutputFormat, RecordsCommand};
use syncdaemon::config::{Config, data_dir};
use syncdaemon::ipc::{ControlMessage, ControlResponse, IpcClient};
use syncdaemon::status::ListStatusView;
use syncdaemon::{daemon, standard_catalog};

fn setup_logging(cli_log_level: Option<&str>, config_log_level: Option<&str>) -> Result<()> {
    let log_dir = data_dir().join("logs");
    fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    // Priority: CLI --log-level > config file > INFO
    let level = cli_log_level
        .or(config_log_level)
        .map(|s| s.to_uppercase())
        .and_then(|s| s.parse::<tracing::Level>().ok())
        .unwrap_or(tracing::Level::INFO);

    let log_file = fs::File::create(log_dir.join("sd.log")).context("Failed to create log file")?;

    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_ansi(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    info!("Logging initialized (level: {:?})", level);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_log_level = Config::load_log_level(cli.config.as_ref());
    setup_logging(cli.log_level.as_deref(), config_log_level.as_deref()).context("Failed to setup logging")?;

    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;
    debug!(command = ?cli.command, "main: dispatching command");

    match cli.command {
        Command::Daemon { command } => match command {
            DaemonCommand::Start { foreground } => cmd_daemon_start(&config, cli.config.as_ref(), foreground).await,
            DaemonCommand::Stop => cmd_daemon_stop(&config).await,
            DaemonCommand::Status => cmd_daemon_status(&config).await,
        },
        Command::List { command } => match command {
            ListCommand::Status { format } => cmd_list_status(&config, format).await,
            ListCommand::Start => simple_request(&config, ControlMessage::StartList).await,
            ListCommand::Stop { reason } => simple_request(&config, ControlMessage::StopList { reason }).await,
            ListCommand::Pause { reason } => simple_request(&config, ControlMessage::Pause { reason }).await,
            ListCommand::Resume => simple_request(&config, ControlMessage::Resume).await,
        },
        Command::Jobs { command } => match command {
            JobsCommand::List => cmd_jobs_list(),
            JobsCommand::Show { name, limit } => cmd_records_list(&config, Some(name), limit).await,
            JobsCommand::Run { name } => cmd_jobs_run(&config, name).await,
        },
        Command::Records { command } => match command {
            RecordsCommand::List { limit } => cmd_records_list(&config, None, limit).await,
            RecordsCommand::Delete { id } => cmd_records_delete(&config, id).await,
            RecordsCommand::Prune { yes } => cmd_records_prune(&config, yes).await,
        },
    }
}

fn client(config: &Config) -> IpcClient {
    IpcClient::new(&config.socket_path)
}

async fn cmd_daemon_start(config: &Config, config_path: Option<&PathBuf>, foreground: bool) -> Result<()> {
    if client(config).is_alive().await {
        println!("{}", "Daemon is already running".yellow());
        return Ok(());
    }

    if foreground {
        return daemon::run(config.clone()).await;
    }

    // Detach: re-exec ourselves with --foreground
    let exe = std::env::current_exe().context("Cannot locate own executable")?;
    let mut command = std::process::Command::new(exe);
    command.args(["daemon", "start", "--foreground"]);
    if let Some(path) = config_path {
        command.arg("--config").arg(path);
    }
    command
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn()
        .context("Failed to spawn daemon process")?;

    println!("{}", "Daemon started".green());
    Ok(())
}

async fn cmd_daemon_stop(config: &Config) -> Result<()> {
    // Prefer a clean IPC shutdown; fall back to SIGTERM via the pidfile
    match client(config).request(ControlMessage::Shutdown).await {
        Ok(_) => {
            println!("{}", "Daemon stopping".green());
            return Ok(());
        }
        Err(e) => debug!(error = %e, "cmd_daemon_stop: IPC shutdown failed, trying signal"),
    }

    match daemon::read_pid(daemon::pid_file_path()) {
        Some(pid) if daemon::process_alive(pid) => {
            daemon::signal_stop(pid)?;
            println!("{}", format!("Sent SIGTERM to pid {}", pid).green());
            Ok(())
        }
        _ => {
            println!("{}", "Daemon is not running".yellow());
            Ok(())
        }
    }
}

async fn cmd_daemon_status(config: &Config) -> Result<()> {
    match client(config).request(ControlMessage::Ping).await {
        Ok(ControlResponse::Pong { version }) => {
            println!("{} (version {})", "Daemon is running".green(), version);
        }
        _ => println!("{}", "Daemon is not running".red()),
    }
    Ok(())
}

async fn cmd_list_status(config: &Config, format: OutputFormat) -> Result<()> {
    let response = client(config).request(ControlMessage::Status).await?;
    let view = match response {
        ControlResponse::Status { view } => *view,
        ControlResponse::Error { message } => return Err(eyre::eyre!(message)),
        other => return Err(eyre::eyre!("Unexpected response: {:?}", other)),
    };

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&view)?),
        OutputFormat::Text => render_status(&view),
    }
    Ok(())
}

fn paint(color: &str, text: &str) -> colored::ColoredString {
    match color {
        "green" => text.green(),
        "yellow" => text.yellow(),
        "red" => text.red(),
        "blue" => text.blue(),
        _ => text.dimmed(),
    }
}

fn render_status(view: &ListStatusView) {
    println!("{}  {}", view.name.bold(), paint(&view.status_color, &view.status_text));
    println!(
        "  cycle {}/{}  progress {}%  steps {}/{} completed, {} failed",
        view.current_cycle,
        view.max_cycles.map(|m| m.to_string()).unwrap_or_else(|| "∞".to_string()),
        view.progress_percentage,
        view.completed_async_fns,
        view.total_async_fns,
        view.failed_async_fns,
    );
    if let Some(next) = &view.time_until_next_cycle {
        let at = view
            .next_cycle_scheduled
            .and_then(chrono::DateTime::from_timestamp_millis)
            .map(|dt| format!(" ({})", dt.format("%Y-%m-%d %H:%M UTC")))
            .unwrap_or_default();
        println!("  next cycle in {}{}", next, at);
    }
    if !view.pause_conditions.is_empty() {
        println!("  pause conditions: {}", view.pause_conditions.join(", ").yellow());
    }
    for step in &view.job_timeline {
        let marker = match step.status.as_str() {
            "completed" => "✓".green(),
            "failed" => "✗".red(),
            "running" | "retrying" => "▶".cyan(),
            "paused" => "⏸".yellow(),
            "skipped" => "‒".dimmed(),
            _ => "·".normal(),
        };
        println!(
            "  {} {:24} {:10} {:>4.0}%",
            marker, step.display_name, step.status, step.progress_percentage
        );
    }
}

async fn simple_request(config: &Config, message: ControlMessage) -> Result<()> {
    match client(config).request(message).await? {
        ControlResponse::Ok => {
            println!("{}", "OK".green());
            Ok(())
        }
        ControlResponse::Error { message } => Err(eyre::eyre!(message)),
        other => Err(eyre::eyre!("Unexpected response: {:?}", other)),
    }
}

fn cmd_jobs_list() -> Result<()> {
    let catalog = standard_catalog();
    for name in catalog.names() {
        if let Some(spec) = catalog.lookup(name) {
            println!(
                "{:24} {:10} {:10} {}",
                name.bold(),
                spec.category,
                spec.data_source,
                spec.description.dimmed()
            );
        }
    }
    Ok(())
}

async fn cmd_jobs_run(config: &Config, name: String) -> Result<()> {
    match client(config).request(ControlMessage::RunJob { name }).await? {
        ControlResponse::JobAccepted { id } => {
            println!("{} record {}", "Accepted".green(), id);
            Ok(())
        }
        ControlResponse::Conflict { message } => Err(eyre::eyre!("{}", message)),
        ControlResponse::Error { message } => Err(eyre::eyre!(message)),
        other => Err(eyre::eyre!("Unexpected response: {:?}", other)),
    }
}

async fn cmd_records_list(config: &Config, name: Option<String>, limit: usize) -> Result<()> {
    let message = ControlMessage::ListRecords {
        name,
        limit: Some(limit),
    };
    match client(config).request(message).await? {
        ControlResponse::Records { items } => {
            for record in items {
                let status = format!("{}", record.status);
                println!(
                    "{}  {:24} {:10} {:>4.0}%  {}",
                    record.id.dimmed(),
                    record.name,
                    status,
                    record.progress * 100.0,
                    record.error.unwrap_or_default().red(),
                );
            }
            Ok(())
        }
        ControlResponse::Error { message } => Err(eyre::eyre!(message)),
        other => Err(eyre::eyre!("Unexpected response: {:?}", other)),
    }
}

async fn cmd_records_delete(config: &Config, id: String) -> Result<()> {
    match client(config).request(ControlMessage::DeleteRecord { id }).await? {
        ControlResponse::Deleted { count } => {
            println!("{} {} record(s)", "Deleted".green(), count);
            Ok(())
        }
        ControlResponse::Error { message } => Err(eyre::eyre!(message)),
        other => Err(eyre::eyre!("Unexpected response: {:?}", other)),
    }
}

async fn cmd_records_prune(config: &Config, yes: bool) -> Result<()> {
    if !yes {
        return Err(eyre::eyre!("Refusing to delete all records without --yes"));
    }
    match client(config).request(ControlMessage::PruneRecords).await? {
        ControlResponse::Deleted { count } => {
            println!("{} {} record(s)", "Deleted".green(), count);
            Ok(())
        }
        ControlResponse::Error { message } => Err(eyre::eyre!(message)),
        other => Err(eyre::eyre!("Unexpected response: {:?}", other)),
    }
}
