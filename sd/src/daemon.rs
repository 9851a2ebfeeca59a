//! Daemon lifecycle
//!
//! Pidfile management, signal handling, and the wiring that assembles the
//! store, provider, catalogue, executor, controller, and IPC listener into
//! one running process.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use eyre::{Context, Result};
use fs2::FileExt;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::catalog::standard_catalog;
use crate::config::{Config, data_dir};
use crate::controller::CycleController;
use crate::events::{create_event_bus, spawn_event_logger};
use crate::executor::JobExecutor;
use crate::ipc::IpcListener;
use crate::provider::{EodhdClient, ProviderClient};
use crate::state::StateManager;

pub fn pid_file_path() -> PathBuf {
    data_dir().join("sd.pid")
}

/// Exclusive pidfile lock held for the daemon's lifetime
///
/// The lock (not just the file's existence) is what enforces single
/// instance, so a crashed daemon never blocks the next start.
pub struct PidFile {
    file: File,
    path: PathBuf,
}

impl PidFile {
    pub fn acquire(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = File::options()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .context("Failed to open pid file")?;
        file.try_lock_exclusive()
            .map_err(|_| eyre::eyre!("Another daemon instance is already running"))?;
        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;
        file.flush()?;
        Ok(Self { file, path })
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Read the daemon pid, if a pidfile exists
pub fn read_pid(path: impl AsRef<Path>) -> Option<i32> {
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// Send SIGTERM to a recorded daemon pid
pub fn signal_stop(pid: i32) -> Result<()> {
    kill(Pid::from_raw(pid), Signal::SIGTERM).context("Failed to signal daemon")?;
    Ok(())
}

/// Whether a process with the pid is alive
pub fn process_alive(pid: i32) -> bool {
    kill(Pid::from_raw(pid), None).is_ok()
}

/// Run the daemon until a signal or an IPC shutdown
pub async fn run(config: Config) -> Result<()> {
    let _pid = PidFile::acquire(pid_file_path())?;
    info!(list = %config.list_name, "Daemon starting");

    let shutdown = CancellationToken::new();

    let state = StateManager::spawn(&config.store_path)?;
    let events = create_event_bus();
    let _event_logger = spawn_event_logger(events.clone(), config.event_log_path.clone());

    let provider: Arc<dyn ProviderClient> =
        Arc::new(EodhdClient::new(config.provider_config()).context("Failed to build provider client")?);
    let catalog = Arc::new(standard_catalog());

    let executor = JobExecutor::new(
        state.clone(),
        catalog.clone(),
        provider,
        events.clone(),
        config.node_id.clone(),
    );

    let controller = CycleController::spawn(
        config.controller_config(),
        config.workflow_definition(),
        catalog,
        state.clone(),
        executor,
        events,
        config.exec_options(),
        shutdown.clone(),
    )
    .await
    .context("Failed to initialise cycle controller")?;

    let listener = IpcListener::bind(&config.socket_path)?;
    let ipc_task = tokio::spawn(listener.serve(controller.clone(), state.clone(), shutdown.clone()));

    let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;

    tokio::select! {
        _ = sigterm.recv() => info!("SIGTERM received"),
        _ = sigint.recv() => info!("SIGINT received"),
        _ = shutdown.cancelled() => info!("Shutdown over IPC"),
    }

    if !shutdown.is_cancelled() {
        controller.shutdown().await;
        shutdown.cancel();
    }
    if let Err(e) = ipc_task.await {
        warn!(error = %e, "IPC task join failed");
    }
    state.shutdown().await;

    info!("Daemon stopped");
    Ok(())
}
