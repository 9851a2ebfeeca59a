//! IPC listener
//!
//! Accepts Unix-socket connections and dispatches control messages to the
//! cycle controller and state manager. One request/response per connection.

use std::path::{Path, PathBuf};

use tokio::io::BufReader;
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::controller::{ControlError, ControllerHandle};
use crate::state::StateManager;

use super::messages::{ControlMessage, ControlResponse};
use super::{IpcError, read_message, write_message};

/// Daemon version reported on Ping
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub struct IpcListener {
    listener: UnixListener,
    path: PathBuf,
}

impl IpcListener {
    /// Bind the control socket, replacing any stale socket file
    pub fn bind(path: impl AsRef<Path>) -> eyre::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        let listener = UnixListener::bind(&path)?;
        info!(path = %path.display(), "IPC listener bound");
        Ok(Self { listener, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accept and serve connections until the shutdown token fires
    ///
    /// A `Shutdown` message cancels the token itself, which stops both this
    /// loop and the rest of the daemon.
    pub async fn serve(self, controller: ControllerHandle, state: StateManager, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, _addr)) => {
                            let controller = controller.clone();
                            let state = state.clone();
                            let shutdown = shutdown.clone();
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, controller, state, shutdown).await {
                                    debug!(error = %e, "serve: connection error");
                                }
                            });
                        }
                        Err(e) => warn!(error = %e, "serve: accept failed"),
                    }
                }
                _ = shutdown.cancelled() => {
                    debug!("serve: shutdown");
                    break;
                }
            }
        }
        let _ = std::fs::remove_file(&self.path);
    }
}

async fn handle_connection(
    stream: UnixStream,
    controller: ControllerHandle,
    state: StateManager,
    shutdown: CancellationToken,
) -> Result<(), IpcError> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let message: ControlMessage = read_message(&mut reader).await?;
    debug!(?message, "handle_connection: received");

    let response = dispatch(message, &controller, &state, &shutdown).await;
    write_message(&mut write_half, &response).await
}

async fn dispatch(
    message: ControlMessage,
    controller: &ControllerHandle,
    state: &StateManager,
    shutdown: &CancellationToken,
) -> ControlResponse {
    match message {
        ControlMessage::Ping => ControlResponse::Pong {
            version: VERSION.to_string(),
        },
        ControlMessage::Status => match controller.status().await {
            Ok(view) => ControlResponse::Status { view: Box::new(view) },
            Err(e) => ControlResponse::Error { message: e.to_string() },
        },
        ControlMessage::StartList => result_response(controller.start().await),
        ControlMessage::StopList { reason } => result_response(controller.stop(reason).await),
        ControlMessage::Pause { reason } => result_response(controller.pause_manually(reason).await),
        ControlMessage::Resume => result_response(controller.resume_manually().await),
        ControlMessage::RunJob { name } => match controller.run_ad_hoc(name).await {
            Ok(id) => ControlResponse::JobAccepted { id },
            Err(e @ ControlError::AdHocConflict(_)) => ControlResponse::Conflict { message: e.to_string() },
            Err(e) => ControlResponse::Error { message: e.to_string() },
        },
        ControlMessage::ListRecords { name, limit } => {
            let result = match name {
                Some(name) => state.find_by_name(&name, limit).await,
                None => state.find_recent(0).await.map(|mut records| {
                    if let Some(limit) = limit {
                        records.truncate(limit);
                    }
                    records
                }),
            };
            match result {
                Ok(items) => ControlResponse::Records { items },
                Err(e) => ControlResponse::Error { message: e.to_string() },
            }
        }
        ControlMessage::DeleteRecord { id } => match state.delete_record(&id).await {
            Ok(true) => ControlResponse::Deleted { count: 1 },
            Ok(false) => ControlResponse::Error {
                message: format!("Record not found: {}", id),
            },
            Err(e) => ControlResponse::Error { message: e.to_string() },
        },
        ControlMessage::PruneRecords => match state.delete_all_records().await {
            Ok(count) => ControlResponse::Deleted { count },
            Err(e) => ControlResponse::Error { message: e.to_string() },
        },
        ControlMessage::Shutdown => {
            info!("dispatch: shutdown requested over IPC");
            controller.shutdown().await;
            shutdown.cancel();
            ControlResponse::Ok
        }
    }
}

fn result_response(result: Result<(), ControlError>) -> ControlResponse {
    match result {
        Ok(()) => ControlResponse::Ok,
        Err(e) => ControlResponse::Error { message: e.to_string() },
    }
}
