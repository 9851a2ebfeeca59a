//! IPC client used by the CLI and by tests

use std::path::{Path, PathBuf};

use tokio::io::BufReader;
use tokio::net::UnixStream;
use tracing::debug;

use super::messages::{ControlMessage, ControlResponse};
use super::{IpcError, read_message, write_message};

pub struct IpcClient {
    socket_path: PathBuf,
}

impl IpcClient {
    pub fn new(socket_path: impl AsRef<Path>) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
        }
    }

    /// Send one request and wait for its response
    pub async fn request(&self, message: ControlMessage) -> Result<ControlResponse, IpcError> {
        debug!(?message, path = %self.socket_path.display(), "request: sending");
        let stream = UnixStream::connect(&self.socket_path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound || e.kind() == std::io::ErrorKind::ConnectionRefused {
                IpcError::NotRunning
            } else {
                IpcError::Io(e)
            }
        })?;

        let (read_half, mut write_half) = stream.into_split();
        write_message(&mut write_half, &message).await?;
        let mut reader = BufReader::new(read_half);
        read_message(&mut reader).await
    }

    /// Whether a daemon answers on the socket
    pub async fn is_alive(&self) -> bool {
        matches!(self.request(ControlMessage::Ping).await, Ok(ControlResponse::Pong { .. }))
    }
}
