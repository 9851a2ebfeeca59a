//! IPC for daemon control
//!
//! JSON-over-newline protocol on a Unix socket. Each request is a single
//! JSON line; each response is a single JSON line. The external HTTP
//! controllers and the CLI both speak this protocol.

mod client;
mod listener;
mod messages;

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

pub use client::IpcClient;
pub use listener::IpcListener;
pub use messages::{ControlMessage, ControlResponse};

/// Errors from IPC transport
#[derive(Debug, Error)]
pub enum IpcError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Daemon is not running")]
    NotRunning,
}

/// Write one JSON line
pub async fn write_message<W, T>(writer: &mut W, message: &T) -> Result<(), IpcError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut line = serde_json::to_string(message).map_err(|e| IpcError::Protocol(e.to_string()))?;
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one JSON line
pub async fn read_message<R, T>(reader: &mut BufReader<R>) -> Result<T, IpcError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut line = String::new();
    let n = reader.read_line(&mut line).await?;
    if n == 0 {
        return Err(IpcError::Protocol("Connection closed".to_string()));
    }
    serde_json::from_str(line.trim_end()).map_err(|e| IpcError::Protocol(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_framing_roundtrip() {
        let (client, server) = tokio::io::duplex(1024);
        let (_, mut client_write) = tokio::io::split(client);
        let (server_read, _) = tokio::io::split(server);
        let mut reader = BufReader::new(server_read);

        write_message(&mut client_write, &ControlMessage::Ping).await.unwrap();
        let message: ControlMessage = read_message(&mut reader).await.unwrap();
        assert_eq!(message, ControlMessage::Ping);
    }

    #[tokio::test]
    async fn test_read_on_closed_connection() {
        let (client, server) = tokio::io::duplex(64);
        drop(client);
        let (server_read, _) = tokio::io::split(server);
        let mut reader = BufReader::new(server_read);

        let result: Result<ControlMessage, _> = read_message(&mut reader).await;
        assert!(result.is_err());
    }
}
