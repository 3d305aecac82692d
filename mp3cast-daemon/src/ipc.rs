//! Unix socket control server
//!
//! One line-oriented command per connection; the reply is written back and
//! the connection closed.

use anyhow::{Context, Result};
use mp3cast_server::ProcessorHandle;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Notify;
use tracing::{debug, error, info};

use crate::socket_utils::secure_socket_permissions;

/// Control command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IpcCommand {
    Start,
    Stop,
    Pause,
    Resume,
    Status,
    Title(String),
    Quit,
}

impl IpcCommand {
    pub fn parse(s: &str) -> Result<Self> {
        let line = s.trim();
        let (word, rest) = match line.split_once(char::is_whitespace) {
            Some((word, rest)) => (word, rest.trim()),
            None => (line, ""),
        };

        match word.to_lowercase().as_str() {
            "start" => Ok(Self::Start),
            "stop" => Ok(Self::Stop),
            "pause" => Ok(Self::Pause),
            "resume" => Ok(Self::Resume),
            "status" => Ok(Self::Status),
            "title" if !rest.is_empty() => Ok(Self::Title(rest.to_string())),
            "title" => anyhow::bail!("Usage: title <text>"),
            "quit" | "exit" | "shutdown" => Ok(Self::Quit),
            _ => anyhow::bail!("Unknown command: {}", line),
        }
    }
}

/// Unix socket control server
pub struct IpcServer {
    listener: UnixListener,
    socket_path: PathBuf,
    handle: ProcessorHandle,
    quit: Arc<Notify>,
}

impl IpcServer {
    /// Bind the control socket. `quit` is notified on a `quit` command.
    pub fn new(socket_path: &Path, handle: ProcessorHandle, quit: Arc<Notify>) -> Result<Self> {
        // Stale socket from a previous run
        let _ = std::fs::remove_file(socket_path);

        let listener = UnixListener::bind(socket_path).context("Failed to bind Unix socket")?;
        secure_socket_permissions(socket_path)?;

        info!("Control socket listening on {}", socket_path.display());

        Ok(Self {
            listener,
            socket_path: socket_path.to_path_buf(),
            handle,
            quit,
        })
    }

    /// Accept connections until the listener fails
    pub async fn run(&self) -> Result<()> {
        loop {
            let (stream, _) = self
                .listener
                .accept()
                .await
                .context("Failed to accept connection")?;

            let handle = self.handle.clone();
            let quit = Arc::clone(&self.quit);
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, handle, quit).await {
                    error!("Control connection error: {}", e);
                }
            });
        }
    }
}

impl Drop for IpcServer {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.socket_path);
    }
}

/// Handle a single control connection
pub async fn handle_connection(
    mut stream: UnixStream,
    handle: ProcessorHandle,
    quit: Arc<Notify>,
) -> Result<()> {
    let mut buffer = [0u8; 1024];
    let n = stream.read(&mut buffer).await?;

    if n == 0 {
        return Ok(());
    }

    let request = String::from_utf8_lossy(&buffer[..n]);
    debug!("Received control command: {}", request.trim());

    let response = match IpcCommand::parse(&request) {
        Ok(command) => execute(command, &handle, &quit).await,
        Err(e) => format!("Error: {}", e),
    };

    stream.write_all(response.as_bytes()).await?;
    stream.write_all(b"\n").await?;
    stream.flush().await?;

    Ok(())
}

/// Run one command against the processor and render the reply
pub async fn execute(command: IpcCommand, handle: &ProcessorHandle, quit: &Notify) -> String {
    let result = match command {
        IpcCommand::Start => handle
            .start()
            .await
            .map(|addr| format!("Listening on {}", addr)),
        IpcCommand::Stop => handle.stop().await.map(|_| "Stopped".to_string()),
        IpcCommand::Pause => handle.pause().await.map(|_| "Paused".to_string()),
        IpcCommand::Resume => handle.resume().await.map(|_| "Resumed".to_string()),
        IpcCommand::Title(title) => handle
            .set_stream_title(title)
            .await
            .map(|_| "Title updated".to_string()),
        IpcCommand::Status => match handle.stats().await {
            Ok(stats) => {
                return serde_json::to_string(&stats)
                    .unwrap_or_else(|e| format!("Error: {}", e));
            }
            Err(e) => Err(e),
        },
        IpcCommand::Quit => {
            info!("Received quit command");
            quit.notify_one();
            Ok("Shutting down".to_string())
        }
    };

    match result {
        Ok(message) => message,
        Err(e) => format!("Error: {}", e),
    }
}
