use std::net::SocketAddr;

use thiserror::Error;

use crate::state::ProcessorState;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Backlog full: {backlog} buffers retained (cap {cap})")]
    Overflow { backlog: usize, cap: usize },

    #[error("Cannot {command} while {state}")]
    InvalidTransition {
        command: &'static str,
        state: ProcessorState,
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Processor task is no longer running")]
    ProcessorGone,
}

impl ServerError {
    pub fn invalid_config<S: Into<String>>(msg: S) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// True for the pipeline backpressure signal.
    pub fn is_overflow(&self) -> bool {
        matches!(self, Self::Overflow { .. })
    }
}

pub type Result<T> = std::result::Result<T, ServerError>;

/// Why a client's request was rejected during the handshake.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Malformed request: {0}")]
    Malformed(String),

    #[error("Unsupported method: {0}")]
    UnsupportedMethod(String),

    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(String),

    #[error("Unknown path: {0}")]
    UnknownPath(String),

    #[error("Request exceeds {0} bytes")]
    TooLarge(usize),
}

/// Appending would exceed the client's queue cap.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Client queue full: {queued} bytes queued, {incoming} incoming, cap {cap}")]
pub struct QueueFull {
    pub queued: usize,
    pub incoming: usize,
    pub cap: usize,
}
