use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::registry::ClientId;
use crate::state::ProcessorState;

/// Why a client was disconnected
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EvictReason {
    /// No write progress within the stall timeout, or fell behind its queue cap
    StallTimeout,
    /// Socket error or the peer closed its side
    PeerReset,
    /// Bad, unsupported or late request
    ProtocolError,
    /// Processor is stopping
    ShutdownRequested,
}

impl std::fmt::Display for EvictReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EvictReason::StallTimeout => write!(f, "stall timeout"),
            EvictReason::PeerReset => write!(f, "peer reset"),
            EvictReason::ProtocolError => write!(f, "protocol error"),
            EvictReason::ShutdownRequested => write!(f, "shutdown requested"),
        }
    }
}

/// How an inbound buffer left the processor
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseOutcome {
    /// Every client that queued it wrote it out
    Consumed,
    /// Nobody was listening, holders were evicted, or it was discarded on stop
    Dropped,
}

/// Notifications sent up to the pipeline framework
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum ProcessorEvent {
    #[serde(rename = "state_changed")]
    StateChanged {
        from: ProcessorState,
        to: ProcessorState,
    },

    #[serde(rename = "client_connected")]
    ClientConnected { client: ClientId, peer: SocketAddr },

    /// Response header written; audio follows
    #[serde(rename = "client_streaming")]
    ClientStreaming {
        client: ClientId,
        peer: SocketAddr,
        metadata: bool,
    },

    #[serde(rename = "client_evicted")]
    ClientEvicted {
        client: ClientId,
        peer: SocketAddr,
        reason: EvictReason,
        bytes_sent: u64,
        /// Missed audio after its queue hit the cap
        overrun: bool,
    },

    /// The pipeline may recycle this buffer's storage
    #[serde(rename = "buffer_released")]
    BufferReleased { seq: u64, outcome: ReleaseOutcome },

    /// Non-fatal condition worth surfacing
    #[serde(rename = "warning")]
    Warning { message: String },

    /// Fatal condition (e.g. the listener could not be opened)
    #[serde(rename = "error")]
    Error { message: String },
}

impl ProcessorEvent {
    pub fn warning<S: Into<String>>(message: S) -> Self {
        Self::Warning {
            message: message.into(),
        }
    }

    pub fn error<S: Into<String>>(message: S) -> Self {
        Self::Error {
            message: message.into(),
        }
    }
}
