//! Processor configuration and stream format parameters

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, ServerError};

/// Default ICY metadata interval (bytes of audio between metadata blocks).
pub const DEFAULT_METADATA_INTERVAL: usize = 16000;

/// Largest request head accepted during the handshake.
pub const MAX_REQUEST_BYTES: usize = 8192;

/// Server-side tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to listen on
    pub bind_address: IpAddr,

    /// TCP port (0 = pick an ephemeral port)
    pub port: u16,

    /// Only requests for this path are served
    pub mount_point: String,

    /// Maximum simultaneous clients, handshaking ones included
    pub max_clients: usize,

    /// Per-client outbound queue cap in bytes
    pub client_queue_bytes: usize,

    /// Evict a client after this long without write progress (ms)
    pub stall_timeout_ms: u64,

    /// Time allowed to deliver a complete request (ms)
    pub handshake_timeout_ms: u64,

    /// Time allowed for a draining client to flush its queue (ms)
    pub drain_timeout_ms: u64,

    /// Offer ICY metadata to clients that ask for it
    pub advertise_metadata: bool,

    /// Audio bytes between ICY metadata blocks
    pub metadata_interval: usize,

    /// Submitted-but-unreleased buffers allowed before `submit` overflows
    pub backlog_cap: usize,

    /// Housekeeping period for timeouts (ms)
    pub tick_interval_ms: u64,

    /// SO_SNDBUF for accepted sockets (None = kernel default)
    pub send_buffer_size: Option<usize>,

    /// Values for the icy-* response headers
    pub station: StationInfo,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 8010,
            mount_point: "/stream".to_string(),
            max_clients: 64,
            client_queue_bytes: 512 * 1024,
            stall_timeout_ms: 5_000,
            handshake_timeout_ms: 3_000,
            drain_timeout_ms: 2_000,
            advertise_metadata: true,
            metadata_interval: DEFAULT_METADATA_INTERVAL,
            backlog_cap: 256,
            tick_interval_ms: 100,
            send_buffer_size: None,
            station: StationInfo::default(),
        }
    }
}

impl ServerConfig {
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.port)
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_millis(self.stall_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// Reject settings the scheduler cannot work with
    pub fn validate(&self) -> Result<()> {
        if !self.mount_point.starts_with('/') {
            return Err(ServerError::invalid_config(format!(
                "mount_point must start with '/': {}",
                self.mount_point
            )));
        }
        if self.max_clients == 0 {
            return Err(ServerError::invalid_config("max_clients must be > 0"));
        }
        if self.client_queue_bytes == 0 {
            return Err(ServerError::invalid_config("client_queue_bytes must be > 0"));
        }
        if self.backlog_cap == 0 {
            return Err(ServerError::invalid_config("backlog_cap must be > 0"));
        }
        if self.metadata_interval == 0 {
            return Err(ServerError::invalid_config("metadata_interval must be > 0"));
        }
        if self.tick_interval_ms == 0 {
            return Err(ServerError::invalid_config("tick_interval_ms must be > 0"));
        }
        if self.stall_timeout_ms == 0 || self.handshake_timeout_ms == 0 {
            return Err(ServerError::invalid_config("timeouts must be > 0"));
        }
        Ok(())
    }
}

/// Station description advertised through icy-* headers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StationInfo {
    pub name: String,
    pub description: String,
    pub genre: String,
    pub url: String,
    /// icy-pub: whether directories may list the stream
    pub public: bool,
}

impl Default for StationInfo {
    fn default() -> Self {
        Self {
            name: "mp3cast".to_string(),
            description: "Live MP3 stream".to_string(),
            genre: "Unknown".to_string(),
            url: String::new(),
            public: false,
        }
    }
}

/// Encoding of the elementary stream handed in by the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamEncoding {
    Mp3,
}

impl StreamEncoding {
    pub fn content_type(&self) -> &'static str {
        match self {
            StreamEncoding::Mp3 => "audio/mpeg",
        }
    }
}

/// Negotiated audio parameters, supplied once before `start`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamFormat {
    pub encoding: StreamEncoding,
    pub sample_rate: u32,
    pub channels: u16,
    /// Bits per second
    pub bitrate: u32,
}

impl Default for StreamFormat {
    fn default() -> Self {
        Self {
            encoding: StreamEncoding::Mp3,
            sample_rate: 44100,
            channels: 2,
            bitrate: 128_000,
        }
    }
}

impl StreamFormat {
    pub fn content_type(&self) -> &'static str {
        self.encoding.content_type()
    }

    pub fn bitrate_kbps(&self) -> u32 {
        self.bitrate / 1000
    }

    /// Bytes per second of encoded audio at the nominal bitrate
    pub fn byte_rate(&self) -> u32 {
        self.bitrate / 8
    }
}
