//! Live MP3 fan-out over HTTP, Icecast style
//!
//! This crate is the sink end of an audio pipeline: encoded MP3 buffers go in
//! through a [`ProcessorHandle`], and every connected HTTP client gets the
//! same byte stream from the moment it joined. A single Tokio task owns the
//! listener, every client socket and every retained buffer.
//!
//! # Features
//!
//! - Plain HTTP/1.0 and HTTP/1.1 `GET` on one mount point (`/stream` by default)
//! - Non-blocking fan-out with a bounded queue per client
//! - Slow clients are evicted, never allowed to hold up the others
//! - Bounded backlog towards the pipeline (`Overflow` means back off)
//! - Every submitted buffer is released exactly once
//! - Optional ICY in-band metadata (`Icy-MetaData: 1`)
//!
//! # Lifecycle
//!
//! `idle → listening ⇄ streaming → draining → stopped`, with `pause`/`resume`
//! gating buffer admission while listening.
//!
//! # Example Usage
//!
//! ```no_run
//! use mp3cast_server::{ProcessorEvent, ServerConfig, StreamFormat, StreamProcessor};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let (handle, mut events, task) =
//!         StreamProcessor::spawn(ServerConfig::default(), StreamFormat::default())?;
//!
//!     let addr = handle.start().await?;
//!     println!("Streaming on http://{}/stream", addr);
//!
//!     // Feed encoded frames from the pipeline
//!     let frame = vec![0xFFu8; 417];
//!     match handle.submit(frame) {
//!         Ok(seq) => println!("Submitted buffer {}", seq),
//!         Err(e) if e.is_overflow() => { /* back off and retry */ }
//!         Err(e) => return Err(e.into()),
//!     }
//!
//!     // Buffers come back through the event channel
//!     if let Some(ProcessorEvent::BufferReleased { seq, outcome }) = events.recv().await {
//!         println!("Buffer {} released ({:?})", seq, outcome);
//!     }
//!
//!     handle.stop().await?;
//!     handle.shutdown().await?;
//!     task.await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod handshake;
pub mod inbox;
pub mod listener;
pub mod metadata;
pub mod processor;
pub mod registry;
mod scheduler;
pub mod state;

// Re-exports
pub use config::{ServerConfig, StationInfo, StreamEncoding, StreamFormat};
pub use error::{ProtocolError, Result, ServerError};
pub use events::{EvictReason, ProcessorEvent, ReleaseOutcome};
pub use inbox::InboxHandle;
pub use processor::{EventReceiver, ProcessorHandle, ProcessorStats, StreamProcessor};
pub use registry::{ClientId, ClientState, ClientSummary};
pub use state::ProcessorState;

/// Crate version, advertised in the `Server` response header
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
