//! Framework boundary: the handle the pipeline drives and the task it spawns

use std::net::SocketAddr;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::config::{ServerConfig, StreamFormat};
use crate::error::{Result, ServerError};
use crate::events::ProcessorEvent;
use crate::inbox::{BufferInbox, InboxHandle};
use crate::registry::ClientSummary;
use crate::scheduler::Scheduler;
use crate::state::ProcessorState;

/// Lifecycle commands, each with its reply channel
#[derive(Debug)]
pub(crate) enum Command {
    Start(oneshot::Sender<Result<SocketAddr>>),
    /// Replied once the processor reaches Stopped
    Stop(oneshot::Sender<Result<()>>),
    Pause(oneshot::Sender<Result<()>>),
    Resume(oneshot::Sender<Result<()>>),
    SetStreamTitle(String, oneshot::Sender<()>),
    Stats(oneshot::Sender<ProcessorStats>),
    Shutdown(oneshot::Sender<()>),
}

/// Point-in-time view of the processor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessorStats {
    pub state: ProcessorState,
    pub paused: bool,
    pub listen_addr: Option<SocketAddr>,
    pub clients: usize,
    pub streaming_clients: usize,
    pub backlog: usize,
    pub backlog_cap: usize,
    pub retained_buffers: usize,
    pub buffers_admitted: u64,
    pub buffers_released: u64,
    pub clients_evicted: u64,
    pub bytes_sent: u64,
    pub stream_title: Option<String>,
    pub client_list: Vec<ClientSummary>,
}

/// Receiver for [`ProcessorEvent`]s
///
/// Unbounded: every inbound buffer yields exactly one
/// [`ProcessorEvent::BufferReleased`], and none may be dropped. Keep reading
/// it for the life of the processor, or drop it to discard events; holding
/// it without reading grows memory with every buffer submitted.
pub type EventReceiver = mpsc::UnboundedReceiver<ProcessorEvent>;

/// The processor task. Owns every piece of mutable state; run it with
/// [`run`](Self::run) on any Tokio runtime, a current-thread one included.
pub struct StreamProcessor {
    scheduler: Scheduler,
}

impl StreamProcessor {
    /// Build the processor. Nothing is bound until `start`.
    pub fn new(
        config: ServerConfig,
        format: StreamFormat,
    ) -> Result<(Self, ProcessorHandle, EventReceiver)> {
        config.validate()?;

        let (inbox, inbox_handle) = BufferInbox::new(config.backlog_cap);
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let scheduler = Scheduler::new(config, format, inbox, command_rx, event_tx);
        let handle = ProcessorHandle {
            commands: command_tx,
            inbox: inbox_handle,
        };
        Ok((Self { scheduler }, handle, event_rx))
    }

    /// Build and spawn on the current runtime
    pub fn spawn(
        config: ServerConfig,
        format: StreamFormat,
    ) -> Result<(ProcessorHandle, EventReceiver, JoinHandle<()>)> {
        let (processor, handle, events) = Self::new(config, format)?;
        let task = tokio::spawn(processor.run());
        Ok((handle, events, task))
    }

    /// Event loop. Returns after `shutdown` or once every handle is dropped.
    pub async fn run(self) {
        self.scheduler.run().await;
    }
}

/// Cloneable, thread-safe control surface for the pipeline
#[derive(Debug, Clone)]
pub struct ProcessorHandle {
    commands: mpsc::UnboundedSender<Command>,
    inbox: InboxHandle,
}

impl ProcessorHandle {
    /// Hand one encoded buffer to the processor; never blocks.
    ///
    /// `Overflow` means the backlog cap is reached and the caller should back
    /// off. Buffers submitted while paused wait for `resume`.
    pub fn submit(&self, payload: impl Into<Bytes>) -> Result<u64> {
        self.inbox.submit(payload)
    }

    /// Buffers submitted and not yet released
    pub fn backlog(&self) -> usize {
        self.inbox.backlog()
    }

    pub fn inbox(&self) -> &InboxHandle {
        &self.inbox
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .map_err(|_| ServerError::ProcessorGone)?;
        rx.await.map_err(|_| ServerError::ProcessorGone)
    }

    /// Open the listener; returns the bound address
    pub async fn start(&self) -> Result<SocketAddr> {
        self.request(Command::Start).await?
    }

    /// Stop accepting, flush clients, and wait until Stopped
    pub async fn stop(&self) -> Result<()> {
        self.request(Command::Stop).await?
    }

    /// Suspend buffer admission; queued output keeps flowing
    pub async fn pause(&self) -> Result<()> {
        self.request(Command::Pause).await?
    }

    pub async fn resume(&self) -> Result<()> {
        self.request(Command::Resume).await?
    }

    /// Title carried by subsequent ICY metadata blocks
    pub async fn set_stream_title(&self, title: impl Into<String>) -> Result<()> {
        let title = title.into();
        self.request(|tx| Command::SetStreamTitle(title, tx)).await
    }

    pub async fn stats(&self) -> Result<ProcessorStats> {
        self.request(Command::Stats).await
    }

    /// Tear everything down and end the processor task
    pub async fn shutdown(&self) -> Result<()> {
        self.request(Command::Shutdown).await
    }
}
