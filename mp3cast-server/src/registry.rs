//! Client Registry: arena of connected HTTP clients and their outbound queues
//!
//! Clients live in generation-tagged slots. A [`ClientId`] stays valid until
//! the client is evicted; after that every operation on it is a no-op, which
//! makes eviction safe in the middle of a sweep over [`ClientRegistry::ids`].

use std::collections::VecDeque;
use std::io::{self, IoSlice};
use std::net::SocketAddr;
use std::task::{Context, Poll};
use std::time::Instant;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;

use crate::error::QueueFull;
use crate::events::EvictReason;
use crate::handshake::Request;

/// Segments handed to a single vectored write
const MAX_IOVECS: usize = 16;

/// Stable client identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientId {
    pub slot: u32,
    pub generation: u32,
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "client#{}.{}", self.slot, self.generation)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientState {
    Handshaking,
    Streaming,
    Draining,
    Closed,
}

/// One entry of an outbound queue
#[derive(Debug, Clone)]
pub enum Segment {
    /// Slice of the inbound buffer `seq`
    Audio { seq: u64, bytes: Bytes },
    /// Response headers, error responses, ICY blocks
    Control(Bytes),
}

impl Segment {
    pub fn bytes(&self) -> &Bytes {
        match self {
            Segment::Audio { bytes, .. } | Segment::Control(bytes) => bytes,
        }
    }

    pub fn len(&self) -> usize {
        self.bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes().is_empty()
    }

    fn seq(&self) -> Option<u64> {
        match self {
            Segment::Audio { seq, .. } => Some(*seq),
            Segment::Control(_) => None,
        }
    }
}

/// Result of a non-blocking read attempt
#[derive(Debug)]
pub enum ReadOutcome {
    Data(usize),
    /// Peer closed its write side after sending this many bytes
    Eof(usize),
    WouldBlock,
    Failed(io::Error),
}

/// Result of flushing a client's queue as far as the socket allows
#[derive(Debug, Default)]
pub struct FlushOutcome {
    pub written: usize,
    /// One entry per audio segment that was fully written
    pub completed: Vec<u64>,
    pub error: Option<io::Error>,
}

/// What is left of a client after eviction
#[derive(Debug)]
pub struct Evicted {
    pub id: ClientId,
    pub peer: SocketAddr,
    pub reason: EvictReason,
    pub previous_state: ClientState,
    pub bytes_sent: u64,
    /// Had fallen behind its queue cap
    pub overrun: bool,
    /// One entry per audio segment dropped from the queue
    pub abandoned: Vec<u64>,
}

/// Serialisable view of a client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSummary {
    pub id: ClientId,
    pub peer: SocketAddr,
    pub state: ClientState,
    pub connected_at: DateTime<Utc>,
    pub bytes_sent: u64,
    pub queued_bytes: usize,
    pub metadata: bool,
    pub user_agent: Option<String>,
}

/// A connected HTTP client
#[derive(Debug)]
pub struct Client {
    id: ClientId,
    stream: TcpStream,
    peer: SocketAddr,
    state: ClientState,
    queue: VecDeque<Segment>,
    queued_bytes: usize,
    /// Bytes of the front segment already written
    front_offset: usize,
    last_progress: Instant,
    connected_at: DateTime<Utc>,
    handshake_deadline: Instant,
    request_buf: Vec<u8>,
    request: Option<Request>,
    metaint: Option<usize>,
    audio_since_meta: usize,
    meta_version_seen: u64,
    overrun: bool,
    read_closed: bool,
    drain: Option<(EvictReason, Instant)>,
    bytes_sent: u64,
}

impl Client {
    fn new(id: ClientId, stream: TcpStream, peer: SocketAddr, handshake_deadline: Instant) -> Self {
        Self {
            id,
            stream,
            peer,
            state: ClientState::Handshaking,
            queue: VecDeque::new(),
            queued_bytes: 0,
            front_offset: 0,
            last_progress: Instant::now(),
            connected_at: Utc::now(),
            handshake_deadline,
            request_buf: Vec::new(),
            request: None,
            metaint: None,
            audio_since_meta: 0,
            meta_version_seen: 0,
            overrun: false,
            read_closed: false,
            drain: None,
            bytes_sent: 0,
        }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn has_pending_output(&self) -> bool {
        !self.queue.is_empty()
    }

    pub fn queued_bytes(&self) -> usize {
        self.queued_bytes
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    pub fn last_progress(&self) -> Instant {
        self.last_progress
    }

    pub fn handshake_deadline(&self) -> Instant {
        self.handshake_deadline
    }

    pub fn request(&self) -> Option<&Request> {
        self.request.as_ref()
    }

    /// Request parsed and response queued; promotion waits on the flush
    pub fn set_request(&mut self, request: Request, metaint: Option<usize>) {
        self.request = Some(request);
        self.metaint = metaint;
        self.request_buf = Vec::new();
    }

    pub fn request_buf(&self) -> &[u8] {
        &self.request_buf
    }

    pub fn metaint(&self) -> Option<usize> {
        self.metaint
    }

    pub fn audio_since_meta(&self) -> usize {
        self.audio_since_meta
    }

    pub fn set_audio_since_meta(&mut self, n: usize) {
        self.audio_since_meta = n;
    }

    pub fn meta_version_seen(&self) -> u64 {
        self.meta_version_seen
    }

    pub fn set_meta_version_seen(&mut self, version: u64) {
        self.meta_version_seen = version;
    }

    /// Fell behind its queue cap; gets no further audio
    pub fn is_overrun(&self) -> bool {
        self.overrun
    }

    pub fn mark_overrun(&mut self) {
        self.overrun = true;
    }

    /// Peer sent FIN; nothing more will be read
    pub fn is_read_closed(&self) -> bool {
        self.read_closed
    }

    /// Still owed a response head: a parsed request waiting on its header
    /// flush, or a rejected one draining its error response
    pub fn owes_response(&self) -> bool {
        match self.state {
            ClientState::Handshaking => self.request.is_some(),
            ClientState::Draining => self.request.is_none(),
            _ => false,
        }
    }

    /// Reason and deadline of a pending drain
    pub fn drain(&self) -> Option<(EvictReason, Instant)> {
        self.drain
    }

    /// Readiness for the scheduler's wait step
    fn poll_io(&self, cx: &mut Context<'_>) -> bool {
        // A half-closed socket stays read-ready forever
        let mut ready = !self.read_closed && self.stream.poll_read_ready(cx).is_ready();
        if self.has_pending_output() {
            ready |= self.stream.poll_write_ready(cx).is_ready();
        }
        ready
    }

    /// Read whatever the peer sent. Handshaking clients accumulate it (up to
    /// `limit` bytes); everybody else has it discarded.
    pub fn read_available(&mut self, limit: usize) -> ReadOutcome {
        if self.read_closed {
            return ReadOutcome::WouldBlock;
        }
        let mut scratch = [0u8; 1024];
        let mut total = 0;
        loop {
            match self.stream.try_read(&mut scratch) {
                Ok(0) => {
                    self.read_closed = true;
                    return ReadOutcome::Eof(total);
                }
                Ok(n) => {
                    total += n;
                    if self.state == ClientState::Handshaking && self.request.is_none() {
                        self.request_buf.extend_from_slice(&scratch[..n]);
                        if self.request_buf.len() > limit {
                            return ReadOutcome::Data(total);
                        }
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return if total > 0 {
                        ReadOutcome::Data(total)
                    } else {
                        ReadOutcome::WouldBlock
                    };
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return ReadOutcome::Failed(e),
            }
        }
    }

    /// One vectored write from the front of the queue
    fn write_once(&mut self) -> io::Result<usize> {
        let mut slices = Vec::with_capacity(MAX_IOVECS.min(self.queue.len()));
        for (i, segment) in self.queue.iter().take(MAX_IOVECS).enumerate() {
            let bytes = segment.bytes();
            let start = if i == 0 { self.front_offset } else { 0 };
            slices.push(IoSlice::new(&bytes[start..]));
        }
        self.stream.try_write_vectored(&slices)
    }

    /// Pop fully written segments; returns their buffer sequence numbers
    fn advance(&mut self, mut n: usize) -> Vec<u64> {
        let mut completed = Vec::new();
        self.bytes_sent += n as u64;
        self.queued_bytes -= n.min(self.queued_bytes);
        if n > 0 {
            self.last_progress = Instant::now();
        }

        while n > 0 {
            let Some(front) = self.queue.front() else {
                break;
            };
            let remaining = front.len() - self.front_offset;
            if n < remaining {
                self.front_offset += n;
                break;
            }
            n -= remaining;
            self.front_offset = 0;
            if let Some(seq) = self.queue.pop_front().and_then(|s| s.seq()) {
                completed.push(seq);
            }
        }
        completed
    }

    pub fn summary(&self) -> ClientSummary {
        ClientSummary {
            id: self.id,
            peer: self.peer,
            state: self.state,
            connected_at: self.connected_at,
            bytes_sent: self.bytes_sent,
            queued_bytes: self.queued_bytes,
            metadata: self.metaint.is_some(),
            user_agent: self
                .request
                .as_ref()
                .and_then(|r| r.user_agent())
                .map(str::to_string),
        }
    }
}

#[derive(Debug, Default)]
struct Slot {
    generation: u32,
    client: Option<Client>,
}

/// Arena of clients owned by the scheduler
#[derive(Debug)]
pub struct ClientRegistry {
    slots: Vec<Slot>,
    free: Vec<u32>,
    len: usize,
    max_clients: usize,
    queue_cap: usize,
}

impl ClientRegistry {
    pub fn new(max_clients: usize, queue_cap: usize) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
            max_clients,
            queue_cap,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len >= self.max_clients
    }

    pub fn queue_cap(&self) -> usize {
        self.queue_cap
    }

    /// Snapshot of live ids, safe to iterate while evicting
    pub fn ids(&self) -> Vec<ClientId> {
        self.iter().map(|c| c.id).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Client> {
        self.slots.iter().filter_map(|s| s.client.as_ref())
    }

    pub fn count_in(&self, state: ClientState) -> usize {
        self.iter().filter(|c| c.state == state).count()
    }

    pub fn get(&self, id: ClientId) -> Option<&Client> {
        self.slots
            .get(id.slot as usize)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.client.as_ref())
    }

    pub fn get_mut(&mut self, id: ClientId) -> Option<&mut Client> {
        self.slots
            .get_mut(id.slot as usize)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.client.as_mut())
    }

    /// New client in Handshaking state
    pub fn register(
        &mut self,
        stream: TcpStream,
        peer: SocketAddr,
        handshake_deadline: Instant,
    ) -> ClientId {
        let slot = match self.free.pop() {
            Some(slot) => slot,
            None => {
                self.slots.push(Slot::default());
                (self.slots.len() - 1) as u32
            }
        };
        let entry = &mut self.slots[slot as usize];
        let id = ClientId {
            slot,
            generation: entry.generation,
        };
        entry.client = Some(Client::new(id, stream, peer, handshake_deadline));
        self.len += 1;
        id
    }

    /// Handshaking → Streaming. Only valid once the response header is out.
    pub fn promote(&mut self, id: ClientId) -> bool {
        match self.get_mut(id) {
            Some(client)
                if client.state == ClientState::Handshaking
                    && client.request.is_some()
                    && client.queue.is_empty() =>
            {
                client.state = ClientState::Streaming;
                client.last_progress = Instant::now();
                true
            }
            _ => false,
        }
    }

    /// Append segments atomically: all of them fit under the cap or none is
    /// queued. Control data (headers, error replies) is never refused.
    ///
    /// `Ok(false)` means the client no longer exists.
    pub fn enqueue(&mut self, id: ClientId, segments: Vec<Segment>) -> Result<bool, QueueFull> {
        let cap = self.queue_cap;
        let Some(client) = self.get_mut(id) else {
            return Ok(false);
        };

        let incoming: usize = segments.iter().map(Segment::len).sum();
        let has_audio = segments.iter().any(|s| s.seq().is_some());
        if has_audio && client.queued_bytes + incoming > cap {
            return Err(QueueFull {
                queued: client.queued_bytes,
                incoming,
                cap,
            });
        }

        if client.queue.is_empty() {
            // Stall timer runs from the moment output becomes pending
            client.last_progress = Instant::now();
        }
        client.queued_bytes += incoming;
        client
            .queue
            .extend(segments.into_iter().filter(|s| !s.is_empty()));
        Ok(true)
    }

    /// Account for `n` bytes written; resets the stall timer
    pub fn record_write_progress(&mut self, id: ClientId, n: usize) -> Vec<u64> {
        match self.get_mut(id) {
            Some(client) => client.advance(n),
            None => Vec::new(),
        }
    }

    /// Write as much of the queue as the socket takes without blocking
    pub fn flush(&mut self, id: ClientId) -> FlushOutcome {
        let mut outcome = FlushOutcome::default();
        loop {
            let result = match self.get_mut(id) {
                Some(client) if client.has_pending_output() => client.write_once(),
                _ => break,
            };
            match result {
                Ok(0) => {
                    outcome.error = Some(io::ErrorKind::WriteZero.into());
                    break;
                }
                Ok(n) => {
                    outcome.written += n;
                    outcome.completed.extend(self.record_write_progress(id, n));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    outcome.error = Some(e);
                    break;
                }
            }
        }
        outcome
    }

    /// Stop feeding the client audio and let it flush until `deadline`
    pub fn begin_drain(&mut self, id: ClientId, reason: EvictReason, deadline: Instant) -> bool {
        match self.get_mut(id) {
            Some(client) if client.drain.is_none() => {
                client.state = ClientState::Draining;
                client.drain = Some((reason, deadline));
                true
            }
            _ => false,
        }
    }

    /// Close the client, free its queue, and report the buffer references it
    /// held. Returns `None` if the client was already evicted.
    pub fn evict(&mut self, id: ClientId, reason: EvictReason) -> Option<Evicted> {
        let slot = self
            .slots
            .get_mut(id.slot as usize)
            .filter(|s| s.generation == id.generation)?;
        let mut client = slot.client.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.slot);
        self.len -= 1;

        let previous_state = client.state;
        client.state = ClientState::Closed;
        let abandoned = client.queue.drain(..).filter_map(|s| s.seq()).collect();
        client.queued_bytes = 0;

        Some(Evicted {
            id,
            peer: client.peer,
            reason,
            previous_state,
            bytes_sent: client.bytes_sent,
            overrun: client.overrun,
            abandoned,
        })
        // `client` drops here and closes the socket
    }

    /// True if any client socket is ready for the work it has pending
    pub fn poll_io(&self, cx: &mut Context<'_>) -> Poll<()> {
        // Poll every client so each one registers the waker
        let mut ready = false;
        for client in self.iter() {
            ready |= client.poll_io(cx);
        }
        if ready {
            Poll::Ready(())
        } else {
            Poll::Pending
        }
    }

    pub fn summaries(&self) -> Vec<ClientSummary> {
        self.iter().map(Client::summary).collect()
    }
}
