//! Fan-out Scheduler: the single-task event loop
//!
//! One iteration waits for anything to become ready (commands, the listener,
//! client sockets, inbound buffers, the housekeeping tick), then runs to
//! completion: accept, handshake, fan out, write, evict, release.

use std::future::poll_fn;
use std::net::SocketAddr;
use std::task::{Context, Poll};
use std::time::Instant;

use bytes::Bytes;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::{ServerConfig, StreamFormat, MAX_REQUEST_BYTES};
use crate::error::{ProtocolError, Result};
use crate::events::{EvictReason, ProcessorEvent};
use crate::handshake::{
    build_error_response, build_response_header, find_request_end, parse_request,
};
use crate::inbox::{BufferInbox, InboundBuffer, Released};
use crate::listener::Listener;
use crate::metadata::StreamMetadata;
use crate::processor::{Command, ProcessorStats};
use crate::registry::{ClientId, ClientRegistry, ClientState, ReadOutcome, Segment};
use crate::state::{StateMachine, Transition};

/// What became ready during the wait step
#[derive(Default)]
struct Wake {
    command: Option<Command>,
    commands_closed: bool,
    accepted: Vec<(TcpStream, SocketAddr)>,
}

#[derive(Debug, Default)]
struct Counters {
    released: u64,
    evicted: u64,
    /// Bytes sent to clients that are gone
    bytes_sent_closed: u64,
}

pub(crate) struct Scheduler {
    config: ServerConfig,
    format: StreamFormat,
    state: StateMachine,
    registry: ClientRegistry,
    inbox: BufferInbox,
    listener: Option<Listener>,
    metadata: StreamMetadata,
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<ProcessorEvent>,
    pending_stops: Vec<oneshot::Sender<Result<()>>>,
    counters: Counters,
}

impl Scheduler {
    pub(crate) fn new(
        config: ServerConfig,
        format: StreamFormat,
        inbox: BufferInbox,
        commands: mpsc::UnboundedReceiver<Command>,
        events: mpsc::UnboundedSender<ProcessorEvent>,
    ) -> Self {
        let registry = ClientRegistry::new(config.max_clients, config.client_queue_bytes);
        Self {
            config,
            format,
            state: StateMachine::new(),
            registry,
            inbox,
            listener: None,
            metadata: StreamMetadata::new(),
            commands,
            events,
            pending_stops: Vec::new(),
            counters: Counters::default(),
        }
    }

    pub(crate) async fn run(mut self) {
        let mut tick = tokio::time::interval(self.config.tick_interval());
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let wake = poll_fn(|cx| self.poll_wake(cx, &mut tick)).await;
            if !self.step(wake) {
                break;
            }
        }
        self.teardown();
        info!("Stream processor stopped");
    }

    /// The only suspension point
    fn poll_wake(&mut self, cx: &mut Context<'_>, tick: &mut Interval) -> Poll<Wake> {
        let mut wake = Wake::default();
        let mut ready = false;

        match self.commands.poll_recv(cx) {
            Poll::Ready(Some(command)) => {
                wake.command = Some(command);
                ready = true;
            }
            Poll::Ready(None) => {
                wake.commands_closed = true;
                ready = true;
            }
            Poll::Pending => {}
        }

        if let Some(listener) = &self.listener {
            if let Poll::Ready(accepted) = listener.poll_accept(cx) {
                wake.accepted = accepted;
                ready = true;
            }
        }

        if self.state.is_admitting() && self.inbox.poll_ready(cx).is_ready() {
            ready = true;
        }

        if self.registry.poll_io(cx).is_ready() {
            ready = true;
        }

        if tick.poll_tick(cx).is_ready() {
            ready = true;
        }

        if ready {
            Poll::Ready(wake)
        } else {
            Poll::Pending
        }
    }

    /// One act phase. Returns false when the loop should end.
    fn step(&mut self, wake: Wake) -> bool {
        let mut keep_running = true;
        if let Some(command) = wake.command {
            keep_running &= self.handle_command(command);
        }
        while keep_running {
            match self.commands.try_recv() {
                Ok(command) => keep_running &= self.handle_command(command),
                Err(_) => break,
            }
        }
        if wake.commands_closed {
            info!("All processor handles dropped");
            keep_running = false;
        }
        if !keep_running {
            return false;
        }

        let now = Instant::now();
        for (stream, peer) in wake.accepted {
            self.accept(stream, peer, now);
        }

        self.service_reads();

        if self.state.is_admitting() {
            self.admit_ready();
        }

        self.service_writes();
        self.advance_clients();
        self.enforce_timeouts(Instant::now());
        self.observe_state();
        true
    }

    // ---- commands -------------------------------------------------------

    fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::Start(reply) => {
                let _ = reply.send(self.start());
            }
            Command::Stop(reply) => {
                // Buffers submitted before the stop still go out
                if self.state.is_admitting() {
                    self.admit_ready();
                }
                match self.state.stop() {
                    Ok(transition) => {
                        self.begin_stop(transition);
                        self.pending_stops.push(reply);
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                }
            }
            Command::Pause(reply) => {
                let result = self.state.pause();
                if result.is_ok() {
                    info!("Buffer admission paused");
                }
                let _ = reply.send(result);
            }
            Command::Resume(reply) => {
                let result = self.state.resume();
                if result.is_ok() {
                    info!("Buffer admission resumed");
                }
                let _ = reply.send(result);
            }
            Command::SetStreamTitle(title, reply) => {
                info!("Stream title: {}", title);
                self.metadata.set_title(title);
                let _ = reply.send(());
            }
            Command::Stats(reply) => {
                let _ = reply.send(self.stats());
            }
            Command::Shutdown(reply) => {
                info!("Shutdown requested");
                self.teardown();
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    fn start(&mut self) -> Result<SocketAddr> {
        let transition = self.state.start()?;
        let addr = self.config.listen_addr();
        match Listener::bind(addr, self.config.send_buffer_size) {
            Ok(listener) => {
                let local = listener.local_addr();
                self.listener = Some(listener);
                self.emit_transition(transition);
                Ok(local)
            }
            Err(e) => {
                self.state.abort_start(transition.from);
                error!("Failed to start listener: {}", e);
                self.emit(ProcessorEvent::error(e.to_string()));
                Err(e)
            }
        }
    }

    fn begin_stop(&mut self, transition: Transition) {
        info!("Stopping: draining {} client(s)", self.registry.len());
        self.emit_transition(transition);
        self.listener = None;

        for released in self.inbox.discard_pending() {
            self.emit_release(released);
        }

        let deadline = Instant::now() + self.config.drain_timeout();
        for id in self.registry.ids() {
            let Some(client) = self.registry.get(id) else {
                continue;
            };
            match client.state() {
                ClientState::Streaming => {
                    self.registry
                        .begin_drain(id, EvictReason::ShutdownRequested, deadline);
                }
                ClientState::Handshaking => self.evict(id, EvictReason::ShutdownRequested),
                ClientState::Draining | ClientState::Closed => {}
            }
        }
    }

    /// Evict everybody and hand every buffer back
    fn teardown(&mut self) {
        self.listener = None;
        for id in self.registry.ids() {
            self.evict(id, EvictReason::ShutdownRequested);
        }
        for released in self.inbox.discard_pending() {
            self.emit_release(released);
        }
        for released in self.inbox.release_all() {
            self.emit_release(released);
        }
        if let Some(transition) = self.state.terminate() {
            self.emit_transition(transition);
        }
        for reply in self.pending_stops.drain(..) {
            let _ = reply.send(Ok(()));
        }
    }

    // ---- connections ----------------------------------------------------

    fn accept(&mut self, stream: TcpStream, peer: SocketAddr, now: Instant) {
        if !self.state.state().is_listening() {
            return;
        }
        if self.registry.is_full() {
            warn!("Rejecting {}: {} clients connected", peer, self.registry.len());
            self.emit(ProcessorEvent::warning(format!(
                "connection from {} refused: client limit reached",
                peer
            )));
            return;
        }

        let id = self
            .registry
            .register(stream, peer, now + self.config.handshake_timeout());
        info!("{} connected from {}. Total clients: {}", id, peer, self.registry.len());
        self.emit(ProcessorEvent::ClientConnected { client: id, peer });
    }

    fn service_reads(&mut self) {
        for id in self.registry.ids() {
            let Some(client) = self.registry.get_mut(id) else {
                continue;
            };
            let awaiting_request =
                client.state() == ClientState::Handshaking && client.request().is_none();

            match client.read_available(MAX_REQUEST_BYTES) {
                ReadOutcome::Eof(n) => {
                    if n > 0 && awaiting_request {
                        self.try_handshake(id);
                    }
                    // A half-close after the request still gets its response
                    let owes_response = self
                        .registry
                        .get(id)
                        .map(|c| c.owes_response())
                        .unwrap_or(false);
                    if owes_response {
                        debug!("{} half-closed, finishing its response", id);
                    } else {
                        self.evict(id, EvictReason::PeerReset);
                    }
                }
                ReadOutcome::Failed(e) => {
                    debug!("{} read error: {}", id, e);
                    self.evict(id, EvictReason::PeerReset);
                }
                ReadOutcome::Data(_) if awaiting_request => self.try_handshake(id),
                ReadOutcome::Data(_) | ReadOutcome::WouldBlock => {}
            }
        }
    }

    fn try_handshake(&mut self, id: ClientId) {
        let Some(client) = self.registry.get(id) else {
            return;
        };
        let buf = client.request_buf();
        let parsed = if let Some(end) = find_request_end(buf) {
            parse_request(&buf[..end], &self.config.mount_point)
        } else if buf.len() > MAX_REQUEST_BYTES {
            Err(ProtocolError::TooLarge(MAX_REQUEST_BYTES))
        } else {
            return;
        };

        match parsed {
            Ok(request) => {
                let metaint = (self.config.advertise_metadata && request.wants_metadata())
                    .then_some(self.config.metadata_interval);
                let header =
                    build_response_header(&request, &self.format, &self.config.station, metaint);
                debug!("{} requested {} (metadata: {})", id, request.path, metaint.is_some());

                if let Some(client) = self.registry.get_mut(id) {
                    client.set_request(request, metaint);
                }
                let _ = self.registry.enqueue(id, vec![Segment::Control(header)]);
            }
            Err(e) => self.reject(id, e),
        }
    }

    fn reject(&mut self, id: ClientId, err: ProtocolError) {
        let peer = self.registry.get(id).map(|c| c.peer());
        warn!("Rejecting {} ({:?}): {}", id, peer, err);
        match build_error_response(&err) {
            Some(response) => {
                let _ = self.registry.enqueue(id, vec![Segment::Control(response)]);
                let deadline = Instant::now() + self.config.drain_timeout();
                self.registry
                    .begin_drain(id, EvictReason::ProtocolError, deadline);
            }
            None => self.evict(id, EvictReason::ProtocolError),
        }
    }

    // ---- fan-out --------------------------------------------------------

    fn admit_ready(&mut self) {
        for buffer in self.inbox.drain_ready() {
            self.fan_out(buffer);
        }
    }

    fn fan_out(&mut self, buffer: InboundBuffer) {
        self.inbox.admit(&buffer);
        let seq = buffer.seq;
        let mut receivers = 0;

        if !buffer.is_empty() {
            for id in self.registry.ids() {
                let Some(client) = self.registry.get(id) else {
                    continue;
                };
                if client.state() != ClientState::Streaming || client.is_overrun() {
                    continue;
                }

                let framed = frame_for_client(
                    &buffer,
                    client.metaint(),
                    client.audio_since_meta(),
                    client.meta_version_seen(),
                    &self.metadata,
                );
                let refs = framed.audio_segments();

                match self.registry.enqueue(id, framed.segments) {
                    Ok(true) => {
                        if let Some(client) = self.registry.get_mut(id) {
                            client.set_audio_since_meta(framed.audio_since_meta);
                            client.set_meta_version_seen(framed.meta_version_seen);
                        }
                        for _ in 0..refs {
                            self.inbox.add_ref(seq);
                        }
                        receivers += 1;
                    }
                    Ok(false) => {}
                    Err(full) => {
                        warn!("{} fell behind: {}", id, full);
                        if let Some(client) = self.registry.get_mut(id) {
                            client.mark_overrun();
                        }
                    }
                }
            }
        }

        self.inbox.set_fanout(seq, receivers);
        debug!(
            "Buffer {} ({} bytes) queued for {} client(s) after {:?}",
            seq,
            buffer.len(),
            receivers,
            buffer.received_at.elapsed()
        );
        if let Some(released) = self.inbox.finish_admission(seq) {
            self.emit_release(released);
        }
    }

    fn service_writes(&mut self) {
        for id in self.registry.ids() {
            let pending = self
                .registry
                .get(id)
                .map(|c| c.has_pending_output())
                .unwrap_or(false);
            if !pending {
                continue;
            }

            let outcome = self.registry.flush(id);
            for seq in outcome.completed {
                if let Some(released) = self.inbox.consumed(seq) {
                    self.emit_release(released);
                }
            }
            if let Some(e) = outcome.error {
                debug!("{} write error: {}", id, e);
                self.evict(id, EvictReason::PeerReset);
            }
        }
    }

    /// Promote flushed handshakes, close drained clients
    fn advance_clients(&mut self) {
        for id in self.registry.ids() {
            let Some(client) = self.registry.get(id) else {
                continue;
            };
            if client.has_pending_output() {
                continue;
            }
            match client.state() {
                ClientState::Handshaking if client.request().is_some() => {
                    let peer = client.peer();
                    let metadata = client.metaint().is_some();
                    if self.registry.promote(id) {
                        info!("{} streaming to {}", id, peer);
                        self.emit(ProcessorEvent::ClientStreaming {
                            client: id,
                            peer,
                            metadata,
                        });
                    }
                }
                ClientState::Draining => {
                    let reason = client
                        .drain()
                        .map(|(reason, _)| reason)
                        .unwrap_or(EvictReason::ShutdownRequested);
                    self.evict(id, reason);
                }
                ClientState::Streaming if client.is_overrun() => {
                    // Caught up after missing audio; it cannot resume without a gap
                    self.evict(id, EvictReason::StallTimeout);
                }
                _ => {}
            }
        }
    }

    fn enforce_timeouts(&mut self, now: Instant) {
        let stall_timeout = self.config.stall_timeout();
        let mut expired = Vec::new();

        for client in self.registry.iter() {
            let reason = match client.state() {
                ClientState::Handshaking
                    if client.request().is_none() && now >= client.handshake_deadline() =>
                {
                    Some(EvictReason::ProtocolError)
                }
                ClientState::Draining => client
                    .drain()
                    .filter(|(_, deadline)| now >= *deadline)
                    .map(|(reason, _)| reason),
                _ if client.has_pending_output()
                    && now.duration_since(client.last_progress()) >= stall_timeout =>
                {
                    Some(EvictReason::StallTimeout)
                }
                _ => None,
            };
            if let Some(reason) = reason {
                expired.push((client.id(), reason));
            }
        }

        for (id, reason) in expired {
            self.evict(id, reason);
        }
    }

    fn observe_state(&mut self) {
        let streaming = self.registry.count_in(ClientState::Streaming);
        if let Some(transition) = self.state.observe_streaming_clients(streaming) {
            self.emit_transition(transition);
        }
        if self.registry.is_empty() {
            if let Some(transition) = self.state.observe_registry_empty() {
                self.emit_transition(transition);
                for reply in self.pending_stops.drain(..) {
                    let _ = reply.send(Ok(()));
                }
            }
        }
    }

    // ---- bookkeeping ----------------------------------------------------

    fn evict(&mut self, id: ClientId, reason: EvictReason) {
        let Some(evicted) = self.registry.evict(id, reason) else {
            return;
        };
        if evicted.overrun {
            info!(
                "{} ({}) evicted: {} after overrunning its queue. Remaining: {}",
                id,
                evicted.peer,
                reason,
                self.registry.len()
            );
        } else {
            info!(
                "{} ({}) evicted: {}. Remaining: {}",
                id,
                evicted.peer,
                reason,
                self.registry.len()
            );
        }
        self.counters.evicted += 1;
        self.counters.bytes_sent_closed += evicted.bytes_sent;

        for seq in evicted.abandoned {
            if let Some(released) = self.inbox.abandoned(seq) {
                self.emit_release(released);
            }
        }
        self.emit(ProcessorEvent::ClientEvicted {
            client: id,
            peer: evicted.peer,
            reason,
            bytes_sent: evicted.bytes_sent,
            overrun: evicted.overrun,
        });
    }

    fn emit_release(&mut self, released: Released) {
        self.counters.released += 1;
        self.emit(ProcessorEvent::BufferReleased {
            seq: released.seq,
            outcome: released.outcome,
        });
    }

    fn emit_transition(&mut self, transition: Transition) {
        info!("Processor {} -> {}", transition.from, transition.to);
        self.emit(ProcessorEvent::StateChanged {
            from: transition.from,
            to: transition.to,
        });
    }

    fn emit(&self, event: ProcessorEvent) {
        // Nobody listening is fine
        let _ = self.events.send(event);
    }

    fn stats(&self) -> ProcessorStats {
        let live_bytes: u64 = self.registry.iter().map(|c| c.bytes_sent()).sum();
        ProcessorStats {
            state: self.state.state(),
            paused: self.state.is_paused(),
            listen_addr: self.listener.as_ref().map(Listener::local_addr),
            clients: self.registry.len(),
            streaming_clients: self.registry.count_in(ClientState::Streaming),
            backlog: self.inbox.backlog(),
            backlog_cap: self.inbox.backlog_cap(),
            retained_buffers: self.inbox.retained_len(),
            buffers_admitted: self.inbox.admitted(),
            buffers_released: self.counters.released,
            clients_evicted: self.counters.evicted,
            bytes_sent: self.counters.bytes_sent_closed + live_bytes,
            stream_title: self.metadata.title().map(str::to_string),
            client_list: self.registry.summaries(),
        }
    }
}

/// Segments one client gets for one buffer, plus its ICY counters afterwards
struct Framed {
    segments: Vec<Segment>,
    audio_since_meta: usize,
    meta_version_seen: u64,
}

impl Framed {
    fn audio_segments(&self) -> usize {
        self.segments
            .iter()
            .filter(|s| matches!(s, Segment::Audio { .. }))
            .count()
    }
}

/// Split `buffer` at ICY boundaries for clients that negotiated metadata
fn frame_for_client(
    buffer: &InboundBuffer,
    metaint: Option<usize>,
    mut since: usize,
    mut seen: u64,
    metadata: &StreamMetadata,
) -> Framed {
    let Some(interval) = metaint else {
        return Framed {
            segments: vec![Segment::Audio {
                seq: buffer.seq,
                bytes: buffer.payload.clone(),
            }],
            audio_since_meta: since,
            meta_version_seen: seen,
        };
    };

    let payload: &Bytes = &buffer.payload;
    let mut segments = Vec::new();
    let mut offset = 0;
    while offset < payload.len() {
        let take = (interval - since).min(payload.len() - offset);
        segments.push(Segment::Audio {
            seq: buffer.seq,
            bytes: payload.slice(offset..offset + take),
        });
        offset += take;
        since += take;
        if since == interval {
            segments.push(Segment::Control(metadata.block_for(seen)));
            seen = metadata.version();
            since = 0;
        }
    }

    Framed {
        segments,
        audio_since_meta: since,
        meta_version_seen: seen,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer(seq: u64, data: &'static [u8]) -> InboundBuffer {
        InboundBuffer {
            seq,
            payload: Bytes::from_static(data),
            received_at: Instant::now(),
        }
    }

    fn flatten(segments: &[Segment]) -> Vec<u8> {
        segments.iter().flat_map(|s| s.bytes().to_vec()).collect()
    }

    #[test]
    fn test_plain_client_gets_whole_buffer() {
        let meta = StreamMetadata::new();
        let framed = frame_for_client(&buffer(3, b"abcdef"), None, 0, 0, &meta);
        assert_eq!(framed.segments.len(), 1);
        assert_eq!(framed.audio_segments(), 1);
        assert_eq!(flatten(&framed.segments), b"abcdef");
    }

    #[test]
    fn test_icy_blocks_inserted_at_interval() {
        let mut meta = StreamMetadata::new();
        meta.set_title("a");

        // 10 bytes, interval 4, 1 byte already sent since the last block
        let framed = frame_for_client(&buffer(0, b"0123456789"), Some(4), 1, 0, &meta);
        let title_block = crate::metadata::format_block("a");

        let mut expected = b"012".to_vec();
        expected.extend_from_slice(&title_block);
        expected.extend_from_slice(b"3456");
        expected.push(0);
        expected.extend_from_slice(b"789");

        assert_eq!(flatten(&framed.segments), expected);
        assert_eq!(framed.audio_segments(), 3);
        assert_eq!(framed.audio_since_meta, 3);
        assert_eq!(framed.meta_version_seen, 1);
    }

    #[test]
    fn test_block_follows_exact_boundary() {
        let meta = StreamMetadata::new();
        let framed = frame_for_client(&buffer(0, b"abcd"), Some(4), 0, 0, &meta);
        assert_eq!(flatten(&framed.segments), b"abcd\0");
        assert_eq!(framed.audio_since_meta, 0);
    }
}
