//! Buffer Inbox: pipeline-facing admission plus the retained-buffer set
//!
//! The pipeline side ([`InboxHandle`]) is thread-safe and never blocks. The
//! scheduler side ([`BufferInbox`]) drains buffers in arrival order and keeps a
//! reference count per admitted buffer until every holder is done with it.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::{Result, ServerError};
use crate::events::ReleaseOutcome;

/// One opaque unit of encoded audio from the pipeline
#[derive(Debug, Clone)]
pub struct InboundBuffer {
    pub seq: u64,
    pub payload: Bytes,
    pub received_at: Instant,
}

impl InboundBuffer {
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

#[derive(Debug)]
struct Shared {
    /// Submitted and not yet released
    backlog: AtomicUsize,
    next_seq: AtomicU64,
    cap: usize,
}

/// Pipeline side of the inbox
#[derive(Debug, Clone)]
pub struct InboxHandle {
    tx: mpsc::UnboundedSender<InboundBuffer>,
    shared: Arc<Shared>,
}

impl InboxHandle {
    /// Hand one buffer to the processor.
    ///
    /// Returns the sequence number assigned to it, or `Overflow` when the
    /// backlog cap is reached; the caller should hold off and retry later.
    pub fn submit(&self, payload: impl Into<Bytes>) -> Result<u64> {
        let cap = self.shared.cap;
        self.shared
            .backlog
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < cap).then_some(n + 1)
            })
            .map_err(|backlog| ServerError::Overflow { backlog, cap })?;

        let seq = self.shared.next_seq.fetch_add(1, Ordering::Relaxed);
        let buffer = InboundBuffer {
            seq,
            payload: payload.into(),
            received_at: Instant::now(),
        };

        if self.tx.send(buffer).is_err() {
            self.shared.backlog.fetch_sub(1, Ordering::AcqRel);
            return Err(ServerError::ProcessorGone);
        }
        Ok(seq)
    }

    /// Buffers submitted but not yet released
    pub fn backlog(&self) -> usize {
        self.shared.backlog.load(Ordering::Acquire)
    }

    pub fn backlog_cap(&self) -> usize {
        self.shared.cap
    }
}

#[derive(Debug)]
struct Retained {
    /// Queue segments still referring to the buffer, plus the admission hold
    refs: usize,
    /// At least one holder was evicted while referring to it
    dropped_holder: bool,
    /// Number of clients that received it at admission
    fanout: usize,
}

/// A buffer handed back to the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Released {
    pub seq: u64,
    pub outcome: ReleaseOutcome,
}

/// Scheduler side of the inbox
#[derive(Debug)]
pub struct BufferInbox {
    rx: mpsc::UnboundedReceiver<InboundBuffer>,
    /// Received during the wait step, not yet fanned out
    pending: VecDeque<InboundBuffer>,
    shared: Arc<Shared>,
    retained: BTreeMap<u64, Retained>,
    admitted: u64,
}

impl BufferInbox {
    pub fn new(backlog_cap: usize) -> (Self, InboxHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            backlog: AtomicUsize::new(0),
            next_seq: AtomicU64::new(0),
            cap: backlog_cap,
        });

        let inbox = Self {
            rx,
            pending: VecDeque::new(),
            shared: Arc::clone(&shared),
            retained: BTreeMap::new(),
            admitted: 0,
        };
        (inbox, InboxHandle { tx, shared })
    }

    /// Readiness for the scheduler's wait step. A buffer taken off the
    /// channel here is kept until [`drain_ready`](Self::drain_ready).
    pub fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        if !self.pending.is_empty() {
            return Poll::Ready(());
        }
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(buffer)) => {
                self.pending.push_back(buffer);
                Poll::Ready(())
            }
            // Every submitter is gone; nothing will ever arrive
            Poll::Ready(None) | Poll::Pending => Poll::Pending,
        }
    }

    /// Every buffer waiting to be fanned out, in arrival order
    pub fn drain_ready(&mut self) -> Vec<InboundBuffer> {
        let mut ready: Vec<InboundBuffer> = self.pending.drain(..).collect();
        while let Ok(buffer) = self.rx.try_recv() {
            ready.push(buffer);
        }
        ready
    }

    /// Start tracking a buffer with the pipeline hold taken
    pub fn admit(&mut self, buffer: &InboundBuffer) {
        self.admitted += 1;
        self.retained.insert(
            buffer.seq,
            Retained {
                refs: 1,
                dropped_holder: false,
                fanout: 0,
            },
        );
    }

    /// One more queue segment now refers to `seq`
    pub fn add_ref(&mut self, seq: u64) {
        if let Some(entry) = self.retained.get_mut(&seq) {
            entry.refs += 1;
        }
    }

    /// Record how many clients received `seq` at admission
    pub fn set_fanout(&mut self, seq: u64, clients: usize) {
        if let Some(entry) = self.retained.get_mut(&seq) {
            entry.fanout = clients;
        }
    }

    /// Fan-out is done: drop the pipeline hold
    pub fn finish_admission(&mut self, seq: u64) -> Option<Released> {
        self.unref(seq, false)
    }

    /// A segment of `seq` was fully written
    pub fn consumed(&mut self, seq: u64) -> Option<Released> {
        self.unref(seq, false)
    }

    /// A segment of `seq` was discarded by eviction
    pub fn abandoned(&mut self, seq: u64) -> Option<Released> {
        self.unref(seq, true)
    }

    fn unref(&mut self, seq: u64, dropped: bool) -> Option<Released> {
        let entry = self.retained.get_mut(&seq)?;
        entry.dropped_holder |= dropped;
        entry.refs = entry.refs.saturating_sub(1);
        if entry.refs > 0 {
            return None;
        }

        let entry = self.retained.remove(&seq)?;
        let outcome = if entry.fanout == 0 || entry.dropped_holder {
            ReleaseOutcome::Dropped
        } else {
            ReleaseOutcome::Consumed
        };
        self.shared.backlog.fetch_sub(1, Ordering::AcqRel);
        Some(Released { seq, outcome })
    }

    /// Release buffers that were never admitted (stop / teardown)
    pub fn discard_pending(&mut self) -> Vec<Released> {
        self.drain_ready()
            .into_iter()
            .map(|buffer| {
                self.shared.backlog.fetch_sub(1, Ordering::AcqRel);
                Released {
                    seq: buffer.seq,
                    outcome: ReleaseOutcome::Dropped,
                }
            })
            .collect()
    }

    /// Force-release everything still retained (teardown)
    pub fn release_all(&mut self) -> Vec<Released> {
        let retained = std::mem::take(&mut self.retained);
        retained
            .into_keys()
            .map(|seq| {
                self.shared.backlog.fetch_sub(1, Ordering::AcqRel);
                Released {
                    seq,
                    outcome: ReleaseOutcome::Dropped,
                }
            })
            .collect()
    }

    pub fn is_retained(&self, seq: u64) -> bool {
        self.retained.contains_key(&seq)
    }

    /// Buffers currently held in memory by the scheduler
    pub fn retained_len(&self) -> usize {
        self.retained.len()
    }

    pub fn backlog(&self) -> usize {
        self.shared.backlog.load(Ordering::Acquire)
    }

    pub fn backlog_cap(&self) -> usize {
        self.shared.cap
    }

    /// Total buffers fanned out since creation
    pub fn admitted(&self) -> u64 {
        self.admitted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn test_overflow_at_backlog_cap() {
        let (_inbox, handle) = BufferInbox::new(10);

        for i in 0..10u8 {
            assert_ok!(handle.submit(vec![i; 4]));
        }
        assert_eq!(handle.backlog(), 10);

        let err = assert_err!(handle.submit(vec![10; 4]));
        assert!(err.is_overflow());
        assert_eq!(handle.backlog(), 10);
    }

    #[test]
    fn test_drain_preserves_arrival_order() {
        let (mut inbox, handle) = BufferInbox::new(16);
        for i in 0..5u8 {
            assert_eq!(handle.submit(vec![i]).unwrap(), i as u64);
        }

        let ready = inbox.drain_ready();
        let seqs: Vec<u64> = ready.iter().map(|b| b.seq).collect();
        assert_eq!(seqs, vec![0, 1, 2, 3, 4]);
        assert_eq!(ready[3].payload.as_ref(), &[3]);
        assert!(inbox.drain_ready().is_empty());
    }

    #[tokio::test]
    async fn test_poll_ready_keeps_buffer_for_drain() {
        let (mut inbox, handle) = BufferInbox::new(16);
        handle.submit(vec![1]).unwrap();
        handle.submit(vec![2]).unwrap();

        std::future::poll_fn(|cx| inbox.poll_ready(cx)).await;
        let ready = inbox.drain_ready();
        assert_eq!(ready.len(), 2);
        assert_eq!(ready[0].seq, 0);
        assert_eq!(ready[1].seq, 1);
    }

    #[test]
    fn test_release_only_after_all_refs() {
        let (mut inbox, handle) = BufferInbox::new(4);
        handle.submit(Bytes::from_static(b"frame")).unwrap();
        let buffer = inbox.drain_ready().remove(0);

        inbox.admit(&buffer);
        inbox.add_ref(buffer.seq);
        inbox.add_ref(buffer.seq);
        inbox.set_fanout(buffer.seq, 2);

        assert!(inbox.finish_admission(buffer.seq).is_none());
        assert!(inbox.consumed(buffer.seq).is_none());
        assert_eq!(handle.backlog(), 1);

        let released = inbox.consumed(buffer.seq).unwrap();
        assert_eq!(released.outcome, ReleaseOutcome::Consumed);
        assert_eq!(handle.backlog(), 0);

        // Never released twice
        assert!(inbox.consumed(buffer.seq).is_none());
        assert!(inbox.abandoned(buffer.seq).is_none());
        assert_eq!(handle.backlog(), 0);
    }

    #[test]
    fn test_no_listeners_means_dropped() {
        let (mut inbox, handle) = BufferInbox::new(4);
        handle.submit(vec![1, 2, 3]).unwrap();
        let buffer = inbox.drain_ready().remove(0);

        inbox.admit(&buffer);
        let released = inbox.finish_admission(buffer.seq).unwrap();
        assert_eq!(released.outcome, ReleaseOutcome::Dropped);
        assert!(!inbox.is_retained(buffer.seq));
    }

    #[test]
    fn test_eviction_marks_dropped() {
        let (mut inbox, handle) = BufferInbox::new(4);
        handle.submit(vec![9; 8]).unwrap();
        let buffer = inbox.drain_ready().remove(0);

        inbox.admit(&buffer);
        inbox.add_ref(buffer.seq);
        inbox.set_fanout(buffer.seq, 1);
        assert!(inbox.finish_admission(buffer.seq).is_none());

        let released = inbox.abandoned(buffer.seq).unwrap();
        assert_eq!(released.outcome, ReleaseOutcome::Dropped);
    }

    #[test]
    fn test_discard_pending_frees_backlog() {
        let (mut inbox, handle) = BufferInbox::new(3);
        for _ in 0..3 {
            handle.submit(vec![0]).unwrap();
        }
        assert!(handle.submit(vec![0]).is_err());

        let released = inbox.discard_pending();
        assert_eq!(released.len(), 3);
        assert_eq!(handle.backlog(), 0);
        assert!(handle.submit(vec![0]).is_ok());
    }

    #[test]
    fn test_submit_after_processor_gone() {
        let (inbox, handle) = BufferInbox::new(3);
        drop(inbox);
        assert!(matches!(
            handle.submit(vec![0]),
            Err(ServerError::ProcessorGone)
        ));
        assert_eq!(handle.backlog(), 0);
    }
}
