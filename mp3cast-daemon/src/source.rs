//! MP3 source → processor feed
//!
//! A dedicated thread reads encoded bytes from a file or stdin, cuts them into
//! fixed-size buffers and submits them. `submit` never blocks, so backpressure
//! is handled here: on `Overflow` the thread sleeps and retries the same
//! buffer.

use anyhow::{Context, Result};
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use mp3cast_server::{ProcessorHandle, ServerError};

use crate::config::SourceConfig;

/// Totals reported when the feed thread ends
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceStats {
    pub buffers: u64,
    pub bytes: u64,
    pub overflows: u64,
    /// Times file input was rewound
    pub loops: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Input {
    Stdin,
    File(PathBuf),
}

impl Input {
    fn from_config(input: Option<&Path>) -> Self {
        match input {
            Some(path) if path != Path::new("-") => Input::File(path.to_path_buf()),
            _ => Input::Stdin,
        }
    }

    fn open(&self) -> Result<Box<dyn Read + Send>> {
        match self {
            Input::Stdin => Ok(Box::new(io::stdin())),
            Input::File(path) => {
                let file = File::open(path)
                    .with_context(|| format!("Failed to open {}", path.display()))?;
                Ok(Box::new(file))
            }
        }
    }

    fn describe(&self) -> String {
        match self {
            Input::Stdin => "stdin".to_string(),
            Input::File(path) => path.display().to_string(),
        }
    }
}

/// Handle on the feed thread
pub struct SourceReader {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<Result<SourceStats>>>,
}

impl SourceReader {
    /// Start feeding `handle`. The receiver fires once the thread is done,
    /// whether the input ran out, the processor went away or `stop` was called.
    pub fn spawn(
        config: SourceConfig,
        byte_rate: u32,
        handle: ProcessorHandle,
    ) -> Result<(Self, oneshot::Receiver<()>)> {
        let input = Input::from_config(config.input.as_deref());
        // Fail early on a missing file rather than inside the thread
        let reader = input.open()?;
        info!("Reading MP3 from {}", input.describe());

        let stop = Arc::new(AtomicBool::new(false));
        let (done_tx, done_rx) = oneshot::channel();

        let feed = Feed {
            config,
            byte_rate,
            handle,
            input,
            stop: Arc::clone(&stop),
        };
        let thread = thread::Builder::new()
            .name("mp3cast-source".to_string())
            .spawn(move || {
                let result = feed.run(reader);
                let _ = done_tx.send(());
                result
            })
            .context("Failed to spawn source thread")?;

        Ok((
            Self {
                stop,
                thread: Some(thread),
            },
            done_rx,
        ))
    }

    /// Ask the thread to finish and wait for its totals
    pub fn stop(mut self) -> Result<SourceStats> {
        self.stop.store(true, Ordering::Release);
        self.join()
    }

    fn join(&mut self) -> Result<SourceStats> {
        match self.thread.take() {
            Some(thread) => thread
                .join()
                .map_err(|_| anyhow::anyhow!("Source thread panicked"))?,
            None => Ok(SourceStats::default()),
        }
    }
}

impl Drop for SourceReader {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
    }
}

struct Feed {
    config: SourceConfig,
    byte_rate: u32,
    handle: ProcessorHandle,
    input: Input,
    stop: Arc<AtomicBool>,
}

impl Feed {
    fn stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    fn run(self, mut reader: Box<dyn Read + Send>) -> Result<SourceStats> {
        let mut stats = SourceStats::default();
        let mut chunk = vec![0u8; self.config.chunk_bytes];
        let mut pacer = Pacer::new(self.byte_rate);

        while !self.stopped() {
            let n = read_full(&mut reader, &mut chunk).context("Failed to read input")?;
            if n == 0 {
                if self.config.loop_input && matches!(self.input, Input::File(_)) {
                    debug!("End of input, rewinding");
                    reader = self.input.open()?;
                    stats.loops += 1;
                    continue;
                }
                info!("End of input after {} bytes", stats.bytes);
                break;
            }

            match self.submit(&chunk[..n], &mut stats) {
                Ok(true) => {}
                Ok(false) => break,
                Err(ServerError::ProcessorGone) => {
                    warn!("Processor gone, stopping source");
                    break;
                }
                Err(e) => return Err(e.into()),
            }
            stats.buffers += 1;
            stats.bytes += n as u64;

            if self.config.realtime {
                pacer.wait(n);
            }
        }

        Ok(stats)
    }

    /// Submit one buffer, backing off while the processor reports `Overflow`.
    /// Returns `Ok(false)` if asked to stop while backing off.
    fn submit(&self, data: &[u8], stats: &mut SourceStats) -> Result<bool, ServerError> {
        let backoff = Duration::from_millis(self.config.overflow_backoff_ms.max(1));
        let mut first_overflow = true;
        loop {
            match self.handle.submit(data.to_vec()) {
                Ok(_) => return Ok(true),
                Err(e) if e.is_overflow() => {
                    if first_overflow {
                        debug!("Backlog full ({}), backing off", self.handle.backlog());
                        stats.overflows += 1;
                        first_overflow = false;
                    }
                    if self.stopped() {
                        return Ok(false);
                    }
                    thread::sleep(backoff);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Keeps submissions at the nominal byte rate
struct Pacer {
    byte_rate: u32,
    started: Instant,
    sent: u64,
}

impl Pacer {
    fn new(byte_rate: u32) -> Self {
        Self {
            byte_rate,
            started: Instant::now(),
            sent: 0,
        }
    }

    fn wait(&mut self, bytes: usize) {
        if self.byte_rate == 0 {
            return;
        }
        self.sent += bytes as u64;
        let due = self.started + Duration::from_secs_f64(self.sent as f64 / self.byte_rate as f64);
        let now = Instant::now();
        if due > now {
            thread::sleep(due - now);
        } else if now - due > Duration::from_secs(1) {
            // Fell far behind (paused processor, slow input): restart the clock
            self.started = now;
            self.sent = 0;
        }
    }
}

/// Fill `buf` unless the reader hits EOF first
fn read_full(reader: &mut dyn Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
