//! mp3cast Daemon - live MP3 over HTTP
//!
//! Reads an MP3 elementary stream from a file or stdin and serves it to any
//! number of HTTP clients. A Unix control socket accepts start/stop/pause/
//! resume/status/title commands.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use mp3cast_daemon::config::DaemonConfig;
use mp3cast_daemon::ipc::IpcServer;
use mp3cast_daemon::socket_utils::get_control_socket_path;
use mp3cast_daemon::source::SourceReader;
use mp3cast_daemon::version::{version_long, version_short};
use mp3cast_server::{EventReceiver, ProcessorEvent, ServerError, StreamProcessor};

const SOURCE_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Parser)]
#[command(name = "mp3cast-daemon", version, about = "Serve a live MP3 stream over HTTP")]
struct Cli {
    /// Configuration file (default: platform config dir)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// MP3 input file, "-" for stdin
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// TCP port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Mount point clients request
    #[arg(long)]
    mount: Option<String>,

    /// Initial ICY stream title
    #[arg(long)]
    title: Option<String>,

    /// Rewind file input at EOF
    #[arg(long = "loop")]
    loop_input: bool,

    /// Do not open the control socket
    #[arg(long)]
    no_control: bool,

    /// Log filter when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Print build information and exit
    #[arg(long)]
    build_info: bool,
}

impl Cli {
    fn apply(&self, config: &mut DaemonConfig) {
        if let Some(input) = &self.input {
            config.source.input = Some(input.clone());
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(mount) = &self.mount {
            config.server.mount_point = mount.clone();
        }
        if let Some(title) = &self.title {
            config.stream_title = Some(title.clone());
        }
        if self.loop_input {
            config.source.loop_input = true;
        }
        if self.no_control {
            config.control.enabled = false;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.build_info {
        print!("{}", version_long());
        return Ok(());
    }

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cli.log_level))
        .context("Invalid log filter")?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(true)
        .init();

    info!("🎵 Starting {}", version_short());

    let mut config = match &cli.config {
        Some(path) => DaemonConfig::load_from(path),
        None => DaemonConfig::load(),
    }
    .context("Failed to load configuration")?;
    cli.apply(&mut config);
    config.validate()?;

    info!("📋 Configuration loaded from {}", config.config_path.display());

    let (handle, events, processor_task) =
        StreamProcessor::spawn(config.server.clone(), config.format.clone())
            .context("Failed to create stream processor")?;
    tokio::spawn(log_events(events));

    let addr = handle.start().await.context("Failed to start listener")?;
    info!(
        "Serving {} kbit/s MP3 on http://{}{}",
        config.format.bitrate_kbps(),
        addr,
        config.server.mount_point
    );

    if let Some(title) = &config.stream_title {
        handle.set_stream_title(title.clone()).await?;
    }

    let quit = Arc::new(Notify::new());
    let control = if config.control.enabled {
        let socket_path = match &config.control.socket_path {
            Some(path) => path.clone(),
            None => get_control_socket_path()?,
        };
        Some(
            IpcServer::new(&socket_path, handle.clone(), Arc::clone(&quit))
                .context("Failed to start control socket")?,
        )
    } else {
        None
    };

    let (source, source_done) =
        SourceReader::spawn(config.source.clone(), config.format.byte_rate(), handle.clone())
            .context("Failed to start source")?;

    info!("🚀 mp3cast daemon ready");

    let control_loop = async {
        match &control {
            Some(server) => server.run().await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        result = control_loop => {
            if let Err(e) = result {
                error!("Control server error: {}", e);
            }
        }
        _ = source_done => {
            info!("Source finished");
        }
        _ = quit.notified() => {
            info!("Quit requested over control socket");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("🛑 Received shutdown signal");
        }
    }

    info!("🧹 Shutting down...");
    // A thread blocked on stdin cannot be joined; leave it to process exit
    match timeout(SOURCE_JOIN_TIMEOUT, tokio::task::spawn_blocking(move || source.stop())).await {
        Ok(joined) => {
            let stats = joined.context("Source thread join failed")??;
            info!(
                "Source: {} buffers, {} bytes, {} overflow backoffs, {} loops",
                stats.buffers, stats.bytes, stats.overflows, stats.loops
            );
        }
        Err(_) => warn!("Source thread still blocked on input, not waiting for it"),
    }

    match handle.stop().await {
        Ok(()) => {}
        // Already stopped over the control socket
        Err(ServerError::InvalidTransition { .. }) => {}
        Err(e) => warn!("Graceful stop failed: {}", e),
    }
    handle.shutdown().await?;
    processor_task.await.context("Processor task failed")?;
    drop(control);

    info!("👋 mp3cast daemon stopped");
    Ok(())
}

async fn log_events(mut events: EventReceiver) {
    while let Some(event) = events.recv().await {
        match event {
            ProcessorEvent::StateChanged { from, to } => info!("State: {} -> {}", from, to),
            ProcessorEvent::ClientConnected { client, peer } => {
                debug!("{} connected from {}", client, peer)
            }
            ProcessorEvent::ClientStreaming {
                client,
                peer,
                metadata,
            } => info!("{} ({}) listening, metadata: {}", client, peer, metadata),
            ProcessorEvent::ClientEvicted {
                client,
                peer,
                reason,
                bytes_sent,
                overrun,
            } => info!(
                "{} ({}) gone: {}{}, {} bytes sent",
                client,
                peer,
                reason,
                if overrun { " (overran its queue)" } else { "" },
                bytes_sent
            ),
            ProcessorEvent::BufferReleased { seq, outcome } => {
                debug!("Buffer {} released: {:?}", seq, outcome)
            }
            ProcessorEvent::Warning { message } => warn!("{}", message),
            ProcessorEvent::Error { message } => error!("{}", message),
        }
    }
}
