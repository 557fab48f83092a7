//! Tunnel loopback
//!
//! Runs one proxy channel against an in-process echo peer:
//! - stdin lines are sent through the channel with the configured coalescing
//! - the peer echoes every frame back into the channel
//! - echoed bytes are written to stdout
//!
//! On exit it reports how many frames the coalescing produced, which makes it
//! a quick way to try size/time thresholds. A channel with no traffic for the
//! configured latch timeout is closed by the latch sweep.

use anyhow::{Context, Result};
use clap::Parser;
use proxy_tunnel::{
    config::Config,
    latch::LatchRegistry,
    transport::{QueueSink, SinkEvent},
    tunnel::Multiplexer,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// How long to wait for outstanding echoes before closing
const ECHO_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Tunnel loopback - exercise channel buffering against an echo peer
#[derive(Parser, Debug)]
#[command(name = "tunnel-loopback")]
#[command(about = "Send stdin through a proxy channel to an in-process echo peer")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<String>,

    /// Channel id to open
    #[arg(long, default_value_t = 1)]
    channel_id: u32,

    /// Size threshold in bytes (overrides config)
    #[arg(long)]
    size_threshold: Option<usize>,

    /// Time threshold in milliseconds (overrides config)
    #[arg(long)]
    time_threshold_ms: Option<u64>,

    /// Log level (trace, debug, info, warn, error) (overrides config)
    #[arg(short = 'v', long)]
    log_level: Option<String>,
}

/// What the echo peer saw
#[derive(Debug, Default)]
struct PeerStats {
    frames: usize,
    bytes: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) if Path::new(path).exists() => {
            Config::load(path).context("Failed to load configuration")?
        }
        Some(path) => {
            eprintln!("Config {} not found, using defaults", path);
            Config::default()
        }
        None => Config::default(),
    };

    if let Some(size) = args.size_threshold {
        config.tunnel.size_threshold = size;
    }
    if let Some(ms) = args.time_threshold_ms {
        config.tunnel.time_threshold_ms = ms;
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }

    // Initialize logging on stderr; stdout carries the echoed data
    if config.logging.format == "compact" {
        tracing_subscriber::fmt()
            .compact()
            .with_env_filter(config.logging.level.as_str())
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(config.logging.level.as_str())
            .with_writer(std::io::stderr)
            .init();
    }

    let options = config.channel_options();
    info!(
        "Loopback channel {}: size threshold {} bytes, time threshold {:?}, idle timeout {:?}",
        args.channel_id, options.size_threshold, options.time_threshold, options.idle_timeout
    );

    let (sink, mut events) = QueueSink::new();
    let mux = Multiplexer::new(sink, options);
    let channel = mux
        .open_channel(args.channel_id)
        .context("Failed to open channel")?;

    // Echo peer: every frame goes straight back into its channel
    let peer = {
        let mux = mux.clone();
        tokio::spawn(async move {
            let mut stats = PeerStats::default();
            while let Some(event) = events.recv().await {
                match event {
                    SinkEvent::Frame {
                        channel_id,
                        payload,
                    } => {
                        stats.frames += 1;
                        stats.bytes += payload.len();
                        debug!("Peer: frame of {} bytes on channel {}", payload.len(), channel_id);
                        if let Err(e) = mux.receive(channel_id, &payload) {
                            warn!("Peer: echo failed: {}", e);
                        }
                    }
                    SinkEvent::CloseRequest { channel_id } => {
                        debug!("Peer: close requested for channel {}", channel_id);
                        break;
                    }
                }
            }
            stats
        })
    };

    // Idle sweep: an expired teardown latch closes the channel
    let latches = Arc::new(LatchRegistry::new());
    latches.register(args.channel_id, channel.closed_latch());
    let reaper = latches.spawn_reaper(config.latch.sweep_interval());
    let idle_watch = {
        let channel = channel.clone();
        tokio::spawn(async move {
            channel.wait_closed().await;
            if channel.closed_latch().is_expired() {
                warn!(
                    "Channel {} idle for {:?}, closing",
                    channel.id(),
                    channel.closed_latch().timeout()
                );
                channel.close().await;
            }
        })
    };

    // Reader: echoed bytes to stdout, progress published for the drain wait
    let (received_tx, mut received_rx) = watch::channel(0usize);
    let reader = {
        let channel = channel.clone();
        tokio::spawn(async move {
            let mut stdout = tokio::io::stdout();
            let mut buf = vec![0u8; 4096];
            let mut total = 0usize;
            loop {
                match channel.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => {
                        total += n;
                        if stdout.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                        let _ = stdout.flush().await;
                        let _ = received_tx.send(total);
                    }
                    Err(e) => {
                        warn!("Read failed: {}", e);
                        break;
                    }
                }
            }
        })
    };

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut sent = 0usize;
    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        let mut data = line.into_bytes();
        data.push(b'\n');
        channel.send(&data).await.context("Send failed")?;
        sent += data.len();
    }
    channel.flush().await.context("Flush failed")?;

    let drained = matches!(
        tokio::time::timeout(
            ECHO_DRAIN_TIMEOUT,
            received_rx.wait_for(|received| *received >= sent),
        )
        .await,
        Ok(Ok(_))
    );
    if !drained {
        warn!("Not all echoes arrived before close");
    }

    channel.close().await;
    reaper.abort();
    let _ = idle_watch.await;
    let _ = reader.await;
    let stats = peer.await.context("Echo peer failed")?;

    info!(
        "Sent {} bytes in {} frames (average {} bytes per frame)",
        stats.bytes,
        stats.frames,
        stats.bytes.checked_div(stats.frames).unwrap_or(0)
    );

    Ok(())
}
