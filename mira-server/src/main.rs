//! mira-server — streams the primary display to remote viewers.
//!
//! Thin bootstrap around `mira-core`: parse flags, initialise logging,
//! start the pipeline and the WebSocket server, and unwind cleanly on
//! Ctrl-C.

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use mira_core::{ClientRegistry, KeyframeSignal, Pipeline, Server, StreamConfig};

// ── Cli ──────────────────────────────────────────────────────────

/// Low-latency desktop streaming server.
///
/// Defaults match the reference deployment; every knob is also
/// available as a flag.
#[derive(Debug, Parser)]
#[command(name = "mira-server", version, about)]
struct Cli {
    /// Target frames per second.
    #[arg(long, default_value_t = mira_core::config::TARGET_FPS)]
    fps: u32,

    /// Encoder bitrate in Mbps.
    #[arg(long, default_value_t = mira_core::config::BITRATE_MBPS)]
    bitrate: u32,

    /// Maximum simultaneous viewers.
    #[arg(long, default_value_t = mira_core::config::MAX_CLIENTS)]
    max_clients: usize,

    /// Ports to serve WebSocket sessions on.
    #[arg(long, num_args = 1.., default_values_t = [mira_core::config::PRIMARY_PORT, mira_core::config::SECONDARY_PORT])]
    port: Vec<u16>,

    /// Disable GPU desktop duplication (use the CPU frame grabber).
    #[arg(long)]
    no_hardware_capture: bool,

    /// Skip H.264 entirely and stream per-frame JPEG.
    #[arg(long)]
    jpeg: bool,

    /// Disable the loopback audio stream.
    #[arg(long)]
    no_audio: bool,

    /// Capture/encode queue depth. 3 favours latency; 120 absorbs
    /// bursty networks.
    #[arg(long, default_value_t = 3)]
    queue_depth: usize,
}

impl Cli {
    fn into_config(self) -> StreamConfig {
        StreamConfig {
            target_fps: self.fps,
            bitrate: self.bitrate * 1_000_000,
            max_clients: self.max_clients,
            ports: self.port,
            hardware_capture: !self.no_hardware_capture,
            h264: !self.jpeg,
            audio: !self.no_audio,
            video_queue_depth: self.queue_depth,
            ..StreamConfig::default()
        }
    }
}

// ── main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = Cli::parse().into_config();
    info!(
        fps = config.target_fps,
        bitrate = config.bitrate,
        max_clients = config.max_clients,
        "starting"
    );

    if let Err(e) = run(config).await {
        error!("fatal: {e}");
        std::process::exit(1);
    }
}

async fn run(config: StreamConfig) -> Result<(), mira_core::MiraError> {
    let cancel = CancellationToken::new();
    let keyframe = KeyframeSignal::new();
    let registry = ClientRegistry::new(config.max_clients, keyframe.clone());

    let pipeline = Pipeline::start(
        &config,
        registry.clone(),
        keyframe,
        cancel.clone(),
    )?;

    let server = Server::new(config, registry);
    let server_task = tokio::spawn(server.run(cancel.clone()));

    tokio::signal::ctrl_c()
        .await
        .map_err(mira_core::MiraError::Io)?;
    info!("shutting down");

    // Writers drain first, then consumers; the server stops accepting
    // while in-flight sessions wind down.
    cancel.cancel();
    pipeline.join().await;
    let _ = server_task.await;

    info!("bye");
    Ok(())
}
