//! Pipeline configuration.
//!
//! The reference deployment compiles these in; `mira-server` exposes the
//! same values as CLI flags. Defaults here are the reference constants and
//! must not drift from them.

use std::time::Duration;

// ── Reference constants ──────────────────────────────────────────

/// Target capture/encode rate in frames per second.
pub const TARGET_FPS: u32 = 60;
/// Target encoder bitrate in megabits per second.
pub const BITRATE_MBPS: u32 = 8;
/// Maximum simultaneously attached viewers.
pub const MAX_CLIENTS: usize = 4;
/// Primary WebSocket port.
pub const PRIMARY_PORT: u16 = 80;
/// Secondary WebSocket port.
pub const SECONDARY_PORT: u16 = 9000;
/// Audio output sample rate in Hz.
pub const AUDIO_SAMPLE_RATE: u32 = 48_000;
/// Audio channel count (stereo).
pub const AUDIO_CHANNELS: u16 = 2;
/// PCM samples per channel per audio packet (20 ms at 48 kHz).
pub const AUDIO_CHUNK_SAMPLES: usize = 960;

/// Capture acquire deadline before the cached frame is replayed.
pub const CAPTURE_TIMEOUT: Duration = Duration::from_millis(10);
/// Per-client send deadline before the session is marked for cleanup.
pub const SEND_TIMEOUT: Duration = Duration::from_secs(5);

// ── StreamConfig ─────────────────────────────────────────────────

/// Configuration for the whole streaming pipeline.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Target frames per second (1..=240).
    pub target_fps: u32,
    /// Encoder bitrate in bits per second.
    pub bitrate: u32,
    /// Maximum number of attached viewers.
    pub max_clients: usize,
    /// Ports to accept WebSocket sessions on.
    pub ports: Vec<u16>,
    /// Prefer GPU desktop duplication over the CPU frame grabber.
    pub hardware_capture: bool,
    /// Use H.264; when false every frame is JPEG (and a keyframe).
    pub h264: bool,
    /// Capture and stream loopback audio.
    pub audio: bool,
    /// Audio output sample rate in Hz.
    pub audio_sample_rate: u32,
    /// Audio channel count.
    pub audio_channels: u16,
    /// Depth of the capture and encode queues.
    ///
    /// 3 favours latency; 120 absorbs bursty networks. Both values ship
    /// in the field; treat this as a tuning knob.
    pub video_queue_depth: usize,
    /// Depth of the audio packet queue.
    pub audio_queue_depth: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            target_fps: TARGET_FPS,
            bitrate: BITRATE_MBPS * 1_000_000,
            max_clients: MAX_CLIENTS,
            ports: vec![PRIMARY_PORT, SECONDARY_PORT],
            hardware_capture: true,
            h264: true,
            audio: true,
            audio_sample_rate: AUDIO_SAMPLE_RATE,
            audio_channels: AUDIO_CHANNELS,
            video_queue_depth: 3,
            audio_queue_depth: 200,
        }
    }
}

impl StreamConfig {
    /// The fixed tick interval derived from `target_fps`.
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.target_fps as f64)
    }

    /// Distance between forced I-frames: ten seconds of GOP.
    pub fn gop_size(&self) -> u32 {
        self.target_fps * 10
    }
}
