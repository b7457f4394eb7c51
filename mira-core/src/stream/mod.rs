//! The capture → encode → fan-out engine and its audio sub-pipeline.
//!
//! Four workers run concurrently, connected by bounded drop-oldest
//! queues:
//!
//! ```text
//! CaptureStage ──[captureQ]── EncodeStage ──[encodeQ]──┐
//!                                                      ├── FanOut ── sessions
//! AudioStage  ──────────────────[audioQ]───────────────┘
//! ```
//!
//! Shutdown drains writers first: cancelling the token stops the
//! capture tick, which closes captureQ; the encoder drains it and
//! closes encodeQ; the fan-out drains that and returns.

pub mod audio;
pub mod capture;
pub mod encode;
pub mod fanout;
pub mod queue;
pub mod source;
pub mod types;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::StreamConfig;
use crate::error::MiraError;
use crate::registry::ClientRegistry;
use audio::AudioStage;
use capture::CaptureStage;
use encode::{EncodeStage, KeyframeSignal};
use fanout::FanOut;
use queue::FrameQueue;
use types::{AudioPacket, CapturedFrame, EncodedVideoFrame};

// ── PipelineStats ────────────────────────────────────────────────

/// Cross-stage counters, written by the owning worker of each value
/// and read by the periodic stats log.
#[derive(Debug, Default)]
pub struct PipelineStats {
    captured: AtomicU64,
    duplicated: AtomicU64,
    encoded: AtomicU64,
    dropped: AtomicU64,
    video_sent: AtomicU64,
    video_skipped: AtomicU64,
    audio_sent: AtomicU64,
    send_failures: AtomicU64,
}

impl PipelineStats {
    pub fn frames_captured(&self) {
        self.captured.fetch_add(1, Ordering::Relaxed);
    }
    pub fn frames_duplicated(&self) {
        self.duplicated.fetch_add(1, Ordering::Relaxed);
    }
    pub fn frames_encoded(&self) {
        self.encoded.fetch_add(1, Ordering::Relaxed);
    }
    pub fn frames_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }
    pub fn video_sent(&self) {
        self.video_sent.fetch_add(1, Ordering::Relaxed);
    }
    pub fn video_skipped(&self) {
        self.video_skipped.fetch_add(1, Ordering::Relaxed);
    }
    pub fn audio_sent(&self) {
        self.audio_sent.fetch_add(1, Ordering::Relaxed);
    }
    pub fn send_failure(&self) {
        self.send_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn encoded_count(&self) -> u64 {
        self.encoded.load(Ordering::Relaxed)
    }

    pub fn log(&self) {
        debug!(
            captured = self.captured.load(Ordering::Relaxed),
            duplicated = self.duplicated.load(Ordering::Relaxed),
            encoded = self.encoded.load(Ordering::Relaxed),
            dropped = self.dropped.load(Ordering::Relaxed),
            video_sent = self.video_sent.load(Ordering::Relaxed),
            video_skipped = self.video_skipped.load(Ordering::Relaxed),
            audio_sent = self.audio_sent.load(Ordering::Relaxed),
            send_failures = self.send_failures.load(Ordering::Relaxed),
            "pipeline stats"
        );
    }
}

// ── Pipeline ─────────────────────────────────────────────────────

/// Handles to the running pipeline workers.
pub struct Pipeline {
    pub keyframe: Arc<KeyframeSignal>,
    pub stats: Arc<PipelineStats>,
    capture_worker: tokio::task::JoinHandle<()>,
    encode_worker: tokio::task::JoinHandle<()>,
    fanout_worker: tokio::task::JoinHandle<()>,
    audio_stage: Option<AudioStage>,
}

impl Pipeline {
    /// Open the capture source and start all four workers.
    ///
    /// The returned keyframe signal is shared with the registry and
    /// control plane; cancellation of `cancel` unwinds the stages in
    /// producer-to-consumer order.
    pub fn start(
        config: &StreamConfig,
        registry: Arc<ClientRegistry>,
        keyframe: Arc<KeyframeSignal>,
        cancel: CancellationToken,
    ) -> Result<Self, MiraError> {
        let stats = Arc::new(PipelineStats::default());
        let capture_q: Arc<FrameQueue<CapturedFrame>> =
            Arc::new(FrameQueue::new(config.video_queue_depth));
        let encode_q: Arc<FrameQueue<EncodedVideoFrame>> =
            Arc::new(FrameQueue::new(config.video_queue_depth));
        let audio_q: Arc<FrameQueue<AudioPacket>> =
            Arc::new(FrameQueue::new(config.audio_queue_depth));

        let source = source::open_source(config)?;

        let capture = CaptureStage::new(
            source,
            Arc::clone(&capture_q),
            Arc::clone(&registry),
            config,
            Arc::clone(&stats),
        );
        let encode = EncodeStage::new(
            Arc::clone(&capture_q),
            Arc::clone(&encode_q),
            Arc::clone(&keyframe),
            Arc::clone(&registry),
            config.clone(),
            Arc::clone(&stats),
        );
        let fanout = FanOut::new(
            Arc::clone(&encode_q),
            Arc::clone(&audio_q),
            Arc::clone(&registry),
            Arc::clone(&stats),
        );

        let audio_stage = if config.audio {
            match AudioStage::spawn(config.clone(), Arc::clone(&audio_q), cancel.clone()) {
                Ok(stage) => Some(stage),
                Err(e) => {
                    tracing::warn!("audio unavailable: {e}");
                    registry_status_best_effort(&registry, "audio: disabled");
                    audio_q.close();
                    None
                }
            }
        } else {
            audio_q.close();
            None
        };

        let capture_worker = tokio::spawn(capture.run(cancel.clone()));
        let encode_worker = tokio::spawn(encode.run(cancel.clone()));
        let fanout_worker = tokio::spawn(fanout.run(cancel));

        Ok(Self {
            keyframe,
            stats,
            capture_worker,
            encode_worker,
            fanout_worker,
            audio_stage,
        })
    }

    /// Wait for every worker to finish after cancellation.
    pub async fn join(self) {
        let _ = self.capture_worker.await;
        let _ = self.encode_worker.await;
        let _ = self.fanout_worker.await;
        if let Some(audio) = self.audio_stage {
            let _ = tokio::task::spawn_blocking(move || audio.join()).await;
        }
    }
}

fn registry_status_best_effort(registry: &Arc<ClientRegistry>, text: &str) {
    let registry = Arc::clone(registry);
    let msg = crate::control::ControlMessage::status(text);
    tokio::spawn(async move { registry.broadcast_control(&msg).await });
}
