//! Capture stage: drives the tick, samples the cursor, owns the
//! last-frame cache.
//!
//! The server emits frames at the tick rate whether or not the screen
//! changes. When the source times out, the cached pixels are re-emitted
//! with the current cursor and `duplicate = true`, so receivers always
//! see a constant stream: keepalives stay healthy, silence is never
//! mistaken for a disconnect, and inter-frame prediction stays cheap.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{StreamConfig, CAPTURE_TIMEOUT};
use crate::registry::ClientRegistry;
use crate::stream::queue::FrameQueue;
use crate::stream::source::{cursor_normalized, FrameSource, RawFrame};
use crate::stream::types::CapturedFrame;
use crate::stream::PipelineStats;

/// Acquire deadline for the forced path when nothing has ever been
/// captured but a client is waiting for a usable frame.
const FORCED_CAPTURE_TIMEOUT: Duration = Duration::from_millis(100);

// ── CaptureStage ─────────────────────────────────────────────────

/// The capture worker.
///
/// The last-frame cache is a private field: written on every fresh
/// grab and read on the duplicate path, both from this stage's own
/// tick, never across stages.
pub struct CaptureStage {
    source: Box<dyn FrameSource>,
    queue: Arc<FrameQueue<CapturedFrame>>,
    registry: Arc<ClientRegistry>,
    stats: Arc<PipelineStats>,
    interval: Duration,
    last: Option<RawFrame>,
    sequence: u64,
    consecutive_errors: u32,
}

impl CaptureStage {
    pub fn new(
        source: Box<dyn FrameSource>,
        queue: Arc<FrameQueue<CapturedFrame>>,
        registry: Arc<ClientRegistry>,
        config: &StreamConfig,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            source,
            queue,
            registry,
            stats,
            interval: config.tick_interval(),
            last: None,
            sequence: 0,
            consecutive_errors: 0,
        }
    }

    /// Run the tick loop until cancelled, then close the capture queue
    /// so downstream stages drain and stop.
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            // Idle without viewers: no capture work, no queue traffic.
            if self.registry.client_count() == 0 {
                continue;
            }

            self.tick();
        }

        self.queue.close();
    }

    /// One capture tick. Exposed for tests; `run` is a thin loop over it.
    pub fn tick(&mut self) {
        let cursor = cursor_normalized();

        match self.source.grab(CAPTURE_TIMEOUT) {
            Ok(raw) => {
                self.consecutive_errors = 0;
                self.emit_fresh(raw, cursor);
            }
            Err(crate::error::MiraError::Timeout(_)) => {
                self.emit_duplicate_or_synthesize(cursor);
            }
            Err(e) => {
                if self.consecutive_errors == 0 {
                    warn!("capture error: {e}; replaying cached frame");
                }
                self.consecutive_errors = self.consecutive_errors.saturating_add(1);
                self.emit_duplicate_or_synthesize(cursor);
            }
        }
    }

    /// Fresh pixels: copy into a new buffer, refresh the cache, emit.
    ///
    /// The copy is deliberate ("new buffer per frame"): the emitted
    /// buffer outlives this tick while the encoder works on it, so it
    /// cannot alias the cache.
    fn emit_fresh(&mut self, raw: RawFrame, cursor: (f32, f32)) {
        let frame = CapturedFrame {
            data: raw.data.clone(),
            width: raw.width,
            height: raw.height,
            cursor,
            sequence: self.next_sequence(),
            duplicate: false,
        };
        self.last = Some(raw);
        self.stats.frames_captured();
        self.push(frame);
    }

    fn emit_duplicate_or_synthesize(&mut self, cursor: (f32, f32)) {
        if let Some(last) = &self.last {
            let frame = CapturedFrame {
                data: last.data.clone(),
                width: last.width,
                height: last.height,
                cursor,
                sequence: self.next_sequence(),
                duplicate: true,
            };
            self.stats.frames_duplicated();
            self.push(frame);
            return;
        }

        // Nothing has ever been captured but a client is attached and
        // waiting on its first keyframe: force a slower grab, and as a
        // last resort synthesize a black frame at the native size.
        let raw = match self.source.grab(FORCED_CAPTURE_TIMEOUT) {
            Ok(raw) => raw,
            Err(e) => {
                debug!("forced capture failed ({e}); synthesizing blank frame");
                let (width, height) = self.source.dimensions();
                RawFrame {
                    data: vec![0u8; width as usize * height as usize * 4],
                    width,
                    height,
                }
            }
        };
        self.emit_fresh(raw, cursor);
    }

    fn next_sequence(&mut self) -> u64 {
        let seq = self.sequence;
        self.sequence += 1;
        seq
    }

    fn push(&self, frame: CapturedFrame) {
        if self.queue.push(frame).is_some() {
            self.stats.frames_dropped();
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
