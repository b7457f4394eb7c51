//! Fan-out stage: builds wire frames and dispatches them to every
//! eligible session in parallel.
//!
//! Per-session ordering matches encode order; audio and video are
//! independently ordered. A send that exceeds its deadline marks the
//! session for cleanup but never stalls the other sessions or the
//! stage itself.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::SEND_TIMEOUT;
use crate::registry::{ClientRegistry, ClientSession};
use crate::stream::queue::FrameQueue;
use crate::stream::types::{AudioPacket, EncodedVideoFrame};
use crate::stream::PipelineStats;
use crate::wire;

/// How often the per-stage counters go to the log.
const STATS_INTERVAL: Duration = Duration::from_secs(1);

// ── FanOut ───────────────────────────────────────────────────────

/// The fan-out worker.
pub struct FanOut {
    video: Arc<FrameQueue<EncodedVideoFrame>>,
    audio: Arc<FrameQueue<AudioPacket>>,
    registry: Arc<ClientRegistry>,
    stats: Arc<PipelineStats>,
    send_timeout: Duration,
}

impl FanOut {
    pub fn new(
        video: Arc<FrameQueue<EncodedVideoFrame>>,
        audio: Arc<FrameQueue<AudioPacket>>,
        registry: Arc<ClientRegistry>,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            video,
            audio,
            registry,
            stats,
            send_timeout: SEND_TIMEOUT,
        }
    }

    /// Override the per-send deadline (tests).
    #[cfg(test)]
    fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    /// Run until the video queue closes (the pipeline upstream has
    /// drained) or `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) {
        let mut audio_active = true;
        let mut last_stats = Instant::now();

        loop {
            tokio::select! {
                frame = self.video.pop() => match frame {
                    Some(frame) => self.dispatch_video(frame).await,
                    None => break,
                },
                packet = self.audio.pop(), if audio_active => match packet {
                    Some(packet) => self.dispatch_audio(packet).await,
                    // Audio disabled or drained; video continues alone.
                    None => audio_active = false,
                },
                _ = cancel.cancelled() => break,
            }

            if last_stats.elapsed() >= STATS_INTERVAL {
                self.stats.log();
                last_stats = Instant::now();
            }
        }
    }

    /// Send one encoded video frame to every eligible session.
    async fn dispatch_video(&self, frame: EncodedVideoFrame) {
        let sessions = self.registry.snapshot().await;
        if sessions.is_empty() {
            return;
        }

        // One allocation, shared by every session's writer.
        let payload = Arc::new(wire::encode_video(
            frame.is_keyframe,
            frame.cursor,
            &frame.data,
        ));

        let mut sends = Vec::with_capacity(sessions.len());
        for session in sessions {
            if !session.is_open() {
                continue;
            }

            // Keyframe gating: a session that still needs an I-frame
            // never sees P-frames. The gate is cleared before the send
            // so a request arriving mid-send arms a fresh one.
            if frame.is_keyframe {
                session.clear_needs_keyframe();
            } else if session.needs_keyframe() {
                self.stats.video_skipped();
                continue;
            }

            let payload = Arc::clone(&payload);
            let sequence = frame.sequence;
            let timeout = self.send_timeout;
            sends.push(async move {
                let result = session.send_media(payload, timeout).await;
                (session, sequence, result)
            });
        }

        for (session, sequence, result) in join_all(sends).await {
            match result {
                Ok(()) => {
                    session.record_sequence(sequence);
                    self.stats.video_sent();
                }
                Err(e) => self.fail_session(&session, &e.to_string()),
            }
        }
    }

    /// Audio packets go to every open session unconditionally.
    async fn dispatch_audio(&self, packet: AudioPacket) {
        let sessions = self.registry.snapshot().await;
        if sessions.is_empty() {
            return;
        }

        let payload = Arc::new(wire::encode_audio(&packet.data));

        let sends = sessions
            .into_iter()
            .filter(|s| s.is_open())
            .map(|session| {
                let payload = Arc::clone(&payload);
                let timeout = self.send_timeout;
                async move {
                    let result = session.send_media(payload, timeout).await;
                    (session, result)
                }
            })
            .collect::<Vec<_>>();

        for (session, result) in join_all(sends).await {
            match result {
                Ok(()) => self.stats.audio_sent(),
                Err(e) => self.fail_session(&session, &e.to_string()),
            }
        }
    }

    /// A failed or timed-out send marks the session for cleanup; the
    /// registry entry is reclaimed when its inbound reader fails.
    fn fail_session(&self, session: &Arc<ClientSession>, reason: &str) {
        self.stats.send_failure();
        if session.is_open() {
            warn!(session = session.id(), "send failed: {reason}");
            session.mark_for_cleanup();
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::SessionMessage;
    use crate::stream::encode::KeyframeSignal;
    use crate::wire::WireFrame;
    use tokio::sync::mpsc;

    fn fanout_with_registry() -> (FanOut, Arc<ClientRegistry>) {
        let registry = ClientRegistry::new(4, KeyframeSignal::new());
        let fanout = FanOut::new(
            Arc::new(FrameQueue::new(8)),
            Arc::new(FrameQueue::new(8)),
            Arc::clone(&registry),
            Arc::new(PipelineStats::default()),
        );
        (fanout, registry)
    }

    fn video(seq: u64, key: bool) -> EncodedVideoFrame {
        EncodedVideoFrame {
            data: vec![0xEE; 16],
            cursor: (0.5, 0.5),
            is_keyframe: key,
            sequence: seq,
        }
    }

    fn drain(rx: &mut mpsc::Receiver<SessionMessage>) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            if let SessionMessage::Media(bytes) = msg {
                out.push((*bytes).clone());
            }
        }
        out
    }

    #[tokio::test]
    async fn first_delivered_frame_is_a_keyframe() {
        let (fanout, registry) = fanout_with_registry();
        let (_session, mut rx) = registry.register().await.unwrap();

        // P-frames before the keyframe are gated off.
        fanout.dispatch_video(video(0, false)).await;
        fanout.dispatch_video(video(1, false)).await;
        assert!(drain(&mut rx).is_empty());

        fanout.dispatch_video(video(2, true)).await;
        let frames = drain(&mut rx);
        assert_eq!(frames.len(), 1);
        match wire::parse(&frames[0]).unwrap() {
            WireFrame::Video { is_keyframe, .. } => assert!(is_keyframe),
            other => panic!("wrong frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn p_frames_flow_after_the_keyframe() {
        let (fanout, registry) = fanout_with_registry();
        let (session, mut rx) = registry.register().await.unwrap();

        fanout.dispatch_video(video(0, true)).await;
        fanout.dispatch_video(video(1, false)).await;
        fanout.dispatch_video(video(2, false)).await;

        assert_eq!(drain(&mut rx).len(), 3);
        assert_eq!(session.last_sequence(), 2);
        assert!(!session.needs_keyframe());
    }

    #[tokio::test]
    async fn request_keyframe_gates_until_next_i_frame() {
        let (fanout, registry) = fanout_with_registry();
        let (session, mut rx) = registry.register().await.unwrap();

        fanout.dispatch_video(video(0, true)).await;
        drain(&mut rx);

        registry.request_keyframe(&session);
        fanout.dispatch_video(video(1, false)).await;
        fanout.dispatch_video(video(2, false)).await;
        assert!(drain(&mut rx).is_empty(), "no P-frames while re-syncing");

        fanout.dispatch_video(video(3, true)).await;
        let frames = drain(&mut rx);
        assert_eq!(frames.len(), 1);
        assert!(matches!(
            wire::parse(&frames[0]).unwrap(),
            WireFrame::Video {
                is_keyframe: true,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn audio_is_always_eligible() {
        let (fanout, registry) = fanout_with_registry();
        let (session, mut rx) = registry.register().await.unwrap();
        assert!(session.needs_keyframe());

        let packet = AudioPacket {
            data: vec![0, 0, 0, 0, 0, 0, 0x07],
        };
        fanout.dispatch_audio(packet).await;

        let frames = drain(&mut rx);
        assert_eq!(frames.len(), 1);
        assert!(matches!(
            wire::parse(&frames[0]).unwrap(),
            WireFrame::Audio { .. }
        ));
    }

    #[tokio::test]
    async fn sequences_recorded_per_session_are_increasing() {
        let (fanout, registry) = fanout_with_registry();
        let (session, mut rx) = registry.register().await.unwrap();

        fanout.dispatch_video(video(5, true)).await;
        // Gap: the encoder held frame 6.
        fanout.dispatch_video(video(7, false)).await;
        drain(&mut rx);

        assert_eq!(session.last_sequence(), 7);
    }

    #[tokio::test]
    async fn stuck_session_is_marked_without_stalling_others() {
        let (fanout, registry) = fanout_with_registry();
        let fanout = fanout.with_send_timeout(Duration::from_millis(20));
        let (stuck, _stuck_rx) = registry.register().await.unwrap();
        let (healthy, mut healthy_rx) = registry.register().await.unwrap();

        // Saturate the stuck session's channel so sends time out.
        while stuck
            .send_media(Arc::new(vec![0]), Duration::from_millis(1))
            .await
            .is_ok()
        {}

        fanout.dispatch_video(video(0, true)).await;

        assert_eq!(drain(&mut healthy_rx).len(), 1);
        assert!(healthy.is_open());
        assert!(!stuck.is_open(), "timed-out session marked for cleanup");
    }
}
