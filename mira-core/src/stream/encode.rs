//! H.264 encode stage with a per-frame JPEG fallback.
//!
//! The encoder is lazily opened on the first frame, using that frame's
//! dimensions plus the configured fps/bitrate. Hardware encoders are
//! probed in order (NVENC, AMF, QuickSync) before software x264; when
//! none opens, the stage downgrades permanently to JPEG and every
//! output is a keyframe.
//!
//! Keyframe requests arrive through [`KeyframeSignal`], an atomic that
//! is read-and-cleared on every encode. The `is_keyframe` flag on the
//! output is whatever the codec actually produced, which may exceed
//! requests at GOP boundaries.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ffmpeg_next as ffmpeg;
use image::ImageEncoder;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::StreamConfig;
use crate::control::ControlMessage;
use crate::error::MiraError;
use crate::registry::ClientRegistry;
use crate::stream::queue::FrameQueue;
use crate::stream::types::{CapturedFrame, EncodedVideoFrame};
use crate::stream::PipelineStats;

/// Hardware encoders in preference order, then the software fallback.
const ENCODER_PROBE_ORDER: [&str; 4] = ["h264_nvenc", "h264_amf", "h264_qsv", "libx264"];

/// JPEG quality for the fallback path.
const JPEG_QUALITY: u8 = 80;

// ── KeyframeSignal ───────────────────────────────────────────────

/// Process-wide "force the next frame to be an I-frame" latch.
///
/// Set by the control plane (any thread); read-and-cleared atomically
/// by the encode worker. Two rapid requests collapse into at least one
/// forced I-frame, never necessarily two.
#[derive(Debug, Default)]
pub struct KeyframeSignal(AtomicBool);

impl KeyframeSignal {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Arm the latch.
    pub fn request(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Consume the latch, returning whether it was armed.
    pub fn take(&self) -> bool {
        self.0.swap(false, Ordering::AcqRel)
    }

    /// Peek without clearing (fan-out gating uses the per-session flag
    /// instead; this exists for tests and introspection).
    pub fn is_armed(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

// ── H264Encoder ──────────────────────────────────────────────────

/// An opened H.264 encoder context plus its BGRA→YUV420P scaler.
///
/// Resolution, fps and bitrate are fixed at construction; the stage
/// re-instantiates the whole context when the display resolution
/// changes. At most one context is live per process.
struct H264Encoder {
    encoder: ffmpeg::codec::encoder::video::Encoder,
    scaler: ffmpeg::software::scaling::Context,
    width: u32,
    height: u32,
    name: &'static str,
    pts: i64,
    /// Sequence/cursor labels for frames submitted but not yet emitted
    /// by the codec, in submission order.
    pending: VecDeque<(u64, (f32, f32))>,
}

impl H264Encoder {
    /// Probe the encoder families in preference order.
    fn open(width: u32, height: u32, config: &StreamConfig) -> Result<Self, MiraError> {
        ffmpeg::init().map_err(|e| MiraError::EncoderInit(format!("ffmpeg init: {e}")))?;

        let mut last_err = String::from("no encoder names probed");
        for name in ENCODER_PROBE_ORDER {
            match Self::open_named(name, width, height, config) {
                Ok(enc) => {
                    info!(encoder = name, width, height, "h264 encoder opened");
                    return Ok(enc);
                }
                Err(e) => {
                    debug!(encoder = name, "unavailable: {e}");
                    last_err = e.to_string();
                }
            }
        }
        Err(MiraError::EncoderInit(last_err))
    }

    fn open_named(
        name: &'static str,
        width: u32,
        height: u32,
        config: &StreamConfig,
    ) -> Result<Self, MiraError> {
        let codec = ffmpeg::encoder::find_by_name(name)
            .ok_or_else(|| MiraError::EncoderInit(format!("{name} not in this ffmpeg build")))?;

        let mut ctx = ffmpeg::codec::context::Context::new_with_codec(codec)
            .encoder()
            .video()
            .map_err(|e| MiraError::EncoderInit(format!("{name}: {e}")))?;

        let fps = config.target_fps as i32;
        ctx.set_width(width);
        ctx.set_height(height);
        ctx.set_format(ffmpeg::format::Pixel::YUV420P);
        ctx.set_time_base(ffmpeg::Rational(1, fps));
        ctx.set_frame_rate(Some(ffmpeg::Rational(fps, 1)));
        ctx.set_bit_rate(config.bitrate as usize);
        ctx.set_max_b_frames(0);
        ctx.set_gop(config.gop_size());
        ctx.set_flags(ffmpeg::codec::Flags::LOW_DELAY);

        // Family-specific zero-latency tuning. Rate control is CBR
        // everywhere so the stream holds the configured bitrate.
        let mut opts = ffmpeg::Dictionary::new();
        match name {
            "h264_nvenc" => {
                opts.set("preset", "p1");
                opts.set("tune", "ull");
                opts.set("rc", "cbr");
                opts.set("delay", "0");
                opts.set("zerolatency", "1");
            }
            "h264_amf" => {
                opts.set("usage", "ultralowlatency");
                opts.set("rc", "cbr");
            }
            "h264_qsv" => {
                opts.set("preset", "veryfast");
                opts.set("look_ahead", "0");
            }
            _ => {
                opts.set("preset", "ultrafast");
                opts.set("tune", "zerolatency");
            }
        }

        let encoder = ctx
            .open_with(opts)
            .map_err(|e| MiraError::EncoderInit(format!("{name} open: {e}")))?;

        let scaler = ffmpeg::software::scaling::Context::get(
            ffmpeg::format::Pixel::BGRA,
            width,
            height,
            ffmpeg::format::Pixel::YUV420P,
            width,
            height,
            ffmpeg::software::scaling::Flags::FAST_BILINEAR,
        )
        .map_err(|e| MiraError::EncoderInit(format!("scaler: {e}")))?;

        Ok(Self {
            encoder,
            scaler,
            width,
            height,
            name,
            pts: 0,
            pending: VecDeque::new(),
        })
    }

    /// Encode one captured frame, returning zero or more output frames
    /// (the codec may hold frames briefly even in low-delay mode).
    fn encode(
        &mut self,
        frame: &CapturedFrame,
        force_keyframe: bool,
    ) -> Result<Vec<EncodedVideoFrame>, MiraError> {
        let mut bgra =
            ffmpeg::util::frame::Video::new(ffmpeg::format::Pixel::BGRA, self.width, self.height);
        let row_len = self.width as usize * 4;
        let stride = bgra.stride(0);
        for y in 0..self.height as usize {
            bgra.data_mut(0)[y * stride..y * stride + row_len]
                .copy_from_slice(&frame.data[y * row_len..(y + 1) * row_len]);
        }

        let mut yuv =
            ffmpeg::util::frame::Video::new(ffmpeg::format::Pixel::YUV420P, self.width, self.height);
        self.scaler
            .run(&bgra, &mut yuv)
            .map_err(|e| MiraError::Encode(format!("bgra→yuv: {e}")))?;

        yuv.set_pts(Some(self.pts));
        self.pts += 1;
        if force_keyframe {
            yuv.set_kind(ffmpeg::picture::Type::I);
        }

        self.pending.push_back((frame.sequence, frame.cursor));
        self.encoder
            .send_frame(&yuv)
            .map_err(|e| MiraError::Encode(format!("send_frame: {e}")))?;

        let mut out = Vec::new();
        let mut packet = ffmpeg::Packet::empty();
        while self.encoder.receive_packet(&mut packet).is_ok() {
            let data = match packet.data() {
                Some(d) if !d.is_empty() => d.to_vec(),
                _ => continue,
            };
            let (sequence, cursor) = self
                .pending
                .pop_front()
                .unwrap_or((frame.sequence, frame.cursor));
            out.push(EncodedVideoFrame {
                data,
                cursor,
                is_keyframe: packet.is_key(),
                sequence,
            });
        }
        Ok(out)
    }
}

// ── JpegEncoder ──────────────────────────────────────────────────

/// Per-frame JPEG fallback: every output is self-contained, so every
/// output is a keyframe.
struct JpegEncoder {
    quality: u8,
    rgb: Vec<u8>,
}

impl JpegEncoder {
    fn new() -> Self {
        Self {
            quality: JPEG_QUALITY,
            rgb: Vec::new(),
        }
    }

    fn encode(&mut self, frame: &CapturedFrame) -> Result<EncodedVideoFrame, MiraError> {
        bgra_to_rgb(&frame.data, &mut self.rgb);

        let mut jpeg = Vec::new();
        let encoder =
            image::codecs::jpeg::JpegEncoder::new_with_quality(&mut jpeg, self.quality);
        encoder
            .write_image(
                &self.rgb,
                frame.width,
                frame.height,
                image::ExtendedColorType::Rgb8,
            )
            .map_err(|e| MiraError::Encode(format!("jpeg: {e}")))?;

        Ok(EncodedVideoFrame {
            data: jpeg,
            cursor: frame.cursor,
            is_keyframe: true,
            sequence: frame.sequence,
        })
    }
}

/// Drop alpha and swap to RGB byte order in one pass.
fn bgra_to_rgb(bgra: &[u8], rgb: &mut Vec<u8>) {
    rgb.clear();
    rgb.reserve(bgra.len() / 4 * 3);
    for px in bgra.chunks_exact(4) {
        rgb.extend_from_slice(&[px[2], px[1], px[0]]);
    }
}

// ── EncodeStage ──────────────────────────────────────────────────

enum Backend {
    H264(Box<H264Encoder>),
    Jpeg(JpegEncoder),
}

/// The encode worker: consumes the capture queue, publishes encoded
/// frames, owns the encoder lifecycle.
pub struct EncodeStage {
    input: Arc<FrameQueue<CapturedFrame>>,
    output: Arc<FrameQueue<EncodedVideoFrame>>,
    keyframe: Arc<KeyframeSignal>,
    registry: Arc<ClientRegistry>,
    config: StreamConfig,
    stats: Arc<PipelineStats>,
    backend: Option<Backend>,
    /// Set once H.264 init has failed; we never retry within a process.
    jpeg_only: bool,
    consecutive_errors: u32,
}

impl EncodeStage {
    pub fn new(
        input: Arc<FrameQueue<CapturedFrame>>,
        output: Arc<FrameQueue<EncodedVideoFrame>>,
        keyframe: Arc<KeyframeSignal>,
        registry: Arc<ClientRegistry>,
        config: StreamConfig,
        stats: Arc<PipelineStats>,
    ) -> Self {
        let jpeg_only = !config.h264;
        Self {
            input,
            output,
            keyframe,
            registry,
            config,
            stats,
            backend: None,
            jpeg_only,
            consecutive_errors: 0,
        }
    }

    /// Run until the capture queue closes or `cancel` fires, then close
    /// the output queue so the fan-out drains and stops.
    pub async fn run(mut self, cancel: CancellationToken) {
        loop {
            let frame = tokio::select! {
                frame = self.input.pop() => frame,
                _ = cancel.cancelled() => None,
            };
            let Some(frame) = frame else { break };
            self.encode_one(frame).await;
        }
        self.output.close();
    }

    async fn encode_one(&mut self, frame: CapturedFrame) {
        self.ensure_backend(&frame).await;
        let force = self.keyframe.take();

        let result = match self.backend.as_mut() {
            Some(Backend::H264(enc)) => enc.encode(&frame, force).map_err(Some),
            Some(Backend::Jpeg(enc)) => enc.encode(&frame).map(|f| vec![f]).map_err(Some),
            None => Err(None),
        };

        match result {
            Ok(encoded) => {
                self.consecutive_errors = 0;
                for out in encoded {
                    self.stats.frames_encoded();
                    if self.output.push(out).is_some() {
                        self.stats.frames_dropped();
                    }
                }
            }
            Err(err) => {
                // A rejected frame is dropped; the encoder stays up. If
                // a keyframe was requested, keep it armed for the next
                // frame instead of losing the request.
                if force {
                    self.keyframe.request();
                }
                if self.consecutive_errors == 0 {
                    if let Some(e) = err {
                        warn!(sequence = frame.sequence, "frame dropped: {e}");
                    }
                }
                self.consecutive_errors = self.consecutive_errors.saturating_add(1);
            }
        }
    }

    /// Open (or re-open after a resolution change) the encoder.
    async fn ensure_backend(&mut self, frame: &CapturedFrame) {
        let resolution_changed = matches!(
            self.backend,
            Some(Backend::H264(ref enc)) if enc.width != frame.width || enc.height != frame.height
        );
        if self.backend.is_some() && !resolution_changed {
            return;
        }
        if resolution_changed {
            info!(
                width = frame.width,
                height = frame.height,
                "resolution changed; reopening encoder"
            );
            self.backend = None;
        }

        if !self.jpeg_only {
            match H264Encoder::open(frame.width, frame.height, &self.config) {
                Ok(enc) => {
                    self.backend = Some(Backend::H264(Box::new(enc)));
                    return;
                }
                Err(e) => {
                    warn!("no h264 encoder available ({e}); falling back to jpeg for this run");
                    self.jpeg_only = true;
                    self.registry
                        .broadcast_control(&ControlMessage::status("video: jpeg fallback"))
                        .await;
                }
            }
        }
        self.backend = Some(Backend::Jpeg(JpegEncoder::new()));
    }

    /// Name of the active encoder, for observability.
    pub fn encoder_name(&self) -> &'static str {
        match &self.backend {
            Some(Backend::H264(enc)) => enc.name,
            Some(Backend::Jpeg(_)) => "jpeg",
            None => "uninitialized",
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn bgra_frame(w: u32, h: u32, seq: u64) -> CapturedFrame {
        CapturedFrame {
            data: vec![0x40; (w * h * 4) as usize],
            width: w,
            height: h,
            cursor: (0.1, 0.9),
            sequence: seq,
            duplicate: false,
        }
    }

    #[test]
    fn keyframe_signal_read_and_clear() {
        let sig = KeyframeSignal::new();
        assert!(!sig.take());

        sig.request();
        sig.request(); // two rapid requests collapse
        assert!(sig.is_armed());
        assert!(sig.take());
        assert!(!sig.take());
    }

    #[test]
    fn jpeg_fallback_is_always_keyframe() {
        let mut enc = JpegEncoder::new();
        let out = enc.encode(&bgra_frame(32, 16, 7)).unwrap();

        assert!(out.is_keyframe);
        assert_eq!(out.sequence, 7);
        assert_eq!(out.cursor, (0.1, 0.9));
        // Payload parses as JPEG: starts with the SOI marker.
        assert_eq!(&out.data[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn bgra_to_rgb_swaps_channels() {
        let bgra = [10u8, 20, 30, 255, 1, 2, 3, 255];
        let mut rgb = Vec::new();
        bgra_to_rgb(&bgra, &mut rgb);
        assert_eq!(rgb, vec![30, 20, 10, 3, 2, 1]);
    }

    #[test]
    fn jpeg_output_varies_with_sequence() {
        let mut enc = JpegEncoder::new();
        let a = enc.encode(&bgra_frame(16, 16, 1)).unwrap();
        let b = enc.encode(&bgra_frame(16, 16, 2)).unwrap();
        assert_eq!(a.sequence + 1, b.sequence);
    }
}
