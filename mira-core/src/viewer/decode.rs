//! The viewer's frame decoder.
//!
//! H.264 payloads are decoded to a **packed YUV 4:2:0** image shaped
//! for upload as one single-channel texture of height `1.5 * H`: the Y
//! plane fills the top `H` rows, and the half-resolution U and V
//! planes sit side by side in the bottom `H / 2` rows (U left, V
//! right, each `W / 2` wide). The viewer's shader samples that layout
//! directly, so no CPU colorspace conversion happens here. Legacy JPEG
//! frames decode to RGBA instead.
//!
//! The UV region is pre-filled with 128 (neutral chroma, visual grey)
//! and only overwritten from a validated source plane, so a missing or
//! dead chroma plane degrades to grey instead of bright green.

use ffmpeg_next as ffmpeg;
use tracing::{debug, info, warn};

use crate::adpcm::AdpcmDecoder;
use crate::error::MiraError;
use crate::wire::{self, WireFrame};

/// Neutral chroma value used for the green-screen guard.
const NEUTRAL_CHROMA: u8 = 128;

// ── SyncState ────────────────────────────────────────────────────

/// Keyframe synchronisation state for one session.
///
/// ```text
/// Waiting ──(I-frame decoded)──► Streaming
///    ▲                              │
///    └──(keyframe decode error /────┘
///        transport reset)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncState {
    /// Dropping P-frames until the next I-frame arrives.
    #[default]
    Waiting,
    /// Decoding everything.
    Streaming,
}

// ── ViewerEvent ──────────────────────────────────────────────────

/// One decoded image, in whichever format the path produced.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedImage {
    /// Single-channel, `width × (height * 3 / 2)` bytes, packed as
    /// described in the module docs.
    PackedYuv {
        data: Vec<u8>,
        width: u32,
        height: u32,
    },
    /// `width * height * 4` bytes.
    Rgba {
        data: Vec<u8>,
        width: u32,
        height: u32,
    },
}

/// What one inbound binary message produced.
#[derive(Debug, Clone, PartialEq)]
pub enum ViewerEvent {
    /// A decoded frame plus the cursor position that rode with it.
    Frame {
        image: DecodedImage,
        cursor: (f32, f32),
    },
    /// Cursor moved without new pixels.
    CursorMoved { cursor: (f32, f32) },
    /// Stereo samples normalized to `[-1, 1)`.
    Audio { samples: Vec<(f32, f32)> },
}

// ── ViewerSession ────────────────────────────────────────────────

/// Per-session decoder: wire parsing, sync state, codec contexts.
pub struct ViewerSession {
    state: SyncState,
    h264: H264Decoder,
    adpcm: AdpcmDecoder,
}

impl ViewerSession {
    pub fn new() -> Self {
        Self {
            state: SyncState::Waiting,
            h264: H264Decoder::new(),
            adpcm: AdpcmDecoder::new(),
        }
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    /// Handle one binary message from the server.
    ///
    /// `Ok(None)` means the message was valid but produced nothing to
    /// present: a gated P-frame, or a packet the codec is still
    /// buffering.
    pub fn handle_message(&mut self, data: &[u8]) -> Result<Option<ViewerEvent>, MiraError> {
        match wire::parse(data)? {
            WireFrame::Audio { packet } => {
                let samples = self.adpcm.decode_packet_f32(packet)?;
                Ok(Some(ViewerEvent::Audio { samples }))
            }
            WireFrame::CursorOnly { cursor } => Ok(Some(ViewerEvent::CursorMoved { cursor })),
            WireFrame::Video {
                is_keyframe,
                cursor,
                payload,
            } => self.handle_video(is_keyframe, cursor, payload),
            WireFrame::LegacyJpeg { cursor, payload } => {
                // A whole JPEG is always self-sufficient.
                let image = decode_jpeg(payload)?;
                self.state = SyncState::Streaming;
                Ok(Some(ViewerEvent::Frame { image, cursor }))
            }
        }
    }

    fn handle_video(
        &mut self,
        is_keyframe: bool,
        cursor: (f32, f32),
        payload: &[u8],
    ) -> Result<Option<ViewerEvent>, MiraError> {
        if self.state == SyncState::Waiting && !is_keyframe {
            return Ok(None);
        }

        // The H.264 fallback never applies to JPEG payloads, which some
        // servers emit inside the typed layout after encoder fallback.
        if payload.starts_with(&[0xFF, 0xD8]) {
            let image = decode_jpeg(payload)?;
            self.state = SyncState::Streaming;
            return Ok(Some(ViewerEvent::Frame { image, cursor }));
        }

        match self.h264.decode(payload) {
            Ok(Some(image)) => {
                self.state = SyncState::Streaming;
                Ok(Some(ViewerEvent::Frame { image, cursor }))
            }
            Ok(None) => Ok(None),
            Err(e) => {
                if is_keyframe {
                    // A keyframe that fails to decode means the codec
                    // state is unusable: flush and re-sync.
                    warn!("keyframe decode failed ({e}); resetting");
                    self.reset();
                } else {
                    debug!("p-frame dropped: {e}");
                }
                Ok(None)
            }
        }
    }

    /// Transport reset / reconnect: back to `Waiting`, flush the codec.
    pub fn reset(&mut self) {
        self.state = SyncState::Waiting;
        self.h264.reset();
    }
}

impl Default for ViewerSession {
    fn default() -> Self {
        Self::new()
    }
}

// ── H264Decoder ──────────────────────────────────────────────────

/// Lazily opened H.264 decoder context.
///
/// Prefers the NVDEC wrapper when the ffmpeg build carries it, then
/// the software decoder. Configured for low delay.
struct H264Decoder {
    decoder: Option<ffmpeg::codec::decoder::Video>,
}

impl H264Decoder {
    fn new() -> Self {
        Self { decoder: None }
    }

    fn open() -> Result<ffmpeg::codec::decoder::Video, MiraError> {
        ffmpeg::init().map_err(|e| MiraError::Decode(format!("ffmpeg init: {e}")))?;

        let codec = ffmpeg::decoder::find_by_name("h264_cuvid")
            .inspect(|_| info!("using nvdec hardware decoder"))
            .or_else(|| ffmpeg::decoder::find(ffmpeg::codec::Id::H264))
            .ok_or_else(|| MiraError::Decode("no h264 decoder in this ffmpeg build".into()))?;

        let mut ctx = ffmpeg::codec::context::Context::new_with_codec(codec);
        ctx.set_flags(ffmpeg::codec::Flags::LOW_DELAY);

        ctx.decoder()
            .video()
            .map_err(|e| MiraError::Decode(format!("open decoder: {e}")))
    }

    /// Feed one access unit; `Ok(None)` while the codec buffers.
    ///
    /// The input slice is handed to the codec without copying; the
    /// borrow ends before this function returns, so the slice always
    /// outlives the codec call.
    fn decode(&mut self, data: &[u8]) -> Result<Option<DecodedImage>, MiraError> {
        if self.decoder.is_none() {
            self.decoder = Some(Self::open()?);
        }
        let decoder = self.decoder.as_mut().expect("decoder just opened");

        let packet = ffmpeg::Packet::borrow(data);
        decoder
            .send_packet(&packet)
            .map_err(|e| MiraError::Decode(format!("send_packet: {e}")))?;

        let mut frame = ffmpeg::util::frame::Video::empty();
        match decoder.receive_frame(&mut frame) {
            Ok(()) => Ok(Some(pack_frame(&frame))),
            // Buffering is normal for the first frames after open.
            Err(_) => Ok(None),
        }
    }

    fn reset(&mut self) {
        if let Some(decoder) = self.decoder.as_mut() {
            decoder.flush();
        }
    }
}

// ── Frame packing ────────────────────────────────────────────────

/// Chroma layouts the packer understands. Anything else produces a
/// Y-only image over the grey-prefilled UV region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChromaLayout {
    /// Separate U and V planes at half resolution (YUV420P, YUVJ420P).
    Planar420,
    /// Interleaved UV plane (NV12) or VU plane (NV21).
    SemiPlanar { vu: bool },
    /// Separate planes, full vertical resolution (YUV422P, YUVJ422P).
    Planar422,
    Unknown,
}

impl ChromaLayout {
    fn from_pixel(format: ffmpeg::format::Pixel) -> Self {
        use ffmpeg::format::Pixel;
        match format {
            Pixel::YUV420P | Pixel::YUVJ420P => ChromaLayout::Planar420,
            Pixel::NV12 => ChromaLayout::SemiPlanar { vu: false },
            Pixel::NV21 => ChromaLayout::SemiPlanar { vu: true },
            Pixel::YUV422P | Pixel::YUVJ422P => ChromaLayout::Planar422,
            _ => ChromaLayout::Unknown,
        }
    }
}

/// Borrowed image plane with its row stride.
#[derive(Debug, Clone, Copy)]
struct Plane<'a> {
    data: &'a [u8],
    stride: usize,
}

/// Convert a decoded ffmpeg frame into the packed single-channel
/// layout.
fn pack_frame(frame: &ffmpeg::util::frame::Video) -> DecodedImage {
    let width = frame.width();
    let height = frame.height();
    let layout = ChromaLayout::from_pixel(frame.format());

    let y = Plane {
        data: frame.data(0),
        stride: frame.stride(0),
    };
    let chroma = match layout {
        ChromaLayout::SemiPlanar { .. } if frame.planes() > 1 => Some((
            Plane {
                data: frame.data(1),
                stride: frame.stride(1),
            },
            None,
        )),
        ChromaLayout::Planar420 | ChromaLayout::Planar422 if frame.planes() > 2 => Some((
            Plane {
                data: frame.data(1),
                stride: frame.stride(1),
            },
            Some(Plane {
                data: frame.data(2),
                stride: frame.stride(2),
            }),
        )),
        ChromaLayout::Unknown => {
            static WARNED: std::sync::atomic::AtomicBool = std::sync::atomic::AtomicBool::new(false);
            if !WARNED.swap(true, std::sync::atomic::Ordering::Relaxed) {
                warn!(format = ?frame.format(), "unknown pixel format; chroma left grey");
            }
            None
        }
        _ => None,
    };

    let data = pack_planes(layout, y, chroma, width as usize, height as usize);
    DecodedImage::PackedYuv {
        data,
        width,
        height,
    }
}

/// Assemble the packed buffer from raw planes. Pure and testable.
fn pack_planes(
    layout: ChromaLayout,
    y: Plane<'_>,
    chroma: Option<(Plane<'_>, Option<Plane<'_>>)>,
    width: usize,
    height: usize,
) -> Vec<u8> {
    let uv_width = width / 2;
    let uv_height = height / 2;
    let y_size = width * height;

    let mut out = vec![NEUTRAL_CHROMA; y_size + uv_width * uv_height * 2];

    // Y plane, row by row (stride may exceed width).
    for row in 0..height {
        let src = &y.data[row * y.stride..row * y.stride + width];
        out[row * width..(row + 1) * width].copy_from_slice(src);
    }

    let Some((first, second)) = chroma else {
        return out;
    };

    match layout {
        ChromaLayout::Planar420 | ChromaLayout::Planar422 => {
            let Some(v) = second else { return out };
            // 422 carries full-height chroma; sample every other row.
            let row_step = if layout == ChromaLayout::Planar422 { 2 } else { 1 };
            if !chroma_plane_valid(first, uv_width, uv_height, row_step)
                || !chroma_plane_valid(v, uv_width, uv_height, row_step)
            {
                return out;
            }
            for row in 0..uv_height {
                let dst = y_size + row * width;
                let u_src = &first.data[row * row_step * first.stride..];
                let v_src = &v.data[row * row_step * v.stride..];
                out[dst..dst + uv_width].copy_from_slice(&u_src[..uv_width]);
                out[dst + uv_width..dst + width].copy_from_slice(&v_src[..uv_width]);
            }
        }
        ChromaLayout::SemiPlanar { vu } => {
            if !interleaved_plane_valid(first, uv_width, uv_height) {
                return out;
            }
            for row in 0..uv_height {
                let dst = y_size + row * width;
                let src = &first.data[row * first.stride..];
                for x in 0..uv_width {
                    let (a, b) = (src[x * 2], src[x * 2 + 1]);
                    let (u_val, v_val) = if vu { (b, a) } else { (a, b) };
                    out[dst + x] = u_val;
                    out[dst + uv_width + x] = v_val;
                }
            }
        }
        ChromaLayout::Unknown => {}
    }

    out
}

/// Probe several spread points of a planar chroma plane; a plane that
/// reads zero everywhere is treated as uninitialised and skipped, so
/// the grey prefill stands. Multiple probes avoid false positives on
/// genuinely dark chroma.
fn chroma_plane_valid(plane: Plane<'_>, uv_width: usize, uv_height: usize, row_step: usize) -> bool {
    if uv_width == 0 || uv_height == 0 {
        return false;
    }
    let rows = [0, uv_height / 4, uv_height / 2, uv_height - 1];
    let cols = [0, uv_width / 2, uv_width - 1];
    let mut all_zero = true;
    for &row in &rows {
        let base = row * row_step * plane.stride;
        for &col in &cols {
            match plane.data.get(base + col) {
                Some(&b) => {
                    if b != 0 {
                        all_zero = false;
                    }
                }
                None => return false,
            }
        }
    }
    !all_zero
}

/// Same probe for an interleaved UV plane.
fn interleaved_plane_valid(plane: Plane<'_>, uv_width: usize, uv_height: usize) -> bool {
    if uv_width == 0 || uv_height == 0 {
        return false;
    }
    let rows = [0, uv_height / 4, uv_height / 2, uv_height - 1];
    let cols = [0, uv_width / 2, uv_width - 1];
    let mut all_zero = true;
    for &row in &rows {
        let base = row * plane.stride;
        for &col in &cols {
            match plane.data.get(base + col * 2) {
                Some(&b) => {
                    if b != 0 {
                        all_zero = false;
                    }
                }
                None => return false,
            }
        }
    }
    !all_zero
}

// ── JPEG path ────────────────────────────────────────────────────

/// Decode a JPEG payload (legacy frames and the encoder's fallback)
/// straight to RGBA.
fn decode_jpeg(payload: &[u8]) -> Result<DecodedImage, MiraError> {
    let image = image::load_from_memory_with_format(payload, image::ImageFormat::Jpeg)
        .map_err(|e| MiraError::Decode(format!("jpeg: {e}")))?;
    let rgba = image.to_rgba8();
    let (width, height) = rgba.dimensions();
    Ok(DecodedImage::Rgba {
        data: rgba.into_raw(),
        width,
        height,
    })
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const W: usize = 8;
    const H: usize = 4;
    const UV_W: usize = W / 2;
    const UV_H: usize = H / 2;

    fn y_plane(fill: u8) -> Vec<u8> {
        vec![fill; W * H]
    }

    fn packed(
        layout: ChromaLayout,
        y: &[u8],
        chroma: Option<(&[u8], usize, Option<(&[u8], usize)>)>,
    ) -> Vec<u8> {
        let y_ref = Plane { data: y, stride: W };
        let chroma_ref = chroma.map(|(first, stride, second)| {
            (
                Plane {
                    data: first,
                    stride,
                },
                second.map(|(data, stride)| Plane { data, stride }),
            )
        });
        pack_planes(layout, y_ref, chroma_ref, W, H)
    }

    #[test]
    fn packed_layout_has_one_and_a_half_heights() {
        let y = y_plane(9);
        let out = packed(ChromaLayout::Unknown, &y, None);
        assert_eq!(out.len(), W * H * 3 / 2);
        assert!(out[..W * H].iter().all(|&b| b == 9));
    }

    #[test]
    fn missing_chroma_leaves_neutral_grey() {
        let y = y_plane(0);
        let out = packed(ChromaLayout::Unknown, &y, None);
        assert!(
            out[W * H..].iter().all(|&b| b == NEUTRAL_CHROMA),
            "UV region must stay grey, never green"
        );
    }

    #[test]
    fn planar_420_copies_u_left_v_right() {
        let y = y_plane(1);
        let u = vec![0x40u8; UV_W * UV_H];
        let v = vec![0x80u8; UV_W * UV_H];
        let out = packed(
            ChromaLayout::Planar420,
            &y,
            Some((&u, UV_W, Some((&v, UV_W)))),
        );

        for row in 0..UV_H {
            let base = W * H + row * W;
            assert!(out[base..base + UV_W].iter().all(|&b| b == 0x40));
            assert!(out[base + UV_W..base + W].iter().all(|&b| b == 0x80));
        }
    }

    #[test]
    fn nv12_deinterleaves_u_then_v() {
        // Interleaved UV rows: U = 10, V = 200.
        let y = y_plane(1);
        let mut uv = Vec::new();
        for _ in 0..UV_H {
            for _ in 0..UV_W {
                uv.push(10u8);
                uv.push(200u8);
            }
        }
        let out = packed(
            ChromaLayout::SemiPlanar { vu: false },
            &y,
            Some((&uv, UV_W * 2, None)),
        );

        // Rows [H, H + H/2): U samples left, V samples right.
        for row in 0..UV_H {
            let base = W * H + row * W;
            assert!(out[base..base + UV_W].iter().all(|&b| b == 10));
            assert!(out[base + UV_W..base + W].iter().all(|&b| b == 200));
        }
    }

    #[test]
    fn nv21_swaps_the_pair() {
        let y = y_plane(1);
        let mut vu = Vec::new();
        for _ in 0..UV_H {
            for _ in 0..UV_W {
                vu.push(200u8); // V first
                vu.push(10u8); // then U
            }
        }
        let out = packed(
            ChromaLayout::SemiPlanar { vu: true },
            &y,
            Some((&vu, UV_W * 2, None)),
        );

        for row in 0..UV_H {
            let base = W * H + row * W;
            assert!(out[base..base + UV_W].iter().all(|&b| b == 10));
            assert!(out[base + UV_W..base + W].iter().all(|&b| b == 200));
        }
    }

    #[test]
    fn planar_422_subsamples_every_other_row() {
        let y = y_plane(1);
        // Full-height chroma: even rows 0x20, odd rows 0x99.
        let mut u = Vec::new();
        let mut v = Vec::new();
        for row in 0..H {
            let val = if row % 2 == 0 { 0x20 } else { 0x99 };
            u.extend(std::iter::repeat(val).take(UV_W));
            v.extend(std::iter::repeat(val).take(UV_W));
        }
        let out = packed(
            ChromaLayout::Planar422,
            &y,
            Some((&u, UV_W, Some((&v, UV_W)))),
        );

        // Only the even source rows survive.
        for row in 0..UV_H {
            let base = W * H + row * W;
            assert!(out[base..base + W].iter().all(|&b| b == 0x20));
        }
    }

    #[test]
    fn all_zero_chroma_plane_keeps_grey_guard() {
        let y = y_plane(1);
        let u = vec![0u8; UV_W * UV_H];
        let v = vec![0u8; UV_W * UV_H];
        let out = packed(
            ChromaLayout::Planar420,
            &y,
            Some((&u, UV_W, Some((&v, UV_W)))),
        );
        assert!(out[W * H..].iter().all(|&b| b == NEUTRAL_CHROMA));
    }

    #[test]
    fn dark_but_live_chroma_is_not_rejected() {
        let y = y_plane(1);
        // Mostly zero, one probe point non-zero: must be accepted.
        let mut u = vec![0u8; UV_W * UV_H];
        u[UV_W / 2] = 3;
        let v = vec![7u8; UV_W * UV_H];
        let out = packed(
            ChromaLayout::Planar420,
            &y,
            Some((&u, UV_W, Some((&v, UV_W)))),
        );
        assert_eq!(out[W * H + UV_W / 2], 3);
    }

    #[test]
    fn waiting_session_drops_p_frames() {
        let mut session = ViewerSession::new();
        assert_eq!(session.state(), SyncState::Waiting);

        // A P-frame with an arbitrary payload is dropped unseen; the
        // codec is never touched so no ffmpeg runtime is needed.
        let wire = wire::encode_video(false, (0.5, 0.5), &[0, 0, 0, 1, 0x41]);
        let out = session.handle_message(&wire).unwrap();
        assert_eq!(out, None);
        assert_eq!(session.state(), SyncState::Waiting);
    }

    #[test]
    fn jpeg_keyframe_moves_session_to_streaming() {
        // Encode a tiny JPEG via the image crate.
        let mut jpeg = Vec::new();
        let img = image::RgbImage::from_pixel(4, 4, image::Rgb([10, 20, 30]));
        image::codecs::jpeg::JpegEncoder::new(&mut jpeg)
            .encode(
                img.as_raw(),
                4,
                4,
                image::ExtendedColorType::Rgb8,
            )
            .unwrap();

        let mut session = ViewerSession::new();
        let wire = wire::encode_video(true, (0.1, 0.2), &jpeg);
        let out = session.handle_message(&wire).unwrap();

        match out {
            Some(ViewerEvent::Frame {
                image: DecodedImage::Rgba { width, height, .. },
                cursor,
            }) => {
                assert_eq!((width, height), (4, 4));
                assert_eq!(cursor, (0.1, 0.2));
            }
            other => panic!("wrong event: {other:?}"),
        }
        assert_eq!(session.state(), SyncState::Streaming);

        // Reset re-arms the gate.
        session.reset();
        assert_eq!(session.state(), SyncState::Waiting);
    }

    #[test]
    fn legacy_jpeg_frames_decode() {
        let mut jpeg = Vec::new();
        let img = image::RgbImage::from_pixel(2, 2, image::Rgb([1, 2, 3]));
        image::codecs::jpeg::JpegEncoder::new(&mut jpeg)
            .encode(img.as_raw(), 2, 2, image::ExtendedColorType::Rgb8)
            .unwrap();

        let mut wire_bytes = Vec::new();
        wire_bytes.extend_from_slice(&0.5f32.to_le_bytes());
        wire_bytes.extend_from_slice(&0.5f32.to_le_bytes());
        wire_bytes.extend_from_slice(&jpeg);

        let mut session = ViewerSession::new();
        let out = session.handle_message(&wire_bytes).unwrap();
        assert!(matches!(out, Some(ViewerEvent::Frame { .. })));
    }

    #[test]
    fn audio_messages_decode_standalone() {
        let mut session = ViewerSession::new();
        let wire_bytes = wire::encode_audio(&[0, 0, 0, 0, 0, 0, 0x07]);
        let out = session.handle_message(&wire_bytes).unwrap();

        match out {
            Some(ViewerEvent::Audio { samples }) => {
                assert_eq!(samples.len(), 1);
                assert_eq!(samples[0].0, 0.0);
                assert!((samples[0].1 - 11.0 / 32768.0).abs() < 1e-9);
            }
            other => panic!("wrong event: {other:?}"),
        }
    }

    #[test]
    fn cursor_only_updates_without_pixels() {
        let mut session = ViewerSession::new();
        let wire_bytes = wire::encode_cursor((0.9, 0.1));
        let out = session.handle_message(&wire_bytes).unwrap();
        assert_eq!(
            out,
            Some(ViewerEvent::CursorMoved {
                cursor: (0.9, 0.1)
            })
        );
    }
}
