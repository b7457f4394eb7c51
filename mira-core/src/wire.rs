//! Binary wire framing for media messages.
//!
//! Every binary WebSocket message starts with a type byte, so the parser
//! can skip the 8-byte cursor header when the payload is audio:
//!
//! ```text
//! offset 0: u8      frame type (0 = P, 1 = I, 2 = cursor-only, 3 = audio)
//! offset 1: f32 LE  cursor u   (types 0, 1, 2)
//! offset 5: f32 LE  cursor v   (types 0, 1, 2)
//! offset 9: bytes   payload    (H.264 NAL units or JPEG)
//! ```
//!
//! Audio messages are the type byte followed directly by an ADPCM packet
//! (see [`crate::adpcm`]).
//!
//! Early servers sent `cursor_u, cursor_v, JPEG` with no leading type
//! byte; the parser still accepts that shape for backward compatibility.

use crate::adpcm::PACKET_HEADER_LEN;
use crate::error::MiraError;

/// Byte offset where a video payload begins.
pub const VIDEO_HEADER_LEN: usize = 9;
/// Legacy frames: two cursor floats, then JPEG.
const LEGACY_HEADER_LEN: usize = 8;
/// JPEG start-of-image marker.
const JPEG_SOI: [u8; 2] = [0xFF, 0xD8];

// ── FrameType ────────────────────────────────────────────────────

/// Discriminant carried in the first byte of every media message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// Predicted frame; needs prior reference frames to decode.
    Delta = 0,
    /// Self-decodable keyframe (SPS/PPS in-band, or a whole JPEG).
    Key = 1,
    /// Cursor update with no video payload.
    CursorOnly = 2,
    /// IMA-ADPCM audio packet.
    Audio = 3,
}

impl FrameType {
    fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Delta),
            1 => Some(Self::Key),
            2 => Some(Self::CursorOnly),
            3 => Some(Self::Audio),
            _ => None,
        }
    }
}

// ── Encoding ─────────────────────────────────────────────────────

/// Build a video wire frame in a single allocation.
pub fn encode_video(is_keyframe: bool, cursor: (f32, f32), payload: &[u8]) -> Vec<u8> {
    let ty = if is_keyframe {
        FrameType::Key
    } else {
        FrameType::Delta
    };
    let mut buf = Vec::with_capacity(VIDEO_HEADER_LEN + payload.len());
    buf.push(ty as u8);
    buf.extend_from_slice(&cursor.0.to_le_bytes());
    buf.extend_from_slice(&cursor.1.to_le_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Build a cursor-only wire frame.
pub fn encode_cursor(cursor: (f32, f32)) -> Vec<u8> {
    let mut buf = Vec::with_capacity(VIDEO_HEADER_LEN);
    buf.push(FrameType::CursorOnly as u8);
    buf.extend_from_slice(&cursor.0.to_le_bytes());
    buf.extend_from_slice(&cursor.1.to_le_bytes());
    buf
}

/// Build an audio wire frame around an ADPCM packet.
pub fn encode_audio(packet: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(1 + packet.len());
    buf.push(FrameType::Audio as u8);
    buf.extend_from_slice(packet);
    buf
}

// ── Parsing ──────────────────────────────────────────────────────

/// A parsed inbound media message (viewer side).
#[derive(Debug, Clone, PartialEq)]
pub enum WireFrame<'a> {
    /// Compressed video plus the cursor position at capture time.
    Video {
        is_keyframe: bool,
        cursor: (f32, f32),
        payload: &'a [u8],
    },
    /// Cursor moved; no pixels attached.
    CursorOnly { cursor: (f32, f32) },
    /// One self-decodable ADPCM audio packet.
    Audio { packet: &'a [u8] },
    /// Pre-type-byte frame: cursor header followed by a JPEG image.
    LegacyJpeg {
        cursor: (f32, f32),
        payload: &'a [u8],
    },
}

/// Parse one binary message.
///
/// Legacy detection: the first byte is not a recognized type byte (or
/// the message is too short for the typed layout) and the bytes after
/// the 8-byte cursor header begin with a JPEG start-of-image marker.
pub fn parse(data: &[u8]) -> Result<WireFrame<'_>, MiraError> {
    if data.is_empty() {
        return Err(MiraError::InvalidFrame("empty media message"));
    }

    match FrameType::from_byte(data[0]) {
        Some(FrameType::Audio) => {
            if data.len() < 1 + PACKET_HEADER_LEN {
                return Err(MiraError::InvalidFrame("audio frame shorter than header"));
            }
            return Ok(WireFrame::Audio { packet: &data[1..] });
        }
        Some(ty) if data.len() >= VIDEO_HEADER_LEN => {
            let cursor = read_cursor(&data[1..VIDEO_HEADER_LEN]);
            return match ty {
                FrameType::CursorOnly => Ok(WireFrame::CursorOnly { cursor }),
                FrameType::Delta | FrameType::Key => {
                    let payload = &data[VIDEO_HEADER_LEN..];
                    if payload.is_empty() {
                        return Err(MiraError::InvalidFrame("video frame without payload"));
                    }
                    Ok(WireFrame::Video {
                        is_keyframe: ty == FrameType::Key,
                        cursor,
                        payload,
                    })
                }
                FrameType::Audio => unreachable!(),
            };
        }
        _ => {}
    }

    // Legacy shape: 8-byte cursor header, then JPEG.
    if data.len() > LEGACY_HEADER_LEN + 1
        && data[LEGACY_HEADER_LEN..LEGACY_HEADER_LEN + 2] == JPEG_SOI
    {
        return Ok(WireFrame::LegacyJpeg {
            cursor: read_cursor(&data[..LEGACY_HEADER_LEN]),
            payload: &data[LEGACY_HEADER_LEN..],
        });
    }

    Err(MiraError::InvalidFrame("unrecognized media frame layout"))
}

fn read_cursor(bytes: &[u8]) -> (f32, f32) {
    let u = f32::from_le_bytes(bytes[0..4].try_into().unwrap());
    let v = f32::from_le_bytes(bytes[4..8].try_into().unwrap());
    (u, v)
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn video_roundtrip() {
        let nal = [0u8, 0, 0, 1, 0x67, 0x42];
        let wire = encode_video(true, (0.25, 0.75), &nal);
        assert_eq!(wire[0], 1);
        assert_eq!(wire.len(), VIDEO_HEADER_LEN + nal.len());

        match parse(&wire).unwrap() {
            WireFrame::Video {
                is_keyframe,
                cursor,
                payload,
            } => {
                assert!(is_keyframe);
                assert_eq!(cursor, (0.25, 0.75));
                assert_eq!(payload, nal);
            }
            other => panic!("wrong parse: {other:?}"),
        }
    }

    #[test]
    fn delta_frame_type_byte_is_zero() {
        let wire = encode_video(false, (0.0, 0.0), &[0xAA]);
        assert_eq!(wire[0], 0);
        assert!(matches!(
            parse(&wire).unwrap(),
            WireFrame::Video {
                is_keyframe: false,
                ..
            }
        ));
    }

    #[test]
    fn cursor_only_roundtrip() {
        let wire = encode_cursor((0.5, 0.5));
        assert_eq!(wire.len(), VIDEO_HEADER_LEN);
        match parse(&wire).unwrap() {
            WireFrame::CursorOnly { cursor } => assert_eq!(cursor, (0.5, 0.5)),
            other => panic!("wrong parse: {other:?}"),
        }
    }

    #[test]
    fn audio_skips_cursor_header() {
        let packet = [0u8, 0, 0, 0, 0, 0, 0x07, 0x89];
        let wire = encode_audio(&packet);
        assert_eq!(wire[0], 3);
        match parse(&wire).unwrap() {
            WireFrame::Audio { packet: p } => assert_eq!(p, packet),
            other => panic!("wrong parse: {other:?}"),
        }
    }

    #[test]
    fn legacy_jpeg_detected() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&0.5f32.to_le_bytes());
        wire.extend_from_slice(&0.25f32.to_le_bytes());
        wire.extend_from_slice(&[0xFF, 0xD8, 0xFF, 0xE0, 0x00]);

        match parse(&wire).unwrap() {
            WireFrame::LegacyJpeg { cursor, payload } => {
                assert_eq!(cursor, (0.5, 0.25));
                assert_eq!(payload[0], 0xFF);
                assert_eq!(payload[1], 0xD8);
            }
            other => panic!("wrong parse: {other:?}"),
        }
    }

    #[test]
    fn legacy_requires_jpeg_marker() {
        // 8-byte header followed by non-JPEG bytes with an out-of-range
        // type byte: rejected instead of misread as legacy.
        let mut wire = vec![0x09u8];
        wire.extend_from_slice(&[0u8; 12]);
        assert!(parse(&wire).is_err());
    }

    #[test]
    fn empty_and_truncated_rejected() {
        assert!(parse(&[]).is_err());
        assert!(parse(&[1, 0, 0]).is_err());
        assert!(parse(&encode_video(true, (0.0, 0.0), &[])[..9]).is_err());
        // Audio with a truncated state header.
        assert!(parse(&[3, 0, 0, 0]).is_err());
    }
}
