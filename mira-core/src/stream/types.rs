//! Internal frame representations passed between pipeline stages.
//!
//! These move through the bounded queues by value; each stage owns the
//! frame it holds and nothing is shared. The serialisable *wire* shapes
//! live in [`crate::wire`].

// ── CapturedFrame ────────────────────────────────────────────────

/// A raw display snapshot produced by the capture stage.
///
/// The pixel buffer is tightly packed BGRA (`width * height * 4` bytes);
/// GPU row padding is stripped during capture. Each frame gets a fresh
/// allocation because its lifetime extends past the next tick while the
/// encoder works on it.
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    /// Tightly packed BGRA pixels.
    pub data: Vec<u8>,
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Cursor position normalized to `[0, 1]` at capture time.
    pub cursor: (f32, f32),
    /// Monotonically increasing capture sequence number.
    pub sequence: u64,
    /// True when the pixels are a replay of the previous capture
    /// (display idle or acquire timeout).
    pub duplicate: bool,
}

impl CapturedFrame {
    /// Expected buffer length for the frame's dimensions.
    pub fn expected_len(&self) -> usize {
        self.width as usize * self.height as usize * 4
    }
}

// ── EncodedVideoFrame ────────────────────────────────────────────

/// A compressed frame ready for fan-out.
///
/// When `is_keyframe` is true the bytes are self-sufficient for a fresh
/// decoder: SPS/PPS in-band for H.264, or a complete JPEG image for the
/// fallback path.
#[derive(Debug, Clone)]
pub struct EncodedVideoFrame {
    /// Codec output bytes (Annex-B NAL units or JPEG).
    pub data: Vec<u8>,
    /// Cursor position inherited from the source [`CapturedFrame`].
    pub cursor: (f32, f32),
    /// Whatever the codec actually produced, not what was requested.
    pub is_keyframe: bool,
    /// Sequence number inherited from the source [`CapturedFrame`];
    /// gaps are preserved when the encoder holds or drops frames.
    pub sequence: u64,
}

// ── AudioPacket ──────────────────────────────────────────────────

/// One self-decodable ADPCM packet (see [`crate::adpcm`]).
#[derive(Debug, Clone)]
pub struct AudioPacket {
    /// 6-byte state header followed by nibble-packed samples.
    pub data: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expected_len_matches_bgra() {
        let frame = CapturedFrame {
            data: vec![0; 16],
            width: 2,
            height: 2,
            cursor: (0.0, 0.0),
            sequence: 0,
            duplicate: false,
        };
        assert_eq!(frame.expected_len(), 16);
    }
}
