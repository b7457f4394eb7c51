//! Audio stage: loopback capture → 48 kHz stereo s16 → stateless
//! IMA-ADPCM packets.
//!
//! The loopback source is opened at whatever format the OS provides;
//! samples are resampled and reshaped here. A missing or unusable
//! playback device disables the stage for the process (logged once);
//! video is never affected.
//!
//! `cpal::Stream` is not `Send`, so the whole stage runs on a
//! dedicated thread that owns the stream, the resampler, and the
//! encoder state. Packets leave through the bounded audio queue, whose
//! non-blocking publish keeps the audio thread real-time safe.

use std::sync::Arc;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, SizedSample};
use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::adpcm::AdpcmEncoder;
use crate::config::{StreamConfig, AUDIO_CHUNK_SAMPLES};
use crate::error::MiraError;
use crate::stream::queue::FrameQueue;
use crate::stream::types::AudioPacket;

/// Fixed rubato input block (frames per channel).
const RESAMPLER_BLOCK: usize = 1024;

// ── AudioStage ───────────────────────────────────────────────────

/// Handle to the audio worker thread.
pub struct AudioStage {
    handle: Option<std::thread::JoinHandle<()>>,
}

impl AudioStage {
    /// Spawn the audio worker. Returns an error only when the thread
    /// itself cannot start; device failures are reported from inside
    /// the worker and simply disable audio.
    pub fn spawn(
        config: StreamConfig,
        queue: Arc<FrameQueue<AudioPacket>>,
        cancel: CancellationToken,
    ) -> Result<Self, MiraError> {
        let handle = std::thread::Builder::new()
            .name("mira-audio".into())
            .spawn(move || {
                if let Err(e) = run_worker(&config, &queue, &cancel) {
                    warn!("audio disabled: {e}");
                }
                queue.close();
            })
            .map_err(|e| MiraError::AudioBackend(format!("spawn audio thread: {e}")))?;

        Ok(Self {
            handle: Some(handle),
        })
    }

    /// Wait for the worker to finish (after cancellation).
    pub fn join(mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Open the loopback stream and pump samples until cancelled.
fn run_worker(
    config: &StreamConfig,
    queue: &FrameQueue<AudioPacket>,
    cancel: &CancellationToken,
) -> Result<(), MiraError> {
    let host = cpal::default_host();

    // System playback mirroring: WASAPI exposes loopback by building
    // an *input* stream on the output device. Hosts without that
    // (e.g. ALSA monitors) surface the mirror as an input device.
    let device = host
        .default_output_device()
        .or_else(|| host.default_input_device())
        .ok_or_else(|| MiraError::AudioBackend("no playback device".into()))?;

    let device_config = device
        .default_input_config()
        .or_else(|_| device.default_output_config())
        .map_err(|e| MiraError::AudioBackend(format!("device config: {e}")))?;

    let in_rate = device_config.sample_rate().0;
    let in_channels = device_config.channels();
    info!(
        device = device.name().unwrap_or_else(|_| "<unnamed>".into()),
        rate = in_rate,
        channels = in_channels,
        "audio loopback opened"
    );

    let (tx, rx) = std::sync::mpsc::sync_channel::<Vec<f32>>(64);
    let stream = build_stream(&device, &device_config, in_channels, tx)?;
    stream
        .play()
        .map_err(|e| MiraError::AudioBackend(format!("stream start: {e}")))?;

    let mut pipeline = AudioPipeline::new(in_rate, config.audio_sample_rate)?;

    while !cancel.is_cancelled() {
        match rx.recv_timeout(Duration::from_millis(100)) {
            Ok(stereo) => {
                for packet in pipeline.feed(&stereo)? {
                    // Overflow evicts the oldest packet; each one is
                    // self-decodable so the stream just skips ahead.
                    let _ = queue.push(AudioPacket { data: packet });
                }
            }
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => continue,
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                return Err(MiraError::AudioBackend("audio callback stopped".into()));
            }
        }
    }
    Ok(())
}

/// Build the capture stream for whatever sample format the device
/// reports, normalizing the callback payload to interleaved stereo f32.
fn build_stream(
    device: &cpal::Device,
    device_config: &cpal::SupportedStreamConfig,
    channels: u16,
    tx: std::sync::mpsc::SyncSender<Vec<f32>>,
) -> Result<cpal::Stream, MiraError> {
    let stream_config: cpal::StreamConfig = device_config.config();
    match device_config.sample_format() {
        cpal::SampleFormat::F32 => typed_stream::<f32>(device, &stream_config, channels, tx),
        cpal::SampleFormat::I16 => typed_stream::<i16>(device, &stream_config, channels, tx),
        cpal::SampleFormat::U16 => typed_stream::<u16>(device, &stream_config, channels, tx),
        other => Err(MiraError::AudioBackend(format!(
            "unsupported sample format {other:?}"
        ))),
    }
}

fn typed_stream<T>(
    device: &cpal::Device,
    stream_config: &cpal::StreamConfig,
    channels: u16,
    tx: std::sync::mpsc::SyncSender<Vec<f32>>,
) -> Result<cpal::Stream, MiraError>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let stream = device
        .build_input_stream(
            stream_config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                let stereo = to_stereo_f32(data, channels);
                // try_send: a congested consumer drops the oldest audio
                // window rather than blocking the device callback.
                let _ = tx.try_send(stereo);
            },
            |e| warn!("audio stream error: {e}"),
            None,
        )
        .map_err(|e| MiraError::AudioBackend(format!("build stream: {e}")))?;
    Ok(stream)
}

/// Reshape an interleaved callback buffer to stereo f32: mono is
/// duplicated, extra channels beyond the first two are discarded.
fn to_stereo_f32<T>(data: &[T], channels: u16) -> Vec<f32>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let ch = channels.max(1) as usize;
    let frames = data.len() / ch;
    let mut out = Vec::with_capacity(frames * 2);
    for frame in data.chunks_exact(ch) {
        let left = f32::from_sample(frame[0]);
        let right = if ch > 1 {
            f32::from_sample(frame[1])
        } else {
            left
        };
        out.push(left);
        out.push(right);
    }
    out
}

// ── AudioPipeline ────────────────────────────────────────────────

/// Resampler + chunker + ADPCM encoder, owned by the audio worker.
///
/// Kept separate from the device plumbing so it can run in tests with
/// synthetic input.
pub struct AudioPipeline {
    resampler: Option<SincFixedIn<f32>>,
    /// Planar staging for the resampler input.
    pending: [Vec<f32>; 2],
    /// Interleaved s16 staging for the chunker.
    pcm: Vec<i16>,
    encoder: AdpcmEncoder,
    chunk_len: usize,
}

impl AudioPipeline {
    pub fn new(in_rate: u32, out_rate: u32) -> Result<Self, MiraError> {
        let resampler = if in_rate == out_rate {
            None
        } else {
            let params = SincInterpolationParameters {
                sinc_len: 128,
                f_cutoff: 0.95,
                interpolation: SincInterpolationType::Linear,
                oversampling_factor: 128,
                window: WindowFunction::BlackmanHarris2,
            };
            Some(
                SincFixedIn::<f32>::new(
                    out_rate as f64 / in_rate as f64,
                    2.0,
                    params,
                    RESAMPLER_BLOCK,
                    2,
                )
                .map_err(|e| MiraError::AudioBackend(format!("resampler: {e}")))?,
            )
        };

        Ok(Self {
            resampler,
            pending: [Vec::new(), Vec::new()],
            pcm: Vec::new(),
            encoder: AdpcmEncoder::new(),
            chunk_len: AUDIO_CHUNK_SAMPLES * 2,
        })
    }

    /// Feed interleaved stereo f32; returns zero or more finished
    /// ADPCM packets.
    pub fn feed(&mut self, stereo: &[f32]) -> Result<Vec<Vec<u8>>, MiraError> {
        match &mut self.resampler {
            None => {
                for pair in stereo.chunks_exact(2) {
                    self.pcm.push(f32_to_i16(pair[0]));
                    self.pcm.push(f32_to_i16(pair[1]));
                }
            }
            Some(resampler) => {
                for pair in stereo.chunks_exact(2) {
                    self.pending[0].push(pair[0]);
                    self.pending[1].push(pair[1]);
                }
                while self.pending[0].len() >= RESAMPLER_BLOCK {
                    let block: Vec<Vec<f32>> = self
                        .pending
                        .iter_mut()
                        .map(|ch| ch.drain(..RESAMPLER_BLOCK).collect())
                        .collect();
                    let out = resampler
                        .process(&block, None)
                        .map_err(|e| MiraError::AudioBackend(format!("resample: {e}")))?;
                    for i in 0..out[0].len() {
                        self.pcm.push(f32_to_i16(out[0][i]));
                        self.pcm.push(f32_to_i16(out[1][i]));
                    }
                }
            }
        }

        let mut packets = Vec::new();
        while self.pcm.len() >= self.chunk_len {
            let chunk: Vec<i16> = self.pcm.drain(..self.chunk_len).collect();
            packets.push(self.encoder.encode_packet(&chunk)?);
        }
        Ok(packets)
    }
}

fn f32_to_i16(s: f32) -> i16 {
    (s.clamp(-1.0, 1.0) * 32767.0) as i16
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adpcm::{AdpcmDecoder, PACKET_HEADER_LEN};

    #[test]
    fn passthrough_chunks_at_packet_size() {
        let mut pipeline = AudioPipeline::new(48_000, 48_000).unwrap();

        // 1.5 packets of input: one packet out, the rest staged.
        let frames = AUDIO_CHUNK_SAMPLES + AUDIO_CHUNK_SAMPLES / 2;
        let stereo = vec![0.25f32; frames * 2];
        let packets = pipeline.feed(&stereo).unwrap();

        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].len(), PACKET_HEADER_LEN + AUDIO_CHUNK_SAMPLES);

        // The second half-packet completes on the next feed.
        let more = vec![0.25f32; AUDIO_CHUNK_SAMPLES];
        let packets = pipeline.feed(&more).unwrap();
        assert_eq!(packets.len(), 1);
    }

    #[test]
    fn packets_decode_standalone() {
        let mut pipeline = AudioPipeline::new(48_000, 48_000).unwrap();
        let stereo: Vec<f32> = (0..AUDIO_CHUNK_SAMPLES * 4)
            .flat_map(|i| {
                let s = (i as f32 * 0.01).sin() * 0.5;
                [s, -s]
            })
            .collect();

        let packets = pipeline.feed(&stereo).unwrap();
        assert_eq!(packets.len(), 4);

        let dec = AdpcmDecoder::new();
        for packet in &packets {
            let pcm = dec.decode_packet(packet).unwrap();
            assert_eq!(pcm.len(), AUDIO_CHUNK_SAMPLES * 2);
        }
    }

    #[test]
    fn resampler_converts_44100_to_48000() {
        let mut pipeline = AudioPipeline::new(44_100, 48_000).unwrap();

        // Two seconds of 44.1 kHz stereo silence in one go.
        let stereo = vec![0.0f32; 44_100 * 2 * 2];
        let packets = pipeline.feed(&stereo).unwrap();

        // Expect roughly 2 s × 50 packets/s, allowing for block and
        // chunk staging at both ends.
        assert!(
            (90..=100).contains(&packets.len()),
            "got {} packets",
            packets.len()
        );
    }

    #[test]
    fn mono_duplicates_into_both_channels() {
        let data = [0.5f32, -0.5];
        let stereo = to_stereo_f32(&data, 1);
        assert_eq!(stereo, vec![0.5, 0.5, -0.5, -0.5]);
    }

    #[test]
    fn surround_keeps_front_pair() {
        let data = [0.1f32, 0.2, 0.9, 0.9, 0.3, 0.4, 0.9, 0.9];
        let stereo = to_stereo_f32(&data, 4);
        assert_eq!(stereo, vec![0.1, 0.2, 0.3, 0.4]);
    }

    #[test]
    fn f32_clamps_to_i16_range() {
        assert_eq!(f32_to_i16(2.0), 32767);
        assert_eq!(f32_to_i16(-2.0), -32767);
        assert_eq!(f32_to_i16(0.0), 0);
    }
}
