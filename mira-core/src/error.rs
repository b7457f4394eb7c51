//! Domain-specific error types for the mira pipeline.
//!
//! All fallible operations return `Result<T, MiraError>`.
//! Recoverable errors stay inside the stage that produced them; fatal
//! per-stage errors downgrade that stage to its fallback mode and never
//! tear down sibling stages.

use std::time::Duration;
use thiserror::Error;

/// The canonical error type for the mira streaming pipeline.
#[derive(Debug, Error)]
pub enum MiraError {
    // ── Capture ──────────────────────────────────────────────────
    /// The capture backend could not be initialised at all.
    #[error("capture init failed: {0}")]
    CaptureInit(String),

    /// A single frame acquisition failed (recoverable: replay the cache).
    #[error("capture error: {0}")]
    Capture(String),

    // ── Encoding ─────────────────────────────────────────────────
    /// No H.264 encoder could be opened; the stage falls back to JPEG.
    #[error("encoder init failed: {0}")]
    EncoderInit(String),

    /// The codec rejected a single frame (recoverable: drop that frame).
    #[error("encode error: {0}")]
    Encode(String),

    /// The viewer-side decoder failed on a frame.
    #[error("decode error: {0}")]
    Decode(String),

    // ── Audio ────────────────────────────────────────────────────
    /// The loopback device is absent or unusable; audio is disabled.
    #[error("audio backend error: {0}")]
    AudioBackend(String),

    // ── Transport ────────────────────────────────────────────────
    /// A WebSocket send or receive failed.
    #[error("transport error: {0}")]
    Transport(String),

    /// An internal pipeline channel was closed unexpectedly.
    #[error("channel closed")]
    ChannelClosed,

    /// An operation exceeded its deadline.
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    /// The registry refused a connection beyond the client cap.
    #[error("client capacity reached ({0} sessions)")]
    CapacityReached(usize),

    // ── Wire / control ───────────────────────────────────────────
    /// A binary media frame did not match any known wire layout.
    #[error("invalid wire frame: {0}")]
    InvalidFrame(&'static str),

    /// A control message failed to parse (dropped, never disconnects).
    #[error("invalid control message: {0}")]
    Json(#[from] serde_json::Error),

    // ── Plumbing ─────────────────────────────────────────────────
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Catch-all for errors that do not fit another variant.
    #[error("{0}")]
    Other(String),
}

impl From<String> for MiraError {
    fn from(s: String) -> Self {
        MiraError::Other(s)
    }
}

impl From<&str> for MiraError {
    fn from(s: &str) -> Self {
        MiraError::Other(s.to_string())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for MiraError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        MiraError::ChannelClosed
    }
}
