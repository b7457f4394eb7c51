//! mira-core — low-latency desktop streaming pipeline.
//!
//! The server side is a three-stage capture → encode → fan-out engine
//! with a parallel audio sub-pipeline: the primary display is captured
//! at a fixed cadence, compressed to H.264 (JPEG when no encoder is
//! available), multiplexed with loopback audio and the cursor
//! position, and pushed to attached viewers over WebSocket. Viewers
//! send pointer events back, which are injected as synthetic mouse
//! input.
//!
//! The viewer-side decoder lives in [`viewer`]; it shares the wire
//! contract and the keyframe state machine.

pub mod adpcm;
pub mod config;
pub mod control;
pub mod error;
pub mod inject;
pub mod registry;
pub mod server;
pub mod stream;
pub mod viewer;
pub mod wire;

pub use config::StreamConfig;
pub use control::ControlMessage;
pub use error::MiraError;
pub use registry::{ClientRegistry, ClientSession};
pub use server::Server;
pub use stream::encode::KeyframeSignal;
pub use stream::Pipeline;
pub use viewer::ViewerSession;
pub use wire::{FrameType, WireFrame};
