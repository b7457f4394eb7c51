//! Viewer-side decoding: wire parsing, the keyframe state machine,
//! H.264 → packed-YUV/RGBA conversion, and audio unpacking.
//!
//! This mirrors the server's wire contract; the 3D presentation layer
//! above it only ever sees [`decode::ViewerEvent`]s.

pub mod decode;

pub use decode::{DecodedImage, SyncState, ViewerEvent, ViewerSession};
