// crates/veilcast-core/src/lib.rs
//
// Plain data and pure logic shared by veilcast-media and veilcast-filter.
// No FFmpeg, no ONNX: queues, state, consent records, the VAD segmenter,
// BGR pixels, and the model-facing traits.

pub mod blur;
pub mod config;
pub mod consent;
pub mod detect;
pub mod error;
pub mod queue;
pub mod recognize;
pub mod state;
pub mod transcribe;
pub mod vad;

pub use blur::BgrImage;
pub use error::FilterError;
pub use queue::BoundedQueue;
pub use state::{ConnectionState, Shutdown, WorkerRegistry, WorkerState};
