// crates/veilcast-core/src/error.rs

use std::path::PathBuf;

use thiserror::Error;

/// Error kinds for the filter pipeline. Each variant recovers at a different
/// level: Config aborts startup, Connect retries silently, Stream ends the
/// session and reconnects, ConsentLoad skips the file, Transcribe skips the
/// utterance.
#[derive(Debug, Error)]
pub enum FilterError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("model file missing: {0}")]
    ModelMissing(PathBuf),

    #[error("connect failed: {0}")]
    Connect(String),

    #[error("stream error: {0}")]
    Stream(String),

    #[error("detector error: {0}")]
    Detect(String),

    #[error("recognizer error: {0}")]
    Recognize(String),

    #[error("consent file rejected ({path}): {reason}")]
    ConsentLoad { path: PathBuf, reason: String },

    #[error("transcription failed: {0}")]
    Transcribe(String),
}

pub type Result<T> = std::result::Result<T, FilterError>;
