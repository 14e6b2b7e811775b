// crates/veilcast-core/src/transcribe.rs

use crate::error::Result;

/// One utterance handed from the VAD segmenter to the ASR worker:
/// mono f32 PCM at the VAD sampling rate, with its stream-time bounds.
#[derive(Debug, Clone)]
pub struct TranscriptionSegment {
    pub audio:      Vec<f32>,
    pub start_time: f64,
    pub end_time:   f64,
}

impl TranscriptionSegment {
    pub fn duration(&self) -> f64 {
        self.end_time - self.start_time
    }
}

/// Timestamped text produced for one recognized span. Times are absolute
/// stream time (utterance start + model-relative offsets).
#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptionEvent {
    pub text:       String,
    pub start_time: f64,
    pub end_time:   f64,
}

/// Speech-to-text backend. One recognized span per returned event, relative
/// to the start of the supplied audio; the caller re-bases timestamps.
pub trait Transcriber: Send {
    fn transcribe(&mut self, audio: &[f32]) -> Result<Vec<TranscriptionEvent>>;
}
