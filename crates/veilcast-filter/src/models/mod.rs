// crates/veilcast-filter/src/models/mod.rs
//
// ONNX / whisper adapters behind the core traits. Each owner gets its own
// instance; the sessions are never shared (the consent manager holds a
// second detector instance for exactly this reason).

pub mod sface;
pub mod silero;
pub mod whisper;
pub mod yunet;

use std::path::Path;

use veilcast_core::config::FilterConfig;
use veilcast_core::detect::Detector;
use veilcast_core::error::{FilterError, Result};
use veilcast_core::recognize::Recognizer;
use veilcast_core::transcribe::Transcriber;
use veilcast_core::vad::SpeechProbability;

fn ensure_exists(path: &Path) -> Result<()> {
    if path.is_file() {
        Ok(())
    } else {
        Err(FilterError::ModelMissing(path.to_path_buf()))
    }
}

pub fn load_detector(config: &FilterConfig) -> Result<Box<dyn Detector>> {
    ensure_exists(&config.models.yunet)?;
    Ok(Box::new(yunet::YuNetDetector::new(&config.models.yunet, config.face.clone())?))
}

pub fn load_recognizer(config: &FilterConfig) -> Result<Box<dyn Recognizer>> {
    ensure_exists(&config.models.sface)?;
    Ok(Box::new(sface::SFaceRecognizer::new(&config.models.sface)?))
}

pub fn load_vad(config: &FilterConfig) -> Result<Box<dyn SpeechProbability>> {
    ensure_exists(&config.models.silero)?;
    Ok(Box::new(silero::SileroVad::new(&config.models.silero)?))
}

pub fn load_transcriber(config: &FilterConfig) -> Result<Box<dyn Transcriber>> {
    ensure_exists(&config.transcription.whisper_model)?;
    Ok(Box::new(whisper::WhisperTranscriber::new(
        &config.transcription.whisper_model,
        config.transcription.beam_size,
        &config.transcription.language,
        config.transcription.cpu_threads,
    )?))
}
