// crates/veilcast-filter/src/models/whisper.rs
//
// Speech-to-text over whisper-rs (GGML whisper models). One WhisperState is
// reused across utterances; segment timestamps come back in centiseconds
// relative to the supplied audio.

use std::path::Path;

use whisper_rs::{FullParams, SamplingStrategy, WhisperContext, WhisperContextParameters, WhisperState};

use veilcast_core::error::{FilterError, Result};
use veilcast_core::transcribe::{Transcriber, TranscriptionEvent};

pub struct WhisperTranscriber {
    // The context must outlive the state; both live here.
    _context:  WhisperContext,
    state:     WhisperState,
    beam_size: usize,
    language:  String,
    threads:   usize,
}

impl WhisperTranscriber {
    pub fn new(model_path: &Path, beam_size: usize, language: &str, threads: usize) -> Result<Self> {
        let path = model_path
            .to_str()
            .ok_or_else(|| FilterError::Config("non-UTF8 whisper model path".into()))?;
        let context = WhisperContext::new_with_params(path, WhisperContextParameters::default())
            .map_err(|e| FilterError::Config(format!("load whisper model: {e}")))?;
        let state = context
            .create_state()
            .map_err(|e| FilterError::Config(format!("whisper state: {e}")))?;
        Ok(Self {
            _context: context,
            state,
            beam_size,
            language: language.to_string(),
            threads,
        })
    }
}

impl Transcriber for WhisperTranscriber {
    fn transcribe(&mut self, audio: &[f32]) -> Result<Vec<TranscriptionEvent>> {
        let mut params = FullParams::new(SamplingStrategy::BeamSearch {
            beam_size: self.beam_size as i32,
            patience: -1.0,
        });
        params.set_language(Some(&self.language));
        params.set_n_threads(self.threads as i32);
        params.set_print_special(false);
        params.set_print_progress(false);
        params.set_print_realtime(false);
        params.set_print_timestamps(false);

        self.state
            .full(params, audio)
            .map_err(|e| FilterError::Transcribe(e.to_string()))?;

        let segments = self
            .state
            .full_n_segments()
            .map_err(|e| FilterError::Transcribe(e.to_string()))?;

        let mut events = Vec::with_capacity(segments as usize);
        for i in 0..segments {
            let text = self
                .state
                .full_get_segment_text(i)
                .map_err(|e| FilterError::Transcribe(e.to_string()))?;
            let t0 = self
                .state
                .full_get_segment_t0(i)
                .map_err(|e| FilterError::Transcribe(e.to_string()))?;
            let t1 = self
                .state
                .full_get_segment_t1(i)
                .map_err(|e| FilterError::Transcribe(e.to_string()))?;
            events.push(TranscriptionEvent {
                text,
                // Centiseconds → seconds.
                start_time: t0 as f64 / 100.0,
                end_time:   t1 as f64 / 100.0,
            });
        }
        Ok(events)
    }
}
