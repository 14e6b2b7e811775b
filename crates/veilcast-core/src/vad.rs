// crates/veilcast-core/src/vad.rs
//
// Two-threshold voice-activity segmentation.
//
// The segmenter consumes 16 kHz mono s16 samples, slices them into fixed
// chunks, asks the probability backend for a speech probability per chunk,
// and runs the SILENCE/SPEAKING machine:
//
//   SILENCE: p > start_speech_prob  → SPEAKING, remember the start time
//   SPEAKING: every chunk is buffered; p > keep_speech_prob resets the
//   silence run, otherwise the run grows by chunk_size samples and the
//   utterance is emitted once the run reaches stop_silence_samples
//   (inclusive boundary).
//
// Stream time advances by chunk_size / sampling_rate per chunk regardless of
// state, so utterance bounds are stream-relative even across long silence.

use crate::config::VadConfig;
use crate::error::Result;
use crate::transcribe::TranscriptionSegment;

/// Per-chunk speech probability backend (Silero in production, scripted
/// probabilities in tests).
pub trait SpeechProbability: Send {
    fn speech_prob(&mut self, chunk: &[f32], sampling_rate: u32) -> Result<f32>;
}

pub struct VadSegmenter {
    start_speech_prob:   f32,
    keep_speech_prob:    f32,
    stop_silence_samples: usize,
    min_segment_samples: usize,
    sampling_rate:       u32,
    chunk_size:          usize,

    /// Samples waiting to fill the next fixed-size chunk.
    pending:         Vec<i16>,
    /// The utterance being accumulated while SPEAKING.
    speech:          Vec<i16>,
    in_speech:       bool,
    silence_samples: usize,
    stream_time:     f64,
    speech_start:    f64,
}

impl VadSegmenter {
    pub fn new(config: &VadConfig) -> Self {
        Self {
            start_speech_prob:    config.start_speech_prob,
            keep_speech_prob:     config.keep_speech_prob,
            stop_silence_samples: config.stop_silence_samples(),
            min_segment_samples:  config.min_segment_samples(),
            sampling_rate:        config.sampling_rate,
            chunk_size:           config.chunk_size,
            pending:         Vec::new(),
            speech:          Vec::new(),
            in_speech:       false,
            silence_samples: 0,
            stream_time:     0.0,
            speech_start:    0.0,
        }
    }

    /// Seconds of audio consumed so far (whole chunks only).
    pub fn stream_time(&self) -> f64 {
        self.stream_time
    }

    pub fn in_speech(&self) -> bool {
        self.in_speech
    }

    /// Feed resampled samples; returns every utterance completed by them.
    pub fn push(
        &mut self,
        samples: &[i16],
        vad: &mut dyn SpeechProbability,
    ) -> Result<Vec<TranscriptionSegment>> {
        self.pending.extend_from_slice(samples);
        let mut utterances = Vec::new();

        while self.pending.len() >= self.chunk_size {
            let chunk: Vec<i16> = self.pending.drain(..self.chunk_size).collect();
            let chunk_float: Vec<f32> =
                chunk.iter().map(|&s| s as f32 / 32768.0).collect();
            let prob = vad.speech_prob(&chunk_float, self.sampling_rate)?;

            if self.in_speech {
                self.speech.extend_from_slice(&chunk);
                if prob > self.keep_speech_prob {
                    self.silence_samples = 0;
                } else {
                    self.silence_samples += self.chunk_size;
                    if self.silence_samples >= self.stop_silence_samples {
                        self.in_speech = false;
                        self.silence_samples = 0;
                        if let Some(utterance) = self.take_utterance() {
                            utterances.push(utterance);
                        }
                    }
                }
            } else if prob > self.start_speech_prob {
                self.in_speech = true;
                self.speech_start = self.stream_time;
                self.speech.extend_from_slice(&chunk);
                self.silence_samples = 0;
            }

            self.stream_time += self.chunk_size as f64 / self.sampling_rate as f64;
        }

        Ok(utterances)
    }

    /// Emit whatever speech is still buffered. Called at shutdown so a final
    /// utterance without trailing silence is not lost.
    pub fn flush(&mut self) -> Option<TranscriptionSegment> {
        self.in_speech = false;
        self.silence_samples = 0;
        self.take_utterance()
    }

    /// Convert the speech buffer into a segment if it clears the minimum
    /// length; short fragments are discarded either way.
    fn take_utterance(&mut self) -> Option<TranscriptionSegment> {
        let samples = std::mem::take(&mut self.speech);
        if samples.len() < self.min_segment_samples {
            if !samples.is_empty() {
                tracing::debug!(samples = samples.len(), "speech segment too short, skipping");
            }
            return None;
        }
        let audio: Vec<f32> = samples.iter().map(|&s| s as f32 / 32768.0).collect();
        Some(TranscriptionSegment {
            audio,
            start_time: self.speech_start,
            end_time:   self.stream_time,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Backend that replays a fixed probability script, then holds at the
    /// last value.
    struct Scripted {
        probs: Vec<f32>,
        next:  usize,
    }

    impl Scripted {
        fn new(probs: Vec<f32>) -> Self {
            Self { probs, next: 0 }
        }
    }

    impl SpeechProbability for Scripted {
        fn speech_prob(&mut self, _chunk: &[f32], _rate: u32) -> Result<f32> {
            let p = *self.probs.get(self.next).or(self.probs.last()).unwrap_or(&0.0);
            self.next += 1;
            Ok(p)
        }
    }

    /// Small numbers so tests stay readable: 100 Hz, 10-sample chunks,
    /// 30-sample (3 chunk) stop-silence, 20-sample minimum segment.
    fn config() -> VadConfig {
        VadConfig {
            start_speech_prob: 0.1,
            keep_speech_prob:  0.5,
            stop_silence_ms:   300,
            min_segment_ms:    200,
            sampling_rate:     100,
            chunk_size:        10,
        }
    }

    fn chunks(n: usize) -> Vec<i16> {
        vec![100; n * 10]
    }

    #[test]
    fn silence_only_emits_nothing_and_time_advances() {
        let mut segmenter = VadSegmenter::new(&config());
        let mut vad = Scripted::new(vec![0.0]);
        let out = segmenter.push(&chunks(5), &mut vad).unwrap();
        assert!(out.is_empty());
        assert!((segmenter.stream_time() - 0.5).abs() < 1e-9);
        assert!(!segmenter.in_speech());
    }

    #[test]
    fn utterance_emitted_after_inclusive_silence_boundary() {
        let mut segmenter = VadSegmenter::new(&config());
        // 4 speech chunks, then silence. stop_silence = 3 chunks; the third
        // silent chunk pushes silence_samples to exactly 30 → emit.
        let mut vad = Scripted::new(vec![0.9, 0.9, 0.9, 0.9, 0.0, 0.0, 0.0, 0.0]);
        let out = segmenter.push(&chunks(8), &mut vad).unwrap();
        assert_eq!(out.len(), 1);
        let utterance = &out[0];
        // Buffer holds the 4 speech chunks plus the 3 silent trailing chunks.
        assert_eq!(utterance.audio.len(), 70);
        assert!((utterance.start_time - 0.0).abs() < 1e-9);
        // Emitted while processing chunk index 6 (time not yet advanced past it).
        assert!((utterance.end_time - 0.6).abs() < 1e-9);
    }

    #[test]
    fn brief_dip_below_keep_does_not_end_utterance() {
        let mut segmenter = VadSegmenter::new(&config());
        // Dip for 2 chunks (under the 3-chunk threshold), then speech resumes.
        let mut vad =
            Scripted::new(vec![0.9, 0.3, 0.3, 0.9, 0.9, 0.0, 0.0, 0.0]);
        let out = segmenter.push(&chunks(8), &mut vad).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].audio.len(), 80);
    }

    #[test]
    fn short_segment_is_discarded() {
        // One speech chunk + 3 silent trailing chunks = 40 buffered samples;
        // a 500 ms minimum (50 samples) rejects it.
        let mut cfg = config();
        cfg.min_segment_ms = 500;
        let mut segmenter = VadSegmenter::new(&cfg);
        let mut vad = Scripted::new(vec![0.9, 0.0, 0.0, 0.0, 0.0]);
        let out = segmenter.push(&chunks(5), &mut vad).unwrap();
        assert!(out.is_empty(), "40-sample fragment under 50-sample minimum");
    }

    #[test]
    fn two_utterances_carry_stream_relative_times() {
        let mut segmenter = VadSegmenter::new(&config());
        // speech x3, silence x3 (emit), silence x4, speech x3, silence x3 (emit)
        let mut probs = vec![0.9, 0.9, 0.9];
        probs.extend([0.0; 7]);
        probs.extend([0.9, 0.9, 0.9]);
        probs.extend([0.0; 3]);
        let mut vad = Scripted::new(probs);
        let out = segmenter.push(&chunks(16), &mut vad).unwrap();
        assert_eq!(out.len(), 2);
        assert!((out[0].start_time - 0.0).abs() < 1e-9);
        assert!((out[1].start_time - 1.0).abs() < 1e-9);
        assert!(out[1].end_time > out[1].start_time);
    }

    #[test]
    fn flush_emits_residual_speech() {
        let mut segmenter = VadSegmenter::new(&config());
        let mut vad = Scripted::new(vec![0.9]);
        let out = segmenter.push(&chunks(4), &mut vad).unwrap();
        assert!(out.is_empty(), "no trailing silence yet");
        let residual = segmenter.flush().expect("buffered speech emitted on flush");
        assert_eq!(residual.audio.len(), 40);
        assert!(segmenter.flush().is_none(), "flush is idempotent");
    }

    #[test]
    fn partial_chunks_wait_for_completion() {
        let mut segmenter = VadSegmenter::new(&config());
        let mut vad = Scripted::new(vec![0.9]);
        // 7 samples: less than one chunk, so no VAD call and no time advance.
        let out = segmenter.push(&vec![5i16; 7], &mut vad).unwrap();
        assert!(out.is_empty());
        assert_eq!(segmenter.stream_time(), 0.0);
        // 3 more complete the chunk.
        segmenter.push(&vec![5i16; 3], &mut vad).unwrap();
        assert!((segmenter.stream_time() - 0.1).abs() < 1e-9);
        assert!(segmenter.in_speech());
    }

    #[test]
    fn samples_convert_to_unit_floats() {
        let mut segmenter = VadSegmenter::new(&config());
        let mut vad = Scripted::new(vec![0.9]);
        let samples = vec![16384i16; 40];
        segmenter.push(&samples, &mut vad).unwrap();
        let utterance = segmenter.flush().unwrap();
        assert!((utterance.audio[0] - 0.5).abs() < 1e-4);
    }
}
