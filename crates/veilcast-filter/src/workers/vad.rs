// crates/veilcast-filter/src/workers/vad.rs
//
// VAD worker: resamples the audio tap to 16 kHz mono s16, runs the
// two-threshold segmenter, and queues completed utterances for the ASR
// worker. On shutdown the residual speech buffer is flushed as a final
// utterance so speech in progress at exit still gets transcribed.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use veilcast_core::config::VadConfig;
use veilcast_core::queue::{BoundedQueue, GetOutcome, PutOutcome};
use veilcast_core::transcribe::TranscriptionSegment;
use veilcast_core::vad::{SpeechProbability, VadSegmenter};
use veilcast_media::messages::AudioMessage;
use veilcast_media::resample::PcmResampler;

use super::WorkerHandles;

pub const NAME: &str = "vad";

pub struct VadContext {
    pub handles:         WorkerHandles,
    pub vad_q:           Arc<BoundedQueue<AudioMessage>>,
    pub transcription_q: Arc<BoundedQueue<TranscriptionSegment>>,
    pub model:           Box<dyn SpeechProbability>,
    pub config:          VadConfig,
    pub op_timeout:      Duration,
}

pub fn run(mut ctx: VadContext) -> anyhow::Result<()> {
    info!(
        start_prob = ctx.config.start_speech_prob,
        keep_prob = ctx.config.keep_speech_prob,
        stop_silence_ms = ctx.config.stop_silence_ms,
        "vad worker ready"
    );

    let mut resampler = PcmResampler::mono(ctx.config.sampling_rate);
    let mut segmenter = VadSegmenter::new(&ctx.config);

    while !ctx.handles.shutdown.is_set() {
        ctx.handles.registry.heartbeat(NAME);

        let msg = match ctx.vad_q.get(ctx.op_timeout) {
            GetOutcome::Item(msg) => msg,
            GetOutcome::TimedOut => continue,
        };

        for frame in &msg.frames {
            let samples = match resampler.resample(frame) {
                Ok(samples) => samples,
                Err(e) => {
                    warn!(error = %e, "vad resample failed");
                    continue;
                }
            };
            match segmenter.push(&samples, ctx.model.as_mut()) {
                Ok(utterances) => {
                    for utterance in utterances {
                        enqueue(&ctx, utterance);
                    }
                }
                Err(e) => warn!(error = %e, "vad inference failed"),
            }
        }
    }

    // Final flush: whatever the segmenter still holds becomes the last
    // utterance of the stream.
    if let Some(utterance) = segmenter.flush() {
        debug!(
            start = utterance.start_time,
            end = utterance.end_time,
            "flushing residual speech buffer"
        );
        enqueue(&ctx, utterance);
    }

    info!("vad worker done");
    Ok(())
}

fn enqueue(ctx: &VadContext, utterance: TranscriptionSegment) {
    debug!(
        start = utterance.start_time,
        end = utterance.end_time,
        samples = utterance.audio.len(),
        "utterance queued for transcription"
    );
    if let PutOutcome::Dropped(_) = ctx.transcription_q.put(utterance, ctx.op_timeout) {
        warn!("transcription queue full, dropping audio segment");
    }
}
