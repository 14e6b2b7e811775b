// crates/veilcast-filter/src/workers/asr.rs
//
// Transcription worker: pulls utterances off the bounded queue and runs the
// speech-to-text backend. Segment timestamps come back relative to the
// utterance; they are re-based onto stream time before emission. After
// shutdown the queue is drained synchronously (with one generous wait for
// the VAD worker's final flush) so nothing queued is lost.

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::Sender;
use tracing::{error, info};

use veilcast_core::queue::{BoundedQueue, GetOutcome};
use veilcast_core::transcribe::{Transcriber, TranscriptionEvent, TranscriptionSegment};

use super::WorkerHandles;

pub const NAME: &str = "asr";

/// Post-shutdown drain wait: long enough for the VAD worker to flush its
/// residual buffer.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

pub struct AsrContext {
    pub handles:         WorkerHandles,
    pub transcription_q: Arc<BoundedQueue<TranscriptionSegment>>,
    pub transcriber:     Box<dyn Transcriber>,
    /// Observers (tests, future API); events are also logged.
    pub events:          Option<Sender<TranscriptionEvent>>,
    pub op_timeout:      Duration,
}

pub fn run(mut ctx: AsrContext) -> anyhow::Result<()> {
    info!("transcription worker ready");
    let mut completed: u64 = 0;

    while !ctx.handles.shutdown.is_set() {
        ctx.handles.registry.heartbeat(NAME);
        if let GetOutcome::Item(segment) = ctx.transcription_q.get(ctx.op_timeout) {
            transcribe(&mut ctx, segment, &mut completed);
        }
    }

    // Drain what is left, including the VAD flush racing in behind us.
    while let GetOutcome::Item(segment) = ctx.transcription_q.get(DRAIN_TIMEOUT) {
        transcribe(&mut ctx, segment, &mut completed);
    }

    info!(completed, "transcription worker done");
    Ok(())
}

fn transcribe(ctx: &mut AsrContext, segment: TranscriptionSegment, completed: &mut u64) {
    let events = match ctx.transcriber.transcribe(&segment.audio) {
        Ok(events) => events,
        Err(e) => {
            // Per-utterance failure: log and stay alive.
            error!(error = %e, "transcription failed");
            return;
        }
    };

    for event in events {
        let text = event.text.trim();
        if text.is_empty() {
            continue;
        }
        let start = segment.start_time + event.start_time;
        let end = segment.start_time + event.end_time;
        info!(target: "transcript", "[{start:.2}s → {end:.2}s] {text}");
        if let Some(sink) = &ctx.events {
            let _ = sink.send(TranscriptionEvent {
                text: text.to_string(),
                start_time: start,
                end_time: end,
            });
        }
    }
    *completed += 1;
}
