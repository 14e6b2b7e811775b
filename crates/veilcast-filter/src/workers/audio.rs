// crates/veilcast-filter/src/workers/audio.rs
//
// Audio worker: one transform per message. Passthrough mode forwards the
// compressed packet for remux; Opus mode resamples the decoded frames to
// the encoder rate and forwards PCM. The output worker owns the muxer and
// (in Opus mode) the encoder, so this stage stays stateless apart from the
// lazily-built resampler.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use veilcast_core::queue::{BoundedQueue, GetOutcome, PutOutcome};
use veilcast_media::messages::{AudioMessage, AudioOut};
use veilcast_media::resample::PcmResampler;

use super::WorkerHandles;

pub const NAME: &str = "audio";

const OPUS_RATE: u32 = 48_000;

pub struct AudioContext {
    pub handles:     WorkerHandles,
    pub audio_q:     Arc<BoundedQueue<AudioMessage>>,
    pub audio_out_q: Arc<BoundedQueue<AudioOut>>,
    pub opus:        bool,
    pub op_timeout:  Duration,
}

pub fn run(ctx: AudioContext) -> anyhow::Result<()> {
    info!(mode = if ctx.opus { "opus" } else { "passthrough" }, "audio worker ready");
    let mut resampler: Option<PcmResampler> = None;

    while !ctx.handles.shutdown.is_set() {
        ctx.handles.registry.heartbeat(NAME);

        let msg = match ctx.audio_q.get(ctx.op_timeout) {
            GetOutcome::Item(msg) => msg,
            GetOutcome::TimedOut => continue,
        };

        if ctx.opus {
            for frame in &msg.frames {
                let rs = resampler.get_or_insert_with(|| {
                    PcmResampler::for_encoder(OPUS_RATE, frame.ch_layout().channels() as u16)
                });
                match rs.resample(frame) {
                    Ok(samples) if samples.is_empty() => {}
                    Ok(samples) => {
                        let out = AudioOut::Pcm {
                            samples,
                            channels: rs.channels(),
                            rate: rs.rate(),
                        };
                        if let PutOutcome::Dropped(_) = ctx.audio_out_q.put(out, ctx.op_timeout) {
                            debug!(sequence = msg.sequence, "dropped audio pcm");
                        }
                    }
                    Err(e) => warn!(sequence = msg.sequence, error = %e, "audio resample failed"),
                }
            }
        } else {
            let out = AudioOut::Passthrough { packet: msg.packet, time_base: msg.time_base };
            if let PutOutcome::Dropped(_) = ctx.audio_out_q.put(out, ctx.op_timeout) {
                debug!(sequence = msg.sequence, "dropped audio packet");
            }
        }
    }

    info!("audio worker done");
    Ok(())
}
