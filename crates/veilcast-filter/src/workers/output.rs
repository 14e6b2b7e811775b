// crates/veilcast-filter/src/workers/output.rs
//
// Output worker: sole owner of the RTSP muxer and both encoders. A session's
// output opens lazily on the first processed frame (that is when the
// dimensions are known) and closes when the input disconnects and the
// queues have drained, or when a sequence reset announces a new session.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, error, info};

use veilcast_core::config::StreamConfig;
use veilcast_core::queue::{BoundedQueue, GetOutcome};
use veilcast_core::state::ConnectionState;
use veilcast_media::messages::{AudioOut, AudioStreamInfo, ProcessedVideoMessage};
use veilcast_media::output::{AudioSetup, StreamOutput, VideoParams};

use super::WorkerHandles;

pub const NAME: &str = "output";

/// Short poll for the audio side so video latency stays bounded.
const AUDIO_POLL: Duration = Duration::from_millis(1);

pub struct OutputContext {
    pub handles:     WorkerHandles,
    pub config:      StreamConfig,
    pub connection:  Arc<ConnectionState>,
    pub processed_q: Arc<BoundedQueue<ProcessedVideoMessage>>,
    pub audio_out_q: Arc<BoundedQueue<AudioOut>>,
    pub audio_info:  Arc<Mutex<Option<AudioStreamInfo>>>,
    pub op_timeout:  Duration,
}

pub fn run(ctx: OutputContext) -> anyhow::Result<()> {
    info!(url = %ctx.config.out_url, "output worker ready");
    let mut output: Option<StreamOutput> = None;
    let mut last_sequence: Option<u64> = None;

    while !ctx.handles.shutdown.is_set() {
        ctx.handles.registry.heartbeat(NAME);

        // Audio first: packets are small and frequent, and interleaving
        // wants them muxed close to their video neighbors.
        while let GetOutcome::Item(audio) = ctx.audio_out_q.get(AUDIO_POLL) {
            if let Some(out) = &mut output {
                if let Err(e) = out.write_audio(audio) {
                    error!(error = %e, "audio mux failed");
                }
            }
            // No open output yet: drop. Audio can't open a session because
            // the video dimensions aren't known until a frame arrives.
        }

        let msg = match ctx.processed_q.get(ctx.op_timeout) {
            GetOutcome::Item(msg) => msg,
            GetOutcome::TimedOut => {
                // Input gone and everything drained → end this session's
                // output so the next publisher starts a clean one.
                if output.is_some()
                    && !ctx.connection.is_input_connected()
                    && ctx.processed_q.is_empty()
                    && ctx.audio_out_q.is_empty()
                {
                    close(&ctx, &mut output);
                    last_sequence = None;
                }
                continue;
            }
        };

        // Sequence reset marks a reconnect that outran the disconnect
        // signal; restart the output session.
        if let (Some(last), true) = (last_sequence, output.is_some()) {
            if msg.sequence < last {
                debug!(sequence = msg.sequence, last, "sequence reset, reopening output");
                close(&ctx, &mut output);
            }
        }

        if output.is_none() {
            let video = VideoParams {
                width:  msg.image.width,
                height: msg.image.height,
                fps:    ctx.config.fps,
            };
            let audio_setup = build_audio_setup(&ctx);
            match StreamOutput::open(&ctx.config.out_url, &ctx.config.rtsp_transport, video, audio_setup) {
                Ok(out) => {
                    output = Some(out);
                    ctx.connection.set_output_connected(true);
                }
                Err(e) => {
                    error!(error = %e, "output open failed");
                    ctx.handles.shutdown.wait(Duration::from_secs(1));
                    continue;
                }
            }
        }

        if let Some(out) = &mut output {
            if let Err(e) = out.write_video(&msg) {
                error!(sequence = msg.sequence, error = %e, "video mux failed, reopening output");
                close(&ctx, &mut output);
                continue;
            }
        }
        last_sequence = Some(msg.sequence);
    }

    close(&ctx, &mut output);
    info!("output worker done");
    Ok(())
}

fn build_audio_setup(ctx: &OutputContext) -> Option<AudioSetup> {
    let info = ctx.audio_info.lock().unwrap().clone()?;
    if ctx.config.audio_opus {
        Some(AudioSetup::Opus { channels: info.channels })
    } else {
        Some(AudioSetup::Passthrough(info))
    }
}

fn close(ctx: &OutputContext, output: &mut Option<StreamOutput>) {
    if let Some(out) = output.take() {
        if let Err(e) = out.finish() {
            debug!(error = %e, "output finish");
        }
        ctx.connection.set_output_connected(false);
    }
}
