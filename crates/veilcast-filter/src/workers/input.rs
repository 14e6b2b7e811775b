// crates/veilcast-filter/src/workers/input.rs
//
// Input worker: listens for the RTMP publisher, demuxes and decodes one
// session at a time, and fans frames out to the video/audio/VAD queues.
//
// The connect loop listens in 1-second chunks with a heartbeat per attempt,
// so health stays green and shutdown is observed within a second even while
// nobody is publishing. On any stream error the session is closed, all
// downstream queues are cleared (no stale frames after reconnect), sequence
// counters reset, and the loop goes back to waiting.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use veilcast_core::config::StreamConfig;
use veilcast_core::queue::{BoundedQueue, PutOutcome};
use veilcast_core::state::ConnectionState;
use veilcast_media::input::{Demuxed, StreamInput};
use veilcast_media::messages::{AudioMessage, AudioStreamInfo, VideoMessage};

use super::WorkerHandles;

pub const NAME: &str = "input";

/// Listen chunk length; also bounds mid-stream read stalls.
const LISTEN_CHUNK_SECS: u64 = 1;
/// Pause after a session ends before listening again.
const RECONNECT_BACKOFF: Duration = Duration::from_millis(500);
/// Frame hand-off wait; the hot path drops rather than blocks.
const PUT_TIMEOUT: Duration = Duration::from_millis(1);

pub struct InputContext {
    pub handles:    WorkerHandles,
    pub config:     StreamConfig,
    pub connection: Arc<ConnectionState>,
    pub video_q:    Arc<BoundedQueue<VideoMessage>>,
    pub audio_q:    Arc<BoundedQueue<AudioMessage>>,
    pub vad_q:      Arc<BoundedQueue<AudioMessage>>,
    pub transcription_enabled: bool,
    /// Snapshot of the input audio stream for the output worker's
    /// passthrough setup. Written at connect, cleared at disconnect.
    pub audio_info: Arc<Mutex<Option<AudioStreamInfo>>>,
}

pub fn run(ctx: InputContext) -> anyhow::Result<()> {
    info!(url = %ctx.config.in_url, "input worker listening");
    let mut waiting_logged = false;

    while !ctx.handles.shutdown.is_set() {
        ctx.handles.registry.heartbeat(NAME);

        if !waiting_logged {
            info!("waiting for publisher...");
            waiting_logged = true;
        }

        let interrupt = {
            let shutdown = Arc::clone(&ctx.handles.shutdown);
            move || shutdown.is_set()
        };
        let session = match StreamInput::listen(&ctx.config.in_url, LISTEN_CHUNK_SECS, interrupt) {
            Ok(Some(session)) => session,
            Ok(None) => continue, // listen chunk elapsed, heartbeat and retry
            Err(e) => {
                warn!(error = %e, "connection error");
                ctx.handles.shutdown.wait(RECONNECT_BACKOFF);
                continue;
            }
        };
        waiting_logged = false;

        info!(session = %session.session_id(), "publisher connected");
        *ctx.audio_info.lock().unwrap() = session.audio_stream_info();
        ctx.connection.set_input_connected(true, Some(session.metadata()));

        run_session(&ctx, session);

        // Disconnect: stale frames from the old session must not survive
        // into the next one.
        debug!("clearing queues after disconnect");
        ctx.video_q.clear();
        ctx.audio_q.clear();
        ctx.vad_q.clear();
        *ctx.audio_info.lock().unwrap() = None;
        ctx.connection.set_input_connected(false, None);

        if !ctx.handles.shutdown.is_set() {
            ctx.handles.shutdown.wait(RECONNECT_BACKOFF);
        }
    }

    Ok(())
}

/// Demux one publisher session until EOF, error, or shutdown. Sequence
/// numbers are session-scoped: they start at zero here and never move
/// backwards within the session.
fn run_session(ctx: &InputContext, mut session: StreamInput) {
    let mut video_seq: u64 = 0;
    let mut audio_seq: u64 = 0;
    let mut stream_time: f64 = 0.0;
    let mut last_beat = Instant::now();
    let mut packets_since_beat: u64 = 0;

    loop {
        if ctx.handles.shutdown.is_set() {
            return;
        }

        if last_beat.elapsed() >= Duration::from_secs(1) {
            ctx.handles.registry.heartbeat(NAME);
            if packets_since_beat > 0 {
                debug!(packets = packets_since_beat, "demux throughput");
            }
            packets_since_beat = 0;
            last_beat = Instant::now();
        }

        match session.read() {
            Demuxed::Video(frames) => {
                for frame in frames {
                    let timestamp = session.video_time(frame.pts()).unwrap_or(stream_time);
                    stream_time = timestamp;
                    let msg = VideoMessage {
                        frame,
                        timestamp,
                        sequence: video_seq,
                        time_base: session.video_time_base(),
                    };
                    if let PutOutcome::Dropped(_) = ctx.video_q.put(msg, PUT_TIMEOUT) {
                        debug!(sequence = video_seq, "dropped video frame");
                    }
                    video_seq += 1;
                    packets_since_beat += 1;
                }
            }
            Demuxed::Audio { packet, frames } => {
                let timestamp = session
                    .audio_time(packet.pts().or_else(|| frames.first().and_then(|f| f.pts())))
                    .unwrap_or(stream_time);

                if ctx.transcription_enabled {
                    // The VAD path gets its own copy; drop silently on
                    // overflow (transcription is best-effort).
                    let copy = AudioMessage {
                        packet: packet.clone(),
                        frames: frames.clone(),
                        timestamp,
                        sequence: audio_seq,
                        time_base: session.audio_time_base(),
                    };
                    let _ = ctx.vad_q.put(copy, PUT_TIMEOUT);
                }

                let msg = AudioMessage {
                    packet,
                    frames,
                    timestamp,
                    sequence: audio_seq,
                    time_base: session.audio_time_base(),
                };
                if let PutOutcome::Dropped(_) = ctx.audio_q.put(msg, PUT_TIMEOUT) {
                    debug!(sequence = audio_seq, "dropped audio packet");
                }
                audio_seq += 1;
                packets_since_beat += 1;
            }
            Demuxed::Skip | Demuxed::Timeout => {}
            Demuxed::EndOfStream => {
                info!("publisher disconnected (EOF)");
                return;
            }
            Demuxed::Exit => return,
            Demuxed::Error(e) => {
                debug!(error = %e, "stream ended");
                return;
            }
        }
    }
}
