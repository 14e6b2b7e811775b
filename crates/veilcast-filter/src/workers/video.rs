// crates/veilcast-filter/src/workers/video.rs
//
// Video worker: decoded frame in, masked frame out. Owns the face mask
// (detector + cache + blur + optional recognition gate) and services the
// consent-capture slot before masking, so captures are taken from the
// unblurred frame.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use veilcast_core::config::ConsentConfig;
use veilcast_core::queue::{BoundedQueue, GetOutcome, PutOutcome};
use veilcast_media::convert::FrameToBgr;
use veilcast_media::messages::{ProcessedVideoMessage, VideoMessage};

use crate::consent::capture::{save_head_image, CaptureSlot};
use crate::mask::FaceMask;

use super::WorkerHandles;

pub const NAME: &str = "video";

pub struct VideoContext {
    pub handles:     WorkerHandles,
    pub video_q:     Arc<BoundedQueue<VideoMessage>>,
    pub processed_q: Arc<BoundedQueue<ProcessedVideoMessage>>,
    pub mask:        FaceMask,
    pub capture:     Arc<CaptureSlot>,
    pub consent:     ConsentConfig,
    pub padding_ratio: f32,
    pub op_timeout:  Duration,
}

pub fn run(mut ctx: VideoContext) -> anyhow::Result<()> {
    info!("video worker ready");
    let mut converter = FrameToBgr::new();
    let mut frames_processed: u64 = 0;

    while !ctx.handles.shutdown.is_set() {
        ctx.handles.registry.heartbeat(NAME);

        let msg = match ctx.video_q.get(ctx.op_timeout) {
            GetOutcome::Item(msg) => msg,
            GetOutcome::TimedOut => continue,
        };

        let mut image = match converter.convert(&msg.frame) {
            Ok(image) => image,
            Err(e) => {
                error!(sequence = msg.sequence, error = %e, "frame conversion failed");
                continue;
            }
        };

        // Operator-requested consent capture runs against the clean frame.
        if let Some(request) = ctx.capture.take() {
            match ctx.mask.detect_faces(&image).map(|faces| {
                save_head_image(
                    &image,
                    &faces,
                    request.name.as_deref(),
                    &ctx.consent,
                    ctx.padding_ratio,
                )
            }) {
                Ok(Ok((path, _face))) => info!(path = %path.display(), "consent capture saved"),
                Ok(Err(e)) => warn!(error = %e, "consent capture failed"),
                Err(e) => warn!(error = %e, "consent capture detection failed"),
            }
        }

        let faces_detected = match ctx.mask.process(&mut image) {
            Ok(count) => count,
            Err(e) => {
                // Never forward a frame the mask could not process: a
                // detector failure must not leak an unblurred face.
                error!(sequence = msg.sequence, error = %e, "face mask failed, frame dropped");
                continue;
            }
        };

        let processed = ProcessedVideoMessage {
            image,
            pts: msg.frame.pts(),
            time_base: msg.time_base,
            timestamp: msg.timestamp,
            sequence: msg.sequence,
            faces_detected,
        };

        if let PutOutcome::Dropped(dropped) = ctx.processed_q.put(processed, ctx.op_timeout) {
            debug!(sequence = dropped.sequence, "dropped processed frame");
        }

        frames_processed += 1;
        if frames_processed % 100 == 0 {
            debug!(frames = frames_processed, "video worker progress");
        }
    }

    info!(frames = frames_processed, "video worker done");
    Ok(())
}
