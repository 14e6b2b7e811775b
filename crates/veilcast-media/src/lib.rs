// crates/veilcast-media/src/lib.rs
//
// MediaIO adapter over ffmpeg-the-third: RTMP listen input, RTSP push
// output, pixel conversion, and PCM resampling. Everything FFmpeg-specific
// lives here; the core crate stays plain data.
//
// FFmpeg contexts (format, codec, scale, resample) carry non-Send interior
// state, so none of the types in input.rs / output.rs / convert.rs /
// resample.rs may be moved across threads. Workers construct them inside
// their own thread and keep them as locals; only the message types and
// AudioStreamInfo travel through queues.

pub mod convert;
pub mod input;
pub mod messages;
pub mod output;
pub mod resample;

pub use input::{Demuxed, StreamInput};
pub use messages::{AudioMessage, AudioOut, AudioStreamInfo, ProcessedVideoMessage, VideoMessage};
pub use output::{AudioSetup, StreamOutput, VideoParams};

/// One-time libav initialization. Call before any other media function.
pub fn init() -> anyhow::Result<()> {
    ffmpeg_the_third::init().map_err(|e| anyhow::anyhow!("ffmpeg init failed: {e}"))
}
