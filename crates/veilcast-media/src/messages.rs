// crates/veilcast-media/src/messages.rs
//
// Message types that flow through the bounded queues between workers.
// Frames and packets are refcounted libav buffers (Send); ownership passes
// hop to hop, nothing is shared.

use ffmpeg_the_third as ffmpeg;
use ffmpeg::util::rational::Rational;
use ffmpeg::Packet;

use veilcast_core::blur::BgrImage;

/// One decoded video frame from the input session.
pub struct VideoMessage {
    pub frame:     ffmpeg::frame::Video,
    /// Stream time in seconds: the frame's own time when it has a PTS,
    /// otherwise the last known stream time.
    pub timestamp: f64,
    /// Strictly monotonic per session; resets to 0 on reconnect.
    pub sequence:  u64,
    pub time_base: Rational,
}

/// One demuxed audio packet with its decoded frames. The compressed packet
/// rides along for passthrough remux; the frames feed Opus transcode and the
/// VAD tap without a second decode.
pub struct AudioMessage {
    pub packet:    Packet,
    pub frames:    Vec<ffmpeg::frame::Audio>,
    pub timestamp: f64,
    pub sequence:  u64,
    pub time_base: Rational,
}

/// A masked frame on its way to the encoder. The BGR pixels were mutated in
/// place by the blur stage; PTS and time base are carried over from the
/// source frame untouched.
pub struct ProcessedVideoMessage {
    pub image:          BgrImage,
    pub pts:            Option<i64>,
    pub time_base:      Rational,
    pub timestamp:      f64,
    pub sequence:       u64,
    pub faces_detected: usize,
}

/// Audio handed from the audio worker to the output muxer.
pub enum AudioOut {
    /// Passthrough mode: the original compressed packet, to be re-stamped
    /// onto the output audio stream.
    Passthrough { packet: Packet, time_base: Rational },
    /// Opus mode: interleaved s16 PCM already resampled to the encoder rate.
    Pcm { samples: Vec<i16>, channels: u16, rate: u32 },
}

/// Plain-data description of the input audio stream, captured at connect
/// time so the output worker can set up a matching passthrough stream.
/// (libav `Parameters` holds an `Rc` and cannot cross threads; this can.)
#[derive(Clone)]
pub struct AudioStreamInfo {
    pub codec_id:  ffmpeg::codec::Id,
    pub rate:      u32,
    pub channels:  u16,
    pub extradata: Option<Vec<u8>>,
    pub time_base: Rational,
}

impl std::fmt::Debug for AudioStreamInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioStreamInfo")
            .field("codec_id", &self.codec_id)
            .field("rate", &self.rate)
            .field("channels", &self.channels)
            .field("extradata_len", &self.extradata.as_ref().map(|e| e.len()))
            .finish()
    }
}
