// crates/veilcast-media/src/output.rs
//
// RTSP push output: H.264 video (veryfast/zerolatency, yuv420p) plus one
// audio stream in either of two modes:
//
//   Passthrough — the input packets are re-stamped onto the output stream;
//   the stream's codec parameters are reconstructed from AudioStreamInfo
//   (codec id, rate, channels, extradata) captured at connect time.
//
//   Opus — interleaved s16 PCM (already resampled to 48 kHz by the audio
//   worker) is FIFO-buffered into encoder-sized frames and encoded here.
//   The encoder wants exactly frame_size samples per call; arbitrary PCM
//   chunk sizes make the FIFO mandatory, and the tail is zero-padded at
//   session end so no PCM is lost.
//
// Video PTS strategy: session-relative seconds times the target fps, with a
// monotonicity guard. Audio PTS in Opus mode is a plain sample counter in
// the 1/48000 time base; both reset when a session's output is reopened.

use anyhow::{anyhow, Context as _, Result};

use ffmpeg_the_third as ffmpeg;
use ffmpeg::codec::{self, Id as CodecId};
use ffmpeg::encoder;
use ffmpeg::format::sample::Type as SampleType;
use ffmpeg::format::Sample;
use ffmpeg::util::channel_layout::{ChannelLayout, ChannelLayoutMask};
use ffmpeg::util::rational::Rational;
use ffmpeg::{Dictionary, Packet};

use crate::convert::BgrToYuv;
use crate::messages::{AudioOut, AudioStreamInfo, ProcessedVideoMessage};

const VIDEO_STREAM: usize = 0;
const AUDIO_STREAM: usize = 1;
const OPUS_RATE: u32 = 48_000;

#[derive(Debug, Clone, Copy)]
pub struct VideoParams {
    pub width:  u32,
    pub height: u32,
    pub fps:    u32,
}

/// How the output audio stream is fed.
pub enum AudioSetup {
    Passthrough(AudioStreamInfo),
    Opus { channels: u16 },
}

// ── Interleaved sample FIFO ───────────────────────────────────────────────────

/// s16 interleaved ring buffer between arbitrary PCM chunks and the fixed
/// frame size the Opus encoder demands.
struct SampleFifo {
    samples:  Vec<i16>,
    channels: usize,
}

impl SampleFifo {
    fn new(channels: usize) -> Self {
        Self { samples: Vec::new(), channels }
    }

    fn push(&mut self, samples: &[i16]) {
        self.samples.extend_from_slice(samples);
    }

    /// Buffered samples per channel.
    fn frames_buffered(&self) -> usize {
        self.samples.len() / self.channels
    }

    /// Pop `n` samples per channel as an encoder frame; short tails are
    /// zero-padded (used only for the final flush).
    fn pop_frame(&mut self, n: usize, pts: i64) -> ffmpeg::frame::Audio {
        let layout = if self.channels >= 2 {
            ChannelLayoutMask::STEREO
        } else {
            ChannelLayoutMask::MONO
        };
        let mut frame = ffmpeg::frame::Audio::new(Sample::I16(SampleType::Packed), n, layout);
        frame.set_rate(OPUS_RATE);
        frame.set_pts(Some(pts));

        let wanted = n * self.channels;
        let available = self.samples.len().min(wanted);
        unsafe {
            let data = frame.data_mut(0);
            let dst = std::slice::from_raw_parts_mut(data.as_mut_ptr() as *mut i16, wanted);
            dst[..available].copy_from_slice(&self.samples[..available]);
            if available < wanted {
                dst[available..].fill(0);
            }
        }
        self.samples.drain(..available);
        frame
    }
}

// ── Audio stream state ────────────────────────────────────────────────────────

enum AudioState {
    Passthrough {
        in_time_base: Rational,
        out_time_base: Rational,
    },
    Opus {
        encoder:       encoder::Audio,
        fifo:          SampleFifo,
        frame_size:    usize,
        enc_time_base: Rational,
        out_time_base: Rational,
        /// Next frame's PTS in samples.
        next_pts:      i64,
    },
}

// ── Output ────────────────────────────────────────────────────────────────────

pub struct StreamOutput {
    octx:          ffmpeg::format::context::Output,
    video_encoder: encoder::Video,
    yuv:           BgrToYuv,
    fps:           u32,
    enc_time_base: Rational,
    out_time_base: Rational,
    /// Timestamp of the first frame this session; output PTS is relative.
    first_ts:      Option<f64>,
    last_pts:      i64,
    audio:         Option<AudioState>,
}

impl StreamOutput {
    pub fn open(
        url: &str,
        transport: &str,
        video: VideoParams,
        audio: Option<AudioSetup>,
    ) -> Result<Self> {
        let options = Dictionary::from_iter([("rtsp_transport", transport)]);
        let mut octx = ffmpeg::format::output_as_with(&url, "rtsp", options)
            .with_context(|| format!("open output '{url}'"))?;

        // ── Video encoder (stream 0) ──────────────────────────────────────────
        let enc_time_base = Rational::new(1, video.fps as i32);

        let h264 = encoder::find(CodecId::H264)
            .ok_or_else(|| anyhow!("H.264 encoder not found — is libx264 available?"))?;

        let mut ost_video = octx.add_stream(h264)?;
        ost_video.set_time_base(enc_time_base);

        let video_enc_ctx = codec::context::Context::new_with_codec(h264);
        let mut video_enc = video_enc_ctx.encoder().video()?;
        video_enc.set_width(video.width);
        video_enc.set_height(video.height);
        video_enc.set_format(ffmpeg::format::Pixel::YUV420P);
        video_enc.set_time_base(enc_time_base);
        video_enc.set_frame_rate(Some(Rational::new(video.fps as i32, 1)));

        let mut opts = Dictionary::new();
        opts.set("preset", "veryfast");
        opts.set("tune", "zerolatency");

        let video_encoder = video_enc.open_as_with(h264, opts)?;

        // Copy encoder params into the stream's codecpar so the muxer knows
        // resolution, format, and codec-private data. No safe setter exists
        // for this in ffmpeg-the-third — go through the FFI.
        unsafe {
            let ret = ffmpeg::ffi::avcodec_parameters_from_context(
                (**(*octx.as_mut_ptr()).streams.add(VIDEO_STREAM)).codecpar,
                video_encoder.as_ptr() as *mut ffmpeg::ffi::AVCodecContext,
            );
            if ret < 0 {
                return Err(anyhow!("avcodec_parameters_from_context (video): {ret}"));
            }
        }

        // ── Audio stream (stream 1) ───────────────────────────────────────────
        let mut pending_audio = None;
        match audio {
            Some(AudioSetup::Passthrough(info)) => {
                let mut ost = octx.add_stream(encoder::find(CodecId::None))?;
                ost.set_time_base(info.time_base);
                unsafe {
                    write_passthrough_codecpar(&mut octx, &info)?;
                }
                pending_audio = Some((AudioStateKind::Passthrough, info.time_base, None));
            }
            Some(AudioSetup::Opus { channels }) => {
                let opus = encoder::find(CodecId::OPUS)
                    .ok_or_else(|| anyhow!("Opus encoder not found — is libopus available?"))?;

                let mut ost = octx.add_stream(opus)?;
                let enc_tb = Rational::new(1, OPUS_RATE as i32);
                ost.set_time_base(enc_tb);

                let audio_enc_ctx = codec::context::Context::new_with_codec(opus);
                let mut audio_enc = audio_enc_ctx.encoder().audio()?;
                audio_enc.set_rate(OPUS_RATE as i32);
                audio_enc.set_ch_layout(if channels > 1 {
                    ChannelLayout::STEREO
                } else {
                    ChannelLayout::MONO
                });
                audio_enc.set_format(Sample::I16(SampleType::Packed));
                audio_enc.set_bit_rate(96_000);

                let audio_encoder = audio_enc.open_as_with(opus, Dictionary::new())?;

                unsafe {
                    let ret = ffmpeg::ffi::avcodec_parameters_from_context(
                        (**(*octx.as_mut_ptr()).streams.add(AUDIO_STREAM)).codecpar,
                        audio_encoder.as_ptr() as *mut ffmpeg::ffi::AVCodecContext,
                    );
                    if ret < 0 {
                        return Err(anyhow!("avcodec_parameters_from_context (audio): {ret}"));
                    }
                }

                pending_audio = Some((
                    AudioStateKind::Opus { channels },
                    enc_tb,
                    Some(audio_encoder),
                ));
            }
            None => {}
        }

        octx.write_header().context("write output header")?;

        // Muxer-assigned time bases are only final after the header.
        let out_time_base = octx.stream(VIDEO_STREAM).expect("video stream").time_base();
        let audio_state = pending_audio.map(|(kind, enc_tb, enc)| {
            let out_tb = octx.stream(AUDIO_STREAM).expect("audio stream").time_base();
            match kind {
                AudioStateKind::Passthrough => AudioState::Passthrough {
                    in_time_base:  enc_tb,
                    out_time_base: out_tb,
                },
                AudioStateKind::Opus { channels } => {
                    let encoder = enc.expect("opus encoder built above");
                    let frame_size = (encoder.frame_size() as usize).max(960);
                    AudioState::Opus {
                        encoder,
                        fifo: SampleFifo::new(channels.max(1) as usize),
                        frame_size,
                        enc_time_base: enc_tb,
                        out_time_base: out_tb,
                        next_pts: 0,
                    }
                }
            }
        });

        Ok(Self {
            octx,
            video_encoder,
            yuv: BgrToYuv::new(),
            fps: video.fps,
            enc_time_base,
            out_time_base,
            first_ts: None,
            last_pts: -1,
            audio: audio_state,
        })
    }

    /// Encode and mux one processed frame.
    pub fn write_video(&mut self, msg: &ProcessedVideoMessage) -> Result<()> {
        let first = *self.first_ts.get_or_insert(msg.timestamp);
        let mut pts = ((msg.timestamp - first) * self.fps as f64).round() as i64;
        if pts <= self.last_pts {
            pts = self.last_pts + 1;
        }
        self.last_pts = pts;

        let frame = self.yuv.convert(&msg.image, Some(pts))?;
        self.video_encoder.send_frame(&frame).context("send video frame")?;
        self.drain_video_packets()
    }

    /// Mux one audio payload (passthrough packet or PCM for Opus).
    pub fn write_audio(&mut self, out: AudioOut) -> Result<()> {
        let Some(state) = &mut self.audio else {
            return Ok(()); // output opened without audio; drop silently
        };

        match (state, out) {
            (
                AudioState::Passthrough { in_time_base, out_time_base },
                AudioOut::Passthrough { mut packet, time_base },
            ) => {
                // The message carries the demuxer's time base; prefer it over
                // the connect-time snapshot in case they disagree.
                let in_tb = if time_base.numerator() != 0 { time_base } else { *in_time_base };
                packet.set_stream(AUDIO_STREAM);
                packet.rescale_ts(in_tb, *out_time_base);
                packet.write_interleaved(&mut self.octx).context("write audio packet")?;
            }
            (
                AudioState::Opus { encoder, fifo, frame_size, enc_time_base, out_time_base, next_pts },
                AudioOut::Pcm { samples, .. },
            ) => {
                fifo.push(&samples);
                while fifo.frames_buffered() >= *frame_size {
                    let frame = fifo.pop_frame(*frame_size, *next_pts);
                    *next_pts += *frame_size as i64;
                    encoder.send_frame(&frame).context("send audio frame")?;
                    drain_audio_packets(encoder, &mut self.octx, *enc_time_base, *out_time_base)?;
                }
            }
            // Mode/payload mismatch is a wiring bug upstream; drop the payload.
            _ => tracing::warn!("audio payload does not match output audio mode"),
        }
        Ok(())
    }

    /// Flush both encoders and write the trailer. Consumes the output; a new
    /// session opens a fresh one.
    pub fn finish(mut self) -> Result<()> {
        let _ = self.video_encoder.send_eof();
        self.drain_video_packets()?;

        if let Some(AudioState::Opus {
            mut encoder, mut fifo, frame_size, enc_time_base, out_time_base, next_pts,
        }) = self.audio.take()
        {
            if fifo.frames_buffered() > 0 {
                // Zero-padded final frame so the tail PCM is not lost.
                let frame = fifo.pop_frame(frame_size, next_pts);
                let _ = encoder.send_frame(&frame);
            }
            let _ = encoder.send_eof();
            drain_audio_packets(&mut encoder, &mut self.octx, enc_time_base, out_time_base)?;
        }

        self.octx.write_trailer().context("write trailer")?;
        Ok(())
    }

    fn drain_video_packets(&mut self) -> Result<()> {
        let mut packet = Packet::empty();
        while self.video_encoder.receive_packet(&mut packet).is_ok() {
            packet.set_stream(VIDEO_STREAM);
            packet.rescale_ts(self.enc_time_base, self.out_time_base);
            packet.write_interleaved(&mut self.octx).context("write video packet")?;
        }
        Ok(())
    }
}

enum AudioStateKind {
    Passthrough,
    Opus { channels: u16 },
}

fn drain_audio_packets(
    encoder: &mut encoder::Audio,
    octx: &mut ffmpeg::format::context::Output,
    enc_time_base: Rational,
    out_time_base: Rational,
) -> Result<()> {
    let mut packet = Packet::empty();
    while encoder.receive_packet(&mut packet).is_ok() {
        packet.set_stream(AUDIO_STREAM);
        packet.rescale_ts(enc_time_base, out_time_base);
        packet.write_interleaved(octx).context("write audio packet")?;
    }
    Ok(())
}

/// Reconstruct the passthrough stream's codec parameters from the
/// connect-time snapshot. `set_parameters` would need the input's
/// `Parameters`, which cannot cross the thread boundary; the snapshot can.
unsafe fn write_passthrough_codecpar(
    octx: &mut ffmpeg::format::context::Output,
    info: &AudioStreamInfo,
) -> Result<()> {
    let stream_ptr = *(*octx.as_mut_ptr()).streams.add(AUDIO_STREAM);
    let par = (*stream_ptr).codecpar;
    (*par).codec_type = ffmpeg::ffi::AVMediaType::AVMEDIA_TYPE_AUDIO;
    (*par).codec_id = info.codec_id.into();
    (*par).sample_rate = info.rate as i32;
    ffmpeg::ffi::av_channel_layout_default(&mut (*par).ch_layout, info.channels as i32);

    if let Some(extradata) = &info.extradata {
        let padded = extradata.len() + ffmpeg::ffi::AV_INPUT_BUFFER_PADDING_SIZE as usize;
        let buf = ffmpeg::ffi::av_mallocz(padded) as *mut u8;
        if buf.is_null() {
            return Err(anyhow!("av_mallocz failed for extradata"));
        }
        std::ptr::copy_nonoverlapping(extradata.as_ptr(), buf, extradata.len());
        (*par).extradata = buf;
        (*par).extradata_size = extradata.len() as i32;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_pops_in_order_and_pads_tail() {
        let mut fifo = SampleFifo::new(2);
        fifo.push(&[1, 2, 3, 4, 5, 6]);
        assert_eq!(fifo.frames_buffered(), 3);

        let frame = fifo.pop_frame(2, 0);
        assert_eq!(frame.samples(), 2);
        let data = frame.data(0);
        let samples = unsafe { std::slice::from_raw_parts(data.as_ptr() as *const i16, 4) };
        assert_eq!(samples, &[1, 2, 3, 4]);

        // One frame left; popping 2 pads with zeros.
        let frame = fifo.pop_frame(2, 2);
        let data = frame.data(0);
        let samples = unsafe { std::slice::from_raw_parts(data.as_ptr() as *const i16, 4) };
        assert_eq!(samples, &[5, 6, 0, 0]);
        assert_eq!(fifo.frames_buffered(), 0);
    }
}
