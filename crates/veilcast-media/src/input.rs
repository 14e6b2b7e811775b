// crates/veilcast-media/src/input.rs
//
// RTMP listen input: one StreamInput per publisher session.
//
// Opening uses avformat_open_input with an interrupt callback wired to the
// process shutdown flag plus a short listen timeout, so both the accept wait
// and a stalled mid-stream read return within about a second, the bound the
// supervisor's heartbeat contract needs. Demuxing is pull-based: read() maps
// every libav outcome onto the Demuxed sum type instead of errors-as-flow.

use std::collections::HashMap;
use std::ffi::CString;
use std::ptr;

use anyhow::{anyhow, Result};
use serde_json::Value;
use uuid::Uuid;

use ffmpeg_the_third as ffmpeg;
use ffmpeg::ffi::{
    avformat_alloc_context, avformat_close_input, avformat_find_stream_info,
    avformat_open_input,
};
use ffmpeg::format::context;
use ffmpeg::media::Type;
use ffmpeg::util::interrupt;
use ffmpeg::util::rational::Rational;
use ffmpeg::{Dictionary, Packet};

use crate::messages::AudioStreamInfo;

/// Outcome of one demux step.
pub enum Demuxed {
    /// Decoded frames from one video packet (may be empty while the decoder
    /// warms up).
    Video(Vec<ffmpeg::frame::Video>),
    /// One audio packet plus everything it decoded to.
    Audio { packet: Packet, frames: Vec<ffmpeg::frame::Audio> },
    /// A packet for a stream we don't handle.
    Skip,
    /// Read timed out with the session still alive; try again.
    Timeout,
    /// Publisher finished cleanly.
    EndOfStream,
    /// Interrupt callback fired (shutdown).
    Exit,
    /// Session is dead; disconnect and reconnect.
    Error(ffmpeg::Error),
}

pub struct StreamInput {
    ictx:       context::Input,
    session_id: Uuid,
    video_idx:  Option<usize>,
    audio_idx:  Option<usize>,
    vdec:       Option<ffmpeg::decoder::Video>,
    adec:       Option<ffmpeg::decoder::Audio>,
    video_tb:   Rational,
    audio_tb:   Rational,
    metadata:   HashMap<String, Value>,
    audio_info: Option<AudioStreamInfo>,
}

impl StreamInput {
    /// Listen for a publisher on `url`. Returns Ok(None) when nobody
    /// connected within `listen_timeout_secs` (the silent-retry case) and
    /// Err only for real failures (bad URL, port in use).
    ///
    /// `interrupt` is polled from libav's interrupt callback, so a pending
    /// accept or read aborts promptly once it returns true (shutdown).
    pub fn listen(
        url: &str,
        listen_timeout_secs: u64,
        interrupt: impl FnMut() -> bool + 'static,
    ) -> Result<Option<StreamInput>> {
        let options = Dictionary::from_iter([
            ("listen", "1"),
            ("timeout", listen_timeout_secs.to_string().as_str()),
            ("rtmp_live", "live"),
            ("fflags", "nobuffer"),
        ]);

        let ictx = match input_with_dictionary_and_interrupt(url, options, interrupt) {
            Ok(ictx) => ictx,
            Err(e) if is_timeout(&e) || e == ffmpeg::Error::Exit => return Ok(None),
            Err(e) => return Err(anyhow!("open input '{url}': {e}")),
        };

        Self::from_context(ictx).map(Some)
    }

    fn from_context(ictx: context::Input) -> Result<StreamInput> {
        let session_id = Uuid::new_v4();
        let mut metadata = HashMap::new();
        metadata.insert("session_id".into(), Value::from(session_id.to_string()));

        let video = ictx.streams().best(Type::Video).map(|s| s.index());
        let audio = ictx.streams().best(Type::Audio).map(|s| s.index());
        metadata.insert("has_video".into(), Value::from(video.is_some()));
        metadata.insert("has_audio".into(), Value::from(audio.is_some()));

        let mut input = StreamInput {
            ictx,
            session_id,
            video_idx: video,
            audio_idx: audio,
            vdec: None,
            adec: None,
            video_tb: Rational::new(1, 1000),
            audio_tb: Rational::new(1, 1000),
            metadata,
            audio_info: None,
        };

        if let Some(idx) = input.video_idx {
            let stream = input.ictx.stream(idx).expect("video stream present");
            input.video_tb = stream.time_base();
            let fps = f64::from(stream.avg_frame_rate());
            let params = stream.parameters();
            let (w, h) = unsafe {
                let p = params.as_ptr();
                ((*p).width as u32, (*p).height as u32)
            };
            let dec_ctx = ffmpeg::codec::context::Context::from_parameters(params)?;
            let decoder = dec_ctx.decoder().video()?;
            input.metadata.insert(
                "video_codec".into(),
                Value::from(decoder.codec().map(|c| c.name().to_string()).unwrap_or_default()),
            );
            input.metadata.insert("video_width".into(), Value::from(w));
            input.metadata.insert("video_height".into(), Value::from(h));
            input.metadata.insert("video_fps".into(), Value::from(fps));
            input.vdec = Some(decoder);
        }

        if let Some(idx) = input.audio_idx {
            let stream = input.ictx.stream(idx).expect("audio stream present");
            input.audio_tb = stream.time_base();
            let extradata = read_extradata(&stream);
            let params = stream.parameters();
            let codec_id = unsafe { ffmpeg::codec::Id::from((*params.as_ptr()).codec_id) };
            let dec_ctx = ffmpeg::codec::context::Context::from_parameters(params)?;
            let decoder = dec_ctx.decoder().audio()?;
            let rate = decoder.rate();
            let channels = decoder.ch_layout().channels() as u16;
            input.metadata.insert(
                "audio_codec".into(),
                Value::from(decoder.codec().map(|c| c.name().to_string()).unwrap_or_default()),
            );
            input.metadata.insert("audio_rate".into(), Value::from(rate));
            input.metadata.insert("audio_channels".into(), Value::from(channels));
            input.audio_info = Some(AudioStreamInfo {
                codec_id,
                rate,
                channels,
                extradata,
                time_base: input.audio_tb,
            });
            input.adec = Some(decoder);
        }

        if input.video_idx.is_none() {
            return Err(anyhow!("publisher has no video stream"));
        }

        Ok(input)
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn has_audio(&self) -> bool {
        self.audio_idx.is_some()
    }

    pub fn metadata(&self) -> HashMap<String, Value> {
        self.metadata.clone()
    }

    pub fn audio_stream_info(&self) -> Option<AudioStreamInfo> {
        self.audio_info.clone()
    }

    pub fn video_time_base(&self) -> Rational {
        self.video_tb
    }

    pub fn audio_time_base(&self) -> Rational {
        self.audio_tb
    }

    /// Seconds for a video frame PTS.
    pub fn video_time(&self, pts: Option<i64>) -> Option<f64> {
        pts.map(|p| p.max(0) as f64 * f64::from(self.video_tb))
    }

    /// Seconds for an audio packet/frame PTS.
    pub fn audio_time(&self, pts: Option<i64>) -> Option<f64> {
        pts.map(|p| p.max(0) as f64 * f64::from(self.audio_tb))
    }

    /// Demux one packet and decode it.
    pub fn read(&mut self) -> Demuxed {
        let mut packet = Packet::empty();
        match packet.read(&mut self.ictx) {
            Ok(()) => {}
            Err(ffmpeg::Error::Eof) => return Demuxed::EndOfStream,
            Err(ffmpeg::Error::Exit) => return Demuxed::Exit,
            Err(e) if is_timeout(&e) => return Demuxed::Timeout,
            Err(e) if is_exit_requested(&e) => return Demuxed::Exit,
            Err(e) => return Demuxed::Error(e),
        }

        let stream_idx = packet.stream();

        if Some(stream_idx) == self.video_idx {
            let decoder = self.vdec.as_mut().expect("video decoder present");
            if let Err(e) = decoder.send_packet(&packet) {
                // A bad packet is not a session error; skip it and let the
                // decoder resync on the next keyframe.
                tracing::debug!(error = %e, "video decode error, packet skipped");
                return Demuxed::Video(Vec::new());
            }
            let mut frames = Vec::new();
            let mut decoded = ffmpeg::frame::Video::empty();
            while decoder.receive_frame(&mut decoded).is_ok() {
                frames.push(std::mem::replace(&mut decoded, ffmpeg::frame::Video::empty()));
            }
            return Demuxed::Video(frames);
        }

        if Some(stream_idx) == self.audio_idx {
            let decoder = self.adec.as_mut().expect("audio decoder present");
            let mut frames = Vec::new();
            if decoder.send_packet(&packet).is_ok() {
                let mut decoded = ffmpeg::frame::Audio::empty();
                while decoder.receive_frame(&mut decoded).is_ok() {
                    frames.push(std::mem::replace(&mut decoded, ffmpeg::frame::Audio::empty()));
                }
            }
            return Demuxed::Audio { packet, frames };
        }

        Demuxed::Skip
    }
}

/// Timeouts surface as errno-style errors whose message mentions the
/// timeout; matching the rendered message sidesteps platform errno values
/// the bindings don't re-export.
fn is_timeout(e: &ffmpeg::Error) -> bool {
    matches!(e, ffmpeg::Error::Other { .. }) && e.to_string().to_lowercase().contains("timed out")
}

/// "Immediate exit requested" arrives as a generic error when the interrupt
/// callback fires mid-operation.
fn is_exit_requested(e: &ffmpeg::Error) -> bool {
    e.to_string().contains("Immediate exit requested")
}

fn read_extradata(stream: &ffmpeg::Stream<'_>) -> Option<Vec<u8>> {
    unsafe {
        let codecpar = (*stream.as_ptr()).codecpar;
        let size = (*codecpar).extradata_size;
        if size > 0 {
            Some(std::slice::from_raw_parts((*codecpar).extradata, size as usize).to_vec())
        } else {
            None
        }
    }
}

/// avformat_open_input with both an options dictionary and an interrupt
/// callback — the safe wrappers expose one or the other, not both.
fn input_with_dictionary_and_interrupt<F>(
    url: &str,
    options: Dictionary,
    interrupt_fn: F,
) -> Result<context::Input, ffmpeg::Error>
where
    F: FnMut() -> bool + 'static,
{
    unsafe {
        let mut ps = avformat_alloc_context();
        (*ps).interrupt_callback = interrupt::new(Box::new(interrupt_fn)).interrupt;

        let path = CString::new(url).map_err(|_| ffmpeg::Error::InvalidData)?;
        let mut opts = options.disown();
        let res = avformat_open_input(&mut ps, path.as_ptr(), ptr::null_mut(), &mut opts);

        Dictionary::own(opts);

        match res {
            0 => match avformat_find_stream_info(ps, ptr::null_mut()) {
                r if r >= 0 => Ok(context::Input::wrap(ps)),
                e => {
                    avformat_close_input(&mut ps);
                    Err(ffmpeg::Error::from(e))
                }
            },
            e => Err(ffmpeg::Error::from(e)),
        }
    }
}
