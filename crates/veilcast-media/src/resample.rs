// crates/veilcast-media/src/resample.rs
//
// PCM resampling for the two audio consumers: the VAD tap (s16 mono @ 16 kHz)
// and the Opus transcode path (s16 packed @ 48 kHz, mono or stereo).
// The swresample context is built lazily on the first frame, once the real
// input format is known.

use anyhow::Result;

use ffmpeg_the_third as ffmpeg;
use ffmpeg::format::sample::Type as SampleType;
use ffmpeg::format::Sample;
use ffmpeg::software::resampling;
use ffmpeg::util::channel_layout::ChannelLayout;

pub struct PcmResampler {
    target_rate:     u32,
    target_channels: u16,
    ctx:             Option<resampling::Context>,
    /// (format, channels, rate) the context was built for; a reconnect can
    /// change the publisher's audio geometry mid-life.
    source:          Option<(Sample, u32, u32)>,
}

impl PcmResampler {
    /// Mono resampler for the VAD tap.
    pub fn mono(target_rate: u32) -> Self {
        Self { target_rate, target_channels: 1, ctx: None, source: None }
    }

    /// Resampler for the Opus encoder: stereo when the source has more than
    /// one channel, mono otherwise.
    pub fn for_encoder(target_rate: u32, source_channels: u16) -> Self {
        let target_channels = if source_channels > 1 { 2 } else { 1 };
        Self { target_rate, target_channels, ctx: None, source: None }
    }

    pub fn channels(&self) -> u16 {
        self.target_channels
    }

    pub fn rate(&self) -> u32 {
        self.target_rate
    }

    /// Resample one decoded frame to interleaved s16 at the target layout.
    pub fn resample(&mut self, frame: &ffmpeg::frame::Audio) -> Result<Vec<i16>> {
        if frame.samples() == 0 {
            return Ok(Vec::new());
        }

        let target_fmt = Sample::I16(SampleType::Packed);
        let target_layout = if self.target_channels > 1 {
            ChannelLayout::STEREO
        } else {
            ChannelLayout::MONO
        };

        let signature = (frame.format(), frame.ch_layout().channels() as u32, frame.rate());
        if self.source != Some(signature) {
            // Mono sources must be declared as MONO or swr misreads the
            // channel layout.
            let src_layout = if frame.ch_layout().channels() >= 2 {
                frame.ch_layout()
            } else {
                ChannelLayout::MONO
            };
            tracing::debug!(
                from_rate = frame.rate(),
                from_channels = frame.ch_layout().channels(),
                to_rate = self.target_rate,
                to_channels = self.target_channels,
                "audio resampler configured"
            );
            self.ctx = Some(resampling::Context::get2(
                frame.format(), src_layout,    frame.rate(),
                target_fmt,     target_layout, self.target_rate,
            )?);
            self.source = Some(signature);
        }
        let ctx = self.ctx.as_mut().expect("resampler built above");

        let mut out = ffmpeg::frame::Audio::empty();
        ctx.run(frame, &mut out)?;
        if out.samples() == 0 {
            return Ok(Vec::new());
        }

        let n = out.samples() * self.target_channels as usize;
        let bytes = out.data(0);
        let samples = unsafe { std::slice::from_raw_parts(bytes.as_ptr() as *const i16, n) };
        Ok(samples.to_vec())
    }
}
