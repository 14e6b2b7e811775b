// crates/veilcast-filter/src/config.rs
//
// CLI / environment configuration, mapped onto the plain config structs in
// veilcast-core. Every option can be set either as a flag or through its
// environment variable.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use veilcast_core::config::{
    ConsentConfig, FaceConfig, FilterConfig, ModelConfig, QueueConfig, StreamConfig,
    TranscriptionConfig, VadConfig,
};

/// Privacy filter for live streams: blurs unconsented faces and transcribes
/// speech between an RTMP publisher and an RTSP output.
#[derive(Parser, Debug)]
#[command(name = "veilcast-filter")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    // ── Stream ───────────────────────────────────────────────────────────────
    /// RTMP listen URL for the publisher.
    #[arg(long, env = "IN_URL", default_value = "rtmp://0.0.0.0:1935/live/stream")]
    in_url: String,

    /// RTSP push URL for the processed stream.
    #[arg(long, env = "OUT_URL", default_value = "rtsp://127.0.0.1:8554/blurred")]
    out_url: String,

    /// Output frame rate.
    #[arg(long, env = "FPS", default_value_t = 30)]
    fps: u32,

    /// Connection timeouts as "open,read" seconds.
    #[arg(long, env = "CONNECTION_TIMEOUT", default_value = "5,1", value_parser = parse_timeout)]
    connection_timeout: (u64, u64),

    /// RTSP transport protocol.
    #[arg(long, env = "RTSP_TRANSPORT", default_value = "tcp")]
    rtsp_transport: String,

    /// Transcode audio to Opus @ 48 kHz instead of passthrough remux.
    #[arg(long, env = "AUDIO_OPUS", default_value_t = false)]
    audio_opus: bool,

    // ── Face detection / blur ────────────────────────────────────────────────
    /// Gaussian blur kernel size (odd).
    #[arg(long, env = "FACE_BLUR_KERNEL", default_value_t = 51)]
    face_blur_kernel: u32,

    /// Detector score threshold.
    #[arg(long, env = "FACE_SCORE_THRESHOLD", default_value_t = 0.7)]
    face_score_threshold: f32,

    /// Detector non-maximum-suppression threshold.
    #[arg(long, env = "FACE_NMS_THRESHOLD", default_value_t = 0.3)]
    face_nms_threshold: f32,

    /// Maximum detections kept per frame.
    #[arg(long, env = "FACE_TOP_K", default_value_t = 5000)]
    face_top_k: usize,

    /// Minimum confidence for a detection to be blurred.
    #[arg(long, env = "FACE_MIN_CONFIDENCE", default_value_t = 0.5)]
    face_min_confidence: f32,

    /// Padding around detected faces as a fraction of the face's short side.
    #[arg(long, env = "FACE_PADDING_RATIO", default_value_t = 0.1)]
    face_padding_ratio: f32,

    /// Detection cache lifetime in milliseconds.
    #[arg(long, env = "FACE_CACHE_DURATION_MS", default_value_t = 150)]
    face_cache_duration_ms: u64,

    /// Leave faces matching a consent record unblurred.
    #[arg(long, env = "FACE_GATE", default_value_t = false)]
    face_gate: bool,

    /// Cosine match threshold (SFace convention).
    #[arg(long, env = "COSINE_THRESHOLD", default_value_t = 0.363)]
    cosine_threshold: f32,

    /// L2 match threshold (SFace convention).
    #[arg(long, env = "L2_THRESHOLD", default_value_t = 1.128)]
    l2_threshold: f32,

    // ── VAD ──────────────────────────────────────────────────────────────────
    #[arg(long, env = "VAD_START_SPEECH_PROB", default_value_t = 0.1)]
    start_speech_prob: f32,

    #[arg(long, env = "VAD_KEEP_SPEECH_PROB", default_value_t = 0.5)]
    keep_speech_prob: f32,

    #[arg(long, env = "VAD_STOP_SILENCE_MS", default_value_t = 500)]
    stop_silence_ms: u64,

    #[arg(long, env = "VAD_MIN_SEGMENT_MS", default_value_t = 300)]
    min_segment_ms: u64,

    #[arg(long, env = "VAD_SAMPLING_RATE", default_value_t = 16_000)]
    sampling_rate: u32,

    #[arg(long, env = "VAD_CHUNK_SIZE", default_value_t = 512)]
    chunk_size: usize,

    // ── Transcription ────────────────────────────────────────────────────────
    /// Enable the VAD + transcription path.
    #[arg(long, env = "ENABLE_TRANSCRIPTION", default_value_t = false)]
    enable_transcription: bool,

    /// GGML whisper model file.
    #[arg(long, env = "WHISPER_MODEL", default_value = "models/ggml-small.en.bin")]
    whisper_model: PathBuf,

    /// Threads for VAD/ASR inference (0 = all cores).
    #[arg(long, env = "CPU_THREADS", default_value_t = 0)]
    cpu_threads: usize,

    // ── Consent ──────────────────────────────────────────────────────────────
    /// Directory of consent capture images.
    #[arg(long, env = "CONSENT_DIR", default_value = "./consent_captures")]
    consent_dir: PathBuf,

    /// Consent directory poll interval in milliseconds.
    #[arg(long, env = "CONSENT_POLL_MS", default_value_t = 250)]
    consent_poll_ms: u64,

    // ── Models ───────────────────────────────────────────────────────────────
    #[arg(long, env = "YUNET_MODEL", default_value = "models/face_detection_yunet_2023mar.onnx")]
    yunet_model: PathBuf,

    #[arg(long, env = "SFACE_MODEL", default_value = "models/face_recognition_sface_2021dec.onnx")]
    sface_model: PathBuf,

    #[arg(long, env = "SILERO_MODEL", default_value = "models/silero_vad.onnx")]
    silero_model: PathBuf,
}

fn parse_timeout(value: &str) -> Result<(u64, u64), String> {
    let (open, read) = value
        .split_once(',')
        .ok_or_else(|| format!("expected \"open,read\" seconds, got '{value}'"))?;
    let open = open.trim().parse().map_err(|e| format!("bad open timeout: {e}"))?;
    let read = read.trim().parse().map_err(|e| format!("bad read timeout: {e}"))?;
    Ok((open, read))
}

impl Args {
    pub fn into_config(self) -> FilterConfig {
        let cpu_threads = if self.cpu_threads == 0 { num_cpus::get() } else { self.cpu_threads };
        FilterConfig {
            stream: StreamConfig {
                in_url:  self.in_url,
                out_url: self.out_url,
                fps:     self.fps,
                connect_timeout: self.connection_timeout,
                rtsp_transport:  self.rtsp_transport,
                audio_opus: self.audio_opus,
            },
            face: FaceConfig {
                blur_kernel:       self.face_blur_kernel,
                score_threshold:   self.face_score_threshold,
                nms_threshold:     self.face_nms_threshold,
                top_k:             self.face_top_k,
                min_confidence:    self.face_min_confidence,
                padding_ratio:     self.face_padding_ratio,
                cache_duration_ms: self.face_cache_duration_ms,
                gate_enabled:      self.face_gate,
                cosine_threshold:  self.cosine_threshold,
                l2_threshold:      self.l2_threshold,
            },
            vad: VadConfig {
                start_speech_prob: self.start_speech_prob,
                keep_speech_prob:  self.keep_speech_prob,
                stop_silence_ms:   self.stop_silence_ms,
                min_segment_ms:    self.min_segment_ms,
                sampling_rate:     self.sampling_rate,
                chunk_size:        self.chunk_size,
            },
            transcription: TranscriptionConfig {
                enabled:       self.enable_transcription,
                whisper_model: self.whisper_model,
                cpu_threads,
                ..Default::default()
            },
            queues: QueueConfig::default(),
            consent: ConsentConfig {
                directory:     self.consent_dir,
                poll_interval: Duration::from_millis(self.consent_poll_ms),
                ..Default::default()
            },
            models: ModelConfig {
                yunet:  self.yunet_model,
                sface:  self.sface_model,
                silero: self.silero_model,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_parses_pair() {
        assert_eq!(parse_timeout("5,1").unwrap(), (5, 1));
        assert_eq!(parse_timeout(" 10 , 2 ").unwrap(), (10, 2));
        assert!(parse_timeout("5").is_err());
        assert!(parse_timeout("a,b").is_err());
    }

    #[test]
    fn defaults_match_shipped_configuration() {
        let args = Args::parse_from(["veilcast-filter"]);
        let config = args.into_config();
        assert_eq!(config.stream.in_url, "rtmp://0.0.0.0:1935/live/stream");
        assert_eq!(config.stream.fps, 30);
        assert_eq!(config.stream.connect_timeout, (5, 1));
        assert!(!config.stream.audio_opus, "passthrough is the default");
        assert!(!config.face.gate_enabled, "shipped config blurs all faces");
        assert_eq!(config.face.blur_kernel, 51);
        assert_eq!(config.vad.chunk_size, 512);
        assert!(!config.transcription.enabled);
    }
}
