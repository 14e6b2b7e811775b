// crates/veilcast-core/src/config.rs
//
// Plain configuration structs with the pipeline defaults. The binary crate
// maps CLI flags / environment variables onto these (clap lives there, not
// here), so tests and library consumers can build configs directly.

use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;

/// Stream endpoints and transport.
#[derive(Debug, Clone, Serialize)]
pub struct StreamConfig {
    /// RTMP listen URL the publisher connects to.
    pub in_url:  String,
    /// RTSP push URL for the processed stream.
    pub out_url: String,
    pub fps:     u32,
    /// (open, read) timeouts in seconds. Open attempts are chunked into
    /// 1-second listens so shutdown latency stays bounded.
    pub connect_timeout: (u64, u64),
    pub rtsp_transport:  String,
    /// Audio mode: false = passthrough remux, true = Opus @ 48 kHz transcode.
    pub audio_opus: bool,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            in_url:  "rtmp://0.0.0.0:1935/live/stream".into(),
            out_url: "rtsp://127.0.0.1:8554/blurred".into(),
            fps:     30,
            connect_timeout: (5, 1),
            rtsp_transport:  "tcp".into(),
            audio_opus: false,
        }
    }
}

/// Face detection, blur, and recognition-gate settings.
#[derive(Debug, Clone, Serialize)]
pub struct FaceConfig {
    pub blur_kernel:       u32,
    pub score_threshold:   f32,
    pub nms_threshold:     f32,
    pub top_k:             usize,
    pub min_confidence:    f32,
    pub padding_ratio:     f32,
    pub cache_duration_ms: u64,
    /// When true, faces matching a consent record are left unblurred.
    pub gate_enabled:      bool,
    pub cosine_threshold:  f32,
    pub l2_threshold:      f32,
}

impl Default for FaceConfig {
    fn default() -> Self {
        Self {
            blur_kernel:       51,
            score_threshold:   0.7,
            nms_threshold:     0.3,
            top_k:             5000,
            min_confidence:    0.5,
            padding_ratio:     0.1,
            cache_duration_ms: 150,
            gate_enabled:      false,
            cosine_threshold:  0.363,
            l2_threshold:      1.128,
        }
    }
}

/// Two-threshold VAD segmentation parameters.
#[derive(Debug, Clone, Serialize)]
pub struct VadConfig {
    pub start_speech_prob: f32,
    pub keep_speech_prob:  f32,
    pub stop_silence_ms:   u64,
    pub min_segment_ms:    u64,
    pub sampling_rate:     u32,
    pub chunk_size:        usize,
}

impl VadConfig {
    pub fn stop_silence_samples(&self) -> usize {
        (self.sampling_rate as u64 * self.stop_silence_ms / 1000) as usize
    }

    pub fn min_segment_samples(&self) -> usize {
        (self.sampling_rate as u64 * self.min_segment_ms / 1000) as usize
    }
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            start_speech_prob: 0.1,
            keep_speech_prob:  0.5,
            stop_silence_ms:   500,
            min_segment_ms:    300,
            sampling_rate:     16_000,
            chunk_size:        512,
        }
    }
}

/// Transcription settings.
#[derive(Debug, Clone, Serialize)]
pub struct TranscriptionConfig {
    pub enabled:       bool,
    /// GGML model file for the whisper backend.
    pub whisper_model: PathBuf,
    pub cpu_threads:   usize,
    pub beam_size:     usize,
    pub language:      String,
    /// Capacity of the utterance queue between the VAD and ASR workers.
    pub queue_capacity: usize,
}

impl Default for TranscriptionConfig {
    fn default() -> Self {
        Self {
            enabled:       false,
            whisper_model: PathBuf::from("models/ggml-small.en.bin"),
            cpu_threads:   num_threads_default(),
            beam_size:     5,
            language:      "en".into(),
            queue_capacity: 10,
        }
    }
}

fn num_threads_default() -> usize {
    // num_cpus is linked by the binary; core keeps a conservative fallback so
    // config defaults stay usable in tests without the dependency.
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
}

/// Queue capacities per pipeline hop.
#[derive(Debug, Clone, Serialize)]
pub struct QueueConfig {
    pub video:     usize,
    pub processed: usize,
    pub audio:     usize,
    pub vad:       usize,
    /// Timed put/get granularity for worker loops.
    pub op_timeout_ms: u64,
}

impl QueueConfig {
    pub fn op_timeout(&self) -> Duration {
        Duration::from_millis(self.op_timeout_ms)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { video: 10, processed: 10, audio: 100, vad: 100, op_timeout_ms: 100 }
    }
}

/// Consent subsystem settings.
#[derive(Debug, Clone, Serialize)]
pub struct ConsentConfig {
    pub directory:     PathBuf,
    pub poll_interval: Duration,
    pub jpeg_quality:  u8,
}

impl Default for ConsentConfig {
    fn default() -> Self {
        Self {
            directory:     PathBuf::from("./consent_captures"),
            poll_interval: Duration::from_millis(250),
            jpeg_quality:  95,
        }
    }
}

/// Model file locations for the ONNX/whisper adapters.
#[derive(Debug, Clone, Serialize)]
pub struct ModelConfig {
    pub yunet:  PathBuf,
    pub sface:  PathBuf,
    pub silero: PathBuf,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            yunet:  PathBuf::from("models/face_detection_yunet_2023mar.onnx"),
            sface:  PathBuf::from("models/face_recognition_sface_2021dec.onnx"),
            silero: PathBuf::from("models/silero_vad.onnx"),
        }
    }
}

/// Everything the supervisor needs to build the pipeline.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FilterConfig {
    pub stream:        StreamConfig,
    pub face:          FaceConfig,
    pub vad:           VadConfig,
    pub transcription: TranscriptionConfig,
    pub queues:        QueueConfig,
    pub consent:       ConsentConfig,
    pub models:        ModelConfig,
}
