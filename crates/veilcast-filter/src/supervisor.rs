// crates/veilcast-filter/src/supervisor.rs
//
// The supervisor owns construction: queues, shared state, model sessions,
// and one thread per worker. No globals; every dependency is handed in at
// spawn. After startup it watches worker health until shutdown, then walks
// the workers down and reports stragglers.
//
// Teardown policy: a failed worker degrades health but does not kill the
// process; only the input worker staying in Error beyond
// INPUT_ERROR_TEARDOWN forces a full shutdown (without it there is no
// pipeline left to supervise).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::Context;
use tracing::{error, info, warn};

use veilcast_core::config::FilterConfig;
use veilcast_core::consent::ConsentDatabase;
use veilcast_core::queue::BoundedQueue;
use veilcast_core::state::{ConnectionState, Shutdown, WorkerRegistry, WorkerState};

use crate::consent::capture::CaptureSlot;
use crate::consent::manager::{self, ConsentManager};
use crate::consent::watcher;
use crate::mask::{FaceMask, RecognitionGate};
use crate::models;
use crate::workers::{self, spawn_worker, WorkerHandles};

/// Heartbeat staleness bound for is_healthy.
const HEALTH_TIMEOUT: Duration = Duration::from_secs(30);
/// Monitor cadence.
const HEALTH_INTERVAL: Duration = Duration::from_secs(5);
/// Input worker in Error beyond this long tears the process down.
const INPUT_ERROR_TEARDOWN: Duration = Duration::from_secs(30);
/// Per-worker stop deadline; the ASR worker gets a longer drain window.
const STOP_TIMEOUT: Duration = Duration::from_secs(3);
const ASR_STOP_TIMEOUT: Duration = Duration::from_secs(5);

pub fn run(config: FilterConfig, shutdown: Arc<Shutdown>) -> anyhow::Result<()> {
    let registry = Arc::new(WorkerRegistry::new());
    let connection = Arc::new(ConnectionState::new());
    let handles = WorkerHandles { registry: Arc::clone(&registry), shutdown: Arc::clone(&shutdown) };

    // ── Queues and shared slots ───────────────────────────────────────────────
    let op_timeout = config.queues.op_timeout();
    let video_q = Arc::new(BoundedQueue::new(config.queues.video));
    let processed_q = Arc::new(BoundedQueue::new(config.queues.processed));
    let audio_q = Arc::new(BoundedQueue::new(config.queues.audio));
    let vad_q = Arc::new(BoundedQueue::new(config.queues.vad));
    let transcription_q = Arc::new(BoundedQueue::new(config.transcription.queue_capacity));
    let audio_info = Arc::new(Mutex::new(None));
    let capture = Arc::new(CaptureSlot::new());
    let database = Arc::new(ConsentDatabase::new());

    // ── Models (fatal if missing; nothing to run without them) ────────────────
    let video_detector = models::load_detector(&config).context("video face detector")?;
    let gate = if config.face.gate_enabled {
        Some(RecognitionGate {
            recognizer: models::load_recognizer(&config).context("gate face recognizer")?,
            database:   Arc::clone(&database),
        })
    } else {
        None
    };
    let consent_detector = models::load_detector(&config).context("consent face detector")?;
    let consent_recognizer = models::load_recognizer(&config).context("consent face recognizer")?;

    let transcription = config.transcription.enabled;
    let vad_model = if transcription {
        Some(models::load_vad(&config).context("vad model")?)
    } else {
        None
    };
    let transcriber = if transcription {
        Some(models::load_transcriber(&config).context("whisper model")?)
    } else {
        None
    };

    // ── Consent subsystem ─────────────────────────────────────────────────────
    let consent_events = watcher::spawn(
        config.consent.directory.clone(),
        config.consent.poll_interval,
        Arc::clone(&shutdown),
    );
    let consent_manager = ConsentManager::new(
        Arc::clone(&database),
        consent_detector,
        consent_recognizer,
        config.consent.clone(),
    );

    // ── Workers ───────────────────────────────────────────────────────────────
    let mut threads: HashMap<&'static str, JoinHandle<()>> = HashMap::new();

    {
        let ctx = workers::input::InputContext {
            handles: handles.clone(),
            config: config.stream.clone(),
            connection: Arc::clone(&connection),
            video_q: Arc::clone(&video_q),
            audio_q: Arc::clone(&audio_q),
            vad_q: Arc::clone(&vad_q),
            transcription_enabled: transcription,
            audio_info: Arc::clone(&audio_info),
        };
        threads.insert(workers::input::NAME, spawn_worker(workers::input::NAME, &handles, move || workers::input::run(ctx)));
    }

    {
        let ctx = workers::video::VideoContext {
            handles: handles.clone(),
            video_q: Arc::clone(&video_q),
            processed_q: Arc::clone(&processed_q),
            mask: FaceMask::new(video_detector, gate, config.face.clone()),
            capture: Arc::clone(&capture),
            consent: config.consent.clone(),
            padding_ratio: config.face.padding_ratio,
            op_timeout,
        };
        threads.insert(workers::video::NAME, spawn_worker(workers::video::NAME, &handles, move || workers::video::run(ctx)));
    }

    let audio_out_q = Arc::new(BoundedQueue::new(config.queues.audio));
    {
        let ctx = workers::audio::AudioContext {
            handles: handles.clone(),
            audio_q: Arc::clone(&audio_q),
            audio_out_q: Arc::clone(&audio_out_q),
            opus: config.stream.audio_opus,
            op_timeout,
        };
        threads.insert(workers::audio::NAME, spawn_worker(workers::audio::NAME, &handles, move || workers::audio::run(ctx)));
    }

    {
        let ctx = workers::output::OutputContext {
            handles: handles.clone(),
            config: config.stream.clone(),
            connection: Arc::clone(&connection),
            processed_q: Arc::clone(&processed_q),
            audio_out_q: Arc::clone(&audio_out_q),
            audio_info: Arc::clone(&audio_info),
            op_timeout,
        };
        threads.insert(workers::output::NAME, spawn_worker(workers::output::NAME, &handles, move || workers::output::run(ctx)));
    }

    {
        let ctx = manager::ConsentContext {
            handles: handles.clone(),
            manager: consent_manager,
            events: consent_events,
        };
        threads.insert(manager::NAME, spawn_worker(manager::NAME, &handles, move || manager::run(ctx)));
    }

    if let (Some(vad_model), Some(transcriber)) = (vad_model, transcriber) {
        let ctx = workers::vad::VadContext {
            handles: handles.clone(),
            vad_q: Arc::clone(&vad_q),
            transcription_q: Arc::clone(&transcription_q),
            model: vad_model,
            config: config.vad.clone(),
            op_timeout,
        };
        threads.insert(workers::vad::NAME, spawn_worker(workers::vad::NAME, &handles, move || workers::vad::run(ctx)));

        let ctx = workers::asr::AsrContext {
            handles: handles.clone(),
            transcription_q: Arc::clone(&transcription_q),
            transcriber,
            events: None,
            op_timeout,
        };
        threads.insert(workers::asr::NAME, spawn_worker(workers::asr::NAME, &handles, move || workers::asr::run(ctx)));
    }

    info!(workers = threads.len(), "pipeline running");

    // ── Monitor ───────────────────────────────────────────────────────────────
    let mut input_error_since: Option<Instant> = None;
    while !shutdown.wait(HEALTH_INTERVAL) {
        if !registry.all_healthy(HEALTH_TIMEOUT) {
            warn!(states = ?registry.all_states(), "pipeline health degraded");
        }

        match registry.state(workers::input::NAME) {
            Some(WorkerState::Error) => {
                let since = *input_error_since.get_or_insert_with(Instant::now);
                if since.elapsed() >= INPUT_ERROR_TEARDOWN {
                    error!("input worker failed permanently, shutting down");
                    shutdown.trigger();
                }
            }
            _ => input_error_since = None,
        }
    }

    // ── Teardown ──────────────────────────────────────────────────────────────
    info!("stopping workers");
    for name in threads.keys() {
        if registry.state(name) == Some(WorkerState::Running) {
            registry.update_state(name, WorkerState::Stopping);
        }
    }

    for (name, handle) in threads {
        let timeout = if name == workers::asr::NAME { ASR_STOP_TIMEOUT } else { STOP_TIMEOUT };
        if wait_for_terminal(&registry, name, timeout) {
            let _ = handle.join();
        } else {
            // Stuck in a blocking call; mark it and move on rather than
            // hanging the exit.
            warn!(worker = name, "did not stop in time");
            registry.update_state(name, WorkerState::Error);
        }
    }

    info!("all workers stopped");
    Ok(())
}

/// Poll until the worker reaches Stopped or Error, or the deadline passes.
fn wait_for_terminal(registry: &WorkerRegistry, name: &str, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        match registry.state(name) {
            Some(WorkerState::Stopped) | Some(WorkerState::Error) | None => return true,
            _ => std::thread::sleep(Duration::from_millis(50)),
        }
    }
    false
}
