// crates/veilcast-core/src/state.rs
//
// Shared pipeline state: the process-wide shutdown flag, per-worker
// state/heartbeat registry, and the input/output connection snapshot.
// All mutation goes through the owning methods; readers get copies.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{debug, info};

// ── Shutdown flag ─────────────────────────────────────────────────────────────

/// Process-wide stop signal. Set once (SIGINT or fatal supervisor decision),
/// observed by every worker at its loop boundaries.
#[derive(Default)]
pub struct Shutdown {
    flag: AtomicBool,
    gate: Mutex<()>,
    cvar: Condvar,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
        let _guard = self.gate.lock().unwrap();
        self.cvar.notify_all();
    }

    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Sleep up to `timeout`, waking early if shutdown fires. Returns true
    /// when shutdown is set. Used between reconnect attempts so the input
    /// worker's backoff never delays process exit.
    ///
    /// The flag is re-checked under the gate lock before parking: trigger()
    /// stores the flag and then takes the same lock to notify, so a trigger
    /// racing the start of this call cannot slip its wakeup between our
    /// check and the wait.
    pub fn wait(&self, timeout: Duration) -> bool {
        let guard = self.gate.lock().unwrap();
        if self.is_set() {
            return true;
        }
        let (_guard, _result) = self
            .cvar
            .wait_timeout_while(guard, timeout, |_| !self.is_set())
            .unwrap();
        self.is_set()
    }
}

// ── Worker states ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Running,
    Stopping,
    Stopped,
    Error,
}

impl WorkerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerState::Idle => "idle",
            WorkerState::Running => "running",
            WorkerState::Stopping => "stopping",
            WorkerState::Stopped => "stopped",
            WorkerState::Error => "error",
        }
    }
}

struct WorkerEntry {
    state:          WorkerState,
    last_heartbeat: Instant,
}

/// Registry of worker liveness, owned by the supervisor and shared with
/// every worker. Heartbeats are cheap timestamp writes under the lock.
#[derive(Default)]
pub struct WorkerRegistry {
    entries: Mutex<HashMap<String, WorkerEntry>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: &str) {
        let mut entries = self.entries.lock().unwrap();
        entries.insert(
            name.to_string(),
            WorkerEntry { state: WorkerState::Idle, last_heartbeat: Instant::now() },
        );
        debug!(worker = name, "registered worker");
    }

    pub fn update_state(&self, name: &str, state: WorkerState) {
        let mut entries = self.entries.lock().unwrap();
        if let Some(entry) = entries.get_mut(name) {
            let old = entry.state;
            entry.state = state;
            entry.last_heartbeat = Instant::now();
            if old != state {
                info!(worker = name, from = old.as_str(), to = state.as_str(), "worker state");
            }
        }
    }

    pub fn heartbeat(&self, name: &str) {
        let mut entries = self.entries.lock().unwrap();
        if let Some(entry) = entries.get_mut(name) {
            entry.last_heartbeat = Instant::now();
        }
    }

    pub fn state(&self, name: &str) -> Option<WorkerState> {
        self.entries.lock().unwrap().get(name).map(|e| e.state)
    }

    pub fn all_states(&self) -> Vec<(String, WorkerState)> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .map(|(name, entry)| (name.clone(), entry.state))
            .collect()
    }

    /// A worker is healthy when its heartbeat is fresh and it is neither
    /// errored nor stopped.
    pub fn is_healthy(&self, name: &str, timeout: Duration) -> bool {
        let entries = self.entries.lock().unwrap();
        match entries.get(name) {
            Some(entry) => {
                entry.last_heartbeat.elapsed() < timeout
                    && entry.state != WorkerState::Error
                    && entry.state != WorkerState::Stopped
            }
            None => false,
        }
    }

    pub fn all_healthy(&self, timeout: Duration) -> bool {
        let entries = self.entries.lock().unwrap();
        entries.iter().all(|(_, entry)| {
            entry.last_heartbeat.elapsed() < timeout
                && entry.state != WorkerState::Error
                && entry.state != WorkerState::Stopped
        })
    }

}

// ── Connection state ──────────────────────────────────────────────────────────

#[derive(Default)]
struct ConnectionInner {
    input_connected:     bool,
    output_connected:    bool,
    input_connect_time:  Option<Instant>,
    output_connect_time: Option<Instant>,
    stream_metadata:     HashMap<String, Value>,
}

/// Input/output endpoint status plus the probed stream metadata
/// (codec names, dimensions, framerate, sample rate, channels).
#[derive(Default)]
pub struct ConnectionState {
    inner: Mutex<ConnectionInner>,
}

impl ConnectionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_input_connected(&self, connected: bool, metadata: Option<HashMap<String, Value>>) {
        let mut inner = self.inner.lock().unwrap();
        inner.input_connected = connected;
        if connected {
            inner.input_connect_time = Some(Instant::now());
            if let Some(metadata) = metadata {
                inner.stream_metadata.extend(metadata);
            }
            info!(metadata = ?inner.stream_metadata, "input connected");
        } else {
            inner.input_connect_time = None;
            inner.stream_metadata.clear();
            info!("input disconnected");
        }
    }

    pub fn set_output_connected(&self, connected: bool) {
        let mut inner = self.inner.lock().unwrap();
        inner.output_connected = connected;
        if connected {
            inner.output_connect_time = Some(Instant::now());
            info!("output connected");
        } else {
            inner.output_connect_time = None;
            info!("output disconnected");
        }
    }

    pub fn is_input_connected(&self) -> bool {
        self.inner.lock().unwrap().input_connected
    }

    pub fn is_output_connected(&self) -> bool {
        self.inner.lock().unwrap().output_connected
    }

    pub fn is_connected(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.input_connected && inner.output_connected
    }

    pub fn stream_metadata(&self) -> HashMap<String, Value> {
        self.inner.lock().unwrap().stream_metadata.clone()
    }

    /// Duration both endpoints have been up, measured from the later of the
    /// two connect times.
    pub fn connection_duration(&self) -> Option<Duration> {
        let inner = self.inner.lock().unwrap();
        match (inner.input_connect_time, inner.output_connect_time) {
            (Some(input), Some(output)) => Some(input.max(output).elapsed()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_worker_is_healthy() {
        let registry = WorkerRegistry::new();
        registry.register("input");
        registry.update_state("input", WorkerState::Running);
        assert!(registry.is_healthy("input", Duration::from_secs(30)));
        assert!(registry.all_healthy(Duration::from_secs(30)));
    }

    #[test]
    fn errored_worker_is_unhealthy_despite_fresh_heartbeat() {
        let registry = WorkerRegistry::new();
        registry.register("video");
        registry.update_state("video", WorkerState::Error);
        assert!(!registry.is_healthy("video", Duration::from_secs(30)));
        assert!(!registry.all_healthy(Duration::from_secs(30)));
    }

    #[test]
    fn stale_heartbeat_is_unhealthy() {
        let registry = WorkerRegistry::new();
        registry.register("audio");
        registry.update_state("audio", WorkerState::Running);
        std::thread::sleep(Duration::from_millis(20));
        assert!(!registry.is_healthy("audio", Duration::from_millis(5)));
        registry.heartbeat("audio");
        assert!(registry.is_healthy("audio", Duration::from_millis(5)));
    }

    #[test]
    fn unknown_worker_is_unhealthy() {
        let registry = WorkerRegistry::new();
        assert!(!registry.is_healthy("ghost", Duration::from_secs(30)));
    }

    #[test]
    fn metadata_cleared_on_disconnect() {
        let state = ConnectionState::new();
        let mut metadata = HashMap::new();
        metadata.insert("video_codec".to_string(), Value::from("h264"));
        state.set_input_connected(true, Some(metadata));
        assert!(state.is_input_connected());
        assert_eq!(state.stream_metadata().get("video_codec"), Some(&Value::from("h264")));

        state.set_input_connected(false, None);
        assert!(!state.is_input_connected());
        assert!(state.stream_metadata().is_empty());
    }

    #[test]
    fn shutdown_wait_returns_early_when_triggered() {
        let shutdown = std::sync::Arc::new(Shutdown::new());
        let waiter = {
            let shutdown = std::sync::Arc::clone(&shutdown);
            std::thread::spawn(move || {
                let started = Instant::now();
                assert!(shutdown.wait(Duration::from_secs(10)));
                started.elapsed()
            })
        };
        std::thread::sleep(Duration::from_millis(20));
        shutdown.trigger();
        let waited = waiter.join().unwrap();
        assert!(waited < Duration::from_secs(5), "woke early on trigger");
    }

    #[test]
    fn shutdown_wait_after_trigger_does_not_sleep() {
        let shutdown = Shutdown::new();
        shutdown.trigger();
        let started = Instant::now();
        assert!(shutdown.wait(Duration::from_secs(10)));
        assert!(started.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn trigger_racing_wait_start_does_not_lose_the_wakeup() {
        // Trigger immediately, with no sleep, so some iterations land in the
        // window between wait() entering and the waiter parking. The flag
        // check under the gate lock must catch those.
        for _ in 0..50 {
            let shutdown = std::sync::Arc::new(Shutdown::new());
            let waiter = {
                let shutdown = std::sync::Arc::clone(&shutdown);
                std::thread::spawn(move || {
                    let started = Instant::now();
                    assert!(shutdown.wait(Duration::from_secs(5)));
                    started.elapsed()
                })
            };
            shutdown.trigger();
            let waited = waiter.join().unwrap();
            assert!(waited < Duration::from_secs(1), "wakeup lost, waited {waited:?}");
        }
    }
}
