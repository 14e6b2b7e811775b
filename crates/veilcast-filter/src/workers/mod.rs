// crates/veilcast-filter/src/workers/mod.rs
//
// One module per pipeline worker. Each exposes a NAME and a run(ctx)
// function executed on its own OS thread; libav contexts are created inside
// run() and never cross the thread boundary.

pub mod asr;
pub mod audio;
pub mod input;
pub mod output;
pub mod vad;
pub mod video;

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::error;

use veilcast_core::state::{Shutdown, WorkerRegistry, WorkerState};

/// Shared handles every worker needs.
#[derive(Clone)]
pub struct WorkerHandles {
    pub registry: Arc<WorkerRegistry>,
    pub shutdown: Arc<Shutdown>,
}

/// Spawn a named worker thread. The registry entry is created before the
/// thread starts so health checks see the worker immediately; the closure's
/// Result decides the terminal state (Stopped vs Error).
pub fn spawn_worker<F>(
    name: &'static str,
    handles: &WorkerHandles,
    body: F,
) -> JoinHandle<()>
where
    F: FnOnce() -> anyhow::Result<()> + Send + 'static,
{
    handles.registry.register(name);
    let registry = Arc::clone(&handles.registry);
    thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            registry.update_state(name, WorkerState::Running);
            match body() {
                Ok(()) => registry.update_state(name, WorkerState::Stopped),
                Err(e) => {
                    error!(worker = name, error = %e, "worker failed");
                    registry.update_state(name, WorkerState::Error);
                }
            }
        })
        .expect("spawn worker thread")
}
