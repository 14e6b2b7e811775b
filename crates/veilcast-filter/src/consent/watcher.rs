// crates/veilcast-filter/src/consent/watcher.rs
//
// Polling directory watcher: a cancellable background thread that diffs the
// consent directory every poll interval and reports `.jpg` adds/removes on
// a channel. A modified file (new mtime) reports as Added again, which the
// manager treats as replace-then-insert.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crossbeam_channel::{bounded, Receiver, Sender};
use tracing::{debug, warn};

use veilcast_core::consent::CONSENT_EXTENSION;
use veilcast_core::state::Shutdown;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Added(PathBuf),
    Removed(PathBuf),
}

/// Start watching `dir`. The thread exits when the shutdown flag fires or
/// the receiver is dropped. The initial directory contents do NOT produce
/// events; startup loading is the manager's job.
pub fn spawn(
    dir: PathBuf,
    poll_interval: Duration,
    shutdown: Arc<Shutdown>,
) -> Receiver<WatchEvent> {
    let (tx, rx) = bounded(256);
    std::thread::Builder::new()
        .name("consent-watch".into())
        .spawn(move || poll_loop(&dir, poll_interval, &shutdown, &tx))
        .expect("spawn consent watcher");
    rx
}

fn poll_loop(
    dir: &Path,
    poll_interval: Duration,
    shutdown: &Shutdown,
    tx: &Sender<WatchEvent>,
) {
    let mut seen = scan(dir);

    while !shutdown.wait(poll_interval) {
        let current = scan(dir);

        for (path, mtime) in &current {
            match seen.get(path) {
                None => {
                    debug!(path = %path.display(), "consent file added");
                    if tx.send(WatchEvent::Added(path.clone())).is_err() {
                        return;
                    }
                }
                Some(old) if old != mtime => {
                    debug!(path = %path.display(), "consent file modified");
                    if tx.send(WatchEvent::Added(path.clone())).is_err() {
                        return;
                    }
                }
                Some(_) => {}
            }
        }

        for path in seen.keys() {
            if !current.contains_key(path) {
                debug!(path = %path.display(), "consent file removed");
                if tx.send(WatchEvent::Removed(path.clone())).is_err() {
                    return;
                }
            }
        }

        seen = current;
    }
}

/// Current `.jpg` files and their mtimes. A missing or unreadable directory
/// scans as empty. The manager creates it at startup, and deleting it out
/// from under us just reports every file as removed.
fn scan(dir: &Path) -> HashMap<PathBuf, SystemTime> {
    let mut files = HashMap::new();
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(dir = %dir.display(), error = %e, "consent directory scan failed");
            return files;
        }
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some(CONSENT_EXTENSION) {
            continue;
        }
        if let Ok(metadata) = entry.metadata() {
            let mtime = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            files.insert(path, mtime);
        }
    }
    files
}

#[cfg(test)]
mod tests {
    use super::*;

    const POLL: Duration = Duration::from_millis(10);
    const WAIT: Duration = Duration::from_secs(2);

    #[test]
    fn add_and_remove_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let shutdown = Arc::new(Shutdown::new());
        let rx = spawn(dir.path().to_path_buf(), POLL, Arc::clone(&shutdown));

        let path = dir.path().join("20250101120000_alice.jpg");
        std::fs::write(&path, b"jpeg bytes").unwrap();
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), WatchEvent::Added(path.clone()));

        std::fs::remove_file(&path).unwrap();
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), WatchEvent::Removed(path));

        shutdown.trigger();
    }

    #[test]
    fn non_jpg_files_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let shutdown = Arc::new(Shutdown::new());
        let rx = spawn(dir.path().to_path_buf(), POLL, Arc::clone(&shutdown));

        std::fs::write(dir.path().join("notes.txt"), b"x").unwrap();
        std::fs::write(dir.path().join("image.png"), b"x").unwrap();
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

        shutdown.trigger();
    }

    #[test]
    fn preexisting_files_produce_no_events() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("20250101120000_alice.jpg"), b"x").unwrap();

        let shutdown = Arc::new(Shutdown::new());
        let rx = spawn(dir.path().to_path_buf(), POLL, Arc::clone(&shutdown));
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

        shutdown.trigger();
    }

    #[test]
    fn shutdown_ends_the_stream() {
        let dir = tempfile::tempdir().unwrap();
        let shutdown = Arc::new(Shutdown::new());
        let rx = spawn(dir.path().to_path_buf(), POLL, Arc::clone(&shutdown));

        shutdown.trigger();
        // Sender dropped once the loop exits → channel disconnects.
        assert!(rx.recv_timeout(WAIT).is_err());
    }
}
