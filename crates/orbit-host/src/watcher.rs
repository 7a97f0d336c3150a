//! Hot reload: watching the extension binary and its child.
//!
//! One thread per loaded extension. It wakes on file-system events for the
//! binary and on a liveness tick:
//!
//! ```text
//! Idle -> CopyDetected -> AwaitingStableSize -> Reloading -> Idle
//! Idle -> ProcessExited -> Reloading -> Idle
//! ```
//!
//! A change is only acted on once the file size is equal across two
//! consecutive polls, so a binary that is still being written is never
//! loaded. A failed reload is retried on the next tick.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded, select, tick, unbounded};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{debug, error, trace, warn};

use crate::binary;
use crate::error::{BridgeError, BridgeResult};
use crate::events::ExtensionEvent;
use crate::process::ExtensionInner;

/// Where the watcher is in handling a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WatchPhase {
    Idle,
    CopyDetected,
    AwaitingStableSize,
    ProcessExited,
    Reloading,
}

/// What the watcher remembers about the binary between changes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct WatchState {
    pub(crate) last_known_size: Option<u64>,
    pub(crate) last_known_hash: String,
}

/// A running watcher thread.
pub(crate) struct WatcherHandle {
    stop_tx: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
    _watcher: RecommendedWatcher,
}

impl WatcherHandle {
    /// Start watching the binary of `extension`.
    pub(crate) fn spawn(extension: &Arc<ExtensionInner>) -> BridgeResult<Self> {
        let origin = extension.origin.clone();
        let dir = origin
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| BridgeError::NotFound(origin.clone()))?;

        let (events_tx, events_rx) = unbounded();
        let mut watcher = RecommendedWatcher::new(
            move |result: notify::Result<Event>| {
                // The receiver is gone once the thread has exited.
                let _ = events_tx.send(result);
            },
            Config::default(),
        )?;
        watcher.watch(&dir, RecursiveMode::NonRecursive)?;

        let (stop_tx, stop_rx) = bounded(1);
        let task = WatchTask {
            extension: Arc::downgrade(extension),
            origin,
            copy_poll_interval: extension.config.copy_poll_interval,
            process_poll_interval: extension.config.process_poll_interval,
            state: WatchState {
                last_known_size: file_size(&extension.origin),
                last_known_hash: extension.content_hash(),
            },
        };
        let thread = thread::Builder::new()
            .name(format!("orbit-watch-{}", extension.label()))
            .spawn(move || task.run(events_rx, stop_rx))?;

        debug!(path = %extension.origin.display(), dir = %dir.display(), "Watching extension binary");
        Ok(Self {
            stop_tx: Some(stop_tx),
            thread: Some(thread),
            _watcher: watcher,
        })
    }

    /// Ask the thread to exit without waiting for it.
    pub(crate) fn signal_stop(&mut self) {
        self.stop_tx.take();
    }

    /// Stop the thread and wait for it to exit.
    pub(crate) fn stop(mut self) {
        self.signal_stop();
        if let Some(thread) = self.thread.take() {
            if thread.thread().id() != thread::current().id() && thread.join().is_err() {
                error!("Watcher thread panicked");
            }
        }
    }
}

struct WatchTask {
    extension: Weak<ExtensionInner>,
    origin: PathBuf,
    copy_poll_interval: Duration,
    process_poll_interval: Duration,
    state: WatchState,
}

impl WatchTask {
    fn run(mut self, events: Receiver<notify::Result<Event>>, stop: Receiver<()>) {
        let ticker = tick(self.process_poll_interval);
        let mut pending_reload = false;

        loop {
            select! {
                recv(stop) -> _ => break,
                recv(events) -> message => match message {
                    Ok(Ok(event)) => {
                        if !self.concerns_binary(&event) {
                            continue;
                        }
                        self.enter(WatchPhase::CopyDetected);
                        match self.await_stable_size(&stop) {
                            Some(size) => {
                                self.state.last_known_size = Some(size);
                                // Everything up to now belongs to this change.
                                while events.try_recv().is_ok() {}
                                pending_reload |= self.changed_since_last_load();
                            }
                            None => break,
                        }
                    }
                    Ok(Err(e)) => warn!(path = %self.origin.display(), error = %e, "Watch error"),
                    Err(_) => break,
                },
                recv(ticker) -> _ => {
                    if self.child_exited() {
                        self.enter(WatchPhase::ProcessExited);
                        if let Some(extension) = self.extension.upgrade() {
                            extension.events.emit(ExtensionEvent::ProcessExited {
                                path: self.origin.clone(),
                            });
                        }
                        pending_reload = true;
                    }
                }
            }

            let Some(extension) = self.extension.upgrade() else {
                break;
            };
            if extension.is_closed() {
                break;
            }
            if pending_reload {
                pending_reload = !self.reload(&extension);
            }
        }

        debug!(path = %self.origin.display(), "Watcher stopped");
    }

    fn enter(&self, phase: WatchPhase) {
        trace!(path = %self.origin.display(), ?phase, "Watch phase");
    }

    fn concerns_binary(&self, event: &Event) -> bool {
        matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_))
            && event.paths.iter().any(|p| p == &self.origin)
    }

    /// Poll the file size until two consecutive samples agree.
    ///
    /// Returns `None` if the watcher was stopped while waiting.
    fn await_stable_size(&self, stop: &Receiver<()>) -> Option<u64> {
        self.enter(WatchPhase::AwaitingStableSize);
        let mut last = file_size(&self.origin);
        loop {
            match stop.recv_timeout(self.copy_poll_interval) {
                Err(RecvTimeoutError::Timeout) => {}
                _ => return None,
            }
            let size = file_size(&self.origin);
            trace!(path = %self.origin.display(), ?size, ?last, "Sampled binary size");
            if let Some(size) = size {
                if Some(size) == last {
                    return Some(size);
                }
            }
            last = size;
        }
    }

    /// Whether the stable binary differs from the build last loaded.
    fn changed_since_last_load(&mut self) -> bool {
        if let Some(extension) = self.extension.upgrade() {
            self.state.last_known_hash = extension.content_hash();
        }
        match binary::hash_file(&self.origin) {
            Ok(hash) if hash == self.state.last_known_hash => {
                debug!(
                    path = %self.origin.display(),
                    size = ?self.state.last_known_size,
                    "Binary unchanged, skipping reload"
                );
                false
            }
            Ok(_) => true,
            Err(e) => {
                warn!(path = %self.origin.display(), error = %e, "Failed to hash binary");
                true
            }
        }
    }

    fn child_exited(&self) -> bool {
        let Some(extension) = self.extension.upgrade() else {
            return false;
        };
        // Skip the check while a writer holds the lock.
        let Some(state) = extension.state.try_read() else {
            return false;
        };
        match state.connection.as_ref() {
            Some(connection) => connection.has_exited(),
            None => false,
        }
    }

    /// Returns whether the reload succeeded.
    fn reload(&mut self, extension: &ExtensionInner) -> bool {
        self.enter(WatchPhase::Reloading);
        let succeeded = match extension.reload() {
            Ok(hash) => {
                self.state.last_known_hash = hash;
                true
            }
            Err(BridgeError::ExtensionClosed) => true,
            Err(e) => {
                error!(path = %self.origin.display(), error = %e, "Reload failed, retrying on next tick");
                extension.events.emit(ExtensionEvent::ReloadFailed {
                    path: self.origin.clone(),
                    reason: e.to_string(),
                });
                false
            }
        };
        self.enter(WatchPhase::Idle);
        succeeded
    }
}

fn file_size(path: &Path) -> Option<u64> {
    fs::metadata(path).ok().map(|m| m.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;

    #[test]
    fn test_stable_size_waits_for_writer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ext");
        fs::write(&path, b"a").unwrap();

        let task = WatchTask {
            extension: Weak::new(),
            origin: path.clone(),
            copy_poll_interval: Duration::from_millis(60),
            process_poll_interval: Duration::from_millis(60),
            state: WatchState::default(),
        };

        let started = Arc::new(Barrier::new(2));
        let writer = {
            let started = Arc::clone(&started);
            thread::spawn(move || {
                fs::write(&path, vec![0u8; 10]).unwrap();
                started.wait();
                for i in 2..=6 {
                    thread::sleep(Duration::from_millis(10));
                    fs::write(&path, vec![0u8; 10 * i]).unwrap();
                }
            })
        };

        started.wait();
        let (_stop_tx, stop_rx) = bounded::<()>(1);
        let size = task.await_stable_size(&stop_rx);
        writer.join().unwrap();

        assert_eq!(size, Some(60));
    }

    #[test]
    fn test_stable_size_stops_on_signal() {
        let dir = tempfile::tempdir().unwrap();
        let task = WatchTask {
            extension: Weak::new(),
            origin: dir.path().join("missing"),
            copy_poll_interval: Duration::from_millis(10),
            process_poll_interval: Duration::from_millis(10),
            state: WatchState::default(),
        };

        let (stop_tx, stop_rx) = bounded::<()>(1);
        drop(stop_tx);
        assert_eq!(task.await_stable_size(&stop_rx), None);
    }

    #[test]
    fn test_unchanged_binary_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ext");
        fs::write(&path, b"build").unwrap();

        let mut task = WatchTask {
            extension: Weak::new(),
            origin: path.clone(),
            copy_poll_interval: Duration::from_millis(10),
            process_poll_interval: Duration::from_millis(10),
            state: WatchState {
                last_known_size: Some(5),
                last_known_hash: binary::hash_file(&path).unwrap(),
            },
        };
        assert!(!task.changed_since_last_load());

        fs::write(&path, b"build 2").unwrap();
        assert!(task.changed_since_last_load());
    }
}
