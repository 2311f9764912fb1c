//! Directory watcher that rebuilds the shard index when new message shards appear.
//! Bursts of events are coalesced by the debouncer into a single rebuild.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use chatlog_core::{CancellationToken, Role};
use notify::event::ModifyKind;
use notify::{EventKind, RecommendedWatcher, RecursiveMode};
use notify_debouncer_full::{new_debouncer, DebounceEventResult, Debouncer, RecommendedCache};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::error::StoreError;
use crate::router::TimelineRouter;

/// Default debounce duration for file events
pub const DEBOUNCE_DURATION: Duration = Duration::from_secs(1);

const POLL_INTERVAL: Duration = Duration::from_millis(250);
const EVENT_CAPACITY: usize = 100;

#[derive(Debug, Error)]
pub enum WatcherError {
    #[error("Watcher error: {0}")]
    Notify(#[from] notify::Error),
    #[error("Path not found: {}", .0.display())]
    PathNotFound(PathBuf),
    #[error("Watcher already running")]
    AlreadyRunning,
    #[error("failed to spawn watcher thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("watcher thread exited during startup")]
    Startup,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WatchEvent {
    ShardDetected { path: PathBuf },
    IndexRebuilt { shards: usize, skipped: usize },
    RebuildFailed { error: String },
}

type ShardDebouncer = Debouncer<RecommendedWatcher, RecommendedCache>;

pub struct ChangeWatcher {
    router: Arc<TimelineRouter>,
    base_dir: PathBuf,
    debounce: Duration,
    running: Arc<AtomicBool>,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl ChangeWatcher {
    /// # Errors
    /// Returns [`WatcherError::PathNotFound`] when the router's base directory does not exist.
    pub fn new(router: Arc<TimelineRouter>) -> Result<Self, WatcherError> {
        let base_dir = router
            .base_dir()
            .canonicalize()
            .map_err(|_| WatcherError::PathNotFound(router.base_dir().to_path_buf()))?;

        Ok(Self {
            router,
            base_dir,
            debounce: DEBOUNCE_DURATION,
            running: Arc::new(AtomicBool::new(false)),
            cancel: CancellationToken::new(),
            handle: None,
        })
    }

    #[must_use]
    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Start watching on a background thread. Returns once the watch is registered.
    ///
    /// # Errors
    /// Fails when already running or when the platform watcher cannot be created.
    pub fn start(&mut self) -> Result<mpsc::Receiver<WatchEvent>, WatcherError> {
        if self.is_running() {
            return Err(WatcherError::AlreadyRunning);
        }

        let (tx, rx) = mpsc::channel(EVENT_CAPACITY);
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();
        self.running.store(true, Ordering::Relaxed);
        self.cancel = CancellationToken::new();

        let worker = WatchLoop {
            router: self.router.clone(),
            base_dir: self.base_dir.clone(),
            tx,
            running: self.running.clone(),
            cancel: self.cancel.clone(),
        };
        let debounce = self.debounce;
        let spawned = std::thread::Builder::new()
            .name("chatlog-watcher".into())
            .spawn(move || worker.run(debounce, &ready_tx));

        let handle = match spawned {
            Ok(handle) => handle,
            Err(err) => {
                self.running.store(false, Ordering::Relaxed);
                return Err(WatcherError::Spawn(err));
            }
        };

        match ready_rx.recv() {
            Ok(Ok(())) => {
                self.handle = Some(handle);
                Ok(rx)
            }
            Ok(Err(err)) => {
                self.running.store(false, Ordering::Relaxed);
                let _ = handle.join();
                Err(err)
            }
            Err(_) => {
                self.running.store(false, Ordering::Relaxed);
                let _ = handle.join();
                Err(WatcherError::Startup)
            }
        }
    }

    /// Stop watching and wait for the background thread. An in-flight rebuild is cancelled and
    /// leaves the previous index in place.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::warn!("Watcher thread panicked");
            }
        }
    }
}

impl Drop for ChangeWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

struct WatchLoop {
    router: Arc<TimelineRouter>,
    base_dir: PathBuf,
    tx: mpsc::Sender<WatchEvent>,
    running: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl WatchLoop {
    fn run(self, debounce: Duration, ready: &std::sync::mpsc::Sender<Result<(), WatcherError>>) {
        let (debounce_tx, debounce_rx) = std::sync::mpsc::channel::<DebounceEventResult>();
        let setup = new_debouncer(debounce, None, debounce_tx)
            .and_then(|mut debouncer| {
                debouncer.watch(&self.base_dir, RecursiveMode::NonRecursive)?;
                Ok(debouncer)
            });
        let mut debouncer = match setup {
            Ok(debouncer) => {
                let _ = ready.send(Ok(()));
                debouncer
            }
            Err(err) => {
                let _ = ready.send(Err(err.into()));
                return;
            }
        };

        let message_dir = self.base_dir.join(Role::Message.subdir());
        let mut watching_subdir = watch_dir(&mut debouncer, &message_dir);

        while self.running.load(Ordering::Relaxed) {
            match debounce_rx.recv_timeout(POLL_INTERVAL) {
                Ok(Ok(events)) => {
                    let mut rebuild = false;
                    for path in events
                        .iter()
                        .filter(|event| is_creation(&event.kind))
                        .flat_map(|event| event.paths.iter())
                    {
                        if !watching_subdir && *path == message_dir {
                            watching_subdir = watch_dir(&mut debouncer, &message_dir);
                            rebuild = true;
                        } else if self.router.naming().serves(path, Role::Message) {
                            tracing::debug!("Shard detected: {}", path.display());
                            self.emit(WatchEvent::ShardDetected { path: path.clone() });
                            rebuild = true;
                        }
                    }
                    if rebuild && !self.rebuild() {
                        break;
                    }
                }
                Ok(Err(errors)) => {
                    for error in errors {
                        tracing::warn!("Watcher error: {error}");
                    }
                }
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => continue,
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
            }
        }
    }

    /// Returns `false` when the rebuild was cancelled by `stop`.
    fn rebuild(&self) -> bool {
        let event = match self.router.rebuild_index(&self.cancel) {
            Ok(report) => WatchEvent::IndexRebuilt {
                shards: report.loaded,
                skipped: report.skipped.len(),
            },
            Err(StoreError::Cancelled) => return false,
            Err(err) => {
                tracing::warn!("Index rebuild failed: {err}");
                WatchEvent::RebuildFailed { error: err.to_string() }
            }
        };
        self.emit(event);
        true
    }

    fn emit(&self, event: WatchEvent) {
        // Non-blocking send; a slow consumer loses events, not rebuilds.
        let _ = self.tx.try_send(event);
    }
}

fn watch_dir(debouncer: &mut ShardDebouncer, dir: &Path) -> bool {
    if !dir.is_dir() {
        return false;
    }
    match debouncer.watch(dir, RecursiveMode::NonRecursive) {
        Ok(()) => true,
        Err(err) => {
            tracing::warn!("Cannot watch {}: {err}", dir.display());
            false
        }
    }
}

/// Atomic writers rename into place, so a rename counts as a creation.
fn is_creation(kind: &EventKind) -> bool {
    matches!(kind, EventKind::Create(_) | EventKind::Modify(ModifyKind::Name(_)))
}
