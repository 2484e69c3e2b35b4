//! Per-file cache of repository state, kept current by watching each
//! repository's metadata directory.

mod actor;
pub mod state;
pub mod watcher;


use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::config::Settings;
use crate::error::{TrackError, TrackResult};
use crate::git::CommandClass;
use crate::job::{CommandRunner, JobRunner};
use actor::{Actor, Msg};

pub use state::{FileHandle, FileState, Notice, NoticeLevel, TrackerEvent};
pub use watcher::{EventSink, NotifyBackend, RepoWatch, WatchBackend, is_lock_path};

struct Handle {
    tx: mpsc::UnboundedSender<Msg>,
    events: broadcast::Sender<TrackerEvent>,
}

impl Drop for Handle {
    fn drop(&mut self) {
        let _ = self.tx.send(Msg::Shutdown);
    }
}

/// Cloneable handle to the tracker task. The task stops, releasing every
/// watch, when the last clone is dropped.
#[derive(Clone)]
pub struct Tracker {
    inner: Arc<Handle>,
}

impl Tracker {
    /// Start a tracker that runs git through `runner` and watches repositories
    /// through `watches`. Must be called inside a tokio runtime.
    pub fn spawn(
        settings: Settings,
        runner: Arc<dyn CommandRunner>,
        watches: Arc<dyn WatchBackend>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(settings.channel_capacity.max(1));
        let actor = Actor::new(settings, runner, watches, tx.clone(), events.clone());
        tokio::spawn(actor.run(rx));
        Self {
            inner: Arc::new(Handle { tx, events }),
        }
    }

    /// Start a tracker backed by real processes and `notify` watches. Mutating
    /// git commands run through the returned runner also schedule refreshes.
    pub fn start(settings: Settings) -> (Self, JobRunner) {
        let runner = JobRunner::from_settings(&settings);
        let tracker = Self::spawn(settings, Arc::new(runner.clone()), Arc::new(NotifyBackend));
        tracker.observe(&runner);
        (tracker, runner)
    }

    /// Schedule a debounced refresh whenever `runner` finishes a mutating git
    /// command inside a tracked worktree.
    pub fn observe(&self, runner: &JobRunner) -> JoinHandle<()> {
        let mut finished = runner.subscribe();
        let tx = self.inner.tx.clone();
        tokio::spawn(async move {
            loop {
                match finished.recv().await {
                    Ok(done) => {
                        if !CommandClass::classify(&done.argv).is_mutating() {
                            continue;
                        }
                        trace!("Mutating command finished in {}", done.cwd.display());
                        if tx.send(Msg::RepositoryTouched { cwd: done.cwd }).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!("Missed {} finished commands", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    fn send(&self, msg: Msg) -> TrackResult<()> {
        self.inner.tx.send(msg).map_err(|_| TrackError::ChannelClosed)
    }

    /// Begin tracking `path` under `file`. Resolution happens in the
    /// background; a file outside any repository is silently left untracked.
    pub fn enable(&self, file: FileHandle, path: impl Into<PathBuf>) -> TrackResult<()> {
        self.send(Msg::Enable {
            file,
            path: path.into(),
        })
    }

    /// Stop tracking `file`. Releases its repository watch if it was the last
    /// subscriber.
    pub fn disable(&self, file: FileHandle) -> TrackResult<()> {
        self.send(Msg::Disable { file })
    }

    /// The file now lives at `path`; re-resolve its repository.
    pub fn notify_renamed(&self, file: FileHandle, path: impl Into<PathBuf>) -> TrackResult<()> {
        self.send(Msg::Renamed {
            file,
            path: path.into(),
        })
    }

    /// The file was saved; refresh its status.
    pub fn notify_written(&self, file: FileHandle) -> TrackResult<()> {
        self.send(Msg::Written { file })
    }

    /// Snapshot of `file`'s state, or `None` unless it is tracked.
    pub async fn state(&self, file: FileHandle) -> TrackResult<Option<FileState>> {
        let (reply, rx) = oneshot::channel();
        self.send(Msg::State { file, reply })?;
        rx.await.map_err(|_| TrackError::ChannelClosed)
    }

    /// Handles of every tracked file, in ascending order.
    pub async fn tracked(&self) -> TrackResult<Vec<FileHandle>> {
        let (reply, rx) = oneshot::channel();
        self.send(Msg::Tracked { reply })?;
        rx.await.map_err(|_| TrackError::ChannelClosed)
    }

    /// Receive state updates and notices published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<TrackerEvent> {
        self.inner.events.subscribe()
    }

    /// Stop the tracker now instead of when the last handle drops.
    pub fn shutdown(&self) {
        let _ = self.inner.tx.send(Msg::Shutdown);
    }
}
