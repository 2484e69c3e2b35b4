//! One filesystem watch per repository metadata directory.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tracing::{trace, warn};

use crate::error::TrackResult;
use crate::tracker::actor::Msg;
use crate::tracker::state::FileHandle;

/// A live watch. Dropping it stops watching.
pub trait RepoWatch: Send {}

/// Creates watches for repository metadata directories.
pub trait WatchBackend: Send + Sync {
    fn watch(&self, repo: &Path, sink: EventSink) -> TrackResult<Box<dyn RepoWatch>>;
}

/// Where a watch delivers raw change notifications for its repository.
#[derive(Debug, Clone)]
pub struct EventSink {
    repo: PathBuf,
    tx: UnboundedSender<Msg>,
}

impl EventSink {
    pub(crate) fn new(repo: PathBuf, tx: UnboundedSender<Msg>) -> Self {
        Self { repo, tx }
    }

    pub fn repo(&self) -> &Path {
        &self.repo
    }

    /// Report that `paths` changed. Safe to call from any thread.
    pub fn notify(&self, paths: Vec<PathBuf>) {
        if self
            .tx
            .send(Msg::FsEvent {
                repo: self.repo.clone(),
                paths,
            })
            .is_err()
        {
            trace!("Tracker gone; dropping event for {}", self.repo.display());
        }
    }
}

/// Transient lock files git creates around every ref or index update.
pub fn is_lock_path(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.ends_with(".lock"))
}

/// `notify`-backed watches.
#[derive(Debug, Default, Clone, Copy)]
pub struct NotifyBackend;

struct NotifyWatch {
    _watcher: RecommendedWatcher,
}

impl RepoWatch for NotifyWatch {}

impl WatchBackend for NotifyBackend {
    #[tracing::instrument(name = "Watching repository", level = "debug", skip(self, sink))]
    fn watch(&self, repo: &Path, sink: EventSink) -> TrackResult<Box<dyn RepoWatch>> {
        let mut watcher = notify::recommended_watcher(
            move |res: Result<Event, notify::Error>| match res {
                // Reads by our own refresh jobs show up as access events.
                Ok(event) if matches!(event.kind, EventKind::Access(_)) => {}
                Ok(event) => sink.notify(event.paths),
                Err(e) => warn!("Watch error for {}: {}", sink.repo().display(), e),
            },
        )?;
        watcher.watch(repo, RecursiveMode::Recursive)?;
        Ok(Box::new(NotifyWatch { _watcher: watcher }))
    }
}

/// Per-repository bookkeeping: the watch, the debounce timer and the files
/// subscribed to it.
pub(crate) struct RepoRecord {
    repo: PathBuf,
    watch: Option<Box<dyn RepoWatch>>,
    timer: Option<JoinHandle<()>>,
    generation: u64,
    pub(crate) subscribers: HashSet<FileHandle>,
}

impl RepoRecord {
    pub(crate) fn new(repo: PathBuf, watch: Option<Box<dyn RepoWatch>>) -> Self {
        Self {
            repo,
            watch,
            timer: None,
            generation: 0,
            subscribers: HashSet::new(),
        }
    }

    pub(crate) fn is_watched(&self) -> bool {
        self.watch.is_some()
    }

    /// Restart the quiet-period timer. Only the newest timer's generation is
    /// honored, so a timer that fired just before being superseded is inert.
    pub(crate) fn restart_timer(&mut self, delay: Duration, tx: UnboundedSender<Msg>) {
        self.generation += 1;
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        let repo = self.repo.clone();
        let generation = self.generation;
        self.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(Msg::Quiescent { repo, generation });
        }));
    }

    /// Consume a timer expiry. True when it belongs to the current window.
    pub(crate) fn take_expiry(&mut self, generation: u64) -> bool {
        if generation != self.generation {
            return false;
        }
        self.timer = None;
        true
    }
}

impl Drop for RepoRecord {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        trace!("Released watch for {}", self.repo.display());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_files_are_transient() {
        assert!(is_lock_path(Path::new("/r/.git/index.lock")));
        assert!(is_lock_path(Path::new("/r/.git/refs/heads/main.lock")));
        assert!(!is_lock_path(Path::new("/r/.git/index")));
        assert!(!is_lock_path(Path::new("/r/.git/locks")));
    }

    #[tokio::test]
    async fn only_newest_timer_counts() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut record = RepoRecord::new(PathBuf::from("/r/.git"), None);
        record.restart_timer(Duration::from_millis(10), tx.clone());
        record.restart_timer(Duration::from_millis(10), tx);

        let Some(Msg::Quiescent { generation, .. }) = rx.recv().await else {
            panic!("expected a timer expiry");
        };
        assert_eq!(generation, 2);
        assert!(!record.take_expiry(1));
        assert!(record.take_expiry(2));
    }
}
