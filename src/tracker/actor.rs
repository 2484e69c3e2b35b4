//! The single consumer that owns every FileState and RepoRecord.
//!
//! Public calls, job completions, watch events and debounce expiries all
//! arrive as [`Msg`]s on one channel, so state is only ever touched from
//! [`Actor::run`].

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, trace, warn};

use crate::config::Settings;
use crate::error::TrackError;
use crate::git::output::parse_status_z;
use crate::git::{Git, Head, InProgress, RepoPaths, StatusCode};
use crate::job::CommandRunner;
use crate::tracker::state::{FileHandle, FileState, Notice, TrackerEvent};
use crate::tracker::watcher::{EventSink, RepoRecord, WatchBackend, is_lock_path};

#[derive(Debug)]
pub(crate) enum Msg {
    Enable {
        file: FileHandle,
        path: PathBuf,
    },
    Disable {
        file: FileHandle,
    },
    Renamed {
        file: FileHandle,
        path: PathBuf,
    },
    Written {
        file: FileHandle,
    },
    State {
        file: FileHandle,
        reply: oneshot::Sender<Option<FileState>>,
    },
    Tracked {
        reply: oneshot::Sender<Vec<FileHandle>>,
    },
    Resolved {
        file: FileHandle,
        epoch: u64,
        path: PathBuf,
        paths: Option<RepoPaths>,
    },
    HeadRead {
        repo: PathBuf,
        root: PathBuf,
        seq: u64,
        outcome: Result<Head, Notice>,
    },
    InProgressRead {
        repo: PathBuf,
        seq: u64,
        in_progress: InProgress,
    },
    StatusRead {
        root: PathBuf,
        seq: u64,
        requested: Vec<PathBuf>,
        outcome: Result<HashMap<PathBuf, StatusCode>, Notice>,
    },
    FsEvent {
        repo: PathBuf,
        paths: Vec<PathBuf>,
    },
    Quiescent {
        repo: PathBuf,
        generation: u64,
    },
    RepositoryTouched {
        cwd: PathBuf,
    },
    Shutdown,
}

enum Entry {
    /// Waiting on root/repo resolution started by the enable with this epoch.
    Resolving { epoch: u64 },
    Tracked(FileState),
}

/// The kinds of refresh whose results are ordered. HEAD and status are keyed
/// by worktree root, in-progress markers by repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Refresh {
    Head,
    InProgress,
    Status,
}

#[derive(Debug, Default)]
struct Sequence {
    issued: u64,
    applied: u64,
}

pub(crate) struct Actor {
    settings: Arc<Settings>,
    runner: Arc<dyn CommandRunner>,
    watches: Arc<dyn WatchBackend>,
    tx: mpsc::UnboundedSender<Msg>,
    events: broadcast::Sender<TrackerEvent>,
    files: HashMap<FileHandle, Entry>,
    repos: HashMap<PathBuf, RepoRecord>,
    sequences: HashMap<(Refresh, PathBuf), Sequence>,
    epoch: u64,
}

impl Actor {
    pub(crate) fn new(
        settings: Settings,
        runner: Arc<dyn CommandRunner>,
        watches: Arc<dyn WatchBackend>,
        tx: mpsc::UnboundedSender<Msg>,
        events: broadcast::Sender<TrackerEvent>,
    ) -> Self {
        Self {
            settings: Arc::new(settings),
            runner,
            watches,
            tx,
            events,
            files: HashMap::new(),
            repos: HashMap::new(),
            sequences: HashMap::new(),
            epoch: 0,
        }
    }

    pub(crate) async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Msg>) {
        while let Some(msg) = rx.recv().await {
            trace!("Handling {:?}", msg);
            match msg {
                Msg::Enable { file, path } => self.enable(file, path),
                Msg::Disable { file } => self.disable(file),
                Msg::Renamed { file, path } => {
                    self.disable(file);
                    self.enable(file, path);
                }
                Msg::Written { file } => self.written(file),
                Msg::State { file, reply } => {
                    let _ = reply.send(self.tracked_state(file).cloned());
                }
                Msg::Tracked { reply } => {
                    let mut tracked: Vec<_> = self
                        .files
                        .iter()
                        .filter(|(_, entry)| matches!(entry, Entry::Tracked(_)))
                        .map(|(file, _)| *file)
                        .collect();
                    tracked.sort();
                    let _ = reply.send(tracked);
                }
                Msg::Resolved {
                    file,
                    epoch,
                    path,
                    paths,
                } => self.resolved(file, epoch, path, paths),
                Msg::HeadRead {
                    repo,
                    root,
                    seq,
                    outcome,
                } => self.head_read(repo, root, seq, outcome),
                Msg::InProgressRead {
                    repo,
                    seq,
                    in_progress,
                } => {
                    if self.accept(Refresh::InProgress, &repo, seq) {
                        self.merge(
                            |state| state.repo == repo,
                            |state| state.in_progress = in_progress.clone(),
                        );
                    }
                }
                Msg::StatusRead {
                    root,
                    seq,
                    requested,
                    outcome,
                } => self.status_read(root, seq, requested, outcome),
                Msg::FsEvent { repo, paths } => self.fs_event(repo, paths),
                Msg::Quiescent { repo, generation } => {
                    let current = self
                        .repos
                        .get_mut(&repo)
                        .is_some_and(|record| record.take_expiry(generation));
                    if current {
                        self.refresh_repository(&repo);
                    }
                }
                Msg::RepositoryTouched { cwd } => self.repository_touched(&cwd),
                Msg::Shutdown => break,
            }
        }
        debug!("Tracker stopped; releasing {} watches", self.repos.len());
    }

    fn tracked_state(&self, file: FileHandle) -> Option<&FileState> {
        match self.files.get(&file) {
            Some(Entry::Tracked(state)) => Some(state),
            _ => None,
        }
    }

    #[tracing::instrument(level = "debug", skip(self))]
    fn enable(&mut self, file: FileHandle, path: PathBuf) {
        if !self.settings.enabled || self.files.contains_key(&file) {
            return;
        }
        self.epoch += 1;
        let epoch = self.epoch;
        self.files.insert(file, Entry::Resolving { epoch });

        let settings = self.settings.clone();
        let runner = self.runner.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let path = canonical_file_path(&path).await;
            let dir = path.parent().unwrap_or(Path::new(".")).to_path_buf();
            let result = runner.execute(Git::new(&settings).resolve_repo(&dir)).await;
            let paths = if result.success() {
                RepoPaths::parse(&result.stdout)
            } else {
                None
            };
            if paths.is_none() {
                debug!("{}", TrackError::NotInRepository(path.clone()));
            }
            let _ = tx.send(Msg::Resolved {
                file,
                epoch,
                path,
                paths,
            });
        });
    }

    fn resolved(&mut self, file: FileHandle, epoch: u64, path: PathBuf, paths: Option<RepoPaths>) {
        match self.files.get(&file) {
            Some(Entry::Resolving { epoch: pending }) if *pending == epoch => {}
            _ => {
                trace!("Dropping stale resolution for {}", file);
                return;
            }
        }
        let Some(paths) = paths else {
            self.files.remove(&file);
            return;
        };

        info!("Tracking {} in {}", path.display(), paths.root.display());
        let state = FileState::new(file, path, paths);
        let (repo, root) = (state.repo.clone(), state.root.clone());
        self.files.insert(file, Entry::Tracked(state));
        self.subscribe(&repo, file);

        self.refresh_head(&repo, &root);
        self.refresh_in_progress(&repo);
        self.refresh_status(&root);
    }

    #[tracing::instrument(level = "debug", skip(self))]
    fn disable(&mut self, file: FileHandle) {
        if let Some(Entry::Tracked(state)) = self.files.remove(&file) {
            self.unsubscribe(&state.repo, file);
        }
    }

    fn written(&mut self, file: FileHandle) {
        if let Some(root) = self.tracked_state(file).map(|state| state.root.clone()) {
            self.refresh_status(&root);
        }
    }

    fn subscribe(&mut self, repo: &Path, file: FileHandle) {
        if !self.repos.contains_key(repo) {
            let sink = EventSink::new(repo.to_path_buf(), self.tx.clone());
            let watch = match self.watches.watch(repo, sink) {
                Ok(watch) => Some(watch),
                Err(e) => {
                    self.notice(Notice::from(&e));
                    None
                }
            };
            self.repos
                .insert(repo.to_path_buf(), RepoRecord::new(repo.to_path_buf(), watch));
        }
        if let Some(record) = self.repos.get_mut(repo) {
            record.subscribers.insert(file);
        }
    }

    fn unsubscribe(&mut self, repo: &Path, file: FileHandle) {
        let Some(record) = self.repos.get_mut(repo) else {
            return;
        };
        record.subscribers.remove(&file);
        if record.subscribers.is_empty() {
            // Removal from the map is the one place a record is torn down.
            if let Some(record) = self.repos.remove(repo) {
                debug!(
                    "Last subscriber left {}; watched: {}",
                    repo.display(),
                    record.is_watched()
                );
            }
        }
    }

    fn fs_event(&mut self, repo: PathBuf, paths: Vec<PathBuf>) {
        if !paths.is_empty() && paths.iter().all(|p| is_lock_path(p)) {
            return;
        }
        let delay = self.settings.debounce;
        if let Some(record) = self.repos.get_mut(&repo) {
            record.restart_timer(delay, self.tx.clone());
        }
    }

    fn repository_touched(&mut self, cwd: &Path) {
        let mut repos: BTreeSet<PathBuf> = BTreeSet::new();
        for entry in self.files.values() {
            if let Entry::Tracked(state) = entry
                && cwd.starts_with(&state.root)
            {
                repos.insert(state.repo.clone());
            }
        }
        let delay = self.settings.debounce;
        for repo in repos {
            if let Some(record) = self.repos.get_mut(&repo) {
                record.restart_timer(delay, self.tx.clone());
            }
        }
    }

    /// One pass per quiet period: markers once for the repository, HEAD and
    /// status once per distinct worktree root.
    #[tracing::instrument(level = "debug", skip(self))]
    fn refresh_repository(&mut self, repo: &Path) {
        let roots: BTreeSet<PathBuf> = self
            .files
            .values()
            .filter_map(|entry| match entry {
                Entry::Tracked(state) if state.repo == repo => Some(state.root.clone()),
                _ => None,
            })
            .collect();
        if roots.is_empty() {
            return;
        }
        self.refresh_in_progress(repo);
        for root in &roots {
            self.refresh_head(repo, root);
            self.refresh_status(root);
        }
    }

    fn refresh_head(&mut self, repo: &Path, root: &Path) {
        let seq = self.issue(Refresh::Head, root);
        let job = Git::new(&self.settings).read_head(root);
        let runner = self.runner.clone();
        let tx = self.tx.clone();
        let (repo, root) = (repo.to_path_buf(), root.to_path_buf());
        tokio::spawn(async move {
            let argv = job.display_argv();
            let outcome = runner
                .execute(job.clone())
                .await
                .into_checked(&job)
                .and_then(|result| {
                    Head::parse(&result.stdout)
                        .map_err(|reason| TrackError::ParseFailure { argv, reason })
                })
                .map_err(Notice::from);
            let _ = tx.send(Msg::HeadRead {
                repo,
                root,
                seq,
                outcome,
            });
        });
    }

    fn refresh_in_progress(&mut self, repo: &Path) {
        let seq = self.issue(Refresh::InProgress, repo);
        let tx = self.tx.clone();
        let repo = repo.to_path_buf();
        tokio::spawn(async move {
            let in_progress = InProgress::detect(&repo).await;
            let _ = tx.send(Msg::InProgressRead {
                repo,
                seq,
                in_progress,
            });
        });
    }

    fn refresh_status(&mut self, root: &Path) {
        let mut requested: Vec<PathBuf> = self
            .files
            .values()
            .filter_map(|entry| match entry {
                Entry::Tracked(state) if state.root == root => {
                    state.relative_path().map(Path::to_path_buf)
                }
                _ => None,
            })
            .collect();
        if requested.is_empty() {
            return;
        }
        requested.sort();
        requested.dedup();

        let seq = self.issue(Refresh::Status, root);
        let job = Git::new(&self.settings).status(root, &requested);
        let runner = self.runner.clone();
        let tx = self.tx.clone();
        let root = root.to_path_buf();
        tokio::spawn(async move {
            let argv = job.display_argv();
            let outcome = runner
                .execute(job.clone())
                .await
                .into_checked(&job)
                .and_then(|result| {
                    parse_status_z(&result.stdout)
                        .map_err(|reason| TrackError::ParseFailure { argv, reason })
                })
                .map_err(Notice::from);
            let _ = tx.send(Msg::StatusRead {
                root,
                seq,
                requested,
                outcome,
            });
        });
    }

    fn head_read(
        &mut self,
        repo: PathBuf,
        root: PathBuf,
        seq: u64,
        outcome: Result<Head, Notice>,
    ) {
        if !self.accept(Refresh::Head, &root, seq) {
            return;
        }
        match outcome {
            Ok(head) => self.merge(
                |state| state.repo == repo && state.root == root,
                |state| state.apply_head(&head),
            ),
            Err(notice) => self.notice(notice),
        }
    }

    /// Files that were requested but absent from the output are clean.
    fn status_read(
        &mut self,
        root: PathBuf,
        seq: u64,
        requested: Vec<PathBuf>,
        outcome: Result<HashMap<PathBuf, StatusCode>, Notice>,
    ) {
        if !self.accept(Refresh::Status, &root, seq) {
            return;
        }
        match outcome {
            Ok(codes) => self.merge(
                |state| {
                    state.root == root
                        && state
                            .relative_path()
                            .is_some_and(|rel| requested.iter().any(|r| r == rel))
                },
                |state| {
                    let code = state
                        .relative_path()
                        .and_then(|rel| codes.get(rel).copied())
                        .unwrap_or(StatusCode::UNMODIFIED);
                    state.status = Some(code);
                },
            ),
            Err(notice) => self.notice(notice),
        }
    }

    fn issue(&mut self, kind: Refresh, key: &Path) -> u64 {
        let sequence = self.sequences.entry((kind, key.to_path_buf())).or_default();
        sequence.issued += 1;
        sequence.issued
    }

    /// Whether a completed refresh should be applied: something still tracks
    /// its key and nothing issued after it has been applied already.
    fn accept(&mut self, kind: Refresh, key: &Path, seq: u64) -> bool {
        let tracked = self.files.values().any(|entry| match (entry, kind) {
            (Entry::Tracked(state), Refresh::InProgress) => state.repo == key,
            (Entry::Tracked(state), _) => state.root == key,
            _ => false,
        });
        let current = self
            .sequences
            .get_mut(&(kind, key.to_path_buf()))
            .filter(|sequence| tracked && seq > sequence.applied);
        match current {
            Some(sequence) => {
                sequence.applied = seq;
                true
            }
            None => {
                trace!("Dropping stale {:?} result #{} for {}", kind, seq, key.display());
                false
            }
        }
    }

    /// Apply `update` to every tracked file matching `select`, then announce
    /// each touched file. Fields outside `update` keep their last value.
    fn merge<S, U>(&mut self, select: S, mut update: U)
    where
        S: Fn(&FileState) -> bool,
        U: FnMut(&mut FileState),
    {
        let mut touched = Vec::new();
        for entry in self.files.values_mut() {
            if let Entry::Tracked(state) = entry
                && select(state)
            {
                update(state);
                touched.push(state.clone());
            }
        }
        touched.sort_by_key(|state| state.file);
        for state in touched {
            let _ = self.events.send(TrackerEvent::StateUpdated(state));
        }
    }

    fn notice(&self, notice: Notice) {
        warn!("{}", notice.message);
        let _ = self.events.send(TrackerEvent::Notice(notice));
    }
}

/// Canonicalize the file's directory so its path lines up with the root git
/// reports. The file itself may not exist yet.
async fn canonical_file_path(path: &Path) -> PathBuf {
    let (Some(dir), Some(name)) = (path.parent(), path.file_name()) else {
        return path.to_path_buf();
    };
    let dir = if dir.as_os_str().is_empty() {
        Path::new(".")
    } else {
        dir
    };
    match tokio::fs::canonicalize(dir).await {
        Ok(dir) => dir.join(name),
        Err(_) => path.to_path_buf(),
    }
}
