use std::fmt::Display;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::TrackError;
use crate::git::{Head, InProgress, RepoPaths, StatusCode};

/// Opaque caller-chosen identifier for a tracked file (an editor buffer
/// number, for instance).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileHandle(pub u64);

impl Display for FileHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Cached projection of repository truth for one tracked file.
///
/// Each refresh owns a disjoint set of fields: HEAD owns `head_id` and
/// `head_name`, status owns `status`, marker detection owns `in_progress`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileState {
    pub file: FileHandle,
    pub path: PathBuf,
    pub repo: PathBuf,
    pub root: PathBuf,
    pub head_id: Option<String>,
    pub head_name: Option<String>,
    pub status: Option<StatusCode>,
    pub in_progress: InProgress,
}

impl FileState {
    pub(crate) fn new(file: FileHandle, path: PathBuf, paths: RepoPaths) -> Self {
        Self {
            file,
            path,
            repo: paths.repo,
            root: paths.root,
            head_id: None,
            head_name: None,
            status: None,
            in_progress: InProgress::default(),
        }
    }

    /// Path relative to the worktree root, as git status reports it.
    pub fn relative_path(&self) -> Option<&Path> {
        self.path.strip_prefix(&self.root).ok()
    }

    pub(crate) fn apply_head(&mut self, head: &Head) {
        self.head_id = Some(head.id.clone());
        self.head_name = Some(head.name.clone());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeLevel {
    Warning,
    Error,
}

/// A user-facing message about a refresh that could not be applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notice {
    pub level: NoticeLevel,
    pub message: String,
}

impl From<&TrackError> for Notice {
    fn from(err: &TrackError) -> Self {
        let level = match err {
            TrackError::CommandFailure { .. } => NoticeLevel::Error,
            _ => NoticeLevel::Warning,
        };
        Self {
            level,
            message: err.to_string(),
        }
    }
}

impl From<TrackError> for Notice {
    fn from(err: TrackError) -> Self {
        Self::from(&err)
    }
}

/// Everything the tracker announces to the outside.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TrackerEvent {
    StateUpdated(FileState),
    Notice(Notice),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_path_strips_root() {
        let state = FileState::new(
            FileHandle(1),
            PathBuf::from("/w/proj/src/main.rs"),
            RepoPaths {
                root: PathBuf::from("/w/proj"),
                repo: PathBuf::from("/w/proj/.git"),
            },
        );
        assert_eq!(state.relative_path(), Some(Path::new("src/main.rs")));
    }

    #[test]
    fn failures_map_to_notice_levels() {
        let failure = TrackError::CommandFailure {
            argv: "git status".into(),
            code: 128,
            stderr: "fatal: bad".into(),
        };
        assert_eq!(Notice::from(&failure).level, NoticeLevel::Error);

        let timeout = TrackError::ProcessTimeout {
            argv: "git status".into(),
            timeout: std::time::Duration::from_secs(1),
        };
        assert_eq!(Notice::from(timeout).level, NoticeLevel::Warning);
    }

    #[test]
    fn events_are_tagged() {
        let event = TrackerEvent::Notice(Notice {
            level: NoticeLevel::Warning,
            message: "slow".into(),
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "notice");
        assert_eq!(json["level"], "warning");
    }
}
