use std::collections::BTreeSet;
use std::fmt::Display;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::trace;

/// A multi-step operation left in progress inside a repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InProgressAction {
    Merge,
    Rebase,
    Am,
    Bisect,
    Revert,
    CherryPick,
}

impl InProgressAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Merge => "merge",
            Self::Rebase => "rebase",
            Self::Am => "am",
            Self::Bisect => "bisect",
            Self::Revert => "revert",
            Self::CherryPick => "cherry-pick",
        }
    }
}

impl Display for InProgressAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Marker paths, relative to the repository metadata directory.
const MARKERS: &[(&str, InProgressAction)] = &[
    ("MERGE_HEAD", InProgressAction::Merge),
    ("rebase-merge", InProgressAction::Rebase),
    ("rebase-apply/rebasing", InProgressAction::Rebase),
    ("rebase-apply/applying", InProgressAction::Am),
    ("BISECT_LOG", InProgressAction::Bisect),
    ("REVERT_HEAD", InProgressAction::Revert),
    ("CHERRY_PICK_HEAD", InProgressAction::CherryPick),
];

/// The set of operations currently in progress, displayed comma-delimited.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InProgress(BTreeSet<InProgressAction>);

impl InProgress {
    /// Check every marker under `repo`. Only presence matters; nothing is read.
    #[tracing::instrument(level = "trace")]
    pub async fn detect(repo: &Path) -> Self {
        let mut found = BTreeSet::new();
        for (marker, action) in MARKERS {
            if found.contains(action) {
                continue;
            }
            if tokio::fs::try_exists(repo.join(marker)).await.unwrap_or(false) {
                trace!("Found {} marker {}", action, marker);
                found.insert(*action);
            }
        }
        Self(found)
    }

    pub fn contains(&self, action: InProgressAction) -> bool {
        self.0.contains(&action)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = InProgressAction> + '_ {
        self.0.iter().copied()
    }
}

impl FromIterator<InProgressAction> for InProgress {
    fn from_iter<T: IntoIterator<Item = InProgressAction>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl Display for InProgress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, action) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{action}")?;
        }
        Ok(())
    }
}
