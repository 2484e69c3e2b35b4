use std::fmt::Display;

use serde::{Deserialize, Serialize};

/// One side of a diff: a file on disk, a staged blob, or a committed object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Revision {
    Worktree,
    Index,
    /// Any name git resolves to a commit (`HEAD`, `abc123~`, a branch).
    Object(String),
}

impl Revision {
    pub fn object(name: impl Into<String>) -> Self {
        Self::Object(name.into())
    }

    /// The git object name of `path` at this revision: `rev:path`, `:path`
    /// for the index, or the path itself for the worktree.
    pub fn object_spec(&self, path: &str) -> String {
        match self {
            Self::Worktree => path.to_string(),
            Self::Index => format!(":{path}"),
            Self::Object(rev) => format!("{rev}:{path}"),
        }
    }
}

impl Display for Revision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Worktree => f.write_str("(worktree)"),
            Self::Index => f.write_str("(index)"),
            Self::Object(rev) => f.write_str(rev),
        }
    }
}

/// Arguments of the `git diff` invocation whose output a buffer holds, used
/// to name the two sides when the text carries no commit header.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DiffOrigin {
    args: Vec<String>,
}

impl DiffOrigin {
    /// `args` are everything after `diff`.
    pub fn new<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// `(before, after)` for the invocation shapes with an unambiguous
    /// answer. Ranges, path limits and other options give `None`.
    pub fn revisions(&self) -> Option<(Revision, Revision)> {
        match self.args.as_slice() {
            [] => Some((Revision::Index, Revision::Worktree)),
            [flag] if flag == "--cached" || flag == "--staged" => {
                Some((Revision::object("HEAD"), Revision::Index))
            }
            [rev] if !rev.starts_with('-') && !rev.contains("..") => {
                Some((Revision::object(rev.as_str()), Revision::Worktree))
            }
            _ => None,
        }
    }
}
