use serde::{Deserialize, Serialize};

use crate::diff::Revision;

/// Source coordinates of a position inside diff text. Only ever produced
/// fully resolved: the after side always has a revision, a path and a line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSource {
    pub before_path: Option<String>,
    pub after_path: String,
    pub before_commit: Option<Revision>,
    pub after_commit: Revision,
    pub before_line: Option<usize>,
    pub after_line: usize,
    /// First character of the cursor line (`+`, `-`, ` `, ...).
    pub prefix: char,
}

/// Where "jump to this line" should open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JumpTarget {
    pub revision: Revision,
    pub path: String,
    pub line: usize,
}

impl JumpTarget {
    /// Object name to open, e.g. `abc123~:src/lib.rs`.
    pub fn object_spec(&self) -> String {
        self.revision.object_spec(&self.path)
    }
}

impl DiffSource {
    /// A removed line only exists on the before side; everything else is
    /// opened on the after side.
    pub fn jump_target(&self) -> Option<JumpTarget> {
        if self.prefix == '-' {
            Some(JumpTarget {
                revision: self.before_commit.clone()?,
                path: self.before_path.clone()?,
                line: self.before_line?,
            })
        } else {
            Some(JumpTarget {
                revision: self.after_commit.clone(),
                path: self.after_path.clone(),
                line: self.after_line,
            })
        }
    }

    /// Arguments for `git log -L` over the after side, from the resolved line
    /// through `end_line`.
    pub fn log_range_args(&self, end_line: usize) -> Vec<String> {
        let start = self.after_line;
        let end = end_line.max(start);
        let mut args = vec![
            "log".to_string(),
            "-L".to_string(),
            format!("{start},{end}:{}", self.after_path),
        ];
        if let Revision::Object(rev) = &self.after_commit {
            args.push(rev.clone());
        }
        args
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(prefix: char) -> DiffSource {
        DiffSource {
            before_path: Some("old.rs".into()),
            after_path: "new.rs".into(),
            before_commit: Some(Revision::object("abc~")),
            after_commit: Revision::object("abc"),
            before_line: Some(7),
            after_line: 9,
            prefix,
        }
    }

    #[test]
    fn removed_lines_jump_to_before_side() {
        let target = source('-').jump_target().unwrap();
        assert_eq!(target.object_spec(), "abc~:old.rs");
        assert_eq!(target.line, 7);

        let target = source('+').jump_target().unwrap();
        assert_eq!(target.object_spec(), "abc:new.rs");
        assert_eq!(target.line, 9);
    }

    #[test]
    fn removed_line_of_new_file_has_no_target() {
        let mut s = source('-');
        s.before_path = None;
        assert!(s.jump_target().is_none());
    }

    #[test]
    fn log_range() {
        assert_eq!(
            source(' ').log_range_args(12),
            vec!["log", "-L", "9,12:new.rs", "abc"]
        );
        let mut s = source(' ');
        s.after_commit = Revision::Worktree;
        assert_eq!(s.log_range_args(3), vec!["log", "-L", "9,9:new.rs"]);
    }
}
