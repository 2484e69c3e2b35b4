use std::collections::HashMap;
use std::fmt::Display;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Worktree root and metadata directory of the repository owning a path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RepoPaths {
    pub root: PathBuf,
    pub repo: PathBuf,
}

impl RepoPaths {
    /// Parse `rev-parse --show-toplevel --absolute-git-dir` output.
    pub fn parse(stdout: &str) -> Option<Self> {
        let mut lines = stdout.lines().map(str::trim_end).filter(|l| !l.is_empty());
        let root = lines.next()?;
        let repo = lines.next()?;
        if lines.next().is_some() {
            return None;
        }
        Some(Self {
            root: PathBuf::from(root),
            repo: PathBuf::from(repo),
        })
    }
}

/// HEAD commit id and the name shown for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Head {
    pub id: String,
    pub name: String,
}

/// Characters of the id shown in place of a branch name when HEAD is detached.
const DETACHED_NAME_LEN: usize = 7;

impl Head {
    /// Parse `rev-parse HEAD --abbrev-ref HEAD` output.
    pub fn parse(stdout: &str) -> Result<Self, String> {
        let (id, name) = stdout
            .trim_end()
            .split_once('\n')
            .ok_or_else(|| format!("expected two lines, got {stdout:?}"))?;
        let (id, name) = (id.trim(), name.trim());
        if id.len() < 4 || !id.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(format!("{id:?} is not a commit id"));
        }
        if name.is_empty() || name.contains('\n') {
            return Err(format!("unexpected HEAD name {name:?}"));
        }
        let name = if name == "HEAD" {
            id.chars().take(DETACHED_NAME_LEN).collect()
        } else {
            name.to_string()
        };
        Ok(Self {
            id: id.to_string(),
            name,
        })
    }
}

/// Two-character porcelain status code (`XY`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct StatusCode([u8; 2]);

impl StatusCode {
    /// Reported for tracked files git has nothing to say about.
    pub const UNMODIFIED: Self = Self(*b"  ");

    pub fn index(self) -> char {
        self.0[0] as char
    }

    pub fn worktree(self) -> char {
        self.0[1] as char
    }

    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.0).unwrap_or("  ")
    }

    fn is_rename_or_copy(self) -> bool {
        matches!(self.index(), 'R' | 'C') || matches!(self.worktree(), 'R' | 'C')
    }
}

impl Default for StatusCode {
    fn default() -> Self {
        Self::UNMODIFIED
    }
}

impl Display for StatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl From<StatusCode> for String {
    fn from(code: StatusCode) -> Self {
        code.as_str().to_string()
    }
}

impl TryFrom<&str> for StatusCode {
    type Error = String;

    fn try_from(raw: &str) -> Result<Self, Self::Error> {
        match raw.as_bytes() {
            [x, y] if x.is_ascii() && y.is_ascii() => Ok(Self([*x, *y])),
            _ => Err(format!("{raw:?} is not a two-character status code")),
        }
    }
}

impl TryFrom<String> for StatusCode {
    type Error = String;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        Self::try_from(raw.as_str())
    }
}

/// Parse `status --porcelain=v1 -z` output into codes keyed by root-relative
/// path. Rename and copy records are keyed by their destination.
pub fn parse_status_z(stdout: &str) -> Result<HashMap<PathBuf, StatusCode>, String> {
    let mut codes = HashMap::new();
    let mut records = stdout.split('\0').filter(|r| !r.is_empty());
    while let Some(record) = records.next() {
        let (code, path) = match (record.get(..2), record.get(2..3), record.get(3..)) {
            (Some(code), Some(" "), Some(path)) if !path.is_empty() => (code, path),
            _ => return Err(format!("malformed status record {record:?}")),
        };
        let code = StatusCode::try_from(code)?;
        if code.is_rename_or_copy() {
            // The source path follows as its own field.
            records.next();
        }
        codes.insert(PathBuf::from(path), code);
    }
    Ok(codes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repo_paths_need_two_lines() {
        let paths = RepoPaths::parse("/work/proj\n/work/proj/.git\n").unwrap();
        assert_eq!(paths.root, PathBuf::from("/work/proj"));
        assert_eq!(paths.repo, PathBuf::from("/work/proj/.git"));

        assert!(RepoPaths::parse("/work/proj").is_none());
        assert!(RepoPaths::parse("").is_none());
        assert!(RepoPaths::parse("a\nb\nc").is_none());
    }

    #[test]
    fn head_parses_branch_and_detached() {
        let head = Head::parse("0123456789abcdef0123456789abcdef01234567\nmain").unwrap();
        assert_eq!(head.name, "main");

        let head = Head::parse("0123456789abcdef0123456789abcdef01234567\nHEAD").unwrap();
        assert_eq!(head.name, "0123456");
    }

    #[test]
    fn head_without_separator_is_rejected() {
        assert!(Head::parse("0123456789abcdef").is_err());
        assert!(Head::parse("not-a-sha\nmain").is_err());
    }

    #[test]
    fn status_records_are_nul_delimited() {
        let out = " M src/lib.rs\0?? new file.txt\0R  renamed.rs\0old.rs\0!! target/x\0";
        let codes = parse_status_z(out).unwrap();
        assert_eq!(codes[&PathBuf::from("src/lib.rs")].as_str(), " M");
        assert_eq!(codes[&PathBuf::from("new file.txt")].as_str(), "??");
        assert_eq!(codes[&PathBuf::from("renamed.rs")].as_str(), "R ");
        assert_eq!(codes[&PathBuf::from("target/x")].as_str(), "!!");
        assert!(!codes.contains_key(&PathBuf::from("old.rs")));
        assert_eq!(codes.len(), 4);
    }

    #[test]
    fn status_accepts_newlines_in_names() {
        let codes = parse_status_z("?? line\nbreak\0").unwrap();
        assert!(codes.contains_key(&PathBuf::from("line\nbreak")));
    }

    #[test]
    fn malformed_status_is_an_error() {
        assert!(parse_status_z("garbage\0").is_err());
        assert!(parse_status_z("").unwrap().is_empty());
    }

    #[test]
    fn status_code_serializes_as_string() {
        assert_eq!(
            serde_json::to_string(&StatusCode::UNMODIFIED).unwrap(),
            "\"  \""
        );
        let parsed: StatusCode = serde_json::from_str("\"MM\"").unwrap();
        assert_eq!(parsed.index(), 'M');
        assert!(serde_json::from_str::<StatusCode>("\"M\"").is_err());
    }
}
