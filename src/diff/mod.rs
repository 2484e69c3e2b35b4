//! Maps a position inside unified diff or `git log -p` text back to the
//! file, revision and line it came from.

mod origin;
mod source;

use std::sync::LazyLock;

use regex::Regex;
use tracing::trace;

pub use origin::{DiffOrigin, Revision};
pub use source::{DiffSource, JumpTarget};

static HUNK_HEADER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^@@ -(\d+)(?:,\d+)? \+(\d+)(?:,\d+)? @@").expect("invalid HUNK_HEADER regex")
});
static COMMIT_HEADER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^commit ([0-9a-f]{7,64})(?:\s|$)").expect("invalid COMMIT_HEADER regex")
});

const BEFORE_MARKER: &str = "--- ";
const AFTER_MARKER: &str = "+++ ";

/// Resolve the line at `cursor` (0-based) of `lines`.
///
/// The commit comes from the nearest `commit <hash>` header above the
/// cursor, or failing that from `origin`. Returns `None` unless the after
/// side is fully known and the commit header, path markers and hunk header
/// appear in that order above the cursor.
pub fn resolve<S: AsRef<str>>(
    lines: &[S],
    cursor: usize,
    origin: Option<&DiffOrigin>,
) -> Option<DiffSource> {
    let current = lines.get(cursor)?.as_ref();
    let paths = locate_paths(lines, cursor)?;

    let hunk = if paths.direct {
        // The marker lines themselves stand for the top of both files.
        Hunk {
            line: paths.line,
            before: 1,
            after: 1,
        }
    } else {
        locate_hunk(lines, cursor)?
    };

    let (commit_line, before_commit, after_commit) = match locate_commit(lines, cursor) {
        Some((line, hash)) => (
            line,
            Revision::Object(format!("{hash}~")),
            Revision::Object(hash.to_string()),
        ),
        None => {
            let (before, after) = origin?.revisions()?;
            (0, before, after)
        }
    };

    if !(commit_line <= paths.line && paths.line <= hunk.line) {
        trace!(
            "Cursor {} outside a diff: commit@{} path@{} hunk@{}",
            cursor, commit_line, paths.line, hunk.line
        );
        return None;
    }

    let after_path = paths.after?;
    Some(DiffSource {
        before_line: paths.before.as_ref().map(|_| hunk.before),
        before_path: paths.before,
        after_path,
        before_commit: Some(before_commit),
        after_commit,
        after_line: hunk.after,
        prefix: current.chars().next().unwrap_or(' '),
    })
}

struct Paths {
    before: Option<String>,
    after: Option<String>,
    /// Line of the after marker, or of the cursor on a direct hit.
    line: usize,
    /// The cursor sits on one of the marker lines.
    direct: bool,
}

struct Hunk {
    line: usize,
    before: usize,
    after: usize,
}

/// Path named by a marker line starting with `lead`. `Some(None)` is a
/// marker naming `/dev/null`.
fn marker_path(line: &str, lead: &str) -> Option<Option<String>> {
    let rest = line.strip_prefix(lead)?;
    let rest = rest.split_once('\t').map_or(rest, |(path, _)| path);
    if rest == "/dev/null" {
        return Some(None);
    }
    let path = match rest.as_bytes() {
        [mnemonic, b'/', _, ..] if mnemonic.is_ascii_alphabetic() => &rest[2..],
        _ => rest,
    };
    if path.is_empty() {
        return None;
    }
    Some(Some(path.to_string()))
}

/// The `---`/`+++` pair whose `+++` line is at `after_index`. A lone
/// `--- `/`+++ ` line is hunk content that happens to start with `-- `/`++ `.
fn marker_pair<S: AsRef<str>>(
    lines: &[S],
    after_index: usize,
) -> Option<(Option<String>, Option<String>)> {
    let after = marker_path(lines.get(after_index)?.as_ref(), AFTER_MARKER)?;
    let before = marker_path(lines.get(after_index.checked_sub(1)?)?.as_ref(), BEFORE_MARKER)?;
    Some((before, after))
}

fn locate_paths<S: AsRef<str>>(lines: &[S], cursor: usize) -> Option<Paths> {
    let direct = [Some(cursor), cursor.checked_add(1)]
        .into_iter()
        .flatten()
        .find_map(|i| marker_pair(lines, i));
    if let Some((before, after)) = direct {
        return Some(Paths {
            before,
            after,
            line: cursor,
            direct: true,
        });
    }

    let (line, (before, after)) = (1..cursor)
        .rev()
        .find_map(|i| marker_pair(lines, i).map(|pair| (i, pair)))?;
    Some(Paths {
        before,
        after,
        line,
        direct: false,
    })
}

/// Walk up through hunk body lines to the header, counting each kind of line
/// on the way (the cursor line included).
fn locate_hunk<S: AsRef<str>>(lines: &[S], cursor: usize) -> Option<Hunk> {
    let (mut context, mut removed, mut added) = (0usize, 0usize, 0usize);
    for i in (0..=cursor).rev() {
        let line = lines[i].as_ref();
        if let Some(caps) = HUNK_HEADER.captures(line) {
            let before_start: usize = caps[1].parse().ok()?;
            let after_start: usize = caps[2].parse().ok()?;
            return Some(Hunk {
                line: i,
                before: (before_start + context + removed).saturating_sub(1).max(1),
                after: (after_start + context + added).saturating_sub(1).max(1),
            });
        }
        match line.chars().next() {
            Some(' ') => context += 1,
            Some('-') => removed += 1,
            Some('+') => added += 1,
            // "\ No newline at end of file"
            Some('\\') => {}
            _ => return None,
        }
    }
    None
}

fn locate_commit<S: AsRef<str>>(lines: &[S], cursor: usize) -> Option<(usize, &str)> {
    (0..=cursor).rev().find_map(|i| {
        COMMIT_HEADER
            .captures(lines[i].as_ref())
            .and_then(|caps| caps.get(1))
            .map(|hash| (i, hash.as_str()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOG: &[&str] = &[
        "commit abc123def",
        "",
        "--- a/foo.txt",
        "+++ b/foo.txt",
        "@@ -10,3 +12,4 @@",
        " line",
        "+added1",
        "+added2",
    ];

    #[test]
    fn log_hunk_resolves_both_sides() {
        let source = resolve(LOG, 7, None).unwrap();
        assert_eq!(source.after_commit, Revision::object("abc123def"));
        assert_eq!(source.before_commit, Some(Revision::object("abc123def~")));
        assert_eq!(source.after_path, "foo.txt");
        assert_eq!(source.before_path.as_deref(), Some("foo.txt"));
        assert_eq!(source.after_line, 14);
        assert_eq!(source.before_line, Some(10));
        assert_eq!(source.prefix, '+');
    }

    #[test]
    fn hunk_without_commit_or_origin_is_not_found() {
        assert!(resolve(&LOG[2..], 5, None).is_none());
    }

    #[test]
    fn cursor_past_the_end_is_not_found() {
        assert!(resolve(LOG, 8, None).is_none());
    }

    #[test]
    fn removed_lines_count_on_the_before_side() {
        let lines = [
            "commit 0123456789abcdef (HEAD -> main)",
            "diff --git a/src/lib.rs b/src/lib.rs",
            "--- a/src/lib.rs",
            "+++ b/src/lib.rs",
            "@@ -5,4 +5,3 @@ fn main() {",
            " keep",
            "-gone one",
            "-gone two",
            " keep",
        ];
        let source = resolve(&lines, 7, None).unwrap();
        assert_eq!(source.before_line, Some(7));
        assert_eq!(source.after_line, 5);
        assert_eq!(source.prefix, '-');
        assert_eq!(source.after_commit, Revision::object("0123456789abcdef"));

        let target = source.jump_target().unwrap();
        assert_eq!(target.object_spec(), "0123456789abcdef~:src/lib.rs");
        assert_eq!(target.line, 7);
    }

    #[test]
    fn marker_lines_resolve_to_the_first_line() {
        let from_before = resolve(LOG, 2, None).unwrap();
        assert_eq!(from_before.after_line, 1);
        assert_eq!(from_before.before_line, Some(1));
        assert_eq!(from_before.after_path, "foo.txt");

        let from_after = resolve(LOG, 3, None).unwrap();
        assert_eq!(from_after, DiffSource { prefix: '+', ..from_before });
    }

    #[test]
    fn new_file_has_no_before_side() {
        let lines = [
            "commit fedcba9876543",
            "--- /dev/null",
            "+++ b/new.rs",
            "@@ -0,0 +1,2 @@",
            "+fn a() {}",
            "+fn b() {}",
        ];
        let source = resolve(&lines, 5, None).unwrap();
        assert_eq!(source.before_path, None);
        assert_eq!(source.before_line, None);
        assert_eq!(source.after_path, "new.rs");
        assert_eq!(source.after_line, 2);
    }

    #[test]
    fn deleted_file_is_not_found() {
        let lines = [
            "commit fedcba9876543",
            "--- a/old.rs",
            "+++ /dev/null",
            "@@ -1,1 +0,0 @@",
            "-fn a() {}",
        ];
        assert!(resolve(&lines, 4, None).is_none());
    }

    #[test]
    fn mnemonic_prefixes_and_timestamps_are_dropped() {
        let lines = [
            "--- i/docs/readme.md\t2024-03-01 10:00:00.000000000 +0100",
            "+++ w/docs/readme.md\t2024-03-02 11:00:00.000000000 +0100",
            "@@ -1 +1 @@",
            "-old",
            "+new",
        ];
        let source = resolve(&lines, 4, Some(&DiffOrigin::default())).unwrap();
        assert_eq!(source.before_path.as_deref(), Some("docs/readme.md"));
        assert_eq!(source.after_path, "docs/readme.md");
        assert_eq!(source.before_commit, Some(Revision::Index));
        assert_eq!(source.after_commit, Revision::Worktree);
        assert_eq!(source.after_line, 1);
    }

    #[test]
    fn origin_supplies_revisions_without_a_header() {
        let cached = DiffOrigin::new(["--cached"]);
        let source = resolve(&LOG[2..], 5, Some(&cached)).unwrap();
        assert_eq!(source.before_commit, Some(Revision::object("HEAD")));
        assert_eq!(source.after_commit, Revision::Index);

        let range = DiffOrigin::new(["main..topic"]);
        assert!(resolve(&LOG[2..], 5, Some(&range)).is_none());
    }

    #[test]
    fn no_newline_marker_is_not_counted() {
        let lines = [
            "commit 1234567",
            "--- a/f",
            "+++ b/f",
            "@@ -3,2 +3,2 @@",
            "-x",
            "\\ No newline at end of file",
            "+y",
            "\\ No newline at end of file",
        ];
        let source = resolve(&lines, 6, None).unwrap();
        assert_eq!(source.after_line, 3);
        assert_eq!(source.before_line, Some(3));
    }

    #[test]
    fn second_file_of_a_commit() {
        let lines = [
            "commit 1234567abc",
            "--- a/one",
            "+++ b/one",
            "@@ -1 +1 @@",
            "-a",
            "+b",
            "--- a/two",
            "+++ b/two",
            "@@ -20,2 +30,2 @@",
            " same",
            "+more",
        ];
        let source = resolve(&lines, 10, None).unwrap();
        assert_eq!(source.after_path, "two");
        assert_eq!(source.after_line, 31);
    }

    #[test]
    fn commit_message_of_a_later_commit_is_not_found() {
        let lines = [
            "commit 1111111",
            "--- a/f",
            "+++ b/f",
            "@@ -1 +1 @@",
            "+x",
            "commit 2222222",
            "",
            "    message",
        ];
        assert!(resolve(&lines, 7, None).is_none());
        assert!(resolve(&lines, 5, None).is_none());
    }

    #[test]
    fn removed_line_that_looks_like_a_marker() {
        let lines = [
            "commit 1234567abc",
            "--- a/init.lua",
            "+++ b/init.lua",
            "@@ -4,3 +4,2 @@",
            " local x = 1",
            "--- old comment",
            " return x",
        ];
        let source = resolve(&lines, 5, None).unwrap();
        assert_eq!(source.before_path.as_deref(), Some("init.lua"));
        assert_eq!(source.before_line, Some(5));
        assert_eq!(source.after_line, 4);
        assert_eq!(source.prefix, '-');
    }

    #[test]
    fn added_line_that_looks_like_a_marker() {
        let lines = [
            "commit 1234567abc",
            "--- a/notes.md",
            "+++ b/notes.md",
            "@@ -4,1 +4,3 @@",
            " keep",
            "+++ counter",
            "+after",
        ];
        let source = resolve(&lines, 5, None).unwrap();
        assert_eq!(source.after_path, "notes.md");
        assert_eq!(source.after_line, 5);

        let source = resolve(&lines, 6, None).unwrap();
        assert_eq!(source.after_path, "notes.md");
        assert_eq!(source.after_line, 6);
    }

    #[test]
    fn short_hashes_are_not_commit_headers() {
        assert!(locate_commit(&["commit abc12"], 0).is_none());
        assert!(locate_commit(&["commit 1234567 (tag: v1)"], 0).is_some());
    }
}
