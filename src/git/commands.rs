use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::config::Settings;
use crate::job::Job;

/// Builds the jobs the tracker runs against a repository.
#[derive(Debug, Clone, Copy)]
pub struct Git<'a> {
    settings: &'a Settings,
}

impl<'a> Git<'a> {
    pub fn new(settings: &'a Settings) -> Self {
        Self { settings }
    }

    fn job<I, S>(&self, cwd: &Path, args: I) -> Job
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let argv = std::iter::once(self.settings.git.clone()).chain(args.into_iter().map(Into::into));
        Job::new(argv)
            .cwd(cwd)
            .envs(self.settings.env.clone())
            .timeout(self.settings.job_timeout)
    }

    /// Worktree root followed by the absolute metadata directory, one per line.
    pub fn resolve_repo(&self, dir: &Path) -> Job {
        self.job(dir, ["rev-parse", "--show-toplevel", "--absolute-git-dir"])
    }

    /// HEAD commit id followed by its short name, one per line.
    pub fn read_head(&self, root: &Path) -> Job {
        self.job(root, ["rev-parse", "HEAD", "--abbrev-ref", "HEAD"])
    }

    /// NUL-delimited porcelain status restricted to `paths` (relative to `root`).
    ///
    /// Optional locks stay off so the query never touches the index, which
    /// would wake the repository watch again. Paths are matched literally, so
    /// a file named `[ab].rs` is not read as a glob.
    pub fn status(&self, root: &Path, paths: &[PathBuf]) -> Job {
        let args = [
            "--no-optional-locks",
            "status",
            "--porcelain=v1",
            "-z",
            "--ignored",
            "--untracked-files=all",
            "--",
        ]
        .into_iter()
        .map(String::from)
        .chain(paths.iter().map(|p| p.to_string_lossy().into_owned()));
        self.job(root, args).env("GIT_LITERAL_PATHSPECS", "1")
    }
}

/// Whether a git invocation can change repository state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandClass {
    /// Only reads: never moves HEAD, the index or refs.
    Informational,
    /// May move HEAD, rewrite the index or update refs.
    Mutating,
    /// Not a git invocation, or a subcommand outside the table.
    Unknown,
}

/// Global options that consume the following argument.
const OPTIONS_WITH_VALUE: &[&str] = &["-C", "-c", "--git-dir", "--work-tree", "--namespace"];

impl CommandClass {
    pub fn classify<S: AsRef<str>>(argv: &[S]) -> Self {
        let Some((program, rest)) = argv.split_first() else {
            return Self::Unknown;
        };
        let program = Path::new(program.as_ref())
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default();
        if program != "git" {
            return Self::Unknown;
        }

        let mut args = rest.iter().map(AsRef::as_ref);
        let subcommand = loop {
            match args.next() {
                Some(opt) if OPTIONS_WITH_VALUE.contains(&opt) => {
                    args.next();
                }
                Some(opt) if opt.starts_with('-') => {}
                Some(sub) => break sub,
                None => return Self::Unknown,
            }
        };
        let next = args.next();

        match subcommand {
            "status" | "log" | "show" | "diff" | "blame" | "annotate" | "rev-parse"
            | "rev-list" | "ls-files" | "ls-tree" | "ls-remote" | "cat-file" | "grep"
            | "shortlog" | "describe" | "reflog" | "whatchanged" | "show-ref"
            | "for-each-ref" | "name-rev" | "merge-base" | "cherry" | "range-diff"
            | "help" | "version" | "var" | "check-ignore" | "check-attr" => Self::Informational,
            "stash" => match next {
                Some("list") | Some("show") => Self::Informational,
                _ => Self::Mutating,
            },
            "branch" | "tag" | "remote" | "worktree" => match next {
                None | Some("--list") | Some("-l") | Some("list") | Some("-v")
                | Some("-vv") | Some("-a") | Some("-r") => Self::Informational,
                _ => Self::Mutating,
            },
            "commit" | "merge" | "rebase" | "reset" | "checkout" | "switch" | "restore"
            | "add" | "rm" | "mv" | "cherry-pick" | "revert" | "am" | "apply" | "pull"
            | "fetch" | "push" | "bisect" | "clean" | "init" | "clone" | "update-index"
            | "update-ref" | "symbolic-ref" | "notes" | "submodule" | "gc" | "prune"
            | "read-tree" | "filter-branch" | "replace" | "sparse-checkout" => Self::Mutating,
            _ => Self::Unknown,
        }
    }

    pub fn is_mutating(self) -> bool {
        self == Self::Mutating
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn jobs_carry_settings() {
        let mut settings = Settings {
            git: "/opt/git/bin/git".into(),
            job_timeout: Duration::from_secs(3),
            ..Settings::default()
        };
        settings.env.insert("GIT_CONFIG_NOSYSTEM".into(), "1".into());

        let git = Git::new(&settings);
        let job = git.status(Path::new("/repo"), &[PathBuf::from("src/a b.rs")]);
        assert_eq!(job.argv[0], "/opt/git/bin/git");
        assert_eq!(job.argv.last().unwrap(), "src/a b.rs");
        assert!(job.argv.contains(&"-z".to_string()));
        assert_eq!(job.cwd, PathBuf::from("/repo"));
        assert_eq!(job.timeout, Duration::from_secs(3));
        assert_eq!(job.env.get("GIT_CONFIG_NOSYSTEM").unwrap(), "1");

        let job = git.resolve_repo(Path::new("/repo/src"));
        assert_eq!(
            job.argv[1..],
            ["rev-parse", "--show-toplevel", "--absolute-git-dir"]
        );
    }

    #[test]
    fn status_paths_are_literal() {
        let mut settings = Settings::default();
        settings.env.insert("GIT_LITERAL_PATHSPECS".into(), "0".into());

        let job = Git::new(&settings).status(Path::new("/repo"), &[PathBuf::from("[ab].rs")]);
        assert_eq!(job.env.get("GIT_LITERAL_PATHSPECS").unwrap(), "1");
        assert_eq!(job.argv.last().unwrap(), "[ab].rs");
        assert_eq!(job.argv[job.argv.len() - 2], "--");
    }

    #[test]
    fn classifies_through_global_options() {
        assert_eq!(
            CommandClass::classify(&["git", "-C", "/repo", "--no-pager", "log", "-3"]),
            CommandClass::Informational
        );
        assert_eq!(
            CommandClass::classify(&["/usr/bin/git", "-c", "user.name=x", "commit", "-m", "x"]),
            CommandClass::Mutating
        );
        assert_eq!(CommandClass::classify(&["git"]), CommandClass::Unknown);
        assert_eq!(CommandClass::classify(&["hg", "log"]), CommandClass::Unknown);
        assert_eq!(
            CommandClass::classify(&["git", "frobnicate"]),
            CommandClass::Unknown
        );
    }

    #[test]
    fn listing_forms_are_informational() {
        assert_eq!(
            CommandClass::classify(&["git", "stash", "list"]),
            CommandClass::Informational
        );
        assert_eq!(
            CommandClass::classify(&["git", "stash"]),
            CommandClass::Mutating
        );
        assert_eq!(
            CommandClass::classify(&["git", "branch"]),
            CommandClass::Informational
        );
        assert_eq!(
            CommandClass::classify(&["git", "branch", "feature"]),
            CommandClass::Mutating
        );
    }
}
