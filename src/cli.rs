use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use clap::builder::RangedU64ValueParser;
use clap::builder::styling::{AnsiColor, Color, Style, Styles};
use clap::{Args, CommandFactory, Parser, Subcommand};
use clap_complete::aot::{Shell, generate};
use clap_verbosity_flag::{InfoLevel, Verbosity};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};
use tracing_indicatif::indicatif_println;

use crate::config::Settings;
use crate::diff::{self, DiffOrigin, DiffSource, JumpTarget};
use crate::error::{TrackError, TrackResult};
use crate::git::CommandClass;
use crate::job::{Job, JobResult, JobRunner};
use crate::tracker::{FileHandle, Tracker};

const STYLES: Styles = Styles::styled()
    .header(Style::new().bold())
    .usage(Style::new().bold())
    .error(Style::new().fg_color(Some(Color::Ansi(AnsiColor::Red))))
    .literal(
        Style::new()
            .bold()
            .fg_color(Some(Color::Ansi(AnsiColor::Green))),
    )
    .placeholder(Style::new().fg_color(Some(Color::Ansi(AnsiColor::Yellow))))
    .valid(Style::new().fg_color(Some(Color::Ansi(AnsiColor::Cyan))))
    .invalid(Style::new().fg_color(Some(Color::Ansi(AnsiColor::BrightRed))))
    .context(Style::new().fg_color(Some(Color::Ansi(AnsiColor::Magenta))))
    .context_value(
        Style::new()
            .bold()
            .fg_color(Some(Color::Ansi(AnsiColor::Cyan))),
    );

/// Long-form CLI description shown in `--help`.
const LONG_ABOUT: &str = "git-track - Live git state for the files you are editing

Tracks HEAD, short status and in-progress operations (merge, rebase, bisect, ...)
for each file, refreshing whenever the repository changes on disk.

It can also map a line of `git diff` or `git log -p` output back to the file,
revision and line it came from.";

/// git-track - Live git state for the files you are editing.
#[derive(Parser, Debug, Clone)]
#[command(author, version, propagate_version = true, about, long_about = Some(LONG_ABOUT), styles = STYLES)]
pub struct Cli {
    /// Configuration file to use instead of the default location
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[command(flatten)]
    pub verbosity: Verbosity<InfoLevel>,

    /// Subcommand to run
    #[command(subcommand)]
    pub cmd: Cmd,
}

/// Top-level commands supported by the CLI.
#[derive(Subcommand, Debug, Clone)]
pub enum Cmd {
    /// Track files and print every state change as a JSON line
    ///
    /// Runs until interrupted with Ctrl-C.
    Watch {
        /// Files to track
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Resolve a line of diff text to its source file, revision and line
    ///
    /// Exits with status 1 when the line is not inside a resolvable diff.
    Resolve(ResolveArgs),

    /// Run one command with a deadline and print its result as JSON
    Run(RunArgs),

    /// Generate shell completion for a given shell
    Completion {
        /// Output file to write the completion script to
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// The shell to generate the completion for
        #[arg(value_enum)]
        shell: Shell,
    },
}

/// Options for `resolve`.
#[derive(Args, Debug, Clone)]
pub struct ResolveArgs {
    /// File holding `git diff` or `git log -p` output
    pub diff_file: PathBuf,

    /// Line of the cursor, counting from 1
    #[arg(short, long, value_parser = line_number())]
    pub line: usize,

    /// Show `git log -L` history from the resolved line through this line
    #[arg(long, value_name = "END_LINE", value_parser = line_number())]
    pub history: Option<usize>,

    /// Arguments the diff was produced with (everything after `diff`)
    ///
    /// Used when the text has no commit header. Pass it last, e.g.
    /// `--origin --cached`, or `--origin` alone for a plain diff.
    #[arg(long, num_args = 0.., allow_hyphen_values = true, value_name = "ARG")]
    pub origin: Option<Vec<String>>,
}

/// Options for `run`.
#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Working directory
    #[arg(long, default_value = ".")]
    pub cwd: PathBuf,

    /// Deadline such as `500ms` or `1m`; defaults to the configured job timeout
    #[arg(long, value_parser = humantime::parse_duration)]
    pub timeout: Option<Duration>,

    /// Environment override, repeatable
    #[arg(short, long = "env", value_name = "KEY=VALUE", value_parser = parse_env_pair)]
    pub env: Vec<(String, String)>,

    /// Program and arguments
    #[arg(last = true, required = true)]
    pub argv: Vec<String>,
}

/// Line numbers as editors show them, starting at 1.
fn line_number() -> RangedU64ValueParser<usize> {
    RangedU64ValueParser::new().range(1..)
}

fn parse_env_pair(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .filter(|(key, _)| !key.is_empty())
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .ok_or_else(|| format!("expected KEY=VALUE, got {raw:?}"))
}

#[derive(Serialize)]
struct ResolveReport<'a> {
    #[serde(flatten)]
    source: &'a DiffSource,
    target: Option<JumpTarget>,
    object: Option<String>,
}

#[derive(Serialize)]
struct RunReport<'a> {
    class: CommandClass,
    #[serde(flatten)]
    result: &'a JobResult,
}

impl Cli {
    /// Load settings and execute the chosen command.
    pub async fn run(&self) -> TrackResult<ExitCode> {
        let settings = Settings::load(self.config.as_deref())?;
        self.cmd.run(settings).await
    }
}

impl Cmd {
    /// Execute the chosen top-level command.
    #[tracing::instrument(name = "Running command", level = "info", skip_all)]
    pub async fn run(&self, settings: Settings) -> TrackResult<ExitCode> {
        match self {
            Cmd::Watch { files } => watch(settings, files).await,
            Cmd::Resolve(args) => resolve(&settings, args).await,
            Cmd::Run(args) => run(&settings, args).await,
            Cmd::Completion { shell, output } => {
                let mut cmd = Cli::command();
                if let Some(output_path) = output {
                    let mut file = std::fs::OpenOptions::new()
                        .write(true)
                        .truncate(true)
                        .create(true)
                        .open(output_path)?;
                    generate(*shell, &mut cmd, "git-track", &mut file);
                    info!(
                        "Generated completion script for {} at {}",
                        shell,
                        output_path.display()
                    );
                } else {
                    generate(*shell, &mut cmd, "git-track", &mut std::io::stdout());
                }
                Ok(ExitCode::SUCCESS)
            }
        }
    }
}

#[tracing::instrument(name = "Watching files", level = "info", skip(settings))]
async fn watch(settings: Settings, files: &[PathBuf]) -> TrackResult<ExitCode> {
    let (tracker, _runner) = Tracker::start(settings);
    let mut events = tracker.subscribe();

    let mut handles = HashMap::new();
    for (i, file) in files.iter().enumerate() {
        let path = std::path::absolute(file)?;
        let handle = FileHandle(i as u64 + 1);
        tracker.enable(handle, path.clone())?;
        handles.insert(path, handle);
    }
    let (writes_tx, mut writes) = mpsc::unbounded_channel();
    let _writes_watcher = watch_writes(&handles, writes_tx)?;

    let interrupted = tokio::signal::ctrl_c();
    tokio::pin!(interrupted);
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => indicatif_println!("{}", serde_json::to_string(&event)?),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Dropped {} events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            Some(handle) = writes.recv() => tracker.notify_written(handle)?,
            _ = &mut interrupted => {
                info!("Interrupted; stopping");
                break;
            }
        }
    }
    tracker.shutdown();
    Ok(ExitCode::SUCCESS)
}

/// Stand in for an editor's save notifications: watch each file's directory
/// and report writes to tracked files.
fn watch_writes(
    handles: &HashMap<PathBuf, FileHandle>,
    tx: mpsc::UnboundedSender<FileHandle>,
) -> TrackResult<RecommendedWatcher> {
    let lookup = handles.clone();
    let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
        let Ok(event) = res else {
            return;
        };
        if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
            return;
        }
        for path in &event.paths {
            if let Some(handle) = lookup.get(path) {
                let _ = tx.send(*handle);
            }
        }
    })?;
    for path in handles.keys() {
        let dir = path.parent().unwrap_or(Path::new("/"));
        if let Err(e) = watcher.watch(dir, RecursiveMode::NonRecursive) {
            debug!("Not watching {} for writes: {}", dir.display(), e);
        }
    }
    Ok(watcher)
}

#[tracing::instrument(name = "Resolving diff position", level = "info", skip(settings))]
async fn resolve(settings: &Settings, args: &ResolveArgs) -> TrackResult<ExitCode> {
    let text = tokio::fs::read_to_string(&args.diff_file).await?;
    let lines: Vec<&str> = text.lines().collect();
    let origin = args.origin.as_ref().map(|a| DiffOrigin::new(a.iter().cloned()));

    let Some(source) = diff::resolve(&lines, args.line - 1, origin.as_ref()) else {
        warn!(
            "Line {} of {} is not inside a resolvable diff",
            args.line,
            args.diff_file.display()
        );
        return Ok(ExitCode::FAILURE);
    };

    if let Some(end_line) = args.history {
        let argv = std::iter::once(settings.git.clone()).chain(source.log_range_args(end_line));
        let job = Job::new(argv)
            .envs(settings.env.clone())
            .timeout(settings.job_timeout);
        let result = JobRunner::from_settings(settings)
            .wait(job.clone())
            .await?
            .into_checked(&job)?;
        println!("{}", result.stdout);
        return Ok(ExitCode::SUCCESS);
    }

    let target = source.jump_target();
    let report = ResolveReport {
        source: &source,
        object: target.as_ref().map(JumpTarget::object_spec),
        target,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(ExitCode::SUCCESS)
}

#[tracing::instrument(name = "Running job", level = "info", skip(settings))]
async fn run(settings: &Settings, args: &RunArgs) -> TrackResult<ExitCode> {
    let cwd = &args.cwd;
    if !cwd.is_dir() {
        return Err(TrackError::DirNotFound(cwd.display().to_string()));
    }
    let job = Job::new(args.argv.iter().cloned())
        .cwd(cwd)
        .envs(args.env.iter().cloned())
        .timeout(args.timeout.unwrap_or(settings.job_timeout));
    let result = JobRunner::from_settings(settings).wait(job).await?;

    let report = RunReport {
        class: CommandClass::classify(&args.argv),
        result: &result,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(if result.success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
