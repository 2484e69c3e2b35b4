//! External command execution.
//!
//! A [`Job`] is one process invocation with fully captured output and a
//! bounded lifetime. [`JobRunner`] executes jobs in three forms: as a future
//! ([`JobRunner::run`]), with a completion callback ([`JobRunner::spawn`]) and
//! as a bounded wait ([`JobRunner::wait`]). Every job, whatever its outcome,
//! is announced on the runner's "command finished" channel.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::LazyLock;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use regex::Regex;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::config::Settings;
use crate::error::{TrackError, TrackResult};

/// Exit code reported for a job that was killed at its deadline.
pub const TIMEOUT_EXIT_CODE: i32 = 1;

/// Exit code reported for a job whose process could not be started.
pub const SPAWN_FAILURE_EXIT_CODE: i32 = -1;

/// A process killed by signal `n` reports `SIGNAL_EXIT_BASE + n`, as shells do.
pub const SIGNAL_EXIT_BASE: i32 = 128;

static BLANK_RUNS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n{2,}").expect("invalid BLANK_RUNS regex"));

/// One external process invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub argv: Vec<String>,
    pub cwd: PathBuf,
    /// Merged over the inherited process environment.
    pub env: BTreeMap<String, String>,
    #[serde(with = "crate::serde_helpers::duration")]
    pub timeout: Duration,
}

impl Job {
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            cwd: PathBuf::from("."),
            env: BTreeMap::new(),
            timeout: Settings::default().job_timeout,
        }
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = cwd.into();
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env
            .extend(vars.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The argument vector joined with spaces, for messages and logs.
    pub fn display_argv(&self) -> String {
        self.argv.join(" ")
    }
}

/// How a job ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// The process exited on its own; the code is whatever it returned.
    Exited,
    /// The deadline fired first and the process was killed.
    TimedOut,
    /// The process never started.
    SpawnFailed,
}

/// Captured outcome of a [`Job`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResult {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
    pub status: JobStatus,
}

impl JobResult {
    pub fn success(&self) -> bool {
        self.status == JobStatus::Exited && self.code == 0
    }

    pub fn timed_out(&self) -> bool {
        self.status == JobStatus::TimedOut
    }

    /// Interpret the result for callers that treat anything but a clean exit
    /// as an error.
    pub fn into_checked(self, job: &Job) -> TrackResult<Self> {
        match self.status {
            JobStatus::TimedOut => Err(TrackError::ProcessTimeout {
                argv: job.display_argv(),
                timeout: job.timeout,
            }),
            _ if self.code != 0 => Err(TrackError::CommandFailure {
                argv: job.display_argv(),
                code: self.code,
                stderr: self.stderr,
            }),
            _ => Ok(self),
        }
    }
}

/// Announcement published after every job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandFinished {
    pub argv: Vec<String>,
    pub cwd: PathBuf,
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
    pub status: JobStatus,
    #[serde(with = "crate::serde_helpers::offset_datetime")]
    pub finished_at: OffsetDateTime,
    #[serde(with = "crate::serde_helpers::duration")]
    pub elapsed: Duration,
}

/// Object-safe job execution seam.
///
/// The tracker only needs "run this job and hand me the result"; tests swap
/// in a scripted implementation.
pub trait CommandRunner: Send + Sync {
    fn execute(&self, job: Job) -> BoxFuture<'static, JobResult>;
}

/// Spawns jobs on the tokio runtime and publishes their completion.
#[derive(Debug, Clone)]
pub struct JobRunner {
    finished: broadcast::Sender<CommandFinished>,
    grace: Duration,
}

impl JobRunner {
    pub fn new(capacity: usize, grace: Duration) -> Self {
        let (finished, _) = broadcast::channel(capacity.max(1));
        Self { finished, grace }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(settings.channel_capacity, settings.wait_grace)
    }

    /// Receive a [`CommandFinished`] for every job run after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<CommandFinished> {
        self.finished.subscribe()
    }

    /// Run `job`, resolving once its output streams close and it exits, or
    /// once its deadline kills it.
    pub fn run(&self, job: Job) -> impl Future<Output = JobResult> + Send + 'static {
        let finished = self.finished.clone();
        async move { execute(job, finished).await }
    }

    /// Run `job` in the background and hand the result to `on_done`.
    pub fn spawn<F>(&self, job: Job, on_done: F) -> JoinHandle<()>
    where
        F: FnOnce(JobResult) + Send + 'static,
    {
        let pending = self.run(job);
        tokio::spawn(async move { on_done(pending.await) })
    }

    /// Wait for `job` for at most its timeout plus the grace period.
    ///
    /// The caller yields to the scheduler while waiting; it never blocks the
    /// thread.
    pub async fn wait(&self, job: Job) -> TrackResult<JobResult> {
        let budget = job.timeout + self.grace;
        let argv = job.display_argv();
        let handle = tokio::spawn(self.run(job));
        match tokio::time::timeout(budget, handle).await {
            Ok(joined) => Ok(joined?),
            Err(_) => Err(TrackError::ProcessTimeout {
                argv,
                timeout: budget,
            }),
        }
    }
}

impl CommandRunner for JobRunner {
    fn execute(&self, job: Job) -> BoxFuture<'static, JobResult> {
        Box::pin(self.run(job))
    }
}

#[tracing::instrument(name = "Running job", level = "debug", skip_all, fields(argv = %job.display_argv()))]
async fn execute(job: Job, finished: broadcast::Sender<CommandFinished>) -> JobResult {
    let started = Instant::now();
    let result = match spawn_child(&job) {
        Ok(child) => collect(child, job.timeout).await,
        Err(e) => {
            warn!("Unable to start `{}`: {}", job.display_argv(), e);
            JobResult {
                code: SPAWN_FAILURE_EXIT_CODE,
                stdout: String::new(),
                stderr: e.to_string(),
                status: JobStatus::SpawnFailed,
            }
        }
    };

    match result.status {
        JobStatus::Exited => debug!("Exited with code {}", result.code),
        JobStatus::TimedOut => warn!(
            "`{}` timed out after {}",
            job.display_argv(),
            humantime::format_duration(job.timeout)
        ),
        JobStatus::SpawnFailed => {}
    }

    // Nobody listening is fine.
    let _ = finished.send(CommandFinished {
        argv: job.argv,
        cwd: job.cwd,
        code: result.code,
        stdout: result.stdout.clone(),
        stderr: result.stderr.clone(),
        status: result.status,
        finished_at: OffsetDateTime::now_utc(),
        elapsed: started.elapsed(),
    });
    result
}

fn spawn_child(job: &Job) -> std::io::Result<Child> {
    let (program, args) = job.argv.split_first().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty argument vector")
    })?;
    Command::new(program)
        .args(args)
        .current_dir(&job.cwd)
        .envs(&job.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
}

async fn collect(mut child: Child, timeout: Duration) -> JobResult {
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    // Exactly one branch wins the select, so a result is produced once
    // whether the process exits or the deadline fires first.
    let natural = {
        let exited = async {
            let (out, err) = tokio::join!(read_stream(stdout), read_stream(stderr));
            (out, err, child.wait().await)
        };
        tokio::select! {
            outcome = exited => Some(outcome),
            _ = tokio::time::sleep(timeout) => None,
        }
    };

    match natural {
        Some((out, err, Ok(status))) => JobResult {
            code: exit_code(status),
            stdout: normalize_stdout(&String::from_utf8_lossy(&out)),
            stderr: normalize_stderr(&String::from_utf8_lossy(&err)),
            status: JobStatus::Exited,
        },
        Some((_, _, Err(e))) => JobResult {
            code: SPAWN_FAILURE_EXIT_CODE,
            stdout: String::new(),
            stderr: e.to_string(),
            status: JobStatus::SpawnFailed,
        },
        None => {
            if let Err(e) = child.kill().await {
                trace!("Kill after timeout failed: {}", e);
            }
            JobResult {
                code: TIMEOUT_EXIT_CODE,
                stdout: String::new(),
                stderr: format!(
                    "timed out after {}",
                    humantime::format_duration(timeout)
                ),
                status: JobStatus::TimedOut,
            }
        }
    }
}

fn exit_code(status: std::process::ExitStatus) -> i32 {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return SIGNAL_EXIT_BASE + signal;
        }
    }
    status.code().unwrap_or(SPAWN_FAILURE_EXIT_CODE)
}

async fn read_stream<R: AsyncRead + Unpin>(stream: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut stream) = stream
        && let Err(e) = stream.read_to_end(&mut buf).await
    {
        trace!("Output stream closed with error: {}", e);
    }
    buf
}

/// Strip trailing newlines.
pub fn normalize_stdout(raw: &str) -> String {
    raw.trim_end_matches(['\n', '\r']).to_string()
}

/// Turn carriage returns into newlines, collapse blank-line runs and strip
/// trailing newlines, so progress output reads cleanly.
pub fn normalize_stderr(raw: &str) -> String {
    let converted = raw.replace('\r', "\n");
    BLANK_RUNS
        .replace_all(&converted, "\n")
        .trim_end_matches('\n')
        .to_string()
}
