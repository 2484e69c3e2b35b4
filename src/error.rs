use std::path::PathBuf;

use thiserror::Error;

/// Unified error type for the job runner, the tracker and the CLI.
#[derive(Error, Debug)]
pub enum TrackError {
    #[error("Errored while handling a file or process. {0}")]
    Io(#[from] std::io::Error),
    #[error("Error from the filesystem watcher. {0}")]
    Notify(#[from] notify::Error),
    #[error("Error serializing json. {0}")]
    SerdeJson(#[from] serde_json::Error),
    #[error("Invalid configuration. {0}")]
    Config(#[from] serde_path_to_error::Error<serde_json::Error>),
    #[error("Error parsing the duration string. {0}")]
    DurationParse(#[from] humantime::DurationError),
    #[error("Runtime error. {0}")]
    TokioJoin(#[from] tokio::task::JoinError),
    #[error("{0} is not inside a git repository")]
    NotInRepository(PathBuf),
    #[error("`{argv}` did not finish within {timeout:?}")]
    ProcessTimeout {
        argv: String,
        timeout: std::time::Duration,
    },
    #[error("`{argv}` exited with code {code}: {stderr}")]
    CommandFailure {
        argv: String,
        code: i32,
        stderr: String,
    },
    #[error("Unexpected output from `{argv}`: {reason}")]
    ParseFailure { argv: String, reason: String },
    #[error("Directory not found error. {0}")]
    DirNotFound(String),
    #[error("The tracker is no longer running")]
    ChannelClosed,
}

/// Convenience alias for results that bubble `TrackError`.
pub type TrackResult<T> = Result<T, TrackError>;
