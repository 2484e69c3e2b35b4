//! Live git state for edited files.
//!
//! [`job::JobRunner`] runs external commands with a deadline, the
//! [`tracker::Tracker`] keeps a per-file projection of repository state
//! current by watching each repository, and [`diff::resolve`] maps positions
//! in diff text back to their source.

pub mod cli;
pub mod config;
pub mod diff;
pub mod error;
pub mod git;
pub mod job;
pub mod logging;
pub(crate) mod serde_helpers;
pub mod tracker;

pub use error::{TrackError, TrackResult};
