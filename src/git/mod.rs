/// Job builders for the repository queries the tracker issues, and the
/// classification table for arbitrary git invocations.
pub mod commands;

/// Presence checks for in-progress multi-step operations.
pub mod markers;

/// Parsers for `rev-parse` and porcelain status output.
pub mod output;

pub use commands::{CommandClass, Git};
pub use markers::{InProgress, InProgressAction};
pub use output::{Head, RepoPaths, StatusCode};
