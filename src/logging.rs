use tracing_indicatif::IndicatifLayer;
use tracing_subscriber::filter::{EnvFilter, LevelFilter};
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Environment variable holding `tracing` filter directives.
pub const LOG_ENV_VAR: &str = "GIT_TRACK_LOG";

/// Install the global subscriber.
///
/// `level` comes from the CLI verbosity flags; when absent the build profile
/// decides. Directives in `GIT_TRACK_LOG` always win.
pub fn setup_logger(level: Option<LevelFilter>) {
    let indicatif_layer = IndicatifLayer::new();

    let default_level = level.unwrap_or(if cfg!(debug_assertions) {
        LevelFilter::TRACE
    } else {
        LevelFilter::INFO
    });

    let env_filter = EnvFilter::builder()
        .with_default_directive(default_level.into())
        .with_env_var(LOG_ENV_VAR)
        .from_env_lossy();

    let fmt = fmt::layer()
        .with_ansi(true)
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_writer(indicatif_layer.get_stderr_writer())
        .pretty();

    tracing_subscriber::registry()
        .with(fmt)
        .with(indicatif_layer)
        .with(env_filter)
        .init();
}
