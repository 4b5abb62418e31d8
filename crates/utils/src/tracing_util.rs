//! Helpers related to tracing, used by main entrypoints

use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

/// Initialize tracing with the default configuration.
///
/// `RUST_LOG` takes precedence; otherwise events at `default_level` and
/// above are shown.
pub fn initialize_tracing(default_level: tracing::Level) {
    // Don't include timestamps and such because they're not really useful and
    // too verbose; build logs are usually captured by something that already
    // timestamps them.
    let format = tracing_subscriber::fmt::format()
        .without_time()
        .with_target(false)
        .compact();
    let default_directive = LevelFilter::from_level(default_level).into();
    let filter = EnvFilter::builder()
        .with_default_directive(default_directive)
        .from_env_lossy();
    // Log to stderr by default
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .event_format(format)
        .with_writer(std::io::stderr)
        .init();
}
