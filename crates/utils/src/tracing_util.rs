//! Helpers related to tracing, used by main entrypoints.

use tracing_subscriber::EnvFilter;

/// Initialize the global tracing subscriber. Diagnostics go to stderr
/// with a timestamp and severity; progress narration stays on stdout.
/// `WINSTICK_LOG` (an `EnvFilter` spec) overrides the verbosity count.
pub fn initialize_tracing(verbosity: u8) {
    let default_level = match verbosity {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_env("WINSTICK_LOG")
        .unwrap_or_else(|_| EnvFilter::new(default_level));
    let r = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_file(true)
        .with_line_number(true)
        .try_init();
    // Re-initialization only happens in tests
    drop(r);
}
