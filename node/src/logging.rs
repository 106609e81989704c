//! # Structured Logging
//!
//! Initializes the `tracing` subscriber from the node's numeric log level
//! (0 = off through 6 = trace). `RUST_LOG` overrides the flag when set.
//! Output goes to stderr so stdout stays free for structured data.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Maps the CLI's numeric level to a filter directive.
pub fn level_directive(level: u8) -> &'static str {
    match level {
        0 => "off",
        1 => "error",
        2 => "warn",
        3 => "info",
        4 => "debug",
        _ => "trace",
    }
}

/// Initialize the global tracing subscriber. Call once, early in
/// `main()`; a second call panics.
pub fn init_logging(level: u8) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level_directive(level)));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_file(true)
                .with_line_number(true),
        )
        .init();

    tracing::debug!(level, "logging initialized");
}
