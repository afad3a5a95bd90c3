//! Centralized logging configuration for tests and downstream binaries.
//!
//! Provides a consistent tracing setup with a default INFO level, overrideable
//! through the `RUST_LOG` environment variable.

use tracing::Level;

/// Initialize the tracing subscriber with the library's standard configuration.
///
/// Default log level: INFO (overrideable via `RUST_LOG`).
///
/// # Example
/// ```no_run
/// manifold_filter::init_logger();
/// tracing::info!("filter starting");
/// ```
pub fn init_logger() {
    init_logger_with_level(Level::INFO)
}

/// Initialize the tracing subscriber with a custom default level.
///
/// ```bash
/// RUST_LOG=manifold_filter=debug cargo test
/// ```
pub fn init_logger_with_level(default_level: Level) {
    use tracing_subscriber::fmt::time::SystemTime;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(default_level.into())
                .from_env_lossy(),
        )
        .with_timer(SystemTime)
        .with_target(true)
        .with_level(true)
        .init();
}
