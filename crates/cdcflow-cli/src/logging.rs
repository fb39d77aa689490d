use std::sync::Once;

use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

/// Targets that log every batch; capped unless `RUST_LOG` says otherwise.
const QUIET_TARGETS: &[&str] = &["cdcflow_engine::replay=error"];

/// Initialize structured logging with tracing-subscriber.
///
/// Uses the `RUST_LOG` env var if set, otherwise falls back to the provided
/// level. Later calls are no-ops.
pub fn init(log_level: &str) {
    INIT.call_once(|| {
        let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            QUIET_TARGETS
                .iter()
                .filter_map(|directive| directive.parse().ok())
                .fold(EnvFilter::new(log_level), EnvFilter::add_directive)
        });

        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init();
    });
}
