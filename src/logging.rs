//! Tracing setup for binaries and tests embedding VibeMesh

use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Install a compact fmt subscriber at `level` (`RUST_LOG` wins when set).
///
/// Returns false if a global subscriber was already installed, so calling
/// it from several tests or channels is harmless.
pub fn init(level: &str) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_twice_is_harmless() {
        init("debug");
        assert!(!init("info"));
    }
}
