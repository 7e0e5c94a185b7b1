//! Tracing subscriber setup for front ends embedding the engine.

use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Default filter when `RUST_LOG` is unset.
pub const DEFAULT_DIRECTIVES: &str = "infrarec_engine=info,infrarec::audit=info";

fn filter(default_directives: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| default_directives.into())
}

/// Install a global fmt subscriber. `RUST_LOG` overrides `default_directives`.
///
/// Panics if a global subscriber is already set; use [`try_init_logging`]
/// where that can happen (tests).
pub fn init_logging(default_directives: &str) {
    tracing_subscriber::registry()
        .with(filter(default_directives))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Like [`init_logging`] but returns an error instead of panicking.
pub fn try_init_logging(default_directives: &str) -> Result<(), TryInitError> {
    tracing_subscriber::registry()
        .with(filter(default_directives))
        .with(tracing_subscriber::fmt::layer())
        .try_init()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_try_init_twice() {
        let _ = try_init_logging(DEFAULT_DIRECTIVES);
        assert!(try_init_logging(DEFAULT_DIRECTIVES).is_err());
    }
}
