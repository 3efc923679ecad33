//! Logging initialisation

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Install a global subscriber. `RUST_LOG` wins over `default_directive`
/// (for example `"food_catalog=info"`).
///
/// Returns `false` if a subscriber was already installed, so tests and
/// embedding applications can call this freely.
pub fn init_tracing(default_directive: &str) -> bool {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_directive.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .is_ok()
}
