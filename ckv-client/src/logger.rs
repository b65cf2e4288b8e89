//! Log output setup.
//!
//! The client logs through `tracing`. Applications that already install a
//! subscriber need nothing from here; others can call [`init`].

use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

/// Installs a global fmt subscriber at `level`. `RUST_LOG` overrides it.
///
/// Returns `false` when a global subscriber was already set.
pub fn init(level: LevelFilter) -> bool {
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_init_is_refused() {
        let _ = init(LevelFilter::DEBUG);
        assert!(!init(LevelFilter::INFO));
    }
}
