//! Tracing subscriber setup
//!
//! The library only emits `tracing` events. Binaries, notebooks and tests
//! that want to see them call [`init_tracing`] once.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::{Error, Result};

/// Install a global `fmt` subscriber.
///
/// `RUST_LOG` wins when set; otherwise `default_directive` (e.g. `"info"` or
/// `"trueno_ab=debug"`) is used.
///
/// # Errors
///
/// Returns `Logging` if the directive does not parse or a global subscriber
/// is already installed.
pub fn init_tracing(default_directive: &str) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(default_directive)
            .map_err(|e| Error::Logging(format!("invalid directive '{default_directive}': {e}")))?,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .try_init()
        .map_err(|e| Error::Logging(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_install_fails_cleanly() {
        // Whichever call installs first, the second must report instead of panicking
        let first = init_tracing("trueno_ab=debug");
        let second = init_tracing("info");
        assert!(first.is_ok() || second.is_err());
        assert!(matches!(second, Err(Error::Logging(_))));
    }
}
