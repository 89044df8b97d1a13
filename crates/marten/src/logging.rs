//! Logging setup on the `tracing` ecosystem.
//!
//! Library code only emits events: `debug!` for load summaries and backend
//! switches, `trace!` per scheduled node and released port, `warn!` when a
//! GPU readback fails. Binaries and tests opt in to seeing them with
//! [`init_logging`].
//!
//! # Environment Variables
//!
//! - `MARTEN_LOG`: a full `EnvFilter` directive (e.g. `"debug"`,
//!   `"warn,marten::exec=trace"`); overrides the level passed in code.

use marten_core::{Error, Result};
use tracing_subscriber::{fmt, EnvFilter};

/// Environment variable for the filter override.
pub const LOG_ENV: &str = "MARTEN_LOG";

/// Filter used when `MARTEN_LOG` is unset or unparsable.
pub fn filter_for(level: &str) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(level))
}

/// Install a global `fmt` subscriber at `level` (`"info"`, `"debug"`, ...).
///
/// Fails if a global subscriber is already installed.
pub fn init_logging(level: &str) -> Result<()> {
    fmt()
        .with_env_filter(filter_for(level))
        .with_target(true)
        .try_init()
        .map_err(|e| Error::msg(format!("failed to initialize logging: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_fails() {
        // the first call may lose to another test in this process
        let _ = init_logging("warn");
        assert!(init_logging("warn").is_err());
    }
}
