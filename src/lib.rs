//! Exactly-once single-choice voting
//!
//! Each device casts at most one vote for one candidate. The shared tally
//! store enforces uniqueness with an optimistic transaction; a local record
//! gives a fast-path reject and survives restarts.

pub mod config;
pub mod coordinator;
pub mod errors;
pub mod local;
pub mod renderer;
pub mod results;
pub mod store;
pub mod types;

// Re-export commonly used types
pub use coordinator::VotingCoordinator;
pub use errors::{Error, Result};

use config::LoggingConfig;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize logging
///
/// `RUST_LOG` wins over the configured level. Calling this twice is harmless.
pub fn init(logging: &LoggingConfig) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("tally={}", logging.level).into());

    let installed = if logging.is_json() {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .try_init()
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .try_init()
    };

    if installed.is_ok() {
        tracing::info!("🗳️  Tally v{} initialized", VERSION);
    }
    Ok(())
}
