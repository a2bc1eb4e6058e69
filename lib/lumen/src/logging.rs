//! Logging plumbing shared by every crate in the workspace.
//!
//! Call sites import this module and use the re-exported `slog` macros, so
//! structured logging reads the same everywhere:
//!
//! ```ignore
//! use lumen::logging;
//!
//! logging::debug!(self.log, "connection opened"; "conn_id" => id);
//! ```

pub use slog::{crit, debug, error, info, o, trace, warn, Discard, Drain, Logger};

use sloggers::{Config, LoggerConfig};
use std::fmt;

const DEFAULT_CONFIG: &str = r#"
type = "terminal"
level = "debug"
destination = "stderr"
"#;

/// Errors raised while constructing the root logger.
#[derive(Debug)]
pub enum BuildError {
    /// The TOML snippet did not describe a valid logger configuration.
    Parse(serdeconv::Error),
    /// The configuration was valid but the drain could not be built.
    Build(sloggers::Error),
}

impl fmt::Display for BuildError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BuildError::Parse(err) => write!(f, "invalid logger config: {}", err),
            BuildError::Build(err) => write!(f, "failed to build logger: {}", err),
        }
    }
}

impl std::error::Error for BuildError {}

/// Builds the root logger from a TOML snippet describing a
/// `sloggers::LoggerConfig`.
pub fn from_toml(toml: &str) -> Result<Logger, BuildError> {
    let config: LoggerConfig = serdeconv::from_toml_str(toml).map_err(BuildError::Parse)?;
    from_config(&config)
}

/// Builds the root logger from an already parsed configuration. Used by
/// binaries that embed the logger configuration in their own config file.
pub fn from_config(config: &LoggerConfig) -> Result<Logger, BuildError> {
    config.build_logger().map_err(BuildError::Build)
}

/// Builds the default root logger: terminal drain, debug level, stderr.
pub fn init() -> Logger {
    from_toml(DEFAULT_CONFIG).expect("default logger config must be valid")
}
