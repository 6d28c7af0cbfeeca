use sloggers::{Config, LoggerConfig};
use std::fmt;
use std::path::Path;

pub use slog::{crit, debug, error, info, o, trace, warn, Discard, Drain, Level, Logger};

const DEFAULT_CONFIG: &str = r#"
type = "terminal"
level = "debug"
destination = "stderr"
"#;

/// Failure to construct the root logger from its configuration.
#[derive(Debug)]
pub struct InitError(String);

impl fmt::Display for InitError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "logger initialization failed: {}", self.0)
    }
}

impl std::error::Error for InitError {}

/// Builds the root logger from a logger configuration file in TOML format.
pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Logger, InitError> {
    let config: LoggerConfig =
        serdeconv::from_toml_file(path).map_err(|err| InitError(err.to_string()))?;

    config
        .build_logger()
        .map_err(|err| InitError(err.to_string()))
}

/// Builds the root logger from an inline TOML logger configuration.
pub fn from_toml_str(config: &str) -> Result<Logger, InitError> {
    let config: LoggerConfig =
        serdeconv::from_toml_str(config).map_err(|err| InitError(err.to_string()))?;

    config
        .build_logger()
        .map_err(|err| InitError(err.to_string()))
}

/// Builds the default terminal logger (debug level, stderr).
pub fn init() -> Logger {
    from_toml_str(DEFAULT_CONFIG).expect("Error building the default terminal logger")
}

/// A logger that swallows all records. Used by tests and components
/// constructed without a logging context.
pub fn discard() -> Logger {
    Logger::root(Discard, o!())
}
