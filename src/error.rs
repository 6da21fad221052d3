use thiserror::Error;

// Errors that reach the boundary.  Any of them disables the engine for the
// rest of the process; the loader then sees every call pass through
// unchanged.  Search misses and fatal candidate errors are not errors at
// this level: the prober encodes them in its verdict and the executor
// propagates fatal candidates as path strings the loader fails on itself.
#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot read configuration: {0}")]
    ConfigRead(#[from] std::io::Error),

    #[error("cannot parse configuration: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    #[error("invalid pattern: {0}")]
    BadPattern(#[from] regex::Error),

    #[error("invalid log level '{0}'")]
    BadLogLevel(String),

    #[error("internal invariant violated: {0}")]
    Internal(&'static str),
}
