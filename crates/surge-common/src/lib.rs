//! Shared error taxonomy, configuration, and wire-metric types.

pub mod config;
pub mod metrics;

use std::time::Duration;

pub type Result<T> = std::result::Result<T, SurgeError>;

#[derive(thiserror::Error, Debug)]
pub enum SurgeError {
    /// One stream line failed to parse as JSON. Recovered locally: the
    /// decoder drops the line and the stream continues.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// A terminal record arrived but no metrics were captured for the run
    /// and none were embedded in the terminal record itself.
    #[error("terminal record for level {0} carried no metrics")]
    MissingMetrics(u32),

    /// The byte stream ended before any terminal record was seen.
    #[error("stream ended before a terminal record")]
    IncompleteStream,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("run exceeded timeout of {0:?}")]
    Timeout(Duration),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl SurgeError {
    /// Whether the error kills the whole ramp (everything except a
    /// malformed frame, which is dropped in place).
    pub fn is_fatal(&self) -> bool {
        !matches!(self, SurgeError::MalformedFrame(_))
    }
}
