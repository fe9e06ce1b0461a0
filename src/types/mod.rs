#![forbid(unsafe_code)]
//! Error and result types shared by every layer of the engine.

use std::fmt;

/// Errors surfaced by the storage engine.
///
/// Capacity exhaustion, short output buffers and missing keys are ordinary
/// return values and never show up here.
#[derive(thiserror::Error, Debug)]
pub enum BigMapError {
    /// IO failure while loading configuration.
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    /// Internal invariant violated; the in-memory structure cannot be trusted.
    #[error("corruption: {0}")]
    Corruption(&'static str),
    /// Caller supplied an argument the engine cannot accept.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// Configuration could not be parsed or failed validation.
    #[error("config: {0}")]
    Config(String),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, BigMapError>;

/// Marker returned when a block changed shape between lookup and lock.
///
/// The holder must re-resolve the block from the index and try again. The
/// engine loops on this internally; it never reaches public callers.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Retry;

impl fmt::Display for Retry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("block changed concurrently, retry required")
    }
}

impl From<toml::de::Error> for BigMapError {
    fn from(err: toml::de::Error) -> Self {
        BigMapError::Config(err.to_string())
    }
}
