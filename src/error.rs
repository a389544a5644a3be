use std::fmt::Display;

use serde::{Deserialize, Serialize};

/// stratadb errors.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Error {
    /// The requested key does not exist (or its newest record is a tombstone).
    NotFound,
    /// On-disk data failed a checksum, format, or invariant check.
    Corruption(String),
    /// Invalid caller input, typically malformed keys or options.
    InvalidArgument(String),
    /// An IO error.
    Io(String),
    /// The operation is not supported by this build or configuration.
    NotSupported(String),
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::NotFound => write!(f, "not found"),
            Error::Corruption(msg) => write!(f, "corruption: {msg}"),
            Error::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            Error::Io(msg) => write!(f, "io error: {msg}"),
            Error::NotSupported(msg) => write!(f, "not supported: {msg}"),
        }
    }
}

/// A stratadb Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Error::Io(err.to_string())
    }
}
