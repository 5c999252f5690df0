use std::fmt::Display;

use serde::{Deserialize, Serialize};

/// Cinder errors.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Error {
    /// A write conflicted with a concurrent transaction and lost. The
    /// operation must be retried under a fresh transaction.
    Conflict,
    /// Structural damage reported by the engine while verifying a table.
    Corrupt(String),
    /// Invalid data, typically decoding errors, malformed oplog ids, or
    /// unexpected internal values.
    InvalidData(String),
    /// Invalid user input, typically unsupported options or out-of-range
    /// configuration values.
    InvalidInput(String),
    /// The operation is not valid for this collection type.
    IllegalOperation(String),
    /// An IO error.
    IO(String),
    /// A record larger than the capped collection allows.
    RecordTooLarge(String),
    /// The table's format version is outside the supported range.
    UnsupportedVersion(i32),
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Conflict => write!(f, "write conflict, retry transaction"),
            Error::Corrupt(msg) => write!(f, "corrupt table: {msg}"),
            Error::InvalidData(msg) => write!(f, "invalid data: {msg}"),
            Error::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            Error::IllegalOperation(msg) => write!(f, "illegal operation: {msg}"),
            Error::IO(msg) => write!(f, "io error: {msg}"),
            Error::RecordTooLarge(msg) => write!(f, "record too large: {msg}"),
            Error::UnsupportedVersion(v) => write!(f, "unsupported table format version {v}"),
        }
    }
}

/// Constructs an Error::InvalidData for the given format string.
#[macro_export]
macro_rules! errdata {
    ($($args:tt)*) => { $crate::error::Error::InvalidData(format!($($args)*)).into() };
}

/// Constructs an Error::InvalidInput for the given format string.
#[macro_export]
macro_rules! errinput {
    ($($args:tt)*) => { $crate::error::Error::InvalidInput(format!($($args)*)).into() };
}

/// A cinder Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl<T> From<Error> for Result<T> {
    fn from(error: Error) -> Self {
        Err(error)
    }
}

impl From<Box<bincode::ErrorKind>> for Error {
    fn from(err: Box<bincode::ErrorKind>) -> Self {
        Error::InvalidData(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IO(err.to_string())
    }
}
