use std::fmt::Display;

/// EmberDB errors.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// The transaction handle was used after it finished.
    TxClosed,
    /// A mutation was attempted on a read-only transaction.
    TxNotWritable,
    /// The database was used after `close`.
    DatabaseClosed,
    /// Missing key, expired item, or unknown index.
    NotFound,
    /// Invalid data, typically a malformed log entry or corruption.
    Invalid(String),
    /// An index with the same name already exists.
    IndexExists,
    /// The named index does not exist.
    IndexNotFound,
    /// Unknown sync policy name.
    InvalidSyncPolicy,
    /// An IO error.
    Io(String),
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::TxClosed => write!(f, "tx closed"),
            Error::TxNotWritable => write!(f, "tx not writable"),
            Error::DatabaseClosed => write!(f, "database closed"),
            Error::NotFound => write!(f, "not found"),
            Error::Invalid(msg) => write!(f, "invalid database: {msg}"),
            Error::IndexExists => write!(f, "index exists"),
            Error::IndexNotFound => write!(f, "index not found"),
            Error::InvalidSyncPolicy => write!(f, "invalid sync policy"),
            Error::Io(msg) => write!(f, "io error: {msg}"),
        }
    }
}

/// Constructs an Error::Invalid for the given format string.
#[macro_export]
macro_rules! errinvalid {
    ($($args:tt)*) => { $crate::error::Error::Invalid(format!($($args)*)).into() };
}

/// An EmberDB Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl<T> From<Error> for Result<T> {
    fn from(error: Error) -> Self {
        Err(error)
    }
}

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
