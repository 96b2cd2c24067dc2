//! Error types returned by this crate.

use std::fmt;

/// Stage of transaction control during which a database error occurred.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TxOp {
    /// `BEGIN` or `SAVEPOINT`.
    Enter,
    /// `COMMIT` or `RELEASE SAVEPOINT`.
    Commit,
    /// `ROLLBACK` or `ROLLBACK TO SAVEPOINT`.
    Rollback,
}

impl fmt::Display for TxOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Enter => write!(f, "enter"),
            Self::Commit => write!(f, "commit"),
            Self::Rollback => write!(f, "rollback"),
        }
    }
}

/// Errors produced by services, clients and subscribers.
#[derive(Debug)]
pub enum Error {
    /// Required configuration is absent or conflicting. Raised before any
    /// I/O is attempted, e.g. when neither a connection URL nor an
    /// externally supplied client exists.
    Configuration(String),

    /// An error surfaced verbatim from the database driver.
    Db(tokio_postgres::Error),

    /// A database error raised while entering, committing or rolling back
    /// a transaction envelope. The driver error is preserved; rollback
    /// failures are logged and never replace the error that caused the
    /// rollback.
    Transaction {
        /// Which transaction-control statement failed.
        op: TxOp,
        /// The underlying driver error.
        source: tokio_postgres::Error,
    },

    /// Listening on a notification channel failed.
    Listen {
        /// The channel that was being listened on.
        channel: String,
        /// The underlying error.
        source: Box<Error>,
    },

    /// `subscribe` or `release` was called on a released subscriber.
    SubscriberReleased,

    /// An operation was attempted on a released pool.
    PoolReleased,

    /// `release` was called more than once.
    DoubleRelease,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Configuration(msg) => write!(f, "configuration error: {}", msg),
            Self::Db(e) => write!(f, "{}", e),
            Self::Transaction { op, source } => {
                write!(f, "transaction {} failed: {}", op, source)
            }
            Self::Listen { channel, source } => {
                write!(f, "listen failed on channel {:?}: {}", channel, source)
            }
            Self::SubscriberReleased => write!(f, "subscriber has been released"),
            Self::PoolReleased => write!(f, "pool has been released"),
            Self::DoubleRelease => write!(f, "release called more than once"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Db(e) => Some(e),
            Self::Transaction { source, .. } => Some(source),
            Self::Listen { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<tokio_postgres::Error> for Error {
    fn from(e: tokio_postgres::Error) -> Self {
        Self::Db(e)
    }
}

impl Error {
    /// Whether this error reports a prepared statement that no longer
    /// exists on the server.
    pub(crate) fn is_missing_statement(&self) -> bool {
        match self {
            Self::Db(e) => e.to_string().contains("does not exist"),
            _ => false,
        }
    }
}
