//! Contains the `Error` and `Result` types that `mongo-pool` uses.

use std::{fmt, sync::Arc};

use thiserror::Error;

/// The result type for all methods that can return an error in the `mongo-pool` crate.
pub type Result<T> = std::result::Result<T, Error>;

/// An error that can occur in the `mongo-pool` crate. The inner
/// [`ErrorKind`](enum.ErrorKind.html) is wrapped in a `Box` to keep the type small; the kinds
/// themselves hold `Arc`'d payloads so errors remain cloneable.
#[derive(Clone, Debug, Error)]
#[error("{kind}")]
#[non_exhaustive]
pub struct Error {
    /// The type of error that occurred.
    pub kind: Box<ErrorKind>,

    #[source]
    pub(crate) source: Option<Box<Error>>,
}

impl Error {
    pub(crate) fn new(kind: ErrorKind) -> Self {
        Self {
            kind: Box::new(kind),
            source: None,
        }
    }

    pub(crate) fn internal(message: impl Into<String>) -> Error {
        ErrorKind::Internal {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn connection_failure(message: impl Into<String>) -> Error {
        ErrorKind::ConnectionFailure {
            message: message.into(),
        }
        .into()
    }

    /// The error raised when a previously established connection is found closed mid-frame.
    pub(crate) fn auto_reconnect() -> Error {
        ErrorKind::AutoReconnect {
            message: "connection closed".to_string(),
        }
        .into()
    }

    pub(crate) fn invalid_argument(message: impl Into<String>) -> Error {
        ErrorKind::InvalidArgument {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn with_source<E: Into<Option<Error>>>(mut self, source: E) -> Self {
        self.source = source.into().map(Box::new);
        self
    }

    /// Whether this error indicates that the connection it occurred on is no longer usable.
    pub fn is_network_error(&self) -> bool {
        matches!(
            self.kind.as_ref(),
            ErrorKind::Io(..) | ErrorKind::AutoReconnect { .. } | ErrorKind::ConnectionFailure { .. }
        )
    }

    /// Whether this error was produced by the server rejecting a command.
    pub fn is_command_error(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::Command(_))
    }

    /// Whether this error occurred while attempting to authenticate a connection.
    pub fn is_auth_error(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::Authentication { .. })
    }

    /// Whether this error was caused by a socket operation timing out.
    pub fn is_network_timeout(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::Io(ref io_err) if io_err.kind() == std::io::ErrorKind::TimedOut)
    }
}

impl<E> From<E> for Error
where
    ErrorKind: From<E>,
{
    fn from(err: E) -> Self {
        Error::new(err.into())
    }
}

impl From<bson::de::Error> for ErrorKind {
    fn from(err: bson::de::Error) -> Self {
        Self::BsonDeserialization(err)
    }
}

impl From<bson::ser::Error> for ErrorKind {
    fn from(err: bson::ser::Error) -> Self {
        Self::BsonSerialization(err)
    }
}

impl From<std::io::Error> for ErrorKind {
    fn from(err: std::io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

impl From<std::io::ErrorKind> for ErrorKind {
    fn from(err: std::io::ErrorKind) -> Self {
        Self::Io(Arc::new(err.into()))
    }
}

/// The types of errors that can occur.
#[allow(missing_docs)]
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum ErrorKind {
    /// A previously established connection was found closed mid-frame. The higher-level
    /// monitor is expected to react by clearing the pool.
    #[error("{message}")]
    #[non_exhaustive]
    AutoReconnect { message: String },

    /// An error occurred while attempting to authenticate a connection.
    #[error("{message}")]
    #[non_exhaustive]
    Authentication { message: String },

    /// Wrapper around `bson::de::Error`.
    #[error("{0}")]
    BsonDeserialization(bson::de::Error),

    /// Wrapper around `bson::ser::Error`.
    #[error("{0}")]
    BsonSerialization(bson::ser::Error),

    /// The peer certificate did not verify against the requested hostname.
    #[error("certificate verification failed: {message}")]
    #[non_exhaustive]
    Certificate { message: String },

    /// The server returned an error to an attempted operation.
    #[error("Command failed: {0}")]
    Command(CommandError),

    /// A connection could not be established or obtained: connect failed, the TLS handshake
    /// failed, the wait queue timed out, or UNIX sockets are unavailable on this platform.
    #[error("{message}")]
    #[non_exhaustive]
    ConnectionFailure { message: String },

    /// An error occurred during address resolution.
    #[error("An error occurred during DNS resolution: {message}")]
    #[non_exhaustive]
    DnsResolve { message: String },

    #[error("Internal error: {message}")]
    #[non_exhaustive]
    Internal { message: String },

    /// An invalid argument was provided.
    #[error("An invalid argument was provided: {message}")]
    #[non_exhaustive]
    InvalidArgument { message: String },

    /// The server returned a reply that could not be correlated with the request: the frame
    /// header named an unexpected opcode or request id, indicating stream desynchronization.
    #[error("The server returned an invalid reply: {message}")]
    #[non_exhaustive]
    InvalidResponse { message: String },

    /// Wrapper around [`std::io::Error`](https://doc.rust-lang.org/std/io/struct.Error.html).
    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    /// The number of callers blocked waiting for a connection reached the configured cap.
    #[error("{message}")]
    #[non_exhaustive]
    WaitQueueOverflow { message: String },
}

/// An error that occurred due to a database command failing.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct CommandError {
    /// Identifies the type of error.
    pub code: i32,

    /// The name associated with the error code.
    pub code_name: String,

    /// A description of the error that occurred.
    pub message: String,
}

impl fmt::Display for CommandError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(
            fmt,
            "Error code {} ({}): {}",
            self.code, self.code_name, self.message
        )
    }
}
