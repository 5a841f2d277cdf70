//! Error types for the connection core.
//!
//! Every failure is reported either synchronously (state errors) or through the
//! `(error, result)` completion pair delivered to the operation's callback.

use std::collections::HashMap;
use std::fmt;

use thiserror::Error;

/// SQLSTATE reported for operations on a closed or aborted connection.
pub const SQLSTATE_CONNECTION_DOES_NOT_EXIST: &str = "08003";

/// Result type for connection operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Operation attempted in the wrong connection state. Programmer error;
    /// the connection handle is not touched.
    #[error("Unexpected state; expecting {expected}, found {actual}")]
    State {
        expected: &'static str,
        actual: &'static str,
    },

    /// The server rejected or failed a command.
    #[error("{0}")]
    Server(ServerError),

    /// Connect failure, lost socket, failed cancel request.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The connection was closed, possibly while the operation was in flight.
    #[error("connection is closed")]
    Closed,

    /// An ingress COPY was ended with an error message instead of being committed.
    #[error("COPY aborted: {0}")]
    CopyAborted(String),

    /// The server reply did not match the operation (e.g. a COPY expected).
    #[error("{0}")]
    Protocol(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The dedicated worker thread could not be started.
    #[error("Failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Coarse classification of [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    State,
    Server,
    Transport,
    Abort,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::State { .. } | Error::InvalidArgument(_) => ErrorKind::State,
            Error::Server(_) | Error::CopyAborted(_) | Error::Protocol(_) => ErrorKind::Server,
            Error::Transport(_) | Error::Spawn(_) => ErrorKind::Transport,
            Error::Closed => ErrorKind::Abort,
        }
    }

    /// The SQLSTATE code, when one is known.
    pub fn sql_state(&self) -> Option<&str> {
        match self {
            Error::Server(e) => e.code(),
            Error::Closed => Some(SQLSTATE_CONNECTION_DOES_NOT_EXIST),
            _ => None,
        }
    }

    pub fn is_state_error(&self) -> bool {
        self.kind() == ErrorKind::State
    }

    pub(crate) fn state(expected: &'static str, actual: &'static str) -> Self {
        Error::State { expected, actual }
    }
}

impl From<ServerError> for Error {
    fn from(e: ServerError) -> Self {
        Error::Server(e)
    }
}

// ============================================================================
// Server errors
// ============================================================================

/// Identifiers of the fields a server error report may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorField {
    Severity,
    SqlState,
    MessagePrimary,
    MessageDetail,
    MessageHint,
    StatementPosition,
    InternalPosition,
    InternalQuery,
    Context,
    SchemaName,
    TableName,
    ColumnName,
    DatatypeName,
    ConstraintName,
    SourceFile,
    SourceLine,
    SourceFunction,
}

impl ErrorField {
    /// Single-byte field code used on the wire.
    pub fn code(self) -> u8 {
        match self {
            ErrorField::Severity => b'S',
            ErrorField::SqlState => b'C',
            ErrorField::MessagePrimary => b'M',
            ErrorField::MessageDetail => b'D',
            ErrorField::MessageHint => b'H',
            ErrorField::StatementPosition => b'P',
            ErrorField::InternalPosition => b'p',
            ErrorField::InternalQuery => b'q',
            ErrorField::Context => b'W',
            ErrorField::SchemaName => b's',
            ErrorField::TableName => b't',
            ErrorField::ColumnName => b'c',
            ErrorField::DatatypeName => b'd',
            ErrorField::ConstraintName => b'n',
            ErrorField::SourceFile => b'F',
            ErrorField::SourceLine => b'L',
            ErrorField::SourceFunction => b'R',
        }
    }
}

/// An error report produced by the server, keyed by field code.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerError {
    fields: HashMap<u8, String>,
}

impl ServerError {
    pub fn new(severity: &str, code: &str, message: &str) -> Self {
        Self::default()
            .with(ErrorField::Severity, severity)
            .with(ErrorField::SqlState, code)
            .with(ErrorField::MessagePrimary, message)
    }

    /// Build from raw `(code, value)` pairs as reported by the client library.
    pub fn from_fields(fields: HashMap<u8, String>) -> Self {
        Self { fields }
    }

    pub fn with(mut self, field: ErrorField, value: impl Into<String>) -> Self {
        self.fields.insert(field.code(), value.into());
        self
    }

    pub fn field(&self, field: ErrorField) -> Option<&str> {
        self.fields.get(&field.code()).map(String::as_str)
    }

    pub fn severity(&self) -> Option<&str> {
        self.field(ErrorField::Severity)
    }

    pub fn code(&self) -> Option<&str> {
        self.field(ErrorField::SqlState)
    }

    pub fn message(&self) -> &str {
        self.field(ErrorField::MessagePrimary).unwrap_or("unknown server error")
    }

    pub fn detail(&self) -> Option<&str> {
        self.field(ErrorField::MessageDetail)
    }

    pub fn hint(&self) -> Option<&str> {
        self.field(ErrorField::MessageHint)
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.severity().unwrap_or("ERROR"), self.message())?;
        if let Some(code) = self.code() {
            write!(f, " ({})", code)?;
        }
        if let Some(d) = self.detail() {
            write!(f, "\nDetail: {}", d)?;
        }
        if let Some(h) = self.hint() {
            write!(f, "\nHint: {}", h)?;
        }
        Ok(())
    }
}

impl std::error::Error for ServerError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closed_reports_connection_sqlstate() {
        let err = Error::Closed;
        assert_eq!(err.sql_state(), Some("08003"));
        assert_eq!(err.kind(), ErrorKind::Abort);
        assert_eq!(err.to_string(), "connection is closed");
    }

    #[test]
    fn test_server_error_fields() {
        let err = ServerError::new("ERROR", "42601", "syntax error at or near \"bad\"")
            .with(ErrorField::StatementPosition, "17");

        assert_eq!(err.severity(), Some("ERROR"));
        assert_eq!(err.field(ErrorField::StatementPosition), Some("17"));
        assert_eq!(err.field(ErrorField::TableName), None);

        let err = Error::from(err);
        assert_eq!(err.sql_state(), Some("42601"));
        assert_eq!(err.kind(), ErrorKind::Server);
        assert!(err.to_string().starts_with("ERROR: syntax error"));
    }

    #[test]
    fn test_state_error_message() {
        let err = Error::state("READY", "BUSY");
        assert!(err.is_state_error());
        assert_eq!(err.to_string(), "Unexpected state; expecting READY, found BUSY");
    }
}
