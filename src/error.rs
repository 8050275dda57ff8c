//! Error types for kvi.
//!
//! Connection-facing failures collapse into four dispositions: `Hard`
//! errors are reported to the client and terminate the connection, `Soft`
//! errors are reported and the connection continues, `Closed` covers
//! normal peer disconnects, and `ReadWrite` covers every other OS-level
//! I/O failure.

use std::io;
use thiserror::Error;

/// Errors produced while serving a single client connection.
#[derive(Error, Debug)]
pub enum ConnError {
    /// Protocol-level violation; report `-ERR <msg>` and disconnect.
    #[error("{0}")]
    Hard(String),

    /// Semantic violation (e.g. unknown command); report `-ERR <msg>`,
    /// resynchronize the pipeline and keep the connection.
    #[error("{0}")]
    Soft(String),

    /// EOF or peer reset; terminate silently.
    #[error("connection closed")]
    Closed,

    /// Any other I/O failure; log at debug and terminate silently.
    #[error("I/O error: {0}")]
    ReadWrite(io::Error),
}

impl ConnError {
    /// A byte sequence incompatible with the wire grammar.
    pub fn invalid_syntax() -> Self {
        ConnError::Hard("the syntax is invalid".to_string())
    }

    /// A well-formed bulk string that is not a known command name.
    pub fn invalid_command(name: &[u8]) -> Self {
        ConnError::Soft(format!(
            "the command {} is invalid",
            String::from_utf8_lossy(name)
        ))
    }

    /// `HELLO` with anything other than protocol version 3.
    pub fn unsupported_protocol(version: &str) -> Self {
        ConnError::Hard(format!("unsupported protocol version '{version}'"))
    }

    /// True if the error carries a message the client should see.
    pub fn is_reportable(&self) -> bool {
        matches!(self, ConnError::Hard(_) | ConnError::Soft(_))
    }
}

impl From<io::Error> for ConnError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof => ConnError::Closed,
            _ => ConnError::ReadWrite(err),
        }
    }
}

/// Configuration and CLI validation failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A flag that the server does not recognize.
    #[error("unknown option '{0}'")]
    UnknownFlag(String),

    /// A flag that requires a value got none.
    #[error("option '{0}' requires a value")]
    MissingValue(&'static str),

    /// A value that failed to parse or is out of range.
    #[error("invalid value '{value}' for option '{flag}'")]
    InvalidValue {
        /// The flag being parsed.
        flag: &'static str,
        /// The offending value.
        value: String,
    },

    /// A numeric option that must be strictly positive was zero.
    #[error("option '{0}' must be a positive integer")]
    NotPositive(&'static str),
}
