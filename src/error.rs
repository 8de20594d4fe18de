//! Error taxonomy for the client.
//!
//! Every failure carries a stable kind plus a printable message; OS-level
//! failures embed the platform error string after the operation that
//! produced them.

use std::io;

use thiserror::Error;

/// Broad classification of a client error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Socket-level failure.
    Io,
    /// Allocation failure reported by a collaborator.
    Oom,
    /// The peer closed the connection.
    Eof,
    /// The reply stream could not be parsed.
    Protocol,
    /// Logical failure: exhausted node list, server-side error reply, slot
    /// pool exhaustion.
    Other,
}

/// A client error.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct Error {
    pub kind: ErrorKind,
    pub message: String,
}

impl Error {
    pub(crate) fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Wrap an OS error as `"<operation>: <os error string>"`.
    pub(crate) fn io(op: &str, err: &io::Error) -> Self {
        Self::new(ErrorKind::Io, format!("{op}: {err}"))
    }

    pub(crate) fn other(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Other, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_carry_the_operation_prefix() {
        let err = Error::io(
            "connect",
            &io::Error::new(io::ErrorKind::ConnectionRefused, "refused"),
        );
        assert_eq!(err.kind, ErrorKind::Io);
        assert!(err.message.starts_with("connect: "));
    }
}
