//! Error types for the bridge.
//!
//! Every failure is classified by [`Severity`]. Recoverable errors are reported to the
//! peer as an `EOL(1)` terminator and the session keeps serving. Fatal errors mean the
//! byte stream can no longer be trusted to be in sync, so the session closes.

use std::io;

use thiserror::Error;

use crate::refs::Handle;

/// How the session reacts to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Report `EOL(1)` to the peer, stay open.
    Recoverable,
    /// Close both stream directions.
    Fatal,
}

#[derive(Debug, Error)]
pub enum BridgeError {
    /// Bad kind, bad rank or extent, negative length, oversized or too deeply nested frame.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("unsupported type: {0}")]
    UnsupportedType(String),

    /// Active message where a passive one was expected, or the reverse.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Evaluation(#[from] EvalError),

    #[error(transparent)]
    Reference(#[from] ReferenceError),

    #[error("stream i/o failed: {0}")]
    Io(#[from] io::Error),

    #[error("session is closed")]
    SessionClosed,

    #[error("peer closed the stream")]
    PeerClosed,

    #[error("peer is shutting down")]
    PeerShutdown,

    /// Too many consecutive recoverable failures.
    #[error("error loop bound exceeded after {0} consecutive failures")]
    ErrorLoop(u32),
}

impl BridgeError {
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedFrame(message.into())
    }

    pub fn violation(message: impl Into<String>) -> Self {
        Self::ProtocolViolation(message.into())
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    pub fn severity(&self) -> Severity {
        match self {
            Self::ProtocolViolation(_)
            | Self::InvalidArgument(_)
            | Self::Evaluation(_)
            | Self::Reference(_) => Severity::Recoverable,
            Self::MalformedFrame(_)
            | Self::UnsupportedType(_)
            | Self::Io(_)
            | Self::SessionClosed
            | Self::PeerClosed
            | Self::PeerShutdown
            | Self::ErrorLoop(_) => Severity::Fatal,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.severity() == Severity::Fatal
    }
}

/// Failure reported by a [`SymbolTable`](crate::dispatch::SymbolTable) operation.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EvalError {
    #[error("variable not found: {0}")]
    NotFound(String),

    #[error("{name} has no member '{member}'")]
    NoMember { name: String, member: String },

    #[error("{0} is not callable")]
    NotCallable(String),

    #[error("{name}: expected {expected} argument(s), got {got}")]
    Arity {
        name: String,
        expected: usize,
        got: usize,
    },

    #[error("type mismatch: {0}")]
    Type(String),

    #[error("index out of range: {0}")]
    IndexOutOfRange(String),

    #[error("syntax error: {0}")]
    Syntax(String),

    #[error("no pending result to claim")]
    NoPendingResult,

    /// The peer answered a nested request with a failure.
    #[error("remote error: {0}")]
    Remote(String),

    #[error("{0}")]
    Failed(String),
}

impl EvalError {
    pub fn type_mismatch(message: impl Into<String>) -> Self {
        Self::Type(message.into())
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// Misuse of the reference table.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReferenceError {
    #[error("reference {0} is not held")]
    NotHeld(Handle),

    #[error("reference handle 0 does not name a value")]
    NullHandle,

    #[error("reference table is full ({0} handles held)")]
    Exhausted(usize),
}

pub type Result<T> = std::result::Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn framing_errors_are_fatal() {
        assert!(BridgeError::malformed("rank -1").is_fatal());
        assert!(BridgeError::UnsupportedType("long double".into()).is_fatal());
        assert!(BridgeError::Io(io::Error::new(io::ErrorKind::BrokenPipe, "gone")).is_fatal());
        assert!(BridgeError::ErrorLoop(33).is_fatal());
    }

    #[test]
    fn dispatch_errors_are_recoverable() {
        assert_eq!(
            BridgeError::violation("reply expected").severity(),
            Severity::Recoverable
        );
        assert_eq!(
            BridgeError::from(EvalError::NotFound("x".into())).severity(),
            Severity::Recoverable
        );
        assert_eq!(
            BridgeError::from(ReferenceError::NullHandle).severity(),
            Severity::Recoverable
        );
    }

    #[test]
    fn error_display() {
        let err = BridgeError::malformed("extent 0 on axis 1");
        assert_eq!(format!("{}", err), "malformed frame: extent 0 on axis 1");

        let err = BridgeError::from(EvalError::Arity {
            name: "f".to_string(),
            expected: 2,
            got: 3,
        });
        assert_eq!(format!("{}", err), "f: expected 2 argument(s), got 3");

        let err = BridgeError::ErrorLoop(33);
        assert_eq!(
            format!("{}", err),
            "error loop bound exceeded after 33 consecutive failures"
        );
    }
}
