//! Error taxonomy shared across the query layer and the runtime
//!
//! A query either produces its full result stream or fails with exactly one
//! of these. Parse/plan variants abort before execution; runtime variants
//! travel through `finish(err)` on the failing dataset.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum Error {
    /// Query text failed at or before op-graph construction.
    #[error("parse error: {0}")]
    Parse(String),

    /// No factory registered for an operation or procedure kind.
    #[error("unknown kind: {0}")]
    UnknownKind(String),

    /// Missing, mistyped or out-of-range function argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Structural violation while planning (cycle, missing parent, ...).
    #[error("plan error: {0}")]
    Plan(String),

    /// Expression or column type mismatch at evaluation.
    #[error("type error: {0}")]
    Type(String),

    /// Storage reader or sink transport failure.
    #[error("io error: {0}")]
    Io(String),

    /// A deadline elapsed.
    #[error("timeout: {0}")]
    Timeout(String),

    /// External cancellation observed.
    #[error("query cancelled")]
    Cancelled,

    /// Memory quota exceeded.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Invariant violation; should be unreachable.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    pub fn plan(msg: impl Into<String>) -> Self {
        Error::Plan(msg.into())
    }

    pub fn typ(msg: impl Into<String>) -> Self {
        Error::Type(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Parse(e.to_string())
    }
}
