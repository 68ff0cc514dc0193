//! Error types for StormGate
//!
//! Errors carry two machine-readable dimensions: a coarse [`ErrorClass`]
//! matching the caller-observable taxonomy (retryability, cancellation) and,
//! where the error is part of the stable surface, a short `VT`-code that must
//! keep its semantics across releases.

use thiserror::Error;

/// Result type alias using StormGate's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse error classification, used by callers to decide on retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Invalid or unsupported input. Not retryable.
    BadRequest,
    /// A bounded resource (pool, sort buffer, prepared slots) is full.
    ResourceExhausted,
    /// No backend can serve the request right now. Retryable after backoff.
    Unavailable,
    /// The operation was rolled back or the connection died mid-flight.
    Aborted,
    /// Duplicate key or duplicate object.
    AlreadyExists,
    /// The caller's context was cancelled.
    Canceled,
    /// The caller's deadline expired.
    DeadlineExceeded,
    /// Identity was required but missing.
    Unauthenticated,
    /// An internal invariant was violated.
    Internal,
}

/// Main error type for StormGate
#[derive(Error, Debug)]
pub enum Error {
    // Planner errors
    #[error("aggregate functions take a single argument: {0}")]
    InvalidAggregation(String),

    #[error("cannot group on aggregate expression: {0}")]
    AggrInGroupBy(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("{0} not found: {1}")]
    NotFound(String, String),

    #[error("ambiguous column reference: {0}")]
    AmbiguousColumn(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    // Runtime errors
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("transaction aborted: {0}")]
    Aborted(String),

    #[error("{0} already exists: {1}")]
    AlreadyExists(String, String),

    #[error("operation cancelled: {0}")]
    Canceled(String),

    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),

    #[error("missing caller id")]
    MissingCallerId,

    // Prepared transaction errors
    #[error("prepared transaction: {0}")]
    Prepared(String),

    // Configuration errors
    #[error("configuration error: {0}")]
    Config(String),

    // Internal errors
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn unsupported(msg: impl Into<String>) -> Self {
        Error::Unsupported(msg.into())
    }

    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Error::NotFound(kind.into(), name.into())
    }

    pub fn already_exists(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Error::AlreadyExists(kind.into(), name.into())
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        Error::Unavailable(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }

    /// Coarse classification per the error-handling contract.
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::InvalidAggregation(_)
            | Error::AggrInGroupBy(_)
            | Error::Unsupported(_)
            | Error::NotFound(_, _)
            | Error::AmbiguousColumn(_)
            | Error::InvalidArgument(_)
            | Error::Config(_) => ErrorClass::BadRequest,
            Error::ResourceExhausted(_) => ErrorClass::ResourceExhausted,
            Error::Unavailable(_) => ErrorClass::Unavailable,
            Error::Aborted(_) | Error::Prepared(_) => ErrorClass::Aborted,
            Error::AlreadyExists(_, _) => ErrorClass::AlreadyExists,
            Error::Canceled(_) => ErrorClass::Canceled,
            Error::DeadlineExceeded(_) => ErrorClass::DeadlineExceeded,
            Error::MissingCallerId => ErrorClass::Unauthenticated,
            Error::Internal(_) => ErrorClass::Internal,
        }
    }

    /// Stable short code, where the error is part of the versioned surface.
    ///
    /// Codes follow the `VTnnnnn` convention; their semantics never change.
    pub fn code(&self) -> Option<&'static str> {
        match self {
            Error::InvalidAggregation(_) => Some("VT03001"),
            Error::AggrInGroupBy(_) => Some("VT03005"),
            Error::NotFound(_, _) => Some("VT05000"),
            Error::Prepared(_) => Some("VT09025"),
            Error::Unsupported(_) => Some("VT12001"),
            Error::Internal(_) => Some("VT13001"),
            _ => None,
        }
    }

    /// Whether the caller may retry the operation after a backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self.class(), ErrorClass::Unavailable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::not_found("table", "users");
        assert_eq!(err.to_string(), "table not found: users");

        let err = Error::Unsupported("subqueries in GROUP BY".into());
        assert_eq!(err.to_string(), "unsupported: subqueries in GROUP BY");
    }

    #[test]
    fn test_error_codes_stable() {
        assert_eq!(Error::InvalidAggregation("count(a, b)".into()).code(), Some("VT03001"));
        assert_eq!(Error::AggrInGroupBy("sum(x)".into()).code(), Some("VT03005"));
        assert_eq!(Error::not_found("keyspace", "ks").code(), Some("VT05000"));
        assert_eq!(Error::Prepared("locked for committing".into()).code(), Some("VT09025"));
        assert_eq!(Error::unsupported("'*' expression in cross-shard query").code(), Some("VT12001"));
        assert_eq!(Error::internal("oops").code(), Some("VT13001"));
        assert_eq!(Error::unavailable("no shard").code(), None);
    }

    #[test]
    fn test_error_class() {
        assert_eq!(Error::unsupported("x").class(), ErrorClass::BadRequest);
        assert_eq!(Error::ResourceExhausted("pool full".into()).class(), ErrorClass::ResourceExhausted);
        assert_eq!(Error::unavailable("no shard").class(), ErrorClass::Unavailable);
        assert_eq!(Error::already_exists("row", "foo").class(), ErrorClass::AlreadyExists);
        assert_eq!(Error::Canceled("context".into()).class(), ErrorClass::Canceled);
        assert_eq!(Error::DeadlineExceeded("10ms".into()).class(), ErrorClass::DeadlineExceeded);
        assert_eq!(Error::MissingCallerId.class(), ErrorClass::Unauthenticated);
    }

    #[test]
    fn test_retryability() {
        assert!(Error::unavailable("tablet unreachable").is_retryable());
        assert!(!Error::unsupported("x").is_retryable());
        assert!(!Error::Canceled("c".into()).is_retryable());
    }
}
