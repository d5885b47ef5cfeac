//! Error taxonomy for the relay engine
//!
//! Every collaborator call inside the engine resolves to one of a closed set
//! of error kinds. Call sites match on the kind exhaustively instead of
//! comparing error strings; raw RPC messages are mapped once, here.

use thiserror::Error;

/// Closed set of failure kinds the engine distinguishes
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// RPC timeout, empty result, storage hiccup: retried next round, never discarded
    #[error("transient failure: {0}")]
    Transient(String),

    /// Receipt missing, status not OK, required logs absent, amount/address mismatch
    #[error("validation failed: {0}")]
    Validation(String),

    /// The counterpart already holds this submission; callers treat it as success
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// The signature blob does not meet the multisig threshold
    #[error("insufficient signatures: {0}")]
    InsufficientSignatures(String),

    /// Misconfiguration or invariant violation
    #[error("fatal: {0}")]
    Fatal(String),
}

/// Discriminant of [`EngineError`], used for metrics labels and logging
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transient,
    Validation,
    AlreadyExists,
    InsufficientSignatures,
    Fatal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Transient => "transient",
            ErrorKind::Validation => "validation",
            ErrorKind::AlreadyExists => "already_exists",
            ErrorKind::InsufficientSignatures => "insufficient_signatures",
            ErrorKind::Fatal => "fatal",
        }
    }
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Transient(_) => ErrorKind::Transient,
            EngineError::Validation(_) => ErrorKind::Validation,
            EngineError::AlreadyExists(_) => ErrorKind::AlreadyExists,
            EngineError::InsufficientSignatures(_) => ErrorKind::InsufficientSignatures,
            EngineError::Fatal(_) => ErrorKind::Fatal,
        }
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        EngineError::Transient(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        EngineError::Validation(msg.into())
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, EngineError::AlreadyExists(_))
    }
}

impl From<eyre::Report> for EngineError {
    fn from(err: eyre::Report) -> Self {
        EngineError::Transient(format!("{:#}", err))
    }
}

impl From<reqwest::Error> for EngineError {
    fn from(err: reqwest::Error) -> Self {
        EngineError::Transient(err.to_string())
    }
}

/// Map a raw error message from an RPC node or the home chain to an error kind
pub fn classify_error(message: &str) -> EngineError {
    let lower = message.to_lowercase();

    // Duplicate submissions first: "already known" must not fall through to transient
    if lower.contains("already exists")
        || lower.contains("already exist")
        || lower.contains("already completed")
        || lower.contains("already known")
        || lower.contains("tx duplication")
    {
        return EngineError::AlreadyExists(message.to_string());
    }

    if lower.contains("insufficient signatures")
        || lower.contains("signatures not enough")
        || lower.contains("signature count")
    {
        return EngineError::InsufficientSignatures(message.to_string());
    }

    if lower.contains("timeout")
        || lower.contains("connection")
        || lower.contains("network")
        || lower.contains("rate limit")
        || lower.contains("too many requests")
        || lower.contains("503")
        || lower.contains("502")
        || lower.contains("temporarily unavailable")
        || lower.contains("underpriced")
        || lower.contains("nonce too low")
    {
        return EngineError::Transient(message.to_string());
    }

    if lower.contains("reverted")
        || lower.contains("invalid")
        || lower.contains("insufficient funds")
        || lower.contains("out of gas")
    {
        return EngineError::Validation(message.to_string());
    }

    EngineError::Transient(message.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert_eq!(
            classify_error("connection timeout").kind(),
            ErrorKind::Transient
        );
        assert_eq!(
            classify_error("Transaction already exists in pool").kind(),
            ErrorKind::AlreadyExists
        );
        assert_eq!(classify_error("already known").kind(), ErrorKind::AlreadyExists);
        // A stale nonce means nothing was sent; retry with a fresh one
        assert_eq!(classify_error("nonce too low").kind(), ErrorKind::Transient);
        assert_eq!(
            classify_error("execution reverted: signatures not enough").kind(),
            ErrorKind::InsufficientSignatures
        );
        assert_eq!(
            classify_error("execution reverted").kind(),
            ErrorKind::Validation
        );
        assert_eq!(
            classify_error("some unknown error").kind(),
            ErrorKind::Transient
        );
    }

    #[test]
    fn test_eyre_report_is_transient() {
        let err: EngineError = eyre::eyre!("pool closed").into();
        assert_eq!(err.kind(), ErrorKind::Transient);
        assert!(err.to_string().contains("pool closed"));
    }

    #[test]
    fn test_kind_labels() {
        assert_eq!(ErrorKind::AlreadyExists.as_str(), "already_exists");
        assert!(EngineError::AlreadyExists("x".into()).is_already_exists());
        assert!(!EngineError::validation("x").is_already_exists());
    }
}
