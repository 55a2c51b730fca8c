//! Typed error handling for messenger backends.
//!
//! Failures are split so that callers can apply the right policy without
//! inspecting transport details:
//! - Permanent failures (bad recipient, hard rejection) - don't retry
//! - Transient failures (timeouts, 5xx, connection resets) - retriable

use thiserror::Error;

/// Top-level messenger error type.
#[derive(Debug, Error)]
pub enum MessengerError {
    /// Failure that will not succeed on retry.
    #[error("permanent failure: {0}")]
    Permanent(#[from] PermanentError),

    /// Failure that may succeed on retry.
    #[error("transient failure: {0}")]
    Transient(#[from] TransientError),
}

/// Permanent errors that should not be retried.
#[derive(Debug, Error)]
pub enum PermanentError {
    /// Recipient address is invalid or was rejected by the server.
    #[error("invalid recipient: {0}")]
    InvalidRecipient(String),

    /// Message was rejected outright (policy, content, addressing).
    #[error("message rejected: {0}")]
    Rejected(String),

    /// The backend is misconfigured for this message.
    #[error("configuration error: {0}")]
    Configuration(String),
}

/// Transient errors worth retrying.
#[derive(Debug, Error)]
pub enum TransientError {
    /// Failed to reach the server.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Operation timed out.
    #[error("timed out: {0}")]
    Timeout(String),

    /// Server signalled a temporary condition (SMTP 4xx, HTTP 5xx).
    #[error("server busy: {0}")]
    ServerBusy(String),

    /// TLS negotiation failed.
    #[error("tls handshake failed: {0}")]
    TlsHandshakeFailed(String),
}

impl MessengerError {
    /// Returns `true` if this error may succeed on retry.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Returns `true` if this error should not be retried.
    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent(_))
    }
}

impl From<std::io::Error> for MessengerError {
    fn from(error: std::io::Error) -> Self {
        match error.kind() {
            std::io::ErrorKind::TimedOut => {
                Self::Transient(TransientError::Timeout(error.to_string()))
            }
            _ => Self::Transient(TransientError::ConnectionFailed(error.to_string())),
        }
    }
}

/// Specialized `Result` type for messenger operations.
pub type Result<T> = std::result::Result<T, MessengerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        let error = MessengerError::Transient(TransientError::Timeout("read".to_string()));
        assert!(error.is_transient());
        assert!(!error.is_permanent());

        let error =
            MessengerError::Permanent(PermanentError::InvalidRecipient("a@b".to_string()));
        assert!(error.is_permanent());
        assert!(!error.is_transient());
    }

    #[test]
    fn io_errors_are_transient() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let error = MessengerError::from(io);
        assert!(error.is_transient());
    }

    #[test]
    fn display() {
        let error = MessengerError::Permanent(PermanentError::Rejected("550 no".to_string()));
        assert_eq!(error.to_string(), "permanent failure: message rejected: 550 no");
    }
}
