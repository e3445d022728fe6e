//! Error types for crossrun

use thiserror::Error;

/// Result type alias using crossrun Error
pub type Result<T> = std::result::Result<T, Error>;

/// crossrun error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Bad browser/OS/capability combination, detected before any vendor call
    /// or reported back by the vendor when it refuses a platform.
    #[error("{0}")]
    Input(String),

    #[error("{vendor} rejected the request: {message}")]
    VendorRejection { vendor: String, message: String },

    #[error("{operation} did not settle after {attempts} attempts")]
    RetryExhausted { operation: String, attempts: u32 },

    #[error("Process error: {0}")]
    ProcessLifecycle(String),

    #[error("Tunnel conflict: {0}")]
    TunnelConflict(String),

    #[error("Tunnel exited unexpectedly\ncommand: {command}\nstdout:\n{stdout}")]
    TunnelFailed { command: String, stdout: String },

    #[error("Tunnel authentication failed: {0}")]
    TunnelAuth(String),

    #[error("no such run: {0}")]
    NoSuchRun(String),

    #[error("Resource not found: {kind} with id {id}")]
    NotFound { kind: String, id: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Integrity verification failed: {0}")]
    Integrity(String),

    #[error("Invalid archive: {0}")]
    Archive(String),

    #[error("Operation timeout after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True for "the remote thing does not exist" failures, either our own
    /// `NotFound` or an HTTP 404 from a vendor.
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound { .. } => true,
            Error::Http(e) => e.status() == Some(reqwest::StatusCode::NOT_FOUND),
            _ => false,
        }
    }

    pub fn not_found(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Error::NotFound {
            kind: kind.into(),
            id: id.into(),
        }
    }
}

impl From<zip::result::ZipError> for Error {
    fn from(e: zip::result::ZipError) -> Self {
        Error::Archive(format!("zip: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_classification() {
        assert!(Error::not_found("job", "abc").is_not_found());
        assert!(!Error::Input("bad".to_string()).is_not_found());
        assert!(!Error::NoSuchRun("abc".to_string()).is_not_found());
    }

    #[test]
    fn test_messages_carry_context() {
        let err = Error::RetryExhausted {
            operation: "ticket promotion".to_string(),
            attempts: 5,
        };
        assert_eq!(err.to_string(), "ticket promotion did not settle after 5 attempts");

        let err = Error::TunnelFailed {
            command: "sc -u user -k ***".to_string(),
            stdout: "Goodbye?".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("sc -u user -k ***"));
        assert!(msg.contains("Goodbye?"));
    }
}
