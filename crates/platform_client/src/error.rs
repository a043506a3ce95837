use thiserror::Error;

pub type PlatformResult<T> = Result<T, PlatformError>;

/// Errors returned by the remote platform.
#[derive(Error, Debug)]
pub enum PlatformError {
    #[error("Authentication rejected: {0}")]
    Auth(String),

    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    /// The service could not be reached or reported itself temporarily unavailable.
    #[error("Platform service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Unexpected platform response: {0}")]
    Protocol(String),

    #[error("Invalid platform configuration: {0}")]
    Config(String),
}

impl PlatformError {
    /// Whether retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, PlatformError::ServiceUnavailable(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_unavailable_is_transient() {
        assert!(PlatformError::ServiceUnavailable("503".into()).is_transient());
        assert!(!PlatformError::Auth("bad token".into()).is_transient());
        assert!(!PlatformError::QuotaExceeded("cores".into()).is_transient());
        assert!(!PlatformError::Protocol("garbage".into()).is_transient());
    }
}
