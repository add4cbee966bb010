use thiserror::Error;

#[derive(Debug, Error)]
pub enum MentoraError {
    #[error("Storage error: {0}")]
    Storage(String),

    /// A write that must not be lost (turn append or quota consume) failed.
    #[error("Persistence failure: {0}")]
    Persistence(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Generation error: {0}")]
    Generation(String),

    #[error("Timed out after {0}s")]
    Timeout(u64),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl MentoraError {
    /// Returns `true` when the error is likely transient and worth retrying
    /// (e.g. HTTP 429/5xx, network timeouts, connection refused).
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http(_) | Self::Timeout(_) => true,
            Self::Generation(msg) | Self::Storage(msg) => is_transient_message(msg),
            _ => false,
        }
    }

    /// Lift a storage error into the fatal persistence class. Used on the
    /// commit path after a successful generation.
    pub fn into_persistence(self) -> Self {
        match self {
            Self::Persistence(_) => self,
            other => Self::Persistence(other.to_string()),
        }
    }
}

fn is_transient_message(msg: &str) -> bool {
    let msg_lower = msg.to_lowercase();
    for code in ["429", "500", "502", "503", "504"] {
        if msg_lower.contains(code) {
            return true;
        }
    }
    let patterns = [
        "timeout",
        "timed out",
        "connection refused",
        "connection reset",
        "broken pipe",
        "temporarily unavailable",
        "database is locked",
    ];
    patterns.iter().any(|p| msg_lower.contains(p))
}

pub type Result<T> = std::result::Result<T, MentoraError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_429() {
        let err = MentoraError::Generation("OpenAI LLM error 429: rate limit exceeded".into());
        assert!(err.is_transient());
    }

    #[test]
    fn test_transient_timeout_variant() {
        assert!(MentoraError::Timeout(8).is_transient());
    }

    #[test]
    fn test_transient_sqlite_busy() {
        let err = MentoraError::Storage("database is locked".into());
        assert!(err.is_transient());
    }

    #[test]
    fn test_permanent_401() {
        let err = MentoraError::Generation("API error 401: unauthorized".into());
        assert!(!err.is_transient());
    }

    #[test]
    fn test_permanent_config() {
        let err = MentoraError::Config("missing API key".into());
        assert!(!err.is_transient());
    }

    #[test]
    fn test_into_persistence_wraps_message() {
        let err = MentoraError::Storage("disk full".into()).into_persistence();
        assert!(matches!(err, MentoraError::Persistence(ref m) if m.contains("disk full")));
    }

    #[test]
    fn test_into_persistence_is_idempotent() {
        let err = MentoraError::Persistence("x".into()).into_persistence();
        assert_eq!(err.to_string(), "Persistence failure: x");
    }
}
