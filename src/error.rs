use thiserror::Error;

/// Main error type for the vigil supervisor
#[derive(Debug, Error)]
pub enum VigilError {
    // Configuration errors (fatal at load, nothing is started)
    #[error("Configuration error: {0}")]
    Config(String),

    // Process-related errors
    #[error("Process not found: {0}")]
    NotFound(String),

    #[error("Failed to spawn process {0}: {1}")]
    Spawn(String, String),

    #[error("Signal error: {0}")]
    Signal(String),

    // Log sink errors
    #[error("Log error: {0}")]
    Log(String),

    // Supervisor-level errors
    #[error("Supervisor has shut down")]
    ShutDown,

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl VigilError {
    /// Whether this error is contained to a single process (as opposed to the
    /// supervisor itself being unable to continue)
    pub fn is_per_process(&self) -> bool {
        matches!(self, VigilError::Spawn(..) | VigilError::Signal(_))
    }
}

/// Result type alias for vigil operations
pub type Result<T> = std::result::Result<T, VigilError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = VigilError::Spawn("bot".to_string(), "No such file".to_string());
        assert_eq!(err.to_string(), "Failed to spawn process bot: No such file");

        let err = VigilError::NotFound("ghost".to_string());
        assert_eq!(err.to_string(), "Process not found: ghost");
    }

    #[test]
    fn test_is_per_process() {
        assert!(VigilError::Spawn("a".into(), "b".into()).is_per_process());
        assert!(VigilError::Signal("ESRCH".into()).is_per_process());
        assert!(!VigilError::Internal("channel closed".into()).is_per_process());
        assert!(!VigilError::ShutDown.is_per_process());
    }
}
