use std::path::PathBuf;
use std::time::Duration;

/// Error type for session operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Invalid interpreter path '{}': {reason}", path.display())]
    Configuration { path: PathBuf, reason: String },

    #[error("The session has been closed; create a new one")]
    Closed,

    #[error("A cell is already executing in this session")]
    Busy,

    #[error("Execution timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("Kernel transport failure: {0:#}")]
    Transport(#[from] anyhow::Error),

    #[error("Event callback failed: {0:#}")]
    Callback(anyhow::Error),

    #[error("Failed to spawn listener thread: {0}")]
    Spawn(std::io::Error),
}

impl SessionError {
    pub(crate) fn configuration(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        SessionError::Configuration {
            path: path.into(),
            reason: reason.into(),
        }
    }
}
