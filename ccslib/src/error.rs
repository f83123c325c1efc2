//! Error definitions for CCS

use thiserror::Error;

use crate::messages::codes;

/// CCS error types
#[derive(Error, Debug)]
pub enum CcsError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Command error: {0}")]
    Command(String),

    #[error("Hardware error: {0}")]
    Hardware(String),

    #[error("Peer error: {0}")]
    Peer(String),

    #[error("Schedule persistence error: {0}")]
    Schedule(String),

    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("Timeout")]
    Timeout,

    #[error("Aborted")]
    Aborted,
}

impl CcsError {
    pub fn config(msg: impl Into<String>) -> Self {
        CcsError::Config(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        CcsError::Protocol(msg.into())
    }

    pub fn hardware(msg: impl Into<String>) -> Self {
        CcsError::Hardware(msg.into())
    }

    pub fn peer(msg: impl Into<String>) -> Self {
        CcsError::Peer(msg.into())
    }

    /// Map this error onto the stable numeric code carried in a Done
    pub fn code(&self) -> u32 {
        match self {
            CcsError::Aborted => codes::ABORTED,
            CcsError::Hardware(_) => codes::HW_FAULT,
            CcsError::Peer(_) => codes::PEER_IO,
            CcsError::Schedule(_) => codes::SCHEDULE_PERSIST,
            CcsError::Config(_) => codes::RECIPE_CONFIG,
            CcsError::Command(_) => codes::BAD_REQUEST,
            _ => codes::INTERNAL,
        }
    }
}

/// Result type alias for CCS operations
pub type CcsResult<T> = Result<T, CcsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CcsError::Config("test".to_string());
        assert_eq!(format!("{}", err), "Configuration error: test");
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(CcsError::Aborted.code(), codes::ABORTED);
        assert_eq!(CcsError::hardware("x").code(), codes::HW_FAULT);
        assert_eq!(CcsError::peer("x").code(), codes::PEER_IO);
        assert_eq!(CcsError::Timeout.code(), codes::INTERNAL);
    }
}
