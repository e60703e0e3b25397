//! SSC Error Types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SscError {
    #[error("Token adapter unreadable: {0}")]
    Adapter(String),

    #[error("Token driver rejected {property}: {reason}")]
    DriverRejected { property: String, reason: String },

    #[error("Token did not reach a terminal status within {0}ms")]
    PollTimeout(u64),

    #[error("Token removed")]
    TokenRemoved,

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Server returned status {0}")]
    ServerStatus(u16),

    #[error("Undecodable server response: {0}")]
    Decode(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Protocol violation: {0}")]
    Protocol(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl SscError {
    /// Numeric code shown to the operator so support can trace the failure site.
    pub fn support_code(&self) -> u32 {
        match self {
            SscError::Adapter(_) => 1001,
            SscError::DriverRejected { .. } => 1002,
            SscError::PollTimeout(_) => 1003,
            SscError::TokenRemoved => 1004,
            SscError::Http(_) => 2001,
            SscError::ServerStatus(_) => 2002,
            SscError::Decode(_) => 2003,
            SscError::Json(_) => 2004,
            SscError::Protocol(_) => 3001,
            SscError::Config(_) => 9001,
        }
    }
}
