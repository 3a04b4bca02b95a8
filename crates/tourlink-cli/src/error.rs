//! Error handling for the tourlink CLI

use thiserror::Error;

/// CLI-specific error types
#[derive(Error, Debug)]
pub enum CliError {
    #[error("Session error: {0}")]
    Tourlink(#[from] tourlink_core::TourlinkError),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Attendee for {language} never became ready")]
    AttendeeNotReady { language: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for CLI operations
pub type Result<T> = std::result::Result<T, CliError>;
