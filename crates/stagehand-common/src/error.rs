//! Error types shared across Stagehand crates

use thiserror::Error;

/// Result type alias for common operations
pub type Result<T> = std::result::Result<T, CommonError>;

#[derive(Error, Debug)]
pub enum CommonError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid value '{value}' for {setting}")]
    InvalidSetting { setting: &'static str, value: String },

    #[error("Failed to initialise logging: {0}")]
    Logging(String),
}

impl CommonError {
    pub fn invalid_setting(setting: &'static str, value: impl Into<String>) -> Self {
        Self::InvalidSetting {
            setting,
            value: value.into(),
        }
    }
}
