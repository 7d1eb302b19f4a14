//! Error types for Embermail

use thiserror::Error;

/// Main error type for Embermail
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Mail client error: {0}")]
    Mail(String),

    #[error("Content generation error: {0}")]
    Content(String),

    #[error("Invalid plan: {0}")]
    InvalidPlan(String),

    #[error("Unknown provider: {0}")]
    UnknownProvider(String),

    #[error("Invalid timezone: {0}")]
    InvalidTimezone(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias for Embermail
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Returns the error code string
    pub fn code(&self) -> &'static str {
        match self {
            Error::Config(_) => "CONFIG_ERROR",
            Error::Database(_) => "DATABASE_ERROR",
            Error::Mail(_) => "MAIL_ERROR",
            Error::Content(_) => "CONTENT_ERROR",
            Error::InvalidPlan(_) => "INVALID_PLAN",
            Error::UnknownProvider(_) => "UNKNOWN_PROVIDER",
            Error::InvalidTimezone(_) => "INVALID_TIMEZONE",
            Error::Validation(_) => "VALIDATION_ERROR",
            Error::NotFound(_) => "NOT_FOUND",
            Error::Internal(_) => "INTERNAL_ERROR",
            Error::Other(_) => "INTERNAL_ERROR",
        }
    }
}
