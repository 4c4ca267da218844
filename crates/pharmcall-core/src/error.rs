use thiserror::Error;

#[derive(Debug, Error)]
pub enum PharmcallError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unknown time zone: {0}")]
    InvalidTimezone(String),
}

impl PharmcallError {
    /// Short error code string used in JSON error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            PharmcallError::Config(_) => "CONFIG_ERROR",
            PharmcallError::InvalidTimezone(_) => "INVALID_TIMEZONE",
        }
    }
}

pub type Result<T> = std::result::Result<T, PharmcallError>;
