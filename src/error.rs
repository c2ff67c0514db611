use thiserror::Error;

/// Errors the core surfaces to its callers.
///
/// Quota denials are not errors; see `engine::governor::Denial`.
#[derive(Debug, Error)]
pub enum BotError {
    /// Bridge unreachable or a call exceeded its timeout. Fatal for the current task.
    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),

    /// The device accepted the connection but rejected an input command.
    #[error("input rejected: {0}")]
    Input(String),

    #[error("control not found: {0}")]
    ElementNotFound(String),

    /// A tap was performed but the expected UI state never appeared.
    #[error("verification mismatch: expected {expected} after tap")]
    VerificationMismatch { expected: String },

    #[error("persistence error: {0}")]
    Persistence(#[from] rusqlite::Error),

    #[error("invalid transition for {handle}: {from} -> {to}")]
    InvalidTransition {
        handle: String,
        from: String,
        to: String,
    },

    #[error("configuration error: {0}")]
    Config(String),
}

impl BotError {
    /// True when the error means the device can no longer be driven this run.
    pub fn is_device_fatal(&self) -> bool {
        matches!(self, BotError::DeviceUnavailable(_))
    }
}

pub type BotResult<T> = std::result::Result<T, BotError>;
