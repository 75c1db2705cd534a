use thiserror::Error;

pub const INVALID_JSON: &str = "Invalid JSON";
pub const MISSING_FIELDS: &str = "Missing required fields";

/// Rejections produced at the command boundary. None of them ever reach the relay engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    /// The rejected channel number stays available through `Debug` for logs.
    #[error("Invalid relay number")]
    InvalidChannel(i64),
    #[error("Invalid action")]
    InvalidAction(String),
    /// Carries the client-facing reason, [`INVALID_JSON`] or [`MISSING_FIELDS`].
    #[error("{0}")]
    MalformedCommand(String),
}
