//! Error taxonomy.
//!
//! Source and inference errors are recovered inside the supervisor and only
//! ever reach subscribers as status or analysis text. Registry errors are
//! returned to the management caller.

use std::time::Duration;

use thiserror::Error;

/// Failure opening or reading a frame source.
#[derive(Debug, Error)]
pub enum SourceError {
    /// Source unreachable or locator unsupported.
    #[error("connect to {locator} failed: {reason}")]
    Connect { locator: String, reason: String },
    /// Transient decode or I/O failure mid-stream.
    #[error("frame read failed: {0}")]
    Read(String),
    #[error("stream ended")]
    EndOfStream,
}

impl SourceError {
    pub fn connect(locator: impl ToString, reason: impl ToString) -> Self {
        Self::Connect {
            locator: locator.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn read(reason: impl ToString) -> Self {
        Self::Read(reason.to_string())
    }
}

/// Failure of one analysis cycle.
#[derive(Debug, Error)]
pub enum InferError {
    #[error("inference timed out after {}s", .0.as_secs_f32())]
    Timeout(Duration),
    #[error("inference service returned status {0}")]
    Status(u16),
    #[error("malformed inference response: {0}")]
    Malformed(String),
    #[error("inference request failed: {0}")]
    Transport(String),
    #[error("frame encoding failed: {0}")]
    Encode(String),
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("stream {0} is already running")]
    AlreadyRunning(String),
    /// A stopped supervisor cannot be restarted; add the stream again instead.
    #[error("stream {0} has been stopped")]
    Stopped(String),
    #[error("failed to spawn capture thread: {0}")]
    Spawn(String),
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("invalid stream config: {0}")]
    InvalidConfig(String),
    #[error("stream not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
}
