//! Hadron flow error abstractions.

use thiserror::Error;

use crate::models::ProgramState;

// Error messages.
pub const ERR_DB_FLUSH: &str = "error flushing database state";
pub const ERR_DECODE_RUN_RECORD: &str = "error decoding run record from storage";

/// Application error variants.
#[derive(Debug, Error)]
pub enum AppError {
    /// The given input was invalid.
    #[error("validation error: {0}")]
    InvalidInput(String),
    /// The named stage is not part of the running flow.
    #[error("unknown stage '{0}'")]
    UnknownStage(String),
    /// The requested operation is not permitted from the controller's current state.
    #[error("can not {op} a program which is {state}")]
    InvalidState { op: &'static str, state: ProgramState },
    /// One of the flow's initial instances failed to start, and all started instances were stopped.
    #[error("error starting flow instances: {0}")]
    StartupFailed(anyhow::Error),
    /// A rescale failed part way through, and the run has been stopped.
    #[error("error changing instances of stage '{stage}' to {instances}: {cause}")]
    RescaleFailed {
        stage: String,
        instances: u32,
        cause: anyhow::Error,
    },
}

/// The error type used to indicate that a system shutdown is required.
#[derive(Debug, thiserror::Error)]
#[error("fatal error: {0}")]
pub struct ShutdownError(#[from] pub anyhow::Error);

/// A result type where the error is a `ShutdownError`.
pub type ShutdownResult<T> = ::std::result::Result<T, ShutdownError>;
