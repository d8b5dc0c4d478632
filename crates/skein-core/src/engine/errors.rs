use std::path::PathBuf;

use thiserror::Error;

use crate::engine::backend::BackendError;
use crate::engine::job::JobId;

/// All errors the runtime API can return to a caller.
///
/// Per-job failures observed through [`crate::JobSnapshot`] are carried as
/// plain messages on the snapshot instead; nothing in the scheduler loop ever
/// escapes to the process.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid parameters: {reason}")]
    InvalidParameters { reason: String },

    #[error("invalid grammar: {message}")]
    InvalidGrammar { message: String },

    #[error("{operation} is not supported by this model kind")]
    Unsupported { operation: &'static str },

    #[error("job {job_id} not found")]
    JobNotFound { job_id: JobId },

    #[error("service is shutting down")]
    ShuttingDown,

    #[error("failed to load model from: {path} ({message})")]
    ModelLoad { path: PathBuf, message: String },

    #[error("failed to apply chat template")]
    ChatTemplate {
        #[source]
        source: minijinja::Error,
    },

    #[error("failed to tokenize input: {message}")]
    Tokenize { message: String },

    #[error(transparent)]
    Backend(#[from] BackendError),
}
