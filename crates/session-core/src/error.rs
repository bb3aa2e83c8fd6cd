use std::time::Duration;

use thiserror::Error;

/// Server error string carried by a failed background job.
#[derive(Debug, Clone, Error)]
#[error("background job failed: {0}")]
pub struct JobError(pub String);

/// Errors surfaced by the dispatch and state tracking layer.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid or unsupported state transition (connecting while the loop is
    /// running, unsubscribing while active, duplicate handlers and the like).
    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Job(#[from] JobError),

    #[error("timed out after {duration:?} waiting for {what}")]
    Timeout { duration: Duration, what: String },

    /// A session-level wait was cancelled because the session went terminal.
    #[error("wait cancelled, session is gone")]
    Cancelled,

    #[error(transparent)]
    Transport(#[from] switchgen_esl_transport::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
