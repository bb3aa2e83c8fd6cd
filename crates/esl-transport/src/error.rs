use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by the connection layer.
#[derive(Debug, Error)]
pub enum Error {
    /// TCP connect, authentication or disconnect failure.
    #[error("failed to connect to server at '{host}:{port}': {reason}")]
    Connection {
        host: String,
        port: u16,
        reason: String,
    },

    /// A command reply body reported `-ERR`.
    #[error("api command failed: {0}")]
    Api(String),

    /// A reply did not arrive within the allotted time.
    #[error("timed out after {duration:?} waiting for {what}")]
    Timeout { duration: Duration, what: String },

    /// The connection has not been established or was lost.
    #[error("connection is not ready, call `connect()` first")]
    NotConnected,

    /// The link went down while a reply was outstanding.
    #[error("connection closed while awaiting a reply")]
    Closed,

    #[error(transparent)]
    Proto(#[from] switchgen_esl_core::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
