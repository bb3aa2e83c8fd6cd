use thiserror::Error;

/// Errors surfaced by the cluster control layer.
#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Session(#[from] switchgen_session_core::Error),

    #[error(transparent)]
    Transport(#[from] switchgen_esl_transport::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Encode(#[from] bincode::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
