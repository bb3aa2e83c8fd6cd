use thiserror::Error;

/// Errors produced while decoding the wire protocol.
///
/// Framing violations are fatal for the connection that produced them; the
/// transport layer closes the socket and lets its reconnect policy take over.
#[derive(Debug, Error)]
pub enum Error {
    /// The byte stream could not be framed.
    #[error("framing violation: {0}")]
    Framing(String),

    /// A frame declared a body larger than the configured sanity limit.
    #[error("content length {len} exceeds limit of {limit} bytes")]
    ContentTooLarge { len: usize, limit: usize },
}

pub type Result<T> = std::result::Result<T, Error>;
