//! Event Socket TCP connection layer for the switchgen stack
//!
//! One [`Connection`] owns one TCP link to one server: it performs the
//! password handshake, writes commands, and runs a background reader which
//! multiplexes synchronous replies (matched FIFO per content type) against
//! the asynchronous event stream delivered through an event queue.

pub mod connection;
pub mod error;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

#[cfg(test)]
mod tests;

pub use connection::{Connection, DEFAULT_PORT, SERVER_DISCONNECTED};
pub use error::{Error, Result};

/// Re-export of common types for easier use
pub mod prelude {
    pub use crate::{Connection, Error, Result};
    pub use switchgen_esl_core::{ContentType, Event};
}
