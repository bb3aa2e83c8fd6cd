//! Event Socket wire protocol support for the switchgen stack
//!
//! This crate implements the framing layer of the FreeSWITCH Event Socket
//! protocol as consumed by an inbound client:
//!
//! - **[`Event`]**: an insertion-ordered header map with an optional body,
//!   the unit of everything the server sends (asynchronous events as well as
//!   command replies).
//! - **[`Decoder`]**: an incremental frame decoder which accepts raw socket
//!   bytes in arbitrarily sized chunks and yields complete events. Header
//!   values are percent-decoded, `Content-Length` framed bodies are
//!   reassembled across TCP segment boundaries, and `text/event-plain`
//!   payloads are folded back into their carrier frame.
//! - **[`ContentType`]**: classification of a decoded frame used by the
//!   transport layer to multiplex command replies against the event stream.
//!
//! The decoder is deliberately transport-agnostic; see the
//! `switchgen-esl-transport` crate for the TCP connection built on top of it.

pub mod codec;
pub mod error;
pub mod event;

pub use codec::{Decoder, SegmentState, DEFAULT_MAX_CONTENT_LENGTH};
pub use error::{Error, Result};
pub use event::{ContentType, Event};

/// Re-export of common types for easier use
pub mod prelude {
    pub use crate::{ContentType, Decoder, Error, Event, Result};
}
