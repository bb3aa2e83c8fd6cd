//! Event dispatch and state tracking for the switchgen stack
//!
//! This crate hosts the per-node machinery between the raw connection and
//! operator applications:
//!
//! - **[`EventLoop`]**: the per-node dispatcher. It consumes the decoded
//!   event queue and routes every event through a handler, then the callback
//!   chains and coroutine chains registered for the event's application id,
//!   and finally wakes any session-level waiters.
//! - **[`EventListener`]**: the default handler set. It maintains the
//!   [`Session`], [`Call`] and [`Job`] tables from channel lifecycle events
//!   and keeps failure accounting.
//! - **models**: mutable state objects for channels, bridged-channel groups
//!   and background jobs, with command helpers that emit the matching
//!   server commands.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod listener;
pub mod models;

#[cfg(test)]
mod tests;

pub use config::{Autorecon, ListenerConfig, NodeConfig};
pub use dispatch::{
    boxed_coroutine, boxed_handler, EventCallback, EventCoroutine, EventLoop, Handler,
    HandlerOutcome,
};
pub use error::{Error, JobError, Result};
pub use listener::{get_listener, EventListener};
pub use models::{Call, EventHistory, Job, ReturnWhen, Session};

/// Re-export of common types for easier use
pub mod prelude {
    pub use crate::{
        Autorecon, Call, Error, EventListener, EventLoop, Job, ListenerConfig, NodeConfig,
        Result, Session,
    };
    pub use switchgen_esl_core::Event;
    pub use switchgen_esl_transport::Connection;
}
