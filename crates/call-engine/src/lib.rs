//! Operator-facing control and load generation for the switchgen stack
//!
//! Builds the cluster layer on top of `switchgen-session-core`:
//!
//! - **[`Client`]**: per-node facade for loading call apps, issuing
//!   commands and originating calls.
//! - **[`SlavePool`]**: fanout and admission-filtered iteration over
//!   `(Client, EventListener)` pairs.
//! - **[`Originator`]**: a rate and concurrency limited burst-loop
//!   auto-dialer for stress testing.
//! - **[`measure`]**: ring-buffered row capture with pluggable disk stores
//!   and the CDR application.

pub mod app;
pub mod client;
pub mod commands;
pub mod error;
pub mod measure;
pub mod originator;
pub mod pool;

#[cfg(test)]
mod tests;

pub use app::{AppContext, CallApp, CallCounts, Registrar};
pub use client::{Client, OriginateSpec};
pub use commands::{OriginateBuilder, OriginateTemplate};
pub use error::{Error, Result};
pub use measure::cdr::{Cdr, CdrRow};
pub use measure::storage::{BinStore, CsvStore, DataStorer, Record, RingBuffer, Store};
pub use originator::{Originator, OriginatorConfig, State, WeightedIterator};
pub use pool::{SlaveNode, SlavePool};

/// Re-export of common types for easier use
pub mod prelude {
    pub use crate::{
        AppContext, CallApp, Cdr, Client, Error, OriginateBuilder, OriginateSpec, Originator,
        OriginatorConfig, Registrar, Result, SlaveNode, SlavePool, State,
    };
    pub use switchgen_session_core::prelude::*;
}
