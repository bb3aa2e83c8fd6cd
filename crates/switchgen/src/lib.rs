//! # switchgen
//!
//! Cluster-oriented control and load generation for FreeSWITCH-style media
//! servers, driven entirely over the Event Socket Layer.
//!
//! This umbrella crate re-exports the whole stack:
//!
//! - [`esl_core`]: wire protocol types and the incremental frame decoder
//! - [`esl_transport`]: the authenticated TCP connection with FIFO reply
//!   correlation
//! - [`session_core`]: per-node event dispatch, state tracking and the
//!   `Session`/`Call`/`Job` models
//! - [`call_engine`]: the operator client, slave pool, burst-loop
//!   originator and CDR capture
//!
//! ## Getting started
//!
//! ```no_run
//! use switchgen::prelude::*;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let contacts = [NodeConfig::new("fs1.lab")];
//! let pool = SlavePool::from_configs(&contacts, ListenerConfig::default())?;
//!
//! let originator = Originator::new(pool, OriginatorConfig::default());
//! originator.prepare().await?;
//! originator.load_app(Cdr::new(), Some("loadtest"), 1).await?;
//! originator.set_originate_cmd(OriginateBuilder::new("service@fs2.lab:5080"));
//!
//! originator.set_rate(50.0);
//! originator.set_limit(100);
//! originator.start()?;
//! # Ok(())
//! # }
//! ```

pub use switchgen_call_engine as call_engine;
pub use switchgen_esl_core as esl_core;
pub use switchgen_esl_transport as esl_transport;
pub use switchgen_session_core as session_core;

pub mod logging;

/// Re-export of common types for easier use
pub mod prelude {
    pub use crate::logging::{setup_logging, LoggingConfig};
    pub use switchgen_call_engine::{
        AppContext, CallApp, Cdr, CdrRow, Client, DataStorer, OriginateBuilder, OriginateSpec,
        Originator, OriginatorConfig, Registrar, SlaveNode, SlavePool, State,
    };
    pub use switchgen_esl_core::{ContentType, Decoder, Event};
    pub use switchgen_esl_transport::Connection;
    pub use switchgen_session_core::{
        Autorecon, Call, EventListener, EventLoop, Job, ListenerConfig, NodeConfig, Session,
    };
}
