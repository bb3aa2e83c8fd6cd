//! Application descriptors.
//!
//! An application is a bundle of event-keyed functions identified by an app
//! id. Instead of introspecting marked methods, an app contributes typed
//! registration records through [`CallApp::register`]; the [`Client`]
//! applies them to the node's event loop and reverses them on unload.
//!
//! [`Client`]: crate::Client

use std::sync::Arc;

use switchgen_session_core::dispatch::{EventCallback, EventCoroutine, Handler};
use switchgen_session_core::{EventListener, Job, Session};

use crate::error::Result;
use crate::pool::SlavePool;

/// Aggregate counters an app may consult, satisfied by a single listener or
/// by a whole pool.
pub trait CallCounts: Send + Sync {
    fn count_sessions(&self) -> usize;
    fn count_calls(&self) -> usize;
    fn count_jobs(&self) -> usize;
    fn count_failed(&self) -> u64;
}

impl CallCounts for EventListener {
    fn count_sessions(&self) -> usize {
        EventListener::count_sessions(self)
    }

    fn count_calls(&self) -> usize {
        EventListener::count_calls(self)
    }

    fn count_jobs(&self) -> usize {
        EventListener::count_jobs(self)
    }

    fn count_failed(&self) -> u64 {
        EventListener::count_failed(self)
    }
}

impl CallCounts for SlavePool {
    fn count_sessions(&self) -> usize {
        SlavePool::count_sessions(self)
    }

    fn count_calls(&self) -> usize {
        SlavePool::count_calls(self)
    }

    fn count_jobs(&self) -> usize {
        SlavePool::count_jobs(self)
    }

    fn count_failed(&self) -> u64 {
        SlavePool::count_failed(self)
    }
}

/// Dependencies handed to an app at load time.
pub struct AppContext {
    pub listener: EventListener,
    /// Counter source: the whole pool when loaded cluster-wide, otherwise
    /// the owning node's listener.
    pub counts: Arc<dyn CallCounts>,
}

/// Typed registration records collected from an app.
#[derive(Default)]
pub struct Registrar {
    pub(crate) handlers: Vec<(String, Handler)>,
    pub(crate) callbacks: Vec<(String, EventCallback)>,
    pub(crate) coroutines: Vec<(String, EventCoroutine)>,
}

impl Registrar {
    pub fn new() -> Registrar {
        Registrar::default()
    }

    /// Register an event handler (exactly one may exist per event name).
    pub fn handler(&mut self, evname: impl Into<String>, handler: Handler) {
        self.handlers.push((evname.into(), handler));
    }

    /// Register a synchronous callback for events of the given type.
    pub fn callback(
        &mut self,
        evname: impl Into<String>,
        callback: impl Fn(Option<&Arc<Session>>, Option<&Arc<Job>>) + Send + Sync + 'static,
    ) {
        self.callbacks.push((evname.into(), Arc::new(callback)));
    }

    /// Register a coroutine scheduled for events of the given type.
    pub fn coroutine(&mut self, evname: impl Into<String>, coroutine: EventCoroutine) {
        self.coroutines.push((evname.into(), coroutine));
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty() && self.callbacks.is_empty() && self.coroutines.is_empty()
    }
}

/// A loadable call application.
pub trait CallApp: Send + Sync + 'static {
    /// Default app id when none is supplied at load time.
    fn name(&self) -> &str;

    /// Contribute handler/callback/coroutine registrations.
    fn register(self: Arc<Self>, reg: &mut Registrar);

    /// Setup hook run before the registrations are applied; dependencies
    /// are injected through the context.
    fn setup(&self, cx: &AppContext) -> Result<()> {
        let _ = cx;
        Ok(())
    }

    /// Teardown hook run after the app's registrations are removed.
    fn teardown(&self) {}
}

/// Registrations applied for one app under one app id, kept for unload.
pub(crate) struct LoadedApp {
    pub(crate) app: Arc<dyn CallApp>,
    pub(crate) name: String,
    pub(crate) callbacks: Vec<(String, EventCallback)>,
    pub(crate) coroutines: Vec<(String, EventCoroutine)>,
}
