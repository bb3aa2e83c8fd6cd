//! Per-node event loop and dispatch machinery.

use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use switchgen_esl_core::Event;
use switchgen_esl_transport::Connection;

use crate::error::{Error, Result};
use crate::models::{Job, Session};

/// What a handler reports back to the dispatcher.
pub struct HandlerOutcome {
    /// Whether the event was consumed; callbacks and coroutines only run for
    /// consumed events.
    pub consumed: bool,
    pub session: Option<Arc<Session>>,
    pub job: Option<Arc<Job>>,
}

impl HandlerOutcome {
    pub fn unconsumed() -> HandlerOutcome {
        HandlerOutcome {
            consumed: false,
            session: None,
            job: None,
        }
    }

    pub fn consumed() -> HandlerOutcome {
        HandlerOutcome {
            consumed: true,
            session: None,
            job: None,
        }
    }

    pub fn with_session(session: Arc<Session>) -> HandlerOutcome {
        HandlerOutcome {
            consumed: true,
            session: Some(session),
            job: None,
        }
    }

    pub fn with_session_and_job(session: Option<Arc<Session>>, job: Arc<Job>) -> HandlerOutcome {
        HandlerOutcome {
            consumed: true,
            session,
            job: Some(job),
        }
    }
}

/// Exactly one handler runs per event name; handlers maintain core state.
pub type Handler = Arc<dyn Fn(Arc<Event>) -> BoxFuture<'static, HandlerOutcome> + Send + Sync>;

/// Synchronous callbacks run inline after the handler, in registration order.
pub type EventCallback = Arc<dyn Fn(Option<&Arc<Session>>, Option<&Arc<Job>>) + Send + Sync>;

/// Coroutines are scheduled as independent tasks after the callbacks.
pub type EventCoroutine =
    Arc<dyn Fn(Option<Arc<Session>>, Option<Arc<Job>>) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Box an async function into a [`Handler`].
pub fn boxed_handler<F, Fut>(f: F) -> Handler
where
    F: Fn(Arc<Event>) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = HandlerOutcome> + Send + 'static,
{
    Arc::new(move |event| {
        let fut: BoxFuture<'static, HandlerOutcome> = Box::pin(f(event));
        fut
    })
}

/// Box an async function into an [`EventCoroutine`].
pub fn boxed_coroutine<F, Fut>(f: F) -> EventCoroutine
where
    F: Fn(Option<Arc<Session>>, Option<Arc<Job>>) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move |session, job| {
        let fut: BoxFuture<'static, Result<()>> = Box::pin(f(session, job));
        fut
    })
}

type ChainMap<T> = HashMap<String, HashMap<String, VecDeque<T>>>;

pub(crate) struct LoopInner {
    con: Connection,
    handlers: Mutex<HashMap<String, Handler>>,
    callbacks: Mutex<ChainMap<EventCallback>>,
    coroutines: Mutex<ChainMap<EventCoroutine>>,
    app_id_headers: Mutex<Vec<String>>,
    unsub: Mutex<HashSet<String>>,
    queue: Mutex<Option<mpsc::UnboundedReceiver<Event>>>,
    waiters: Mutex<HashMap<String, HashMap<String, Vec<Arc<Notify>>>>>,
    epoch: Mutex<f64>,
    fs_time: Mutex<f64>,
    running: AtomicBool,
    stop_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Processes decoded events for one node on a background task.
///
/// Dispatch for one event runs handler, then the callback chain, then
/// coroutine scheduling, then variable-waiter wakeup, strictly in that
/// order; the next event is not dequeued until dispatch completes.
#[derive(Clone)]
pub struct EventLoop {
    inner: Arc<LoopInner>,
}

impl EventLoop {
    pub fn new(con: Connection) -> EventLoop {
        let queue = con.take_event_queue();
        EventLoop {
            inner: Arc::new(LoopInner {
                con,
                handlers: Mutex::new(HashMap::new()),
                callbacks: Mutex::new(HashMap::new()),
                coroutines: Mutex::new(HashMap::new()),
                app_id_headers: Mutex::new(Vec::new()),
                unsub: Mutex::new(HashSet::new()),
                queue: Mutex::new(queue),
                waiters: Mutex::new(HashMap::new()),
                epoch: Mutex::new(0.0),
                fs_time: Mutex::new(0.0),
                running: AtomicBool::new(false),
                stop_tx: watch::channel(false).0,
                task: Mutex::new(None),
            }),
        }
    }

    pub fn con(&self) -> &Connection {
        &self.inner.con
    }

    pub fn host(&self) -> &str {
        self.inner.con.host()
    }

    pub fn connected(&self) -> bool {
        self.inner.con.connected()
    }

    /// Whether the dispatch task is processing events.
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Time the first event was received from the server.
    pub fn epoch(&self) -> f64 {
        *self.inner.epoch.lock()
    }

    /// Server time carried by the most recent event.
    pub fn fs_time(&self) -> f64 {
        *self.inner.fs_time.lock()
    }

    /// Uptime in minutes as per the last received event time stamp.
    pub fn uptime(&self) -> f64 {
        (self.fs_time() - self.epoch()) / 60.0
    }

    /// Initialize the underlying receive connection and subscribe for all
    /// handler-registered events.
    pub async fn connect(&self) -> Result<()> {
        if self.is_running() && self.connected() {
            return Err(Error::Config(
                "event loop is already active, call 'disconnect()' first".to_string(),
            ));
        }
        self.inner.con.connect().await?;
        let names: Vec<String> = {
            let unsub = self.inner.unsub.lock();
            self.inner
                .handlers
                .lock()
                .keys()
                .filter(|name| !unsub.contains(*name))
                .cloned()
                .collect()
        };
        if !names.is_empty() {
            self.inner.con.subscribe(&names).await?;
        }
        info!("connected event loop to '{}'", self.host());
        Ok(())
    }

    /// Start processing received events on a background task.
    pub fn start(&self) -> Result<()> {
        if !self.connected() {
            return Err(Error::Config("you must call 'connect' first".to_string()));
        }
        if self.is_running() {
            return Err(Error::Config("event loop already started".to_string()));
        }
        let Some(queue) = self.inner.queue.lock().take() else {
            return Err(Error::Config(
                "the receive queue is owned elsewhere".to_string(),
            ));
        };
        self.inner.stop_tx.send_replace(false);
        self.inner.running.store(true, Ordering::SeqCst);
        let inner = self.inner.clone();
        let task = tokio::spawn(listen_forever(inner, queue));
        *self.inner.task.lock() = Some(task);
        Ok(())
    }

    /// Signal the dispatch task to stop after the in-flight event.
    pub fn stop(&self) {
        self.inner.stop_tx.send_replace(true);
    }

    /// Disconnect the receive connection and stop the dispatch task.
    pub async fn disconnect(&self) -> Result<()> {
        self.inner.con.disconnect().await?;
        self.stop();
        let task = self.inner.task.lock().take();
        if let Some(task) = task {
            if tokio::time::timeout(Duration::from_secs(2), task)
                .await
                .is_err()
            {
                warn!("dispatch task for '{}' did not stop in time", self.host());
            }
        }
        Ok(())
    }

    /// Register the handler for events of type `evname`; subscribes the
    /// connection when it is already up.
    pub async fn add_handler(&self, evname: &str, handler: Handler) -> Result<()> {
        self.insert_handler(evname, handler)?;
        if self.connected()
            && !self
                .inner
                .con
                .subscriptions()
                .iter()
                .any(|sub| sub == evname)
        {
            self.inner.con.subscribe([evname]).await?;
        }
        Ok(())
    }

    pub(crate) fn insert_handler(&self, evname: &str, handler: Handler) -> Result<()> {
        if self.inner.unsub.lock().contains(evname) {
            return Err(Error::Config(format!(
                "'{evname}' events have been unsubscribed for this event loop"
            )));
        }
        let mut handlers = self.inner.handlers.lock();
        if handlers.contains_key(evname) {
            return Err(Error::Config(format!(
                "a handler for '{evname}' events already exists"
            )));
        }
        handlers.insert(evname.to_string(), handler);
        Ok(())
    }

    pub fn has_handler(&self, evname: &str) -> bool {
        self.inner.handlers.lock().contains_key(evname)
    }

    /// Register a callback invoked for `(app id, event name)` matches.
    pub fn add_callback(&self, evname: &str, ident: &str, callback: EventCallback, prepend: bool) {
        let mut callbacks = self.inner.callbacks.lock();
        let chain = callbacks
            .entry(ident.to_string())
            .or_default()
            .entry(evname.to_string())
            .or_default();
        if prepend {
            chain.push_front(callback);
        } else {
            chain.push_back(callback);
        }
    }

    /// Remove a callback registered under `(app id, event name)`.
    pub fn remove_callback(&self, evname: &str, ident: &str, callback: &EventCallback) {
        let mut callbacks = self.inner.callbacks.lock();
        if let Some(ev_map) = callbacks.get_mut(ident) {
            if let Some(chain) = ev_map.get_mut(evname) {
                chain.retain(|cb| !Arc::ptr_eq(cb, callback));
                if chain.is_empty() {
                    ev_map.remove(evname);
                }
            }
            if ev_map.is_empty() {
                callbacks.remove(ident);
            }
        }
    }

    /// Register a coroutine scheduled for `(app id, event name)` matches.
    pub fn add_coroutine(&self, evname: &str, ident: &str, coro: EventCoroutine, prepend: bool) {
        let mut coroutines = self.inner.coroutines.lock();
        let chain = coroutines
            .entry(ident.to_string())
            .or_default()
            .entry(evname.to_string())
            .or_default();
        if prepend {
            chain.push_front(coro);
        } else {
            chain.push_back(coro);
        }
    }

    pub fn remove_coroutine(&self, evname: &str, ident: &str, coro: &EventCoroutine) {
        let mut coroutines = self.inner.coroutines.lock();
        if let Some(ev_map) = coroutines.get_mut(ident) {
            if let Some(chain) = ev_map.get_mut(evname) {
                chain.retain(|c| !Arc::ptr_eq(c, coro));
                if chain.is_empty() {
                    ev_map.remove(evname);
                }
            }
            if ev_map.is_empty() {
                coroutines.remove(ident);
            }
        }
    }

    /// Unsubscribe this loop from event types; requires a disconnected loop.
    /// The unsubscribed set persists so handlers cannot sneak back in.
    pub fn unsubscribe(&self, events: &[&str]) -> Result<bool> {
        if self.connected() {
            return Err(Error::Config(
                "you must disconnect this event loop before unsubscribing from events".to_string(),
            ));
        }
        let mut popped = false;
        let mut failed = Vec::new();
        {
            let mut unsub = self.inner.unsub.lock();
            let mut handlers = self.inner.handlers.lock();
            for evname in events {
                unsub.insert(evname.to_string());
                if handlers.remove(*evname).is_some() {
                    popped = true;
                } else {
                    failed.push(*evname);
                }
            }
        }
        if !failed.is_empty() {
            warn!("no handler(s) registered for events of type {failed:?}");
        }
        self.inner.con.forget_subscriptions(events);
        Ok(popped)
    }

    /// Header names consulted, in order, to resolve an event's app id.
    pub fn app_id_headers(&self) -> Vec<String> {
        self.inner.app_id_headers.lock().clone()
    }

    /// Prepend a header so it wins over older registrations.
    pub fn prepend_app_id_header(&self, header: &str) {
        let mut headers = self.inner.app_id_headers.lock();
        if !headers.iter().any(|h| h == header) {
            headers.insert(0, header.to_string());
            debug!("app lookup headers are now {headers:?}");
        }
    }

    /// Resolve the application id for an event, falling back to "default".
    pub fn get_id(&self, event: &Event) -> String {
        resolve_app_id(&self.inner, event)
    }

    /// Wait for a session variable to become truthy, as set by callbacks.
    pub async fn waitfor(
        &self,
        sess: &Arc<Session>,
        varname: &str,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let notify = Arc::new(Notify::new());
        {
            let mut waiters = self.inner.waiters.lock();
            waiters
                .entry(sess.uuid().to_string())
                .or_default()
                .entry(varname.to_string())
                .or_default()
                .push(notify.clone());
        }

        let wait = async {
            while !sess.var_truthy(varname) {
                notify.notified().await;
            }
        };
        let result = match timeout {
            Some(duration) => tokio::time::timeout(duration, wait)
                .await
                .map_err(|_| Error::Timeout {
                    duration,
                    what: format!("variable '{varname}' on session {}", sess.uuid()),
                }),
            None => {
                wait.await;
                Ok(())
            }
        };

        let mut waiters = self.inner.waiters.lock();
        if let Some(vars) = waiters.get_mut(sess.uuid()) {
            if let Some(list) = vars.get_mut(varname) {
                list.retain(|n| !Arc::ptr_eq(n, &notify));
                if list.is_empty() {
                    vars.remove(varname);
                }
            }
            if vars.is_empty() {
                waiters.remove(sess.uuid());
            }
        }
        result
    }
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field("host", &self.host())
            .field("running", &self.is_running())
            .finish()
    }
}

fn resolve_app_id(inner: &Arc<LoopInner>, event: &Event) -> String {
    for header in inner.app_id_headers.lock().iter() {
        if let Some(value) = event.get(header) {
            if !value.is_empty() {
                return value.to_string();
            }
        }
    }
    "default".to_string()
}

async fn listen_forever(inner: Arc<LoopInner>, mut queue: mpsc::UnboundedReceiver<Event>) {
    debug!("starting listen loop for '{}'", inner.con.host());
    let mut stop_rx = inner.stop_tx.subscribe();
    loop {
        tokio::select! {
            changed = stop_rx.changed() => {
                if changed.is_err() || *stop_rx.borrow() {
                    break;
                }
            }
            maybe = queue.recv() => {
                let Some(event) = maybe else { break };
                let Some(evname) = event.event_name().map(str::to_string) else {
                    warn!("received unnamed event {event:?}");
                    continue;
                };
                let consumed = process_event(&inner, event, evname.clone()).await;
                if !consumed {
                    warn!("unconsumed event '{evname}'");
                }
            }
        }
    }
    debug!("exiting listen loop for '{}'", inner.con.host());
    inner.running.store(false, Ordering::SeqCst);
    // hand the queue back so the loop can be restarted
    *inner.queue.lock() = Some(queue);
}

/// Core dispatch routine for one event.
async fn process_event(inner: &Arc<LoopInner>, event: Event, mut evname: String) -> bool {
    let event = Arc::new(event);

    // epoch is the time the first event was received
    if let Some(fs_time) = event.event_time() {
        let mut epoch = inner.epoch.lock();
        if *epoch == 0.0 {
            *epoch = fs_time;
        }
        *inner.fs_time.lock() = fs_time;
    }

    // custom events dispatch under their subclass name
    if evname == "CUSTOM" {
        if let Some(subclass) = event.subclass() {
            evname = subclass.to_string();
        }
    }
    debug!("receive event '{evname}'");

    let handler = inner.handlers.lock().get(&evname).cloned();
    let Some(handler) = handler else {
        error!("unknown event '{evname}'");
        return false;
    };

    let fallback_id = resolve_app_id(inner, &event);
    let HandlerOutcome {
        consumed,
        session,
        job,
    } = handler(event.clone()).await;

    let app_id = session
        .as_ref()
        .map(|sess| sess.app_id())
        .unwrap_or(fallback_id);

    // signal any awaiting session future and let the waiter resume before
    // moving on
    if let Some(sess) = &session {
        if sess.complete_event(&evname, event.clone()) {
            tokio::task::yield_now().await;
        }
    }

    if consumed {
        let callbacks: Vec<EventCallback> = inner
            .callbacks
            .lock()
            .get(&app_id)
            .and_then(|ev_map| ev_map.get(&evname))
            .map(|chain| chain.iter().cloned().collect())
            .unwrap_or_default();
        for callback in callbacks {
            let result = catch_unwind(AssertUnwindSafe(|| {
                callback(session.as_ref(), job.as_ref())
            }));
            if result.is_err() {
                error!(
                    "failed to execute callback for '{evname}' with uid {:?}",
                    event.unique_id()
                );
            }
        }

        let coroutines: Vec<EventCoroutine> = inner
            .coroutines
            .lock()
            .get(&app_id)
            .and_then(|ev_map| ev_map.get(&evname))
            .map(|chain| chain.iter().cloned().collect())
            .unwrap_or_default();
        for coro in coroutines {
            let fut = coro(session.clone(), job.clone());
            let evname = evname.clone();
            tokio::spawn(async move {
                if let Err(e) = fut.await {
                    error!("coroutine task for '{evname}' failed with: {e}");
                }
            });
            // single-cycle yield so scheduling order is preserved
            tokio::task::yield_now().await;
        }
    }

    if let Some(sess) = &session {
        wake_var_waiters(inner, sess);
        // terminal sessions cancel their outstanding waits
        if sess.done() {
            sess.cancel_pending();
        }
    }

    consumed
}

fn wake_var_waiters(inner: &Arc<LoopInner>, sess: &Arc<Session>) {
    let waiters = inner.waiters.lock();
    if let Some(vars) = waiters.get(sess.uuid()) {
        for (varname, notifies) in vars {
            if sess.var_truthy(varname) {
                for notify in notifies {
                    notify.notify_one();
                }
            }
        }
    }
}
