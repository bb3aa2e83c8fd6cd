//! Session, call and background-job tracking through default event handlers.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, error, info, warn};

use switchgen_esl_core::Event;
use switchgen_esl_transport::{Connection, SERVER_DISCONNECTED};

use crate::config::{Autorecon, ListenerConfig};
use crate::dispatch::{boxed_handler, EventLoop, Handler, HandlerOutcome};
use crate::error::Result;
use crate::models::{Call, Job, JobCallback, OrderedMap, Session};

pub(crate) struct ListenerInner {
    event_loop: EventLoop,
    con: Connection,
    config: ListenerConfig,
    sessions: Mutex<OrderedMap<Arc<Session>>>,
    calls: Mutex<OrderedMap<Arc<Call>>>,
    bg_jobs: Mutex<OrderedMap<Arc<Job>>>,
    hangup_causes: Mutex<HashMap<String, u64>>,
    failed_sessions: Mutex<HashMap<String, VecDeque<Arc<Session>>>>,
    failed_jobs: Mutex<HashMap<String, u64>>,
    sessions_per_app: Mutex<HashMap<String, i64>>,
    total_answered_sessions: AtomicU64,
    jobs_gate: Arc<tokio::sync::Mutex<()>>,
}

/// Tracks server state by installing the default handler set on an
/// [`EventLoop`] and serves as the higher level per-node API.
///
/// The tables are only mutated from the dispatch task; reads from operator
/// tasks are best-effort snapshots.
#[derive(Clone)]
pub struct EventListener {
    inner: Arc<ListenerInner>,
}

impl EventListener {
    pub fn new(event_loop: EventLoop, config: ListenerConfig) -> Result<EventListener> {
        let con = event_loop.con().clone();
        let listener = EventListener {
            inner: Arc::new(ListenerInner {
                event_loop,
                con,
                config,
                sessions: Mutex::new(OrderedMap::new()),
                calls: Mutex::new(OrderedMap::new()),
                bg_jobs: Mutex::new(OrderedMap::new()),
                hangup_causes: Mutex::new(HashMap::new()),
                failed_sessions: Mutex::new(HashMap::new()),
                failed_jobs: Mutex::new(HashMap::new()),
                sessions_per_app: Mutex::new(HashMap::new()),
                total_answered_sessions: AtomicU64::new(0),
                jobs_gate: Arc::new(tokio::sync::Mutex::new(())),
            }),
        };
        for header in listener.inner.config.app_id_headers.clone() {
            listener.inner.event_loop.prepend_app_id_header(&header);
        }
        listener.install_default_handlers()?;
        Ok(listener)
    }

    pub fn event_loop(&self) -> &EventLoop {
        &self.inner.event_loop
    }

    pub fn host(&self) -> &str {
        self.inner.event_loop.host()
    }

    pub fn config(&self) -> &ListenerConfig {
        &self.inner.config
    }

    /// Channel variable used to group sessions into calls.
    pub fn call_tracking_header(&self) -> &str {
        &self.inner.config.call_tracking_header
    }

    pub fn max_limit(&self) -> u64 {
        self.inner.config.max_limit
    }

    // lifecycle delegation

    pub async fn connect(&self) -> Result<()> {
        self.inner.event_loop.connect().await
    }

    pub fn connected(&self) -> bool {
        self.inner.event_loop.connected()
    }

    pub fn start(&self) -> Result<()> {
        self.inner.event_loop.start()
    }

    pub fn is_running(&self) -> bool {
        self.inner.event_loop.is_running()
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.inner.event_loop.disconnect().await
    }

    pub fn unsubscribe(&self, events: &[&str]) -> Result<bool> {
        self.inner.event_loop.unsubscribe(events)
    }

    // table access

    pub fn session(&self, uuid: &str) -> Option<Arc<Session>> {
        self.inner.sessions.lock().get(uuid).cloned()
    }

    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.inner.sessions.lock().values().cloned().collect()
    }

    pub fn call(&self, uuid: &str) -> Option<Arc<Call>> {
        self.inner.calls.lock().get(uuid).cloned()
    }

    pub fn calls(&self) -> Vec<Arc<Call>> {
        self.inner.calls.lock().values().cloned().collect()
    }

    pub fn job(&self, uuid: &str) -> Option<Arc<Job>> {
        self.inner.bg_jobs.lock().get(uuid).cloned()
    }

    pub fn count_sessions(&self) -> usize {
        self.inner.sessions.lock().len()
    }

    /// Number of active calls tracked on this node.
    pub fn count_calls(&self) -> usize {
        self.inner.calls.lock().len()
    }

    pub fn count_jobs(&self) -> usize {
        self.inner.bg_jobs.lock().len()
    }

    /// Failed session count: everything hung up for other than
    /// `NORMAL_CLEARING`.
    pub fn count_failed(&self) -> u64 {
        let causes = self.inner.hangup_causes.lock();
        let total: u64 = causes.values().sum();
        total - causes.get("NORMAL_CLEARING").copied().unwrap_or(0)
    }

    pub fn hangup_causes(&self) -> HashMap<String, u64> {
        self.inner.hangup_causes.lock().clone()
    }

    pub fn failed_sessions(&self, cause: &str) -> Vec<Arc<Session>> {
        self.inner
            .failed_sessions
            .lock()
            .get(cause)
            .map(|deque| deque.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn failed_jobs(&self) -> HashMap<String, u64> {
        self.inner.failed_jobs.lock().clone()
    }

    pub fn sessions_per_app(&self, app_id: &str) -> i64 {
        self.inner
            .sessions_per_app
            .lock()
            .get(app_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn total_answered_sessions(&self) -> u64 {
        self.inner.total_answered_sessions.load(Ordering::SeqCst)
    }

    /// Clear all stats and counters.
    pub fn reset(&self) {
        debug!("resetting all stats...");
        self.inner.hangup_causes.lock().clear();
        self.inner.failed_jobs.lock().clear();
        self.inner
            .total_answered_sessions
            .store(0, Ordering::SeqCst);
    }

    // job registration

    /// Pause `BACKGROUND_JOB` processing while a caller inserts a job.
    ///
    /// The returned guard must be dropped promptly after
    /// [`EventListener::register_job`], otherwise the dispatch task stalls
    /// on the next background-job event.
    pub async fn block_jobs(&self) -> OwnedMutexGuard<()> {
        self.inner.jobs_gate.clone().lock_owned().await
    }

    /// Track a job from the `command/reply` acknowledging a bgapi command.
    pub fn register_job(
        &self,
        reply: &Event,
        sess_uuid: Option<String>,
        client_id: Option<String>,
        callback: Option<JobCallback>,
    ) -> Result<Arc<Job>> {
        let job = Job::from_reply(reply, sess_uuid, client_id, callback)?;
        self.inner
            .bg_jobs
            .lock()
            .insert(job.uuid().to_string(), job.clone());
        Ok(job)
    }

    /// The basic "update session from event" handler, also auto-installed
    /// for callback registrations that have no handler of their own.
    pub fn lookup_handler(&self) -> Handler {
        let weak = Arc::downgrade(&self.inner);
        boxed_handler(move |event| {
            let weak = weak.clone();
            async move {
                match weak.upgrade() {
                    Some(inner) => lookup_sess(&inner, event),
                    None => HandlerOutcome::unconsumed(),
                }
            }
        })
    }

    fn install_default_handlers(&self) -> Result<()> {
        let event_loop = self.inner.event_loop.clone();

        for evname in ["CHANNEL_CREATE", "CHANNEL_ORIGINATE"] {
            let weak = Arc::downgrade(&self.inner);
            event_loop.insert_handler(
                evname,
                boxed_handler(move |event| {
                    let weak = weak.clone();
                    async move {
                        match weak.upgrade() {
                            Some(inner) => handle_initial_event(&inner, event),
                            None => HandlerOutcome::unconsumed(),
                        }
                    }
                }),
            )?;
        }

        for evname in ["CHANNEL_PARK", "CALL_UPDATE"] {
            event_loop.insert_handler(evname, self.lookup_handler())?;
        }

        let weak = Arc::downgrade(&self.inner);
        event_loop.insert_handler(
            "CHANNEL_ANSWER",
            boxed_handler(move |event| {
                let weak = weak.clone();
                async move {
                    match weak.upgrade() {
                        Some(inner) => handle_answer(&inner, event),
                        None => HandlerOutcome::unconsumed(),
                    }
                }
            }),
        )?;

        let weak = Arc::downgrade(&self.inner);
        event_loop.insert_handler(
            "CHANNEL_HANGUP",
            boxed_handler(move |event| {
                let weak = weak.clone();
                async move {
                    match weak.upgrade() {
                        Some(inner) => handle_hangup(&inner, event),
                        None => HandlerOutcome::unconsumed(),
                    }
                }
            }),
        )?;

        let weak = Arc::downgrade(&self.inner);
        event_loop.insert_handler(
            "BACKGROUND_JOB",
            boxed_handler(move |event| {
                let weak = weak.clone();
                async move {
                    match weak.upgrade() {
                        Some(inner) => handle_background_job(&inner, event).await,
                        None => HandlerOutcome::unconsumed(),
                    }
                }
            }),
        )?;

        let weak = Arc::downgrade(&self.inner);
        event_loop.insert_handler(
            "LOG",
            boxed_handler(move |event| {
                let weak = weak.clone();
                async move {
                    if weak.upgrade().is_some() {
                        info!("{}", event.body().unwrap_or_default());
                    }
                    HandlerOutcome::consumed()
                }
            }),
        )?;

        let weak = Arc::downgrade(&self.inner);
        event_loop.insert_handler(
            SERVER_DISCONNECTED,
            boxed_handler(move |event| {
                let weak = weak.clone();
                async move {
                    let _ = event;
                    match weak.upgrade() {
                        Some(inner) => handle_disconnect(&inner).await,
                        None => HandlerOutcome::unconsumed(),
                    }
                }
            }),
        )?;

        Ok(())
    }
}

impl std::fmt::Debug for EventListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventListener")
            .field("host", &self.host())
            .field("sessions", &self.count_sessions())
            .field("calls", &self.count_calls())
            .field("jobs", &self.count_jobs())
            .finish()
    }
}

/// Look up the tracked session for an event and record the event on it.
fn lookup_sess(inner: &Arc<ListenerInner>, event: Arc<Event>) -> HandlerOutcome {
    let Some(uuid) = event.unique_id() else {
        return HandlerOutcome::unconsumed();
    };
    match inner.sessions.lock().get(uuid).cloned() {
        Some(sess) => {
            sess.update(event.clone());
            HandlerOutcome::with_session(sess)
        }
        None => HandlerOutcome::unconsumed(),
    }
}

/// Build `Session` and `Call` state for a channel's first event.
///
/// `CHANNEL_CREATE` and `CHANNEL_ORIGINATE` may arrive in either order; the
/// second one only records the event on the existing session.
fn handle_initial_event(inner: &Arc<ListenerInner>, event: Arc<Event>) -> HandlerOutcome {
    let Some(uuid) = event.unique_id().map(str::to_string) else {
        warn!("initial channel event carries no Unique-ID");
        return HandlerOutcome::unconsumed();
    };

    if let Some(sess) = inner.sessions.lock().get(&uuid).cloned() {
        sess.update(event);
        return HandlerOutcome::with_session(sess);
    }

    let sess = Arc::new(Session::new(
        uuid.clone(),
        event.clone(),
        inner.con.clone(),
    ));
    let direction = event.get("Call-Direction").unwrap_or("unknown");
    debug!("{direction} session created with uuid '{uuid}'");
    sess.set_app_id(inner.event_loop.get_id(&event));

    // group sessions into calls via the call tracking variable
    let call_uuid = match event.get(&inner.config.call_tracking_header) {
        Some(value) if !value.is_empty() => value.to_string(),
        _ => {
            warn!(
                "unable to associate {direction} session '{uuid}' with a call using \
                 variable '{}'",
                inner.config.call_tracking_header
            );
            uuid.clone()
        }
    };

    let call = {
        let mut calls = inner.calls.lock();
        match calls.get(&call_uuid).cloned() {
            Some(call) => {
                debug!("session '{uuid}' is bridged to call '{call_uuid}'");
                call.append(sess.clone());
                call
            }
            None => {
                let call = Arc::new(Call::new(call_uuid.clone(), sess.clone()));
                calls.insert(call_uuid.clone(), call.clone());
                debug!("call created for session '{call_uuid}'");
                call
            }
        }
    };
    sess.set_call(call);

    inner.sessions.lock().insert(uuid, sess.clone());
    *inner
        .sessions_per_app
        .lock()
        .entry(sess.app_id())
        .or_default() += 1;
    HandlerOutcome::with_session(sess)
}

fn handle_answer(inner: &Arc<ListenerInner>, event: Arc<Event>) -> HandlerOutcome {
    let Some(uuid) = event.unique_id() else {
        return HandlerOutcome::unconsumed();
    };
    match inner.sessions.lock().get(uuid).cloned() {
        Some(sess) => {
            debug!(
                "answered session {uuid} with call direction {:?}",
                event.get("Call-Direction")
            );
            sess.update(event);
            sess.mark_answered();
            inner
                .total_answered_sessions
                .fetch_add(1, Ordering::SeqCst);
            HandlerOutcome::with_session(sess)
        }
        None => {
            warn!("skipping answer of {uuid}");
            HandlerOutcome::unconsumed()
        }
    }
}

fn handle_hangup(inner: &Arc<ListenerInner>, event: Arc<Event>) -> HandlerOutcome {
    let Some(uuid) = event.unique_id().map(str::to_string) else {
        return HandlerOutcome::unconsumed();
    };
    let Some(sess) = inner.sessions.lock().remove(&uuid) else {
        return HandlerOutcome::unconsumed();
    };
    let direction = event.get("Call-Direction").unwrap_or("unknown").to_string();
    sess.update(event.clone());
    sess.mark_hungup();

    let cause = event.get("Hangup-Cause").unwrap_or("unknown").to_string();
    *inner.hangup_causes.lock().entry(cause.clone()).or_default() += 1;
    *inner
        .sessions_per_app
        .lock()
        .entry(sess.app_id())
        .or_default() -= 1;

    // the call uuid sometimes changes between create and hangup
    let call_uuid = match event.get(&inner.config.call_tracking_header) {
        Some(value) if !value.is_empty() => value.to_string(),
        _ => {
            warn!(
                "handling hangup for {direction} session '{uuid}' which cannot be \
                 associated with an active call using {}",
                inner.config.call_tracking_header
            );
            uuid.clone()
        }
    };
    let call = inner
        .calls
        .lock()
        .get(&call_uuid)
        .cloned()
        .or_else(|| sess.call());
    match call {
        Some(call) => {
            if call.remove(&uuid) {
                debug!("hungup {direction} session '{uuid}' for call '{}'", call.uuid());
            } else {
                error!("session '{uuid}' mismatched with call '{}'?", call.uuid());
            }
            if call.is_empty() {
                debug!("all sessions for call '{}' were hung up", call.uuid());
                inner.calls.lock().remove(call.uuid());
            }
        }
        None => error!("no call found for '{call_uuid}'"),
    }

    // drop any job still tied to this channel
    let job = sess.take_bg_job();
    if let Some(job) = &job {
        inner.bg_jobs.lock().remove(job.uuid());
    }

    if !sess.answered() || cause != "NORMAL_CLEARING" {
        debug!("'{uuid}' was not successful");
        let mut failed = inner.failed_sessions.lock();
        let deque = failed.entry(cause).or_default();
        if deque.len() == inner.config.failed_history {
            deque.pop_front();
        }
        deque.push_back(sess.clone());
    }

    debug!("hungup session '{uuid}'");
    HandlerOutcome {
        consumed: true,
        session: Some(sess),
        job,
    }
}

/// Resolve background jobs and report failures.
///
/// The lookup awaits the jobs gate when the uuid is unknown, giving a
/// concurrent `bgapi` caller time to finish inserting its job.
async fn handle_background_job(inner: &Arc<ListenerInner>, event: Arc<Event>) -> HandlerOutcome {
    let Some(job_uuid) = event.job_uuid().map(str::to_string) else {
        warn!("background job event carries no Job-UUID");
        return HandlerOutcome::unconsumed();
    };
    let body = event.body().unwrap_or("").trim().to_string();
    let failed = body.contains("-ERR");

    let mut job = inner.bg_jobs.lock().get(&job_uuid).cloned();
    if job.is_none() {
        // might be in the middle of inserting the job
        let _gate = inner.jobs_gate.lock().await;
        job = inner.bg_jobs.lock().get(&job_uuid).cloned();
    }
    let Some(job) = job else {
        if failed {
            warn!("untracked job '{job_uuid}' failed with:\n{body}");
        }
        return HandlerOutcome::unconsumed();
    };

    let mut session = None;
    if failed {
        let resp = body.trim_start_matches("-ERR").trim().to_string();
        if let Some(sess_uuid) = job.sess_uuid() {
            error!(
                "job '{job_uuid}' corresponding to session '{sess_uuid}' failed with:\n{body}"
            );
            // the session may already have been popped by the hangup handler
            match inner.sessions.lock().remove(sess_uuid) {
                Some(sess) => {
                    if let Some(call) = sess.call() {
                        inner.calls.lock().remove(call.uuid());
                    }
                }
                None => warn!("no session corresponding to bj '{job_uuid}'"),
            }
        }
        job.fail(&resp);
        inner.bg_jobs.lock().remove(&job_uuid);
        *inner.failed_jobs.lock().entry(resp).or_default() += 1;
    } else if let Some(resp) = body.strip_prefix("+OK") {
        let resp = resp.trim();
        // an originate job's body carries the new session's uuid
        if let Some(sess) = inner.sessions.lock().get(resp).cloned() {
            if let Some(expected) = job.sess_uuid() {
                if expected != resp {
                    error!("session uuid '{resp}' <-> bgjob uuid '{expected}' mismatch!?");
                }
            }
            sess.set_bg_job(job.clone());
            session = Some(sess);
        }
        debug!("job '{job_uuid}' was successful");
        job.complete(resp);
        inner.bg_jobs.lock().remove(&job_uuid);
    } else {
        warn!("received unexpected job message:\n{body}");
    }
    HandlerOutcome::with_session_and_job(session, job)
}

/// Poll for the connection to resume per the autorecon policy.
async fn handle_disconnect(inner: &Arc<ListenerInner>) -> HandlerOutcome {
    warn!(
        "handling {SERVER_DISCONNECTED} from server '{}'",
        inner.con.host()
    );
    if inner.con.exiting() {
        debug!("client-initiated disconnect, not reconnecting");
        return HandlerOutcome::consumed();
    }

    // deregister everything mid-call; the server side state is gone
    let dropped = inner.sessions.lock().len();
    if dropped > 0 {
        warn!("dropping {dropped} active sessions on disconnect");
    }
    inner.sessions.lock().clear();
    inner.calls.lock().clear();
    inner.bg_jobs.lock().clear();

    let delay = std::time::Duration::from_secs_f64(inner.config.reconnect_delay.max(0.0));
    match inner.config.autorecon {
        Autorecon::Never => {}
        Autorecon::Always => loop {
            tokio::time::sleep(delay).await;
            match inner.con.connect().await {
                Ok(()) => break,
                Err(e) => warn!("failed reconnection attempt ({e})...retrying"),
            }
        },
        Autorecon::Retries(count) => {
            for left in (0..count).rev() {
                tokio::time::sleep(delay).await;
                match inner.con.connect().await {
                    Ok(()) => break,
                    Err(e) => {
                        warn!("failed reconnection attempt ({e})...retries left {left}");
                        if left == 0 {
                            warn!(
                                "reconnection attempts to '{}' failed, please call \
                                 'connect' manually when the server is ready",
                                inner.con.host()
                            );
                        }
                    }
                }
            }
        }
    }
    HandlerOutcome::consumed()
}

/// Listener factory wiring a loop and listener for one node.
pub fn get_listener(
    con: Connection,
    config: ListenerConfig,
) -> Result<(EventLoop, EventListener)> {
    let event_loop = EventLoop::new(con);
    let listener = EventListener::new(event_loop.clone(), config)?;
    Ok((event_loop, listener))
}
