//! Session state tracking and channel command helpers.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::future::{join_all, select_all, FutureExt, Shared};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use switchgen_esl_core::Event;
use switchgen_esl_transport::Connection;

use crate::error::{Error, Result};
use crate::models::{Call, EventHistory, Job};

/// Completion policy for [`Session::poll`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnWhen {
    FirstCompleted,
    AllCompleted,
}

/// Event time stamps collected over a session's life.
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionTimes {
    pub create: Option<f64>,
    pub answer: Option<f64>,
    pub req_originate: Option<f64>,
    pub originate: Option<f64>,
    pub hangup: Option<f64>,
}

struct SessionState {
    events: EventHistory,
    times: SessionTimes,
    answered: bool,
    hungup: bool,
}

struct PendingRecv {
    tx: oneshot::Sender<Arc<Event>>,
    shared: Shared<oneshot::Receiver<Arc<Event>>>,
}

/// Awaitable returned by [`Session::recv`].
///
/// Resolves with the next matching event, or `Error::Cancelled` once the
/// session goes terminal with the wait still outstanding. Clones of a handle
/// for the same event name share one underlying future.
#[derive(Clone)]
pub struct RecvHandle {
    shared: Shared<oneshot::Receiver<Arc<Event>>>,
}

impl Future for RecvHandle {
    type Output = Result<Arc<Event>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.shared)
            .poll(cx)
            .map(|res| res.map_err(|_| Error::Cancelled))
    }
}

/// One channel on the server.
///
/// Created by the listener on the first `CHANNEL_CREATE`/`CHANNEL_ORIGINATE`
/// observed for a uuid and marked terminal on `CHANNEL_HANGUP`. Command
/// helpers write through the owning node's connection; commands that the
/// server acknowledges with a bare reply are fire-and-forget, failures are
/// logged.
pub struct Session {
    uuid: String,
    con: Connection,
    state: Mutex<SessionState>,
    vars: Mutex<HashMap<String, Value>>,
    pending: Mutex<HashMap<String, PendingRecv>>,
    call: Mutex<Option<Arc<Call>>>,
    bg_job: Mutex<Option<Arc<Job>>>,
    app_id: Mutex<String>,
}

impl Session {
    pub fn new(uuid: impl Into<String>, event: Arc<Event>, con: Connection) -> Session {
        let create = event.event_time();
        Session {
            uuid: uuid.into(),
            con,
            state: Mutex::new(SessionState {
                events: EventHistory::new(event),
                times: SessionTimes {
                    create,
                    ..SessionTimes::default()
                },
                answered: false,
                hungup: false,
            }),
            vars: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            call: Mutex::new(None),
            bg_job: Mutex::new(None),
            app_id: Mutex::new("default".to_string()),
        }
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    /// Host of the node this session lives on.
    pub fn host(&self) -> &str {
        self.con.host()
    }

    pub fn connection(&self) -> &Connection {
        &self.con
    }

    pub fn app_id(&self) -> String {
        self.app_id.lock().clone()
    }

    pub fn set_app_id(&self, app_id: impl Into<String>) {
        *self.app_id.lock() = app_id.into();
    }

    /// Record a received event in the history.
    pub fn update(&self, event: Arc<Event>) {
        self.state.lock().events.update(event);
    }

    /// Newest-first header lookup across the session's event history.
    pub fn header(&self, key: &str) -> Option<String> {
        self.state.lock().events.get(key).map(str::to_string)
    }

    pub fn answered(&self) -> bool {
        self.state.lock().answered
    }

    pub fn hungup(&self) -> bool {
        self.state.lock().hungup
    }

    /// True once the session is terminal.
    pub fn done(&self) -> bool {
        self.hungup()
    }

    pub(crate) fn mark_answered(&self) {
        let mut state = self.state.lock();
        state.answered = true;
        state.times.answer = state.events.latest().and_then(|e| e.event_time());
    }

    pub(crate) fn mark_hungup(&self) {
        let mut state = self.state.lock();
        state.hungup = true;
        state.times.hangup = state.events.latest().and_then(|e| e.event_time());
    }

    pub fn call(&self) -> Option<Arc<Call>> {
        self.call.lock().clone()
    }

    pub fn set_call(&self, call: Arc<Call>) {
        *self.call.lock() = Some(call);
    }

    pub fn bg_job(&self) -> Option<Arc<Job>> {
        self.bg_job.lock().clone()
    }

    pub fn set_bg_job(&self, job: Arc<Job>) {
        *self.bg_job.lock() = Some(job);
    }

    pub fn take_bg_job(&self) -> Option<Arc<Job>> {
        self.bg_job.lock().take()
    }

    pub fn times(&self) -> SessionTimes {
        self.state.lock().times
    }

    /// Mutate the time stamp record in place.
    pub fn with_times<R>(&self, f: impl FnOnce(&mut SessionTimes) -> R) -> R {
        f(&mut self.state.lock().times)
    }

    /// Server time stamp of the most recent event.
    pub fn last_event_time(&self) -> Option<f64> {
        self.state.lock().events.latest().and_then(|e| e.event_time())
    }

    /// Seconds from channel create to the most recent event.
    pub fn uptime(&self) -> f64 {
        let state = self.state.lock();
        match (
            state.events.latest().and_then(|e| e.event_time()),
            state.times.create,
        ) {
            (Some(now), Some(create)) => now - create,
            _ => 0.0,
        }
    }

    pub fn is_inbound(&self) -> bool {
        self.header("Call-Direction").as_deref() == Some("inbound")
    }

    pub fn is_outbound(&self) -> bool {
        self.header("Call-Direction").as_deref() == Some("outbound")
    }

    // app-scoped variable namespace

    pub fn var(&self, key: &str) -> Option<Value> {
        self.vars.lock().get(key).cloned()
    }

    pub fn set_var(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.vars.lock().insert(key.into(), value.into());
    }

    /// True when the variable is set to anything other than
    /// `null`/`false`/`0`/`""`.
    pub fn var_truthy(&self, key: &str) -> bool {
        match self.vars.lock().get(key) {
            None | Some(Value::Null) => false,
            Some(Value::Bool(b)) => *b,
            Some(Value::Number(n)) => n.as_f64().map(|v| v != 0.0).unwrap_or(true),
            Some(Value::String(s)) => !s.is_empty(),
            Some(_) => true,
        }
    }

    // event waiting

    /// Await the next event of type `name` for this session.
    ///
    /// Concurrent waits on the same name share one future; once it resolves
    /// a fresh `recv` starts a new wait.
    pub fn recv(&self, name: &str) -> RecvHandle {
        let mut pending = self.pending.lock();
        let entry = pending.entry(name.to_string()).or_insert_with(|| {
            let (tx, rx) = oneshot::channel();
            PendingRecv {
                tx,
                shared: rx.shared(),
            }
        });
        RecvHandle {
            shared: entry.shared.clone(),
        }
    }

    pub async fn recv_timeout(&self, name: &str, duration: Duration) -> Result<Arc<Event>> {
        match tokio::time::timeout(duration, self.recv(name)).await {
            Ok(res) => res,
            Err(_) => Err(Error::Timeout {
                duration,
                what: format!("event {name} on session {}", self.uuid),
            }),
        }
    }

    /// Await any (or all) of several event types.
    pub async fn poll(
        &self,
        names: &[&str],
        timeout: Option<Duration>,
        return_when: ReturnWhen,
    ) -> Result<Vec<Arc<Event>>> {
        if names.is_empty() {
            return Ok(Vec::new());
        }
        let waits: Vec<RecvHandle> = names.iter().map(|name| self.recv(name)).collect();
        let what = format!("one of {names:?} on session {}", self.uuid);
        let gathered = async move {
            match return_when {
                ReturnWhen::FirstCompleted => {
                    let (first, _, _) = select_all(waits).await;
                    first.map(|event| vec![event])
                }
                ReturnWhen::AllCompleted => {
                    join_all(waits).await.into_iter().collect::<Result<Vec<_>>>()
                }
            }
        };
        match timeout {
            Some(duration) => tokio::time::timeout(duration, gathered)
                .await
                .map_err(|_| Error::Timeout { duration, what })?,
            None => gathered.await,
        }
    }

    /// Resolve the pending wait for `name`, if any. Returns true when a
    /// waiter was woken.
    pub(crate) fn complete_event(&self, name: &str, event: Arc<Event>) -> bool {
        let waiter = self.pending.lock().remove(name);
        match waiter {
            Some(waiter) => {
                let _ = waiter.tx.send(event);
                true
            }
            None => false,
        }
    }

    /// Cancel every outstanding wait; used when the session goes terminal.
    pub(crate) fn cancel_pending(&self) {
        let mut pending = self.pending.lock();
        for (name, _) in pending.drain() {
            debug!("cancelling wait for {name} on hungup session {}", self.uuid);
        }
    }

    // channel commands

    fn api_bg(&self, cmd: String) {
        let con = self.con.clone();
        tokio::spawn(async move {
            if let Err(e) = con.api(&cmd).await {
                warn!("command {cmd:?} failed: {e}");
            }
        });
    }

    fn api_bg_unchecked(&self, cmd: String) {
        let con = self.con.clone();
        tokio::spawn(async move {
            if let Err(e) = con.api_unchecked(&cmd).await {
                warn!("command {cmd:?} failed: {e}");
            }
        });
    }

    /// Execute a dialplan application asynchronously on this channel.
    pub fn execute(&self, app: &str, arg: &str) {
        self.execute_params(app, arg, "");
    }

    pub fn execute_params(&self, app: &str, arg: &str, params: &str) {
        let con = self.con.clone();
        let uuid = self.uuid.clone();
        let app = app.to_string();
        let arg = arg.to_string();
        let params = params.to_string();
        tokio::spawn(async move {
            if let Err(e) = con.sendmsg(&uuid, "execute", &app, &arg, &params, 1).await {
                warn!("execute {app} on {uuid} failed: {e}");
            }
        });
    }

    pub fn answer(&self) {
        self.api_bg(format!("uuid_answer {}", self.uuid));
    }

    /// Hangup this session with the given cause keyword.
    pub fn hangup(&self, cause: &str) {
        self.api_bg(format!("uuid_kill {} {}", self.uuid, cause));
    }

    pub fn park(&self) {
        self.api_bg(format!("uuid_park {}", self.uuid));
    }

    /// Have the server hang this session up `timeout` seconds from now.
    pub fn sched_hangup(&self, timeout: f64, cause: &str) {
        let secs = timeout.max(0.0).round() as u64;
        self.api_bg(format!("sched_hangup +{} {} {}", secs, self.uuid, cause));
    }

    /// Drop all tasks the server has scheduled for this session.
    pub fn clear_tasks(&self) {
        self.api_bg(format!("sched_del {}", self.uuid));
    }

    pub fn send_dtmf(&self, sequence: &str, duration: &str) {
        // uuid_send_dtmf misreports errors, skip the reply check
        self.api_bg_unchecked(format!(
            "uuid_send_dtmf {} {} @{}",
            self.uuid, sequence, duration
        ));
    }

    pub fn sched_dtmf(&self, delay: f64, sequence: &str, tone_duration: Option<u32>) {
        let mut cmd = format!(
            "sched_api +{} none uuid_send_dtmf {} {}",
            delay.max(0.0).round() as u64,
            self.uuid,
            sequence
        );
        if let Some(duration) = tone_duration {
            cmd.push_str(&format!(" @{duration}"));
        }
        self.api_bg(cmd);
    }

    pub async fn getvar(&self, var: &str) -> Result<Option<String>> {
        let body = self
            .con
            .cmd(&format!("uuid_getvar {} {}", self.uuid, var))
            .await?;
        Ok((body != "_undef_").then_some(body))
    }

    pub fn setvar(&self, var: &str, value: &str) {
        self.execute("set", &format!("{var}={value}"));
    }

    /// Set several channel variables with a single command.
    pub fn setvars(&self, params: &[(&str, &str)]) {
        let pairs: Vec<String> = params
            .iter()
            .map(|(var, value)| format!("{var}={value}"))
            .collect();
        self.api_bg(format!(
            "uuid_setvar_multi {} {}",
            self.uuid,
            pairs.join(";")
        ));
    }

    pub fn unsetvar(&self, var: &str) {
        self.execute("unset", var);
    }

    /// Play one or more files on this channel.
    pub fn playback(
        &self,
        streams: &[&str],
        start_sample: Option<u64>,
        endless: bool,
        params: Option<&HashMap<String, String>>,
    ) {
        let app = if endless { "endless_playback" } else { "playback" };
        if streams.len() > 1 {
            self.setvar("playback_delimiter", ";");
        }
        let varset = varset_string(params);
        let mut args = streams.join(";");
        if let Some(sample) = start_sample {
            args.push_str(&format!("@@{sample}"));
        }
        self.execute_params(app, &args, &varset);
    }

    /// Record this session's audio to a file on the server with
    /// `record_session`, sampled at `rate` Hz.
    pub fn start_record(&self, path: &str, rx_only: bool, stereo: bool, rate: u32) {
        if rx_only {
            self.setvar("RECORD_READ_ONLY", "true");
        } else if stereo {
            self.setvar("RECORD_STEREO", "true");
        }
        self.setvar("record_sample_rate", &rate.to_string());
        self.execute("record_session", path);
    }

    pub fn stop_record(&self, path: &str, delay: u64) {
        if delay > 0 {
            self.execute(
                "sched_api",
                &format!("+{delay} none stop_record_session {path}"),
            );
        } else {
            self.execute("stop_record_session", path);
        }
    }

    /// Control server-side recording via `uuid_record <uuid> <action> <path>`.
    pub fn record(&self, action: &str, path: &str) {
        self.api_bg(format!("uuid_record {} {} {}", self.uuid, action, path));
    }

    /// Echo back all received audio.
    pub fn echo(&self) {
        self.execute("echo", "");
    }

    /// Stop playback of media and move on in the dialplan.
    pub fn breakmedia(&self) {
        // uuid_break replies '-ERR no reply' even on success
        self.api_bg_unchecked(format!("uuid_break {}", self.uuid));
    }

    /// Re-invite a bridged peer out of (or back into) the media path.
    pub fn bypass_media(&self, state: bool) {
        if state {
            self.api_bg(format!("uuid_media off {}", self.uuid));
        } else {
            self.api_bg(format!("uuid_media {}", self.uuid));
        }
    }

    pub fn mute(&self, direction: &str, level: u32) {
        self.api_bg(format!(
            "uuid_audio {} start {} mute {}",
            self.uuid, direction, level
        ));
    }

    pub fn unmute(&self, direction: &str) {
        self.mute(direction, 0);
    }

    /// Respond immediately with the given code via the `respond` app.
    pub fn respond(&self, response: &str) {
        self.execute("respond", response);
    }

    /// Send a REFER to the client for the given URI.
    pub fn deflect(&self, uri: &str) {
        self.execute("deflect", uri);
    }

    pub fn speak(&self, text: &str) {
        self.execute("speak", &format!("flite|kal|{text}|"));
    }

    /// Bridge this session to a destination via the `bridge` app.
    pub fn bridge(
        &self,
        dest_url: Option<&str>,
        profile: Option<&str>,
        gateway: Option<&str>,
        proxy: Option<&str>,
        params: Option<&HashMap<String, String>>,
    ) {
        let profile = match gateway {
            Some(gw) => format!("gateway/{gw}"),
            None => profile
                .map(str::to_string)
                .or_else(|| self.header("variable_sofia_profile_name"))
                .unwrap_or_default(),
        };
        let dest = dest_url
            .map(str::to_string)
            .or_else(|| self.header("variable_sip_req_uri"))
            .unwrap_or_default();
        let path = proxy
            .map(|p| format!(";fs_path=sip:{p}"))
            .unwrap_or_default();
        let varset = varset_string(params);
        self.execute("bridge", &format!("{varset}sofia/{profile}/{dest}{path}"));
    }
}

fn varset_string(params: Option<&HashMap<String, String>>) -> String {
    match params {
        Some(params) if !params.is_empty() => {
            let pairs: Vec<String> = params.iter().map(|(k, v)| format!("{k}={v}")).collect();
            format!("{{{}}}", pairs.join(","))
        }
        _ => String::new(),
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("uuid", &self.uuid)
            .field("host", &self.con.host())
            .field("answered", &self.answered())
            .field("hungup", &self.hungup())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sess() -> Session {
        let mut event = Event::with_name("CHANNEL_CREATE");
        event.insert("Unique-ID", "u1");
        event.insert("Call-Direction", "outbound");
        event.insert("Event-Date-Timestamp", "1500000000000000");
        Session::new("u1", Arc::new(event), Connection::new("127.0.0.1", 8021, "ClueCon"))
    }

    #[tokio::test]
    async fn concurrent_recvs_share_one_future() {
        let sess = sess();
        let first = sess.recv("CHANNEL_ANSWER");
        let second = sess.recv("CHANNEL_ANSWER");

        let answer = Arc::new(Event::with_name("CHANNEL_ANSWER"));
        assert!(sess.complete_event("CHANNEL_ANSWER", answer));

        assert_eq!(first.await.unwrap().event_name(), Some("CHANNEL_ANSWER"));
        assert_eq!(second.await.unwrap().event_name(), Some("CHANNEL_ANSWER"));

        // a later recv is a fresh one-shot wait
        let third = sess.recv("CHANNEL_ANSWER");
        sess.cancel_pending();
        assert!(matches!(third.await, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn complete_without_waiter_reports_false() {
        let sess = sess();
        assert!(!sess.complete_event("CHANNEL_PARK", Arc::new(Event::new())));
    }

    #[test]
    fn var_truthiness() {
        let sess = sess();
        assert!(!sess.var_truthy("missing"));
        sess.set_var("flag", false);
        assert!(!sess.var_truthy("flag"));
        sess.set_var("flag", 0);
        assert!(!sess.var_truthy("flag"));
        sess.set_var("flag", "");
        assert!(!sess.var_truthy("flag"));
        sess.set_var("flag", "yes");
        assert!(sess.var_truthy("flag"));
        sess.set_var("flag", 2);
        assert!(sess.var_truthy("flag"));
    }

    #[test]
    fn direction_and_uptime_come_from_events() {
        let sess = sess();
        assert!(sess.is_outbound());
        assert!(!sess.is_inbound());
        assert_eq!(sess.uptime(), 0.0);

        let mut answer = Event::with_name("CHANNEL_ANSWER");
        answer.insert("Event-Date-Timestamp", "1500000002000000");
        sess.update(Arc::new(answer));
        assert!((sess.uptime() - 2.0).abs() < 1e-9);
    }
}
