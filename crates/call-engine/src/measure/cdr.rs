//! CDR app: one row of call-oriented time stamps per completed call.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use switchgen_session_core::models::unix_now;
use switchgen_session_core::{Job, Session};

use crate::app::{AppContext, CallApp, CallCounts, Registrar};
use crate::error::Result;
use crate::measure::storage::{DataStorer, Record, MIN_STR_WIDTH};

/// One call detail record, appended when a call's final leg hangs up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CdrRow {
    pub switchgen_app: String,
    pub hangup_cause: String,
    pub caller_create: Option<f64>,
    pub caller_answer: Option<f64>,
    pub caller_req_originate: Option<f64>,
    pub caller_originate: Option<f64>,
    pub caller_hangup: Option<f64>,
    pub job_launch: Option<f64>,
    pub callee_create: Option<f64>,
    pub callee_answer: Option<f64>,
    pub callee_hangup: Option<f64>,
    pub failed_calls: u32,
    pub active_sessions: u32,
    pub erlangs: u32,
}

fn opt(value: Option<f64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

impl Record for CdrRow {
    fn field_names() -> &'static [&'static str] {
        &[
            "switchgen_app",
            "hangup_cause",
            "caller_create",
            "caller_answer",
            "caller_req_originate",
            "caller_originate",
            "caller_hangup",
            "job_launch",
            "callee_create",
            "callee_answer",
            "callee_hangup",
            "failed_calls",
            "active_sessions",
            "erlangs",
        ]
    }

    fn csv_row(&self) -> Vec<String> {
        vec![
            self.switchgen_app.trim_end().to_string(),
            self.hangup_cause.trim_end().to_string(),
            opt(self.caller_create),
            opt(self.caller_answer),
            opt(self.caller_req_originate),
            opt(self.caller_originate),
            opt(self.caller_hangup),
            opt(self.job_launch),
            opt(self.callee_create),
            opt(self.callee_answer),
            opt(self.callee_hangup),
            self.failed_calls.to_string(),
            self.active_sessions.to_string(),
            self.erlangs.to_string(),
        ]
    }

    fn pad_strings(&mut self) {
        pad(&mut self.switchgen_app);
        pad(&mut self.hangup_cause);
    }
}

fn pad(value: &mut String) {
    while value.len() < MIN_STR_WIDTH {
        value.push(' ');
    }
}

/// Collects per-call event time stamps plus active session counts for
/// offline metrics computation.
pub struct Cdr {
    call_counter: AtomicU64,
    storer: Mutex<Option<Arc<DataStorer<CdrRow>>>>,
    counts: Mutex<Option<Arc<dyn CallCounts>>>,
    jobs: Mutex<HashMap<String, Arc<Job>>>,
}

impl Cdr {
    pub fn new() -> Arc<Cdr> {
        Arc::new(Cdr {
            call_counter: AtomicU64::new(0),
            storer: Mutex::new(None),
            counts: Mutex::new(None),
            jobs: Mutex::new(HashMap::new()),
        })
    }

    /// Use a caller-provided row sink instead of the default CSV file.
    pub fn with_storer(storer: Arc<DataStorer<CdrRow>>) -> Arc<Cdr> {
        let cdr = Cdr::new();
        *cdr.storer.lock() = Some(storer);
        cdr
    }

    pub fn storer(&self) -> Option<Arc<DataStorer<CdrRow>>> {
        self.storer.lock().clone()
    }

    fn counts(&self) -> Option<Arc<dyn CallCounts>> {
        self.counts.lock().clone()
    }

    fn on_create(&self, sess: &Arc<Session>) {
        let Some(call) = sess.call() else { return };
        // first leg stamps the call-wide load numbers
        if call.var("call_index").is_none() {
            call.set_var(
                "call_index",
                self.call_counter.fetch_add(1, Ordering::SeqCst),
            );
            if let Some(counts) = self.counts() {
                call.set_var("session_count", counts.count_sessions() as u64);
                call.set_var("erlangs", counts.count_calls() as u64);
            }
        }
    }

    fn on_originate(&self, sess: &Arc<Session>) {
        let originate = sess.last_event_time();
        sess.with_times(|times| {
            times.originate = originate;
            times.req_originate = Some(unix_now());
        });
    }

    fn on_answer(&self, sess: &Arc<Session>) {
        let answer = sess.last_event_time();
        sess.with_times(|times| times.answer = answer);
    }

    /// Append measurement data exactly once per call, at final-leg hangup.
    fn on_hangup(&self, sess: &Arc<Session>, job: Option<&Arc<Job>>) {
        let Some(call) = sess.call() else { return };
        if let Some(job) = job {
            self.jobs
                .lock()
                .insert(call.uuid().to_string(), job.clone());
        }
        if !call.is_empty() {
            // more sessions are expected to hangup
            return;
        }

        let caller = call.first().unwrap_or_else(|| sess.clone());
        let callee = call.last().filter(|last| !Arc::ptr_eq(last, &caller));
        let job = self.jobs.lock().remove(call.uuid());

        let caller_times = caller.times();
        let callee_times = callee.as_ref().map(|callee| callee.times());
        let failed_calls = self
            .counts()
            .map(|counts| counts.count_failed() as u32)
            .unwrap_or(0);

        let row = CdrRow {
            switchgen_app: caller.app_id(),
            hangup_cause: caller
                .header("Hangup-Cause")
                .unwrap_or_else(|| "unknown".to_string()),
            caller_create: caller_times.create,
            caller_answer: caller_times.answer,
            caller_req_originate: caller_times.req_originate,
            caller_originate: caller_times.originate,
            caller_hangup: caller_times.hangup,
            job_launch: job.map(|job| job.launch_time()),
            callee_create: callee_times.and_then(|t| t.create),
            callee_answer: callee_times.and_then(|t| t.answer),
            callee_hangup: callee_times.and_then(|t| t.hangup),
            failed_calls,
            active_sessions: call
                .var("session_count")
                .and_then(|v| v.as_u64())
                .unwrap_or(0) as u32,
            erlangs: call.var("erlangs").and_then(|v| v.as_u64()).unwrap_or(0) as u32,
        };
        if let Some(storer) = self.storer() {
            storer.append_row(row);
            debug!("recorded cdr for call '{}'", call.uuid());
        }
    }
}

impl CallApp for Cdr {
    fn name(&self) -> &str {
        "cdr"
    }

    fn register(self: Arc<Self>, reg: &mut Registrar) {
        let app = self.clone();
        reg.callback("CHANNEL_CREATE", move |sess, _job| {
            if let Some(sess) = sess {
                app.on_create(sess);
            }
        });
        let app = self.clone();
        reg.callback("CHANNEL_ORIGINATE", move |sess, _job| {
            if let Some(sess) = sess {
                app.on_originate(sess);
            }
        });
        let app = self.clone();
        reg.callback("CHANNEL_ANSWER", move |sess, _job| {
            if let Some(sess) = sess {
                app.on_answer(sess);
            }
        });
        let app = self;
        reg.callback("CHANNEL_HANGUP", move |sess, job| {
            if let Some(sess) = sess {
                app.on_hangup(sess, job);
            }
        });
    }

    fn setup(&self, cx: &AppContext) -> Result<()> {
        *self.counts.lock() = Some(cx.counts.clone());
        let mut storer = self.storer.lock();
        if storer.is_none() {
            let path = std::env::temp_dir().join(format!(
                "switchgen_cdr_{}.csv",
                Uuid::new_v4().simple()
            ));
            *storer = Some(Arc::new(DataStorer::csv("cdr", path)));
        }
        Ok(())
    }
}
