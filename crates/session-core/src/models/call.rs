//! A collection of sessions composing one phone call.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;

use crate::models::Session;

/// Sessions grouped by the call-tracking channel variable.
///
/// `first` keeps the originating leg, `last` the most recently bridged one.
/// A call exists while at least one member session is tracked.
pub struct Call {
    uuid: String,
    sessions: Mutex<Vec<Arc<Session>>>,
    first: Mutex<Option<Arc<Session>>>,
    last: Mutex<Option<Arc<Session>>>,
    vars: Mutex<HashMap<String, Value>>,
}

impl Call {
    pub fn new(uuid: impl Into<String>, session: Arc<Session>) -> Call {
        Call {
            uuid: uuid.into(),
            sessions: Mutex::new(vec![session.clone()]),
            first: Mutex::new(Some(session)),
            last: Mutex::new(None),
            vars: Mutex::new(HashMap::new()),
        }
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    /// Append a newly bridged leg.
    pub fn append(&self, session: Arc<Session>) {
        self.sessions.lock().push(session.clone());
        *self.last.lock() = Some(session);
    }

    /// Drop a hungup leg; removal is exactly-once.
    pub fn remove(&self, uuid: &str) -> bool {
        let mut sessions = self.sessions.lock();
        let before = sessions.len();
        sessions.retain(|sess| sess.uuid() != uuid);
        before != sessions.len()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }

    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.sessions.lock().clone()
    }

    pub fn contains(&self, uuid: &str) -> bool {
        self.sessions.lock().iter().any(|sess| sess.uuid() == uuid)
    }

    /// The session making up the initial leg of this call.
    pub fn first(&self) -> Option<Arc<Session>> {
        self.first.lock().clone()
    }

    /// The session making up the final leg of this call.
    pub fn last(&self) -> Option<Arc<Session>> {
        self.last.lock().clone()
    }

    /// Given one of `first`/`last`, return the other.
    pub fn get_peer(&self, session: &Arc<Session>) -> Option<Arc<Session>> {
        let first = self.first();
        let last = self.last();
        match (&first, &last) {
            (Some(f), _) if Arc::ptr_eq(f, session) => last,
            (_, Some(l)) if Arc::ptr_eq(l, session) => first,
            _ => None,
        }
    }

    /// Hang the whole call up by killing its first leg.
    pub fn hangup(&self) {
        if let Some(first) = self.first() {
            first.hangup("NORMAL_CLEARING");
        }
    }

    pub fn var(&self, key: &str) -> Option<Value> {
        self.vars.lock().get(key).cloned()
    }

    pub fn set_var(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.vars.lock().insert(key.into(), value.into());
    }

    pub fn var_truthy(&self, key: &str) -> bool {
        match self.vars.lock().get(key) {
            None | Some(Value::Null) => false,
            Some(Value::Bool(b)) => *b,
            Some(Value::Number(n)) => n.as_f64().map(|v| v != 0.0).unwrap_or(true),
            Some(Value::String(s)) => !s.is_empty(),
            Some(_) => true,
        }
    }
}

impl std::fmt::Debug for Call {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Call")
            .field("uuid", &self.uuid)
            .field("sessions", &self.len())
            .finish()
    }
}
