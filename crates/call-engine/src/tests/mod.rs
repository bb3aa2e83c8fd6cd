mod cdr_test;
mod client_test;
mod originator_test;
mod storage_test;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use switchgen_esl_transport::testing::MockServer;
use switchgen_session_core::{Autorecon, ListenerConfig, NodeConfig};

use crate::app::{CallApp, Registrar};
use crate::pool::SlavePool;

pub(crate) const CALL_VAR: &str = "variable_call_uuid";
pub(crate) const APP_HEADER: &str = "variable_sip_h_X-switchgen_app";

/// One connected, running node backed by a scripted server.
pub(crate) async fn node() -> (MockServer, SlavePool) {
    node_with(ListenerConfig {
        autorecon: Autorecon::Never,
        ..ListenerConfig::default()
    })
    .await
}

pub(crate) async fn node_with(config: ListenerConfig) -> (MockServer, SlavePool) {
    let server = MockServer::start().await;
    let contact = NodeConfig {
        host: server.host(),
        port: server.port(),
        password: "ClueCon".to_string(),
    };
    let pool = SlavePool::from_configs(&[contact], config).expect("pool");
    pool.connect_all().await.expect("connect");
    pool.start_all().expect("start");
    (server, pool)
}

pub(crate) async fn wait_until(what: &str, mut predicate: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while !predicate() {
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Minimal app recording which events reached its callbacks.
#[derive(Default)]
pub(crate) struct RecordingApp {
    pub(crate) events: Mutex<Vec<String>>,
}

impl RecordingApp {
    pub(crate) fn seen(&self) -> Vec<String> {
        self.events.lock().clone()
    }
}

impl CallApp for RecordingApp {
    fn name(&self) -> &str {
        "recorder"
    }

    fn register(self: Arc<Self>, reg: &mut Registrar) {
        for evname in [
            "CHANNEL_CREATE",
            "CHANNEL_ORIGINATE",
            "CHANNEL_ANSWER",
            "CHANNEL_HANGUP",
        ] {
            let app = self.clone();
            let name = evname.to_string();
            reg.callback(evname, move |_sess, _job| {
                app.events.lock().push(name.clone());
            });
        }
    }
}

/// Pull `name=value` out of an originate command string.
pub(crate) fn extract_var(cmd: &str, name: &str) -> Option<String> {
    let start = cmd.find(&format!("{name}="))? + name.len() + 1;
    let rest = &cmd[start..];
    let end = rest.find([',', '}', ' ']).unwrap_or(rest.len());
    Some(rest[..end].to_string())
}
