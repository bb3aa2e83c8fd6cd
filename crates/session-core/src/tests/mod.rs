
use std::time::Duration;

use switchgen_esl_transport::testing::MockServer;
use switchgen_esl_transport::Connection;

use crate::config::{Autorecon, ListenerConfig};
use crate::listener::{get_listener, EventListener};
use crate::EventLoop;

/// Bring up a connected listener against a scripted server.
pub(crate) async fn setup() -> (MockServer, EventLoop, EventListener) {
    setup_with(ListenerConfig {
        autorecon: Autorecon::Never,
        ..ListenerConfig::default()
    })
    .await
}

pub(crate) async fn setup_with(
    config: ListenerConfig,
) -> (MockServer, EventLoop, EventListener) {
    let server = MockServer::start().await;
    let con = Connection::new(server.host(), server.port(), "ClueCon");
    let (event_loop, listener) = get_listener(con, config).expect("listener");
    listener.connect().await.expect("connect");
    listener.start().expect("start");
    (server, event_loop, listener)
}

/// Poll until `predicate` holds or a few seconds pass.
pub(crate) async fn wait_until(what: &str, mut predicate: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while !predicate() {
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
