//! Connection handshake and command multiplexing against a scripted server.

use std::time::Duration;

use crate::connection::SERVER_DISCONNECTED;
use crate::testing::MockServer;
use crate::{Connection, Error};
use switchgen_esl_core::Event;

#[tokio::test]
async fn connect_and_auth_ok() {
    let server = MockServer::start().await;
    let con = Connection::new(server.host(), server.port(), "ClueCon");

    con.connect().await.expect("handshake");
    assert!(con.connected());
    assert!(con.authenticated());

    let cmd = server
        .wait_for_command("auth ClueCon", Duration::from_secs(1))
        .await;
    assert!(cmd.is_some());
}

#[tokio::test]
async fn auth_failure_surfaces_host_and_port() {
    let server = MockServer::start().await;
    let con = Connection::new(server.host(), server.port(), "doggy");

    let err = con.connect().await.expect_err("bad password must fail");
    let msg = err.to_string();
    assert!(msg.contains(&server.host()), "missing host in: {msg}");
    assert!(msg.contains(&server.port().to_string()), "missing port in: {msg}");
    assert!(!con.authenticated());
    assert!(!con.connected());
}

#[tokio::test]
async fn api_error_reply_raises() {
    let server = MockServer::start().await;
    server.set_api_handler(|_cmd| "-ERR no such command".to_string());
    let con = Connection::new(server.host(), server.port(), "ClueCon");
    con.connect().await.unwrap();

    match con.api("status").await {
        Err(Error::Api(body)) => assert!(body.contains("-ERR")),
        other => panic!("expected Api error, got {other:?}"),
    }
}

#[tokio::test]
async fn bgapi_reply_carries_job_uuid() {
    let server = MockServer::start().await;
    let con = Connection::new(server.host(), server.port(), "ClueCon");
    con.connect().await.unwrap();

    let reply = con.bgapi("status").await.unwrap();
    let job_uuid = reply.job_uuid().expect("job uuid header");
    assert_eq!(server.jobs().last().map(String::as_str), Some(job_uuid));
}

#[tokio::test]
async fn reply_correlates_after_segmented_event() {
    let server = MockServer::start().await;
    let con = Connection::new(server.host(), server.port(), "ClueCon");
    let mut queue = con.take_event_queue().expect("queue");
    con.connect().await.unwrap();

    // split an event frame across two writes with the reply behind it
    let mut event = Event::with_name("CHANNEL_PARK");
    event.insert("Unique-ID", "seg-1");
    let inner = event.encode();
    let frame = format!(
        "Content-Type: text/event-plain\nContent-Length: {}\n\n{}",
        inner.len(),
        inner
    );
    let (head, tail) = frame.as_bytes().split_at(frame.len() / 2);

    server.send_raw(head);
    tokio::time::sleep(Duration::from_millis(20)).await;
    server.send_raw(tail);

    let reply = con.api("status").await.expect("api reply");
    assert_eq!(reply.body(), Some("+OK"));

    let delivered = queue.recv().await.expect("event delivered");
    assert_eq!(delivered.event_name(), Some("CHANNEL_PARK"));
    assert_eq!(delivered.unique_id(), Some("seg-1"));
}

#[tokio::test]
async fn abrupt_loss_synthesizes_disconnect_event() {
    let server = MockServer::start().await;
    let con = Connection::new(server.host(), server.port(), "ClueCon");
    let mut queue = con.take_event_queue().expect("queue");
    con.connect().await.unwrap();

    server.kill_client();

    let event = tokio::time::timeout(Duration::from_secs(1), queue.recv())
        .await
        .expect("queue should wake")
        .expect("event");
    assert_eq!(event.event_name(), Some(SERVER_DISCONNECTED));
    assert!(!con.connected());
}

#[tokio::test]
async fn sendmsg_formats_execute_packet() {
    let server = MockServer::start().await;
    let con = Connection::new(server.host(), server.port(), "ClueCon");
    con.connect().await.unwrap();

    con.sendmsg("uuid-1", "execute", "playback", "tone_stream://%(251,0,1004)", "", 1)
        .await
        .unwrap();

    let cmd = server
        .wait_for_command("sendmsg uuid-1", Duration::from_secs(1))
        .await
        .expect("sendmsg recorded");
    assert!(cmd.contains("call-command: execute"));
    assert!(cmd.contains("execute-app-name: playback"));
    assert!(cmd.contains("loops: 1"));
}

#[tokio::test]
async fn subscribe_folds_custom_names() {
    let server = MockServer::start().await;
    let con = Connection::new(server.host(), server.port(), "ClueCon");
    con.connect().await.unwrap();

    con.subscribe(["CHANNEL_CREATE", "mod_bert::lost_sync", "BACKGROUND_JOB"])
        .await
        .unwrap();

    let cmd = server
        .wait_for_command("event plain", Duration::from_secs(1))
        .await
        .expect("event cmd recorded");
    assert!(cmd.contains("CHANNEL_CREATE BACKGROUND_JOB CUSTOM mod_bert::lost_sync"));
}
