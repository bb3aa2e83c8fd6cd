//! Burst loop behavior against a scripted server.

use std::sync::Arc;
use std::time::Duration;

use switchgen_esl_core::Event;
use switchgen_session_core::{Autorecon, ListenerConfig, NodeConfig};

use crate::commands::OriginateBuilder;
use crate::error::Error;
use crate::originator::{Originator, OriginatorConfig, State};
use crate::pool::SlavePool;
use crate::tests::{extract_var, node, wait_until, RecordingApp, APP_HEADER, CALL_VAR};

fn load_config() -> OriginatorConfig {
    OriginatorConfig {
        rate: 1.0,
        limit: 1,
        max_offered: 1,
        duration: 2.0,
        period: 1.0,
        autohangup: true,
        auto_duration: false,
        ..OriginatorConfig::default()
    }
}

#[tokio::test]
async fn start_without_apps_is_a_config_error() {
    let (_server, pool) = node().await;
    let orig = Originator::new(pool, OriginatorConfig::default());
    assert!(matches!(orig.start(), Err(Error::Config(_))));
    assert_eq!(orig.state(), State::Initial);
}

#[tokio::test]
async fn burst_offers_stops_at_max_and_schedules_hangup() {
    let (server, pool) = node().await;
    let orig = Originator::new(pool.clone(), load_config());

    let app = Arc::new(RecordingApp::default());
    orig.load_app(app, Some("loadtest"), 1).await.unwrap();
    orig.set_originate_cmd(OriginateBuilder::new("service@fs.lab:5080"));

    assert_eq!(orig.state(), State::Initial);
    orig.start().unwrap();

    // the first burst issues exactly one originate
    let cmd = server
        .wait_for_command("bgapi originate", Duration::from_secs(2))
        .await
        .expect("first originate");
    let uuid = extract_var(&cmd, "origination_uuid").expect("uuid var");

    // channel comes up; the originate event trips the admission counter
    let headers = [(CALL_VAR, uuid.as_str()), (APP_HEADER, "loadtest")];
    server.send_channel_event("CHANNEL_CREATE", &uuid, &headers);
    server.send_channel_event("CHANNEL_ORIGINATE", &uuid, &headers);

    wait_until("originate counted", || orig.total_originated_sessions() == 1).await;
    tokio::time::timeout(Duration::from_secs(3), orig.waitforstate(State::Stopped))
        .await
        .expect("must stop after max_offered");

    server.send_channel_event("CHANNEL_ANSWER", &uuid, &headers);

    // successful background job triggers the auto hangup scheduling
    let job_uuid = server.jobs().first().cloned().expect("job issued");
    let mut bj = Event::with_name("BACKGROUND_JOB");
    bj.insert("Job-UUID", job_uuid);
    bj.set_body(format!("+OK {uuid}"));
    server.send_event(&bj);

    let sched = server
        .wait_for_command("sched_hangup +", Duration::from_secs(2))
        .await
        .expect("auto hangup scheduled");
    assert!(sched.contains(&uuid));

    // the call runs out its duration
    server.send_channel_event(
        "CHANNEL_HANGUP",
        &uuid,
        &[
            (CALL_VAR, uuid.as_str()),
            (APP_HEADER, "loadtest"),
            ("Hangup-Cause", "NORMAL_CLEARING"),
        ],
    );
    wait_until("all calls ended", || pool.count_calls() == 0).await;
    assert_eq!(pool.hangup_causes().get("NORMAL_CLEARING"), Some(&1));

    // no further originates once max_offered was reached
    tokio::time::sleep(Duration::from_millis(1200)).await;
    let originates = server
        .commands()
        .iter()
        .filter(|cmd| cmd.starts_with("bgapi originate"))
        .count();
    assert_eq!(originates, 1);
}

#[tokio::test]
async fn autohangup_disabled_never_schedules() {
    let (server, pool) = node().await;
    let mut config = load_config();
    config.autohangup = false;
    let orig = Originator::new(pool, config);

    let app = Arc::new(RecordingApp::default());
    orig.load_app(app, Some("loadtest"), 1).await.unwrap();
    orig.set_originate_cmd(OriginateBuilder::new("service@fs.lab:5080"));
    orig.start().unwrap();

    let cmd = server
        .wait_for_command("bgapi originate", Duration::from_secs(2))
        .await
        .expect("originate");
    let uuid = extract_var(&cmd, "origination_uuid").unwrap();
    let headers = [(CALL_VAR, uuid.as_str()), (APP_HEADER, "loadtest")];
    server.send_channel_event("CHANNEL_CREATE", &uuid, &headers);
    server.send_channel_event("CHANNEL_ORIGINATE", &uuid, &headers);
    server.send_channel_event("CHANNEL_ANSWER", &uuid, &headers);

    let job_uuid = server.jobs().first().cloned().unwrap();
    let mut bj = Event::with_name("BACKGROUND_JOB");
    bj.insert("Job-UUID", job_uuid);
    bj.set_body(format!("+OK {uuid}"));
    server.send_event(&bj);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(server
        .wait_for_command("sched_hangup", Duration::from_millis(100))
        .await
        .is_none());
    assert!(server
        .wait_for_command("uuid_kill", Duration::from_millis(100))
        .await
        .is_none());
}

#[tokio::test]
async fn admission_skips_nodes_at_capacity() {
    let config = ListenerConfig {
        autorecon: Autorecon::Never,
        max_limit: 0,
        ..ListenerConfig::default()
    };
    let busy = switchgen_esl_transport::testing::MockServer::start().await;
    let idle = switchgen_esl_transport::testing::MockServer::start().await;
    let contacts = [
        NodeConfig {
            host: busy.host(),
            port: busy.port(),
            password: "ClueCon".to_string(),
        },
        NodeConfig {
            host: idle.host(),
            port: idle.port(),
            password: "ClueCon".to_string(),
        },
    ];
    let pool = SlavePool::from_configs(&contacts, config).unwrap();
    pool.connect_all().await.unwrap();
    pool.start_all().unwrap();

    // one active call saturates the first node (max_limit 0)
    busy.send_channel_event("CHANNEL_CREATE", "u1", &[(CALL_VAR, "c1")]);
    wait_until("busy node tracked a call", || pool.count_calls() == 1).await;

    let idle_host = idle.host();
    let idle_port = idle.port();
    for _ in 0..4 {
        let node = pool.next_node().expect("one node stays admissible");
        assert_eq!(node.client.host(), idle_host);
        assert_eq!(node.client.con().port(), idle_port);
    }
}

#[tokio::test]
async fn shutdown_retires_the_burst_task() {
    let (_server, pool) = node().await;
    let orig = Originator::new(pool, load_config());
    let app = Arc::new(RecordingApp::default());
    orig.load_app(app, Some("loadtest"), 1).await.unwrap();
    orig.set_originate_cmd(OriginateBuilder::new("service@fs.lab:5080"));

    orig.start().unwrap();
    assert!(orig.is_alive());
    orig.shutdown().await.unwrap();
    assert!(!orig.is_alive());
    assert_eq!(orig.state(), State::Stopped);
}
