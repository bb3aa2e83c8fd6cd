//! Client facade: app loading, originate flow, mass hangup.

use std::sync::Arc;
use std::time::Duration;

use crate::client::OriginateSpec;
use crate::commands::OriginateBuilder;
use crate::error::Error;
use crate::tests::{extract_var, node, wait_until, RecordingApp, APP_HEADER, CALL_VAR};

#[tokio::test]
async fn originate_happy_path() {
    let (server, pool) = node().await;
    server.set_auto_bgjob(true);
    let slave = &pool.nodes()[0];

    let app = Arc::new(RecordingApp::default());
    let group = slave
        .client
        .load_app(app.clone(), Some("A"), None, false)
        .await
        .unwrap();
    assert_eq!(group, "A");

    let job = slave
        .client
        .originate(OriginateSpec {
            dest_url: Some("x@h:5080".to_string()),
            app_id: Some("A".to_string()),
            ..OriginateSpec::default()
        })
        .await
        .unwrap();
    let sess_uuid = job.sess_uuid().expect("originating uuid").to_string();

    // the rendered command carries the required variables
    let cmd = server
        .wait_for_command("bgapi originate", Duration::from_secs(1))
        .await
        .expect("originate sent");
    assert_eq!(extract_var(&cmd, "origination_uuid").as_deref(), Some(sess_uuid.as_str()));
    assert_eq!(extract_var(&cmd, "sip_h_X-switchgen_app").as_deref(), Some("A"));
    assert_eq!(extract_var(&cmd, "call_uuid").as_deref(), Some(sess_uuid.as_str()));
    assert_eq!(extract_var(&cmd, "ignore_early_media").as_deref(), Some("true"));
    assert_eq!(extract_var(&cmd, "ignore_display_updates").as_deref(), Some("true"));

    // job result resolves to the originating session uuid
    let resp = job.result(Some(Duration::from_secs(3))).await.unwrap();
    assert_eq!(resp, sess_uuid);

    // the channel comes up and answers
    let headers = [(CALL_VAR, sess_uuid.as_str()), (APP_HEADER, "A")];
    server.send_channel_event("CHANNEL_CREATE", &sess_uuid, &headers);
    server.send_channel_event("CHANNEL_ORIGINATE", &sess_uuid, &headers);
    server.send_channel_event("CHANNEL_ANSWER", &sess_uuid, &headers);

    wait_until("call tracked", || slave.listener.count_calls() == 1).await;
    let sess = slave.listener.session(&sess_uuid).unwrap();
    wait_until("answered", || sess.answered()).await;
    assert_eq!(sess.app_id(), "A");

    wait_until("callbacks saw the flow", || app.seen().len() == 3).await;
    assert_eq!(
        app.seen(),
        vec!["CHANNEL_CREATE", "CHANNEL_ORIGINATE", "CHANNEL_ANSWER"]
    );
}

#[tokio::test]
async fn originate_renders_cached_template() {
    let (server, pool) = node().await;
    let slave = &pool.nodes()[0];
    let app = Arc::new(RecordingApp::default());
    slave
        .client
        .load_app(app, Some("B"), None, false)
        .await
        .unwrap();

    slave
        .client
        .set_orig_cmd(OriginateBuilder::new("{dest}@fs.lab:5080"));

    let mut rep_fields = std::collections::HashMap::new();
    rep_fields.insert("dest".to_string(), "echoplay".to_string());
    let job = slave
        .client
        .originate(OriginateSpec {
            app_id: Some("B".to_string()),
            rep_fields,
            ..OriginateSpec::default()
        })
        .await
        .unwrap();

    let cmd = server
        .wait_for_command("bgapi originate", Duration::from_secs(1))
        .await
        .unwrap();
    assert!(cmd.contains("sofia/external/echoplay@fs.lab:5080"));
    assert_eq!(
        extract_var(&cmd, "origination_uuid").as_deref(),
        job.sess_uuid()
    );
    assert_eq!(extract_var(&cmd, "sip_h_X-switchgen_app").as_deref(), Some("B"));
}

#[tokio::test]
async fn originate_without_template_or_dest_fails() {
    let (_server, pool) = node().await;
    let slave = &pool.nodes()[0];
    let app = Arc::new(RecordingApp::default());
    slave
        .client
        .load_app(app, Some("C"), None, false)
        .await
        .unwrap();

    let err = slave
        .client
        .originate(OriginateSpec {
            app_id: Some("C".to_string()),
            ..OriginateSpec::default()
        })
        .await;
    assert!(matches!(err, Err(Error::Config(_))));
}

#[tokio::test]
async fn hupall_targets_loaded_app_ids() {
    let (server, pool) = node().await;
    let slave = &pool.nodes()[0];
    let app = Arc::new(RecordingApp::default());
    slave
        .client
        .load_app(app, Some("loadtest"), None, false)
        .await
        .unwrap();

    slave.client.hupall(None).await.unwrap();
    let cmd = server
        .wait_for_command("hupall", Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(
        cmd,
        "api hupall NORMAL_CLEARING sip_h_X-switchgen_app loadtest"
    );
}

#[tokio::test]
async fn callback_for_unhandled_event_installs_lookup_handler() {
    let (server, pool) = node().await;
    let slave = &pool.nodes()[0];

    struct BridgeWatcher {
        hits: parking_lot::Mutex<u32>,
    }
    impl crate::app::CallApp for BridgeWatcher {
        fn name(&self) -> &str {
            "bridgewatch"
        }
        fn register(self: Arc<Self>, reg: &mut crate::app::Registrar) {
            let app = self.clone();
            reg.callback("CHANNEL_BRIDGE", move |_sess, _job| {
                *app.hits.lock() += 1;
            });
        }
    }

    let event_loop = slave.listener.event_loop().clone();
    assert!(!event_loop.has_handler("CHANNEL_BRIDGE"));
    let app = Arc::new(BridgeWatcher {
        hits: parking_lot::Mutex::new(0),
    });
    slave
        .client
        .load_app(app.clone(), Some("bw"), None, false)
        .await
        .unwrap();
    assert!(event_loop.has_handler("CHANNEL_BRIDGE"));

    let headers = [(CALL_VAR, "c1"), (APP_HEADER, "bw")];
    server.send_channel_event("CHANNEL_CREATE", "u1", &headers);
    server.send_channel_event("CHANNEL_BRIDGE", "u1", &headers);
    wait_until("bridge callback hit", || *app.hits.lock() == 1).await;
}

#[tokio::test]
async fn duplicate_app_instance_is_rejected() {
    let (_server, pool) = node().await;
    let slave = &pool.nodes()[0];

    let app = Arc::new(RecordingApp::default());
    slave
        .client
        .load_app(app.clone(), Some("grp"), None, false)
        .await
        .unwrap();
    let err = slave.client.load_app(app, Some("grp"), None, false).await;
    assert!(matches!(err, Err(Error::Config(_))));
}

#[tokio::test]
async fn unload_app_removes_callbacks() {
    let (server, pool) = node().await;
    let slave = &pool.nodes()[0];

    let app = Arc::new(RecordingApp::default());
    slave
        .client
        .load_app(app.clone(), Some("gone"), None, false)
        .await
        .unwrap();
    slave.client.unload_app("gone", None);
    assert!(slave.client.app_ids().is_empty());

    let headers = [(CALL_VAR, "u1"), (APP_HEADER, "gone")];
    server.send_channel_event("CHANNEL_CREATE", "u1", &headers);
    wait_until("session tracked", || slave.listener.count_sessions() == 1).await;
    assert!(app.seen().is_empty());
}
