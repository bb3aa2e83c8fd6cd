//! CDR capture over a full single-node call flow.

use std::sync::Arc;

use crate::measure::cdr::{Cdr, CdrRow};
use crate::measure::storage::{CsvStore, DataStorer};
use crate::tests::{node, wait_until, APP_HEADER, CALL_VAR};

fn tmp_csv() -> std::path::PathBuf {
    std::env::temp_dir().join(format!(
        "switchgen_cdr_test_{}.csv",
        uuid::Uuid::new_v4().simple()
    ))
}

#[tokio::test]
async fn one_row_per_completed_call() {
    let (server, pool) = node().await;
    let slave = &pool.nodes()[0];

    let path = tmp_csv();
    let storer = Arc::new(DataStorer::new(
        "cdr",
        Box::new(CsvStore::<CdrRow>::new(&path)),
        64,
    ));
    let cdr = Cdr::with_storer(storer.clone());
    slave
        .client
        .load_app(cdr, Some("meter"), Some(&pool), false)
        .await
        .unwrap();

    let headers = [(CALL_VAR, "call-1"), (APP_HEADER, "meter")];
    server.send_channel_event("CHANNEL_CREATE", "leg-a", &headers);
    server.send_channel_event("CHANNEL_ORIGINATE", "leg-a", &headers);
    server.send_channel_event("CHANNEL_ANSWER", "leg-a", &headers);

    wait_until("session answered", || {
        slave
            .listener
            .session("leg-a")
            .map(|sess| sess.answered())
            .unwrap_or(false)
    })
    .await;

    // nothing is recorded until the call completes
    assert!(storer.buffer().is_empty());

    server.send_channel_event(
        "CHANNEL_HANGUP",
        "leg-a",
        &[
            (CALL_VAR, "call-1"),
            (APP_HEADER, "meter"),
            ("Hangup-Cause", "NORMAL_CLEARING"),
        ],
    );

    wait_until("one cdr row buffered", || storer.row_count() == 1).await;
    let rows = storer.buffer();
    assert_eq!(rows.len(), 1);
    let row = &rows[0];
    assert_eq!(row.switchgen_app, "meter");
    assert_eq!(row.hangup_cause, "NORMAL_CLEARING");
    assert!(row.caller_create.is_some());
    assert!(row.caller_answer.is_some());
    assert!(row.caller_originate.is_some());
    assert!(row.caller_req_originate.is_some());
    assert!(row.caller_hangup.is_some());
    // single leg call never got a callee
    assert!(row.callee_create.is_none());
    assert_eq!(row.failed_calls, 0);
    assert_eq!(row.erlangs, 1);

    storer.stop().await;
    let on_disk = CsvStore::<CdrRow>::read_rows(&path).unwrap();
    assert_eq!(on_disk.len(), 1);
    assert_eq!(on_disk[0][0], "meter");
    let _ = std::fs::remove_file(&path);
}

#[tokio::test]
async fn bridged_call_records_both_legs() {
    let (server, pool) = node().await;
    let slave = &pool.nodes()[0];

    let path = tmp_csv();
    let storer = Arc::new(DataStorer::new(
        "cdr",
        Box::new(CsvStore::<CdrRow>::new(&path)),
        64,
    ));
    let cdr = Cdr::with_storer(storer.clone());
    slave
        .client
        .load_app(cdr, Some("meter"), Some(&pool), false)
        .await
        .unwrap();

    let headers = [(CALL_VAR, "call-2"), (APP_HEADER, "meter")];
    server.send_channel_event("CHANNEL_CREATE", "caller", &headers);
    server.send_channel_event("CHANNEL_CREATE", "callee", &headers);
    server.send_channel_event("CHANNEL_ANSWER", "caller", &headers);
    server.send_channel_event("CHANNEL_ANSWER", "callee", &headers);
    wait_until("both legs up", || slave.listener.count_sessions() == 2).await;

    let hangup = |uuid: &str| {
        let mut hs = headers.to_vec();
        hs.push(("Hangup-Cause", "NORMAL_CLEARING"));
        server.send_channel_event("CHANNEL_HANGUP", uuid, &hs);
    };
    hangup("caller");
    // one leg down, still no row
    wait_until("caller popped", || slave.listener.count_sessions() == 1).await;
    assert_eq!(storer.row_count(), 0);

    hangup("callee");
    wait_until("one cdr row buffered", || storer.row_count() == 1).await;
    let row = &storer.buffer()[0];
    assert!(row.caller_create.is_some());
    assert!(row.callee_create.is_some());
    assert!(row.callee_answer.is_some());
    assert!(row.callee_hangup.is_some());

    storer.stop().await;
    let _ = std::fs::remove_file(&path);
}
