//! In-process scripted server used by the test suites.
//!
//! Speaks just enough of the wire protocol to exercise the client stack: it
//! runs the auth handshake, acknowledges commands, and lets a test push
//! events or raw bytes at the connected client. Received command blocks are
//! recorded for assertions.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use switchgen_esl_core::Event;

type ApiHandler = Box<dyn FnMut(&str) -> String + Send>;

#[derive(Default)]
struct MockState {
    password: String,
    commands: Mutex<Vec<String>>,
    jobs: Mutex<Vec<String>>,
    client_tx: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    conn_tasks: Mutex<Vec<JoinHandle<()>>>,
    auto_bgjob: AtomicBool,
    api_handler: Mutex<Option<ApiHandler>>,
}

/// A scripted server bound to an ephemeral localhost port.
pub struct MockServer {
    addr: SocketAddr,
    state: Arc<MockState>,
    accept_task: JoinHandle<()>,
}

impl MockServer {
    pub async fn start() -> MockServer {
        MockServer::with_password("ClueCon").await
    }

    pub async fn with_password(password: &str) -> MockServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock");
        let addr = listener.local_addr().expect("mock addr");
        let state = Arc::new(MockState {
            password: password.to_string(),
            ..MockState::default()
        });
        let accept_state = state.clone();
        let accept_task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let tasks = serve_connection(stream, accept_state.clone());
                accept_state.conn_tasks.lock().extend(tasks);
            }
        });
        MockServer {
            addr,
            state,
            accept_task,
        }
    }

    pub fn host(&self) -> String {
        self.addr.ip().to_string()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Automatically emit a successful `BACKGROUND_JOB` for every bgapi
    /// originate, echoing the command's `origination_uuid` in the body.
    pub fn set_auto_bgjob(&self, enabled: bool) {
        self.state.auto_bgjob.store(enabled, Ordering::SeqCst);
    }

    /// Override the body returned for `api` commands.
    pub fn set_api_handler(&self, handler: impl FnMut(&str) -> String + Send + 'static) {
        *self.state.api_handler.lock() = Some(Box::new(handler));
    }

    /// Every command block received so far.
    pub fn commands(&self) -> Vec<String> {
        self.state.commands.lock().clone()
    }

    /// Job uuids handed out for bgapi commands, oldest first.
    pub fn jobs(&self) -> Vec<String> {
        self.state.jobs.lock().clone()
    }

    /// Poll until a received command contains `needle`.
    pub async fn wait_for_command(&self, needle: &str, wait: Duration) -> Option<String> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            if let Some(cmd) = self
                .state
                .commands
                .lock()
                .iter()
                .find(|cmd| cmd.contains(needle))
            {
                return Some(cmd.clone());
            }
            if tokio::time::Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Ship an event to the client inside a `text/event-plain` frame.
    pub fn send_event(&self, event: &Event) {
        let inner = event.encode();
        let frame = format!(
            "Content-Type: text/event-plain\nContent-Length: {}\n\n{}",
            inner.len(),
            inner
        );
        self.send_raw(frame.as_bytes());
    }

    /// Ship a channel event with a server time stamp.
    pub fn send_channel_event(&self, name: &str, uuid: &str, headers: &[(&str, &str)]) {
        let mut event = Event::with_name(name);
        event.insert("Unique-ID", uuid);
        event.insert("Event-Date-Timestamp", now_usecs().to_string());
        for (key, value) in headers {
            event.insert(*key, *value);
        }
        self.send_event(&event);
    }

    pub fn send_raw(&self, bytes: &[u8]) {
        if let Some(tx) = self.state.client_tx.lock().as_ref() {
            let _ = tx.send(bytes.to_vec());
        }
    }

    /// Drop the active client connection without a disconnect notice.
    pub fn kill_client(&self) {
        *self.state.client_tx.lock() = None;
        for task in self.state.conn_tasks.lock().drain(..) {
            task.abort();
        }
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.accept_task.abort();
        self.kill_client();
    }
}

pub fn now_usecs() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros()
}

fn reply(text: &str) -> Vec<u8> {
    format!("Content-Type: command/reply\nReply-Text: {text}\n\n").into_bytes()
}

fn api_response(body: &str) -> Vec<u8> {
    format!(
        "Content-Type: api/response\nContent-Length: {}\n\n{}",
        body.len(),
        body
    )
    .into_bytes()
}

fn serve_connection(stream: TcpStream, state: Arc<MockState>) -> Vec<JoinHandle<()>> {
    let (mut read_half, mut write_half) = stream.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
    *state.client_tx.lock() = Some(tx.clone());

    let writer = tokio::spawn(async move {
        while let Some(chunk) = rx.recv().await {
            if write_half.write_all(&chunk).await.is_err() {
                break;
            }
        }
    });

    let reader = tokio::spawn(async move {
        let _ = tx.send(b"Content-Type: auth/request\n\n".to_vec());
        let mut pending = String::new();
        let mut buf = [0u8; 8192];
        'conn: loop {
            let n = match read_half.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            pending.push_str(&String::from_utf8_lossy(&buf[..n]));
            while let Some(pos) = pending.find("\n\n") {
                let block = pending[..pos].to_string();
                pending.drain(..pos + 2);
                if !handle_command(&state, &tx, block.trim_end_matches('\n')) {
                    break 'conn;
                }
            }
        }
    });

    vec![reader, writer]
}

/// Process one command block; returns false when the connection should close.
fn handle_command(
    state: &Arc<MockState>,
    tx: &mpsc::UnboundedSender<Vec<u8>>,
    block: &str,
) -> bool {
    state.commands.lock().push(block.to_string());

    if let Some(password) = block.strip_prefix("auth ") {
        if password == state.password {
            let _ = tx.send(reply("+OK accepted"));
            return true;
        }
        let _ = tx.send(reply("-ERR invalid"));
        return false;
    }
    if block.starts_with("event ") {
        let _ = tx.send(reply("+OK event listener enabled plain"));
        return true;
    }
    if block == "exit" {
        let _ = tx.send(reply("+OK bye"));
        let _ = tx.send(b"Content-Type: text/disconnect-notice\n\n".to_vec());
        return false;
    }
    if let Some(cmd) = block.strip_prefix("api ") {
        let body = match state.api_handler.lock().as_mut() {
            Some(handler) => handler(cmd),
            None => "+OK".to_string(),
        };
        let _ = tx.send(api_response(&body));
        return true;
    }
    if let Some(cmd) = block.strip_prefix("bgapi ") {
        let job_uuid = Uuid::new_v4().to_string();
        state.jobs.lock().push(job_uuid.clone());
        let _ = tx.send(
            format!(
                "Content-Type: command/reply\nReply-Text: +OK Job-UUID: {job_uuid}\n\
                 Job-UUID: {job_uuid}\n\n"
            )
            .into_bytes(),
        );
        if state.auto_bgjob.load(Ordering::SeqCst) {
            let sess_uuid = extract_param(cmd, "origination_uuid").unwrap_or_default();
            let mut event = Event::with_name("BACKGROUND_JOB");
            event.insert("Job-UUID", job_uuid);
            event.insert("Event-Date-Timestamp", now_usecs().to_string());
            event.set_body(format!("+OK {sess_uuid}"));
            let inner = event.encode();
            let frame = format!(
                "Content-Type: text/event-plain\nContent-Length: {}\n\n{}",
                inner.len(),
                inner
            );
            let _ = tx.send(frame.into_bytes());
        }
        return true;
    }
    if block.starts_with("sendmsg ") {
        let _ = tx.send(reply("+OK"));
        return true;
    }
    let _ = tx.send(reply("+OK"));
    true
}

/// Pull `name=value` out of an originate variable block.
fn extract_param(cmd: &str, name: &str) -> Option<String> {
    let start = cmd.find(&format!("{name}="))? + name.len() + 1;
    let rest = &cmd[start..];
    let end = rest
        .find([',', '}', ' '])
        .unwrap_or(rest.len());
    Some(rest[..end].to_string())
}
