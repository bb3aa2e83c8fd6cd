//! One authenticated TCP link to one server.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, error, info, trace, warn};

use switchgen_esl_core::{ContentType, Decoder, Event};

use crate::error::{Error, Result};

/// Default ESL listen port.
pub const DEFAULT_PORT: u16 = 8021;

/// Event name substituted for a `text/disconnect-notice` frame and for an
/// abrupt transport loss, so both paths share one handler downstream.
pub const SERVER_DISCONNECTED: &str = "SERVER_DISCONNECTED";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
const AUTH_TIMEOUT: Duration = Duration::from_secs(2);
const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(2);

/// Pending reply futures, FIFO per content type.
///
/// A sender is enqueued while the write lock is held, before the command
/// bytes hit the socket, so queue order always matches request order and the
/// server's in-order replies correlate correctly.
#[derive(Default)]
struct Pending {
    auth: VecDeque<oneshot::Sender<Event>>,
    command: VecDeque<oneshot::Sender<Event>>,
    api: VecDeque<oneshot::Sender<Event>>,
}

impl Pending {
    fn queue_for(&mut self, ctype: ContentType) -> Option<&mut VecDeque<oneshot::Sender<Event>>> {
        match ctype {
            ContentType::AuthRequest => Some(&mut self.auth),
            ContentType::CommandReply => Some(&mut self.command),
            ContentType::ApiResponse => Some(&mut self.api),
            _ => None,
        }
    }

    /// Drop every waiter; their receivers resolve to `Error::Closed`.
    fn fail_all(&mut self) {
        self.auth.clear();
        self.command.clear();
        self.api.clear();
    }
}

struct Inner {
    host: String,
    port: u16,
    password: String,
    reply_timeout: Duration,
    connect_lock: tokio::sync::Mutex<()>,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    pending: Mutex<Pending>,
    event_tx: mpsc::UnboundedSender<Event>,
    event_rx: Mutex<Option<mpsc::UnboundedReceiver<Event>>>,
    subscribed: Mutex<Vec<String>>,
    connected: AtomicBool,
    authenticated: AtomicBool,
    exiting: AtomicBool,
    // bumped per (re)connect so a stale reader cannot clobber fresh state
    generation: AtomicU64,
}

/// An inbound-mode connection. Cheap to clone; all clones share one link.
///
/// Decoded `text/event-plain` frames (and disconnect notices) land on the
/// event queue obtained from [`Connection::take_event_queue`]; command
/// replies resolve the futures returned by the command methods.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    pub fn new(host: impl Into<String>, port: u16, password: impl Into<String>) -> Connection {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Connection {
            inner: Arc::new(Inner {
                host: host.into(),
                port,
                password: password.into(),
                reply_timeout: DEFAULT_REPLY_TIMEOUT,
                connect_lock: tokio::sync::Mutex::new(()),
                writer: tokio::sync::Mutex::new(None),
                pending: Mutex::new(Pending::default()),
                event_tx,
                event_rx: Mutex::new(Some(event_rx)),
                subscribed: Mutex::new(Vec::new()),
                connected: AtomicBool::new(false),
                authenticated: AtomicBool::new(false),
                exiting: AtomicBool::new(false),
                generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn host(&self) -> &str {
        &self.inner.host
    }

    pub fn port(&self) -> u16 {
        self.inner.port
    }

    pub fn connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    pub fn authenticated(&self) -> bool {
        self.inner.authenticated.load(Ordering::SeqCst)
    }

    /// True when the teardown was client initiated (an `exit` in flight or
    /// completed), as opposed to a server-side disconnect.
    pub fn exiting(&self) -> bool {
        self.inner.exiting.load(Ordering::SeqCst)
    }

    /// Take the asynchronous event queue. The queue survives reconnects;
    /// only the first caller gets it.
    pub fn take_event_queue(&self) -> Option<mpsc::UnboundedReceiver<Event>> {
        self.inner.event_rx.lock().take()
    }

    /// Event names this connection has subscribed to.
    pub fn subscriptions(&self) -> Vec<String> {
        self.inner.subscribed.lock().clone()
    }

    /// Drop names from the recorded subscription set so they are not
    /// re-issued on reconnect. No wire command is sent.
    pub fn forget_subscriptions(&self, names: &[&str]) {
        self.inner
            .subscribed
            .lock()
            .retain(|sub| !names.contains(&sub.as_str()));
    }

    fn conn_err(&self, reason: impl Into<String>) -> Error {
        Error::Connection {
            host: self.inner.host.clone(),
            port: self.inner.port,
            reason: reason.into(),
        }
    }

    /// Establish the TCP link and authenticate.
    ///
    /// Previously recorded event subscriptions are re-issued after a
    /// successful handshake, which makes this double as `reconnect`.
    pub async fn connect(&self) -> Result<()> {
        let _guard = self.inner.connect_lock.lock().await;
        if self.connected() {
            debug!("connection to {} already up", self.inner.host);
            return Ok(());
        }

        let addr = format!("{}:{}", self.inner.host, self.inner.port);
        let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(&addr))
            .await
            .map_err(|_| self.conn_err("connect timed out"))?
            .map_err(|e| self.conn_err(e.to_string()))?;
        let _ = stream.set_nodelay(true);
        let (read_half, write_half) = stream.into_split();

        // clean slate: fail anything left over from a previous link
        self.inner.pending.lock().fail_all();

        let (auth_tx, auth_rx) = oneshot::channel();
        self.inner.pending.lock().auth.push_back(auth_tx);
        *self.inner.writer.lock().await = Some(write_half);
        self.inner.exiting.store(false, Ordering::SeqCst);
        self.inner.connected.store(true, Ordering::SeqCst);

        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::spawn(read_loop(self.inner.clone(), read_half, generation));

        if timeout(AUTH_TIMEOUT, auth_rx).await.is_err() {
            self.teardown().await;
            return Err(self.conn_err("server never sent an auth request"));
        }

        let auth = format!("auth {}", self.inner.password);
        let reply = match self.send_recv(&auth, ContentType::CommandReply).await {
            Ok(reply) => reply,
            Err(e) => {
                self.teardown().await;
                return Err(self.conn_err(format!("authentication failed: {e}")));
            }
        };
        if reply.reply_text() != Some("+OK accepted") {
            self.teardown().await;
            return Err(self.conn_err(format!(
                "authentication refused ({}), invalid password?",
                reply.reply_text().unwrap_or("no reply text"),
            )));
        }
        self.inner.authenticated.store(true, Ordering::SeqCst);
        info!("connected and authenticated to {}", addr);

        let subs = self.inner.subscribed.lock().clone();
        if !subs.is_empty() {
            self.send_event_command(&subs).await?;
        }
        Ok(())
    }

    /// Gracefully shut the link down with `exit`, then drop the socket.
    pub async fn disconnect(&self) -> Result<()> {
        let _guard = self.inner.connect_lock.lock().await;
        if !self.connected() {
            return Ok(());
        }
        self.inner.exiting.store(true, Ordering::SeqCst);
        match self.send_recv("exit", ContentType::CommandReply).await {
            Ok(reply) => {
                if reply.reply_text() != Some("+OK bye") {
                    warn!(
                        "unexpected exit reply from {}: {:?}",
                        self.inner.host,
                        reply.reply_text()
                    );
                }
            }
            Err(e) => debug!("exit command failed on {}: {}", self.inner.host, e),
        }
        self.teardown().await;
        Ok(())
    }

    async fn teardown(&self) {
        *self.inner.writer.lock().await = None;
        self.inner.connected.store(false, Ordering::SeqCst);
        self.inner.authenticated.store(false, Ordering::SeqCst);
    }

    /// Write a command and await its reply of the given content type.
    pub async fn send_recv(&self, data: &str, ctype: ContentType) -> Result<Event> {
        let rx = {
            let mut writer = self.inner.writer.lock().await;
            let Some(writer) = writer.as_mut() else {
                return Err(Error::NotConnected);
            };
            let (tx, rx) = oneshot::channel();
            {
                let mut pending = self.inner.pending.lock();
                match pending.queue_for(ctype) {
                    Some(queue) => queue.push_back(tx),
                    None => return Err(Error::NotConnected),
                }
            }
            trace!("sending: {data:?}");
            let framed = format!("{data}\n\n");
            if let Err(e) = writer.write_all(framed.as_bytes()).await {
                return Err(Error::Io(e));
            }
            rx
        };

        match timeout(self.inner.reply_timeout, rx).await {
            Err(_) => Err(Error::Timeout {
                duration: self.inner.reply_timeout,
                what: format!("reply to {data:?}"),
            }),
            Ok(Err(_)) => Err(Error::Closed),
            Ok(Ok(event)) => Ok(event),
        }
    }

    /// Blocking server command; errors on an `-ERR` response body.
    pub async fn api(&self, cmd: &str) -> Result<Event> {
        let event = self.api_unchecked(cmd).await?;
        errcheck(&event)?;
        Ok(event)
    }

    /// Blocking server command without error checking, for the handful of
    /// commands whose replies misreport errors.
    pub async fn api_unchecked(&self, cmd: &str) -> Result<Event> {
        debug!("api cmd {cmd:?}");
        self.send_recv(&format!("api {cmd}"), ContentType::ApiResponse)
            .await
    }

    /// Invoke an api command and return just its body text.
    pub async fn cmd(&self, cmd: &str) -> Result<String> {
        let event = self.api(cmd).await?;
        Ok(event.body().unwrap_or("").trim_end().to_string())
    }

    /// Non-blocking server command; the reply carries the `Job-UUID` and the
    /// result arrives later as a `BACKGROUND_JOB` event.
    pub async fn bgapi(&self, cmd: &str) -> Result<Event> {
        debug!("bgapi cmd {cmd:?}");
        let event = self
            .send_recv(&format!("bgapi {cmd}"), ContentType::CommandReply)
            .await?;
        errcheck(&event)?;
        Ok(event)
    }

    /// Execute a dialplan application on a channel via a `sendmsg` packet.
    pub async fn sendmsg(
        &self,
        uuid: &str,
        cmd: &str,
        app: &str,
        arg: &str,
        params: &str,
        loops: u32,
    ) -> Result<Event> {
        let packet = format!(
            "sendmsg {uuid}\ncall-command: {cmd}\nexecute-app-name: {app}\n\
             execute-app-arg: {params}{arg}\nloops: {loops}"
        );
        debug!("sending message:\n{packet}");
        let event = self.send_recv(&packet, ContentType::CommandReply).await?;
        errcheck(&event)?;
        Ok(event)
    }

    /// Subscribe to the given event types, folding `::` sub-classed names
    /// under a single `CUSTOM` prefix.
    pub async fn subscribe<I, S>(&self, names: I) -> Result<Event>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut fresh = Vec::new();
        {
            let mut subscribed = self.inner.subscribed.lock();
            for name in names {
                let name = name.as_ref().to_string();
                if !subscribed.contains(&name) {
                    subscribed.push(name.clone());
                }
                fresh.push(name);
            }
        }
        self.send_event_command(&fresh).await
    }

    async fn send_event_command(&self, names: &[String]) -> Result<Event> {
        let mut std = Vec::new();
        let mut custom = Vec::new();
        for name in names {
            if name.contains("::") {
                custom.push(name.as_str());
            } else {
                std.push(name.as_str());
            }
        }
        if !custom.is_empty() {
            std.push("CUSTOM");
            std.extend(custom);
        }
        let cmd = format!("event plain {}", std.join(" "));
        self.send_recv(&cmd, ContentType::CommandReply).await
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("host", &self.inner.host)
            .field("port", &self.inner.port)
            .field("connected", &self.connected())
            .finish()
    }
}

/// Raise `Error::Api` when the final line of the reply reports `-ERR`.
fn errcheck(event: &Event) -> Result<()> {
    let resp = event
        .body()
        .or_else(|| event.reply_text())
        .unwrap_or_default();
    if resp.lines().last().is_some_and(|line| line.contains("-ERR")) {
        return Err(Error::Api(resp.to_string()));
    }
    Ok(())
}

async fn read_loop(inner: Arc<Inner>, mut read_half: OwnedReadHalf, generation: u64) {
    let mut decoder = Decoder::new();
    let mut buf = vec![0u8; 8192];
    let mut notice_seen = false;

    loop {
        let n = match read_half.read(&mut buf).await {
            Ok(0) => {
                debug!("connection closed by {}", inner.host);
                break;
            }
            Ok(n) => n,
            Err(e) => {
                warn!("read error on {}: {}", inner.host, e);
                break;
            }
        };
        if inner.generation.load(Ordering::SeqCst) != generation {
            debug!("stale reader for {} exiting", inner.host);
            return;
        }
        let frames = match decoder.feed(&buf[..n]) {
            Ok(frames) => frames,
            Err(e) => {
                error!("fatal framing error on {}: {}", inner.host, e);
                break;
            }
        };
        for frame in frames {
            notice_seen |= dispatch_frame(&inner, frame);
        }
    }

    // a newer link may already be up; only clean up our own state
    if inner.generation.load(Ordering::SeqCst) != generation {
        debug!("stale reader for {} exiting", inner.host);
        return;
    }
    inner.connected.store(false, Ordering::SeqCst);
    inner.authenticated.store(false, Ordering::SeqCst);
    inner.pending.lock().fail_all();
    *inner.writer.lock().await = None;

    // abrupt loss never produced a notice, so synthesize one
    if !notice_seen && !inner.exiting.load(Ordering::SeqCst) {
        let mut event = Event::with_name(SERVER_DISCONNECTED);
        event.insert("Content-Type", "text/disconnect-notice");
        let _ = inner.event_tx.send(event);
    }
}

/// Route one decoded frame; returns true for a disconnect notice.
fn dispatch_frame(inner: &Arc<Inner>, event: Event) -> bool {
    let ctype = ContentType::of(&event);
    match ctype {
        ContentType::AuthRequest | ContentType::CommandReply | ContentType::ApiResponse => {
            let waiter = inner
                .pending
                .lock()
                .queue_for(ctype)
                .and_then(|queue| queue.pop_front());
            match waiter {
                Some(tx) => {
                    if tx.send(event).is_err() {
                        warn!("reply future was dropped before completion");
                    }
                }
                None => warn!("no pending future for {ctype:?} reply"),
            }
        }
        ContentType::DisconnectNotice => {
            let mut event = event;
            event.insert("Event-Name", SERVER_DISCONNECTED);
            let _ = inner.event_tx.send(event);
            return true;
        }
        ContentType::EventPlain | ContentType::Other => {
            let _ = inner.event_tx.send(event);
        }
    }
    false
}
