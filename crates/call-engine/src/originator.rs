//! Burst-loop call generator for stress testing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Deserialize;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use switchgen_session_core::dispatch::EventCallback;

use crate::app::CallApp;
use crate::client::OriginateSpec;
use crate::commands::OriginateBuilder;
use crate::error::{Error, Result};
use crate::pool::SlavePool;

/// Operating state of the burst machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Initialized, awaiting the start command.
    Initial,
    /// Calls are currently being originated.
    Originating,
    /// No further bursts are being scheduled.
    Stopped,
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            State::Initial => "INITIAL",
            State::Originating => "ORIGINATING",
            State::Stopped => "STOPPED",
        };
        f.write_str(name)
    }
}

/// Pseudo weighted round robin iterator. Delivers items interleaved in
/// weighted order; weights are mutable between cycles.
#[derive(Debug, Default)]
pub struct WeightedIterator {
    weights: HashMap<String, u32>,
    order: Vec<String>,
    counts: HashMap<String, u32>,
    pos: usize,
}

impl WeightedIterator {
    pub fn new() -> WeightedIterator {
        WeightedIterator::default()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.values().all(|w| *w == 0)
    }

    pub fn weight(&self, key: &str) -> u32 {
        self.weights.get(key).copied().unwrap_or(0)
    }

    /// Set an item's weight and restart the current cycle from the new
    /// snapshot.
    pub fn set_weight(&mut self, key: impl Into<String>, weight: u32) {
        let key = key.into();
        if !self.weights.contains_key(&key) {
            self.order.push(key.clone());
        }
        self.weights.insert(key, weight);
        self.counts = self.weights.clone();
    }

    pub fn next(&mut self) -> Option<String> {
        if self.order.is_empty() || self.is_empty() {
            return None;
        }
        loop {
            if self.counts.values().all(|count| *count == 0) {
                self.counts = self.weights.clone();
            }
            let key = self.order[self.pos % self.order.len()].clone();
            self.pos += 1;
            if let Some(count) = self.counts.get_mut(&key) {
                if *count > 0 {
                    *count -= 1;
                    return Some(key);
                }
            }
        }
    }
}

/// Load settings; a realistic hard cap is kept on the offered rate.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OriginatorConfig {
    /// Target offered calls per second.
    pub rate: f64,
    /// Max concurrent active calls (erlangs).
    pub limit: usize,
    /// Stop after this many originated sessions.
    pub max_offered: u64,
    /// Auto-hangup seconds after answer; 0 means never.
    pub duration: f64,
    /// Burst loop re-entry period in seconds.
    pub period: f64,
    /// Schedule a hangup on each answered call.
    pub autohangup: bool,
    /// Recompute `duration` when `rate`/`limit` change.
    pub auto_duration: bool,
    /// Minimum duration pad in seconds.
    pub duration_offset: f64,
    pub max_rate: f64,
}

impl Default for OriginatorConfig {
    fn default() -> OriginatorConfig {
        OriginatorConfig {
            rate: 30.0,
            limit: 1,
            max_offered: u64::MAX,
            duration: 0.0,
            period: 1.0,
            autohangup: true,
            auto_duration: true,
            duration_offset: 5.0,
            max_rate: 250.0,
        }
    }
}

struct Settings {
    config: OriginatorConfig,
    /// Inter-burst sleep smearing originates across the second.
    ibp: f64,
}

impl Settings {
    fn new(config: OriginatorConfig) -> Settings {
        let mut settings = Settings { config, ibp: 0.0 };
        settings.apply_rate(settings.config.rate);
        settings.apply_limit(settings.config.limit);
        settings
    }

    fn apply_rate(&mut self, rate: f64) {
        let burst_rate = rate.min(self.config.max_rate).max(0.001);
        // leave some headroom for surrounding processing latencies
        self.ibp = 1.0 / burst_rate * 0.90;
        self.config.rate = rate;
        if self.config.auto_duration && self.config.limit > 0 {
            self.config.duration = self.config.limit as f64 / rate + self.config.duration_offset;
        }
    }

    fn apply_limit(&mut self, limit: usize) {
        self.config.limit = limit;
        if self.config.auto_duration && self.config.rate > 0.0 {
            self.config.duration =
                limit as f64 / self.config.rate + self.config.duration_offset;
        }
    }
}

struct OrigInner {
    pool: SlavePool,
    settings: Mutex<Settings>,
    app_weights: Mutex<WeightedIterator>,
    rep_fields: Mutex<Option<RepFieldsFn>>,
    state_tx: watch::Sender<State>,
    burst: AtomicBool,
    exit: AtomicBool,
    wakeup: Notify,
    total_originated: AtomicU64,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Supplies per-call replacement fields for the cached originate template.
pub type RepFieldsFn = Arc<dyn Fn() -> HashMap<String, String> + Send + Sync>;

/// An auto-dialer built for stress testing.
///
/// Runs a background burst task which issues up to
/// `min(limit - active, rate)` originates per period across the pool's
/// admission-filtered nodes, observes the resulting sessions through each
/// node's listener, and schedules auto-hangups after `duration`.
#[derive(Clone)]
pub struct Originator {
    inner: Arc<OrigInner>,
}

impl Originator {
    pub fn new(pool: SlavePool, config: OriginatorConfig) -> Originator {
        Originator {
            inner: Arc::new(OrigInner {
                pool,
                settings: Mutex::new(Settings::new(config)),
                app_weights: Mutex::new(WeightedIterator::new()),
                rep_fields: Mutex::new(None),
                state_tx: watch::channel(State::Initial).0,
                burst: AtomicBool::new(false),
                exit: AtomicBool::new(false),
                wakeup: Notify::new(),
                total_originated: AtomicU64::new(0),
                task: Mutex::new(None),
            }),
        }
    }

    pub fn pool(&self) -> &SlavePool {
        &self.inner.pool
    }

    /// Connect the cluster and apply load-test friendly server settings.
    ///
    /// Call state churn is not interesting under load, so `CALL_UPDATE`
    /// tracking is dropped before the connections come up.
    pub async fn prepare(&self) -> Result<()> {
        for node in self.inner.pool.nodes() {
            let _ = node.listener.unsubscribe(&["CALL_UPDATE"]);
        }
        self.inner.pool.connect_all().await?;

        // raise server session limits out of the way of our own settings
        for cmd in [
            "fsctl sps 10000",
            "fsctl max_sessions 10000",
            "fsctl verbose_events true",
            "fsctl loglevel warning",
        ] {
            for result in self.inner.pool.api_all(cmd).await {
                if let Err(e) = result {
                    warn!("slave setup command {cmd:?} failed: {e}");
                }
            }
        }
        Ok(())
    }

    /// Load a call app cluster-wide and enter it into the weighted app
    /// rotation.
    pub async fn load_app(
        &self,
        app: Arc<dyn CallApp>,
        app_id: Option<&str>,
        weight: u32,
    ) -> Result<String> {
        let mut group_id = None;
        for node in self.inner.pool.nodes() {
            let id = node
                .client
                .load_app(app.clone(), app_id, Some(&self.inner.pool), false)
                .await?;
            self.register_measure_callbacks(&node.event_loop, &id);
            group_id = Some(id);
        }
        let group_id =
            group_id.ok_or_else(|| Error::Config("the slave pool is empty".to_string()))?;
        self.inner
            .app_weights
            .lock()
            .set_weight(group_id.clone(), weight);
        Ok(group_id)
    }

    /// The originator's own observation callbacks, registered under each
    /// loaded app id.
    fn register_measure_callbacks(
        &self,
        event_loop: &switchgen_session_core::EventLoop,
        app_id: &str,
    ) {
        let weak = Arc::downgrade(&self.inner);
        let on_originate: EventCallback = Arc::new(move |_sess, _job| {
            let Some(inner) = weak.upgrade() else { return };
            let total = inner.total_originated.fetch_add(1, Ordering::SeqCst) + 1;
            let max_offered = inner.settings.lock().config.max_offered;
            if total >= max_offered {
                inner.burst.store(false, Ordering::SeqCst);
                info!(
                    "'{total}' sessions have been originated but max allowed is \
                     '{max_offered}', exiting run loop..."
                );
            }
        });
        event_loop.add_callback("CHANNEL_ORIGINATE", app_id, on_originate, false);

        let weak = Arc::downgrade(&self.inner);
        let on_background_job: EventCallback = Arc::new(move |sess, _job| {
            let Some(inner) = weak.upgrade() else { return };
            if let Some(sess) = sess {
                let (duration, autohangup) = {
                    let settings = inner.settings.lock();
                    (settings.config.duration, settings.config.autohangup)
                };
                let noautohangup = sess
                    .call()
                    .map(|call| call.var_truthy("noautohangup"))
                    .unwrap_or(false);
                if autohangup && duration > 0.0 && !noautohangup {
                    debug!("scheduling auto hangup for '{}'", sess.uuid());
                    let remaining = duration - sess.uptime();
                    if remaining > 0.0 {
                        sess.sched_hangup(remaining, "NORMAL_CLEARING");
                    } else {
                        sess.hangup("NORMAL_CLEARING");
                    }
                }
            }
            report_on_none(&inner);
        });
        event_loop.add_callback("BACKGROUND_JOB", app_id, on_background_job, false);

        let weak = Arc::downgrade(&self.inner);
        let on_hangup: EventCallback = Arc::new(move |_sess, _job| {
            if let Some(inner) = weak.upgrade() {
                report_on_none(&inner);
            }
        });
        event_loop.add_callback("CHANNEL_HANGUP", app_id, on_hangup, false);
    }

    /// Cache an originate command template on every client.
    pub fn set_originate_cmd(&self, builder: OriginateBuilder) {
        for node in self.inner.pool.nodes() {
            node.client.set_orig_cmd(builder.clone());
        }
    }

    /// Install a provider of per-call template replacement fields.
    pub fn set_rep_fields_fn(&self, f: RepFieldsFn) {
        *self.inner.rep_fields.lock() = Some(f);
    }

    // load settings

    pub fn rate(&self) -> f64 {
        self.inner.settings.lock().config.rate
    }

    pub fn set_rate(&self, rate: f64) {
        self.inner.settings.lock().apply_rate(rate);
    }

    pub fn limit(&self) -> usize {
        self.inner.settings.lock().config.limit
    }

    pub fn set_limit(&self, limit: usize) {
        self.inner.settings.lock().apply_limit(limit);
    }

    pub fn duration(&self) -> f64 {
        self.inner.settings.lock().config.duration
    }

    pub fn set_duration(&self, duration: f64) {
        self.inner.settings.lock().config.duration = duration;
    }

    pub fn max_offered(&self) -> u64 {
        self.inner.settings.lock().config.max_offered
    }

    pub fn set_max_offered(&self, max_offered: u64) {
        self.inner.settings.lock().config.max_offered = max_offered;
    }

    pub fn set_autohangup(&self, autohangup: bool) {
        self.inner.settings.lock().config.autohangup = autohangup;
    }

    pub fn total_originated_sessions(&self) -> u64 {
        self.inner.total_originated.load(Ordering::SeqCst)
    }

    /// Live weight adjustment for a loaded app.
    pub fn set_app_weight(&self, app_id: &str, weight: u32) {
        self.inner.app_weights.lock().set_weight(app_id, weight);
    }

    pub fn count_calls(&self) -> usize {
        self.inner.pool.fast_count()
    }

    // state machine

    pub fn state(&self) -> State {
        *self.inner.state_tx.borrow()
    }

    pub fn check_state(&self, state: State) -> bool {
        self.state() == state
    }

    pub fn stopped(&self) -> bool {
        self.check_state(State::Stopped)
    }

    /// Block until the state machine reaches `state`.
    pub async fn waitforstate(&self, state: State) {
        let mut rx = self.inner.state_tx.subscribe();
        let _ = rx.wait_for(|current| *current == state).await;
    }

    /// Poll until `predicate` turns false or `timeout` expires.
    pub async fn waitwhile(
        &self,
        mut predicate: impl FnMut() -> bool,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);
        while predicate() {
            if let Some(deadline) = deadline {
                if tokio::time::Instant::now() >= deadline {
                    return Err(Error::Config(
                        "predicate did not turn false in time".to_string(),
                    ));
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        Ok(())
    }

    /// Start the burst loop. Changes state INITIAL | STOPPED -> ORIGINATING.
    pub fn start(&self) -> Result<()> {
        if self.inner.app_weights.lock().is_empty() {
            return Err(Error::Config("no apps have been loaded".to_string()));
        }
        self.inner.pool.start_all()?;

        let mut task = self.inner.task.lock();
        if task.as_ref().map(|t| t.is_finished()).unwrap_or(true) {
            debug!("starting burst loop task");
            let inner = self.inner.clone();
            *task = Some(tokio::spawn(serve_forever(inner)));
        }
        self.inner.burst.store(true, Ordering::SeqCst);
        self.inner.wakeup.notify_one();
        Ok(())
    }

    /// Whether the burst task is up.
    pub fn is_alive(&self) -> bool {
        self.inner
            .task
            .lock()
            .as_ref()
            .is_some_and(|t| !t.is_finished())
    }

    /// Stop the originate loop; outstanding sessions live out their
    /// duration. Changes state ORIGINATING -> STOPPED.
    pub fn stop(&self) {
        if !self.stopped() {
            info!("stopping session origination loop...");
        }
        self.inner.burst.store(false, Ordering::SeqCst);
        self.inner.wakeup.notify_one();
    }

    /// Stop and hangup every call this originator's apps own.
    pub async fn hupall(&self) -> Result<()> {
        warn!("stopping all calls with hupall!");
        self.stop();
        for node in self.inner.pool.nodes() {
            node.client.hupall(None).await?;
        }
        Ok(())
    }

    /// Hangup every call on every slave, whoever originated it.
    pub async fn hard_hupall(&self) -> Result<()> {
        self.stop();
        for node in self.inner.pool.nodes() {
            node.client.cmd("hupall").await?;
        }
        Ok(())
    }

    /// Stop, hangup outstanding calls and retire the burst task.
    pub async fn shutdown(&self) -> Result<()> {
        if self.inner.pool.count_sessions() > 0 {
            self.hupall().await?;
        } else {
            self.stop();
        }
        self.inner.exit.store(true, Ordering::SeqCst);
        self.inner.wakeup.notify_one();
        let task = self.inner.task.lock().take();
        if let Some(task) = task {
            let _ = tokio::time::timeout(Duration::from_secs(2), task).await;
        }
        Ok(())
    }
}

impl std::fmt::Display for Originator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let settings = self.inner.settings.lock();
        write!(
            f,
            "<Originator: active-calls={} state={} total-originated-sessions={} rate={} \
             limit={} max-offered={} duration={}>",
            self.inner.pool.fast_count(),
            self.state(),
            self.inner.total_originated.load(Ordering::SeqCst),
            settings.config.rate,
            settings.config.limit,
            settings.config.max_offered,
            settings.config.duration,
        )
    }
}

fn report_on_none(inner: &Arc<OrigInner>) {
    if inner.pool.count_jobs() == 0 && inner.pool.count_sessions() == 0 {
        info!("all sessions have ended...");
    }
}

fn set_state(inner: &Arc<OrigInner>, next: State) {
    inner.state_tx.send_if_modified(|current| {
        if *current != next {
            info!("state change: '{current}' -> '{next}'");
            *current = next;
            true
        } else {
            false
        }
    });
}

/// Burst task entry point; parks until started, then re-enters the burst
/// loop every `period` seconds until stopped or shut down.
async fn serve_forever(inner: Arc<OrigInner>) {
    loop {
        if inner.exit.load(Ordering::SeqCst) {
            break;
        }
        if !inner.burst.load(Ordering::SeqCst) {
            inner.wakeup.notified().await;
            continue;
        }

        set_state(&inner, State::Originating);
        let mut next_entry = tokio::time::Instant::now();
        while inner.burst.load(Ordering::SeqCst) && !inner.exit.load(Ordering::SeqCst) {
            if let Err(e) = burst_once(&inner).await {
                error!("exiting burst loop due to: {e}");
                break;
            }
            let period = inner.settings.lock().config.period;
            next_entry += Duration::from_secs_f64(period.max(0.01));
            debug!("next burst loop re-entry is in {period} seconds");
            tokio::select! {
                _ = tokio::time::sleep_until(next_entry) => {}
                _ = inner.wakeup.notified() => {}
            }
        }
        info!("stopping burst loop...");
        set_state(&inner, State::Stopped);
    }
    set_state(&inner, State::Stopped);
    info!("terminating originate task...");
}

/// One burst: launch up to `min(limit - active, rate)` originates.
async fn burst_once(inner: &Arc<OrigInner>) -> Result<()> {
    let (limit, rate, ibp) = {
        let settings = inner.settings.lock();
        (
            settings.config.limit,
            settings.config.rate,
            settings.ibp,
        )
    };
    let active = inner.pool.fast_count();
    let num = limit.saturating_sub(active).min(rate.max(0.0) as usize);
    debug!("bursting num originates = {num}");
    if num == 0 {
        debug!("maximum simultaneous sessions limit '{limit}' reached...");
        return Ok(());
    }

    let mut originated = 0;
    for _ in 0..num {
        if !inner.burst.load(Ordering::SeqCst) {
            break;
        }
        if inner.pool.fast_count() >= limit {
            break;
        }
        let Some(node) = inner.pool.next_node() else {
            debug!("all nodes are at capacity");
            break;
        };
        let Some(app_id) = inner.app_weights.lock().next() else {
            break;
        };
        let rep_fields = inner
            .rep_fields
            .lock()
            .clone()
            .map(|f| f())
            .unwrap_or_default();
        node.client
            .originate(OriginateSpec {
                dest_url: None,
                app_id: Some(app_id),
                uuid_str: None,
                rep_fields,
                callback: None,
            })
            .await?;
        originated += 1;
        // smear the burst across the second
        tokio::time::sleep(Duration::from_secs_f64(ibp)).await;
    }
    if originated > 0 {
        debug!("requested {originated} new sessions");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weighted_iterator_interleaves_by_weight() {
        let mut iter = WeightedIterator::new();
        iter.set_weight("a", 2);
        iter.set_weight("b", 1);

        let picks: Vec<String> = (0..6).filter_map(|_| iter.next()).collect();
        // one full cycle is a,b,a; the counts then reset
        assert_eq!(picks, vec!["a", "b", "a", "a", "b", "a"]);
    }

    #[test]
    fn weighted_iterator_sees_live_weight_updates() {
        let mut iter = WeightedIterator::new();
        iter.set_weight("a", 1);
        assert_eq!(iter.next().as_deref(), Some("a"));

        iter.set_weight("b", 2);
        let picks: Vec<String> = (0..3).filter_map(|_| iter.next()).collect();
        assert!(picks.contains(&"b".to_string()));
    }

    #[test]
    fn empty_iterator_yields_nothing() {
        let mut iter = WeightedIterator::new();
        assert_eq!(iter.next(), None);
        iter.set_weight("a", 0);
        assert_eq!(iter.next(), None);
    }

    #[test]
    fn auto_duration_tracks_rate_and_limit() {
        let settings = Settings::new(OriginatorConfig {
            rate: 10.0,
            limit: 20,
            ..OriginatorConfig::default()
        });
        // duration = limit / rate + offset
        assert_eq!(settings.config.duration, 20.0 / 10.0 + 5.0);

        let mut settings = settings;
        settings.apply_rate(5.0);
        assert_eq!(settings.config.duration, 20.0 / 5.0 + 5.0);
        settings.apply_limit(40);
        assert_eq!(settings.config.duration, 40.0 / 5.0 + 5.0);
    }

    #[test]
    fn ibp_is_clipped_by_max_rate() {
        let mut settings = Settings::new(OriginatorConfig::default());
        settings.apply_rate(10_000.0);
        // clipped to max_rate 250 cps
        assert!((settings.ibp - (1.0 / 250.0) * 0.9).abs() < 1e-9);
    }
}
