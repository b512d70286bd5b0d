//! Periodic state reconciliation
//!
//! While the session is `Connected`, re-reads authoritative state every
//! poll interval and merges it into the local `ParameterStore`:
//! - Cycles never overlap; a tick that finds the previous cycle still
//!   running is skipped, not queued
//! - Suppressed parameters are left alone
//! - Subscribers only hear about values that actually changed
//! - A push event newer than an in-flight poll keeps its value
//! - A failed fetch only affects its own parameters; a lost connection stops
//!   the ticker until the next `Connected`

pub mod params;
pub mod queries;

pub use params::{Merge, ObservedParameter, ParameterStore};

use crate::constants::{EVENT_CAPACITY, MIN_SYNC_INTERVAL_MS, SYNC_INTERVAL_MS, SYNC_MAX_IN_FLIGHT};
use crate::error::RequestError;
use crate::session::{SessionEvent, SessionHandle, SessionState};
use futures_util::stream::{self, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::pin::pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use self::queries::{PushUpdate, Query};

/// Reconciliation settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileConfig {
    /// Poll interval (clamped to >= 500 ms)
    pub interval: Duration,
    /// Concurrent requests per cycle
    pub max_in_flight: usize,
    /// Audio inputs whose volume and mute are tracked
    pub inputs: Vec<String>,
    /// Poll `GetStats` and derive the stream bitrate
    pub stats: bool,
    /// Watch every input that reports a volume
    pub discover_inputs: bool,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(SYNC_INTERVAL_MS),
            max_in_flight: SYNC_MAX_IN_FLIGHT,
            inputs: Vec::new(),
            stats: true,
            discover_inputs: false,
        }
    }
}

/// Published when a parameter takes a new value
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterChanged {
    pub name: String,
    pub value: Value,
}

/// Result of one reconciliation cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    Completed { changed: usize },
    /// Previous cycle still running
    Skipped,
    /// Session is not connected; the loop should stop polling
    Disconnected,
}

fn clamp_interval(interval: Duration) -> Duration {
    interval.max(Duration::from_millis(MIN_SYNC_INTERVAL_MS))
}

// =============================================================================
// Reconciler
// =============================================================================

/// Cycle logic, independent of the timer that drives it
pub struct Reconciler {
    session: SessionHandle,
    store: Arc<ParameterStore>,
    inputs: RwLock<BTreeSet<String>>,
    /// Inputs added by discovery, dropped again when they leave the list
    discovered: RwLock<BTreeSet<String>>,
    busy: AtomicBool,
    max_in_flight: usize,
    stats: bool,
    discover_inputs: bool,
    discovery_due: AtomicBool,
    /// Last `(outputBytes, time)` seen while streaming
    byte_sample: Mutex<Option<(u64, Duration)>>,
    clock: Instant,
    events: broadcast::Sender<ParameterChanged>,
}

/// Clears the busy flag when a cycle ends, even on panic
struct BusyGuard<'a>(&'a AtomicBool);

impl<'a> BusyGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Reconciler {
    pub fn new(session: SessionHandle, config: &ReconcileConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            session,
            store: Arc::new(ParameterStore::new()),
            inputs: RwLock::new(config.inputs.iter().cloned().collect()),
            discovered: RwLock::new(BTreeSet::new()),
            busy: AtomicBool::new(false),
            max_in_flight: config.max_in_flight.max(1),
            stats: config.stats,
            discover_inputs: config.discover_inputs,
            discovery_due: AtomicBool::new(config.discover_inputs),
            byte_sample: Mutex::new(None),
            clock: Instant::now(),
            events,
        }
    }

    pub fn store(&self) -> &Arc<ParameterStore> {
        &self.store
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ParameterChanged> {
        self.events.subscribe()
    }

    pub fn watch_input(&self, input: &str) -> bool {
        self.inputs.write().insert(input.to_string())
    }

    /// Stop tracking an input and forget its parameters
    pub fn unwatch_input(&self, input: &str) -> bool {
        self.discovered.write().remove(input);
        let removed = self.inputs.write().remove(input);
        if removed {
            for name in queries::input_parameters(input) {
                self.store.remove(&name);
            }
        }
        removed
    }

    pub fn inputs(&self) -> Vec<String> {
        self.inputs.read().iter().cloned().collect()
    }

    /// Forget per-connection state after a (re)connect
    pub fn reset(&self) {
        *self.byte_sample.lock() = None;
        if self.discover_inputs {
            self.discovery_due.store(true, Ordering::Release);
        }
    }

    fn queries(&self) -> Vec<Query> {
        let mut queries = queries::global_queries();
        if self.stats {
            queries.extend(queries::stats_queries());
        }
        for input in self.inputs.read().iter() {
            queries.extend(queries::input_queries(input));
        }
        queries
    }

    /// Fetch every query once and merge the results
    ///
    /// Each response is merged as soon as it arrives. A value pushed by the
    /// backend after a request went out wins over that request's response.
    pub async fn run_cycle(&self) -> CycleOutcome {
        let Some(_guard) = BusyGuard::acquire(&self.busy) else {
            debug!("Previous sync cycle still running, skipping tick");
            return CycleOutcome::Skipped;
        };

        if self.session.state() != SessionState::Connected {
            return CycleOutcome::Disconnected;
        }

        if self.discovery_due.swap(false, Ordering::AcqRel) {
            match self.discover().await {
                Ok(()) => {}
                Err(e) => {
                    self.discovery_due.store(true, Ordering::Release);
                    if e.is_disconnect() {
                        return CycleOutcome::Disconnected;
                    }
                    warn!("Input discovery failed: {}", e);
                }
            }
        }

        let mut results = pin!(stream::iter(self.queries())
            .map(|query| async move {
                let mark = self.store.push_mark();
                let result = self
                    .session
                    .request(query.request_type, query.data.clone())
                    .await;
                (query, mark, result)
            })
            .buffer_unordered(self.max_in_flight));

        let mut changed = 0;
        let mut disconnected = false;
        while let Some((query, mark, result)) = results.next().await {
            match result {
                Ok(response) => {
                    for (parameter, field) in &query.fields {
                        let Some(value) = response.get(*field) else {
                            debug!("{} response has no {}", query.request_type, field);
                            continue;
                        };
                        let merge = self.store.merge_polled(parameter, value.clone(), mark);
                        if self.publish(parameter, value.clone(), merge) {
                            changed += 1;
                        }
                    }
                    if self.stats
                        && query.request_type == queries::STREAM_STATUS
                        && self.sample_bitrate(&response, mark)
                    {
                        changed += 1;
                    }
                }
                Err(e) if e.is_disconnect() => disconnected = true,
                // Remote object may have been removed; other queries carry on
                Err(e) => debug!("{} failed: {}", query.request_type, e),
            }
        }

        if disconnected {
            CycleOutcome::Disconnected
        } else {
            CycleOutcome::Completed { changed }
        }
    }

    /// Watch every listed input that answers a volume request
    async fn discover(&self) -> Result<(), RequestError> {
        let response = self.session.request(queries::INPUT_LIST, None).await?;
        let listed = queries::listed_inputs(&response);

        let gone: Vec<String> = self
            .discovered
            .read()
            .iter()
            .filter(|input| !listed.contains(input))
            .cloned()
            .collect();
        for input in gone {
            info!("Input {} no longer listed", input);
            self.unwatch_input(&input);
        }

        let candidates: Vec<String> = {
            let known = self.inputs.read();
            listed.into_iter().filter(|input| !known.contains(input)).collect()
        };
        let checked: Vec<(String, Result<Value, RequestError>)> = stream::iter(candidates)
            .map(|input| async move {
                let data = json!({ "inputName": input.as_str() });
                let result = self.session.request(queries::INPUT_VOLUME, Some(data)).await;
                (input, result)
            })
            .buffer_unordered(self.max_in_flight)
            .collect()
            .await;

        for (input, result) in checked {
            match result {
                Ok(_) => {
                    debug!("Watching audio input {}", input);
                    self.discovered.write().insert(input.clone());
                    self.watch_input(&input);
                }
                Err(e) if e.is_disconnect() => return Err(e),
                Err(_) => debug!("{} has no audio, not watched", input),
            }
        }
        Ok(())
    }

    /// Returns `true` if the bitrate parameter changed
    fn sample_bitrate(&self, response: &Value, mark: u64) -> bool {
        let active = response
            .get("outputActive")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let bytes = response.get("outputBytes").and_then(Value::as_u64);

        let kbps = {
            let mut sample = self.byte_sample.lock();
            match (active, bytes) {
                (true, Some(bytes)) => {
                    let current = (bytes, self.clock.elapsed());
                    sample
                        .replace(current)
                        .and_then(|previous| queries::bitrate_kbps(previous, current))
                }
                // Report zero once when the stream stops
                _ => sample.take().map(|_| 0.0),
            }
        };

        let Some(kbps) = kbps else {
            return false;
        };
        let value = json!(kbps);
        let merge = self
            .store
            .merge_polled(queries::STATS_BITRATE, value.clone(), mark);
        self.publish(queries::STATS_BITRATE, value, merge)
    }

    /// Merge parameters carried by a push event
    ///
    /// Per-input values are only kept for watched inputs.
    pub fn apply_event(&self, event: &str, data: &Value) -> usize {
        if self.discover_inputs && queries::changes_input_list(event) {
            self.discovery_due.store(true, Ordering::Release);
        }

        let updates: Vec<PushUpdate> = {
            let inputs = self.inputs.read();
            queries::push_updates(event, data)
                .into_iter()
                .filter(|update| update.input.as_ref().map_or(true, |i| inputs.contains(i)))
                .collect()
        };

        updates
            .into_iter()
            .filter(|update| {
                let merge = self.store.merge_pushed(&update.name, update.value.clone());
                self.publish(&update.name, update.value.clone(), merge)
            })
            .count()
    }

    /// Notify subscribers of a changed value; returns `true` if it changed
    fn publish(&self, name: &str, value: Value, merge: Merge) -> bool {
        match merge {
            Merge::Changed => {
                if queries::is_level(name) {
                    trace!("{} = {}", name, value);
                } else {
                    debug!("{} = {}", name, value);
                }
                let _ = self.events.send(ParameterChanged {
                    name: name.to_string(),
                    value,
                });
                true
            }
            Merge::Unchanged => false,
            Merge::Stale => {
                debug!("{} changed while polling, keeping pushed value", name);
                false
            }
            Merge::Skipped => {
                debug!("{} suppressed, keeping local value", name);
                false
            }
        }
    }
}

// =============================================================================
// Loop
// =============================================================================

/// Entry point: spawns the polling task
pub struct ReconcileLoop;

impl ReconcileLoop {
    /// Spawn the loop on the current tokio runtime
    ///
    /// The task stops once every `ReconcileHandle` has been dropped.
    pub fn spawn(session: SessionHandle, config: ReconcileConfig) -> ReconcileHandle {
        let session_events = session.subscribe();
        let reconciler = Arc::new(Reconciler::new(session, &config));
        let (interval_tx, interval_rx) = watch::channel(clamp_interval(config.interval));

        tokio::spawn(run(reconciler.clone(), session_events, interval_rx));

        ReconcileHandle {
            reconciler,
            interval_tx: Arc::new(interval_tx),
        }
    }
}

/// Cloneable handle to the reconciliation loop
#[derive(Clone)]
pub struct ReconcileHandle {
    reconciler: Arc<Reconciler>,
    interval_tx: Arc<watch::Sender<Duration>>,
}

impl ReconcileHandle {
    /// Mark or clear an in-flight local edit on a parameter
    pub fn set_parameter_suppressed(&self, name: &str, suppressed: bool) {
        self.reconciler.store.set_suppressed(name, suppressed);
    }

    /// Change the poll interval; restarts the ticker
    ///
    /// Returns the interval actually applied (at least 500 ms).
    pub fn set_poll_interval(&self, interval: Duration) -> Duration {
        let interval = clamp_interval(interval);
        self.interval_tx.send_replace(interval);
        interval
    }

    pub fn poll_interval(&self) -> Duration {
        *self.interval_tx.borrow()
    }

    pub fn watch_input(&self, input: &str) -> bool {
        self.reconciler.watch_input(input)
    }

    /// Inputs currently tracked, configured and discovered
    pub fn inputs(&self) -> Vec<String> {
        self.reconciler.inputs()
    }

    pub fn unwatch_input(&self, input: &str) -> bool {
        self.reconciler.unwatch_input(input)
    }

    pub fn parameter(&self, name: &str) -> Option<ObservedParameter> {
        self.reconciler.store.get(name)
    }

    pub fn snapshot(&self) -> BTreeMap<String, ObservedParameter> {
        self.reconciler.store.snapshot()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ParameterChanged> {
        self.reconciler.subscribe()
    }

    /// Run one cycle now, outside the timer
    pub async fn run_cycle(&self) -> CycleOutcome {
        self.reconciler.run_cycle().await
    }
}

fn new_ticker(interval: Duration) -> Interval {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn run(
    reconciler: Arc<Reconciler>,
    mut session_events: broadcast::Receiver<SessionEvent>,
    mut interval_rx: watch::Receiver<Duration>,
) {
    let (stop_tx, mut stop_rx) = mpsc::channel::<()>(1);

    let mut ticker = if reconciler.session.state() == SessionState::Connected {
        Some(new_ticker(*interval_rx.borrow()))
    } else {
        None
    };

    loop {
        tokio::select! {
            event = session_events.recv() => match event {
                Ok(SessionEvent::Connected) => {
                    reconciler.reset();
                    info!("Sync started ({} ms)", interval_rx.borrow().as_millis());
                    ticker = Some(new_ticker(*interval_rx.borrow()));
                }
                Ok(SessionEvent::Disconnected) | Ok(SessionEvent::ConnectionLost(_)) => {
                    if ticker.take().is_some() {
                        info!("Sync stopped");
                    }
                }
                Ok(SessionEvent::Remote { name, data }) => {
                    reconciler.apply_event(&name, &data);
                }
                Ok(_) => {}
                Err(RecvError::Lagged(missed)) => {
                    warn!("Sync missed {} session events, resyncing ticker", missed);
                    let connected = reconciler.session.state() == SessionState::Connected;
                    if connected && ticker.is_none() {
                        ticker = Some(new_ticker(*interval_rx.borrow()));
                    } else if !connected {
                        ticker = None;
                    }
                }
                Err(RecvError::Closed) => break,
            },

            changed = interval_rx.changed() => {
                if changed.is_err() {
                    // Every handle dropped
                    break;
                }
                let interval = *interval_rx.borrow();
                debug!("Poll interval set to {} ms", interval.as_millis());
                if ticker.is_some() {
                    ticker = Some(new_ticker(interval));
                }
            }

            _ = tick(&mut ticker) => {
                let reconciler = reconciler.clone();
                let stop_tx = stop_tx.clone();
                tokio::spawn(async move {
                    if reconciler.run_cycle().await == CycleOutcome::Disconnected {
                        let _ = stop_tx.try_send(());
                    }
                });
            }

            Some(()) = stop_rx.recv() => {
                // A reconnect may already have restarted the ticker
                if reconciler.session.state() != SessionState::Connected && ticker.take().is_some() {
                    info!("Sync stopped until next connect");
                }
            }
        }
    }

    debug!("Reconcile loop stopped");
}
