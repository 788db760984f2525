// Copyright 2025 Tabletrack Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

//! Table watcher: supervision loop for one notification channel.
//!
//! A [`TableWatcher`] owns one [`NotificationChannel`] for one
//! (connection, table) pair and runs it on a dedicated task:
//!
//! ```text
//!   Created ──start()──► Starting ──open ok──► Active ◄──reopen ok── Reconnecting
//!                           │                    │                       │
//!                           │                    └──channel failure─────►│
//!                           └──────── attempts exhausted ──► Failed ◄────┘
//!
//!   stop() from any non-terminal state ──► Stopped
//! ```
//!
//! Within one watcher, channel reads, decoding, sequence assignment and
//! handler dispatch are strictly sequential, which is what guarantees
//! per-source event order. Backoff waits and pending `open()`/`next()` calls
//! are raced against the shutdown signal, so `stop()` never waits for a
//! backoff timer.
//!
//! # Reconnect attempts
//!
//! `max_attempts` counts `open()` calls per connect cycle. On `start()` the
//! first open is immediate and attempt `n > 1` waits `backoff(n - 1)`. After a
//! mid-stream failure every reopen attempt `n` waits `backoff(n)` first. A
//! successful open resets the counter.

use crate::channel::{ChannelError, NotificationChannel, RawChangePayload};
use crate::codec::RowCodec;
use crate::config::{DispatchMode, ReconnectPolicy, TrackerConfig};
use crate::event::ChangeEvent;
use crate::metrics::{self, Timer};
use crate::sink::{EventSink, Fault, FaultStage};
use crate::source::{SourceDescriptor, WatcherId};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch, Mutex, RwLock};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info, instrument, warn, Instrument};

/// Lifecycle state of a [`TableWatcher`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WatcherState {
    /// Constructed, not started
    Created,
    /// Opening the channel for the first time
    Starting,
    /// Receiving and delivering events
    Active,
    /// Re-establishing the channel after a failure
    Reconnecting,
    /// Stopped by the caller
    Stopped,
    /// Gave up after exhausting the reconnect policy
    Failed,
}

impl WatcherState {
    /// Numeric code used by the `tabletrack_watcher_state` gauge.
    #[must_use]
    pub const fn code(&self) -> u8 {
        match self {
            Self::Created => 0,
            Self::Starting => 1,
            Self::Active => 2,
            Self::Reconnecting => 3,
            Self::Stopped => 4,
            Self::Failed => 5,
        }
    }

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Starting => "starting",
            Self::Active => "active",
            Self::Reconnecting => "reconnecting",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        }
    }

    /// Returns true for `Stopped` and `Failed`.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }
}

impl fmt::Display for WatcherState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Counters kept by a watcher.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatcherStats {
    /// Events handed to the sink
    pub events_delivered: u64,

    /// Payloads dropped because they could not be decoded
    pub decode_failures: u64,

    /// Handler invocations that failed or panicked
    pub handler_failures: u64,

    /// `open()` calls, failed ones included
    pub open_attempts: u64,

    /// Backoff waits completed before an `open()` retry
    pub backoff_waits: u64,

    /// Mid-stream channel losses that started a reconnect cycle
    pub reconnects: u64,
}

/// Watcher errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WatcherError {
    /// `start()` was called more than once
    #[error("Watcher is already started")]
    AlreadyStarted,

    /// The reconnect policy ran out of attempts
    #[error("Reconnect attempts exhausted after {attempts} attempt(s)")]
    ReconnectExhausted {
        /// Number of `open()` calls made in the final connect cycle
        attempts: u32,
    },
}

/// Supervises one notification channel and delivers its events.
pub struct TableWatcher {
    id: WatcherId,
    source: SourceDescriptor,
    config: TrackerConfig,
    sink: EventSink,
    fault_tx: Option<broadcast::Sender<Fault>>,
    channel: SharedChannel,
    state_tx: Arc<watch::Sender<WatcherState>>,
    shutdown_tx: watch::Sender<bool>,
    stats: Arc<RwLock<WatcherStats>>,
    started: bool,
    task: Option<JoinHandle<()>>,
    dispatch_worker: Option<AbortHandle>,
}

/// The channel is shared with the task so `stop()` can still close it after
/// aborting a task that overran the grace period.
type SharedChannel = Arc<Mutex<Box<dyn NotificationChannel>>>;

impl fmt::Debug for TableWatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TableWatcher")
            .field("id", &self.id)
            .field("source", &self.source)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl TableWatcher {
    /// Creates a watcher in the `Created` state.
    ///
    /// `fault_tx` optionally mirrors every fault onto a shared broadcast
    /// stream in addition to the sink's fault handlers.
    pub fn new(
        id: WatcherId,
        source: SourceDescriptor,
        channel: Box<dyn NotificationChannel>,
        sink: EventSink,
        config: TrackerConfig,
        fault_tx: Option<broadcast::Sender<Fault>>,
    ) -> Self {
        let (state_tx, _) = watch::channel(WatcherState::Created);
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            id,
            source,
            config,
            sink,
            fault_tx,
            channel: Arc::new(Mutex::new(channel)),
            state_tx: Arc::new(state_tx),
            shutdown_tx,
            stats: Arc::new(RwLock::new(WatcherStats::default())),
            started: false,
            task: None,
            dispatch_worker: None,
        }
    }

    #[inline]
    pub fn id(&self) -> WatcherId {
        self.id
    }

    #[inline]
    pub fn source(&self) -> &SourceDescriptor {
        &self.source
    }

    /// The sink events of this watcher are delivered to.
    #[inline]
    pub fn sink(&self) -> &EventSink {
        &self.sink
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> WatcherState {
        *self.state_tx.borrow()
    }

    /// Subscribes to state transitions.
    ///
    /// ```rust,no_run
    /// # use tabletrack_core::watcher::{TableWatcher, WatcherState};
    /// # async fn example(watcher: &TableWatcher) {
    /// let mut states = watcher.subscribe_state();
    /// let _ = states.wait_for(|s| *s == WatcherState::Active).await;
    /// # }
    /// ```
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<WatcherState> {
        self.state_tx.subscribe()
    }

    /// Snapshot of the watcher counters.
    pub async fn stats(&self) -> WatcherStats {
        self.stats.read().await.clone()
    }

    /// Starts the supervision task.
    ///
    /// # Errors
    ///
    /// Returns [`WatcherError::AlreadyStarted`] if the watcher was started (or
    /// stopped) before.
    pub fn start(&mut self) -> Result<(), WatcherError> {
        if self.started {
            return Err(WatcherError::AlreadyStarted);
        }
        self.started = true;

        publish_state(&self.state_tx, &self.source.source_id, WatcherState::Starting);

        let delivery = Delivery {
            sink: self.sink.clone(),
            reporter: FaultReporter {
                source_id: self.source.source_id.clone(),
                sink: self.sink.clone(),
                fault_tx: self.fault_tx.clone(),
            },
            stats: Arc::clone(&self.stats),
        };

        let dispatcher = Dispatcher::new(self.config.dispatch, &self.source.source_id, delivery.clone());
        self.dispatch_worker = dispatcher.worker_abort_handle();

        let runner = Runner {
            codec: RowCodec::for_source(&self.source),
            source: self.source.clone(),
            channel: Arc::clone(&self.channel),
            policy: self.config.reconnect.clone(),
            state_tx: Arc::clone(&self.state_tx),
            shutdown_rx: self.shutdown_tx.subscribe(),
            dispatcher,
            delivery,
            sequence: 0,
        };

        let span = tracing::info_span!("watcher", id = %self.id, source = %self.source.source_id);
        self.task = Some(tokio::spawn(runner.run().instrument(span)));

        info!(id = %self.id, source = %self.source, "Watcher started");
        Ok(())
    }

    /// Stops the watcher.
    ///
    /// Signals the task and waits up to the configured grace period for it
    /// to close the channel and drain queued handlers. Past the grace period
    /// the task and its dispatch worker are aborted and the channel is closed
    /// here, so no handler runs once this returns.
    ///
    /// Idempotent: a second call, or a call on a watcher that already failed,
    /// is a no-op.
    #[instrument(skip(self), fields(id = %self.id, source = %self.source.source_id))]
    pub async fn stop(&mut self) {
        if !self.started {
            // Never started: nothing is running.
            self.started = true;
            self.channel.lock().await.close().await;
            publish_state(&self.state_tx, &self.source.source_id, WatcherState::Stopped);
            return;
        }

        let Some(mut task) = self.task.take() else {
            return;
        };

        self.shutdown_tx.send_replace(true);

        let grace = self.config.shutdown_grace_period;
        match tokio::time::timeout(grace, &mut task).await {
            Ok(Ok(())) => debug!("Watcher task finished"),
            Ok(Err(e)) => error!(?e, "Watcher task panicked"),
            Err(_) => {
                warn!(?grace, "Watcher did not stop within grace period, aborting");
                if let Some(worker) = self.dispatch_worker.take() {
                    worker.abort();
                }
                task.abort();
                // Wait for the cancelled task to drop its hold on the channel.
                let _ = task.await;
                self.channel.lock().await.close().await;
            }
        }
        self.dispatch_worker = None;

        if !self.state().is_terminal() {
            publish_state(&self.state_tx, &self.source.source_id, WatcherState::Stopped);
        }

        let stats = self.stats.read().await;
        info!(
            state = %self.state(),
            events_delivered = stats.events_delivered,
            reconnects = stats.reconnects,
            "Watcher stopped"
        );
    }
}

impl Drop for TableWatcher {
    fn drop(&mut self) {
        if self.task.is_some() {
            self.shutdown_tx.send_replace(true);
        }
    }
}

fn publish_state(state_tx: &watch::Sender<WatcherState>, source_id: &str, state: WatcherState) {
    let previous = state_tx.send_replace(state);
    if previous != state {
        debug!(source = source_id, from = %previous, to = %state, "Watcher state changed");
    }
    metrics::set_watcher_state(source_id, state);
}

/// Resolves once shutdown has been requested (or the watcher handle is gone).
async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// Reports faults to logs, metrics, the sink and the shared fault stream.
#[derive(Clone)]
struct FaultReporter {
    source_id: String,
    sink: EventSink,
    fault_tx: Option<broadcast::Sender<Fault>>,
}

impl FaultReporter {
    async fn report(&self, fault: Fault) {
        if fault.terminal {
            error!(stage = %fault.stage, cause = %fault.cause, "Terminal watcher fault");
        } else {
            warn!(stage = %fault.stage, cause = %fault.cause, handler = ?fault.handler, "Watcher fault");
        }
        metrics::increment_faults(&self.source_id, fault.stage.as_str());

        self.sink.report(&fault).await;
        if let Some(tx) = &self.fault_tx {
            // No subscribers is fine.
            let _ = tx.send(fault);
        }
    }
}

/// Everything needed to run handlers for one event.
#[derive(Clone)]
struct Delivery {
    sink: EventSink,
    reporter: FaultReporter,
    stats: Arc<RwLock<WatcherStats>>,
}

impl Delivery {
    async fn deliver(&self, event: ChangeEvent) {
        let source_id = &self.reporter.source_id;
        let failures = {
            let _timer = Timer::new(source_id.as_str(), |duration, source| {
                metrics::record_dispatch_duration(duration, source);
            });
            self.sink.dispatch(&event).await
        };

        {
            let mut stats = self.stats.write().await;
            stats.events_delivered += 1;
            stats.handler_failures += failures.len() as u64;
        }
        metrics::increment_events_delivered(source_id, event.kind().as_str());

        for failure in failures {
            metrics::increment_handler_failures(source_id);
            self.reporter
                .report(
                    Fault::new(source_id.clone(), FaultStage::Dispatch, failure.cause)
                        .with_handler(failure.handler)
                        .with_sequence(event.sequence()),
                )
                .await;
        }
    }
}

/// Runs handlers inline or on a per-watcher FIFO worker.
enum Dispatcher {
    Inline(Delivery),
    Queued {
        tx: mpsc::Sender<ChangeEvent>,
        worker: JoinHandle<()>,
        source_id: String,
    },
}

impl Dispatcher {
    fn new(mode: DispatchMode, source_id: &str, delivery: Delivery) -> Self {
        match mode {
            DispatchMode::Inline => Self::Inline(delivery),
            DispatchMode::Queued { capacity } => {
                let (tx, mut rx) = mpsc::channel::<ChangeEvent>(capacity);
                let worker_source = source_id.to_string();
                let worker = tokio::spawn(
                    async move {
                        while let Some(event) = rx.recv().await {
                            metrics::decrement_dispatch_queue_size(&worker_source);
                            delivery.deliver(event).await;
                        }
                    }
                    .in_current_span(),
                );
                Self::Queued {
                    tx,
                    worker,
                    source_id: source_id.to_string(),
                }
            }
        }
    }

    fn worker_abort_handle(&self) -> Option<AbortHandle> {
        match self {
            Self::Inline(_) => None,
            Self::Queued { worker, .. } => Some(worker.abort_handle()),
        }
    }

    /// Waits for queued events to drain.
    async fn finish(self) {
        if let Self::Queued { tx, worker, .. } = self {
            drop(tx);
            match worker.await {
                Err(e) if e.is_panic() => error!(?e, "Dispatch worker panicked"),
                _ => {}
            }
        }
    }
}

enum Connect {
    Opened,
    Shutdown,
    Exhausted { attempts: u32, last_error: ChannelError },
}

enum Receive {
    Shutdown,
    Lost(ChannelError),
}

enum Handoff {
    Accepted,
    Interrupted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Initial,
    Reconnect,
}

/// State owned by the watcher task.
struct Runner {
    source: SourceDescriptor,
    codec: RowCodec,
    channel: SharedChannel,
    policy: ReconnectPolicy,
    state_tx: Arc<watch::Sender<WatcherState>>,
    shutdown_rx: watch::Receiver<bool>,
    dispatcher: Dispatcher,
    delivery: Delivery,
    sequence: u64,
}

impl Runner {
    async fn run(mut self) {
        let mut phase = Phase::Initial;

        loop {
            match self.connect(phase).await {
                Connect::Opened => {}
                Connect::Shutdown => {
                    self.channel.lock().await.close().await;
                    self.finish(WatcherState::Stopped).await;
                    return;
                }
                Connect::Exhausted {
                    attempts,
                    last_error,
                } => {
                    let exhausted = WatcherError::ReconnectExhausted { attempts };
                    self.delivery
                        .reporter
                        .report(
                            Fault::new(
                                self.source.source_id.clone(),
                                FaultStage::Open,
                                format!("{exhausted}: {last_error}"),
                            )
                            .terminal(),
                        )
                        .await;
                    self.finish(WatcherState::Failed).await;
                    return;
                }
            }

            self.set_state(WatcherState::Active);
            let backend = self.channel.lock().await.backend();
            info!(backend, table = %self.source.table, "Channel open, watching for changes");

            match self.receive().await {
                Receive::Shutdown => {
                    self.channel.lock().await.close().await;
                    self.finish(WatcherState::Stopped).await;
                    return;
                }
                Receive::Lost(e) => {
                    self.set_state(WatcherState::Reconnecting);
                    self.delivery
                        .reporter
                        .report(Fault::new(
                            self.source.source_id.clone(),
                            FaultStage::Receive,
                            e.to_string(),
                        ))
                        .await;
                    self.channel.lock().await.close().await;
                    self.delivery.stats.write().await.reconnects += 1;
                    phase = Phase::Reconnect;
                }
            }
        }
    }

    async fn connect(&mut self, phase: Phase) -> Connect {
        let mut attempt: u32 = 0;

        loop {
            attempt = attempt.saturating_add(1);

            let delay = match phase {
                Phase::Initial if attempt == 1 => None,
                Phase::Initial => Some(self.policy.backoff(attempt - 1)),
                Phase::Reconnect => Some(self.policy.backoff(attempt)),
            };

            if let Some(delay) = delay {
                debug!(attempt, ?delay, "Waiting before reopening channel");
                tokio::select! {
                    biased;
                    () = shutdown_requested(&mut self.shutdown_rx) => return Connect::Shutdown,
                    () = tokio::time::sleep(delay) => {}
                }
                self.delivery.stats.write().await.backoff_waits += 1;
                metrics::increment_reconnect_attempts(&self.source.source_id);
            }

            self.delivery.stats.write().await.open_attempts += 1;
            let (channel, source) = (&self.channel, &self.source);
            let result = tokio::select! {
                biased;
                () = shutdown_requested(&mut self.shutdown_rx) => return Connect::Shutdown,
                result = async { channel.lock().await.open(source).await } => result,
            };

            match result {
                Ok(()) => {
                    if phase == Phase::Reconnect || attempt > 1 {
                        info!(attempt, "Channel re-established");
                    }
                    return Connect::Opened;
                }
                Err(e) if self.policy.is_exhausted(attempt) => {
                    return Connect::Exhausted {
                        attempts: attempt,
                        last_error: e,
                    };
                }
                Err(e) => {
                    self.delivery
                        .reporter
                        .report(Fault::new(
                            self.source.source_id.clone(),
                            FaultStage::Open,
                            e.to_string(),
                        ))
                        .await;
                }
            }
        }
    }

    async fn receive(&mut self) -> Receive {
        loop {
            let channel = &self.channel;
            let next = tokio::select! {
                biased;
                () = shutdown_requested(&mut self.shutdown_rx) => return Receive::Shutdown,
                next = async { channel.lock().await.next().await } => next,
            };

            match next {
                Ok(payload) => {
                    if let Some(event) = self.decode(payload).await {
                        if let Handoff::Interrupted = self.dispatch(event).await {
                            return Receive::Shutdown;
                        }
                    }
                }
                Err(ChannelError::Closed) if *self.shutdown_rx.borrow() => {
                    return Receive::Shutdown;
                }
                Err(e) => return Receive::Lost(e),
            }
        }
    }

    /// Decodes a payload and assigns the next sequence number.
    ///
    /// Undecodable payloads are reported and dropped without consuming a
    /// sequence number.
    async fn decode(&mut self, payload: RawChangePayload) -> Option<ChangeEvent> {
        let observed_at = payload.observed_at;

        match self.codec.decode(payload) {
            Ok((snapshot, kind)) => {
                self.sequence += 1;
                let now = Utc::now();
                if let Some(observed) = observed_at {
                    let lag = (now - observed).num_milliseconds() as f64 / 1000.0;
                    metrics::record_notification_lag(lag, &self.source.source_id);
                }
                let event = ChangeEvent::new(
                    self.source.source_id.clone(),
                    self.source.table.clone(),
                    kind,
                    snapshot,
                    observed_at.unwrap_or(now),
                    self.sequence,
                );
                debug!(seq = self.sequence, kind = %kind, key = %event.key(), "Change detected");
                Some(event)
            }
            Err(e) => {
                self.delivery.stats.write().await.decode_failures += 1;
                self.delivery
                    .reporter
                    .report(Fault::new(
                        self.source.source_id.clone(),
                        FaultStage::Decode,
                        e.to_string(),
                    ))
                    .await;
                None
            }
        }
    }

    /// Hands an event to the dispatcher. Interrupted only if shutdown arrived
    /// while waiting on a full queue, or the dispatch worker is gone.
    async fn dispatch(&mut self, event: ChangeEvent) -> Handoff {
        match &self.dispatcher {
            Dispatcher::Inline(delivery) => {
                delivery.deliver(event).await;
                Handoff::Accepted
            }
            Dispatcher::Queued { tx, source_id, .. } => {
                let sent = tokio::select! {
                    biased;
                    () = shutdown_requested(&mut self.shutdown_rx) => return Handoff::Interrupted,
                    sent = tx.send(event) => sent,
                };
                match sent {
                    Ok(()) => {
                        metrics::increment_dispatch_queue_size(source_id);
                        Handoff::Accepted
                    }
                    Err(_) => {
                        error!("Dispatch worker is gone");
                        Handoff::Interrupted
                    }
                }
            }
        }
    }

    async fn finish(self, state: WatcherState) {
        self.dispatcher.finish().await;
        publish_state(&self.state_tx, &self.source.source_id, state);
    }

    fn set_state(&self, state: WatcherState) {
        publish_state(&self.state_tx, &self.source.source_id, state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryChannel;
    use crate::sink::CollectingHandler;
    use serde_json::json;
    use std::time::Duration;

    fn source() -> SourceDescriptor {
        SourceDescriptor::new("DB1", "memory://db1", "Students")
    }

    fn config(max_attempts: u32) -> TrackerConfig {
        TrackerConfig::builder()
            .reconnect(
                ReconnectPolicy::builder()
                    .initial_backoff_ms(100)
                    .max_attempts(max_attempts)
                    .backoff_jitter(0.0)
                    .build()
                    .unwrap(),
            )
            .build()
            .unwrap()
    }

    #[test]
    fn test_state_codes_and_terminality() {
        assert_eq!(WatcherState::Created.code(), 0);
        assert_eq!(WatcherState::Failed.code(), 5);
        assert!(WatcherState::Stopped.is_terminal());
        assert!(WatcherState::Failed.is_terminal());
        assert!(!WatcherState::Reconnecting.is_terminal());
        assert_eq!(WatcherState::Active.to_string(), "active");
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_twice_fails() {
        let (channel, _controller) = MemoryChannel::new();
        let mut watcher = TableWatcher::new(
            WatcherId(1),
            source(),
            Box::new(channel),
            EventSink::new(),
            config(3),
            None,
        );

        watcher.start().unwrap();
        assert_eq!(watcher.start(), Err(WatcherError::AlreadyStarted));
        watcher.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_before_start() {
        let (channel, controller) = MemoryChannel::new();
        let mut watcher = TableWatcher::new(
            WatcherId(1),
            source(),
            Box::new(channel),
            EventSink::new(),
            config(3),
            None,
        );

        watcher.stop().await;
        watcher.stop().await;

        assert_eq!(watcher.state(), WatcherState::Stopped);
        assert_eq!(controller.open_calls(), 0);
        assert_eq!(watcher.start(), Err(WatcherError::AlreadyStarted));
    }

    #[tokio::test(start_paused = true)]
    async fn test_decode_failure_does_not_consume_sequence() {
        let (channel, controller) = MemoryChannel::new();
        let collector = CollectingHandler::new();
        let sink = EventSink::builder()
            .on_change_arc("collector", Arc::new(collector.clone()))
            .build();
        let mut watcher =
            TableWatcher::new(WatcherId(1), source(), Box::new(channel), sink, config(3), None);

        controller.push(RawChangePayload::insert(
            json!({ "id": 1, "name": "Alice" }).as_object().unwrap().clone(),
        ));
        controller.push(RawChangePayload::new("truncate"));
        controller.push(RawChangePayload::delete_key(json!(1)));

        watcher.start().unwrap();
        assert!(collector.wait_for(2, Duration::from_secs(5)).await);

        let sequences: Vec<u64> = collector.events().iter().map(ChangeEvent::sequence).collect();
        assert_eq!(sequences, vec![1, 2]);
        assert_eq!(watcher.stats().await.decode_failures, 1);

        watcher.stop().await;
        assert_eq!(watcher.state(), WatcherState::Stopped);
        assert_eq!(controller.close_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_detected_at_prefers_observed_time() {
        let (channel, controller) = MemoryChannel::new();
        let collector = CollectingHandler::new();
        let sink = EventSink::builder()
            .on_change_arc("collector", Arc::new(collector.clone()))
            .build();
        let mut watcher =
            TableWatcher::new(WatcherId(1), source(), Box::new(channel), sink, config(3), None);

        let observed = Utc::now() - chrono::Duration::seconds(30);
        controller.push(RawChangePayload::delete_key(json!(9)).observed_at(observed));

        watcher.start().unwrap();
        assert!(collector.wait_for(1, Duration::from_secs(5)).await);
        assert_eq!(collector.events()[0].detected_at(), observed);

        watcher.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_backoff_wait() {
        let (channel, controller) = MemoryChannel::new();
        controller.fail_all_opens();

        let config = TrackerConfig::builder()
            .reconnect(
                ReconnectPolicy::builder()
                    .initial_backoff_ms(60_000)
                    .max_backoff_ms(60_000)
                    .max_attempts(0)
                    .backoff_jitter(0.0)
                    .build()
                    .unwrap(),
            )
            .build()
            .unwrap();
        let mut watcher = TableWatcher::new(
            WatcherId(1),
            source(),
            Box::new(channel),
            EventSink::new(),
            config,
            None,
        );
        watcher.start().unwrap();

        // Let the first open fail and the watcher enter its backoff wait.
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;

        let started = tokio::time::Instant::now();
        watcher.stop().await;

        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(watcher.state(), WatcherState::Stopped);
        assert_eq!(watcher.stats().await.backoff_waits, 0);
    }
}
