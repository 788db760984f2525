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

//! Metrics instrumentation for tracker observability.
//!
//! Recording goes through the `metrics` facade, so any exporter (Prometheus,
//! StatsD, ...) installed by the host process picks the values up. With no
//! recorder installed every call is a no-op.
//!
//! # Naming Conventions
//!
//! All metrics follow Prometheus naming conventions:
//! - Prefix with application name (tabletrack\_)
//! - Include unit suffix (\_seconds, \_total)
//! - Counter metrics end with \_total
//!
//! # Labels
//!
//! - **source**: source identifier such as `DB1` (low cardinality)
//! - **kind**: change kind `inserted`, `updated`, `deleted`
//! - **stage**: fault stage `open`, `receive`, `decode`, `dispatch`
//!
//! Row keys, handler names and error messages are never used as labels.
//!
//! # Examples
//!
//! ```rust
//! use tabletrack_core::metrics;
//! use std::time::Duration;
//!
//! metrics::init_metrics();
//! metrics::increment_events_delivered("DB1", "inserted");
//! metrics::record_dispatch_duration(Duration::from_micros(80), "DB1");
//! metrics::set_active_watchers(2);
//! ```

use crate::watcher::WatcherState;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use std::time::Duration;

/// Metric name prefix for all tracker metrics.
#[doc(hidden)]
pub const METRIC_PREFIX: &str = "tabletrack";

// ============================================================================
// Metric Name Constants
// ============================================================================

/// Events delivered to a source's handlers.
///
/// Type: Counter
/// Labels: source, kind
pub const EVENTS_DELIVERED_TOTAL: &str = "tabletrack_events_delivered_total";

/// Faults reported on the fault stream.
///
/// Type: Counter
/// Labels: source, stage
pub const FAULTS_TOTAL: &str = "tabletrack_faults_total";

/// Handler invocations that returned an error or panicked.
///
/// Type: Counter
/// Labels: source
pub const HANDLER_FAILURES_TOTAL: &str = "tabletrack_handler_failures_total";

/// Channel `open()` retries after a backoff wait.
///
/// Type: Counter
/// Labels: source
pub const RECONNECT_ATTEMPTS_TOTAL: &str = "tabletrack_reconnect_attempts_total";

/// Time spent running all handlers for one event.
///
/// Type: Histogram
/// Labels: source
/// Unit: seconds
pub const DISPATCH_DURATION_SECONDS: &str = "tabletrack_dispatch_duration_seconds";

/// Delay between the source observing a change and the watcher decoding it.
///
/// Type: Histogram
/// Labels: source
/// Unit: seconds
pub const NOTIFICATION_LAG_SECONDS: &str = "tabletrack_notification_lag_seconds";

/// Watchers currently registered.
///
/// Type: Gauge
pub const ACTIVE_WATCHERS: &str = "tabletrack_active_watchers";

/// Current watcher state code (see [`WatcherState::code`]).
///
/// Type: Gauge
/// Labels: source
pub const WATCHER_STATE: &str = "tabletrack_watcher_state";

/// Events waiting in a queued dispatcher.
///
/// Type: Gauge
/// Labels: source
pub const DISPATCH_QUEUE_SIZE: &str = "tabletrack_dispatch_queue_size";

// ============================================================================
// Initialization
// ============================================================================

/// Registers metric descriptions with the installed recorder.
///
/// Call once at startup, after installing an exporter.
pub fn init_metrics() {
    describe_counter!(
        EVENTS_DELIVERED_TOTAL,
        "Total number of change events delivered to handlers"
    );
    describe_counter!(
        FAULTS_TOTAL,
        "Total number of faults reported by watchers, by stage"
    );
    describe_counter!(
        HANDLER_FAILURES_TOTAL,
        "Total number of handler invocations that failed or panicked"
    );
    describe_counter!(
        RECONNECT_ATTEMPTS_TOTAL,
        "Total number of channel open retries after a backoff wait"
    );

    describe_histogram!(
        DISPATCH_DURATION_SECONDS,
        metrics::Unit::Seconds,
        "Time spent running every handler for one event"
    );
    describe_histogram!(
        NOTIFICATION_LAG_SECONDS,
        metrics::Unit::Seconds,
        "Time between the source observing a change and its decode"
    );

    describe_gauge!(
        ACTIVE_WATCHERS,
        metrics::Unit::Count,
        "Number of watchers currently registered"
    );
    describe_gauge!(
        WATCHER_STATE,
        "Watcher state: 0=created, 1=starting, 2=active, 3=reconnecting, 4=stopped, 5=failed"
    );
    describe_gauge!(
        DISPATCH_QUEUE_SIZE,
        metrics::Unit::Count,
        "Number of events waiting in a queued dispatcher"
    );
}

// ============================================================================
// Counter Metrics
// ============================================================================

pub fn increment_events_delivered(source: &str, kind: &str) {
    counter!(EVENTS_DELIVERED_TOTAL, "source" => source.to_string(), "kind" => kind.to_string())
        .increment(1);
}

pub fn increment_faults(source: &str, stage: &str) {
    counter!(FAULTS_TOTAL, "source" => source.to_string(), "stage" => stage.to_string())
        .increment(1);
}

pub fn increment_handler_failures(source: &str) {
    counter!(HANDLER_FAILURES_TOTAL, "source" => source.to_string()).increment(1);
}

pub fn increment_reconnect_attempts(source: &str) {
    counter!(RECONNECT_ATTEMPTS_TOTAL, "source" => source.to_string()).increment(1);
}

// ============================================================================
// Histogram Metrics
// ============================================================================

pub fn record_dispatch_duration(duration: Duration, source: &str) {
    histogram!(DISPATCH_DURATION_SECONDS, "source" => source.to_string())
        .record(duration.as_secs_f64());
}

/// Records notification lag. Negative lags (clock skew) are recorded as zero.
pub fn record_notification_lag(lag_seconds: f64, source: &str) {
    histogram!(NOTIFICATION_LAG_SECONDS, "source" => source.to_string())
        .record(lag_seconds.max(0.0));
}

// ============================================================================
// Gauge Metrics
// ============================================================================

pub fn set_active_watchers(count: usize) {
    gauge!(ACTIVE_WATCHERS).set(count as f64);
}

pub fn set_watcher_state(source: &str, state: WatcherState) {
    gauge!(WATCHER_STATE, "source" => source.to_string()).set(f64::from(state.code()));
}

pub fn increment_dispatch_queue_size(source: &str) {
    gauge!(DISPATCH_QUEUE_SIZE, "source" => source.to_string()).increment(1.0);
}

pub fn decrement_dispatch_queue_size(source: &str) {
    gauge!(DISPATCH_QUEUE_SIZE, "source" => source.to_string()).decrement(1.0);
}

// ============================================================================
// Metric Helper Utilities
// ============================================================================

/// Records the elapsed time through `record_fn` when dropped.
///
/// ```rust
/// use tabletrack_core::metrics::{self, Timer};
///
/// {
///     let _timer = Timer::new("DB1", |duration, source| {
///         metrics::record_dispatch_duration(duration, source);
///     });
///     // ... run handlers ...
/// }
/// ```
pub struct Timer<F>
where
    F: FnOnce(Duration, &str),
{
    start: std::time::Instant,
    label: String,
    record_fn: Option<F>,
}

impl<F> Timer<F>
where
    F: FnOnce(Duration, &str),
{
    pub fn new(label: impl Into<String>, record_fn: F) -> Self {
        Self {
            start: std::time::Instant::now(),
            label: label.into(),
            record_fn: Some(record_fn),
        }
    }
}

impl<F> Drop for Timer<F>
where
    F: FnOnce(Duration, &str),
{
    fn drop(&mut self) {
        let duration = self.start.elapsed();
        if let Some(record_fn) = self.record_fn.take() {
            record_fn(duration, &self.label);
        }
    }
}
