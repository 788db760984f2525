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

//! Event and fault sink.
//!
//! An [`EventSink`] is the ordered delivery point of one watcher: consumers
//! register [`ChangeHandler`]s for change events and [`FaultHandler`]s for
//! faults. Handlers run in registration order. A handler that returns an error
//! or panics is reported as a [`FaultStage::Dispatch`] fault and does not keep
//! the remaining handlers from running.
//!
//! # Example
//!
//! ```rust
//! use tabletrack_core::sink::{EventSink, FnHandler};
//!
//! let sink = EventSink::builder()
//!     .on_change(
//!         "printer",
//!         FnHandler::new(|event| {
//!             println!("{} #{} {}", event.source_id(), event.sequence(), event.kind());
//!             Ok(())
//!         }),
//!     )
//!     .on_fault(|fault: &tabletrack_core::sink::Fault| eprintln!("{fault}"))
//!     .build();
//! # let _ = sink;
//! ```

use crate::event::ChangeEvent;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Notify, RwLock};

/// Error returned by a change handler.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl HandlerError {
    /// Creates a handler error with a custom message.
    pub fn msg(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    /// Wraps any error type.
    pub fn new(source: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self {
            message: source.to_string(),
            source: Some(Box::new(source)),
        }
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Receives change events for one source.
///
/// Handlers are shared between the registry and the watcher task, so they are
/// `Send + Sync` and take `&self`; use interior mutability for state.
#[async_trait]
pub trait ChangeHandler: Send + Sync {
    /// Handles one event.
    ///
    /// # Errors
    ///
    /// An error is reported on the fault stream; delivery continues with the
    /// next handler and the next event.
    async fn handle(&self, event: &ChangeEvent) -> Result<(), HandlerError>;
}

/// Adapts a synchronous closure into a [`ChangeHandler`].
pub struct FnHandler<F> {
    f: F,
}

impl<F> FnHandler<F>
where
    F: Fn(&ChangeEvent) -> Result<(), HandlerError> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F> ChangeHandler for FnHandler<F>
where
    F: Fn(&ChangeEvent) -> Result<(), HandlerError> + Send + Sync,
{
    async fn handle(&self, event: &ChangeEvent) -> Result<(), HandlerError> {
        (self.f)(event)
    }
}

/// Receives faults for one source. Implemented for plain closures.
pub trait FaultHandler: Send + Sync {
    fn on_fault(&self, fault: &Fault);
}

impl<F> FaultHandler for F
where
    F: Fn(&Fault) + Send + Sync,
{
    fn on_fault(&self, fault: &Fault) {
        self(fault);
    }
}

/// Pipeline stage a fault originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FaultStage {
    /// Establishing the notification channel
    Open,
    /// Reading from a live channel
    Receive,
    /// Decoding a raw payload
    Decode,
    /// Running a change handler
    Dispatch,
}

impl FaultStage {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Receive => "receive",
            Self::Decode => "decode",
            Self::Dispatch => "dispatch",
        }
    }
}

impl fmt::Display for FaultStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One fault observed by a watcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fault {
    /// Source the fault belongs to
    #[serde(rename = "source")]
    pub source_id: String,

    pub stage: FaultStage,

    /// Rendered error
    pub cause: String,

    /// Handler name for dispatch faults
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handler: Option<String>,

    /// True for the single fault emitted when a watcher gives up
    #[serde(default)]
    pub terminal: bool,

    /// Sequence number of the affected event, for dispatch faults
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,

    pub timestamp: DateTime<Utc>,
}

impl Fault {
    /// Creates a non-terminal fault timestamped now.
    pub fn new(source_id: impl Into<String>, stage: FaultStage, cause: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            stage,
            cause: cause.into(),
            handler: None,
            terminal: false,
            sequence: None,
            timestamp: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_handler(mut self, handler: impl Into<String>) -> Self {
        self.handler = Some(handler.into());
        self
    }

    #[must_use]
    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = Some(sequence);
        self
    }

    #[must_use]
    pub fn terminal(mut self) -> Self {
        self.terminal = true;
        self
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {} fault", self.source_id, self.stage)?;
        if let Some(handler) = &self.handler {
            write!(f, " in handler '{handler}'")?;
        }
        if self.terminal {
            f.write_str(" (terminal)")?;
        }
        write!(f, ": {}", self.cause)
    }
}

/// A handler that failed while processing one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerFailure {
    /// Registered handler name
    pub handler: String,
    /// Rendered error or panic message
    pub cause: String,
}

type NamedHandler = (String, Arc<dyn ChangeHandler>);

struct SinkInner {
    handlers: RwLock<Vec<NamedHandler>>,
    fault_handlers: RwLock<Vec<Arc<dyn FaultHandler>>>,
}

/// Ordered handler list for one source.
///
/// Cloning is cheap and yields a handle to the same handler lists.
#[derive(Clone)]
pub struct EventSink {
    inner: Arc<SinkInner>,
}

impl fmt::Debug for EventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSink").finish_non_exhaustive()
    }
}

impl Default for EventSink {
    fn default() -> Self {
        Self::from_parts(Vec::new(), Vec::new())
    }
}

impl EventSink {
    /// Creates a sink with no handlers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn builder() -> EventSinkBuilder {
        EventSinkBuilder::default()
    }

    fn from_parts(handlers: Vec<NamedHandler>, fault_handlers: Vec<Arc<dyn FaultHandler>>) -> Self {
        Self {
            inner: Arc::new(SinkInner {
                handlers: RwLock::new(handlers),
                fault_handlers: RwLock::new(fault_handlers),
            }),
        }
    }

    /// Appends a change handler after the existing ones.
    pub async fn subscribe(&self, name: impl Into<String>, handler: Arc<dyn ChangeHandler>) {
        self.inner.handlers.write().await.push((name.into(), handler));
    }

    /// Appends a fault handler.
    pub async fn subscribe_faults(&self, handler: Arc<dyn FaultHandler>) {
        self.inner.fault_handlers.write().await.push(handler);
    }

    /// Names of the registered change handlers, in order.
    pub async fn handler_names(&self) -> Vec<String> {
        self.inner
            .handlers
            .read()
            .await
            .iter()
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Runs every change handler on `event`, in registration order.
    ///
    /// Returns the handlers that failed. A panicking handler is caught and
    /// reported like an error.
    pub async fn dispatch(&self, event: &ChangeEvent) -> Vec<HandlerFailure> {
        // Snapshot the list so subscribe() is not blocked by slow handlers.
        let handlers: Vec<NamedHandler> = self.inner.handlers.read().await.clone();

        let mut failures = Vec::new();
        for (name, handler) in handlers {
            match AssertUnwindSafe(handler.handle(event)).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => failures.push(HandlerFailure {
                    handler: name,
                    cause: e.to_string(),
                }),
                Err(panic) => failures.push(HandlerFailure {
                    handler: name,
                    cause: format!("handler panicked: {}", panic_message(panic.as_ref())),
                }),
            }
        }
        failures
    }

    /// Passes a fault to every fault handler.
    pub async fn report(&self, fault: &Fault) {
        let handlers: Vec<Arc<dyn FaultHandler>> = self.inner.fault_handlers.read().await.clone();
        for handler in handlers {
            if std::panic::catch_unwind(AssertUnwindSafe(|| handler.on_fault(fault))).is_err() {
                tracing::warn!(source = %fault.source_id, "Fault handler panicked");
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Builder for [`EventSink`].
#[derive(Default)]
pub struct EventSinkBuilder {
    handlers: Vec<NamedHandler>,
    fault_handlers: Vec<Arc<dyn FaultHandler>>,
}

impl EventSinkBuilder {
    /// Adds a change handler.
    #[must_use]
    pub fn on_change(mut self, name: impl Into<String>, handler: impl ChangeHandler + 'static) -> Self {
        self.handlers.push((name.into(), Arc::new(handler)));
        self
    }

    /// Adds an already shared change handler.
    #[must_use]
    pub fn on_change_arc(mut self, name: impl Into<String>, handler: Arc<dyn ChangeHandler>) -> Self {
        self.handlers.push((name.into(), handler));
        self
    }

    /// Adds a fault handler.
    #[must_use]
    pub fn on_fault(mut self, handler: impl FaultHandler + 'static) -> Self {
        self.fault_handlers.push(Arc::new(handler));
        self
    }

    #[must_use]
    pub fn build(self) -> EventSink {
        EventSink::from_parts(self.handlers, self.fault_handlers)
    }
}

/// Change handler that records every event it receives.
///
/// Useful for testing and debugging. Clones share the same record.
///
/// ```rust
/// use std::sync::Arc;
/// use tabletrack_core::sink::{CollectingHandler, EventSink};
///
/// let collector = CollectingHandler::new();
/// let sink = EventSink::builder()
///     .on_change_arc("collector", Arc::new(collector.clone()))
///     .build();
/// assert!(collector.is_empty());
/// # let _ = sink;
/// ```
#[derive(Debug, Clone, Default)]
pub struct CollectingHandler {
    events: Arc<Mutex<Vec<ChangeEvent>>>,
    notify: Arc<Notify>,
    delay: Option<Duration>,
}

impl CollectingHandler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleeps for `delay` before recording each event, simulating a slow consumer.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Returns a copy of the recorded events.
    #[must_use]
    pub fn events(&self) -> Vec<ChangeEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Waits until at least `count` events were recorded or `timeout` elapses.
    ///
    /// Returns true if the count was reached.
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, async {
            loop {
                let notified = self.notify.notified();
                if self.len() >= count {
                    return;
                }
                notified.await;
            }
        })
        .await
        .is_ok()
    }
}

#[async_trait]
impl ChangeHandler for CollectingHandler {
    async fn handle(&self, event: &ChangeEvent) -> Result<(), HandlerError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
        self.notify.notify_waiters();
        Ok(())
    }
}
