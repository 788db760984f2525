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

//! In-memory scripted notification channel.
//!
//! [`MemoryChannel`] is a [`NotificationChannel`] whose payload stream and
//! failures are driven from the outside through a [`MemoryChannelController`].
//! It is used by the watcher and registry tests and is handy for exercising
//! handler code without a database.
//!
//! # Example
//!
//! ```rust
//! use serde_json::json;
//! use tabletrack_core::channel::{NotificationChannel, RawChangePayload};
//! use tabletrack_core::memory::MemoryChannel;
//! use tabletrack_core::source::SourceDescriptor;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let (mut channel, controller) = MemoryChannel::new();
//! controller.fail_next_opens(1);
//!
//! let source = SourceDescriptor::new("DB1", "memory://db1", "Students");
//! assert!(channel.open(&source).await.is_err());
//! channel.open(&source).await?;
//!
//! controller.push(RawChangePayload::new("insert").with_column("id", json!(1)));
//! let payload = channel.next().await?;
//! assert_eq!(payload.kind, "insert");
//! assert_eq!(controller.open_calls(), 2);
//! # Ok(())
//! # }
//! ```

use crate::channel::{ChannelError, ChannelFactory, NotificationChannel, RawChangePayload};
use crate::source::SourceDescriptor;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpenFailures {
    None,
    Next(u32),
    Always,
}

#[derive(Debug)]
struct Script {
    queue: VecDeque<Result<RawChangePayload, ChannelError>>,
    open: bool,
    open_failures: OpenFailures,
    open_calls: u32,
    close_calls: u32,
}

#[derive(Debug)]
struct Shared {
    script: Mutex<Script>,
    notify: Notify,
}

impl Shared {
    fn new() -> Self {
        Self {
            script: Mutex::new(Script {
                queue: VecDeque::new(),
                open: false,
                open_failures: OpenFailures::None,
                open_calls: 0,
                close_calls: 0,
            }),
            notify: Notify::new(),
        }
    }

    fn script(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn enqueue(&self, item: Result<RawChangePayload, ChannelError>) {
        self.script().queue.push_back(item);
        self.notify.notify_one();
    }
}

/// Notification channel fed by a [`MemoryChannelController`].
///
/// Queued payloads survive `close()`/`open()` cycles, so anything pushed while
/// a watcher is reconnecting is delivered once it is active again.
#[derive(Debug)]
pub struct MemoryChannel {
    shared: Arc<Shared>,
}

impl MemoryChannel {
    /// Creates a channel and the controller that scripts it.
    #[must_use]
    pub fn new() -> (Self, MemoryChannelController) {
        let shared = Arc::new(Shared::new());
        (
            Self {
                shared: Arc::clone(&shared),
            },
            MemoryChannelController { shared },
        )
    }
}

#[async_trait]
impl NotificationChannel for MemoryChannel {
    async fn open(&mut self, _source: &SourceDescriptor) -> Result<(), ChannelError> {
        let mut script = self.shared.script();
        script.open_calls += 1;

        match script.open_failures {
            OpenFailures::Always => {
                return Err(ChannelError::unavailable_msg("scripted open failure"));
            }
            OpenFailures::Next(remaining) if remaining > 0 => {
                script.open_failures = if remaining == 1 {
                    OpenFailures::None
                } else {
                    OpenFailures::Next(remaining - 1)
                };
                return Err(ChannelError::unavailable_msg("scripted open failure"));
            }
            _ => {}
        }

        script.open = true;
        Ok(())
    }

    async fn next(&mut self) -> Result<RawChangePayload, ChannelError> {
        loop {
            // Register interest before checking the queue so a push that lands
            // in between is not lost.
            let notified = self.shared.notify.notified();
            {
                let mut script = self.shared.script();
                if !script.open {
                    return Err(ChannelError::Closed);
                }
                if let Some(item) = script.queue.pop_front() {
                    if item.is_err() {
                        script.open = false;
                    }
                    return item;
                }
            }
            notified.await;
        }
    }

    async fn close(&mut self) {
        let mut script = self.shared.script();
        if script.open {
            script.open = false;
            script.close_calls += 1;
        }
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

/// Scripts a [`MemoryChannel`]: pushes payloads, injects failures, and
/// reports how the channel was driven.
#[derive(Debug, Clone)]
pub struct MemoryChannelController {
    shared: Arc<Shared>,
}

impl MemoryChannelController {
    /// Queues one payload.
    pub fn push(&self, payload: RawChangePayload) {
        self.shared.enqueue(Ok(payload));
    }

    /// Queues several payloads in order.
    pub fn push_all(&self, payloads: impl IntoIterator<Item = RawChangePayload>) {
        {
            let mut script = self.shared.script();
            script.queue.extend(payloads.into_iter().map(Ok));
        }
        self.shared.notify.notify_one();
    }

    /// Queues a mid-stream failure after the payloads already queued.
    pub fn fail(&self, message: impl Into<String>) {
        self.shared.enqueue(Err(ChannelError::failed_msg(message)));
    }

    /// Queues an unexpected remote close after the payloads already queued.
    pub fn close_remote(&self) {
        self.shared.enqueue(Err(ChannelError::Closed));
    }

    /// Makes the next `count` calls to `open()` fail.
    pub fn fail_next_opens(&self, count: u32) {
        self.shared.script().open_failures = if count == 0 {
            OpenFailures::None
        } else {
            OpenFailures::Next(count)
        };
    }

    /// Makes every call to `open()` fail until [`heal`](Self::heal) is called.
    pub fn fail_all_opens(&self) {
        self.shared.script().open_failures = OpenFailures::Always;
    }

    /// Clears any scripted open failures.
    pub fn heal(&self) {
        self.shared.script().open_failures = OpenFailures::None;
    }

    /// Number of `open()` calls so far, failed ones included.
    #[must_use]
    pub fn open_calls(&self) -> u32 {
        self.shared.script().open_calls
    }

    /// Number of `close()` calls that actually released an open channel.
    #[must_use]
    pub fn close_calls(&self) -> u32 {
        self.shared.script().close_calls
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.shared.script().open
    }

    /// Number of queued items not yet consumed.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.shared.script().queue.len()
    }
}

/// [`ChannelFactory`] handing out memory channels keyed by source id.
///
/// The controller for a source can be fetched (and scripted) before the source
/// is registered; channels created later for the same source id share it.
#[derive(Debug, Default)]
pub struct MemoryChannelFactory {
    controllers: Mutex<HashMap<String, MemoryChannelController>>,
}

impl MemoryChannelFactory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the controller for `source_id`, creating it if needed.
    pub fn controller(&self, source_id: &str) -> MemoryChannelController {
        self.controllers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(source_id.to_string())
            .or_insert_with(|| MemoryChannelController {
                shared: Arc::new(Shared::new()),
            })
            .clone()
    }
}

impl ChannelFactory for MemoryChannelFactory {
    fn create(
        &self,
        source: &SourceDescriptor,
    ) -> Result<Box<dyn NotificationChannel>, ChannelError> {
        let controller = self.controller(&source.source_id);
        Ok(Box::new(MemoryChannel {
            shared: controller.shared,
        }))
    }
}
