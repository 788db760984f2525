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

//! Tracker registry: owns every watcher of the process.
//!
//! The registry creates a [`TableWatcher`] per registered source, starts it,
//! and fans lifecycle control out to the watchers. The watcher map is the
//! only shared mutable structure; it is locked for map mutation only, never
//! around a watcher's receive loop.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use tabletrack_core::config::TrackerConfig;
//! use tabletrack_core::memory::MemoryChannelFactory;
//! use tabletrack_core::registry::TrackerRegistry;
//! use tabletrack_core::sink::{EventSink, FnHandler};
//! use tabletrack_core::source::SourceDescriptor;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = TrackerRegistry::new(TrackerConfig::default(), Arc::new(MemoryChannelFactory::new()));
//! let mut faults = registry.faults();
//!
//! let sink = EventSink::builder()
//!     .on_change("print", FnHandler::new(|event| {
//!         println!("{}: {} #{}", event.source_id(), event.kind(), event.sequence());
//!         Ok(())
//!     }))
//!     .build();
//!
//! let id = registry
//!     .register(SourceDescriptor::new("DB1", "memory://db1", "Students"), sink)
//!     .await?;
//!
//! // ... later, at process shutdown
//! registry.stop_all().await;
//! # let _ = (id, faults.try_recv());
//! # Ok(())
//! # }
//! ```

use crate::channel::{ChannelError, ChannelFactory, NotificationChannel};
use crate::config::TrackerConfig;
use crate::metrics;
use crate::sink::{ChangeHandler, EventSink, Fault};
use crate::source::{SourceDescriptor, WatcherId};
use crate::watcher::{TableWatcher, WatcherError, WatcherState, WatcherStats};
use futures::future::join_all;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tracing::{info, instrument, warn};

/// Registry misuse and setup errors, returned synchronously to the caller.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The (connection target, table) pair is already watched.
    #[error("Table '{table}' on '{connection_target}' is already watched by {existing}")]
    DuplicateSource {
        /// Connection target of the rejected descriptor
        connection_target: String,
        /// Table of the rejected descriptor
        table: String,
        /// Watcher already holding the pair
        existing: WatcherId,
    },

    /// No watcher with this id is registered.
    #[error("Unknown watcher: {0}")]
    UnknownWatcher(WatcherId),

    /// The channel factory could not create a channel for the source.
    #[error("Failed to create channel for source '{source_id}': {cause}")]
    ChannelCreation {
        /// Source identifier
        source_id: String,
        /// Factory error
        #[source]
        cause: ChannelError,
    },

    /// The watcher could not be started.
    #[error(transparent)]
    Watcher(#[from] WatcherError),
}

/// Snapshot of one registered watcher.
#[derive(Debug, Clone, PartialEq)]
pub struct WatcherInfo {
    pub id: WatcherId,
    pub source: SourceDescriptor,
    pub state: WatcherState,
}

/// Owns all watchers and their lifetimes.
pub struct TrackerRegistry {
    config: TrackerConfig,
    factory: Arc<dyn ChannelFactory>,
    watchers: Mutex<HashMap<WatcherId, TableWatcher>>,
    next_id: AtomicU64,
    fault_tx: broadcast::Sender<Fault>,
}

impl fmt::Debug for TrackerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackerRegistry")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl TrackerRegistry {
    /// Creates an empty registry that builds channels with `factory`.
    pub fn new(config: TrackerConfig, factory: Arc<dyn ChannelFactory>) -> Self {
        let (fault_tx, _) = broadcast::channel(config.fault_channel_capacity);

        Self {
            config,
            factory,
            watchers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            fault_tx,
        }
    }

    #[inline]
    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Subscribes to the faults of every watcher, present and future.
    ///
    /// Slow subscribers lose the oldest faults once `fault_channel_capacity`
    /// is exceeded (`RecvError::Lagged`).
    #[must_use]
    pub fn faults(&self) -> broadcast::Receiver<Fault> {
        self.fault_tx.subscribe()
    }

    /// Creates and starts a watcher for `source`, delivering to `sink`.
    ///
    /// # Errors
    ///
    /// - [`RegistryError::DuplicateSource`] if a live watcher already watches
    ///   the same (connection target, table) pair. A `Failed` watcher does not
    ///   count and is replaced.
    /// - [`RegistryError::ChannelCreation`] if the factory rejects the source.
    #[instrument(skip(self, sink), fields(source = %source))]
    pub async fn register(
        &self,
        source: SourceDescriptor,
        sink: EventSink,
    ) -> Result<WatcherId, RegistryError> {
        self.insert(source, sink, None).await
    }

    /// Like [`register`](Self::register), with a caller-supplied channel
    /// instead of one from the factory.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::DuplicateSource`] as for `register`.
    #[instrument(skip(self, channel, sink), fields(source = %source))]
    pub async fn register_with_channel(
        &self,
        source: SourceDescriptor,
        channel: Box<dyn NotificationChannel>,
        sink: EventSink,
    ) -> Result<WatcherId, RegistryError> {
        self.insert(source, sink, Some(channel)).await
    }

    async fn insert(
        &self,
        source: SourceDescriptor,
        sink: EventSink,
        channel: Option<Box<dyn NotificationChannel>>,
    ) -> Result<WatcherId, RegistryError> {
        let mut watchers = self.watchers.lock().await;

        let existing = watchers
            .values()
            .find(|w| w.source().same_target(&source))
            .map(|w| (w.id(), w.state()));

        if let Some((existing, state)) = existing {
            if state != WatcherState::Failed {
                return Err(RegistryError::DuplicateSource {
                    connection_target: source.connection_target,
                    table: source.table,
                    existing,
                });
            }
            if let Some(mut stale) = watchers.remove(&existing) {
                info!(id = %existing, "Replacing failed watcher");
                stale.stop().await;
            }
        }

        let channel = match channel {
            Some(channel) => channel,
            None => self
                .factory
                .create(&source)
                .map_err(|cause| RegistryError::ChannelCreation {
                    source_id: source.source_id.clone(),
                    cause,
                })?,
        };

        let id = WatcherId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut watcher = TableWatcher::new(
            id,
            source,
            channel,
            sink,
            self.config.clone(),
            Some(self.fault_tx.clone()),
        );
        watcher.start()?;

        watchers.insert(id, watcher);
        metrics::set_active_watchers(watchers.len());

        info!(%id, "Source registered");
        Ok(id)
    }

    /// Stops and removes a watcher. Unknown ids are ignored.
    ///
    /// Returns true if a watcher was removed.
    #[instrument(skip(self))]
    pub async fn unregister(&self, id: WatcherId) -> bool {
        let removed = {
            let mut watchers = self.watchers.lock().await;
            let removed = watchers.remove(&id);
            metrics::set_active_watchers(watchers.len());
            removed
        };

        match removed {
            Some(mut watcher) => {
                watcher.stop().await;
                info!("Source unregistered");
                true
            }
            None => false,
        }
    }

    /// Stops every watcher concurrently and empties the registry.
    ///
    /// Returns once each watcher has stopped or hit its shutdown grace period.
    #[instrument(skip(self))]
    pub async fn stop_all(&self) {
        let drained: Vec<TableWatcher> = {
            let mut watchers = self.watchers.lock().await;
            metrics::set_active_watchers(0);
            watchers.drain().map(|(_, w)| w).collect()
        };

        if drained.is_empty() {
            return;
        }

        let count = drained.len();
        join_all(drained.into_iter().map(|mut watcher| async move {
            watcher.stop().await;
            watcher
        }))
        .await;

        info!(watchers = count, "All watchers stopped");
    }

    /// Appends a change handler to a live watcher's sink.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::UnknownWatcher`] for an unregistered id.
    pub async fn subscribe(
        &self,
        id: WatcherId,
        name: impl Into<String>,
        handler: Arc<dyn ChangeHandler>,
    ) -> Result<(), RegistryError> {
        let sink = {
            let watchers = self.watchers.lock().await;
            watchers
                .get(&id)
                .map(|w| w.sink().clone())
                .ok_or(RegistryError::UnknownWatcher(id))?
        };

        sink.subscribe(name, handler).await;
        Ok(())
    }

    /// Current state of a watcher, if registered.
    pub async fn state(&self, id: WatcherId) -> Option<WatcherState> {
        self.watchers.lock().await.get(&id).map(TableWatcher::state)
    }

    /// Counters of a watcher, if registered.
    pub async fn stats(&self, id: WatcherId) -> Option<WatcherStats> {
        let watchers = self.watchers.lock().await;
        match watchers.get(&id) {
            Some(watcher) => Some(watcher.stats().await),
            None => None,
        }
    }

    /// Waits until the watcher reaches a state matching `predicate`.
    ///
    /// Returns the matching state, or `None` if the id is unknown.
    pub async fn wait_for_state(
        &self,
        id: WatcherId,
        predicate: impl FnMut(&WatcherState) -> bool,
    ) -> Option<WatcherState> {
        let mut states = {
            let watchers = self.watchers.lock().await;
            watchers.get(&id)?.subscribe_state()
        };

        let state = match states.wait_for(predicate).await {
            Ok(state) => Some(*state),
            Err(_) => {
                warn!(%id, "Watcher dropped while waiting for state");
                None
            }
        };
        state
    }

    /// Lists registered watchers ordered by id.
    pub async fn watchers(&self) -> Vec<WatcherInfo> {
        let watchers = self.watchers.lock().await;
        let mut infos: Vec<WatcherInfo> = watchers
            .values()
            .map(|w| WatcherInfo {
                id: w.id(),
                source: w.source().clone(),
                state: w.state(),
            })
            .collect();
        infos.sort_by_key(|info| info.id);
        infos
    }

    pub async fn len(&self) -> usize {
        self.watchers.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.watchers.lock().await.is_empty()
    }
}
