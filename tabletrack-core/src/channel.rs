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

//! Notification channel abstraction.
//!
//! A [`NotificationChannel`] is a live change subscription on one table. It is
//! the only part of the tracker that talks to a database: everything above it
//! (decoding, sequencing, dispatch, reconnection) is backend-agnostic, so any
//! source that can produce a live or polled change stream (log-based CDC, a
//! trigger-fed queue, a polling diff) plugs in by implementing this trait.
//!
//! # Contract
//!
//! - [`open`](NotificationChannel::open) establishes the subscription. It must
//!   be safe to call again after [`close`](NotificationChannel::close).
//! - [`next`](NotificationChannel::next) suspends until one payload describing
//!   one row mutation is available, the channel is closed, or the channel
//!   fails. Implementations that receive batches buffer them internally.
//!   `next` must be cancel-safe: the watcher races it against its shutdown
//!   signal and drops the future when stopping.
//! - [`close`](NotificationChannel::close) is idempotent and releases the
//!   subscription.
//!
//! ```text
//!   open() ──► next() ──► next() ──► ... ──► close()
//!     ▲                      │
//!     │   Failed / Closed    │
//!     └──── close() ◄────────┘   (watcher reconnect policy)
//! ```

use crate::source::SourceDescriptor;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Errors surfaced by a notification channel.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The subscription could not be established (retryable).
    #[error("Channel unavailable: {message}")]
    Unavailable {
        /// Human-readable error message
        message: String,
        /// The underlying error
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The channel is closed; no further payloads will arrive.
    #[error("Channel closed")]
    Closed,

    /// The live channel failed mid-stream (connection drop, permission
    /// revocation, invalidated notification object).
    #[error("Channel error: {message}")]
    Failed {
        /// Human-readable error message
        message: String,
        /// The underlying error
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl ChannelError {
    /// Creates an `Unavailable` error from any error type.
    #[must_use]
    pub fn unavailable(source: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Unavailable {
            message: source.to_string(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates an `Unavailable` error with a custom message.
    #[must_use]
    pub fn unavailable_msg(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a `Failed` error from any error type.
    #[must_use]
    pub fn failed(source: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Failed {
            message: source.to_string(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a `Failed` error with a custom message.
    #[must_use]
    pub fn failed_msg(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
            source: None,
        }
    }

    /// Returns true for [`ChannelError::Closed`].
    #[must_use]
    pub const fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }

    /// Returns the error category for metrics/logging.
    #[must_use]
    pub const fn category(&self) -> &'static str {
        match self {
            Self::Unavailable { .. } => "unavailable",
            Self::Closed => "closed",
            Self::Failed { .. } => "failed",
        }
    }
}

/// Low-level change signal for one row mutation, as produced by a channel.
///
/// The payload is deliberately loose: the change label is free text and the
/// column set may be missing or partial. The row codec turns it into a typed
/// snapshot and rejects what it cannot interpret.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawChangePayload {
    /// Change label (`insert`, `update`, `delete`, `I`, `U`, `D`, ...)
    pub kind: String,

    /// Primary-key value, when the channel reports it separately from the columns
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<Value>,

    /// Column values of the affected row (`None` when the source supplied none)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub columns: Option<Map<String, Value>>,

    /// When the source observed the change, if known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_at: Option<DateTime<Utc>>,
}

impl RawChangePayload {
    /// Creates a payload with the given change label and no row data.
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            ..Self::default()
        }
    }

    /// Insert payload carrying the full new row.
    #[must_use]
    pub fn insert(columns: Map<String, Value>) -> Self {
        Self::new("insert").with_columns(columns)
    }

    /// Update payload carrying the full new row.
    #[must_use]
    pub fn update(columns: Map<String, Value>) -> Self {
        Self::new("update").with_columns(columns)
    }

    /// Delete payload carrying only the key of the removed row.
    #[must_use]
    pub fn delete_key(key: Value) -> Self {
        Self::new("delete").with_key(key)
    }

    #[must_use]
    pub fn with_key(mut self, key: Value) -> Self {
        self.key = Some(key);
        self
    }

    #[must_use]
    pub fn with_columns(mut self, columns: Map<String, Value>) -> Self {
        self.columns = Some(columns);
        self
    }

    /// Adds a single column value.
    #[must_use]
    pub fn with_column(mut self, name: impl Into<String>, value: Value) -> Self {
        self.columns
            .get_or_insert_with(Map::new)
            .insert(name.into(), value);
        self
    }

    #[must_use]
    pub fn observed_at(mut self, at: DateTime<Utc>) -> Self {
        self.observed_at = Some(at);
        self
    }
}

/// Live change subscription on a single table.
///
/// See the [module documentation](self) for the contract. Implementations are
/// owned by exactly one watcher task, so they only need to be `Send`.
#[async_trait]
pub trait NotificationChannel: Send {
    /// Establishes the subscription against the source's table.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Unavailable`] if the subscription cannot be
    /// established.
    async fn open(&mut self, source: &SourceDescriptor) -> Result<(), ChannelError>;

    /// Waits for the next raw change payload.
    ///
    /// # Errors
    ///
    /// - [`ChannelError::Closed`] when the channel was closed or never opened
    /// - [`ChannelError::Failed`] when the underlying subscription broke
    async fn next(&mut self) -> Result<RawChangePayload, ChannelError>;

    /// Releases the subscription. Idempotent.
    async fn close(&mut self);

    /// Short backend name used in logs.
    fn backend(&self) -> &'static str {
        "custom"
    }
}

/// Creates notification channels for sources handed to the registry.
pub trait ChannelFactory: Send + Sync {
    /// Creates an unopened channel for `source`.
    ///
    /// # Errors
    ///
    /// Returns a [`ChannelError`] if the descriptor cannot be served by this
    /// backend (e.g. a malformed connection target).
    fn create(&self, source: &SourceDescriptor)
        -> Result<Box<dyn NotificationChannel>, ChannelError>;
}
