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

//! Notification channel backends for tabletrack.
//!
//! Each backend implements [`tabletrack_core::channel::NotificationChannel`]
//! together with a [`tabletrack_core::channel::ChannelFactory`] that the
//! registry uses to create one channel per registered source.
//!
//! | Backend | Feature | Mechanism |
//! |---------|---------|-----------|
//! | [`sqlite::SqliteChannel`] | `sqlite` (default) | Polls the table and diffs snapshots by primary key |
//! | [`mongo::MongoChannel`] | `mongodb` | Server-side change streams with resume tokens |
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tabletrack_channels::sqlite::{SqliteChannelConfig, SqliteChannelFactory};
//! use tabletrack_core::sink::EventSink;
//! use tabletrack_core::{SourceDescriptor, TrackerConfig, TrackerRegistry};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let factory = Arc::new(SqliteChannelFactory::new(SqliteChannelConfig::default()));
//! let registry = TrackerRegistry::new(TrackerConfig::default(), factory);
//!
//! registry
//!     .register(SourceDescriptor::new("DB1", "first.db", "Students"), EventSink::new())
//!     .await?;
//! # Ok(())
//! # }
//! ```

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "mongodb")]
pub mod mongo;
