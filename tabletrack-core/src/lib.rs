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

//! Tabletrack Core - multi-source table change tracking
//!
//! This crate watches tables across independent database connections for
//! row-level inserts, updates and deletes, and delivers them as ordered,
//! typed [`ChangeEvent`]s to registered handlers.
//!
//! # Key Components
//!
//! - **Channel**: [`channel::NotificationChannel`] abstracts one table's live
//!   change subscription; concrete backends live in `tabletrack-channels`
//! - **Codec**: [`codec::RowCodec`] turns raw payloads into entity snapshots
//! - **Watcher**: [`watcher::TableWatcher`] supervises one channel, assigns
//!   per-source sequence numbers and reconnects with exponential backoff
//! - **Registry**: [`registry::TrackerRegistry`] owns every watcher
//! - **Sink**: [`sink::EventSink`] runs change and fault handlers in order
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use serde_json::json;
//! use tabletrack_core::channel::RawChangePayload;
//! use tabletrack_core::memory::MemoryChannelFactory;
//! use tabletrack_core::sink::{CollectingHandler, EventSink};
//! use tabletrack_core::{SourceDescriptor, TrackerConfig, TrackerRegistry};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let factory = Arc::new(MemoryChannelFactory::new());
//! let registry = TrackerRegistry::new(TrackerConfig::default(), factory.clone());
//!
//! let events = CollectingHandler::new();
//! let sink = EventSink::builder()
//!     .on_change_arc("collector", Arc::new(events.clone()))
//!     .build();
//! registry
//!     .register(SourceDescriptor::new("DB1", "memory://db1", "Students"), sink)
//!     .await?;
//!
//! factory.controller("DB1").push(
//!     RawChangePayload::new("insert")
//!         .with_column("id", json!(1))
//!         .with_column("name", json!("Alice")),
//! );
//!
//! assert!(events.wait_for(1, std::time::Duration::from_secs(5)).await);
//! assert_eq!(events.events()[0].sequence(), 1);
//!
//! registry.stop_all().await;
//! # Ok(())
//! # }
//! ```

pub mod channel;
pub mod codec;
pub mod config;
pub mod event;
pub mod memory;
pub mod metrics;
pub mod registry;
pub mod sink;
pub mod source;
pub mod watcher;

pub use channel::{ChannelError, ChannelFactory, NotificationChannel, RawChangePayload};
pub use codec::{DecodeError, RowCodec};
pub use config::{ConfigError, DispatchMode, ReconnectPolicy, TrackerConfig};
pub use event::{ChangeEvent, ChangeKind, EntitySnapshot};
pub use registry::{RegistryError, TrackerRegistry, WatcherInfo};
pub use sink::{ChangeHandler, EventSink, Fault, FaultStage, HandlerError};
pub use source::{SourceDescriptor, WatcherId};
pub use watcher::{TableWatcher, WatcherError, WatcherState, WatcherStats};
