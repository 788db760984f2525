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

//! SQLite polling-diff notification channel.
//!
//! SQLite has no server-side change notification, so this channel polls: it
//! opens the database read-only, takes a baseline snapshot of the tracked
//! table, and on every poll diffs the table against the previous snapshot.
//! Each changed row becomes one payload:
//!
//! 1. inserted and updated rows, in primary-key order
//! 2. deleted rows, carrying the full row as it was before deletion
//!
//! Several writes to the same row between two polls coalesce into one net
//! change, and a row inserted and deleted between polls is never seen.
//!
//! The previous snapshot is kept across `close()`/`open()`, so changes made
//! while the watcher was reconnecting surface as net changes on the first poll
//! after the channel is reopened.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use tabletrack_channels::sqlite::{SqliteChannelConfig, SqliteChannelFactory};
//! use tabletrack_core::{EventSink, SourceDescriptor, TrackerConfig, TrackerRegistry};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = SqliteChannelConfig::builder()
//!     .poll_interval(Duration::from_millis(250))
//!     .build()?;
//! let registry = TrackerRegistry::new(
//!     TrackerConfig::default(),
//!     Arc::new(SqliteChannelFactory::new(config)),
//! );
//!
//! registry
//!     .register(SourceDescriptor::new("DB1", "first.db", "Students"), EventSink::new())
//!     .await?;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use base64::Engine;
use chrono::Utc;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags};
use serde_json::{Map, Number, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tabletrack_core::channel::{ChannelError, ChannelFactory, NotificationChannel, RawChangePayload};
use tabletrack_core::config::ConfigError;
use tabletrack_core::source::SourceDescriptor;
use tokio::time::Instant;
use tracing::{debug, info};

/// Longest accepted table or column name.
const MAX_IDENTIFIER_LEN: usize = 128;

/// Configuration for [`SqliteChannel`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqliteChannelConfig {
    /// Time between two table diffs
    pub poll_interval: Duration,

    /// How long a poll waits for a writer's lock before failing
    pub busy_timeout: Duration,
}

impl Default for SqliteChannelConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            busy_timeout: Duration::from_secs(5),
        }
    }
}

impl SqliteChannelConfig {
    #[must_use]
    pub fn builder() -> SqliteChannelConfigBuilder {
        SqliteChannelConfigBuilder::default()
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if `poll_interval` is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval.is_zero() {
            return Err(ConfigError("poll_interval must be greater than 0".to_string()));
        }
        Ok(())
    }
}

/// Builder for [`SqliteChannelConfig`].
#[derive(Debug, Default)]
pub struct SqliteChannelConfigBuilder {
    poll_interval: Option<Duration>,
    busy_timeout: Option<Duration>,
}

impl SqliteChannelConfigBuilder {
    /// Default: 500ms
    #[must_use]
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = Some(interval);
        self
    }

    /// Default: 5 seconds
    #[must_use]
    pub fn busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = Some(timeout);
        self
    }

    /// Builds the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if validation fails.
    pub fn build(self) -> Result<SqliteChannelConfig, ConfigError> {
        let defaults = SqliteChannelConfig::default();
        let config = SqliteChannelConfig {
            poll_interval: self.poll_interval.unwrap_or(defaults.poll_interval),
            busy_timeout: self.busy_timeout.unwrap_or(defaults.busy_timeout),
        };
        config.validate()?;
        Ok(config)
    }
}

/// Validates a table or column name before it is spliced into SQL.
///
/// Accepts ASCII letters, digits and underscores, not starting with a digit.
///
/// # Errors
///
/// Returns [`ChannelError::Unavailable`] for anything else.
pub fn validate_identifier(name: &str) -> Result<(), ChannelError> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    let valid_rest = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');

    if !valid_start || !valid_rest || name.len() > MAX_IDENTIFIER_LEN {
        return Err(ChannelError::unavailable_msg(format!(
            "invalid SQLite identifier '{name}'"
        )));
    }
    Ok(())
}

/// Converts one SQLite value to JSON.
///
/// BLOBs become `{"_type": "blob", "data": "<base64>"}` so they stay
/// distinguishable from text; non-finite reals become strings.
pub fn sqlite_value_to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Number(i.into()),
        ValueRef::Real(f) => Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or_else(|| Value::String(f.to_string())),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => serde_json::json!({
            "_type": "blob",
            "data": base64::engine::general_purpose::STANDARD.encode(bytes),
        }),
    }
}

/// Strips an optional `sqlite://` scheme from a connection target.
fn database_path(connection_target: &str) -> &str {
    connection_target
        .strip_prefix("sqlite://")
        .unwrap_or(connection_target)
}

/// Rows of the tracked table, in key order, indexed by rendered key.
#[derive(Debug, Default, Clone)]
struct TableSnapshot {
    rows: Vec<(Value, Map<String, Value>)>,
    index: HashMap<String, usize>,
}

impl TableSnapshot {
    fn push(&mut self, key: Value, row: Map<String, Value>) {
        self.index.insert(key.to_string(), self.rows.len());
        self.rows.push((key, row));
    }

    fn get(&self, key: &Value) -> Option<&Map<String, Value>> {
        self.index
            .get(&key.to_string())
            .map(|&position| &self.rows[position].1)
    }

    fn len(&self) -> usize {
        self.rows.len()
    }
}

/// Net changes from `previous` to `current`: inserts and updates in key
/// order, then deletes with the prior row.
fn diff(previous: &TableSnapshot, current: &TableSnapshot) -> Vec<RawChangePayload> {
    let observed_at = Utc::now();
    let mut changes = Vec::new();

    for (key, row) in &current.rows {
        let kind = match previous.get(key) {
            None => "insert",
            Some(before) if before != row => "update",
            Some(_) => continue,
        };
        changes.push(
            RawChangePayload::new(kind)
                .with_key(key.clone())
                .with_columns(row.clone())
                .observed_at(observed_at),
        );
    }

    for (key, row) in &previous.rows {
        if current.get(key).is_none() {
            changes.push(
                RawChangePayload::new("delete")
                    .with_key(key.clone())
                    .with_columns(row.clone())
                    .observed_at(observed_at),
            );
        }
    }

    changes
}

/// Resolved table layout.
#[derive(Debug, Clone)]
struct TableLayout {
    table: String,
    key_column: String,
}

impl TableLayout {
    /// Picks the descriptor's key column when the table has it, otherwise the
    /// single-column primary key declared on the table.
    fn resolve(conn: &Connection, source: &SourceDescriptor) -> Result<Self, ChannelError> {
        let sql = format!("PRAGMA table_info(\"{}\")", source.table);
        let mut stmt = conn.prepare(&sql).map_err(ChannelError::unavailable)?;
        let columns: Vec<(String, i64)> = stmt
            .query_map([], |row| Ok((row.get::<_, String>(1)?, row.get::<_, i64>(5)?)))
            .map_err(ChannelError::unavailable)?
            .collect::<Result<_, _>>()
            .map_err(ChannelError::unavailable)?;

        if columns.is_empty() {
            return Err(ChannelError::unavailable_msg(format!(
                "table '{}' not found in '{}'",
                source.table, source.connection_target
            )));
        }

        let configured = columns
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(&source.key_column))
            .map(|(name, _)| name.clone());

        let key_column = match configured {
            Some(name) => name,
            None => {
                let primary: Vec<&String> = columns
                    .iter()
                    .filter(|(_, pk)| *pk > 0)
                    .map(|(name, _)| name)
                    .collect();
                match primary.as_slice() {
                    [single] => (*single).clone(),
                    _ => {
                        return Err(ChannelError::unavailable_msg(format!(
                            "table '{}' has no column '{}' and no single-column primary key",
                            source.table, source.key_column
                        )));
                    }
                }
            }
        };
        validate_identifier(&key_column)?;

        Ok(Self {
            table: source.table.clone(),
            key_column,
        })
    }

    fn read(&self, conn: &Connection) -> rusqlite::Result<TableSnapshot> {
        let sql = format!(
            "SELECT * FROM \"{}\" ORDER BY \"{}\"",
            self.table, self.key_column
        );
        let mut stmt = conn.prepare(&sql)?;
        let names: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
        let key_position = names.iter().position(|name| name == &self.key_column);

        let mut snapshot = TableSnapshot::default();
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let mut columns = Map::with_capacity(names.len());
            for (i, name) in names.iter().enumerate() {
                columns.insert(name.clone(), sqlite_value_to_json(row.get_ref(i)?));
            }
            let key = key_position
                .and_then(|i| columns.get(&names[i]).cloned())
                .unwrap_or(Value::Null);
            // Rows without a key cannot be tracked.
            if !key.is_null() {
                snapshot.push(key, columns);
            }
        }
        Ok(snapshot)
    }
}

struct OpenTable {
    conn: Arc<Mutex<Connection>>,
    layout: TableLayout,
}

/// Read-only polling-diff channel over one SQLite table.
pub struct SqliteChannel {
    config: SqliteChannelConfig,
    open: Option<OpenTable>,
    snapshot: Option<TableSnapshot>,
    pending: VecDeque<RawChangePayload>,
    next_poll: Instant,
}

impl std::fmt::Debug for SqliteChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteChannel")
            .field("config", &self.config)
            .field("open", &self.open.is_some())
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

impl SqliteChannel {
    #[must_use]
    pub fn new(config: SqliteChannelConfig) -> Self {
        Self {
            config,
            open: None,
            snapshot: None,
            pending: VecDeque::new(),
            next_poll: Instant::now(),
        }
    }

    /// Reads the table on the blocking pool.
    async fn read_table(&self) -> Result<TableSnapshot, ChannelError> {
        let Some(open) = &self.open else {
            return Err(ChannelError::Closed);
        };
        let conn = Arc::clone(&open.conn);
        let layout = open.layout.clone();

        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap_or_else(PoisonError::into_inner);
            layout.read(&conn)
        })
        .await
        .map_err(ChannelError::failed)?
        .map_err(ChannelError::failed)
    }
}

#[async_trait]
impl NotificationChannel for SqliteChannel {
    async fn open(&mut self, source: &SourceDescriptor) -> Result<(), ChannelError> {
        validate_identifier(&source.table)?;

        let path = database_path(&source.connection_target).to_string();
        let busy_timeout = self.config.busy_timeout;
        let resolve_source = source.clone();

        let (conn, layout) = tokio::task::spawn_blocking(move || {
            let conn = Connection::open_with_flags(
                &path,
                OpenFlags::SQLITE_OPEN_READ_ONLY
                    | OpenFlags::SQLITE_OPEN_NO_MUTEX
                    | OpenFlags::SQLITE_OPEN_URI,
            )
            .map_err(ChannelError::unavailable)?;
            conn.busy_timeout(busy_timeout)
                .map_err(ChannelError::unavailable)?;
            let layout = TableLayout::resolve(&conn, &resolve_source)?;
            Ok::<_, ChannelError>((conn, layout))
        })
        .await
        .map_err(ChannelError::unavailable)??;

        info!(
            path = %source.connection_target,
            table = %layout.table,
            key = %layout.key_column,
            "SQLite channel opened"
        );

        self.open = Some(OpenTable {
            conn: Arc::new(Mutex::new(conn)),
            layout,
        });

        if self.snapshot.is_none() {
            let baseline = self.read_table().await.map_err(|e| match e {
                ChannelError::Failed { message, source } => {
                    ChannelError::Unavailable { message, source }
                }
                other => other,
            })?;
            debug!(rows = baseline.len(), "Baseline snapshot taken");
            self.snapshot = Some(baseline);
        }

        self.next_poll = Instant::now() + self.config.poll_interval;
        Ok(())
    }

    async fn next(&mut self) -> Result<RawChangePayload, ChannelError> {
        loop {
            if self.open.is_none() {
                return Err(ChannelError::Closed);
            }
            if let Some(payload) = self.pending.pop_front() {
                return Ok(payload);
            }

            tokio::time::sleep_until(self.next_poll).await;
            self.next_poll = Instant::now() + self.config.poll_interval;

            let current = self.read_table().await?;
            let changes = match &self.snapshot {
                Some(previous) => diff(previous, &current),
                None => Vec::new(),
            };
            if !changes.is_empty() {
                debug!(changes = changes.len(), "Table changes detected");
            }
            self.snapshot = Some(current);
            self.pending.extend(changes);
        }
    }

    async fn close(&mut self) {
        if self.open.take().is_some() {
            debug!("SQLite channel closed");
        }
    }

    fn backend(&self) -> &'static str {
        "sqlite"
    }
}

/// Creates [`SqliteChannel`]s sharing one configuration.
#[derive(Debug, Clone, Default)]
pub struct SqliteChannelFactory {
    config: SqliteChannelConfig,
}

impl SqliteChannelFactory {
    #[must_use]
    pub fn new(config: SqliteChannelConfig) -> Self {
        Self { config }
    }
}

impl ChannelFactory for SqliteChannelFactory {
    fn create(
        &self,
        source: &SourceDescriptor,
    ) -> Result<Box<dyn NotificationChannel>, ChannelError> {
        validate_identifier(&source.table)?;
        Ok(Box::new(SqliteChannel::new(self.config.clone())))
    }
}
