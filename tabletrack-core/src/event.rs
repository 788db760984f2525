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

//! Change event representation.
//!
//! A [`ChangeEvent`] describes one observed row mutation on a tracked table. It
//! is built by a table watcher after the raw channel payload has been decoded
//! and is immutable from then on: handlers only ever see `&ChangeEvent`.
//!
//! # Examples
//!
//! ```rust
//! use tabletrack_core::event::{ChangeEvent, ChangeKind, EntitySnapshot};
//! use chrono::Utc;
//! use serde_json::json;
//!
//! let snapshot = EntitySnapshot::from_value("id", json!({ "id": 1, "name": "Alice" }))
//!     .expect("object with a key");
//!
//! let event = ChangeEvent::new("DB1", "Students", ChangeKind::Inserted, snapshot, Utc::now(), 1);
//!
//! assert!(event.is_insert());
//! assert_eq!(event.sequence(), 1);
//! assert_eq!(event.snapshot().get("name"), Some(&json!("Alice")));
//! ```

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

/// Kind of row mutation carried by a [`ChangeEvent`].
///
/// Exactly one kind per event; there are no composite kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    /// A row was inserted
    Inserted,

    /// A row was modified in place
    Updated,

    /// A row was removed
    Deleted,
}

impl ChangeKind {
    /// Parses the change label a channel attaches to a raw payload.
    ///
    /// Accepts the verb form (`insert`), the past participle (`inserted`) and
    /// the single-letter trigger convention (`I`), case-insensitively. Document
    /// stores report whole-document replacement as `replace`, which maps to
    /// [`ChangeKind::Updated`].
    #[must_use]
    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "insert" | "inserted" | "i" => Some(Self::Inserted),
            "update" | "updated" | "u" | "replace" | "replaced" => Some(Self::Updated),
            "delete" | "deleted" | "d" => Some(Self::Deleted),
            _ => None,
        }
    }

    /// Returns the kind as a static string for logs and metric labels.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Inserted => "inserted",
            Self::Updated => "updated",
            Self::Deleted => "deleted",
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Row state at the moment a change was observed.
///
/// Holds the primary-key value plus every column the channel supplied. A
/// column the channel did not supply is *absent* ([`EntitySnapshot::get`]
/// returns `None`), which is different from a column holding SQL `NULL`
/// (`Some(&Value::Null)`). Delete notifications from sources that cannot
/// provide the prior row decode to a key-only snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySnapshot {
    key_column: String,
    key: Value,
    columns: BTreeMap<String, Value>,
}

impl EntitySnapshot {
    /// Creates a key-only snapshot.
    pub fn key_only(key_column: impl Into<String>, key: Value) -> Self {
        let key_column = key_column.into();
        let mut columns = BTreeMap::new();
        columns.insert(key_column.clone(), key.clone());
        Self {
            key_column,
            key,
            columns,
        }
    }

    /// Creates a snapshot from a column map.
    ///
    /// The key column is always present in the resulting column set, even if
    /// `columns` did not contain it.
    pub fn new(key_column: impl Into<String>, key: Value, columns: Map<String, Value>) -> Self {
        let mut snapshot = Self::key_only(key_column, key);
        for (name, value) in columns {
            if name != snapshot.key_column {
                snapshot.columns.insert(name, value);
            }
        }
        snapshot
    }

    /// Builds a snapshot from a JSON object, reading the key from `key_column`.
    ///
    /// Returns `None` if `value` is not an object or has no non-null key.
    pub fn from_value(key_column: &str, value: Value) -> Option<Self> {
        let Value::Object(columns) = value else {
            return None;
        };
        let key = columns.get(key_column).filter(|v| !v.is_null())?.clone();
        Some(Self::new(key_column, key, columns))
    }

    /// Name of the primary-key column.
    #[inline]
    pub fn key_column(&self) -> &str {
        &self.key_column
    }

    /// Primary-key value.
    #[inline]
    pub fn key(&self) -> &Value {
        &self.key
    }

    /// Returns a column value, or `None` if the column is absent.
    #[inline]
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.columns.get(column)
    }

    /// Returns true if the column was supplied by the channel.
    #[inline]
    pub fn contains(&self, column: &str) -> bool {
        self.columns.contains_key(column)
    }

    /// Iterates over the present columns in name order.
    pub fn columns(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.columns.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of present columns, key included.
    #[inline]
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// Always false: a snapshot carries at least its key.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Returns true if only the primary key is populated.
    #[inline]
    pub fn is_key_only(&self) -> bool {
        self.columns.len() == 1
    }

    /// Maps the present columns onto a caller-defined entity type.
    ///
    /// Absent columns are not filled in, so a struct that requires a column
    /// the channel did not supply fails to deserialize instead of receiving
    /// invented data.
    ///
    /// # Errors
    ///
    /// Returns the `serde_json` error if the columns do not fit `T`.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use serde::Deserialize;
    /// use serde_json::json;
    /// use tabletrack_core::event::EntitySnapshot;
    ///
    /// #[derive(Deserialize)]
    /// struct Student {
    ///     id: i64,
    ///     name: String,
    /// }
    ///
    /// let snapshot = EntitySnapshot::from_value("id", json!({ "id": 7, "name": "Bob" })).unwrap();
    /// let student: Student = snapshot.to_entity().unwrap();
    /// assert_eq!(student.id, 7);
    /// assert_eq!(student.name, "Bob");
    /// ```
    pub fn to_entity<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        let object: Map<String, Value> = self
            .columns
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        serde_json::from_value(Value::Object(object))
    }
}

/// One observed row mutation on a tracked table.
///
/// Events are created by the table watcher at decode time and never change
/// afterwards. The `sequence` number is assigned per source, starts at 1 and
/// is strictly increasing; it is the ordering key consumers rely on. There is
/// no ordering relation between events of different sources.
///
/// ```rust
/// use tabletrack_core::event::{ChangeEvent, ChangeKind};
///
/// fn describe(event: &ChangeEvent) -> String {
///     match event.kind() {
///         ChangeKind::Inserted => format!("{} #{} new row {}", event.source_id(), event.sequence(), event.key()),
///         ChangeKind::Updated => format!("{} #{} row {} changed", event.source_id(), event.sequence(), event.key()),
///         ChangeKind::Deleted => format!("{} #{} row {} removed", event.source_id(), event.sequence(), event.key()),
///     }
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    #[serde(rename = "source")]
    source_id: String,
    table: String,
    kind: ChangeKind,
    snapshot: EntitySnapshot,
    #[serde(rename = "detectedAt")]
    detected_at: DateTime<Utc>,
    #[serde(rename = "seq")]
    sequence: u64,
}

impl ChangeEvent {
    /// Creates a change event.
    pub fn new(
        source_id: impl Into<String>,
        table: impl Into<String>,
        kind: ChangeKind,
        snapshot: EntitySnapshot,
        detected_at: DateTime<Utc>,
        sequence: u64,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            table: table.into(),
            kind,
            snapshot,
            detected_at,
            sequence,
        }
    }

    /// Identifier of the source that produced this event (e.g. `"DB1"`).
    #[inline]
    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    /// Name of the tracked table.
    #[inline]
    pub fn table(&self) -> &str {
        &self.table
    }

    #[inline]
    pub fn kind(&self) -> ChangeKind {
        self.kind
    }

    #[inline]
    pub fn snapshot(&self) -> &EntitySnapshot {
        &self.snapshot
    }

    /// Primary-key value of the affected row.
    #[inline]
    pub fn key(&self) -> &Value {
        self.snapshot.key()
    }

    /// When the change was observed.
    #[inline]
    pub fn detected_at(&self) -> DateTime<Utc> {
        self.detected_at
    }

    /// Per-source sequence number.
    #[inline]
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    #[inline]
    pub fn is_insert(&self) -> bool {
        self.kind == ChangeKind::Inserted
    }

    #[inline]
    pub fn is_update(&self) -> bool {
        self.kind == ChangeKind::Updated
    }

    #[inline]
    pub fn is_delete(&self) -> bool {
        self.kind == ChangeKind::Deleted
    }

    /// Consumes the event and returns the entity snapshot.
    #[must_use]
    pub fn into_snapshot(self) -> EntitySnapshot {
        self.snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_change_kind_labels() {
        assert_eq!(ChangeKind::from_label("insert"), Some(ChangeKind::Inserted));
        assert_eq!(ChangeKind::from_label("Inserted"), Some(ChangeKind::Inserted));
        assert_eq!(ChangeKind::from_label("U"), Some(ChangeKind::Updated));
        assert_eq!(ChangeKind::from_label("replace"), Some(ChangeKind::Updated));
        assert_eq!(ChangeKind::from_label(" DELETE "), Some(ChangeKind::Deleted));
        assert_eq!(ChangeKind::from_label("truncate"), None);
        assert_eq!(ChangeKind::Deleted.to_string(), "deleted");
    }

    #[test]
    fn test_key_only_snapshot() {
        let snapshot = EntitySnapshot::key_only("id", json!(42));
        assert!(snapshot.is_key_only());
        assert_eq!(snapshot.key(), &json!(42));
        assert_eq!(snapshot.get("id"), Some(&json!(42)));
        assert_eq!(snapshot.get("name"), None);
        assert!(!snapshot.contains("name"));
    }

    #[test]
    fn test_null_column_is_present() {
        let snapshot =
            EntitySnapshot::from_value("id", json!({ "id": 1, "name": null })).unwrap();
        assert!(snapshot.contains("name"));
        assert_eq!(snapshot.get("name"), Some(&Value::Null));
        assert!(!snapshot.is_key_only());
    }

    #[test]
    fn test_from_value_requires_key() {
        assert!(EntitySnapshot::from_value("id", json!({ "name": "x" })).is_none());
        assert!(EntitySnapshot::from_value("id", json!({ "id": null })).is_none());
        assert!(EntitySnapshot::from_value("id", json!([1, 2])).is_none());
    }

    #[test]
    fn test_to_entity_does_not_invent_absent_columns() {
        #[derive(Debug, serde::Deserialize)]
        #[allow(dead_code)]
        struct Student {
            id: i64,
            name: String,
        }

        let full = EntitySnapshot::from_value("id", json!({ "id": 1, "name": "Alice" })).unwrap();
        let student: Student = full.to_entity().unwrap();
        assert_eq!(student.id, 1);
        assert_eq!(student.name, "Alice");

        let key_only = EntitySnapshot::key_only("id", json!(1));
        assert!(key_only.to_entity::<Student>().is_err());
    }

    #[test]
    fn test_event_accessors_and_serialization() {
        let snapshot = EntitySnapshot::from_value("id", json!({ "id": 1, "name": "Alice" })).unwrap();
        let event = ChangeEvent::new("DB1", "Students", ChangeKind::Updated, snapshot, Utc::now(), 2);

        assert_eq!(event.source_id(), "DB1");
        assert_eq!(event.table(), "Students");
        assert!(event.is_update());
        assert!(!event.is_insert());
        assert_eq!(event.key(), &json!(1));

        let encoded = serde_json::to_value(&event).unwrap();
        assert_eq!(encoded["source"], json!("DB1"));
        assert_eq!(encoded["kind"], json!("updated"));
        assert_eq!(encoded["seq"], json!(2));
    }
}
