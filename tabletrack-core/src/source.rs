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

//! Source descriptors and watcher identifiers.

use serde::{Deserialize, Serialize};
use std::fmt;

fn default_key_column() -> String {
    "id".to_string()
}

/// Describes one tracked (connection, table) pair.
///
/// Supplied once by the caller when a watcher is registered and immutable for
/// the watcher's lifetime. Two descriptors conflict when they share the same
/// connection target and table, regardless of their source identifiers.
///
/// Descriptors are `serde`-compatible so hosts can keep source lists in their
/// own configuration files:
///
/// ```rust
/// use tabletrack_core::source::SourceDescriptor;
///
/// let json = r#"{ "source_id": "DB1", "connection_target": "first.db", "table": "Students" }"#;
/// let source: SourceDescriptor = serde_json::from_str(json).unwrap();
/// assert_eq!(source.key_column, "id");
/// assert!(source.tracked_columns.is_none());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceDescriptor {
    /// Human-readable source identifier, e.g. `"DB1"`
    pub source_id: String,

    /// Backend-specific connection target (file path, URI, ...)
    pub connection_target: String,

    /// Tracked table name
    pub table: String,

    /// Primary-key column, matched case-insensitively
    #[serde(default = "default_key_column")]
    pub key_column: String,

    /// Columns to keep in entity snapshots (all columns when `None`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracked_columns: Option<Vec<String>>,
}

impl SourceDescriptor {
    /// Creates a descriptor with the default `id` key column.
    pub fn new(
        source_id: impl Into<String>,
        connection_target: impl Into<String>,
        table: impl Into<String>,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            connection_target: connection_target.into(),
            table: table.into(),
            key_column: default_key_column(),
            tracked_columns: None,
        }
    }

    /// Sets the primary-key column.
    #[must_use]
    pub fn with_key_column(mut self, column: impl Into<String>) -> Self {
        self.key_column = column.into();
        self
    }

    /// Restricts snapshots to the given columns (the key is always kept).
    #[must_use]
    pub fn with_tracked_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tracked_columns = Some(columns.into_iter().map(Into::into).collect());
        self
    }

    /// Returns true if both descriptors watch the same table on the same connection.
    #[must_use]
    pub fn same_target(&self, other: &Self) -> bool {
        self.connection_target == other.connection_target && self.table == other.table
    }
}

impl fmt::Display for SourceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}:{})", self.source_id, self.connection_target, self.table)
    }
}

/// Registry-assigned identifier of a table watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WatcherId(pub u64);

impl fmt::Display for WatcherId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "watcher-{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_target_ignores_source_id() {
        let a = SourceDescriptor::new("DB1", "first.db", "Students");
        let b = SourceDescriptor::new("Other", "first.db", "Students");
        let c = SourceDescriptor::new("DB1", "second.db", "Students");

        assert!(a.same_target(&b));
        assert!(!a.same_target(&c));
    }

    #[test]
    fn test_builder_methods() {
        let source = SourceDescriptor::new("DB1", "first.db", "Students")
            .with_key_column("StudentId")
            .with_tracked_columns(["Name"]);

        assert_eq!(source.key_column, "StudentId");
        assert_eq!(source.tracked_columns, Some(vec!["Name".to_string()]));
        assert_eq!(source.to_string(), "DB1 (first.db:Students)");
        assert_eq!(WatcherId(3).to_string(), "watcher-3");
    }
}
