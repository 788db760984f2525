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

//! Row codec: raw channel payloads to typed snapshots.
//!
//! Decoding is pure and stateless. The codec resolves the change kind from the
//! payload label, locates the primary key (an explicit key wins, otherwise the
//! key column is looked up case-insensitively among the columns), and projects
//! the column set onto the tracked columns of the source.
//!
//! Partial column sets are normal: a delete notification that only carries the
//! key decodes to a key-only snapshot, and an update that only carries the
//! changed columns decodes to a snapshot holding just those. Missing columns
//! are never filled with defaults.

use crate::channel::RawChangePayload;
use crate::event::{ChangeKind, EntitySnapshot};
use crate::source::SourceDescriptor;
use serde_json::{Map, Value};
use thiserror::Error;

/// Errors produced while decoding a raw payload.
///
/// A decode error drops the single offending event; the watcher keeps running.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum DecodeError {
    /// The change label is not one of the known kinds.
    #[error("Unknown change kind: '{0}'")]
    UnknownChangeKind(String),

    /// Neither the payload key nor the columns hold a non-null key value.
    #[error("Missing primary key value for column '{column}'")]
    MissingPrimaryKey {
        /// Expected key column
        column: String,
    },

    /// The primary key is an object or array.
    #[error("Primary key column '{column}' holds a non-scalar value")]
    InvalidKey {
        /// Key column
        column: String,
    },

    /// The column set cannot describe the change.
    #[error("Invalid columns: {0}")]
    InvalidColumns(String),
}

impl DecodeError {
    /// Returns the error category for metrics/logging.
    #[must_use]
    pub const fn category(&self) -> &'static str {
        match self {
            Self::UnknownChangeKind(_) => "unknown_kind",
            Self::MissingPrimaryKey { .. } => "missing_key",
            Self::InvalidKey { .. } => "invalid_key",
            Self::InvalidColumns(_) => "invalid_columns",
        }
    }
}

/// Stateless decoder for one source's payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowCodec {
    key_column: String,
    tracked_columns: Option<Vec<String>>,
}

impl RowCodec {
    /// Creates a codec keyed on `key_column` that keeps every column.
    pub fn new(key_column: impl Into<String>) -> Self {
        Self {
            key_column: key_column.into(),
            tracked_columns: None,
        }
    }

    /// Creates the codec for a source descriptor.
    #[must_use]
    pub fn for_source(source: &SourceDescriptor) -> Self {
        Self {
            key_column: source.key_column.clone(),
            tracked_columns: source.tracked_columns.clone(),
        }
    }

    /// Restricts the snapshot to the given columns (plus the key).
    #[must_use]
    pub fn with_tracked_columns(mut self, columns: Vec<String>) -> Self {
        self.tracked_columns = Some(columns);
        self
    }

    #[inline]
    pub fn key_column(&self) -> &str {
        &self.key_column
    }

    /// Decodes a raw payload into a snapshot and change kind.
    ///
    /// # Errors
    ///
    /// - [`DecodeError::UnknownChangeKind`] for an unrecognized label
    /// - [`DecodeError::MissingPrimaryKey`] when no key value can be found
    /// - [`DecodeError::InvalidKey`] when the key is not a scalar
    /// - [`DecodeError::InvalidColumns`] when an insert carries no columns or the
    ///   explicit key disagrees with the key column
    pub fn decode(
        &self,
        payload: RawChangePayload,
    ) -> Result<(EntitySnapshot, ChangeKind), DecodeError> {
        let kind = ChangeKind::from_label(&payload.kind)
            .ok_or_else(|| DecodeError::UnknownChangeKind(payload.kind.clone()))?;

        let columns = match (kind, payload.columns) {
            (ChangeKind::Inserted, None) => {
                return Err(DecodeError::InvalidColumns(
                    "insert payload carries no columns".to_string(),
                ));
            }
            (_, columns) => columns.unwrap_or_default(),
        };

        let key_name = columns
            .keys()
            .find(|name| name.eq_ignore_ascii_case(&self.key_column))
            .cloned();
        let column_key = key_name
            .as_ref()
            .and_then(|name| columns.get(name))
            .filter(|value| !value.is_null())
            .cloned();

        let key = match (payload.key.filter(|value| !value.is_null()), column_key) {
            (Some(explicit), Some(column)) if explicit != column => {
                return Err(DecodeError::InvalidColumns(format!(
                    "payload key {explicit} does not match column '{}' value {column}",
                    self.key_column
                )));
            }
            (Some(key), _) | (None, Some(key)) => key,
            (None, None) => {
                return Err(DecodeError::MissingPrimaryKey {
                    column: self.key_column.clone(),
                });
            }
        };

        if key.is_object() || key.is_array() {
            return Err(DecodeError::InvalidKey {
                column: self.key_column.clone(),
            });
        }

        let key_name = key_name.unwrap_or_else(|| self.key_column.clone());
        let projected = self.project(columns, &key_name);
        Ok((EntitySnapshot::new(key_name, key, projected), kind))
    }

    fn project(&self, columns: Map<String, Value>, key_name: &str) -> Map<String, Value> {
        let Some(tracked) = &self.tracked_columns else {
            return columns;
        };

        columns
            .into_iter()
            .filter(|(name, _)| {
                name == key_name || tracked.iter().any(|t| t.eq_ignore_ascii_case(name))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn test_decode_insert() {
        let codec = RowCodec::new("id");
        let payload = RawChangePayload::insert(row(json!({ "id": 1, "name": "Alice" })));

        let (snapshot, kind) = codec.decode(payload).unwrap();

        assert_eq!(kind, ChangeKind::Inserted);
        assert_eq!(snapshot.key(), &json!(1));
        assert_eq!(snapshot.get("name"), Some(&json!("Alice")));
    }

    #[test]
    fn test_decode_key_only_delete() {
        let codec = RowCodec::new("id");

        let (snapshot, kind) = codec.decode(RawChangePayload::delete_key(json!(4))).unwrap();

        assert_eq!(kind, ChangeKind::Deleted);
        assert!(snapshot.is_key_only());
        assert_eq!(snapshot.key(), &json!(4));
        assert_eq!(snapshot.get("name"), None);
    }

    #[test]
    fn test_key_column_matched_case_insensitively() {
        let codec = RowCodec::new("id");
        let payload = RawChangePayload::update(row(json!({ "Id": 2, "Name": "Bob" })));

        let (snapshot, _) = codec.decode(payload).unwrap();

        assert_eq!(snapshot.key_column(), "Id");
        assert_eq!(snapshot.key(), &json!(2));
    }

    #[test]
    fn test_null_column_is_present_not_absent() {
        let codec = RowCodec::new("id");
        let payload = RawChangePayload::update(row(json!({ "id": 2, "name": null })));

        let (snapshot, _) = codec.decode(payload).unwrap();

        assert_eq!(snapshot.get("name"), Some(&Value::Null));
    }

    #[test]
    fn test_tracked_columns_projection() {
        let codec = RowCodec::new("id").with_tracked_columns(vec!["NAME".to_string()]);
        let payload =
            RawChangePayload::insert(row(json!({ "id": 1, "name": "Alice", "secret": "x" })));

        let (snapshot, _) = codec.decode(payload).unwrap();

        assert_eq!(snapshot.len(), 2);
        assert!(snapshot.contains("name"));
        assert!(!snapshot.contains("secret"));
    }

    #[test]
    fn test_decode_errors() {
        let codec = RowCodec::new("id");

        let err = codec.decode(RawChangePayload::new("truncate")).unwrap_err();
        assert_eq!(err, DecodeError::UnknownChangeKind("truncate".to_string()));

        let err = codec
            .decode(RawChangePayload::insert(row(json!({ "name": "NoKey" }))))
            .unwrap_err();
        assert_eq!(err.category(), "missing_key");

        let err = codec
            .decode(RawChangePayload::insert(row(json!({ "id": null }))))
            .unwrap_err();
        assert_eq!(err.category(), "missing_key");

        let err = codec.decode(RawChangePayload::new("insert").with_key(json!(1))).unwrap_err();
        assert_eq!(err.category(), "invalid_columns");

        let err = codec
            .decode(RawChangePayload::delete_key(json!({ "nested": 1 })))
            .unwrap_err();
        assert_eq!(err.category(), "invalid_key");

        let err = codec
            .decode(RawChangePayload::update(row(json!({ "id": 1 }))).with_key(json!(2)))
            .unwrap_err();
        assert_eq!(err.category(), "invalid_columns");
    }

    #[test]
    fn test_for_source_uses_descriptor_settings() {
        let source = SourceDescriptor::new("DB1", "db1.sqlite", "Students")
            .with_key_column("StudentId")
            .with_tracked_columns(["Name"]);
        let codec = RowCodec::for_source(&source);

        let payload = RawChangePayload::insert(row(json!({
            "studentid": 9,
            "name": "Eve",
            "age": 20
        })));
        let (snapshot, _) = codec.decode(payload).unwrap();

        assert_eq!(codec.key_column(), "StudentId");
        assert_eq!(snapshot.key(), &json!(9));
        assert!(!snapshot.contains("age"));
    }
}
