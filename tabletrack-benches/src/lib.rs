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

//! Shared fixtures for the tabletrack benchmarks.

use chrono::Utc;
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tabletrack_core::channel::RawChangePayload;
use tabletrack_core::event::{ChangeEvent, ChangeKind, EntitySnapshot};
use tabletrack_core::sink::{ChangeHandler, FnHandler};

/// A `Students` row with `width` columns in total (at least `id` and `name`).
pub fn student_row(id: u64, width: usize) -> Map<String, Value> {
    let mut row = Map::new();
    row.insert("id".to_string(), json!(id));
    row.insert("name".to_string(), json!(format!("student_{id}")));
    for column in 2..width {
        row.insert(format!("score_{column}"), json!(id as usize * column));
    }
    row
}

/// `count` insert payloads with sequential keys starting at 1.
pub fn insert_payloads(count: usize, width: usize) -> Vec<RawChangePayload> {
    (1..=count as u64)
        .map(|id| RawChangePayload::insert(student_row(id, width)))
        .collect()
}

/// A decoded insert event, as a watcher would hand it to the sink.
pub fn student_event(sequence: u64, width: usize) -> ChangeEvent {
    let row = student_row(sequence, width);
    ChangeEvent::new(
        "DB1",
        "Students",
        ChangeKind::Inserted,
        EntitySnapshot::new("id", json!(sequence), row),
        Utc::now(),
        sequence,
    )
}

/// A handler that only counts deliveries.
pub fn counting_handler() -> (Arc<AtomicUsize>, Arc<dyn ChangeHandler>) {
    let count = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&count);
    let handler = FnHandler::new(move |_event: &ChangeEvent| {
        counter.fetch_add(1, Ordering::Relaxed);
        Ok(())
    });
    (count, Arc::new(handler))
}
