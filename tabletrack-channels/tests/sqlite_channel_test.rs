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

//! Integration tests for the SQLite polling channel against real database files.

use rusqlite::Connection;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tabletrack_channels::sqlite::{SqliteChannel, SqliteChannelConfig, SqliteChannelFactory};
use tabletrack_core::channel::{ChannelError, NotificationChannel, RawChangePayload};
use tabletrack_core::sink::{CollectingHandler, EventSink};
use tabletrack_core::{ChangeKind, SourceDescriptor, TrackerConfig, TrackerRegistry, WatcherState};
use tempfile::TempDir;

const TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize, PartialEq)]
struct Student {
    id: i64,
    name: String,
    grade: i64,
}

fn fast_config() -> SqliteChannelConfig {
    SqliteChannelConfig::builder()
        .poll_interval(Duration::from_millis(20))
        .build()
        .unwrap()
}

fn create_database(dir: &TempDir, file: &str) -> PathBuf {
    let path = dir.path().join(file);
    let conn = Connection::open(&path).unwrap();
    conn.execute_batch(
        "CREATE TABLE Students (
            id    INTEGER PRIMARY KEY,
            name  TEXT NOT NULL,
            grade INTEGER NOT NULL
        );",
    )
    .unwrap();
    path
}

fn execute(path: &Path, sql: &str) {
    let conn = Connection::open(path).unwrap();
    conn.execute_batch(sql).unwrap();
}

fn source(id: &str, path: &Path) -> SourceDescriptor {
    SourceDescriptor::new(id, path.to_string_lossy(), "Students")
}

async fn next_change(channel: &mut SqliteChannel) -> RawChangePayload {
    tokio::time::timeout(TIMEOUT, channel.next())
        .await
        .expect("no change within timeout")
        .expect("channel failed")
}

#[tokio::test]
async fn test_channel_reports_insert_update_delete() {
    let dir = TempDir::new().unwrap();
    let path = create_database(&dir, "first.db");
    let mut channel = SqliteChannel::new(fast_config());
    channel.open(&source("DB1", &path)).await.unwrap();

    execute(&path, "INSERT INTO Students (id, name, grade) VALUES (1, 'Alice', 90);");
    let insert = next_change(&mut channel).await;
    assert_eq!(insert.kind, "insert");
    assert_eq!(insert.key, Some(serde_json::json!(1)));
    let columns = insert.columns.unwrap();
    assert_eq!(columns["name"], "Alice");
    assert_eq!(columns["grade"], 90);

    execute(&path, "UPDATE Students SET grade = 95 WHERE id = 1;");
    let update = next_change(&mut channel).await;
    assert_eq!(update.kind, "update");
    assert_eq!(update.columns.unwrap()["grade"], 95);

    execute(&path, "DELETE FROM Students WHERE id = 1;");
    let delete = next_change(&mut channel).await;
    assert_eq!(delete.kind, "delete");
    assert_eq!(delete.key, Some(serde_json::json!(1)));
    // Deletes carry the row as it was before deletion.
    assert_eq!(delete.columns.unwrap()["name"], "Alice");

    channel.close().await;
    assert!(matches!(channel.next().await, Err(ChannelError::Closed)));
}

#[tokio::test]
async fn test_existing_rows_are_baseline() {
    let dir = TempDir::new().unwrap();
    let path = create_database(&dir, "first.db");
    execute(&path, "INSERT INTO Students (id, name, grade) VALUES (1, 'Alice', 90);");

    let mut channel = SqliteChannel::new(fast_config());
    channel.open(&source("DB1", &path)).await.unwrap();

    execute(&path, "INSERT INTO Students (id, name, grade) VALUES (2, 'Bob', 80);");
    let change = next_change(&mut channel).await;
    assert_eq!(change.kind, "insert");
    assert_eq!(change.key, Some(serde_json::json!(2)));
}

#[tokio::test]
async fn test_changes_while_closed_surface_as_net_changes() {
    let dir = TempDir::new().unwrap();
    let path = create_database(&dir, "first.db");
    let descriptor = source("DB1", &path);

    let mut channel = SqliteChannel::new(fast_config());
    channel.open(&descriptor).await.unwrap();
    channel.close().await;

    execute(
        &path,
        "INSERT INTO Students (id, name, grade) VALUES (1, 'Alice', 90);
         UPDATE Students SET grade = 99 WHERE id = 1;
         INSERT INTO Students (id, name, grade) VALUES (2, 'Bob', 80);
         DELETE FROM Students WHERE id = 2;",
    );

    channel.open(&descriptor).await.unwrap();
    let change = next_change(&mut channel).await;
    assert_eq!(change.kind, "insert");
    assert_eq!(change.columns.unwrap()["grade"], 99);

    let nothing_else = tokio::time::timeout(Duration::from_millis(200), channel.next()).await;
    assert!(nothing_else.is_err(), "row 2 was inserted and deleted while closed");
}

#[tokio::test]
async fn test_open_missing_database_or_table_is_unavailable() {
    let dir = TempDir::new().unwrap();

    let mut channel = SqliteChannel::new(fast_config());
    let missing_file = source("DB1", &dir.path().join("missing.db"));
    let error = channel.open(&missing_file).await.unwrap_err();
    assert!(matches!(error, ChannelError::Unavailable { .. }));

    let path = create_database(&dir, "first.db");
    let missing_table = SourceDescriptor::new("DB1", path.to_string_lossy(), "Teachers");
    let error = channel.open(&missing_table).await.unwrap_err();
    assert!(matches!(error, ChannelError::Unavailable { .. }));
    assert!(error.to_string().contains("Teachers"));
}

#[tokio::test]
async fn test_factory_rejects_invalid_table_names() {
    use tabletrack_core::channel::ChannelFactory;

    let factory = SqliteChannelFactory::new(fast_config());
    let bad = SourceDescriptor::new("DB1", "first.db", "Students; DROP TABLE Students");
    assert!(factory.create(&bad).is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_two_databases_tracked_independently() {
    let dir = TempDir::new().unwrap();
    let first = create_database(&dir, "first.db");
    let second = create_database(&dir, "second.db");

    let registry = TrackerRegistry::new(
        TrackerConfig::default(),
        Arc::new(SqliteChannelFactory::new(fast_config())),
    );

    let db1_events = CollectingHandler::new();
    let db2_events = CollectingHandler::new();
    let db1 = registry
        .register(
            source("DB1", &first),
            EventSink::builder()
                .on_change_arc("db1", Arc::new(db1_events.clone()))
                .build(),
        )
        .await
        .unwrap();
    let db2 = registry
        .register(
            source("DB2", &second),
            EventSink::builder()
                .on_change_arc("db2", Arc::new(db2_events.clone()))
                .build(),
        )
        .await
        .unwrap();

    for id in [db1, db2] {
        let state = tokio::time::timeout(
            TIMEOUT,
            registry.wait_for_state(id, |state| *state == WatcherState::Active),
        )
        .await
        .unwrap();
        assert_eq!(state, Some(WatcherState::Active));
    }

    execute(&first, "INSERT INTO Students (id, name, grade) VALUES (1, 'Alice', 90);");
    execute(&second, "INSERT INTO Students (id, name, grade) VALUES (1, 'Bruno', 70);");
    assert!(db1_events.wait_for(1, TIMEOUT).await);
    assert!(db2_events.wait_for(1, TIMEOUT).await);

    execute(&first, "UPDATE Students SET grade = 91 WHERE id = 1;");
    assert!(db1_events.wait_for(2, TIMEOUT).await);

    let first_events = db1_events.events();
    assert!(first_events.iter().all(|e| e.source_id() == "DB1"));
    assert_eq!(first_events[0].kind(), ChangeKind::Inserted);
    assert_eq!(first_events[1].kind(), ChangeKind::Updated);
    assert_eq!(
        first_events.iter().map(|e| e.sequence()).collect::<Vec<_>>(),
        vec![1, 2]
    );
    let student: Student = first_events[1].snapshot().to_entity().unwrap();
    assert_eq!(
        student,
        Student {
            id: 1,
            name: "Alice".to_string(),
            grade: 91
        }
    );

    let second_events = db2_events.events();
    assert_eq!(second_events.len(), 1);
    assert_eq!(second_events[0].source_id(), "DB2");
    assert_eq!(second_events[0].sequence(), 1);

    registry.stop_all().await;
    assert!(registry.is_empty().await);
    assert_eq!(registry.state(db1).await, None);
}
