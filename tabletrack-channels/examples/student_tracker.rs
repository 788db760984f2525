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

//! Tracks a `Students` table in two independent SQLite databases.
//!
//! Provisions `first.db` (source `DB1`) and `second.db` (source `DB2`),
//! registers one watcher per database, then writes to both concurrently and
//! prints every change as it is delivered.
//!
//! # Running the Example
//!
//! ```bash
//! cargo run -p tabletrack-channels --example student_tracker
//!
//! # Keep watching after the scripted writes, using databases in ./data
//! cargo run -p tabletrack-channels --example student_tracker -- --dir data --watch
//! ```
//!
//! While `--watch` is active, edit either database from another terminal:
//! ```bash
//! sqlite3 data/first.db "INSERT INTO Students (id, name, grade) VALUES (10, 'Zoe', 88);"
//! ```

use async_trait::async_trait;
use clap::Parser;
use rusqlite::Connection;
use serde::Deserialize;
use std::error::Error;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tabletrack_channels::sqlite::{SqliteChannelConfig, SqliteChannelFactory};
use tabletrack_core::sink::{ChangeHandler, CollectingHandler, EventSink, Fault, HandlerError};
use tabletrack_core::{
    ChangeEvent, ReconnectPolicy, SourceDescriptor, TrackerConfig, TrackerRegistry,
    WatcherState,
};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "student_tracker")]
#[command(about = "Watch a Students table in two SQLite databases", long_about = None)]
struct Cli {
    /// Directory for first.db and second.db (a temporary directory when omitted)
    #[arg(short, long)]
    dir: Option<PathBuf>,

    /// Poll interval in milliseconds
    #[arg(short, long, default_value_t = 250, env = "TABLETRACK_POLL_MS")]
    poll_ms: u64,

    /// Skip the scripted writes
    #[arg(long)]
    no_writes: bool,

    /// Keep watching until Ctrl+C
    #[arg(short, long)]
    watch: bool,
}

#[derive(Debug, Deserialize)]
struct Student {
    id: i64,
    name: String,
    grade: i64,
}

/// Prints every change to the log.
struct ConsoleHandler;

#[async_trait]
impl ChangeHandler for ConsoleHandler {
    async fn handle(&self, event: &ChangeEvent) -> Result<(), HandlerError> {
        let student = if event.snapshot().is_key_only() {
            None
        } else {
            Some(event.snapshot().to_entity::<Student>().map_err(HandlerError::new)?)
        };

        match student {
            Some(student) => info!(
                source = event.source_id(),
                seq = event.sequence(),
                at = %event.detected_at().format("%H:%M:%S%.3f"),
                kind = %event.kind(),
                id = student.id,
                name = %student.name,
                grade = student.grade,
                "Student changed"
            ),
            None => info!(
                source = event.source_id(),
                seq = event.sequence(),
                at = %event.detected_at().format("%H:%M:%S%.3f"),
                kind = %event.kind(),
                key = %event.key(),
                "Student changed"
            ),
        }
        Ok(())
    }
}

fn provision(path: &Path) -> rusqlite::Result<()> {
    let conn = Connection::open(path)?;
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS Students (
            id    INTEGER PRIMARY KEY,
            name  TEXT NOT NULL,
            grade INTEGER NOT NULL
        );",
    )
}

fn write(path: PathBuf, sql: &'static str) -> tokio::task::JoinHandle<rusqlite::Result<()>> {
    tokio::task::spawn_blocking(move || Connection::open(path)?.execute_batch(sql))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    init_logging();
    let cli = Cli::parse();

    let temp = tempfile::TempDir::new()?;
    let dir = cli.dir.clone().unwrap_or_else(|| temp.path().to_path_buf());
    std::fs::create_dir_all(&dir)?;

    let first = dir.join("first.db");
    let second = dir.join("second.db");
    provision(&first)?;
    provision(&second)?;
    info!(dir = %dir.display(), "Databases provisioned");

    let channel_config = SqliteChannelConfig::builder()
        .poll_interval(Duration::from_millis(cli.poll_ms))
        .build()?;
    let tracker_config = TrackerConfig::builder()
        .reconnect(ReconnectPolicy::builder().max_attempts(0).build()?)
        .build()?;
    let registry = TrackerRegistry::new(
        tracker_config,
        Arc::new(SqliteChannelFactory::new(channel_config)),
    );

    let delivered = CollectingHandler::new();
    for (source_id, path) in [("DB1", &first), ("DB2", &second)] {
        let sink = EventSink::builder()
            .on_change("console", ConsoleHandler)
            .on_change_arc("counter", Arc::new(delivered.clone()))
            .on_fault(|fault: &Fault| warn!(%fault, "Tracking fault"))
            .build();
        let source = SourceDescriptor::new(source_id, path.to_string_lossy(), "Students");
        let id = registry.register(source, sink).await?;
        registry
            .wait_for_state(id, |state| {
                !matches!(state, WatcherState::Created | WatcherState::Starting)
            })
            .await;
        info!(%id, source = source_id, "Watcher registered");
    }

    if !cli.no_writes {
        // Both databases change at the same time.
        let (a, b) = tokio::join!(
            write(
                first.clone(),
                "INSERT INTO Students (id, name, grade) VALUES (1, 'Alice', 90);
                 INSERT INTO Students (id, name, grade) VALUES (2, 'Bob', 75);"
            ),
            write(
                second.clone(),
                "INSERT INTO Students (id, name, grade) VALUES (1, 'Chen', 82);"
            ),
        );
        a??;
        b??;
        delivered.wait_for(3, Duration::from_secs(10)).await;

        let (a, b) = tokio::join!(
            write(first.clone(), "UPDATE Students SET grade = 95 WHERE id = 1;"),
            write(second.clone(), "DELETE FROM Students WHERE id = 1;"),
        );
        a??;
        b??;
        if !delivered.wait_for(5, Duration::from_secs(10)).await {
            warn!(delivered = delivered.len(), "Not every scripted change was delivered");
        }
    }

    if cli.watch {
        info!("Watching for changes, press Ctrl+C to stop");
        signal::ctrl_c().await?;
        info!("Received shutdown signal");
    }

    registry.stop_all().await;
    info!(delivered = delivered.len(), "Tracker stopped");
    Ok(())
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tabletrack_core=info,tabletrack_channels=info"));

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(true)
        .init();
}
