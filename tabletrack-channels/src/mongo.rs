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

//! MongoDB change-stream notification channel.
//!
//! Watches one collection through the server's change streams. The source
//! descriptor's `connection_target` is the MongoDB URI and its `table` is the
//! collection; the database comes from [`MongoChannelConfig::database`] or,
//! when unset, from the default database in the URI.
//!
//! Documents are keyed by `_id`, so descriptors for this channel should use
//! `with_key_column("_id")`.
//!
//! - Updates carry the full post-image (`updateLookup`); when the document was
//!   deleted before the lookup ran, only the updated fields are sent.
//! - Deletes carry the pre-image when the collection records one, otherwise
//!   only the key.
//! - On reopen the stream resumes after the last delivered resume token.
//! - `invalidate`, `drop`, `dropDatabase` and `rename` fail the channel.

use async_trait::async_trait;
use bson::{Bson, Document};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use mongodb::change_stream::event::{ChangeStreamEvent, OperationType, ResumeToken};
use mongodb::change_stream::ChangeStream;
use mongodb::options::{ChangeStreamOptions, FullDocumentBeforeChangeType, FullDocumentType};
use mongodb::{Client, Collection};
use serde_json::{Map, Value};
use tabletrack_core::channel::{ChannelError, ChannelFactory, NotificationChannel, RawChangePayload};
use tabletrack_core::source::SourceDescriptor;
use tracing::{debug, info, warn};

/// Configuration for [`MongoChannel`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MongoChannelConfig {
    /// Database holding the watched collection (defaults to the URI database)
    pub database: Option<String>,

    /// Request the full post-image for update events
    pub full_document_on_update: bool,

    /// Request pre-images for delete events (MongoDB 6.0+)
    pub full_document_before_change: bool,

    /// Server batch size for the change stream cursor
    pub batch_size: Option<u32>,
}

impl Default for MongoChannelConfig {
    fn default() -> Self {
        Self {
            database: None,
            full_document_on_update: true,
            full_document_before_change: true,
            batch_size: None,
        }
    }
}

impl MongoChannelConfig {
    #[must_use]
    pub fn builder() -> MongoChannelConfigBuilder {
        MongoChannelConfigBuilder::default()
    }

    fn to_mongo_options(&self, resume_after: Option<ResumeToken>) -> ChangeStreamOptions {
        let mut options = ChangeStreamOptions::default();
        if self.full_document_on_update {
            options.full_document = Some(FullDocumentType::UpdateLookup);
        }
        if self.full_document_before_change {
            options.full_document_before_change = Some(FullDocumentBeforeChangeType::WhenAvailable);
        }
        options.batch_size = self.batch_size;
        options.resume_after = resume_after;
        options
    }
}

/// Builder for [`MongoChannelConfig`].
#[derive(Debug, Default)]
pub struct MongoChannelConfigBuilder {
    database: Option<String>,
    full_document_on_update: Option<bool>,
    full_document_before_change: Option<bool>,
    batch_size: Option<u32>,
}

impl MongoChannelConfigBuilder {
    #[must_use]
    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    /// Default: true
    #[must_use]
    pub fn full_document_on_update(mut self, enabled: bool) -> Self {
        self.full_document_on_update = Some(enabled);
        self
    }

    /// Default: true
    #[must_use]
    pub fn full_document_before_change(mut self, enabled: bool) -> Self {
        self.full_document_before_change = Some(enabled);
        self
    }

    #[must_use]
    pub fn batch_size(mut self, size: u32) -> Self {
        self.batch_size = Some(size);
        self
    }

    #[must_use]
    pub fn build(self) -> MongoChannelConfig {
        let defaults = MongoChannelConfig::default();
        MongoChannelConfig {
            database: self.database,
            full_document_on_update: self
                .full_document_on_update
                .unwrap_or(defaults.full_document_on_update),
            full_document_before_change: self
                .full_document_before_change
                .unwrap_or(defaults.full_document_before_change),
            batch_size: self.batch_size,
        }
    }
}

/// Change-stream channel over one MongoDB collection.
pub struct MongoChannel {
    config: MongoChannelConfig,
    stream: Option<ChangeStream<ChangeStreamEvent<Document>>>,
    resume_token: Option<ResumeToken>,
}

impl std::fmt::Debug for MongoChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MongoChannel")
            .field("config", &self.config)
            .field("open", &self.stream.is_some())
            .field("resumable", &self.resume_token.is_some())
            .finish()
    }
}

impl MongoChannel {
    #[must_use]
    pub fn new(config: MongoChannelConfig) -> Self {
        Self {
            config,
            stream: None,
            resume_token: None,
        }
    }
}

/// Connects and resolves the watched collection.
///
/// Takes the database name by value so the connect future borrows nothing from
/// the channel.
async fn connect_collection(
    database: Option<String>,
    source: &SourceDescriptor,
) -> Result<Collection<Document>, ChannelError> {
    let client = Client::with_uri_str(&source.connection_target)
        .await
        .map_err(ChannelError::unavailable)?;

    let database = match database {
        Some(name) => client.database(&name),
        None => client.default_database().ok_or_else(|| {
            ChannelError::unavailable_msg(format!(
                "no database configured and none in URI for source '{}'",
                source.source_id
            ))
        })?,
    };

    Ok(database.collection::<Document>(&source.table))
}

#[async_trait]
impl NotificationChannel for MongoChannel {
    async fn open(&mut self, source: &SourceDescriptor) -> Result<(), ChannelError> {
        let options = self.config.to_mongo_options(self.resume_token.clone());
        let resumed = options.resume_after.is_some();
        let collection = connect_collection(self.config.database.clone(), source).await?;

        let stream = collection
            .watch()
            .with_options(options)
            .await
            .map_err(ChannelError::unavailable)?;

        info!(
            database = %collection.namespace().db,
            collection = %collection.namespace().coll,
            resumed,
            "Change stream opened"
        );
        self.stream = Some(stream);
        Ok(())
    }

    async fn next(&mut self) -> Result<RawChangePayload, ChannelError> {
        loop {
            let Some(stream) = self.stream.as_mut() else {
                return Err(ChannelError::Closed);
            };

            let event = match stream.next().await {
                Some(Ok(event)) => event,
                Some(Err(e)) => return Err(ChannelError::failed(e)),
                None => {
                    self.stream = None;
                    return Err(ChannelError::Closed);
                }
            };
            self.resume_token = Some(event.id.clone());

            match event_to_payload(event)? {
                Some(payload) => return Ok(payload),
                None => continue,
            }
        }
    }

    async fn close(&mut self) {
        if self.stream.take().is_some() {
            debug!("Change stream closed");
        }
    }

    fn backend(&self) -> &'static str {
        "mongodb"
    }
}

/// Converts a document `_id` to a scalar JSON key.
///
/// ObjectIds become their hex string; everything else uses relaxed extended JSON.
fn key_to_json(id: Bson) -> Value {
    match id {
        Bson::ObjectId(oid) => Value::String(oid.to_hex()),
        other => other.into_relaxed_extjson(),
    }
}

/// Converts a BSON document into a JSON column map (relaxed extended JSON).
fn document_to_columns(mut document: Document) -> Map<String, Value> {
    let id = document.remove("_id");
    let mut columns = match Bson::Document(document).into_relaxed_extjson() {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    if let Some(id) = id {
        columns.insert("_id".to_string(), key_to_json(id));
    }
    columns
}

fn cluster_time(event: &ChangeStreamEvent<Document>) -> Option<DateTime<Utc>> {
    event
        .cluster_time
        .and_then(|ts| DateTime::from_timestamp(i64::from(ts.time), 0))
}

/// Maps a change-stream event to a payload.
///
/// Returns `Ok(None)` for events that do not describe a document change
/// (index builds and other DDL), and `Failed` when the stream can no longer
/// deliver changes for the collection.
fn event_to_payload(
    event: ChangeStreamEvent<Document>,
) -> Result<Option<RawChangePayload>, ChannelError> {
    let observed_at = cluster_time(&event);
    let key = event
        .document_key
        .as_ref()
        .and_then(|key| key.get("_id"))
        .cloned()
        .map(key_to_json);

    let (kind, columns) = match event.operation_type {
        OperationType::Insert | OperationType::Replace => {
            let kind = if event.operation_type == OperationType::Insert {
                "insert"
            } else {
                "replace"
            };
            (kind, event.full_document.map(document_to_columns))
        }
        OperationType::Update => {
            let columns = match event.full_document {
                Some(document) => Some(document_to_columns(document)),
                None => event
                    .update_description
                    .map(|description| document_to_columns(description.updated_fields)),
            };
            ("update", columns)
        }
        OperationType::Delete => (
            "delete",
            event.full_document_before_change.map(document_to_columns),
        ),
        OperationType::Invalidate
        | OperationType::Drop
        | OperationType::DropDatabase
        | OperationType::Rename => {
            return Err(ChannelError::failed_msg(format!(
                "change stream invalidated by {:?}",
                event.operation_type
            )));
        }
        other => {
            warn!(operation = ?other, "Ignoring non-document change stream event");
            return Ok(None);
        }
    };

    let mut payload = RawChangePayload::new(kind);
    payload.key = key;
    payload.columns = columns;
    payload.observed_at = observed_at;
    Ok(Some(payload))
}

/// Creates [`MongoChannel`]s sharing one configuration.
#[derive(Debug, Clone, Default)]
pub struct MongoChannelFactory {
    config: MongoChannelConfig,
}

impl MongoChannelFactory {
    #[must_use]
    pub fn new(config: MongoChannelConfig) -> Self {
        Self { config }
    }
}

impl ChannelFactory for MongoChannelFactory {
    fn create(
        &self,
        source: &SourceDescriptor,
    ) -> Result<Box<dyn NotificationChannel>, ChannelError> {
        if !source.connection_target.starts_with("mongodb://")
            && !source.connection_target.starts_with("mongodb+srv://")
        {
            return Err(ChannelError::unavailable_msg(format!(
                "'{}' is not a MongoDB connection string",
                source.connection_target
            )));
        }
        Ok(Box::new(MongoChannel::new(self.config.clone())))
    }
}
