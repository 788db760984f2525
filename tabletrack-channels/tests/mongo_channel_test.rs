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

//! Integration tests for the MongoDB change-stream channel.
//!
//! Change streams need a replica set, so these tests are ignored by default.
//! To run them against a local single-node replica set:
//! ```bash
//! docker run -d -p 27017:27017 mongo:7 --replSet rs0
//! docker exec <container> mongosh --eval "rs.initiate()"
//! cargo test -p tabletrack-channels --features mongodb --test mongo_channel_test -- --ignored
//! ```
//! `MONGODB_URI` overrides the default `mongodb://localhost:27017/?directConnection=true`.

use bson::{doc, Document};
use mongodb::Client;
use std::time::Duration;
use tabletrack_channels::mongo::{MongoChannel, MongoChannelConfig};
use tabletrack_core::channel::{NotificationChannel, RawChangePayload};
use tabletrack_core::codec::RowCodec;
use tabletrack_core::{ChangeKind, SourceDescriptor};
use tokio::time::timeout;

const DATABASE: &str = "tabletrack_test";
const TIMEOUT: Duration = Duration::from_secs(10);

fn mongodb_uri() -> String {
    std::env::var("MONGODB_URI")
        .unwrap_or_else(|_| "mongodb://localhost:27017/?directConnection=true".to_string())
}

async fn fresh_collection(name: &str) -> mongodb::Collection<Document> {
    let client = Client::with_uri_str(mongodb_uri()).await.unwrap();
    let collection = client.database(DATABASE).collection::<Document>(name);
    collection.drop().await.ok();
    collection
}

async fn open_channel(collection: &str) -> (MongoChannel, SourceDescriptor) {
    let source = SourceDescriptor::new("DB1", mongodb_uri(), collection).with_key_column("_id");
    let config = MongoChannelConfig::builder()
        .database(DATABASE)
        .full_document_before_change(false)
        .build();
    let mut channel = MongoChannel::new(config);
    channel.open(&source).await.unwrap();
    (channel, source)
}

async fn next_change(channel: &mut MongoChannel) -> RawChangePayload {
    timeout(TIMEOUT, channel.next())
        .await
        .expect("no change within timeout")
        .expect("change stream failed")
}

#[tokio::test]
#[ignore] // Requires a MongoDB replica set
async fn test_insert_update_delete() {
    let collection = fresh_collection("students_crud").await;
    let (mut channel, source) = open_channel("students_crud").await;
    let codec = RowCodec::for_source(&source);

    collection
        .insert_one(doc! { "_id": 1, "name": "Alice", "grade": 90 })
        .await
        .unwrap();
    collection
        .update_one(doc! { "_id": 1 }, doc! { "$set": { "grade": 95 } })
        .await
        .unwrap();
    collection.delete_one(doc! { "_id": 1 }).await.unwrap();

    let (insert, kind) = codec.decode(next_change(&mut channel).await).unwrap();
    assert_eq!(kind, ChangeKind::Inserted);
    assert_eq!(insert.get("name"), Some(&serde_json::json!("Alice")));

    let (update, kind) = codec.decode(next_change(&mut channel).await).unwrap();
    assert_eq!(kind, ChangeKind::Updated);
    assert_eq!(update.get("grade"), Some(&serde_json::json!(95)));

    let (delete, kind) = codec.decode(next_change(&mut channel).await).unwrap();
    assert_eq!(kind, ChangeKind::Deleted);
    assert_eq!(delete.key(), &serde_json::json!(1));

    channel.close().await;
}

#[tokio::test]
#[ignore] // Requires a MongoDB replica set
async fn test_reopen_resumes_after_last_event() {
    let collection = fresh_collection("students_resume").await;
    let (mut channel, source) = open_channel("students_resume").await;

    collection.insert_one(doc! { "_id": 1, "name": "Alice" }).await.unwrap();
    let first = next_change(&mut channel).await;
    assert_eq!(first.key, Some(serde_json::json!(1)));

    channel.close().await;
    collection.insert_one(doc! { "_id": 2, "name": "Bob" }).await.unwrap();
    channel.open(&source).await.unwrap();

    let second = next_change(&mut channel).await;
    assert_eq!(second.kind, "insert");
    assert_eq!(second.key, Some(serde_json::json!(2)));
}

#[tokio::test]
#[ignore] // Requires a MongoDB replica set
async fn test_object_id_keys_decode_as_hex_strings() {
    let collection = fresh_collection("students_oid").await;
    let (mut channel, source) = open_channel("students_oid").await;
    let codec = RowCodec::for_source(&source);

    let id = bson::oid::ObjectId::new();
    collection.insert_one(doc! { "_id": id, "name": "Alice" }).await.unwrap();

    let (snapshot, _) = codec.decode(next_change(&mut channel).await).unwrap();
    assert_eq!(snapshot.key(), &serde_json::json!(id.to_hex()));
}

#[tokio::test]
#[ignore] // Requires a MongoDB replica set
async fn test_drop_fails_channel() {
    let collection = fresh_collection("students_drop").await;
    collection.insert_one(doc! { "_id": 1 }).await.unwrap();
    let (mut channel, _) = open_channel("students_drop").await;

    collection.drop().await.unwrap();

    let result = timeout(TIMEOUT, channel.next()).await.unwrap();
    assert!(result.is_err());
}
