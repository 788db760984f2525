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

//! Row codec benchmarks
//!
//! Measures decoding of raw channel payloads into entity snapshots for
//! different row widths, with and without column projection.
//!
//! # Running Benchmarks
//!
//! ```bash
//! cargo bench --package tabletrack-benches --bench codec_decode
//! ```

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use serde_json::json;
use tabletrack_benches::insert_payloads;
use tabletrack_core::channel::RawChangePayload;
use tabletrack_core::codec::RowCodec;

const BATCH: usize = 1000;

fn bench_decode_insert(c: &mut Criterion) {
    let codec = RowCodec::new("id");
    let mut group = c.benchmark_group("decode_insert");
    group.throughput(Throughput::Elements(BATCH as u64));

    for width in [5, 20, 50] {
        let payloads = insert_payloads(BATCH, width);
        group.bench_with_input(BenchmarkId::from_parameter(width), &payloads, |b, payloads| {
            b.iter(|| {
                for payload in payloads.iter().cloned() {
                    black_box(codec.decode(payload).unwrap());
                }
            });
        });
    }

    group.finish();
}

fn bench_decode_projected(c: &mut Criterion) {
    let codec = RowCodec::new("ID").with_tracked_columns(vec!["name".to_string(), "score_2".to_string()]);
    let payloads = insert_payloads(BATCH, 50);

    let mut group = c.benchmark_group("decode_projected");
    group.throughput(Throughput::Elements(BATCH as u64));
    group.bench_function("width_50_keep_3", |b| {
        b.iter(|| {
            for payload in payloads.iter().cloned() {
                black_box(codec.decode(payload).unwrap());
            }
        });
    });
    group.finish();
}

fn bench_decode_key_only_delete(c: &mut Criterion) {
    let codec = RowCodec::new("id");
    let payloads: Vec<RawChangePayload> = (1..=BATCH as u64)
        .map(|id| RawChangePayload::delete_key(json!(id)))
        .collect();

    let mut group = c.benchmark_group("decode_delete");
    group.throughput(Throughput::Elements(BATCH as u64));
    group.bench_function("key_only", |b| {
        b.iter(|| {
            for payload in payloads.iter().cloned() {
                black_box(codec.decode(payload).unwrap());
            }
        });
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_decode_insert,
    bench_decode_projected,
    bench_decode_key_only_delete
);
criterion_main!(benches);
