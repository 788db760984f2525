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

//! Dispatch throughput benchmarks
//!
//! Measures fan-out cost in the event sink and end-to-end delivery through a
//! watcher backed by the in-memory channel, for inline and queued dispatch.
//!
//! # Running Benchmarks
//!
//! ```bash
//! cargo bench --package tabletrack-benches --bench dispatch_throughput
//! ```

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;
use std::time::Duration;
use tabletrack_benches::{counting_handler, insert_payloads, student_event};
use tabletrack_core::memory::MemoryChannelFactory;
use tabletrack_core::sink::{CollectingHandler, EventSink};
use tabletrack_core::{DispatchMode, SourceDescriptor, TrackerConfig, TrackerRegistry};

const EVENTS: usize = 1000;

/// Benchmark: sink fan-out to N handlers
fn bench_sink_fan_out(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let events: Vec<_> = (1..=EVENTS as u64).map(|seq| student_event(seq, 5)).collect();

    let mut group = c.benchmark_group("sink_fan_out");
    group.throughput(Throughput::Elements(EVENTS as u64));

    for handlers in [1, 4, 16] {
        let sink = EventSink::new();
        runtime.block_on(async {
            for i in 0..handlers {
                let (_, handler) = counting_handler();
                sink.subscribe(format!("counter-{i}"), handler).await;
            }
        });

        group.bench_with_input(BenchmarkId::from_parameter(handlers), &sink, |b, sink| {
            b.to_async(&runtime).iter(|| async {
                for event in &events {
                    black_box(sink.dispatch(event).await);
                }
            });
        });
    }

    group.finish();
}

/// Benchmark: payloads through a registered watcher until every event is delivered
fn bench_watcher_delivery(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let payloads = insert_payloads(EVENTS, 5);

    let mut group = c.benchmark_group("watcher_delivery");
    group.throughput(Throughput::Elements(EVENTS as u64));
    group.sample_size(20);

    let modes = [
        ("inline", DispatchMode::Inline),
        ("queued", DispatchMode::Queued { capacity: 256 }),
    ];
    for (name, mode) in modes {
        let config = TrackerConfig::builder().dispatch(mode).build().unwrap();

        group.bench_function(name, |b| {
            b.to_async(&runtime).iter(|| {
                let config = config.clone();
                let payloads = payloads.clone();
                async move {
                    let factory = Arc::new(MemoryChannelFactory::new());
                    let registry = TrackerRegistry::new(config, factory.clone());
                    let delivered = CollectingHandler::new();
                    let sink = EventSink::builder()
                        .on_change_arc("collector", Arc::new(delivered.clone()))
                        .build();

                    registry
                        .register(SourceDescriptor::new("DB1", "memory://db1", "Students"), sink)
                        .await
                        .unwrap();
                    factory.controller("DB1").push_all(payloads);

                    assert!(delivered.wait_for(EVENTS, Duration::from_secs(30)).await);
                    registry.stop_all().await;
                }
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_sink_fan_out, bench_watcher_delivery);
criterion_main!(benches);
