//! Criterion benchmarks for the readout hot paths.
//!
//! A full-size frame (2002 x 512 pixels on 16 channels, three stripes) has to be
//! demultiplexed, broadcast and optionally saved well inside the frame period.
//!
//! Key metrics:
//! - Demultiplex throughput for a whole frame
//! - Channel de-interleave cost per stripe
//! - Chunked emission into an in-memory sink
//!
//! Run with: cargo bench --bench demux

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use reb_gige::broadcast::protocol::{emit_frame, MemorySink, CHUNK_SAMPLES};
use reb_gige::demux::{Demultiplexer, SignTransform};
use reb_gige::hardware::MockTransport;
use reb_gige::storage::writer::deinterleave;
use reb_gige::store::StripeStore;
use reb_gige::stripe::{FrameTags, Geometry, StripeId, StripeMask};

fn frame_sizes() -> Vec<(&'static str, Geometry)> {
    vec![
        ("64x64", Geometry::new(64, 64, 16).unwrap()),
        ("500x512", Geometry::new(500, 512, 16).unwrap()),
        ("2002x512", Geometry::new(2002, 512, 16).unwrap()),
    ]
}

/// Whole-frame acquisition from the mock transport, both sample transforms.
fn demux_frame(c: &mut Criterion) {
    let mut group = c.benchmark_group("demux_frame");
    group.sample_size(20);

    let mask = StripeMask::new(StripeMask::ALL_BITS).unwrap();
    for (name, geometry) in frame_sizes() {
        let words = geometry.samples_per_stripe() * mask.count();
        group.throughput(Throughput::Bytes((words * 2) as u64));

        for transform in [SignTransform::MidScaleComplement, SignTransform::BiasSubtract] {
            let store = StripeStore::new();
            let mut transport = MockTransport::open(0, "bench");
            let mut demux = Demultiplexer::new(transform);
            let id = BenchmarkId::new(format!("{:?}", transform), name);
            group.bench_with_input(id, &geometry, |b, geometry| {
                b.iter(|| {
                    demux
                        .acquire(&store, &mut transport, *geometry, mask, FrameTags::default())
                        .unwrap()
                });
            });
        }
    }

    group.finish();
}

/// Splitting one stripe into its per-channel images.
fn deinterleave_stripe(c: &mut Criterion) {
    let mut group = c.benchmark_group("deinterleave");

    for (name, geometry) in frame_sizes() {
        let samples: Vec<u32> = (0..geometry.samples_per_stripe() as u32).collect();
        group.throughput(Throughput::Bytes((samples.len() * 4) as u64));
        group.bench_with_input(BenchmarkId::new("all_channels", name), &geometry, |b, geometry| {
            b.iter(|| {
                for channel in 0..geometry.channels {
                    black_box(deinterleave(black_box(&samples), channel, *geometry));
                }
            });
        });
    }

    group.finish();
}

/// Chunked emission of a full frame without sockets.
fn emit_to_memory(c: &mut Criterion) {
    let mut group = c.benchmark_group("emit_frame");
    group.sample_size(20);

    for (name, geometry) in frame_sizes() {
        let store = StripeStore::new();
        let mut transport = MockTransport::open(0, "bench");
        let mask = StripeMask::new(StripeMask::ALL_BITS).unwrap();
        Demultiplexer::default()
            .acquire(&store, &mut transport, geometry, mask, FrameTags::default())
            .unwrap();

        let bytes = geometry.samples_per_stripe() * StripeId::ALL.len() * 4;
        group.throughput(Throughput::Bytes(bytes as u64));
        group.bench_with_input(BenchmarkId::new("chunked", name), &geometry, |b, _| {
            b.iter(|| {
                let mut sink = MemorySink::new();
                store.with_lock(|state| emit_frame(&mut sink, state, CHUNK_SAMPLES).unwrap());
                black_box(sink.messages.len())
            });
        });
    }

    group.finish();
}

criterion_group!(benches, demux_frame, deinterleave_stripe, emit_to_memory);
criterion_main!(benches);
