//! Benchmarks for greedy IoU tracking

use chrono::{Duration, Utc};
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use ioutrack::{bbox::ious, Bbox, Detection, GreedyTracker, GreedyTrackerConfig};
use rand::Rng;
use std::hint::black_box;

/// Objects sliding right a few pixels per frame with a little jitter
fn create_test_frames(n_detections: usize, n_frames: usize) -> Vec<Vec<Detection>> {
    let mut rng = rand::rng();
    let t0 = Utc::now();
    (0..n_frames)
        .map(|frame| {
            let t = t0 + Duration::milliseconds(frame as i64 * 33);
            (0..n_detections)
                .map(|i| {
                    let x = (frame * 4 + (i % 20) * 60) as f32 + rng.random_range(-1.0..1.0);
                    let y = ((i / 20) * 70) as f32 + rng.random_range(-1.0..1.0);
                    Detection::new(Bbox::from_xywh(x, y, 50.0, 40.0), 0, 0.8, t)
                })
                .collect()
        })
        .collect()
}

fn bench_greedy_update(c: &mut Criterion) {
    let frames = create_test_frames(20, 30);

    c.bench_function("greedy_update_20_detections_30_frames", |b| {
        b.iter_batched(
            || GreedyTracker::new(GreedyTrackerConfig::default()).unwrap(),
            |mut tracker| {
                for frame in &frames {
                    black_box(tracker.update(black_box(frame)));
                }
            },
            criterion::BatchSize::SmallInput,
        )
    });
}

fn bench_greedy_various_sizes(c: &mut Criterion) {
    let mut group = c.benchmark_group("greedy_various_detection_counts");

    for &n_detections in &[5, 10, 20, 50, 100] {
        let frames = create_test_frames(n_detections, 10);

        group.bench_with_input(
            BenchmarkId::new("detections", n_detections),
            &frames,
            |b, frames| {
                b.iter_batched(
                    || GreedyTracker::new(GreedyTrackerConfig::default()).unwrap(),
                    |mut tracker| {
                        for frame in frames {
                            black_box(tracker.update(black_box(frame)));
                        }
                    },
                    criterion::BatchSize::SmallInput,
                )
            },
        );
    }
    group.finish();
}

fn bench_iou_matrix(c: &mut Criterion) {
    let rows: Vec<Bbox> = (0..50)
        .map(|i| Bbox::from_xywh(i as f32 * 7.0, i as f32 * 3.0, 40.0, 40.0))
        .collect();
    let cols: Vec<Bbox> = (0..30)
        .map(|i| Bbox::from_xywh(i as f32 * 7.0 + 0.5, i as f32 * 3.0 + 0.5, 40.0, 40.0))
        .collect();

    c.bench_function("iou_matrix_50x30", |b| {
        b.iter(|| ious(black_box(&rows), black_box(&cols)))
    });
}

criterion_group!(
    benches,
    bench_greedy_update,
    bench_greedy_various_sizes,
    bench_iou_matrix
);
criterion_main!(benches);
