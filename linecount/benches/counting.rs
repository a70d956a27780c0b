//! Benchmarks for crossing evaluation and drift metrics

use chrono::{Duration, Utc};
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use image::{imageops, GrayImage, Rgb, RgbImage};
use imageproc::edges::canny;
use ioutrack::{Bbox, Detection, Side};
use linecount::drift::{brightness_variance, edge_iou, ssim, DriftConfig, DriftMonitor};
use linecount::processor::{FrameProcessor, ProcessorSettings};
use linecount::types::Frame;
use linecount::{AppConfig, CountingLine};
use nalgebra::Point2;
use std::hint::black_box;

/// `n` objects per frame walking down across y = 240 in parallel lanes
fn create_test_frames(n_objects: usize, n_frames: usize) -> Vec<Vec<Detection>> {
    let t0 = Utc::now();
    (0..n_frames)
        .map(|frame| {
            let t = t0 + Duration::milliseconds(frame as i64 * 33);
            (0..n_objects)
                .map(|i| {
                    let x = (i % 12) as f32 * 100.0 + 20.0;
                    let y = frame as f32 * 6.0 + (i / 12) as f32 * 80.0;
                    Detection::new(Bbox::from_xywh(x, y, 50.0, 50.0), 0, 0.9, t)
                })
                .collect()
        })
        .collect()
}

fn line() -> CountingLine {
    CountingLine::new(Point2::new(0.0, 240.0), Point2::new(1280.0, 240.0), Side::Negative)
        .expect("valid line")
}

fn settings() -> ProcessorSettings {
    let mut config = AppConfig::default();
    config.tracking.min_box_area = 0.0;
    config.processor_settings()
}

fn bench_frame_processing(c: &mut Criterion) {
    let mut group = c.benchmark_group("crossing_frame_processing");
    let line = line();

    for &n_objects in &[5, 20, 50] {
        let frames = create_test_frames(n_objects, 90);
        group.bench_with_input(BenchmarkId::new("objects", n_objects), &frames, |b, frames| {
            b.iter_batched(
                || FrameProcessor::new(&settings()).expect("processor"),
                |mut processor| {
                    for frame in frames {
                        let t = frame.first().map(|d| d.timestamp).unwrap_or_else(Utc::now);
                        black_box(processor.process(black_box(frame.clone()), &line, t));
                    }
                },
                criterion::BatchSize::SmallInput,
            )
        });
    }

    group.finish();
}

fn scene(offset: u32) -> RgbImage {
    RgbImage::from_fn(320, 180, |x, y| {
        if ((x + offset) / 12 + (y + offset) / 12) % 2 == 0 {
            Rgb([190, 190, 190])
        } else {
            Rgb([50, 50, 50])
        }
    })
}

fn bench_drift_metrics(c: &mut Criterion) {
    let a: GrayImage = imageops::grayscale(&scene(0));
    let b: GrayImage = imageops::grayscale(&scene(5));
    let ea = canny(&a, 50.0, 150.0);
    let eb = canny(&b, 50.0, 150.0);

    c.bench_function("ssim_320x180", |bench| {
        bench.iter(|| black_box(ssim(black_box(&a), black_box(&b))))
    });
    c.bench_function("edge_iou_320x180", |bench| {
        bench.iter(|| black_box(edge_iou(black_box(&ea), black_box(&eb))))
    });
    c.bench_function("brightness_variance_320x180", |bench| {
        bench.iter(|| black_box(brightness_variance(black_box(&a))))
    });
}

fn bench_drift_check(c: &mut Criterion) {
    let reference = Frame::new(0, scene(0), Utc::now());
    let current = Frame::new(1, scene(5), Utc::now());

    c.bench_function("drift_check_full_frame", |b| {
        b.iter_batched(
            || {
                let mut monitor = DriftMonitor::new(DriftConfig {
                    re_calibrate_on_drift: false,
                    ..Default::default()
                });
                monitor.set_reference(&reference);
                monitor
            },
            |mut monitor| black_box(monitor.check(black_box(&current), Utc::now())),
            criterion::BatchSize::SmallInput,
        )
    });
}

criterion_group!(
    benches,
    bench_frame_processing,
    bench_drift_metrics,
    bench_drift_check
);
criterion_main!(benches);
