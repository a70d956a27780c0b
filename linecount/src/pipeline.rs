/// Real-time counting loop
///
/// Frame source → detector → processor → hand-offs, on a dedicated thread:
/// - events go to the [`EventWriter`] queue without blocking
/// - stats, the latest frame and calibration evidence are published as snapshots
/// - transient read and detector failures skip a frame; a fatal detector error
///   ends the loop and surfaces from [`CountingPipeline::join`]
use crate::autocal::CalibrationTap;
use crate::cancel::CancellationToken;
use crate::config::OpsConfig;
use crate::detector_trait::{Detector, FrameSource};
use crate::error::{CounterError, Result};
use crate::line::CountingLine;
use crate::processor::FrameProcessor;
use crate::state::LiveState;
use crate::store::{EventStore, EventWriter};
use crate::types::RunningStats;
use serde::Serialize;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

/// Pipeline loop configuration
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Log throughput every n frames
    pub stats_every_frames: u64,
    /// Publish every n-th frame to live state
    pub frame_publish_interval: u64,
    /// Consecutive read failures before giving up on the source
    pub max_consecutive_read_errors: u32,
    /// Stop after this many processed frames
    pub max_frames: Option<u64>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::from_ops(&OpsConfig::default())
    }
}

impl PipelineConfig {
    pub fn from_ops(ops: &OpsConfig) -> Self {
        Self {
            stats_every_frames: ops.stats_every_frames,
            frame_publish_interval: ops.frame_publish_interval,
            max_consecutive_read_errors: ops.max_consecutive_read_errors,
            max_frames: None,
        }
    }
}

/// Why the loop ended without error
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum StopReason {
    #[default]
    EndOfStream,
    FrameLimit,
    Stopped,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineSummary {
    pub frames: u64,
    /// Frames dropped after a transient detector failure
    pub skipped_frames: u64,
    pub read_errors: u64,
    pub events: u64,
    /// Detections ignored for lying outside the ROI band
    pub roi_dropped: u64,
    pub stats: RunningStats,
    pub stop_reason: StopReason,
}

/// Shared collaborators the loop publishes into
#[derive(Clone)]
pub struct PipelineContext {
    pub state: Arc<LiveState>,
    pub tap: Arc<CalibrationTap>,
    pub writer: Arc<EventWriter>,
}

struct PipelineWorker {
    source: Box<dyn FrameSource>,
    detector: Box<dyn Detector>,
    processor: FrameProcessor,
    context: PipelineContext,
    config: PipelineConfig,
    summary: PipelineSummary,
}

impl PipelineWorker {
    fn run(&mut self, stop: &CancellationToken) -> Result<PipelineSummary> {
        let (width, height) = self.source.frame_size();
        log::info!(
            "Counting pipeline started ({} detector, {}x{})",
            self.detector.name(),
            width,
            height
        );
        let started = Instant::now();
        let result = self.run_loop(stop);

        // Make everything counted so far durable before reporting
        self.context.writer.flush();

        let elapsed = started.elapsed().as_secs_f32();
        match &result {
            Ok(summary) => log::info!(
                "Counting pipeline stopped ({:?}): {} frames in {:.1}s, {} skipped, {} read errors, in={} out={} net={}",
                summary.stop_reason,
                summary.frames,
                elapsed,
                summary.skipped_frames,
                summary.read_errors,
                summary.stats.in_count(),
                summary.stats.out_count(),
                summary.stats.net()
            ),
            Err(e) => log::error!(
                "Counting pipeline failed after {} frames: {}",
                self.summary.frames,
                e
            ),
        }
        result
    }

    fn run_loop(&mut self, stop: &CancellationToken) -> Result<PipelineSummary> {
        let mut consecutive_read_errors = 0u32;
        let publish_every = self.config.frame_publish_interval.max(1);
        let stats_every = self.config.stats_every_frames.max(1);

        let reason = loop {
            if stop.is_cancelled() {
                break StopReason::Stopped;
            }
            if self.config.max_frames.is_some_and(|max| self.summary.frames >= max) {
                break StopReason::FrameLimit;
            }

            // Step 1: read
            let frame = match self.source.next_frame() {
                Ok(Some(frame)) => {
                    consecutive_read_errors = 0;
                    frame
                }
                Ok(None) => break StopReason::EndOfStream,
                Err(e) if !e.is_fatal() => {
                    self.summary.read_errors += 1;
                    consecutive_read_errors += 1;
                    log::warn!("Frame read failed, skipping: {}", e);
                    if consecutive_read_errors > self.config.max_consecutive_read_errors {
                        return Err(CounterError::pipeline(format!(
                            "{} consecutive frame read failures",
                            consecutive_read_errors
                        )));
                    }
                    continue;
                }
                Err(e) => return Err(e),
            };

            // Step 2: detect
            let raw = match self.detector.detect(&frame) {
                Ok(raw) => raw,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    self.summary.skipped_frames += 1;
                    log::warn!("Frame {} skipped: {}", frame.frame_id, e);
                    continue;
                }
            };

            // Step 3: track and count against the current line snapshot
            let line = self.context.state.line();
            let result = self.processor.process(raw, &line, frame.timestamp);

            self.summary.roi_dropped += result.roi_dropped as u64;

            // Step 4: hand off without blocking
            for event in result.events {
                self.summary.events += 1;
                self.context.writer.submit(event);
            }
            self.context.state.publish_stats(result.stats);
            self.summary.stats = result.stats;

            // Step 5: feed a running warm-up, if any
            if self.context.tap.is_active() {
                self.context.tap.feed(&frame, self.processor.tracks());
            }

            let publish = self.summary.frames % publish_every == 0;
            self.summary.frames += 1;
            if publish {
                self.context.state.publish_frame(Arc::new(frame));
            }

            if self.summary.frames % stats_every == 0 {
                let stats = self.summary.stats;
                log::info!(
                    "Pipeline stats: {} frames, {} skipped, {} tracks, {} outside roi, in={} out={} net={}, {:.1} fps",
                    self.summary.frames,
                    self.summary.skipped_frames,
                    self.processor.num_tracks(),
                    self.summary.roi_dropped,
                    stats.in_count(),
                    stats.out_count(),
                    stats.net(),
                    stats.fps()
                );
            }
        };

        self.summary.stop_reason = reason;
        Ok(self.summary.clone())
    }
}

/// Handle to the pipeline thread
pub struct CountingPipeline {
    stop: CancellationToken,
    handle: Option<thread::JoinHandle<Result<PipelineSummary>>>,
}

impl CountingPipeline {
    pub fn spawn(
        source: Box<dyn FrameSource>,
        detector: Box<dyn Detector>,
        processor: FrameProcessor,
        context: PipelineContext,
        config: PipelineConfig,
    ) -> Result<Self> {
        let stop = CancellationToken::new();
        let worker_stop = stop.clone();
        let mut worker = PipelineWorker {
            source,
            detector,
            processor,
            context,
            config,
            summary: PipelineSummary::default(),
        };
        let handle = thread::Builder::new()
            .name("counting-pipeline".to_string())
            .spawn(move || worker.run(&worker_stop))?;
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    /// Ask the loop to finish after the current frame
    pub fn stop(&self) {
        self.stop.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(|h| h.is_finished())
    }

    /// Wait for the loop to end
    pub fn join(mut self) -> Result<PipelineSummary> {
        self.join_inner()
    }

    fn join_inner(&mut self) -> Result<PipelineSummary> {
        match self.handle.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| CounterError::pipeline("pipeline thread panicked"))?,
            None => Err(CounterError::pipeline("pipeline already joined")),
        }
    }
}

impl Drop for CountingPipeline {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.stop();
            if let Err(e) = self.join_inner() {
                log::warn!("Pipeline ended with error during drop: {}", e);
            }
        }
    }
}

/// Outcome of a backfill replay
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct BackfillReport {
    pub frames: u64,
    pub skipped_frames: u64,
    pub events: u64,
    pub stats: RunningStats,
}

/// Replay a recorded source through `processor` straight into `store`.
///
/// Appends go through the store's own serialization, so this can run while
/// the live writer is appending to the same store.
pub fn backfill(
    source: &mut dyn FrameSource,
    detector: &mut dyn Detector,
    processor: &mut FrameProcessor,
    line: &CountingLine,
    store: &dyn EventStore,
    cancel: &CancellationToken,
) -> Result<BackfillReport> {
    line.validate()?;
    let mut report = BackfillReport::default();
    log::info!("Backfill started ({} detector)", detector.name());

    loop {
        if cancel.is_cancelled() {
            log::warn!("Backfill cancelled after {} frames, {} events", report.frames, report.events);
            return Err(CounterError::Cancelled);
        }
        let frame = match source.next_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(e) if !e.is_fatal() => {
                log::warn!("Backfill frame read failed, skipping: {}", e);
                report.skipped_frames += 1;
                continue;
            }
            Err(e) => return Err(e),
        };
        let raw = match detector.detect(&frame) {
            Ok(raw) => raw,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                log::warn!("Backfill frame {} skipped: {}", frame.frame_id, e);
                report.skipped_frames += 1;
                continue;
            }
        };
        let result = processor.process(raw, line, frame.timestamp);
        if !result.events.is_empty() {
            store
                .append_batch(&result.events)
                .or_else(|e| {
                    log::warn!("Backfill append failed ({}), retrying once", e);
                    store.append_batch(&result.events)
                })?;
            report.events += result.events.len() as u64;
        }
        report.frames += 1;
        report.stats = result.stats;
    }

    log::info!(
        "Backfill finished: {} frames, {} skipped, {} events (in={} out={})",
        report.frames,
        report.skipped_frames,
        report.events,
        report.stats.in_count(),
        report.stats.out_count()
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StaticConfigProvider;
    use crate::crossing::CrossingConfig;
    use crate::postprocessing::{PostprocessConfig, RoiConfig};
    use crate::processor::ProcessorSettings;
    use crate::store::MemoryEventStore;
    use crate::synthetic::{ScriptedDetector, ScriptedFailure};
    use crate::types::{Direction, Frame};
    use chrono::{DateTime, Duration, Utc};
    use image::RgbImage;
    use ioutrack::{Bbox, GreedyTrackerConfig, Side};
    use nalgebra::Point2;
    use std::collections::HashSet;

    /// Blank frames at 25 fps, optionally failing on some reads
    struct BlankSource {
        frames: u64,
        next: u64,
        fail_at: HashSet<u64>,
        start: DateTime<Utc>,
    }

    impl BlankSource {
        fn new(frames: u64) -> Self {
            Self {
                frames,
                next: 0,
                fail_at: HashSet::new(),
                start: Utc::now(),
            }
        }

        fn failing_at<I: IntoIterator<Item = u64>>(mut self, reads: I) -> Self {
            self.fail_at.extend(reads);
            self
        }
    }

    impl FrameSource for BlankSource {
        fn next_frame(&mut self) -> Result<Option<Frame>> {
            if self.next >= self.frames {
                return Ok(None);
            }
            let id = self.next;
            self.next += 1;
            if self.fail_at.contains(&id) {
                return Err(CounterError::frame_read(format!("read {} failed", id)));
            }
            Ok(Some(Frame::new(
                id,
                RgbImage::new(64, 48),
                self.start + Duration::milliseconds(id as i64 * 40),
            )))
        }

        fn frame_size(&self) -> (u32, u32) {
            (64, 48)
        }
    }

    fn line() -> CountingLine {
        CountingLine::new(Point2::new(320.0, 0.0), Point2::new(320.0, 480.0), Side::Negative).unwrap()
    }

    /// One object walking left to right across x = 320, then empty frames
    fn walk_script() -> Vec<Vec<Bbox>> {
        let mut script: Vec<Vec<Bbox>> = (0..=64)
            .map(|i| {
                let x = i as f32 * 10.0;
                vec![Bbox::new(x - 20.0, 200.0, x + 20.0, 260.0)]
            })
            .collect();
        script.extend((0..5).map(|_| Vec::new()));
        script
    }

    fn processor() -> FrameProcessor {
        FrameProcessor::new(&ProcessorSettings {
            postprocess: PostprocessConfig::default(),
            roi: RoiConfig::default(),
            tracker: GreedyTrackerConfig {
                max_misses: 3,
                ..Default::default()
            },
            crossing: CrossingConfig::default(),
        })
        .unwrap()
    }

    fn context(store: Arc<MemoryEventStore>) -> PipelineContext {
        let provider = Arc::new(StaticConfigProvider::new(line()));
        PipelineContext {
            state: Arc::new(LiveState::new(provider).unwrap()),
            tap: Arc::new(CalibrationTap::new()),
            writer: Arc::new(EventWriter::spawn(store, 16, 4).unwrap()),
        }
    }

    fn run(
        source: BlankSource,
        detector: ScriptedDetector,
        context: &PipelineContext,
        config: PipelineConfig,
    ) -> Result<PipelineSummary> {
        CountingPipeline::spawn(
            Box::new(source),
            Box::new(detector),
            processor(),
            context.clone(),
            config,
        )
        .unwrap()
        .join()
    }

    #[test]
    fn test_counts_and_publishes() {
        let store = Arc::new(MemoryEventStore::new());
        let context = context(store.clone());
        let summary = run(
            BlankSource::new(70),
            ScriptedDetector::new(walk_script()),
            &context,
            PipelineConfig::default(),
        )
        .unwrap();

        assert_eq!(summary.stop_reason, StopReason::EndOfStream);
        assert_eq!(summary.frames, 70);
        assert_eq!(summary.events, 1);
        assert_eq!(summary.stats.in_count(), 1);
        assert_eq!(context.state.stats().in_count(), 1);
        assert_eq!(context.state.stats().frames(), 70);

        let events = store.all();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].direction, Direction::In);

        // Frames 0, 10, ..., 60 were published
        let latest = context.state.latest_frame().unwrap();
        assert_eq!(latest.frame_id, 60);
    }

    #[test]
    fn test_transient_detector_failure_skips_frame() {
        let store = Arc::new(MemoryEventStore::new());
        let context = context(store.clone());
        let summary = run(
            BlankSource::new(70),
            ScriptedDetector::new(walk_script()).fail_on(60, ScriptedFailure::Transient),
            &context,
            PipelineConfig::default(),
        )
        .unwrap();
        assert_eq!(summary.skipped_frames, 1);
        assert_eq!(summary.frames, 69);
        assert_eq!(summary.events, 1);
    }

    #[test]
    fn test_fatal_detector_failure_stops() {
        let store = Arc::new(MemoryEventStore::new());
        let context = context(store);
        let err = run(
            BlankSource::new(70),
            ScriptedDetector::new(walk_script()).fail_on(5, ScriptedFailure::Fatal),
            &context,
            PipelineConfig::default(),
        )
        .unwrap_err();
        assert!(matches!(err, CounterError::DetectorFatal(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_read_errors_skipped_until_limit() {
        let store = Arc::new(MemoryEventStore::new());
        let context = context(store.clone());
        let summary = run(
            BlankSource::new(20).failing_at([3, 7]),
            ScriptedDetector::new(Vec::new()),
            &context,
            PipelineConfig::default(),
        )
        .unwrap();
        assert_eq!(summary.read_errors, 2);
        assert_eq!(summary.frames, 18);

        let config = PipelineConfig {
            max_consecutive_read_errors: 2,
            ..Default::default()
        };
        let err = run(
            BlankSource::new(20).failing_at(5..10),
            ScriptedDetector::new(Vec::new()),
            &context,
            config,
        )
        .unwrap_err();
        assert!(matches!(err, CounterError::PipelineError(_)));
    }

    #[test]
    fn test_frame_limit_and_stop() {
        let store = Arc::new(MemoryEventStore::new());
        let context = context(store);
        let config = PipelineConfig {
            max_frames: Some(12),
            ..Default::default()
        };
        let summary = run(BlankSource::new(100), ScriptedDetector::new(Vec::new()), &context, config).unwrap();
        assert_eq!(summary.stop_reason, StopReason::FrameLimit);
        assert_eq!(summary.frames, 12);

        let pipeline = CountingPipeline::spawn(
            Box::new(BlankSource::new(u64::MAX)),
            Box::new(ScriptedDetector::new(Vec::new())),
            processor(),
            context.clone(),
            PipelineConfig::default(),
        )
        .unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        pipeline.stop();
        let summary = pipeline.join().unwrap();
        assert_eq!(summary.stop_reason, StopReason::Stopped);
    }

    #[test]
    fn test_backfill_appends_to_store() {
        let store = MemoryEventStore::new();
        let mut source = BlankSource::new(70).failing_at([2]);
        let mut detector = ScriptedDetector::new(walk_script());
        let mut processor = processor();
        let report = backfill(
            &mut source,
            &mut detector,
            &mut processor,
            &line(),
            &store,
            &CancellationToken::new(),
        )
        .unwrap();
        assert_eq!(report.frames, 69);
        assert_eq!(report.skipped_frames, 1);
        assert_eq!(report.events, 1);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_backfill_cancelled() {
        let store = MemoryEventStore::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = backfill(
            &mut BlankSource::new(10),
            &mut ScriptedDetector::new(Vec::new()),
            &mut processor(),
            &line(),
            &store,
            &cancel,
        )
        .unwrap_err();
        assert!(matches!(err, CounterError::Cancelled));
        assert!(store.is_empty());
    }
}
