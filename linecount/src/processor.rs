//! Per-frame counting stage: postprocess, track, evaluate crossings
//!
//! The live pipeline, the tuning replays and backfill all run frames through a
//! [`FrameProcessor`], so offline scores describe exactly what the online path does.

use crate::crossing::{CrossingConfig, CrossingEngine};
use crate::error::{CounterError, Result};
use crate::line::CountingLine;
use crate::postprocessing::{PostprocessConfig, Postprocessor, RoiConfig, RoiFilter};
use crate::types::{CrossingEvent, RunningStats, TuningParams};
use chrono::{DateTime, Utc};
use ioutrack::{Detection, GreedyTracker, GreedyTrackerConfig, MultiObjectTracker, Track};

/// Everything needed to build a processor
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessorSettings {
    pub postprocess: PostprocessConfig,
    pub roi: RoiConfig,
    pub tracker: GreedyTrackerConfig,
    pub crossing: CrossingConfig,
}

impl ProcessorSettings {
    /// The tunable subset of the current settings
    pub fn params(&self) -> TuningParams {
        TuningParams {
            conf_thresh: self.postprocess.conf_thresh,
            affinity_threshold: self.tracker.affinity_threshold,
            min_displacement_px: self.crossing.min_displacement_px,
            min_box_area: self.postprocess.min_box_area,
        }
    }

    pub fn with_params(&self, params: &TuningParams) -> Self {
        let mut next = self.clone();
        next.postprocess.conf_thresh = params.conf_thresh;
        next.postprocess.min_box_area = params.min_box_area;
        next.tracker.affinity_threshold = params.affinity_threshold;
        next.crossing.min_displacement_px = params.min_displacement_px;
        next
    }
}

/// What one frame produced
#[derive(Debug, Default)]
pub struct FrameResult {
    pub events: Vec<CrossingEvent>,
    pub stats: RunningStats,
    /// Detections that survived postprocessing and the ROI band
    pub detections: usize,
    /// Detections dropped for lying outside the ROI band
    pub roi_dropped: usize,
    pub spawned: usize,
    /// Tracks removed this frame
    pub lost: Vec<Track>,
    pub suppressed_flips: u32,
    pub reversals: u32,
}

pub struct FrameProcessor {
    postprocessor: Postprocessor,
    roi: RoiFilter,
    tracker: Box<dyn MultiObjectTracker>,
    crossing: CrossingEngine,
}

impl FrameProcessor {
    pub fn new(settings: &ProcessorSettings) -> Result<Self> {
        let tracker = GreedyTracker::new(settings.tracker.clone())
            .map_err(|e| CounterError::config(format!("tracker: {}", e)))?;
        Ok(Self {
            postprocessor: Postprocessor::new(settings.postprocess.clone()),
            roi: RoiFilter::new(settings.roi.clone()),
            tracker: Box::new(tracker),
            crossing: CrossingEngine::new(settings.crossing.clone()),
        })
    }

    pub fn process(
        &mut self,
        raw: Vec<Detection>,
        line: &CountingLine,
        timestamp: DateTime<Utc>,
    ) -> FrameResult {
        // Step 1: filter detector output
        let detections = self.postprocessor.process(raw);

        // Step 2: keep the band around the current line
        let (detections, roi_dropped) = self.roi.apply(detections, line);

        // Step 3: associate into tracks
        let update = self.tracker.update(&detections);

        // Step 4: evaluate crossings on the updated tracks
        let outcome = self.crossing.process(self.tracker.tracks_mut(), line, timestamp);

        FrameResult {
            events: outcome.events,
            stats: outcome.stats,
            detections: detections.len(),
            roi_dropped,
            spawned: update.spawned.len(),
            lost: update.lost,
            suppressed_flips: outcome.suppressed_flips,
            reversals: outcome.reversals,
        }
    }

    pub fn tracks(&self) -> Box<dyn Iterator<Item = &Track> + '_> {
        self.tracker.tracks()
    }

    pub fn num_tracks(&self) -> usize {
        self.tracker.num_tracks()
    }

    pub fn stats(&self) -> RunningStats {
        self.crossing.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Direction;
    use chrono::Duration;
    use ioutrack::{Bbox, Side};
    use nalgebra::Point2;

    fn settings() -> ProcessorSettings {
        ProcessorSettings {
            postprocess: PostprocessConfig::default(),
            roi: RoiConfig::default(),
            tracker: GreedyTrackerConfig {
                max_misses: 3,
                ..Default::default()
            },
            crossing: CrossingConfig::default(),
        }
    }

    #[test]
    fn test_left_to_right_crossing_counts_in() {
        // Vertical line x = 320 pointing down: positive side is x < 320, so IN is the right.
        let line = CountingLine::new(
            Point2::new(320.0, 0.0),
            Point2::new(320.0, 480.0),
            Side::Negative,
        )
        .unwrap();
        let mut processor = FrameProcessor::new(&settings()).unwrap();
        let t0 = Utc::now();
        let mut stats = RunningStats::default();
        let mut events = Vec::new();

        // Enter on the left, walk right across the line, leave the frame
        for (i, x) in (0..=640).step_by(10).enumerate() {
            let t = t0 + Duration::milliseconds(i as i64 * 40);
            let det = Detection::new(Bbox::new(x as f32 - 20.0, 200.0, x as f32 + 20.0, 260.0), 0, 0.9, t);
            let result = processor.process(vec![det], &line, t);
            events.extend(result.events);
            stats = result.stats;
        }
        for i in 0..5 {
            let t = t0 + Duration::milliseconds(3000 + i * 40);
            stats = processor.process(Vec::new(), &line, t).stats;
        }

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].direction, Direction::In);
        assert_eq!(stats.in_count(), 1);
        assert_eq!(stats.out_count(), 0);
        assert_eq!(stats.net(), 1);
        assert_eq!(processor.num_tracks(), 0);
    }

    #[test]
    fn test_roi_band_follows_line_change() {
        let mut settings = settings();
        settings.roi = RoiConfig {
            enabled: true,
            band_height_px: 100.0,
            margin_px: 0.0,
            ..Default::default()
        };
        let mut processor = FrameProcessor::new(&settings).unwrap();
        let t = Utc::now();
        let at = |x: f32| Detection::new(Bbox::new(x - 10.0, 100.0, x + 10.0, 140.0), 0, 0.9, t);
        let vertical = |x: f32| {
            CountingLine::new(Point2::new(x, 0.0), Point2::new(x, 480.0), Side::Negative).unwrap()
        };

        // Three near x = 320, one far away
        let result = processor.process(vec![at(300.0), at(320.0), at(340.0), at(600.0)], &vertical(320.0), t);
        assert_eq!((result.detections, result.roi_dropped), (3, 1));

        // Once the line moves the band moves with it
        let result = processor.process(vec![at(580.0), at(600.0), at(620.0), at(320.0)], &vertical(600.0), t);
        assert_eq!((result.detections, result.roi_dropped), (3, 1));
    }

    #[test]
    fn test_with_params_round_trip() {
        let base = settings();
        let params = TuningParams {
            conf_thresh: 0.5,
            affinity_threshold: 0.2,
            min_displacement_px: 8.0,
            min_box_area: 100.0,
        };
        assert_eq!(base.with_params(&params).params(), params);
    }

    #[test]
    fn test_invalid_tracker_settings() {
        let mut bad = settings();
        bad.tracker.affinity_threshold = 2.0;
        assert!(matches!(
            FrameProcessor::new(&bad).err(),
            Some(CounterError::ConfigError(_))
        ));
    }
}
