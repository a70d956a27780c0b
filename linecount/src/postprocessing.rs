//! Postprocessing of raw detector output before it reaches the tracker

use crate::line::CountingLine;
use ioutrack::{calculate_iou, Detection};
use nalgebra::Point2;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostprocessConfig {
    /// Confidence threshold for filtering detections
    pub conf_thresh: f32,
    /// NMS threshold for removing duplicate detections
    pub nms_thresh: f32,
    /// Maximum number of detections to return
    pub max_detections: usize,
    /// Classes to keep; empty keeps all
    pub class_filter: Vec<u32>,
    /// Boxes smaller than this (px²) are dropped
    pub min_box_area: f32,
}

impl Default for PostprocessConfig {
    fn default() -> Self {
        Self {
            conf_thresh: 0.35,
            nms_thresh: 0.45,
            max_detections: 100,
            class_filter: Vec::new(),
            min_box_area: 0.0,
        }
    }
}

/// Filters one frame's detections
#[derive(Debug, Clone)]
pub struct Postprocessor {
    config: PostprocessConfig,
}

impl Postprocessor {
    pub fn new(config: PostprocessConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PostprocessConfig {
        &self.config
    }

    pub fn process(&self, detections: Vec<Detection>) -> Vec<Detection> {
        let filtered = self.filter(detections);
        let mut kept = self.apply_nms(filtered);
        kept.truncate(self.config.max_detections);
        kept
    }

    fn filter(&self, detections: Vec<Detection>) -> Vec<Detection> {
        detections
            .into_iter()
            .filter(|det| det.confidence >= self.config.conf_thresh)
            .filter(|det| {
                self.config.class_filter.is_empty() || self.config.class_filter.contains(&det.class_id)
            })
            .filter(|det| det.bbox.area() >= self.config.min_box_area)
            .collect()
    }

    /// Class-aware NMS; output is sorted by descending confidence
    fn apply_nms(&self, mut detections: Vec<Detection>) -> Vec<Detection> {
        detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

        let mut keep: Vec<Detection> = Vec::with_capacity(detections.len());
        for det in detections {
            let suppressed = keep.iter().any(|k| {
                k.class_id == det.class_id && calculate_iou(&k.bbox, &det.bbox) > self.config.nms_thresh
            });
            if !suppressed {
                keep.push(det);
            }
        }
        keep
    }
}

/// Band around the counting line outside which detections are ignored
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoiConfig {
    pub enabled: bool,
    /// Full width of the band, centred on the line
    pub band_height_px: f32,
    /// Extra room added on both sides of the band
    pub margin_px: f32,
    /// Clipped share of detections above which masking is suspended
    pub max_clip_ratio: f32,
    /// Frames masking stays suspended once the clip ratio is exceeded
    pub skip_frames: u32,
}

impl Default for RoiConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            band_height_px: 240.0,
            margin_px: 40.0,
            max_clip_ratio: 0.3,
            skip_frames: 30,
        }
    }
}

/// Drops detections whose centre lies outside the band around the line.
///
/// The band follows the line it is given: a new line re-centres it and clears
/// the clipping history. When too many detections would be clipped the band is
/// probably too tight for the scene, so masking pauses for `skip_frames`.
#[derive(Debug, Clone)]
pub struct RoiFilter {
    config: RoiConfig,
    line: Option<CountingLine>,
    seen: u64,
    clipped: u64,
    skip_remaining: u32,
}

impl RoiFilter {
    pub fn new(config: RoiConfig) -> Self {
        Self {
            config,
            line: None,
            seen: 0,
            clipped: 0,
            skip_remaining: 0,
        }
    }

    pub fn config(&self) -> &RoiConfig {
        &self.config
    }

    /// Half-width of the band including the margin
    pub fn reach(&self) -> f32 {
        self.config.band_height_px / 2.0 + self.config.margin_px
    }

    pub fn set_line(&mut self, line: &CountingLine) {
        self.line = Some(*line);
        self.seen = 0;
        self.clipped = 0;
        self.skip_remaining = 0;
        log::debug!(
            "ROI band re-centred on ({:.0},{:.0})-({:.0},{:.0}), reach {:.0}px",
            line.start.x,
            line.start.y,
            line.end.x,
            line.end.y,
            self.reach()
        );
    }

    /// True when detections are currently being masked
    pub fn is_masking(&self) -> bool {
        self.config.enabled && self.skip_remaining == 0
    }

    pub fn contains(&self, point: &Point2<f32>) -> bool {
        match &self.line {
            Some(line) => line.signed_distance(point).abs() <= self.reach(),
            None => true,
        }
    }

    /// Filter one frame against the band around `line`; returns the kept
    /// detections and how many were dropped
    pub fn apply(&mut self, detections: Vec<Detection>, line: &CountingLine) -> (Vec<Detection>, usize) {
        if !self.config.enabled {
            return (detections, 0);
        }
        if self.line.as_ref() != Some(line) {
            self.set_line(line);
        }
        if self.skip_remaining > 0 {
            self.skip_remaining -= 1;
            if self.skip_remaining == 0 {
                log::info!("ROI masking resumed");
            }
            return (detections, 0);
        }

        let total = detections.len();
        let (kept, outside): (Vec<Detection>, Vec<Detection>) = detections
            .into_iter()
            .partition(|det| self.contains(&det.bbox.centroid()));
        self.seen += total as u64;
        self.clipped += outside.len() as u64;

        if self.seen > 0 && self.clipped as f32 / self.seen as f32 > self.config.max_clip_ratio {
            log::warn!(
                "ROI band clips {}/{} detections, masking off for {} frames",
                self.clipped,
                self.seen,
                self.config.skip_frames
            );
            self.skip_remaining = self.config.skip_frames;
            self.seen = 0;
            self.clipped = 0;
            let mut all = kept;
            all.extend(outside);
            return (all, 0);
        }
        let dropped = outside.len();
        (kept, dropped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use ioutrack::Bbox;

    fn det(x: f32, class_id: u32, confidence: f32) -> Detection {
        Detection::new(Bbox::new(x, 0.0, x + 20.0, 20.0), class_id, confidence, Utc::now())
    }

    #[test]
    fn test_confidence_filtering() {
        let pp = Postprocessor::new(PostprocessConfig {
            conf_thresh: 0.5,
            ..Default::default()
        });
        let out = pp.process(vec![det(0.0, 0, 0.6), det(100.0, 0, 0.3)]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].confidence, 0.6);
    }

    #[test]
    fn test_nms_is_class_aware() {
        let pp = Postprocessor::new(PostprocessConfig::default());
        let out = pp.process(vec![det(0.0, 0, 0.9), det(2.0, 0, 0.8), det(2.0, 1, 0.7)]);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].confidence, 0.9);
        assert_eq!(out[1].class_id, 1);
    }

    #[test]
    fn test_class_filter_and_area() {
        let pp = Postprocessor::new(PostprocessConfig {
            class_filter: vec![2],
            min_box_area: 500.0,
            ..Default::default()
        });
        let small = Detection::new(Bbox::new(0.0, 0.0, 10.0, 10.0), 2, 0.9, Utc::now());
        let out = pp.process(vec![det(0.0, 1, 0.9), det(100.0, 2, 0.9), small]);
        assert!(out.is_empty());

        let pp = Postprocessor::new(PostprocessConfig {
            class_filter: vec![2],
            ..Default::default()
        });
        assert_eq!(pp.process(vec![det(0.0, 1, 0.9), det(100.0, 2, 0.9)]).len(), 1);
    }

    fn roi_line() -> CountingLine {
        CountingLine::new(Point2::new(0.0, 300.0), Point2::new(640.0, 300.0), ioutrack::Side::Negative).unwrap()
    }

    fn at(y: f32) -> Detection {
        Detection::new(Bbox::new(100.0, y - 10.0, 120.0, y + 10.0), 0, 0.9, Utc::now())
    }

    fn roi(skip_frames: u32) -> RoiFilter {
        RoiFilter::new(RoiConfig {
            enabled: true,
            band_height_px: 100.0,
            margin_px: 20.0,
            max_clip_ratio: 0.3,
            skip_frames,
        })
    }

    #[test]
    fn test_roi_disabled_passes_everything() {
        let mut filter = RoiFilter::new(RoiConfig::default());
        let (kept, dropped) = filter.apply(vec![at(0.0), at(300.0)], &roi_line());
        assert_eq!((kept.len(), dropped), (2, 0));
        assert!(!filter.is_masking());
    }

    #[test]
    fn test_roi_keeps_band_around_line() {
        let mut filter = roi(30);
        assert_eq!(filter.reach(), 70.0);
        // 4 inside, 1 outside: 20% clipped stays under the limit
        let dets = vec![at(240.0), at(290.0), at(310.0), at(365.0), at(500.0)];
        let (kept, dropped) = filter.apply(dets, &roi_line());
        assert_eq!(dropped, 1);
        assert!(kept.iter().all(|d| (d.bbox.centroid().y - 300.0).abs() <= 70.0));
        assert!(filter.is_masking());
    }

    #[test]
    fn test_roi_heavy_clipping_suspends_masking() {
        let mut filter = roi(3);
        let line = roi_line();
        // 1 of 2 clipped: over the 30% limit, so this frame already passes through
        let (kept, dropped) = filter.apply(vec![at(300.0), at(20.0)], &line);
        assert_eq!((kept.len(), dropped), (2, 0));
        assert!(!filter.is_masking());

        for _ in 0..3 {
            let (kept, _) = filter.apply(vec![at(300.0), at(20.0)], &line);
            assert_eq!(kept.len(), 2);
        }
        assert!(filter.is_masking());
        let (kept, dropped) = filter.apply(vec![at(300.0), at(310.0), at(290.0), at(20.0)], &line);
        assert_eq!((kept.len(), dropped), (3, 1));
    }

    #[test]
    fn test_roi_follows_new_line() {
        let mut filter = roi(30);
        let (_, dropped) = filter.apply(vec![at(300.0)], &roi_line());
        assert_eq!(dropped, 0);

        let moved =
            CountingLine::new(Point2::new(0.0, 100.0), Point2::new(640.0, 100.0), ioutrack::Side::Negative).unwrap();
        let dets = vec![at(100.0), at(120.0), at(90.0), at(300.0)];
        let (kept, dropped) = filter.apply(dets, &moved);
        assert_eq!(dropped, 1);
        assert!(kept.iter().all(|d| d.bbox.centroid().y < 200.0));
    }

    #[test]
    fn test_max_detections() {
        let pp = Postprocessor::new(PostprocessConfig {
            max_detections: 2,
            ..Default::default()
        });
        let dets = (0..5).map(|i| det(i as f32 * 50.0, 0, 0.5 + i as f32 * 0.1)).collect();
        let out = pp.process(dets);
        assert_eq!(out.len(), 2);
        assert!(out[0].confidence > out[1].confidence);
    }
}
