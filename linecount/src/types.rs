//! Value types shared across the counting engine

use chrono::{DateTime, Utc};
use image::RgbImage;
use ioutrack::{Bbox, TrackId};
use serde::{Deserialize, Serialize};

use crate::line::CountingLine;

/// One decoded frame from a frame source
#[derive(Debug, Clone)]
pub struct Frame {
    pub frame_id: u64,
    pub image: RgbImage,
    pub timestamp: DateTime<Utc>,
}

impl Frame {
    pub fn new(frame_id: u64, image: RgbImage, timestamp: DateTime<Utc>) -> Self {
        Self {
            frame_id,
            image,
            timestamp,
        }
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }
}

/// Counted traversal direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    In,
    Out,
}

/// A counted traversal; immutable once emitted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrossingEvent {
    pub track_id: TrackId,
    pub direction: Direction,
    pub timestamp: DateTime<Utc>,
    pub bbox: Bbox,
    pub class_id: u32,
    pub confidence: f32,
}

/// Live counters. `net` moves together with `in`/`out` in every mutation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct RunningStats {
    #[serde(rename = "in")]
    in_count: u64,
    #[serde(rename = "out")]
    out_count: u64,
    net: i64,
    fps: f32,
    frames: u64,
}

impl RunningStats {
    /// Snapshot after counting one more event
    pub fn with_event(&self, direction: Direction) -> Self {
        let mut next = *self;
        match direction {
            Direction::In => {
                next.in_count += 1;
                next.net += 1;
            }
            Direction::Out => {
                next.out_count += 1;
                next.net -= 1;
            }
        }
        next
    }

    /// Snapshot after one more frame at the given frame rate
    pub fn with_frame(&self, fps: f32) -> Self {
        Self {
            fps,
            frames: self.frames + 1,
            ..*self
        }
    }

    pub fn in_count(&self) -> u64 {
        self.in_count
    }

    pub fn out_count(&self) -> u64 {
        self.out_count
    }

    pub fn net(&self) -> i64 {
        self.net
    }

    pub fn fps(&self) -> f32 {
        self.fps
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }
}

/// Where a calibration candidate came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateSource {
    Hough,
    FlowNormal,
}

/// Per-term contributions to a candidate's score, each in [0, 1]
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub traffic: f32,
    pub alignment: f32,
    pub length: f32,
    pub centrality: f32,
}

/// Candidate counting line produced by auto-calibration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationProposal {
    pub line: CountingLine,
    /// In [0, 1]
    pub confidence: f32,
    pub source: CandidateSource,
    pub breakdown: ScoreBreakdown,
}

/// One batch of proposals, sorted by descending confidence
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProposalBatch {
    pub proposals: Vec<CalibrationProposal>,
    pub generated_at: Option<DateTime<Utc>>,
    pub tracks_observed: usize,
}

impl ProposalBatch {
    pub fn is_empty(&self) -> bool {
        self.proposals.is_empty()
    }

    pub fn top(&self) -> Option<&CalibrationProposal> {
        self.proposals.first()
    }
}

/// Latest drift assessment
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DriftSnapshot {
    pub ssim: f32,
    pub edge_iou: f32,
    pub brightness_var: f32,
    /// Weighted blend of the three metrics, 0 = identical scene
    pub drift_score: f32,
    pub camera_shifted: bool,
    pub lighting_bad: bool,
    pub timestamp: DateTime<Utc>,
}

impl DriftSnapshot {
    pub fn is_drifting(&self) -> bool {
        self.camera_shifted || self.lighting_bad
    }
}

/// Tunable detector/tracker/crossing parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TuningParams {
    pub conf_thresh: f32,
    pub affinity_threshold: f32,
    pub min_displacement_px: f32,
    pub min_box_area: f32,
}

/// A persisted parameter override set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TuningProfile {
    pub params: TuningParams,
    /// Instability score on the clip it was chosen from; lower is better
    pub score: f64,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_net_tracks_in_minus_out() {
        let sequence = [
            Direction::In,
            Direction::In,
            Direction::Out,
            Direction::In,
            Direction::Out,
            Direction::Out,
            Direction::Out,
        ];
        let mut stats = RunningStats::default();
        for dir in sequence {
            stats = stats.with_event(dir);
            assert_eq!(stats.net(), stats.in_count() as i64 - stats.out_count() as i64);
        }
        assert_eq!(stats.in_count(), 3);
        assert_eq!(stats.out_count(), 4);
        assert_eq!(stats.net(), -1);
    }

    #[test]
    fn test_frame_update_keeps_counts() {
        let stats = RunningStats::default().with_event(Direction::In).with_frame(29.5);
        assert_eq!(stats.in_count(), 1);
        assert_eq!(stats.frames(), 1);
        assert_eq!(stats.fps(), 29.5);
    }

    #[test]
    fn test_stats_serialize_with_short_names() {
        let stats = RunningStats::default().with_event(Direction::Out);
        let json = serde_json::to_value(stats).unwrap();
        assert_eq!(json["in"], 0);
        assert_eq!(json["out"], 1);
        assert_eq!(json["net"], -1);
    }
}
