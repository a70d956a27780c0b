//! Track record held in the tracker arena

use crate::bbox::Bbox;
use crate::detection::Detection;
use crate::history::PositionHistory;
use nalgebra::Point2;
use serde::{Deserialize, Serialize};

pub type TrackId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrackState {
    /// Followed and still eligible to produce a crossing
    Active,
    /// Has produced its crossing; still followed so it cannot respawn
    Counted,
    /// Unmatched past the miss budget; removed from the arena
    Lost,
}

/// Which half-plane of a counting line a point lies in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Positive,
    Negative,
}

impl Side {
    /// Side for a signed distance; `None` inside the dead zone
    pub fn from_distance(distance: f32, dead_zone: f32) -> Option<Self> {
        if !distance.is_finite() || distance.abs() <= dead_zone {
            None
        } else if distance > 0.0 {
            Some(Side::Positive)
        } else {
            Some(Side::Negative)
        }
    }
}

/// Side recorded at the last trusted evaluation, with where it was taken
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SideMark {
    pub side: Side,
    pub distance: f32,
    pub position: Point2<f32>,
}

#[derive(Debug, Clone)]
pub struct Track {
    pub id: TrackId,
    pub bbox: Bbox,
    pub class_id: u32,
    pub confidence: f32,
    pub state: TrackState,
    pub history: PositionHistory,
    /// Frames in which the track was matched, spawn included
    pub hits: u32,
    /// Consecutive unmatched frames
    pub misses: u32,
    pub line_side: Option<SideMark>,
}

impl Track {
    pub(crate) fn spawn(id: TrackId, detection: &Detection, history_len: usize) -> Self {
        let mut history = PositionHistory::new(history_len);
        history.push(detection.bbox.centroid(), detection.timestamp);
        Self {
            id,
            bbox: detection.bbox,
            class_id: detection.class_id,
            confidence: detection.confidence,
            state: TrackState::Active,
            history,
            hits: 1,
            misses: 0,
            line_side: None,
        }
    }

    pub(crate) fn observe(&mut self, detection: &Detection) {
        self.bbox = detection.bbox;
        self.confidence = detection.confidence;
        self.history.push(detection.bbox.centroid(), detection.timestamp);
        self.hits += 1;
        self.misses = 0;
    }

    pub fn centroid(&self) -> Point2<f32> {
        self.bbox.centroid()
    }

    /// True while the track may still be evaluated against the line
    pub fn is_active(&self) -> bool {
        self.state == TrackState::Active
    }

    /// Was this frame's position an observation (not a miss)
    pub fn matched_this_frame(&self) -> bool {
        self.misses == 0
    }

    /// Marks the track as having produced its single crossing
    pub fn mark_counted(&mut self) {
        if self.state == TrackState::Active {
            self.state = TrackState::Counted;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_side_dead_zone() {
        assert_eq!(Side::from_distance(5.0, 2.0), Some(Side::Positive));
        assert_eq!(Side::from_distance(-3.0, 2.0), Some(Side::Negative));
        assert_eq!(Side::from_distance(1.5, 2.0), None);
        assert_eq!(Side::from_distance(f32::NAN, 0.0), None);
    }

    #[test]
    fn test_counted_is_terminal() {
        let det = Detection::new(Bbox::new(0.0, 0.0, 10.0, 10.0), 0, 0.9, Utc::now());
        let mut track = Track::spawn(1, &det, 4);
        track.mark_counted();
        assert_eq!(track.state, TrackState::Counted);
        track.state = TrackState::Lost;
        track.mark_counted();
        assert_eq!(track.state, TrackState::Lost);
    }
}
