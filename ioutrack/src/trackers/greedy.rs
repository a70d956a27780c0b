//! Greedy IoU association tracker
//!
//! Candidate (track, detection) pairs above the affinity threshold are ranked by
//! IoU, then detection confidence, then track id, and accepted greedily while both
//! sides are still free. The association is computed in full before the arena is
//! touched, so spawning and removal never happen mid-scan.

use crate::bbox::{ious, Bbox};
use crate::detection::Detection;
use crate::track::{Track, TrackId, TrackState};
use std::collections::BTreeMap;

/// Greedy tracker configuration
#[derive(Debug, Clone, PartialEq)]
pub struct GreedyTrackerConfig {
    /// Minimum IoU for a detection to continue a track
    pub affinity_threshold: f32,
    /// Consecutive unmatched frames tolerated before a track is Lost
    pub max_misses: u32,
    /// Positions retained per track
    pub history_len: usize,
    /// Unmatched detections below this confidence do not spawn tracks
    pub min_spawn_confidence: f32,
    /// Only associate detections with tracks of the same class
    pub class_aware: bool,
}

impl Default for GreedyTrackerConfig {
    fn default() -> Self {
        Self {
            affinity_threshold: 0.3,
            max_misses: 30,
            history_len: 16,
            min_spawn_confidence: 0.0,
            class_aware: true,
        }
    }
}

/// Outcome of one association pass
#[derive(Debug, Default)]
pub struct TrackUpdate {
    pub matched: Vec<(TrackId, usize)>,
    pub spawned: Vec<TrackId>,
    /// Tracks removed this frame, in their final (Lost) state
    pub lost: Vec<Track>,
    /// Detections dropped as malformed
    pub rejected: usize,
}

/// Association computed before anything in the arena changes
#[derive(Debug, Default)]
struct AssociationPlan {
    matches: Vec<(TrackId, usize)>,
    unmatched_tracks: Vec<TrackId>,
    unmatched_detections: Vec<usize>,
}

#[derive(Debug, Clone)]
pub struct GreedyTracker {
    config: GreedyTrackerConfig,
    next_track_id: TrackId,
    tracks: BTreeMap<TrackId, Track>,
    n_steps: u64,
}

impl GreedyTracker {
    pub fn new(config: GreedyTrackerConfig) -> anyhow::Result<Self> {
        anyhow::ensure!(
            (0.0..=1.0).contains(&config.affinity_threshold),
            "affinity_threshold must be in [0, 1], got {}",
            config.affinity_threshold
        );
        anyhow::ensure!(config.history_len >= 2, "history_len must be at least 2");
        Ok(Self {
            config,
            next_track_id: 1,
            tracks: BTreeMap::new(),
            n_steps: 0,
        })
    }

    pub fn config(&self) -> &GreedyTrackerConfig {
        &self.config
    }

    pub fn get(&self, id: TrackId) -> Option<&Track> {
        self.tracks.get(&id)
    }

    fn plan(&self, detections: &[Detection], valid: &[usize]) -> AssociationPlan {
        let track_ids: Vec<TrackId> = self.tracks.keys().copied().collect();
        let track_boxes: Vec<Bbox> = self.tracks.values().map(|t| t.bbox).collect();
        let det_boxes: Vec<Bbox> = valid.iter().map(|&i| detections[i].bbox).collect();
        let matrix = ious(&track_boxes, &det_boxes);

        let mut candidates = Vec::new();
        for (ti, track) in self.tracks.values().enumerate() {
            for (dj, &det_idx) in valid.iter().enumerate() {
                let det = &detections[det_idx];
                if self.config.class_aware && det.class_id != track.class_id {
                    continue;
                }
                let iou = matrix[ti * det_boxes.len() + dj];
                if iou >= self.config.affinity_threshold && iou > 0.0 {
                    candidates.push((iou, det.confidence, track.id, det_idx));
                }
            }
        }

        candidates.sort_by(|a, b| {
            b.0.total_cmp(&a.0)
                .then_with(|| b.1.total_cmp(&a.1))
                .then_with(|| a.2.cmp(&b.2))
                .then_with(|| a.3.cmp(&b.3))
        });

        let mut track_taken = BTreeMap::new();
        let mut det_taken = vec![false; detections.len()];
        let mut plan = AssociationPlan::default();
        for (_, _, track_id, det_idx) in candidates {
            if det_taken[det_idx] || track_taken.contains_key(&track_id) {
                continue;
            }
            det_taken[det_idx] = true;
            track_taken.insert(track_id, det_idx);
            plan.matches.push((track_id, det_idx));
        }

        plan.unmatched_tracks = track_ids
            .into_iter()
            .filter(|id| !track_taken.contains_key(id))
            .collect();
        plan.unmatched_detections = valid.iter().copied().filter(|&i| !det_taken[i]).collect();
        plan
    }

    /// Main update function
    pub fn update(&mut self, detections: &[Detection]) -> TrackUpdate {
        let mut update = TrackUpdate::default();

        // Step 1: Drop malformed detections
        let valid: Vec<usize> = (0..detections.len())
            .filter(|&i| detections[i].is_valid())
            .collect();
        update.rejected = detections.len() - valid.len();
        if update.rejected > 0 {
            log::debug!("Rejected {} malformed detections", update.rejected);
        }

        // Step 2: Associate against the current arena
        let plan = self.plan(detections, &valid);

        // Step 3: Apply matches
        for &(track_id, det_idx) in &plan.matches {
            if let Some(track) = self.tracks.get_mut(&track_id) {
                track.observe(&detections[det_idx]);
            }
        }
        update.matched = plan.matches;

        // Step 4: Age unmatched tracks, retire the ones past their budget
        for track_id in plan.unmatched_tracks {
            let expired = match self.tracks.get_mut(&track_id) {
                Some(track) => {
                    track.misses += 1;
                    track.misses > self.config.max_misses
                }
                None => false,
            };
            if expired {
                if let Some(mut track) = self.tracks.remove(&track_id) {
                    track.state = TrackState::Lost;
                    update.lost.push(track);
                }
            }
        }

        // Step 5: Spawn tracks from unmatched detections
        for det_idx in plan.unmatched_detections {
            let det = &detections[det_idx];
            if det.confidence < self.config.min_spawn_confidence {
                continue;
            }
            let id = self.next_track_id;
            self.next_track_id += 1;
            self.tracks
                .insert(id, Track::spawn(id, det, self.config.history_len));
            update.spawned.push(id);
        }

        // Step 6: Increment step counter
        self.n_steps += 1;

        update
    }

    pub fn clear_tracks(&mut self) {
        self.tracks.clear();
        self.next_track_id = 1;
        self.n_steps = 0;
    }
}

impl super::MultiObjectTracker for GreedyTracker {
    fn update(&mut self, detections: &[Detection]) -> TrackUpdate {
        GreedyTracker::update(self, detections)
    }

    fn tracks(&self) -> Box<dyn Iterator<Item = &Track> + '_> {
        Box::new(self.tracks.values())
    }

    fn tracks_mut(&mut self) -> Box<dyn Iterator<Item = &mut Track> + '_> {
        Box::new(self.tracks.values_mut())
    }

    fn clear_tracks(&mut self) {
        GreedyTracker::clear_tracks(self)
    }

    fn num_tracks(&self) -> usize {
        self.tracks.len()
    }

    fn step_count(&self) -> u64 {
        self.n_steps
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trackers::MultiObjectTracker;
    use approx::assert_abs_diff_eq;
    use chrono::{DateTime, Duration, Utc};

    fn det(x: f32, y: f32, conf: f32, t: DateTime<Utc>) -> Detection {
        Detection::new(Bbox::from_xywh(x, y, 20.0, 20.0), 0, conf, t)
    }

    fn tracker() -> GreedyTracker {
        GreedyTracker::new(GreedyTrackerConfig {
            max_misses: 2,
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_spawn_and_follow() {
        let t0 = Utc::now();
        let mut tracker = tracker();
        let first = tracker.update(&[det(0.0, 0.0, 0.9, t0)]);
        assert_eq!(first.spawned, vec![1]);

        for i in 1..5 {
            let t = t0 + Duration::milliseconds(i * 33);
            let step = tracker.update(&[det(i as f32 * 3.0, 0.0, 0.9, t)]);
            assert!(step.spawned.is_empty());
            assert_eq!(step.matched, vec![(1, 0)]);
        }

        let track = tracker.get(1).unwrap();
        assert_eq!(track.hits, 5);
        assert_eq!(track.history.len(), 5);
        assert_abs_diff_eq!(track.centroid().x, 22.0, epsilon = 1e-4);
        assert_eq!(tracker.step_count(), 5);
    }

    #[test]
    fn test_empty_frames_age_tracks_until_lost() {
        let t0 = Utc::now();
        let mut tracker = tracker();
        tracker.update(&[det(0.0, 0.0, 0.9, t0)]);

        assert!(tracker.update(&[]).lost.is_empty());
        assert!(tracker.update(&[]).lost.is_empty());
        let gone = tracker.update(&[]);
        assert_eq!(gone.lost.len(), 1);
        assert_eq!(gone.lost[0].state, TrackState::Lost);
        assert_eq!(tracker.num_tracks(), 0);
    }

    #[test]
    fn test_higher_confidence_wins_equal_overlap() {
        let t0 = Utc::now();
        let mut tracker = tracker();
        tracker.update(&[det(10.0, 0.0, 0.9, t0)]);

        // Shifted symmetrically, so both overlap track 1 equally
        let left = det(6.0, 0.0, 0.6, t0);
        let right = det(14.0, 0.0, 0.8, t0);
        let step = tracker.update(&[left, right]);
        assert_eq!(step.matched, vec![(1, 1)]);
        assert_eq!(step.spawned, vec![2]);
    }

    #[test]
    fn test_lower_track_id_wins_equal_overlap() {
        let t0 = Utc::now();
        let mut tracker = tracker();
        tracker.update(&[det(0.0, 0.0, 0.9, t0), det(0.0, 0.0, 0.9, t0)]);
        assert_eq!(tracker.num_tracks(), 2);

        let step = tracker.update(&[det(0.0, 0.0, 0.9, t0)]);
        assert_eq!(step.matched, vec![(1, 0)]);
        assert_eq!(tracker.get(2).unwrap().misses, 1);
    }

    #[test]
    fn test_malformed_detections_rejected() {
        let t0 = Utc::now();
        let mut tracker = tracker();
        let bad = Detection::new(Bbox::new(f32::INFINITY, 1.5, 12.6, 25.0), 0, 0.9, t0);
        let step = tracker.update(&[bad]);
        assert_eq!(step.rejected, 1);
        assert_eq!(tracker.num_tracks(), 0);
    }

    #[test]
    fn test_class_aware_association() {
        let t0 = Utc::now();
        let mut tracker = tracker();
        tracker.update(&[det(0.0, 0.0, 0.9, t0)]);
        let mut other = det(0.0, 0.0, 0.9, t0);
        other.class_id = 7;
        let step = tracker.update(&[other]);
        assert!(step.matched.is_empty());
        assert_eq!(step.spawned, vec![2]);
    }

    #[test]
    fn test_counted_tracks_keep_matching() {
        let t0 = Utc::now();
        let mut tracker = tracker();
        tracker.update(&[det(0.0, 0.0, 0.9, t0)]);
        for track in tracker.tracks_mut() {
            track.mark_counted();
        }
        let step = tracker.update(&[det(2.0, 0.0, 0.9, t0)]);
        assert_eq!(step.matched, vec![(1, 0)]);
        assert!(step.spawned.is_empty());
        assert_eq!(tracker.get(1).unwrap().state, TrackState::Counted);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = GreedyTrackerConfig {
            affinity_threshold: 1.5,
            ..Default::default()
        };
        assert!(GreedyTracker::new(config).is_err());
    }
}
