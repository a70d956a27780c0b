//! Multi-object tracking implementations
//!
//! Trackers own an arena of [`Track`]s keyed by id. Callers feed one frame of
//! detections at a time and read (or annotate) the resulting tracks through the
//! [`MultiObjectTracker`] trait.

use crate::detection::Detection;
use crate::track::Track;

mod greedy;

pub use greedy::{GreedyTracker, GreedyTrackerConfig, TrackUpdate};

/// Common interface for multi-object trackers
pub trait MultiObjectTracker: Send {
    /// Associate one frame of detections with the current tracks.
    ///
    /// An empty slice is a normal frame: every track goes unmatched.
    fn update(&mut self, detections: &[Detection]) -> TrackUpdate;

    /// Live tracks in ascending id order
    fn tracks(&self) -> Box<dyn Iterator<Item = &Track> + '_>;

    /// Mutable access for downstream stages that annotate tracks (side of line, state)
    fn tracks_mut(&mut self) -> Box<dyn Iterator<Item = &mut Track> + '_>;

    /// Drop every track and restart ids at 1
    fn clear_tracks(&mut self);

    fn num_tracks(&self) -> usize;

    /// Frames processed since creation or the last clear
    fn step_count(&self) -> u64;
}
