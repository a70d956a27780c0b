//! Pure Rust IoU-based tracking library
//!
//! Detections are associated into persistent tracks with a deterministic greedy
//! IoU matcher. Each track keeps a short ring buffer of centroids, enough for a
//! direction vector and a side-of-line test downstream.
//!
//! ```rust,ignore
//! use ioutrack::{Bbox, Detection, GreedyTracker, GreedyTrackerConfig, MultiObjectTracker};
//!
//! let mut tracker: Box<dyn MultiObjectTracker> =
//!     Box::new(GreedyTracker::new(GreedyTrackerConfig::default())?);
//! let det = Detection::new(Bbox::new(10.0, 10.0, 50.0, 50.0), 0, 0.9, chrono::Utc::now());
//! let update = tracker.update(&[det]);
//! ```

pub mod bbox;
pub mod detection;
pub mod history;
pub mod track;
pub mod trackers;

pub use bbox::{calculate_iou, Bbox};
pub use detection::Detection;
pub use history::PositionHistory;
pub use track::{Side, SideMark, Track, TrackId, TrackState};
pub use trackers::{GreedyTracker, GreedyTrackerConfig, MultiObjectTracker, TrackUpdate};
