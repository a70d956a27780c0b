//! Line-crossing state machine and running counters
//!
//! Each evaluated track carries the side of the line it was last seen on. A
//! trusted change of side on an Active track emits one [`CrossingEvent`] and moves
//! the track to Counted, after which it can never emit again.

use crate::line::CountingLine;
use crate::types::{CrossingEvent, RunningStats};
use chrono::{DateTime, Utc};
use ioutrack::{Side, SideMark, Track, TrackState};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Crossing policy knobs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CrossingConfig {
    /// Centroids closer than this to the line keep the previously recorded side
    pub dead_zone_px: f32,
    /// Perpendicular travel required between side updates before a flip is trusted
    pub min_displacement_px: f32,
    /// Matched frames a track needs before it may be counted
    pub min_visible_frames: u32,
    /// Only count moves that pass through the finite segment
    pub require_segment_overlap: bool,
    /// Frames in the FPS moving average
    pub fps_window: usize,
}

impl Default for CrossingConfig {
    fn default() -> Self {
        Self {
            dead_zone_px: 2.0,
            min_displacement_px: 4.0,
            min_visible_frames: 1,
            require_segment_overlap: true,
            fps_window: 30,
        }
    }
}

/// Moving-average frame rate over the last N arrival timestamps
#[derive(Debug, Clone)]
pub struct FpsMeter {
    window: VecDeque<DateTime<Utc>>,
    capacity: usize,
}

impl FpsMeter {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(2);
        Self {
            window: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn tick(&mut self, timestamp: DateTime<Utc>) -> f32 {
        if self.window.len() == self.capacity {
            self.window.pop_front();
        }
        self.window.push_back(timestamp);
        self.fps()
    }

    pub fn fps(&self) -> f32 {
        match (self.window.front(), self.window.back()) {
            (Some(first), Some(last)) if self.window.len() > 1 => {
                let secs = (*last - *first).num_microseconds().unwrap_or(0) as f32 / 1e6;
                if secs > 0.0 {
                    (self.window.len() - 1) as f32 / secs
                } else {
                    0.0
                }
            }
            _ => 0.0,
        }
    }
}

/// Result of evaluating one frame
#[derive(Debug, Clone, Default)]
pub struct CrossingOutcome {
    pub events: Vec<CrossingEvent>,
    pub stats: RunningStats,
    /// Side flips rejected for insufficient displacement
    pub suppressed_flips: u32,
    /// Side flips by tracks that were already counted
    pub reversals: u32,
}

enum Verdict {
    Hold,
    Crossed(Side),
    Suppressed,
    Reversal,
}

pub struct CrossingEngine {
    config: CrossingConfig,
    stats: RunningStats,
    fps: FpsMeter,
    last_line: Option<CountingLine>,
}

impl CrossingEngine {
    pub fn new(config: CrossingConfig) -> Self {
        let fps = FpsMeter::new(config.fps_window);
        Self {
            config,
            stats: RunningStats::default(),
            fps,
            last_line: None,
        }
    }

    pub fn config(&self) -> &CrossingConfig {
        &self.config
    }

    pub fn stats(&self) -> RunningStats {
        self.stats
    }

    /// Most recent earlier position that was clear of the dead zone
    fn seed_mark(&self, track: &Track, line: &CountingLine) -> Option<SideMark> {
        track.history.iter().rev().skip(1).find_map(|p| {
            let distance = line.signed_distance(p);
            Side::from_distance(distance, self.config.dead_zone_px).map(|side| SideMark {
                side,
                distance,
                position: *p,
            })
        })
    }

    fn evaluate(&self, track: &mut Track, line: &CountingLine) -> Verdict {
        if track.state == TrackState::Lost
            || !track.matched_this_frame()
            || track.history.len() < 2
        {
            return Verdict::Hold;
        }

        let position = track.centroid();
        let distance = line.signed_distance(&position);
        let side = match Side::from_distance(distance, self.config.dead_zone_px) {
            Some(side) => side,
            None => return Verdict::Hold,
        };
        let here = SideMark {
            side,
            distance,
            position,
        };

        let mark = match track.line_side.or_else(|| self.seed_mark(track, line)) {
            Some(mark) => mark,
            None => {
                track.line_side = Some(here);
                return Verdict::Hold;
            }
        };

        if mark.side == side {
            track.line_side = Some(here);
            return Verdict::Hold;
        }

        if (distance - mark.distance).abs() < self.config.min_displacement_px {
            return Verdict::Suppressed;
        }

        track.line_side = Some(here);

        if track.state == TrackState::Counted {
            return Verdict::Reversal;
        }
        if self.config.require_segment_overlap && !line.crosses_segment(&mark.position, &position)
        {
            return Verdict::Hold;
        }
        if track.hits < self.config.min_visible_frames {
            return Verdict::Hold;
        }
        Verdict::Crossed(side)
    }

    /// Evaluate all tracks for this frame against `line`
    pub fn process<'a, I>(
        &mut self,
        tracks: I,
        line: &CountingLine,
        timestamp: DateTime<Utc>,
    ) -> CrossingOutcome
    where
        I: IntoIterator<Item = &'a mut Track>,
    {
        let line_changed = self.last_line.as_ref() != Some(line);
        if line_changed {
            if self.last_line.is_some() {
                log::info!(
                    "Counting line changed to ({:.0},{:.0})-({:.0},{:.0}), resetting track sides",
                    line.start.x,
                    line.start.y,
                    line.end.x,
                    line.end.y
                );
            }
            self.last_line = Some(*line);
        }

        let mut outcome = CrossingOutcome::default();
        for track in tracks {
            if line_changed {
                track.line_side = None;
            }
            match self.evaluate(track, line) {
                Verdict::Hold => {}
                Verdict::Suppressed => outcome.suppressed_flips += 1,
                Verdict::Reversal => outcome.reversals += 1,
                Verdict::Crossed(side) => {
                    let direction = line.direction_for(side);
                    track.mark_counted();
                    self.stats = self.stats.with_event(direction);
                    log::info!(
                        "Track {} crossed {:?} (in={}, out={}, net={})",
                        track.id,
                        direction,
                        self.stats.in_count(),
                        self.stats.out_count(),
                        self.stats.net()
                    );
                    outcome.events.push(CrossingEvent {
                        track_id: track.id,
                        direction,
                        timestamp,
                        bbox: track.bbox,
                        class_id: track.class_id,
                        confidence: track.confidence,
                    });
                }
            }
        }

        let fps = self.fps.tick(timestamp);
        self.stats = self.stats.with_frame(fps);
        outcome.stats = self.stats;
        outcome
    }
}
