//! Counting-line auto-calibration
//!
//! During a warm-up window the pipeline feeds every frame and its tracks into a
//! [`MotionEvidence`] accumulator:
//! - a displacement-weighted motion heatmap on a coarse grid
//! - a per-cell flow axis (double-angle average, so two-way traffic reinforces)
//! - per-track trajectories
//! - a running mean of the grayscale scene
//!
//! At the end of the window [`AutoCalibrator::propose`] builds candidate segments
//! from a Canny + Hough pass over the mean scene plus lines normal to the
//! dominant flow, scores them, and returns the best few.

use crate::cancel::CancellationToken;
use crate::line::CountingLine;
use crate::types::{CalibrationProposal, CandidateSource, Frame, ProposalBatch, ScoreBreakdown};
use chrono::{DateTime, Utc};
use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender};
use image::{GrayImage, Luma};
use imageproc::edges::canny;
use imageproc::hough::{detect_lines, LineDetectionOptions};
use ioutrack::{Side, Track, TrackId};
use nalgebra::{Point2, Vector2};
use ndarray::Array2;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Relative weight of each scoring term
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoreWeights {
    pub traffic: f32,
    pub alignment: f32,
    pub length: f32,
    pub centrality: f32,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            traffic: 0.45,
            alignment: 0.25,
            length: 0.15,
            centrality: 0.15,
        }
    }
}

impl ScoreWeights {
    fn total(&self) -> f32 {
        self.traffic + self.alignment + self.length + self.centrality
    }
}

/// Auto-calibration configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoCalConfig {
    pub enabled: bool,
    /// Warm-up window length, measured in frame time
    pub warmup_secs: f64,
    /// Hard wall-clock cap on a warm-up, whatever the frame clock does
    pub timeout_secs: f64,
    /// Fewer distinct moving tracks than this yields no proposals
    pub min_tracks: usize,
    pub top_k: usize,
    pub auto_apply_if_confident: bool,
    pub confidence_threshold: f32,
    pub grid_cols: usize,
    pub grid_rows: usize,
    pub canny_low: f32,
    pub canny_high: f32,
    pub hough_vote_threshold: u32,
    pub hough_suppression_radius: u32,
    pub max_hough_lines: usize,
    pub min_candidate_length_px: f32,
    /// Scene sampling stride, in frames
    pub scene_sample_every: u64,
    pub weights: ScoreWeights,
}

impl Default for AutoCalConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            warmup_secs: 60.0,
            timeout_secs: 120.0,
            min_tracks: 5,
            top_k: 3,
            auto_apply_if_confident: true,
            confidence_threshold: 0.7,
            grid_cols: 32,
            grid_rows: 18,
            canny_low: 50.0,
            canny_high: 150.0,
            hough_vote_threshold: 80,
            hough_suppression_radius: 8,
            max_hough_lines: 32,
            min_candidate_length_px: 40.0,
            scene_sample_every: 10,
            weights: ScoreWeights::default(),
        }
    }
}

const MAX_TRAJECTORY_POINTS: usize = 512;
const MIN_STEP_PX: f32 = 0.5;

/// Motion evidence gathered over one warm-up window
#[derive(Debug, Clone)]
pub struct MotionEvidence {
    width: u32,
    height: u32,
    heat: Array2<f32>,
    axis_cos: Array2<f32>,
    axis_sin: Array2<f32>,
    trajectories: BTreeMap<TrackId, Vec<Point2<f32>>>,
    scene_sum: Option<Array2<f32>>,
    scene_samples: u32,
    sample_every: u64,
    frames_seen: u64,
}

impl MotionEvidence {
    pub fn new(width: u32, height: u32, config: &AutoCalConfig) -> Self {
        let shape = (config.grid_rows.max(1), config.grid_cols.max(1));
        Self {
            width: width.max(1),
            height: height.max(1),
            heat: Array2::zeros(shape),
            axis_cos: Array2::zeros(shape),
            axis_sin: Array2::zeros(shape),
            trajectories: BTreeMap::new(),
            scene_sum: None,
            scene_samples: 0,
            sample_every: config.scene_sample_every.max(1),
            frames_seen: 0,
        }
    }

    pub fn frame_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn frames_seen(&self) -> u64 {
        self.frames_seen
    }

    fn cell_of(&self, p: &Point2<f32>) -> (usize, usize) {
        let (rows, cols) = self.heat.dim();
        let col = (p.x / self.width as f32 * cols as f32).floor();
        let row = (p.y / self.height as f32 * rows as f32).floor();
        (
            (row.max(0.0) as usize).min(rows - 1),
            (col.max(0.0) as usize).min(cols - 1),
        )
    }

    pub fn observe_frame(&mut self, frame: &Frame) {
        self.frames_seen += 1;
        if (self.frames_seen - 1) % self.sample_every != 0 {
            return;
        }
        if frame.dimensions() != (self.width, self.height) {
            log::warn!(
                "Skipping scene sample: frame is {:?}, calibration expects {}x{}",
                frame.dimensions(),
                self.width,
                self.height
            );
            return;
        }
        let gray = image::imageops::grayscale(&frame.image);
        let sum = self
            .scene_sum
            .get_or_insert_with(|| Array2::zeros((self.height as usize, self.width as usize)));
        for (x, y, px) in gray.enumerate_pixels() {
            sum[[y as usize, x as usize]] += px[0] as f32;
        }
        self.scene_samples += 1;
    }

    pub fn observe_tracks<'a, I>(&mut self, tracks: I)
    where
        I: IntoIterator<Item = &'a Track>,
    {
        for track in tracks {
            if !track.matched_this_frame() {
                continue;
            }
            let step = match track.history.last_step() {
                Some(step) => step,
                None => continue,
            };
            let magnitude = step.norm();
            if magnitude < MIN_STEP_PX {
                continue;
            }
            let centroid = track.centroid();
            let cell = self.cell_of(&centroid);
            // Orientation over the retained window; a single step wobbles with box jitter
            let heading = track
                .history
                .velocity()
                .filter(|v| v.norm() > f32::EPSILON)
                .unwrap_or(step);
            let angle = heading.y.atan2(heading.x);
            self.heat[cell] += magnitude;
            self.axis_cos[cell] += magnitude * (2.0 * angle).cos();
            self.axis_sin[cell] += magnitude * (2.0 * angle).sin();

            let path = self.trajectories.entry(track.id).or_default();
            if path.is_empty() {
                if let Some(prev) = track.history.previous() {
                    path.push(prev);
                }
            }
            if path.len() < MAX_TRAJECTORY_POINTS {
                path.push(centroid);
            }
        }
    }

    /// Distinct tracks that moved during the window
    pub fn tracks_observed(&self) -> usize {
        self.trajectories.values().filter(|p| p.len() >= 2).count()
    }

    /// Mean grayscale scene over the sampled frames
    pub fn scene(&self) -> Option<GrayImage> {
        let sum = self.scene_sum.as_ref()?;
        if self.scene_samples == 0 {
            return None;
        }
        let n = self.scene_samples as f32;
        Some(GrayImage::from_fn(self.width, self.height, |x, y| {
            Luma([(sum[[y as usize, x as usize]] / n).round().clamp(0.0, 255.0) as u8])
        }))
    }

    /// Heat-weighted dominant flow axis as a unit vector, with coherence in [0, 1]
    pub fn dominant_flow(&self) -> Option<(Vector2<f32>, f32)> {
        let total = self.heat.sum();
        if total <= 0.0 {
            return None;
        }
        let c = self.axis_cos.sum();
        let s = self.axis_sin.sum();
        let angle = s.atan2(c) / 2.0;
        let coherence = (c * c + s * s).sqrt() / total;
        Some((Vector2::new(angle.cos(), angle.sin()), coherence.clamp(0.0, 1.0)))
    }

    /// Heat-weighted centre of motion in pixels
    pub fn motion_centroid(&self) -> Option<Point2<f32>> {
        let total = self.heat.sum();
        if total <= 0.0 {
            return None;
        }
        let (rows, cols) = self.heat.dim();
        let cw = self.width as f32 / cols as f32;
        let ch = self.height as f32 / rows as f32;
        let (mut sx, mut sy) = (0.0, 0.0);
        for ((row, col), &h) in self.heat.indexed_iter() {
            sx += h * (col as f32 + 0.5) * cw;
            sy += h * (row as f32 + 0.5) * ch;
        }
        Some(Point2::new(sx / total, sy / total))
    }
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    start: Point2<f32>,
    end: Point2<f32>,
    source: CandidateSource,
}

/// Clip the infinite line through `p` along `d` to the frame rectangle
fn clip_to_frame(p: Point2<f32>, d: Vector2<f32>, width: u32, height: u32) -> Option<(Point2<f32>, Point2<f32>)> {
    let (xmax, ymax) = ((width - 1) as f32, (height - 1) as f32);
    let mut t0 = f32::NEG_INFINITY;
    let mut t1 = f32::INFINITY;
    for (origin, delta, lo, hi) in [(p.x, d.x, 0.0, xmax), (p.y, d.y, 0.0, ymax)] {
        if delta.abs() < 1e-6 {
            if origin < lo || origin > hi {
                return None;
            }
            continue;
        }
        let a = (lo - origin) / delta;
        let b = (hi - origin) / delta;
        t0 = t0.max(a.min(b));
        t1 = t1.min(a.max(b));
    }
    if t0 >= t1 {
        return None;
    }
    Some((p + d * t0, p + d * t1))
}

fn near_duplicate(a: &CountingLine, b: &CountingLine, tol: f32) -> bool {
    let same = (a.start - b.start).norm() < tol && (a.end - b.end).norm() < tol;
    let swapped = (a.start - b.end).norm() < tol && (a.end - b.start).norm() < tol;
    same || swapped
}

/// Scores candidate lines against accumulated motion evidence
pub struct AutoCalibrator {
    config: AutoCalConfig,
}

impl AutoCalibrator {
    pub fn new(config: AutoCalConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AutoCalConfig {
        &self.config
    }

    fn hough_candidates(&self, evidence: &MotionEvidence) -> Vec<Candidate> {
        let scene = match evidence.scene() {
            Some(scene) => scene,
            None => return Vec::new(),
        };
        let edges = canny(&scene, self.config.canny_low, self.config.canny_high);
        let options = LineDetectionOptions {
            vote_threshold: self.config.hough_vote_threshold,
            suppression_radius: self.config.hough_suppression_radius,
        };
        let (w, h) = evidence.frame_size();
        detect_lines(&edges, options)
            .into_iter()
            .take(self.config.max_hough_lines)
            .filter_map(|polar| {
                let theta = (polar.angle_in_degrees as f32).to_radians();
                let normal = Vector2::new(theta.cos(), theta.sin());
                let foot = Point2::from(normal * polar.r);
                let along = Vector2::new(-theta.sin(), theta.cos());
                clip_to_frame(foot, along, w, h).map(|(start, end)| Candidate {
                    start,
                    end,
                    source: CandidateSource::Hough,
                })
            })
            .collect()
    }

    fn flow_candidates(&self, evidence: &MotionEvidence) -> Vec<Candidate> {
        let (flow, _) = match evidence.dominant_flow() {
            Some(f) => f,
            None => return Vec::new(),
        };
        let (w, h) = evidence.frame_size();
        let along = Vector2::new(-flow.y, flow.x);
        let center = Point2::new(w as f32 / 2.0, h as f32 / 2.0);
        let mut anchors = vec![center];
        if let Some(c) = evidence.motion_centroid() {
            anchors.push(c);
        }
        anchors
            .into_iter()
            .filter_map(|anchor| clip_to_frame(anchor, along, w, h))
            .map(|(start, end)| Candidate {
                start,
                end,
                source: CandidateSource::FlowNormal,
            })
            .collect()
    }

    /// Fraction of trajectory length belonging to tracks that cross the segment,
    /// plus the side most crossing tracks end on
    fn traffic(&self, line: &CountingLine, evidence: &MotionEvidence) -> (f32, Side) {
        let mut total = 0.0;
        let mut crossed = 0.0;
        let (mut ends_pos, mut ends_neg) = (0usize, 0usize);
        for path in evidence.trajectories.values().filter(|p| p.len() >= 2) {
            let length: f32 = path.windows(2).map(|w| (w[1] - w[0]).norm()).sum();
            total += length;
            if path.windows(2).any(|w| line.crosses_segment(&w[0], &w[1])) {
                crossed += length;
                if let Some(last) = path.last() {
                    if line.signed_distance(last) > 0.0 {
                        ends_pos += 1;
                    } else {
                        ends_neg += 1;
                    }
                }
            }
        }
        let fraction = if total > 0.0 { crossed / total } else { 0.0 };
        let in_side = if ends_pos > ends_neg {
            Side::Positive
        } else {
            Side::Negative
        };
        (fraction, in_side)
    }

    /// How well the flow in cells under the segment runs along the segment normal
    fn alignment(&self, line: &CountingLine, evidence: &MotionEvidence) -> f32 {
        let (rows, cols) = evidence.heat.dim();
        let cell = (evidence.width as f32 / cols as f32).min(evidence.height as f32 / rows as f32);
        let steps = ((line.length() / (cell / 2.0)).ceil() as usize).max(1);
        let cells: BTreeSet<(usize, usize)> = (0..=steps)
            .map(|i| {
                let t = i as f32 / steps as f32;
                evidence.cell_of(&(line.start + line.direction() * t))
            })
            .collect();

        let normal = line.normal();
        let normal_angle = normal.y.atan2(normal.x);
        let (mut weighted, mut mass) = (0.0, 0.0);
        for c in cells {
            let heat = evidence.heat[c];
            if heat <= 0.0 {
                continue;
            }
            let axis = evidence.axis_sin[c].atan2(evidence.axis_cos[c]) / 2.0;
            let coherence = (evidence.axis_sin[c].hypot(evidence.axis_cos[c]) / heat).min(1.0);
            weighted += heat * coherence * (axis - normal_angle).cos().abs();
            mass += heat;
        }
        if mass > 0.0 {
            weighted / mass
        } else {
            0.0
        }
    }

    fn score(&self, candidate: &Candidate, evidence: &MotionEvidence) -> Option<CalibrationProposal> {
        let trial = CountingLine::new(candidate.start, candidate.end, Side::Negative).ok()?;
        if trial.length() < self.config.min_candidate_length_px {
            return None;
        }
        let (traffic, in_side) = self.traffic(&trial, evidence);
        if traffic <= 0.0 {
            return None;
        }
        let (w, h) = evidence.frame_size();
        let extent = w.max(h) as f32;
        let center = Point2::new(w as f32 / 2.0, h as f32 / 2.0);
        let half_diag = (w as f32).hypot(h as f32) / 2.0;

        let breakdown = ScoreBreakdown {
            traffic: traffic.clamp(0.0, 1.0),
            alignment: self.alignment(&trial, evidence).clamp(0.0, 1.0),
            length: (trial.length() / extent).clamp(0.0, 1.0),
            centrality: (1.0 - (trial.midpoint() - center).norm() / half_diag).clamp(0.0, 1.0),
        };
        let weights = &self.config.weights;
        let total = weights.total();
        let confidence = if total > 0.0 {
            (weights.traffic * breakdown.traffic
                + weights.alignment * breakdown.alignment
                + weights.length * breakdown.length
                + weights.centrality * breakdown.centrality)
                / total
        } else {
            0.0
        };

        Some(CalibrationProposal {
            line: CountingLine { in_side, ..trial },
            confidence: confidence.clamp(0.0, 1.0),
            source: candidate.source,
            breakdown,
        })
    }

    /// Rank candidate lines; empty when too few tracks were observed
    pub fn propose(&self, evidence: &MotionEvidence, now: DateTime<Utc>) -> ProposalBatch {
        let observed = evidence.tracks_observed();
        if observed < self.config.min_tracks {
            log::warn!(
                "Auto-calibration saw {} moving tracks (need {}), no proposals",
                observed,
                self.config.min_tracks
            );
            return ProposalBatch {
                proposals: Vec::new(),
                generated_at: Some(now),
                tracks_observed: observed,
            };
        }

        let mut candidates = self.hough_candidates(evidence);
        let n_hough = candidates.len();
        candidates.extend(self.flow_candidates(evidence));
        log::debug!(
            "Scoring {} candidates ({} from Hough)",
            candidates.len(),
            n_hough
        );

        let mut scored: Vec<CalibrationProposal> = candidates
            .par_iter()
            .filter_map(|c| self.score(c, evidence))
            .collect();
        scored.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

        let mut proposals: Vec<CalibrationProposal> = Vec::with_capacity(self.config.top_k);
        for p in scored {
            if proposals.len() == self.config.top_k {
                break;
            }
            if proposals.iter().any(|q| near_duplicate(&q.line, &p.line, 15.0)) {
                continue;
            }
            proposals.push(p);
        }

        if let Some(top) = proposals.first() {
            log::info!(
                "Auto-calibration: {} proposals from {} tracks, top confidence {:.2}",
                proposals.len(),
                observed,
                top.confidence
            );
        }
        ProposalBatch {
            proposals,
            generated_at: Some(now),
            tracks_observed: observed,
        }
    }

    /// The proposal to apply without review, if policy allows one
    pub fn select_confident<'a>(&self, batch: &'a ProposalBatch) -> Option<&'a CalibrationProposal> {
        if !self.config.auto_apply_if_confident {
            return None;
        }
        batch
            .top()
            .filter(|p| p.confidence > self.config.confidence_threshold)
    }
}

/// How a warm-up ended
#[derive(Debug)]
pub enum WarmupOutcome {
    Complete(MotionEvidence),
    TimedOut,
    Cancelled,
}

/// One warm-up window: frame-time length plus a wall-clock cap
pub struct WarmupSession {
    evidence: MotionEvidence,
    window: chrono::Duration,
    started_at: Option<DateTime<Utc>>,
    deadline: Instant,
    cancel: CancellationToken,
}

impl WarmupSession {
    pub fn new(
        width: u32,
        height: u32,
        config: &AutoCalConfig,
        window_secs: f64,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            evidence: MotionEvidence::new(width, height, config),
            window: chrono::Duration::milliseconds((window_secs * 1000.0) as i64),
            started_at: None,
            deadline: Instant::now() + Duration::from_secs_f64(config.timeout_secs.max(0.0)),
            cancel,
        }
    }

    /// Feed one frame; `true` once the window has elapsed in frame time
    pub fn feed<'a, I>(&mut self, frame: &Frame, tracks: I) -> bool
    where
        I: IntoIterator<Item = &'a Track>,
    {
        let started = *self.started_at.get_or_insert(frame.timestamp);
        self.evidence.observe_frame(frame);
        self.evidence.observe_tracks(tracks);
        frame.timestamp - started >= self.window
    }

    fn interrupted(&self) -> Option<WarmupOutcome> {
        if self.cancel.is_cancelled() {
            Some(WarmupOutcome::Cancelled)
        } else if Instant::now() >= self.deadline {
            Some(WarmupOutcome::TimedOut)
        } else {
            None
        }
    }
}

struct ActiveWarmup {
    session: WarmupSession,
    done: Sender<WarmupOutcome>,
}

/// Hand-off point between the pipeline loop and whoever is calibrating.
///
/// The pipeline calls [`CalibrationTap::feed`] once per frame; it only does work
/// while a session is installed.
#[derive(Default)]
pub struct CalibrationTap {
    slot: Mutex<Option<ActiveWarmup>>,
}

impl CalibrationTap {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<ActiveWarmup>> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_active(&self) -> bool {
        self.lock().is_some()
    }

    /// Install a session; `None` if one is already running
    pub fn begin(&self, session: WarmupSession) -> Option<Receiver<WarmupOutcome>> {
        let mut slot = self.lock();
        if slot.is_some() {
            return None;
        }
        let (done, rx) = bounded(1);
        *slot = Some(ActiveWarmup { session, done });
        Some(rx)
    }

    pub fn feed<'a, I>(&self, frame: &Frame, tracks: I)
    where
        I: IntoIterator<Item = &'a Track>,
    {
        let mut slot = self.lock();
        let finished = match slot.as_mut() {
            Some(active) => match active.session.interrupted() {
                Some(outcome) => Some(outcome),
                None => active
                    .session
                    .feed(frame, tracks)
                    .then(|| WarmupOutcome::Complete(active.session.evidence.clone())),
            },
            None => None,
        };
        if let Some(outcome) = finished {
            if let Some(active) = slot.take() {
                let _ = active.done.try_send(outcome);
            }
        }
    }

    /// Drop the running session, if any, reporting it as cancelled
    pub fn abort(&self) {
        if let Some(active) = self.lock().take() {
            let _ = active.done.try_send(WarmupOutcome::Cancelled);
        }
    }

    /// Run one warm-up to completion, timeout or cancellation.
    ///
    /// Blocks the calling (non-pipeline) thread; the wall-clock cap is enforced
    /// here as well, so a stalled pipeline cannot hang the caller.
    pub fn run(&self, session: WarmupSession) -> WarmupOutcome {
        let deadline = session.deadline;
        let cancel = session.cancel.clone();
        let rx = match self.begin(session) {
            Some(rx) => rx,
            None => {
                log::warn!("Warm-up requested while another is running");
                return WarmupOutcome::Cancelled;
            }
        };
        loop {
            match rx.recv_timeout(Duration::from_millis(100)) {
                Ok(outcome) => return outcome,
                Err(RecvTimeoutError::Timeout) => {
                    if cancel.is_cancelled() {
                        self.abort();
                        return WarmupOutcome::Cancelled;
                    }
                    if Instant::now() >= deadline {
                        self.abort();
                        return WarmupOutcome::TimedOut;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => return WarmupOutcome::Cancelled,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use image::{Rgb, RgbImage};
    use imageproc::drawing::draw_filled_rect_mut;
    use imageproc::rect::Rect;
    use ioutrack::{Bbox, Detection, GreedyTracker, GreedyTrackerConfig, MultiObjectTracker};

    const W: u32 = 320;
    const H: u32 = 240;

    fn scene_with_bar() -> RgbImage {
        let mut img = RgbImage::from_pixel(W, H, Rgb([30, 30, 30]));
        draw_filled_rect_mut(&mut img, Rect::at(0, 100).of_size(W, 40), Rgb([220, 220, 220]));
        img
    }

    /// `n` objects walking top to bottom at staggered x positions
    fn evidence_from_vertical_traffic(n: usize) -> MotionEvidence {
        let config = AutoCalConfig {
            scene_sample_every: 1,
            ..Default::default()
        };
        let mut evidence = MotionEvidence::new(W, H, &config);
        let mut tracker = GreedyTracker::new(GreedyTrackerConfig {
            max_misses: 0,
            ..Default::default()
        })
        .unwrap();
        let t0 = Utc::now();
        let image = scene_with_bar();
        let mut frame_id = 0;
        for obj in 0..n {
            let x = 40.0 + (obj as f32 * 37.0) % 240.0;
            for step in 0..40 {
                let t = t0 + ChronoDuration::milliseconds(frame_id as i64 * 33);
                let y = 20.0 + step as f32 * 5.0;
                let det = Detection::new(Bbox::new(x - 8.0, y - 8.0, x + 8.0, y + 8.0), 0, 0.9, t);
                tracker.update(&[det]);
                let frame = Frame::new(frame_id, image.clone(), t);
                evidence.observe_frame(&frame);
                evidence.observe_tracks(tracker.tracks());
                frame_id += 1;
            }
            tracker.update(&[]);
        }
        evidence
    }

    #[test]
    fn test_too_few_tracks_yields_empty_batch() {
        let evidence = evidence_from_vertical_traffic(2);
        let calibrator = AutoCalibrator::new(AutoCalConfig::default());
        let batch = calibrator.propose(&evidence, Utc::now());
        assert!(batch.is_empty());
        assert_eq!(batch.tracks_observed, 2);
    }

    #[test]
    fn test_proposals_sorted_and_bounded() {
        let evidence = evidence_from_vertical_traffic(8);
        assert_eq!(evidence.tracks_observed(), 8);
        let calibrator = AutoCalibrator::new(AutoCalConfig::default());
        let batch = calibrator.propose(&evidence, Utc::now());

        assert!(!batch.is_empty());
        assert!(batch.proposals.len() <= 3);
        for pair in batch.proposals.windows(2) {
            assert!(pair[0].confidence >= pair[1].confidence);
        }
        for p in &batch.proposals {
            assert!((0.0..=1.0).contains(&p.confidence));
        }
    }

    #[test]
    fn test_top_proposal_is_across_the_flow() {
        let evidence = evidence_from_vertical_traffic(8);
        let calibrator = AutoCalibrator::new(AutoCalConfig::default());
        let batch = calibrator.propose(&evidence, Utc::now());
        let top = batch.top().unwrap();
        let d = top.line.direction();
        assert!(d.y.abs() < 0.1 * d.x.abs(), "top line not horizontal: {:?}", top.line);
        assert!(top.breakdown.traffic > 0.99);
        // Everything walks downwards, i.e. ends on the positive side of a left-to-right line
        let expected = if d.x > 0.0 { Side::Positive } else { Side::Negative };
        assert_eq!(top.line.in_side, expected);
        assert!(calibrator.select_confident(&batch).is_some());
    }

    #[test]
    fn test_hough_finds_scene_edges() {
        let evidence = evidence_from_vertical_traffic(8);
        let calibrator = AutoCalibrator::new(AutoCalConfig::default());
        let hough = calibrator.hough_candidates(&evidence);
        assert!(!hough.is_empty());
        assert!(hough.iter().any(|c| (c.start.y - 100.0).abs() < 4.0 || (c.start.y - 140.0).abs() < 4.0));
    }

    #[test]
    fn test_dominant_flow_is_vertical() {
        let evidence = evidence_from_vertical_traffic(5);
        let (flow, coherence) = evidence.dominant_flow().unwrap();
        assert!(flow.y.abs() > 0.99);
        assert!(coherence > 0.9);
    }

    #[test]
    fn test_flow_axis_ignores_sideways_jitter() {
        let mut evidence = MotionEvidence::new(W, H, &AutoCalConfig::default());
        let mut tracker = GreedyTracker::new(GreedyTrackerConfig::default()).unwrap();
        let t0 = Utc::now();
        // Each step swings 6 px sideways while advancing 5 px down
        for step in 0..30 {
            let t = t0 + ChronoDuration::milliseconds(step as i64 * 33);
            let x = if step % 2 == 0 { 150.0 } else { 156.0 };
            let y = 20.0 + step as f32 * 5.0;
            let det = Detection::new(Bbox::new(x - 10.0, y - 10.0, x + 10.0, y + 10.0), 0, 0.9, t);
            tracker.update(&[det]);
            evidence.observe_tracks(tracker.tracks());
        }
        let (flow, _) = evidence.dominant_flow().unwrap();
        assert!(flow.y.abs() > 0.95, "flow not vertical: {:?}", flow);
    }

    #[test]
    fn test_clip_to_frame() {
        let (a, b) = clip_to_frame(Point2::new(50.0, 50.0), Vector2::new(1.0, 0.0), 100, 80).unwrap();
        assert_eq!(a, Point2::new(0.0, 50.0));
        assert_eq!(b, Point2::new(99.0, 50.0));
        assert!(clip_to_frame(Point2::new(50.0, 200.0), Vector2::new(1.0, 0.0), 100, 80).is_none());
    }

    #[test]
    fn test_auto_apply_respects_policy() {
        let evidence = evidence_from_vertical_traffic(8);
        let calibrator = AutoCalibrator::new(AutoCalConfig {
            auto_apply_if_confident: false,
            ..Default::default()
        });
        let batch = calibrator.propose(&evidence, Utc::now());
        assert!(calibrator.select_confident(&batch).is_none());
    }

    #[test]
    fn test_tap_completes_after_window() {
        let tap = CalibrationTap::new();
        let config = AutoCalConfig::default();
        let session = WarmupSession::new(W, H, &config, 1.0, CancellationToken::new());
        let rx = tap.begin(session).unwrap();
        assert!(tap.begin(WarmupSession::new(W, H, &config, 1.0, CancellationToken::new())).is_none());

        let t0 = Utc::now();
        let image = RgbImage::new(W, H);
        for i in 0..40 {
            let frame = Frame::new(i, image.clone(), t0 + ChronoDuration::milliseconds(i as i64 * 50));
            tap.feed(&frame, std::iter::empty::<&Track>());
        }
        assert!(matches!(rx.try_recv(), Ok(WarmupOutcome::Complete(_))));
        assert!(!tap.is_active());
    }

    #[test]
    fn test_tap_run_times_out_without_frames() {
        let tap = CalibrationTap::new();
        let config = AutoCalConfig {
            timeout_secs: 0.2,
            ..Default::default()
        };
        let session = WarmupSession::new(W, H, &config, 60.0, CancellationToken::new());
        assert!(matches!(tap.run(session), WarmupOutcome::TimedOut));
        assert!(!tap.is_active());
    }

    #[test]
    fn test_tap_run_cancelled() {
        let tap = CalibrationTap::new();
        let token = CancellationToken::new();
        token.cancel();
        let session = WarmupSession::new(W, H, &AutoCalConfig::default(), 60.0, token);
        assert!(matches!(tap.run(session), WarmupOutcome::Cancelled));
    }
}
