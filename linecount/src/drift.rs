//! Camera drift and lighting monitor
//!
//! Compares the live view against a stored reference with three metrics:
//! mean SSIM over 7x7 windows, IoU of Canny edge maps, and grayscale variance.
//! A small state machine decides when drift should trigger recalibration and
//! enforces a cooldown between attempts.

use crate::types::{DriftSnapshot, Frame};
use chrono::{DateTime, Duration, Utc};
use image::imageops::FilterType;
use image::GrayImage;
use imageproc::edges::canny;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Drift monitor configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriftConfig {
    pub enabled: bool,
    pub check_interval_secs: f64,
    /// Frames wider than this are downscaled before comparison
    pub analysis_width: u32,
    pub ssim_threshold: f32,
    /// Also flag a camera shift when edge IoU drops below this
    pub edge_iou_threshold: Option<f32>,
    pub brightness_var_min: f32,
    pub brightness_var_max: f32,
    pub re_calibrate_on_drift: bool,
    pub min_minutes_between_recal: f64,
    pub recal_warmup_secs: f64,
    pub recal_timeout_secs: f64,
    /// Samples kept for the rolling averages
    pub history_len: usize,
    pub canny_low: f32,
    pub canny_high: f32,
}

impl Default for DriftConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            check_interval_secs: 5.0,
            analysis_width: 320,
            ssim_threshold: 0.75,
            edge_iou_threshold: None,
            brightness_var_min: 6.0,
            brightness_var_max: 6000.0,
            re_calibrate_on_drift: true,
            min_minutes_between_recal: 120.0,
            recal_warmup_secs: 30.0,
            recal_timeout_secs: 90.0,
            history_len: 30,
            canny_low: 50.0,
            canny_high: 150.0,
        }
    }
}

impl DriftConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::milliseconds((self.min_minutes_between_recal * 60_000.0) as i64)
    }
}

const SSIM_WINDOW: usize = 7;
const SSIM_C1: f64 = (0.01 * 255.0) * (0.01 * 255.0);
const SSIM_C2: f64 = (0.03 * 255.0) * (0.03 * 255.0);

fn to_array(img: &GrayImage) -> Array2<f64> {
    let (w, h) = img.dimensions();
    Array2::from_shape_fn((h as usize, w as usize), |(y, x)| {
        img.get_pixel(x as u32, y as u32)[0] as f64
    })
}

/// Summed-area table with a zero first row and column
fn integral(values: &Array2<f64>) -> Array2<f64> {
    let (h, w) = values.dim();
    let mut table = Array2::<f64>::zeros((h + 1, w + 1));
    for y in 0..h {
        let mut row_sum = 0.0;
        for x in 0..w {
            row_sum += values[[y, x]];
            table[[y + 1, x + 1]] = table[[y, x + 1]] + row_sum;
        }
    }
    table
}

fn window_sum(table: &Array2<f64>, y: usize, x: usize, k: usize) -> f64 {
    table[[y + k, x + k]] - table[[y, x + k]] - table[[y + k, x]] + table[[y, x]]
}

/// Mean structural similarity over all full 7x7 windows (uniform weights,
/// sample covariance). Images must share dimensions.
pub fn ssim(a: &GrayImage, b: &GrayImage) -> f32 {
    if a.dimensions() != b.dimensions() {
        return 0.0;
    }
    let (w, h) = a.dimensions();
    let k = SSIM_WINDOW;
    if (w as usize) < k || (h as usize) < k {
        return if a == b { 1.0 } else { 0.0 };
    }

    let x = to_array(a);
    let y = to_array(b);
    let sx = integral(&x);
    let sy = integral(&y);
    let sxx = integral(&(&x * &x));
    let syy = integral(&(&y * &y));
    let sxy = integral(&(&x * &y));

    let n = (k * k) as f64;
    let cov_norm = n / (n - 1.0);
    let (rows, cols) = (h as usize - k + 1, w as usize - k + 1);
    let mut total = 0.0;
    for r in 0..rows {
        for c in 0..cols {
            let mx = window_sum(&sx, r, c, k) / n;
            let my = window_sum(&sy, r, c, k) / n;
            let vx = cov_norm * (window_sum(&sxx, r, c, k) / n - mx * mx);
            let vy = cov_norm * (window_sum(&syy, r, c, k) / n - my * my);
            let vxy = cov_norm * (window_sum(&sxy, r, c, k) / n - mx * my);
            let num = (2.0 * mx * my + SSIM_C1) * (2.0 * vxy + SSIM_C2);
            let den = (mx * mx + my * my + SSIM_C1) * (vx + vy + SSIM_C2);
            total += num / den;
        }
    }
    (total / (rows * cols) as f64) as f32
}

/// IoU of the set pixels of two binary edge maps; two empty maps count as identical
pub fn edge_iou(a: &GrayImage, b: &GrayImage) -> f32 {
    if a.dimensions() != b.dimensions() {
        return 0.0;
    }
    let (mut inter, mut union) = (0u64, 0u64);
    for (pa, pb) in a.pixels().zip(b.pixels()) {
        let (ea, eb) = (pa[0] > 0, pb[0] > 0);
        if ea && eb {
            inter += 1;
        }
        if ea || eb {
            union += 1;
        }
    }
    if union == 0 {
        1.0
    } else {
        inter as f32 / union as f32
    }
}

/// Population variance of the grayscale intensities
pub fn brightness_variance(img: &GrayImage) -> f32 {
    let n = (img.width() as f64) * (img.height() as f64);
    if n == 0.0 {
        return 0.0;
    }
    let (mut sum, mut sum_sq) = (0.0f64, 0.0f64);
    for p in img.pixels() {
        let v = p[0] as f64;
        sum += v;
        sum_sq += v * v;
    }
    let mean = sum / n;
    (sum_sq / n - mean * mean).max(0.0) as f32
}

/// Grayscale view of a frame at analysis resolution
struct View {
    gray: GrayImage,
    edges: GrayImage,
    brightness_var: f32,
}

impl View {
    fn from_frame(frame: &Frame, config: &DriftConfig) -> Self {
        let mut gray = image::imageops::grayscale(&frame.image);
        let (w, h) = gray.dimensions();
        if config.analysis_width > 0 && w > config.analysis_width {
            let nh = ((h as f64) * config.analysis_width as f64 / w as f64).round().max(1.0) as u32;
            gray = image::imageops::resize(&gray, config.analysis_width, nh, FilterType::Triangle);
        }
        let edges = canny(&gray, config.canny_low, config.canny_high);
        let brightness_var = brightness_variance(&gray);
        Self {
            gray,
            edges,
            brightness_var,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum DriftState {
    Nominal,
    DriftDetected,
    Recalibrating,
    Cooldown { until: DateTime<Utc> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriftAction {
    None,
    Recalibrate,
}

/// How a recalibration attempt ended
#[derive(Debug, Clone)]
pub enum RecalibrationOutcome {
    /// A confident line was applied; the frame becomes the new reference
    Applied(Box<Frame>),
    /// Finished without a confident proposal
    NotConfident(String),
    /// Cancelled or timed out
    Aborted(String),
}

/// Everything reporting needs about drift, as one value
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DriftStatus {
    pub state: DriftState,
    pub snapshot: Option<DriftSnapshot>,
    pub mean_ssim: Option<f32>,
    pub mean_edge_iou: Option<f32>,
    pub last_recalibration: Option<DateTime<Utc>>,
    pub last_failure: Option<String>,
    pub recalibrations: u32,
}

pub struct DriftMonitor {
    config: DriftConfig,
    state: DriftState,
    reference: Option<View>,
    last_snapshot: Option<DriftSnapshot>,
    last_recalibration: Option<DateTime<Utc>>,
    last_failure: Option<String>,
    recalibrations: u32,
    ssim_history: VecDeque<f32>,
    edge_history: VecDeque<f32>,
}

impl DriftMonitor {
    pub fn new(config: DriftConfig) -> Self {
        Self {
            config,
            state: DriftState::Nominal,
            reference: None,
            last_snapshot: None,
            last_recalibration: None,
            last_failure: None,
            recalibrations: 0,
            ssim_history: VecDeque::new(),
            edge_history: VecDeque::new(),
        }
    }

    pub fn config(&self) -> &DriftConfig {
        &self.config
    }

    pub fn state(&self) -> DriftState {
        self.state
    }

    pub fn has_reference(&self) -> bool {
        self.reference.is_some()
    }

    pub fn set_reference(&mut self, frame: &Frame) {
        self.reference = Some(View::from_frame(frame, &self.config));
        self.ssim_history.clear();
        self.edge_history.clear();
        log::info!("Drift reference set from frame {}", frame.frame_id);
    }

    fn push_history(history: &mut VecDeque<f32>, value: f32, cap: usize) {
        if history.len() == cap.max(1) {
            history.pop_front();
        }
        history.push_back(value);
    }

    /// Compare `frame` with the reference and advance the state machine.
    ///
    /// The first frame ever seen becomes the reference.
    pub fn check(&mut self, frame: &Frame, now: DateTime<Utc>) -> (DriftSnapshot, DriftAction) {
        let view = View::from_frame(frame, &self.config);
        let reference = match &self.reference {
            Some(r) => r,
            None => {
                let snapshot = DriftSnapshot {
                    ssim: 1.0,
                    edge_iou: 1.0,
                    brightness_var: view.brightness_var,
                    drift_score: 0.0,
                    camera_shifted: false,
                    lighting_bad: false,
                    timestamp: now,
                };
                self.reference = Some(view);
                self.last_snapshot = Some(snapshot);
                return (snapshot, DriftAction::None);
            }
        };

        let ssim_val = ssim(&reference.gray, &view.gray);
        let edge_val = edge_iou(&reference.edges, &view.edges);
        let brightness_delta = (view.brightness_var - reference.brightness_var).abs();

        let camera_shifted = ssim_val < self.config.ssim_threshold
            || self
                .config
                .edge_iou_threshold
                .is_some_and(|t| edge_val < t);
        let lighting_bad = view.brightness_var < self.config.brightness_var_min
            || view.brightness_var > self.config.brightness_var_max;
        let drift_score = ((1.0 - ssim_val) * 0.4
            + (1.0 - edge_val) * 0.4
            + (brightness_delta / 50.0).min(1.0) * 0.2)
            .clamp(0.0, 1.0);

        let snapshot = DriftSnapshot {
            ssim: ssim_val,
            edge_iou: edge_val,
            brightness_var: view.brightness_var,
            drift_score,
            camera_shifted,
            lighting_bad,
            timestamp: now,
        };
        Self::push_history(&mut self.ssim_history, ssim_val, self.config.history_len);
        Self::push_history(&mut self.edge_history, edge_val, self.config.history_len);
        self.last_snapshot = Some(snapshot);

        if snapshot.is_drifting() {
            log::warn!(
                "Drift: ssim={:.3} edge_iou={:.3} brightness_var={:.1} (shifted={}, lighting_bad={})",
                ssim_val,
                edge_val,
                view.brightness_var,
                camera_shifted,
                lighting_bad
            );
        }

        let action = self.assess(snapshot.is_drifting(), now);
        (snapshot, action)
    }

    fn cooldown_elapsed(&self, now: DateTime<Utc>) -> bool {
        self.last_recalibration
            .is_none_or(|t| now - t >= self.config.cooldown())
    }

    fn transition(&mut self, next: DriftState) {
        if self.state != next {
            log::info!("Drift state {:?} -> {:?}", self.state, next);
            self.state = next;
        }
    }

    /// Advance the state machine given whether drift flags are currently set
    pub fn assess(&mut self, drifting: bool, now: DateTime<Utc>) -> DriftAction {
        match self.state {
            DriftState::Recalibrating => return DriftAction::None,
            DriftState::Cooldown { until } => {
                if now < until {
                    return DriftAction::None;
                }
                self.transition(DriftState::Nominal);
            }
            _ => {}
        }

        match (self.state, drifting) {
            (DriftState::Nominal, true) => self.transition(DriftState::DriftDetected),
            (DriftState::DriftDetected, false) => self.transition(DriftState::Nominal),
            _ => {}
        }

        if self.state == DriftState::DriftDetected
            && self.config.re_calibrate_on_drift
            && self.cooldown_elapsed(now)
        {
            self.transition(DriftState::Recalibrating);
            self.last_recalibration = Some(now);
            return DriftAction::Recalibrate;
        }
        DriftAction::None
    }

    /// Close out a recalibration started by [`DriftAction::Recalibrate`]
    pub fn complete_recalibration(&mut self, outcome: RecalibrationOutcome, now: DateTime<Utc>) {
        if self.state != DriftState::Recalibrating {
            log::warn!("Recalibration result arrived in state {:?}, ignoring", self.state);
            return;
        }
        match outcome {
            RecalibrationOutcome::Applied(frame) => {
                self.set_reference(&frame);
                self.recalibrations += 1;
                self.last_failure = None;
                self.transition(DriftState::Cooldown {
                    until: now + self.config.cooldown(),
                });
            }
            RecalibrationOutcome::NotConfident(reason) | RecalibrationOutcome::Aborted(reason) => {
                log::warn!("Recalibration did not apply: {}", reason);
                self.last_failure = Some(reason);
                self.transition(DriftState::DriftDetected);
            }
        }
    }

    pub fn status(&self) -> DriftStatus {
        let mean = |h: &VecDeque<f32>| {
            (!h.is_empty()).then(|| h.iter().sum::<f32>() / h.len() as f32)
        };
        DriftStatus {
            state: self.state,
            snapshot: self.last_snapshot,
            mean_ssim: mean(&self.ssim_history),
            mean_edge_iou: mean(&self.edge_history),
            last_recalibration: self.last_recalibration,
            last_failure: self.last_failure.clone(),
            recalibrations: self.recalibrations,
        }
    }
}
