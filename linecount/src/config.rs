//! Structured application configuration
//!
//! Loaded from JSON; every section falls back to its defaults when omitted.
//! A saved tuning profile and `LINECOUNT_MOCK_MODE` are layered on top before
//! [`AppConfig::validate`] runs.

use crate::autocal::AutoCalConfig;
use crate::crossing::CrossingConfig;
use crate::drift::DriftConfig;
use crate::error::{CounterError, Result};
use crate::line::CountingLine;
use crate::postprocessing::{PostprocessConfig, RoiConfig};
use crate::processor::ProcessorSettings;
use crate::synthetic::{MotionAxis, SceneConfig};
use crate::tuner::TunerConfig;
use crate::types::TuningProfile;
use ioutrack::{GreedyTrackerConfig, Side};
use nalgebra::Point2;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub const MOCK_MODE_ENV: &str = "LINECOUNT_MOCK_MODE";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            fps: 30.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub conf_thresh: f32,
    pub nms_thresh: f32,
    pub max_detections: usize,
    /// Class ids to keep; empty keeps all
    pub class_filter: Vec<u32>,
    /// Use the synthetic scene instead of a camera and model
    pub mock_mode: bool,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            conf_thresh: 0.35,
            nms_thresh: 0.45,
            max_detections: 50,
            class_filter: Vec::new(),
            mock_mode: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingConfig {
    pub affinity_threshold: f32,
    pub max_misses: u32,
    pub history_len: usize,
    pub min_box_area: f32,
    pub min_spawn_confidence: f32,
    pub class_aware: bool,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        let tracker = GreedyTrackerConfig::default();
        Self {
            affinity_threshold: tracker.affinity_threshold,
            max_misses: tracker.max_misses,
            history_len: tracker.history_len,
            min_box_area: 150.0,
            min_spawn_confidence: tracker.min_spawn_confidence,
            class_aware: tracker.class_aware,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CountingConfig {
    pub line: CountingLine,
    #[serde(flatten)]
    pub crossing: CrossingConfig,
}

impl Default for CountingConfig {
    fn default() -> Self {
        Self {
            line: CountingLine {
                start: Point2::new(100.0, 360.0),
                end: Point2::new(1180.0, 360.0),
                in_side: Side::Negative,
            },
            crossing: CrossingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub events_path: PathBuf,
    /// Writer queue depth; events beyond it are dropped with a warning
    pub queue_capacity: usize,
    pub batch_size: usize,
    /// Where nightly rollups are appended
    pub rollups_path: PathBuf,
    /// Directory for the daily `<day>_counts.csv` exports
    pub csv_dir: PathBuf,
    /// Local time of the export of the previous (UTC) day, "HH:MM"
    pub export_daily_time: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            events_path: PathBuf::from("data/events.jsonl"),
            queue_capacity: 1000,
            batch_size: 100,
            rollups_path: PathBuf::from("data/rollups.jsonl"),
            csv_dir: PathBuf::from("data/exports"),
            export_daily_time: "23:59".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpsConfig {
    pub log_level: String,
    /// Frames between throughput log lines
    pub stats_every_frames: u64,
    /// Publish every n-th frame as the latest frame for drift checks
    pub frame_publish_interval: u64,
    /// Consecutive frame read failures tolerated before the loop stops
    pub max_consecutive_read_errors: u32,
    /// Local time of the rollup of the previous (UTC) day, "HH:MM"
    pub rollup_time: String,
    pub scheduler_threads: usize,
    pub shutdown_timeout_secs: f64,
}

impl Default for OpsConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            stats_every_frames: 100,
            frame_publish_interval: 10,
            max_consecutive_read_errors: 50,
            rollup_time: "00:15".to_string(),
            scheduler_threads: 2,
            shutdown_timeout_secs: 10.0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub camera: CameraConfig,
    pub model: ModelConfig,
    pub tracking: TrackingConfig,
    pub counting: CountingConfig,
    pub roi: RoiConfig,
    pub autocal: AutoCalConfig,
    pub drift: DriftConfig,
    pub tuner: TunerConfig,
    pub storage: StorageConfig,
    pub ops: OpsConfig,
}

impl AppConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| CounterError::config(format!("invalid configuration: {}", e)))
    }

    /// Load, apply environment overrides and validate
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| CounterError::config(format!("cannot read {}: {}", path.display(), e)))?;
        let mut config = Self::from_json_str(&json)?;
        config.apply_env_overrides();
        config.validate()?;
        log::info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(value) = std::env::var(MOCK_MODE_ENV) {
            if value.eq_ignore_ascii_case("true") || value == "1" {
                log::info!("{} set, forcing mock mode", MOCK_MODE_ENV);
                self.model.mock_mode = true;
            }
        }
    }

    /// Override tunable parameters with a saved profile
    pub fn apply_profile(&mut self, profile: &TuningProfile) {
        let p = &profile.params;
        self.model.conf_thresh = p.conf_thresh;
        self.tracking.affinity_threshold = p.affinity_threshold;
        self.tracking.min_box_area = p.min_box_area;
        self.counting.crossing.min_displacement_px = p.min_displacement_px;
        log::info!(
            "Applied tuning profile from {} (score {:.3})",
            profile.created_at,
            profile.score
        );
    }

    pub fn validate(&self) -> Result<()> {
        self.counting.line.validate()?;

        let unit = |name: &str, v: f32| -> Result<()> {
            if (0.0..=1.0).contains(&v) {
                Ok(())
            } else {
                Err(CounterError::config(format!("{} must be in [0, 1], got {}", name, v)))
            }
        };
        unit("model.conf_thresh", self.model.conf_thresh)?;
        unit("model.nms_thresh", self.model.nms_thresh)?;
        unit("tracking.affinity_threshold", self.tracking.affinity_threshold)?;
        unit("autocal.confidence_threshold", self.autocal.confidence_threshold)?;
        unit("drift.ssim_threshold", self.drift.ssim_threshold)?;
        if let Some(t) = self.drift.edge_iou_threshold {
            unit("drift.edge_iou_threshold", t)?;
        }

        if self.camera.width == 0 || self.camera.height == 0 || self.camera.fps <= 0.0 {
            return Err(CounterError::config("camera size and fps must be positive"));
        }
        if self.tracking.history_len < 2 {
            return Err(CounterError::config("tracking.history_len must be at least 2"));
        }
        if self.counting.crossing.dead_zone_px < 0.0 || self.counting.crossing.min_displacement_px < 0.0 {
            return Err(CounterError::config("counting distances must be non-negative"));
        }
        if self.autocal.grid_cols == 0 || self.autocal.grid_rows == 0 || self.autocal.top_k == 0 {
            return Err(CounterError::config("autocal grid and top_k must be non-zero"));
        }
        if self.drift.brightness_var_min > self.drift.brightness_var_max {
            return Err(CounterError::config(format!(
                "drift brightness band is inverted ({} > {})",
                self.drift.brightness_var_min, self.drift.brightness_var_max
            )));
        }
        if !(self.drift.check_interval_secs.is_finite() && self.drift.check_interval_secs > 0.0) {
            return Err(CounterError::config("drift.check_interval_secs must be positive"));
        }
        let non_negative = |name: &str, v: f64| -> Result<()> {
            if v.is_finite() && v >= 0.0 {
                Ok(())
            } else {
                Err(CounterError::config(format!("{} must be a finite non-negative number, got {}", name, v)))
            }
        };
        non_negative("drift.min_minutes_between_recal", self.drift.min_minutes_between_recal)?;
        non_negative("drift.recal_warmup_secs", self.drift.recal_warmup_secs)?;
        non_negative("drift.recal_timeout_secs", self.drift.recal_timeout_secs)?;
        non_negative("ops.shutdown_timeout_secs", self.ops.shutdown_timeout_secs)?;
        if !(self.roi.band_height_px.is_finite() && self.roi.band_height_px > 0.0) {
            return Err(CounterError::config("roi.band_height_px must be positive"));
        }
        if !(self.roi.margin_px.is_finite() && self.roi.margin_px >= 0.0) {
            return Err(CounterError::config("roi.margin_px must be non-negative"));
        }
        unit("roi.max_clip_ratio", self.roi.max_clip_ratio)?;
        if self.storage.queue_capacity == 0 || self.storage.batch_size == 0 {
            return Err(CounterError::config("storage queue_capacity and batch_size must be non-zero"));
        }
        if self.tuner.clip_fps <= 0.0 {
            return Err(CounterError::config("tuner.clip_fps must be positive"));
        }
        if self.ops.frame_publish_interval == 0 || self.ops.scheduler_threads == 0 {
            return Err(CounterError::config(
                "ops.frame_publish_interval and ops.scheduler_threads must be non-zero",
            ));
        }
        self.tuner.grid.validate()?;
        self.tuner.nightly_time()?;
        self.rollup_time()?;
        self.export_time()?;
        Ok(())
    }

    pub fn rollup_time(&self) -> Result<chrono::NaiveTime> {
        chrono::NaiveTime::parse_from_str(&self.ops.rollup_time, "%H:%M").map_err(|e| {
            CounterError::config(format!("ops.rollup_time {:?}: {}", self.ops.rollup_time, e))
        })
    }

    pub fn export_time(&self) -> Result<chrono::NaiveTime> {
        let raw = &self.storage.export_daily_time;
        chrono::NaiveTime::parse_from_str(raw, "%H:%M")
            .map_err(|e| CounterError::config(format!("storage.export_daily_time {:?}: {}", raw, e)))
    }

    pub fn postprocess_config(&self) -> PostprocessConfig {
        PostprocessConfig {
            conf_thresh: self.model.conf_thresh,
            nms_thresh: self.model.nms_thresh,
            max_detections: self.model.max_detections,
            class_filter: self.model.class_filter.clone(),
            min_box_area: self.tracking.min_box_area,
        }
    }

    pub fn tracker_config(&self) -> GreedyTrackerConfig {
        GreedyTrackerConfig {
            affinity_threshold: self.tracking.affinity_threshold,
            max_misses: self.tracking.max_misses,
            history_len: self.tracking.history_len,
            min_spawn_confidence: self.tracking.min_spawn_confidence,
            class_aware: self.tracking.class_aware,
        }
    }

    pub fn processor_settings(&self) -> ProcessorSettings {
        ProcessorSettings {
            postprocess: self.postprocess_config(),
            roi: self.roi.clone(),
            tracker: self.tracker_config(),
            crossing: self.counting.crossing.clone(),
        }
    }

    /// Mock scene whose traffic crosses the configured line
    pub fn scene_config(&self) -> SceneConfig {
        let d = self.counting.line.direction();
        let axis = if d.x.abs() >= d.y.abs() {
            MotionAxis::Vertical
        } else {
            MotionAxis::Horizontal
        };
        SceneConfig {
            width: self.camera.width,
            height: self.camera.height,
            fps: self.camera.fps,
            axis,
            lanes: 3,
            bidirectional: true,
            ..Default::default()
        }
    }
}

/// Source of the counting line and sink for replacements
pub trait ConfigProvider: Send + Sync {
    fn counting_line(&self) -> CountingLine;

    /// Durably record a newly applied line
    fn persist_line(&self, line: &CountingLine) -> Result<()>;
}

/// Keeps the line in memory only
pub struct StaticConfigProvider {
    line: Mutex<CountingLine>,
}

impl StaticConfigProvider {
    pub fn new(line: CountingLine) -> Self {
        Self {
            line: Mutex::new(line),
        }
    }
}

impl ConfigProvider for StaticConfigProvider {
    fn counting_line(&self) -> CountingLine {
        *self.line.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn persist_line(&self, line: &CountingLine) -> Result<()> {
        *self.line.lock().unwrap_or_else(|e| e.into_inner()) = *line;
        Ok(())
    }
}

/// Writes replacement lines back into the JSON config file
pub struct FileConfigProvider {
    path: PathBuf,
    line: Mutex<CountingLine>,
}

impl FileConfigProvider {
    pub fn new<P: Into<PathBuf>>(path: P, config: &AppConfig) -> Self {
        Self {
            path: path.into(),
            line: Mutex::new(config.counting.line),
        }
    }
}

impl ConfigProvider for FileConfigProvider {
    fn counting_line(&self) -> CountingLine {
        *self.line.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn persist_line(&self, line: &CountingLine) -> Result<()> {
        let mut guard = self.line.lock().unwrap_or_else(|e| e.into_inner());

        // Edit the raw document so unrelated keys and formatting choices survive
        let mut doc: serde_json::Value = match std::fs::read_to_string(&self.path) {
            Ok(text) => serde_json::from_str(&text)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => serde_json::json!({}),
            Err(e) => return Err(e.into()),
        };
        let root = doc
            .as_object_mut()
            .ok_or_else(|| CounterError::config("config root is not an object"))?;
        let counting = root
            .entry("counting")
            .or_insert_with(|| serde_json::json!({}));
        let counting = counting
            .as_object_mut()
            .ok_or_else(|| CounterError::config("counting section is not an object"))?;
        counting.insert("line".to_string(), serde_json::to_value(line)?);

        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(&doc)?)?;
        std::fs::rename(&tmp, &self.path)?;
        *guard = *line;
        log::info!("Counting line persisted to {}", self.path.display());
        Ok(())
    }
}
