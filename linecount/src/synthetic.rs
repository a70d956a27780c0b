//! Synthetic and recorded stand-ins for the camera and the detection model
//!
//! `SyntheticScene` renders objects moving along lanes and pairs with a
//! `SceneDetector` that reports where those objects are, so mock mode, demos and
//! tests exercise the full counting path without hardware. `RecordedClip`
//! replays a directory of image files; `ScriptedDetector` plays back a fixed
//! list of detections per frame.

use crate::detector_trait::{ClipSource, Detector, FrameSource};
use crate::error::{CounterError, Result};
use crate::types::Frame;
use chrono::{DateTime, Duration, Utc};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_line_segment_mut};
use imageproc::rect::Rect;
use ioutrack::{Bbox, Detection};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Axis objects travel along
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MotionAxis {
    Horizontal,
    Vertical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SceneConfig {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub axis: MotionAxis,
    pub lanes: u32,
    /// Frames between consecutive object spawns
    pub spawn_interval: u64,
    /// Travel per frame in pixels
    pub speed_px: f32,
    /// (width, height) of each object box
    pub box_size: (f32, f32),
    /// Odd lanes travel in the opposite direction
    pub bidirectional: bool,
    /// Uniform positional noise added to reported boxes
    pub jitter_px: f32,
    /// Probability of the detector missing an object in a frame
    pub miss_rate: f32,
    pub seed: u64,
    /// Stop after this many frames; `None` loops forever
    pub max_frames: Option<u64>,
}

impl Default for SceneConfig {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            fps: 25.0,
            axis: MotionAxis::Horizontal,
            lanes: 2,
            spawn_interval: 30,
            speed_px: 8.0,
            box_size: (40.0, 60.0),
            bidirectional: false,
            jitter_px: 0.0,
            miss_rate: 0.0,
            seed: 7,
            max_frames: None,
        }
    }
}

impl SceneConfig {
    fn lane_of(&self, index: u64) -> u32 {
        (index % self.lanes.max(1) as u64) as u32
    }

    fn lane_center(&self, lane: u32) -> f32 {
        let across = match self.axis {
            MotionAxis::Horizontal => self.height,
            MotionAxis::Vertical => self.width,
        } as f32;
        across * (lane + 1) as f32 / (self.lanes.max(1) + 1) as f32
    }

    fn reversed(&self, lane: u32) -> bool {
        self.bidirectional && lane % 2 == 1
    }

    /// Number of frames an object needs to cross the whole frame
    fn lifetime(&self) -> u64 {
        let (along, size) = match self.axis {
            MotionAxis::Horizontal => (self.width as f32, self.box_size.0),
            MotionAxis::Vertical => (self.height as f32, self.box_size.1),
        };
        ((along + size) / self.speed_px.max(0.1)).ceil() as u64
    }

    /// Noise-free boxes of all objects visible in `frame_id`, keyed by object index
    pub fn objects_at(&self, frame_id: u64) -> Vec<(u64, Bbox)> {
        let interval = self.spawn_interval.max(1);
        let lifetime = self.lifetime();
        let first = frame_id.saturating_sub(lifetime) / interval;
        let last = frame_id / interval;
        let (bw, bh) = self.box_size;
        let (w, h) = (self.width as f32, self.height as f32);

        (first..=last)
            .filter_map(|index| {
                let age = frame_id.checked_sub(index * interval)?;
                if age > lifetime {
                    return None;
                }
                let lane = self.lane_of(index);
                let center = self.lane_center(lane);
                let travel = self.speed_px * age as f32;
                let bbox = match (self.axis, self.reversed(lane)) {
                    (MotionAxis::Horizontal, false) => {
                        Bbox::from_xywh(travel - bw, center - bh / 2.0, bw, bh)
                    }
                    (MotionAxis::Horizontal, true) => {
                        Bbox::from_xywh(w - travel, center - bh / 2.0, bw, bh)
                    }
                    (MotionAxis::Vertical, false) => {
                        Bbox::from_xywh(center - bw / 2.0, travel - bh, bw, bh)
                    }
                    (MotionAxis::Vertical, true) => {
                        Bbox::from_xywh(center - bw / 2.0, h - travel, bw, bh)
                    }
                };
                let clipped = Bbox::new(
                    bbox.xmin.max(0.0),
                    bbox.ymin.max(0.0),
                    bbox.xmax.min(w),
                    bbox.ymax.min(h),
                );
                // Mostly off-frame objects are not reported
                (clipped.area() >= bbox.area() * 0.25).then_some((index, clipped))
            })
            .collect()
    }
}

/// Rendered frame source for mock mode
pub struct SyntheticScene {
    config: SceneConfig,
    start: DateTime<Utc>,
    next_frame: u64,
    background: RgbImage,
}

impl SyntheticScene {
    pub fn new(config: SceneConfig, start: DateTime<Utc>) -> Self {
        let background = Self::render_background(&config);
        log::info!(
            "Synthetic scene {}x{} @ {:.1} fps, {} lanes ({:?})",
            config.width,
            config.height,
            config.fps,
            config.lanes,
            config.axis
        );
        Self {
            config,
            start,
            next_frame: 0,
            background,
        }
    }

    pub fn config(&self) -> &SceneConfig {
        &self.config
    }

    /// Detector that reports this scene's objects
    pub fn detector(&self) -> SceneDetector {
        SceneDetector::new(self.config.clone())
    }

    /// Static road markings: curbs along the motion axis and a stop bar across it
    fn render_background(config: &SceneConfig) -> RgbImage {
        let (w, h) = (config.width, config.height);
        let mut img = RgbImage::from_pixel(w, h, Rgb([80, 80, 80]));
        let marking = Rgb([220, 220, 220]);
        let (wf, hf) = (w as f32, h as f32);
        match config.axis {
            MotionAxis::Horizontal => {
                for y in [hf * 0.08, hf * 0.92] {
                    draw_line_segment_mut(&mut img, (0.0, y), (wf, y), marking);
                }
                draw_filled_rect_mut(
                    &mut img,
                    Rect::at((wf * 0.5) as i32 - 3, (hf * 0.08) as i32).of_size(6, (hf * 0.84) as u32),
                    marking,
                );
            }
            MotionAxis::Vertical => {
                for x in [wf * 0.08, wf * 0.92] {
                    draw_line_segment_mut(&mut img, (x, 0.0), (x, hf), marking);
                }
                draw_filled_rect_mut(
                    &mut img,
                    Rect::at((wf * 0.08) as i32, (hf * 0.5) as i32 - 3).of_size((wf * 0.84) as u32, 6),
                    marking,
                );
            }
        }
        img
    }

    pub fn render(&self, frame_id: u64) -> RgbImage {
        let mut img = self.background.clone();
        for (index, bbox) in self.config.objects_at(frame_id) {
            let shade = 120 + ((index * 37) % 100) as u8;
            let (bw, bh) = (bbox.width().max(1.0) as u32, bbox.height().max(1.0) as u32);
            draw_filled_rect_mut(
                &mut img,
                Rect::at(bbox.xmin as i32, bbox.ymin as i32).of_size(bw, bh),
                Rgb([shade, 40, 255 - shade]),
            );
        }
        img
    }

    pub fn timestamp_of(&self, frame_id: u64) -> DateTime<Utc> {
        frame_timestamp(self.start, frame_id, self.config.fps)
    }
}

impl FrameSource for SyntheticScene {
    fn next_frame(&mut self) -> Result<Option<Frame>> {
        if self.config.max_frames.is_some_and(|max| self.next_frame >= max) {
            return Ok(None);
        }
        let frame_id = self.next_frame;
        self.next_frame += 1;
        Ok(Some(Frame::new(
            frame_id,
            self.render(frame_id),
            self.timestamp_of(frame_id),
        )))
    }

    fn frame_size(&self) -> (u32, u32) {
        (self.config.width, self.config.height)
    }
}

fn frame_timestamp(start: DateTime<Utc>, frame_id: u64, fps: f64) -> DateTime<Utc> {
    let micros = (frame_id as f64 * 1e6 / fps.max(1e-3)) as i64;
    start + Duration::microseconds(micros)
}

/// Mock detector backed by the scene geometry.
///
/// Noise is seeded per frame so replays of the same frames give identical output.
pub struct SceneDetector {
    config: SceneConfig,
}

impl SceneDetector {
    pub fn new(config: SceneConfig) -> Self {
        Self { config }
    }
}

impl Detector for SceneDetector {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
        let mut rng = StdRng::seed_from_u64(self.config.seed ^ frame.frame_id.wrapping_mul(0x9E37_79B9));
        let jitter = self.config.jitter_px;
        let detections = self
            .config
            .objects_at(frame.frame_id)
            .into_iter()
            .filter_map(|(_, bbox)| {
                if rng.random::<f32>() < self.config.miss_rate {
                    return None;
                }
                let bbox = if jitter > 0.0 {
                    bbox.translate(
                        rng.random_range(-jitter..=jitter),
                        rng.random_range(-jitter..=jitter),
                    )
                } else {
                    bbox
                };
                let confidence = 0.7 + 0.25 * rng.random::<f32>();
                Some(Detection::new(bbox, 0, confidence, frame.timestamp))
            })
            .collect();
        Ok(detections)
    }

    fn name(&self) -> &str {
        "synthetic-scene"
    }
}

/// Scripted failure for [`ScriptedDetector`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptedFailure {
    Transient,
    Fatal,
}

/// Plays back a fixed detection list per call; returns no detections after the script ends
pub struct ScriptedDetector {
    script: Vec<Vec<Bbox>>,
    confidence: f32,
    failures: HashMap<usize, ScriptedFailure>,
    calls: usize,
}

impl ScriptedDetector {
    pub fn new(script: Vec<Vec<Bbox>>) -> Self {
        Self {
            script,
            confidence: 0.9,
            failures: HashMap::new(),
            calls: 0,
        }
    }

    /// Fail the `call`-th invocation (0-based)
    pub fn fail_on(mut self, call: usize, failure: ScriptedFailure) -> Self {
        self.failures.insert(call, failure);
        self
    }
}

impl Detector for ScriptedDetector {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
        let call = self.calls;
        self.calls += 1;
        match self.failures.get(&call) {
            Some(ScriptedFailure::Transient) => {
                return Err(CounterError::detector(format!("scripted failure on call {}", call)))
            }
            Some(ScriptedFailure::Fatal) => {
                return Err(CounterError::detector_fatal(format!(
                    "scripted fatal failure on call {}",
                    call
                )))
            }
            None => {}
        }
        Ok(self
            .script
            .get(call)
            .map(|boxes| {
                boxes
                    .iter()
                    .map(|b| Detection::new(*b, 0, self.confidence, frame.timestamp))
                    .collect()
            })
            .unwrap_or_default())
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

/// Directory of image frames replayed in file-name order at a fixed rate
pub struct RecordedClip {
    paths: Vec<PathBuf>,
    fps: f64,
    start: DateTime<Utc>,
    cursor: usize,
    frame_size: (u32, u32),
}

const CLIP_EXTENSIONS: [&str; 4] = ["png", "jpg", "jpeg", "bmp"];

impl RecordedClip {
    pub fn open<P: AsRef<Path>>(dir: P, fps: f64, start: DateTime<Utc>) -> Result<Self> {
        let dir = dir.as_ref();
        let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.extension()
                    .and_then(|ext| ext.to_str())
                    .is_some_and(|ext| CLIP_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
            })
            .collect();
        paths.sort();

        let first = paths
            .first()
            .ok_or_else(|| CounterError::config(format!("no image frames in {}", dir.display())))?;
        let frame_size = image::image_dimensions(first)?;
        log::info!(
            "Opened clip {} ({} frames, {}x{} @ {:.1} fps)",
            dir.display(),
            paths.len(),
            frame_size.0,
            frame_size.1,
            fps
        );
        Ok(Self {
            paths,
            fps,
            start,
            cursor: 0,
            frame_size,
        })
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    pub fn rewind(&mut self) {
        self.cursor = 0;
    }

    /// Decode every readable frame; unreadable files are skipped with a warning
    pub fn load_all(&mut self) -> Vec<Frame> {
        self.rewind();
        let mut frames = Vec::with_capacity(self.paths.len());
        while self.cursor < self.paths.len() {
            match self.next_frame() {
                Ok(Some(frame)) => frames.push(frame),
                Ok(None) => break,
                Err(e) => log::warn!("Skipping clip frame: {}", e),
            }
        }
        frames
    }
}

impl FrameSource for RecordedClip {
    fn next_frame(&mut self) -> Result<Option<Frame>> {
        let index = self.cursor;
        let path = match self.paths.get(index) {
            Some(path) => path,
            None => return Ok(None),
        };
        self.cursor += 1;
        let image = image::open(path)
            .map_err(|e| CounterError::frame_read(format!("{}: {}", path.display(), e)))?
            .to_rgb8();
        Ok(Some(Frame::new(
            index as u64,
            image,
            frame_timestamp(self.start, index as u64, self.fps),
        )))
    }

    fn frame_size(&self) -> (u32, u32) {
        self.frame_size
    }
}

/// Replays a clip directory from its first frame on every `open`
pub struct ClipDir {
    pub dir: PathBuf,
    pub fps: f64,
    pub start: DateTime<Utc>,
}

impl ClipSource for ClipDir {
    fn open(&self) -> Result<Box<dyn FrameSource>> {
        Ok(Box::new(RecordedClip::open(&self.dir, self.fps, self.start)?))
    }
}

/// A fixed-length synthetic recording
pub struct SyntheticClip {
    pub config: SceneConfig,
    pub start: DateTime<Utc>,
}

impl SyntheticClip {
    pub fn new(mut config: SceneConfig, frames: u64, start: DateTime<Utc>) -> Self {
        config.max_frames = Some(frames);
        Self { config, start }
    }

    pub fn detector(&self) -> SceneDetector {
        SceneDetector::new(self.config.clone())
    }
}

impl ClipSource for SyntheticClip {
    fn open(&self) -> Result<Box<dyn FrameSource>> {
        Ok(Box::new(SyntheticScene::new(self.config.clone(), self.start)))
    }
}

/// Write a synthetic clip to `dir` as numbered PNG files
pub fn write_clip<P: AsRef<Path>>(scene: &SyntheticScene, frames: u64, dir: P) -> Result<()> {
    let dir = dir.as_ref();
    std::fs::create_dir_all(dir)?;
    for frame_id in 0..frames {
        scene
            .render(frame_id)
            .save(dir.join(format!("frame_{:06}.png", frame_id)))?;
    }
    Ok(())
}
