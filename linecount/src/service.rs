//! Service assembly: live state, event writer, counting pipeline and the
//! scheduled calibration, drift, tuning, rollup and export tasks.

use crate::autocal::{AutoCalConfig, AutoCalibrator, CalibrationTap, WarmupOutcome, WarmupSession};
use crate::cancel::CancellationToken;
use crate::config::{AppConfig, ConfigProvider};
use crate::detector_trait::{ClipSource, DetectorFactory, FrameSource};
use crate::drift::{DriftAction, DriftConfig, DriftMonitor, RecalibrationOutcome};
use crate::error::{CounterError, Result};
use crate::export::export_csv;
use crate::line::CountingLine;
use crate::pipeline::{CountingPipeline, PipelineConfig, PipelineContext, PipelineSummary};
use crate::processor::{FrameProcessor, ProcessorSettings};
use crate::scheduler::{Schedule, ScheduledTask, Scheduler, TaskStatus};
use crate::state::LiveState;
use crate::store::{DailyRollup, EventStore, EventWriter, WriterStats};
use crate::tuner::{save_profile, Tuner, TunerConfig, TuningOutcome, TuningReport};
use crate::types::{CalibrationProposal, Frame};
use chrono::{NaiveDate, Utc};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// How a warm-up and proposal round ended
#[derive(Debug)]
pub enum CalibrationResult {
    /// The top proposal was confident and is now the active line
    Applied(CalibrationProposal),
    /// Proposals published for manual review
    Held(usize),
    /// Too little traffic to propose anything
    Empty,
    TimedOut,
    Cancelled,
}

/// Runs warm-ups through the pipeline tap and acts on the proposals
pub struct Calibration {
    calibrator: AutoCalibrator,
    tap: Arc<CalibrationTap>,
    state: Arc<LiveState>,
    frame_size: (u32, u32),
}

impl Calibration {
    pub fn new(
        config: AutoCalConfig,
        tap: Arc<CalibrationTap>,
        state: Arc<LiveState>,
        frame_size: (u32, u32),
    ) -> Self {
        Self {
            calibrator: AutoCalibrator::new(config),
            tap,
            state,
            frame_size,
        }
    }

    /// Warm up for `warmup_secs` of frame time, capped at `timeout_secs` of wall time
    pub fn warm_up(
        &self,
        warmup_secs: f64,
        timeout_secs: f64,
        cancel: &CancellationToken,
    ) -> Result<CalibrationResult> {
        let config = AutoCalConfig {
            timeout_secs,
            ..self.calibrator.config().clone()
        };
        let (width, height) = self.frame_size;
        let session = WarmupSession::new(width, height, &config, warmup_secs, cancel.clone());
        log::info!(
            "Calibration warm-up started ({:.0}s window, {:.0}s cap)",
            warmup_secs,
            timeout_secs
        );

        let evidence = match self.tap.run(session) {
            WarmupOutcome::Complete(evidence) => evidence,
            WarmupOutcome::TimedOut => {
                log::warn!("Calibration warm-up timed out after {:.0}s", timeout_secs);
                return Ok(CalibrationResult::TimedOut);
            }
            WarmupOutcome::Cancelled => {
                log::info!("Calibration warm-up cancelled");
                return Ok(CalibrationResult::Cancelled);
            }
        };

        let batch = self.calibrator.propose(&evidence, Utc::now());
        self.state.publish_proposals(batch.clone());
        if batch.is_empty() {
            log::warn!(
                "No calibration proposals ({} tracks observed)",
                batch.tracks_observed
            );
            return Ok(CalibrationResult::Empty);
        }

        match self.calibrator.select_confident(&batch) {
            Some(proposal) => {
                self.state.set_line(proposal.line)?;
                log::info!(
                    "Auto-applied calibration proposal (confidence {:.2}, {:?})",
                    proposal.confidence,
                    proposal.source
                );
                Ok(CalibrationResult::Applied(proposal.clone()))
            }
            None => {
                log::info!(
                    "Holding {} calibration proposals for review (top confidence {:.2})",
                    batch.proposals.len(),
                    batch.top().map(|p| p.confidence).unwrap_or_default()
                );
                Ok(CalibrationResult::Held(batch.proposals.len()))
            }
        }
    }
}

/// One-shot calibration after startup
pub struct CalibrationTask {
    calibration: Arc<Calibration>,
    warmup_secs: f64,
    timeout_secs: f64,
}

impl ScheduledTask for CalibrationTask {
    fn name(&self) -> &str {
        "autocal"
    }

    fn run(&self, cancel: &CancellationToken) -> Result<()> {
        match self.calibration.warm_up(self.warmup_secs, self.timeout_secs, cancel)? {
            CalibrationResult::TimedOut => Err(CounterError::calibration("warm-up timed out")),
            CalibrationResult::Cancelled => Err(CounterError::Cancelled),
            _ => Ok(()),
        }
    }
}

/// Periodic drift check against the latest published frame
pub struct DriftTask {
    monitor: Mutex<DriftMonitor>,
    config: DriftConfig,
    calibration: Arc<Calibration>,
    state: Arc<LiveState>,
}

impl DriftTask {
    pub fn new(config: DriftConfig, calibration: Arc<Calibration>, state: Arc<LiveState>) -> Self {
        Self {
            monitor: Mutex::new(DriftMonitor::new(config.clone())),
            config,
            calibration,
            state,
        }
    }

    fn monitor(&self) -> std::sync::MutexGuard<'_, DriftMonitor> {
        self.monitor.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn recalibrate(&self, fallback: Arc<Frame>, cancel: &CancellationToken) -> RecalibrationOutcome {
        log::info!("Recalibrating after drift");
        let result = self.calibration.warm_up(
            self.config.recal_warmup_secs,
            self.config.recal_timeout_secs,
            cancel,
        );
        match result {
            Ok(CalibrationResult::Applied(_)) => {
                let reference = self.state.latest_frame().unwrap_or(fallback);
                RecalibrationOutcome::Applied(Box::new(Frame::clone(&reference)))
            }
            Ok(CalibrationResult::Held(n)) => {
                RecalibrationOutcome::NotConfident(format!("{} proposals held for review", n))
            }
            Ok(CalibrationResult::Empty) => RecalibrationOutcome::NotConfident("no proposals".to_string()),
            Ok(CalibrationResult::TimedOut) => RecalibrationOutcome::Aborted("warm-up timed out".to_string()),
            Ok(CalibrationResult::Cancelled) => RecalibrationOutcome::Aborted("cancelled".to_string()),
            Err(e) => RecalibrationOutcome::NotConfident(e.to_string()),
        }
    }
}

impl ScheduledTask for DriftTask {
    fn name(&self) -> &str {
        "drift"
    }

    fn run(&self, cancel: &CancellationToken) -> Result<()> {
        let Some(frame) = self.state.latest_frame() else {
            log::debug!("Drift check skipped, no frame yet");
            return Ok(());
        };

        let action = {
            let mut monitor = self.monitor();
            let (_, action) = monitor.check(&frame, Utc::now());
            self.state.publish_drift(monitor.status());
            action
        };

        if action == DriftAction::Recalibrate {
            let outcome = self.recalibrate(frame, cancel);
            let mut monitor = self.monitor();
            monitor.complete_recalibration(outcome, Utc::now());
            self.state.publish_drift(monitor.status());
        }
        if cancel.is_cancelled() {
            return Err(CounterError::Cancelled);
        }
        Ok(())
    }
}

/// Nightly parameter search over a recorded clip
pub struct TuningTask {
    config: TunerConfig,
    /// Parameters of the active profile; replaced when a run applies a new one
    active: Mutex<ProcessorSettings>,
    state: Arc<LiveState>,
    detectors: Arc<dyn DetectorFactory>,
    clip: Arc<dyn ClipSource>,
}

impl TuningTask {
    pub fn new(
        config: TunerConfig,
        settings: ProcessorSettings,
        state: Arc<LiveState>,
        detectors: Arc<dyn DetectorFactory>,
        clip: Arc<dyn ClipSource>,
    ) -> Self {
        Self {
            config,
            active: Mutex::new(settings),
            state,
            detectors,
            clip,
        }
    }

    /// One full tuning pass; a selected profile is persisted before returning
    pub fn tune(&self, cancel: &CancellationToken) -> Result<TuningReport> {
        let settings = self.active.lock().unwrap_or_else(|e| e.into_inner()).clone();
        let tuner = Tuner::new(self.config.clone(), settings.clone(), self.state.line());
        let mut detector = self.detectors.create()?;
        let report = tuner.run(&mut *detector, self.clip.as_ref(), cancel, Utc::now())?;

        if let TuningOutcome::Applied(profile) = &report.outcome {
            save_profile(&self.config.profile_path, profile)?;
            *self.active.lock().unwrap_or_else(|e| e.into_inner()) = settings.with_params(&profile.params);
        }
        Ok(report)
    }
}

impl ScheduledTask for TuningTask {
    fn name(&self) -> &str {
        "tuning"
    }

    fn run(&self, cancel: &CancellationToken) -> Result<()> {
        self.tune(cancel).map(|_| ())
    }
}

/// Records the previous UTC day's totals
pub struct RollupTask {
    store: Arc<dyn EventStore>,
    path: PathBuf,
}

impl RollupTask {
    pub fn new<P: Into<PathBuf>>(store: Arc<dyn EventStore>, path: P) -> Self {
        Self {
            store,
            path: path.into(),
        }
    }

    pub fn record(&self, day: NaiveDate) -> Result<DailyRollup> {
        let rollup = self.store.rollup(day)?;
        log::info!(
            "Rollup {}: in={} out={} net={}",
            rollup.day,
            rollup.in_count,
            rollup.out_count,
            rollup.net
        );
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        let mut line = serde_json::to_vec(&rollup)?;
        line.push(b'\n');
        file.write_all(&line)?;
        Ok(rollup)
    }
}

impl ScheduledTask for RollupTask {
    fn name(&self) -> &str {
        "rollup"
    }

    fn run(&self, _cancel: &CancellationToken) -> Result<()> {
        let yesterday = (Utc::now() - chrono::Duration::days(1)).date_naive();
        self.record(yesterday).map(|_| ())
    }
}

/// Writes the previous UTC day's events to `<csv_dir>/<day>_counts.csv`
pub struct ExportTask {
    store: Arc<dyn EventStore>,
    csv_dir: PathBuf,
}

impl ExportTask {
    pub fn new<P: Into<PathBuf>>(store: Arc<dyn EventStore>, csv_dir: P) -> Self {
        Self {
            store,
            csv_dir: csv_dir.into(),
        }
    }

    pub fn export(&self, day: NaiveDate) -> Result<PathBuf> {
        export_csv(self.store.as_ref(), day, &self.csv_dir).map(|(path, _)| path)
    }
}

impl ScheduledTask for ExportTask {
    fn name(&self) -> &str {
        "export"
    }

    fn run(&self, _cancel: &CancellationToken) -> Result<()> {
        let yesterday = (Utc::now() - chrono::Duration::days(1)).date_naive();
        self.export(yesterday).map(|_| ())
    }
}

/// External collaborators the service is assembled from
pub struct ServiceParts {
    pub source: Box<dyn FrameSource>,
    pub detectors: Arc<dyn DetectorFactory>,
    pub store: Arc<dyn EventStore>,
    pub provider: Arc<dyn ConfigProvider>,
    /// Recording replayed by the nightly tuner; tuning is off without one
    pub tuning_clip: Option<Arc<dyn ClipSource>>,
    pub max_frames: Option<u64>,
}

/// Running counter: pipeline thread plus scheduled tasks
pub struct CountingService {
    state: Arc<LiveState>,
    writer: Arc<EventWriter>,
    pipeline: Option<CountingPipeline>,
    scheduler: Scheduler,
}

impl CountingService {
    pub fn start(config: &AppConfig, parts: ServiceParts) -> Result<Self> {
        config.validate()?;
        let state = Arc::new(LiveState::new(parts.provider)?);
        let writer = Arc::new(EventWriter::spawn(
            Arc::clone(&parts.store),
            config.storage.queue_capacity,
            config.storage.batch_size,
        )?);
        let tap = Arc::new(CalibrationTap::new());
        let settings = config.processor_settings();
        let frame_size = parts.source.frame_size();

        let pipeline = CountingPipeline::spawn(
            parts.source,
            parts.detectors.create()?,
            FrameProcessor::new(&settings)?,
            PipelineContext {
                state: Arc::clone(&state),
                tap: Arc::clone(&tap),
                writer: Arc::clone(&writer),
            },
            PipelineConfig {
                max_frames: parts.max_frames,
                ..PipelineConfig::from_ops(&config.ops)
            },
        )?;

        let mut scheduler = Scheduler::new(
            config.ops.scheduler_threads,
            Duration::from_secs_f64(config.ops.shutdown_timeout_secs.max(0.0)),
        )?;
        let calibration = Arc::new(Calibration::new(
            config.autocal.clone(),
            tap,
            Arc::clone(&state),
            frame_size,
        ));

        if config.autocal.enabled {
            scheduler.add(
                Arc::new(CalibrationTask {
                    calibration: Arc::clone(&calibration),
                    warmup_secs: config.autocal.warmup_secs,
                    timeout_secs: config.autocal.timeout_secs,
                }),
                Schedule::Once {
                    delay: Duration::ZERO,
                },
            )?;
        }
        if config.drift.enabled {
            scheduler.add(
                Arc::new(DriftTask::new(
                    config.drift.clone(),
                    Arc::clone(&calibration),
                    Arc::clone(&state),
                )),
                Schedule::Every(Duration::from_secs_f64(config.drift.check_interval_secs)),
            )?;
        }
        match (config.tuner.enabled, parts.tuning_clip) {
            (true, Some(clip)) => {
                scheduler.add(
                    Arc::new(TuningTask::new(
                        config.tuner.clone(),
                        settings,
                        Arc::clone(&state),
                        parts.detectors,
                        clip,
                    )),
                    Schedule::DailyAt(config.tuner.nightly_time()?),
                )?;
            }
            (true, None) => log::warn!("Tuning enabled but no clip configured, nightly tuning disabled"),
            (false, _) => {}
        }
        scheduler.add(
            Arc::new(RollupTask::new(Arc::clone(&parts.store), &config.storage.rollups_path)),
            Schedule::DailyAt(config.rollup_time()?),
        )?;
        scheduler.add(
            Arc::new(ExportTask::new(parts.store, &config.storage.csv_dir)),
            Schedule::DailyAt(config.export_time()?),
        )?;

        log::info!("Counting service started");
        Ok(Self {
            state,
            writer,
            pipeline: Some(pipeline),
            scheduler,
        })
    }

    pub fn state(&self) -> &Arc<LiveState> {
        &self.state
    }

    /// Manually apply proposal `index` from the latest batch
    pub fn apply_proposal(&self, index: usize) -> Result<CountingLine> {
        self.state.apply(index)
    }

    pub fn task_status(&self) -> Vec<TaskStatus> {
        self.scheduler.status()
    }

    pub fn writer_stats(&self) -> WriterStats {
        self.writer.stats()
    }

    pub fn is_running(&self) -> bool {
        self.pipeline.as_ref().is_some_and(|p| !p.is_finished())
    }

    /// Block until the pipeline ends on its own, then stop everything
    pub fn wait(mut self) -> Result<PipelineSummary> {
        let result = self.finish();
        self.shutdown_tasks();
        result
    }

    /// Stop the pipeline and every task
    pub fn shutdown(mut self) -> Result<PipelineSummary> {
        if let Some(pipeline) = &self.pipeline {
            pipeline.stop();
        }
        self.shutdown_tasks();
        self.finish()
    }

    fn finish(&mut self) -> Result<PipelineSummary> {
        match self.pipeline.take() {
            Some(pipeline) => pipeline.join(),
            None => Err(CounterError::pipeline("pipeline already joined")),
        }
    }

    fn shutdown_tasks(&mut self) {
        self.scheduler.shutdown();
        self.writer.flush();
        let stats = self.writer.stats();
        log::info!(
            "Counting service stopped: {} events written, {} dropped, {} failed",
            stats.written,
            stats.dropped,
            stats.failed
        );
    }
}
