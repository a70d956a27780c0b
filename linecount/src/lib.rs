//! Line-crossing object counter
//!
//! Counts objects crossing a configured line in a camera stream. Detections are
//! tracked with the `ioutrack` greedy IoU tracker, side changes of each track are
//! turned into IN/OUT events, and three background concerns keep the counter
//! honest over time:
//! - auto-calibration proposes a counting line from observed traffic
//! - the drift monitor notices camera movement or bad lighting and recalibrates
//! - the nightly tuner replays a recorded clip to pick steadier parameters
//!
//! ```rust,ignore
//! use linecount::config::{AppConfig, StaticConfigProvider};
//! use linecount::service::{CountingService, ServiceParts};
//!
//! let config = AppConfig::default();
//! let service = CountingService::start(&config, parts)?;
//! let summary = service.wait()?;
//! ```

pub mod autocal;
pub mod cancel;
pub mod config;
pub mod crossing;
pub mod detector_trait;
pub mod drift;
pub mod error;
pub mod export;
pub mod line;
pub mod pipeline;
pub mod postprocessing;
pub mod processor;
pub mod scheduler;
pub mod service;
pub mod state;
pub mod store;
pub mod synthetic;
pub mod tuner;
pub mod types;

pub use autocal::{AutoCalConfig, AutoCalibrator, CalibrationTap};
pub use cancel::CancellationToken;
pub use config::{AppConfig, ConfigProvider, FileConfigProvider, StaticConfigProvider};
pub use crossing::{CrossingConfig, CrossingEngine};
pub use detector_trait::{ClipSource, Detector, DetectorFactory, FrameSource};
pub use drift::{DriftConfig, DriftMonitor, DriftState, DriftStatus};
pub use error::{CounterError, Result};
pub use export::export_csv;
pub use line::CountingLine;
pub use pipeline::{backfill, CountingPipeline, PipelineConfig, PipelineSummary};
pub use postprocessing::{RoiConfig, RoiFilter};
pub use processor::{FrameProcessor, ProcessorSettings};
pub use scheduler::{Schedule, ScheduledTask, Scheduler};
pub use service::{CountingService, ExportTask, RollupTask, ServiceParts};
pub use state::LiveState;
pub use store::{DailyRollup, EventStore, EventWriter, JsonlEventStore, MemoryEventStore};
pub use tuner::{Tuner, TunerConfig, TuningOutcome};
pub use types::{
    CalibrationProposal, CrossingEvent, Direction, DriftSnapshot, Frame, ProposalBatch,
    RunningStats, TuningParams, TuningProfile,
};

/// Initialize the counting library
pub fn init() -> Result<()> {
    log::info!("linecount {} initialized", version());
    Ok(())
}

/// Get library version information
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
