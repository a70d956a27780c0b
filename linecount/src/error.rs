//! Error types for the line-crossing counter

use thiserror::Error;

/// Result type alias for the counting library
pub type Result<T> = std::result::Result<T, CounterError>;

/// Errors that can occur while counting, calibrating, monitoring or tuning
#[derive(Error, Debug)]
pub enum CounterError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid counting line: {0}")]
    InvalidLine(String),

    #[error("No calibration proposal at index {index} (batch has {available})")]
    InvalidProposal { index: usize, available: usize },

    #[error("Frame read failed: {0}")]
    FrameReadError(String),

    #[error("Detection failed: {0}")]
    DetectorError(String),

    #[error("Detector unavailable: {0}")]
    DetectorFatal(String),

    #[error("Event store unavailable: {0}")]
    StorageError(String),

    #[error("Calibration failed: {0}")]
    CalibrationError(String),

    #[error("Tuning failed: {0}")]
    TuningError(String),

    #[error("Scheduler error: {0}")]
    SchedulerError(String),

    #[error("Pipeline failed: {0}")]
    PipelineError(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Image processing error: {0}")]
    ImageError(#[from] image::ImageError),

    #[error("JSON serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    CsvError(#[from] csv::Error),
}

impl CounterError {
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::ConfigError(msg.into())
    }

    pub fn invalid_line<S: Into<String>>(msg: S) -> Self {
        Self::InvalidLine(msg.into())
    }

    pub fn frame_read<S: Into<String>>(msg: S) -> Self {
        Self::FrameReadError(msg.into())
    }

    pub fn detector<S: Into<String>>(msg: S) -> Self {
        Self::DetectorError(msg.into())
    }

    pub fn detector_fatal<S: Into<String>>(msg: S) -> Self {
        Self::DetectorFatal(msg.into())
    }

    pub fn storage<S: Into<String>>(msg: S) -> Self {
        Self::StorageError(msg.into())
    }

    pub fn calibration<S: Into<String>>(msg: S) -> Self {
        Self::CalibrationError(msg.into())
    }

    pub fn tuning<S: Into<String>>(msg: S) -> Self {
        Self::TuningError(msg.into())
    }

    pub fn scheduler<S: Into<String>>(msg: S) -> Self {
        Self::SchedulerError(msg.into())
    }

    pub fn pipeline<S: Into<String>>(msg: S) -> Self {
        Self::PipelineError(msg.into())
    }

    /// Errors the process cannot continue past: undefined geometry, no detector,
    /// no durable storage. Everything else is absorbed where it happens.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::ConfigError(_) | Self::InvalidLine(_) | Self::DetectorFatal(_) | Self::StorageError(_)
        )
    }
}
