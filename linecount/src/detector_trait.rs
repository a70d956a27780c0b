/// Seams for the two external collaborators of the counting loop
///
/// The pipeline works with any detector (accelerated model or synthetic
/// generator) and any frame source (camera, clip directory, synthetic scene)
/// as long as they implement these interfaces.
use crate::error::Result;
use crate::types::Frame;
use ioutrack::Detection;

/// Common interface for object detectors
pub trait Detector: Send {
    /// Detect objects in a single frame.
    ///
    /// `CounterError::DetectorError` is treated as a skipped frame,
    /// `CounterError::DetectorFatal` stops the pipeline.
    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>>;

    /// Detector name (for logging/debugging)
    fn name(&self) -> &str;
}

/// Produces frames in order
pub trait FrameSource: Send {
    /// Next frame, or `None` at end of stream. Looping sources never return `None`.
    ///
    /// `CounterError::FrameReadError` is recoverable; the caller moves on.
    fn next_frame(&mut self) -> Result<Option<Frame>>;

    /// Frame dimensions (width, height)
    fn frame_size(&self) -> (u32, u32);
}

impl<D: Detector + ?Sized> Detector for Box<D> {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
        (**self).detect(frame)
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn next_frame(&mut self) -> Result<Option<Frame>> {
        (**self).next_frame()
    }

    fn frame_size(&self) -> (u32, u32) {
        (**self).frame_size()
    }
}

/// Builds detector instances, e.g. one for the live loop and one for tuning replays
pub trait DetectorFactory: Send + Sync {
    fn create(&self) -> Result<Box<dyn Detector>>;
}

impl<F> DetectorFactory for F
where
    F: Fn() -> Result<Box<dyn Detector>> + Send + Sync,
{
    fn create(&self) -> Result<Box<dyn Detector>> {
        self()
    }
}

/// A recording that can be replayed from the start any number of times
pub trait ClipSource: Send + Sync {
    fn open(&self) -> Result<Box<dyn FrameSource>>;
}
