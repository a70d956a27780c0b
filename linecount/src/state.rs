//! Shared live state read by reporting and written by the pipeline and tasks
//!
//! Each value sits behind a [`SnapshotCell`]: writers swap in a whole new
//! `Arc`, readers clone the current one. A reader therefore always holds a
//! complete snapshot and never waits longer than a pointer swap.

use crate::config::ConfigProvider;
use crate::drift::DriftStatus;
use crate::error::{CounterError, Result};
use crate::line::CountingLine;
use crate::types::{Frame, ProposalBatch, RunningStats};
use std::sync::{Arc, Mutex, RwLock};

/// Atomically replaceable snapshot
#[derive(Debug, Default)]
pub struct SnapshotCell<T> {
    inner: RwLock<Arc<T>>,
}

impl<T> SnapshotCell<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: RwLock::new(Arc::new(value)),
        }
    }

    pub fn load(&self) -> Arc<T> {
        Arc::clone(&self.inner.read().unwrap_or_else(|e| e.into_inner()))
    }

    pub fn store(&self, value: T) {
        self.store_arc(Arc::new(value));
    }

    pub fn store_arc(&self, value: Arc<T>) {
        *self.inner.write().unwrap_or_else(|e| e.into_inner()) = value;
    }
}

pub struct LiveState {
    stats: SnapshotCell<RunningStats>,
    line: SnapshotCell<CountingLine>,
    proposals: SnapshotCell<ProposalBatch>,
    drift: SnapshotCell<Option<DriftStatus>>,
    latest_frame: SnapshotCell<Option<Arc<Frame>>>,
    provider: Arc<dyn ConfigProvider>,
    /// Serializes line replacements so persist-then-swap stays ordered
    line_writer: Mutex<()>,
}

impl LiveState {
    pub fn new(provider: Arc<dyn ConfigProvider>) -> Result<Self> {
        let line = provider.counting_line();
        line.validate()?;
        Ok(Self {
            stats: SnapshotCell::default(),
            line: SnapshotCell::new(line),
            proposals: SnapshotCell::default(),
            drift: SnapshotCell::new(None),
            latest_frame: SnapshotCell::new(None),
            provider,
            line_writer: Mutex::new(()),
        })
    }

    pub fn stats(&self) -> RunningStats {
        *self.stats.load()
    }

    pub fn publish_stats(&self, stats: RunningStats) {
        self.stats.store(stats);
    }

    pub fn line(&self) -> CountingLine {
        *self.line.load()
    }

    pub fn proposals(&self) -> Arc<ProposalBatch> {
        self.proposals.load()
    }

    pub fn publish_proposals(&self, batch: ProposalBatch) {
        self.proposals.store(batch);
    }

    pub fn drift(&self) -> Option<DriftStatus> {
        (*self.drift.load()).clone()
    }

    pub fn publish_drift(&self, status: DriftStatus) {
        self.drift.store(Some(status));
    }

    pub fn latest_frame(&self) -> Option<Arc<Frame>> {
        (*self.latest_frame.load()).clone()
    }

    pub fn publish_frame(&self, frame: Arc<Frame>) {
        self.latest_frame.store(Some(frame));
    }

    /// Validate, persist, then swap in a new counting line.
    ///
    /// On any error the active line is left as it was.
    pub fn set_line(&self, line: CountingLine) -> Result<()> {
        line.validate()?;
        let _guard = self.line_writer.lock().unwrap_or_else(|e| e.into_inner());
        self.provider.persist_line(&line)?;
        self.line.store(line);
        log::info!(
            "Counting line set to ({:.0},{:.0})-({:.0},{:.0}), in side {:?}",
            line.start.x,
            line.start.y,
            line.end.x,
            line.end.y,
            line.in_side
        );
        Ok(())
    }

    /// Apply proposal `index` from the current batch
    pub fn apply(&self, index: usize) -> Result<CountingLine> {
        let batch = self.proposals();
        let proposal = batch.proposals.get(index).ok_or(CounterError::InvalidProposal {
            index,
            available: batch.proposals.len(),
        })?;
        self.set_line(proposal.line)?;
        Ok(proposal.line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StaticConfigProvider;
    use crate::types::{CalibrationProposal, CandidateSource, Direction, ScoreBreakdown};
    use ioutrack::Side;
    use nalgebra::Point2;
    use std::thread;

    fn line(y: f32) -> CountingLine {
        CountingLine::new(Point2::new(0.0, y), Point2::new(100.0, y), Side::Negative).unwrap()
    }

    fn state() -> (Arc<StaticConfigProvider>, LiveState) {
        let provider = Arc::new(StaticConfigProvider::new(line(50.0)));
        let state = LiveState::new(provider.clone()).unwrap();
        (provider, state)
    }

    fn proposal(y: f32, confidence: f32) -> CalibrationProposal {
        CalibrationProposal {
            line: line(y),
            confidence,
            source: CandidateSource::Hough,
            breakdown: ScoreBreakdown::default(),
        }
    }

    #[test]
    fn test_apply_swaps_and_persists() {
        let (provider, state) = state();
        state.publish_proposals(ProposalBatch {
            proposals: vec![proposal(10.0, 0.9), proposal(20.0, 0.5)],
            generated_at: None,
            tracks_observed: 8,
        });
        let applied = state.apply(1).unwrap();
        assert_eq!(applied, line(20.0));
        assert_eq!(state.line(), line(20.0));
        assert_eq!(provider.counting_line(), line(20.0));
    }

    #[test]
    fn test_apply_out_of_range() {
        let (_, state) = state();
        let err = state.apply(0).unwrap_err();
        assert!(matches!(err, CounterError::InvalidProposal { index: 0, available: 0 }));
        assert_eq!(state.line(), line(50.0));
    }

    #[test]
    fn test_invalid_line_leaves_state() {
        let (_, state) = state();
        let bad = CountingLine {
            start: Point2::new(5.0, 5.0),
            end: Point2::new(5.0, 5.0),
            in_side: Side::Negative,
        };
        assert!(state.set_line(bad).is_err());
        assert_eq!(state.line(), line(50.0));
    }

    #[test]
    fn test_readers_see_consistent_stats() {
        let (_, state) = state();
        let state = Arc::new(state);
        let writer = {
            let state = Arc::clone(&state);
            thread::spawn(move || {
                let mut stats = RunningStats::default();
                for i in 0..2000 {
                    let dir = if i % 3 == 0 { Direction::Out } else { Direction::In };
                    stats = stats.with_event(dir);
                    state.publish_stats(stats);
                }
            })
        };
        for _ in 0..2000 {
            let s = state.stats();
            assert_eq!(s.net(), s.in_count() as i64 - s.out_count() as i64);
        }
        writer.join().unwrap();
        assert_eq!(state.stats().in_count() + state.stats().out_count(), 2000);
    }
}
