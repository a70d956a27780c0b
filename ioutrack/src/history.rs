//! Bounded ring buffer of recent track positions

use chrono::{DateTime, Utc};
use nalgebra::{Point2, Vector2};
use std::collections::VecDeque;

/// Fixed-capacity position history; the oldest sample is dropped on overflow.
#[derive(Debug, Clone)]
pub struct PositionHistory {
    capacity: usize,
    samples: VecDeque<(Point2<f32>, DateTime<Utc>)>,
}

impl PositionHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(2);
        Self {
            capacity,
            samples: VecDeque::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, position: Point2<f32>, timestamp: DateTime<Utc>) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back((position, timestamp));
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn latest(&self) -> Option<Point2<f32>> {
        self.samples.back().map(|(p, _)| *p)
    }

    pub fn previous(&self) -> Option<Point2<f32>> {
        let n = self.samples.len();
        if n < 2 {
            return None;
        }
        self.samples.get(n - 2).map(|(p, _)| *p)
    }

    /// Displacement between the last two samples
    pub fn last_step(&self) -> Option<Vector2<f32>> {
        Some(self.latest()? - self.previous()?)
    }

    /// Mean velocity in pixels per second over the retained window.
    ///
    /// Falls back to pixels per sample when timestamps do not advance.
    pub fn velocity(&self) -> Option<Vector2<f32>> {
        let (first, t0) = *self.samples.front()?;
        let (last, t1) = *self.samples.back()?;
        if self.samples.len() < 2 {
            return None;
        }
        let dt = (t1 - t0).num_milliseconds() as f32 / 1000.0;
        let delta = last - first;
        if dt > 0.0 {
            Some(delta / dt)
        } else {
            Some(delta / (self.samples.len() - 1) as f32)
        }
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Point2<f32>> + ExactSizeIterator {
        self.samples.iter().map(|(p, _)| p)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use chrono::Duration;

    #[test]
    fn test_ring_buffer_drops_oldest() {
        let t0 = Utc::now();
        let mut history = PositionHistory::new(3);
        for i in 0..5 {
            history.push(Point2::new(i as f32, 0.0), t0 + Duration::milliseconds(i * 100));
        }
        assert_eq!(history.len(), 3);
        let xs: Vec<f32> = history.iter().map(|p| p.x).collect();
        assert_eq!(xs, vec![2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_velocity_per_second() {
        let t0 = Utc::now();
        let mut history = PositionHistory::new(8);
        history.push(Point2::new(0.0, 0.0), t0);
        history.push(Point2::new(10.0, 5.0), t0 + Duration::milliseconds(500));
        let v = history.velocity().unwrap();
        assert_abs_diff_eq!(v.x, 20.0, epsilon = 1e-4);
        assert_abs_diff_eq!(v.y, 10.0, epsilon = 1e-4);
        assert_eq!(history.last_step().unwrap(), Vector2::new(10.0, 5.0));
    }

    #[test]
    fn test_single_sample_has_no_direction() {
        let mut history = PositionHistory::new(4);
        history.push(Point2::new(1.0, 1.0), Utc::now());
        assert!(history.velocity().is_none());
        assert!(history.last_step().is_none());
    }
}
