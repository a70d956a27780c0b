//! Counting line geometry

use crate::error::{CounterError, Result};
use crate::types::Direction;
use ioutrack::Side;
use nalgebra::{Point2, Vector2};
use serde::{Deserialize, Serialize};

fn default_in_side() -> Side {
    Side::Negative
}

/// The active counting segment.
///
/// Signed distance is `cross(end - start, p - start) / |end - start|`. With image
/// coordinates (y down) a left-to-right line has its positive side below it.
/// A track that ends up on `in_side` after a crossing is counted IN.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CountingLine {
    pub start: Point2<f32>,
    pub end: Point2<f32>,
    #[serde(default = "default_in_side")]
    pub in_side: Side,
}

impl CountingLine {
    /// Shortest segment accepted as a counting line, in pixels
    pub const MIN_LENGTH: f32 = 1.0;

    pub fn new(start: Point2<f32>, end: Point2<f32>, in_side: Side) -> Result<Self> {
        let line = Self {
            start,
            end,
            in_side,
        };
        line.validate()?;
        Ok(line)
    }

    pub fn validate(&self) -> Result<()> {
        let coords = [self.start.x, self.start.y, self.end.x, self.end.y];
        if coords.iter().any(|v| !v.is_finite()) {
            return Err(CounterError::invalid_line(format!(
                "non-finite endpoints {:?}",
                coords
            )));
        }
        if self.length() < Self::MIN_LENGTH {
            return Err(CounterError::invalid_line(format!(
                "segment is degenerate ({:.2}px)",
                self.length()
            )));
        }
        Ok(())
    }

    pub fn direction(&self) -> Vector2<f32> {
        self.end - self.start
    }

    pub fn length(&self) -> f32 {
        self.direction().norm()
    }

    pub fn midpoint(&self) -> Point2<f32> {
        nalgebra::center(&self.start, &self.end)
    }

    /// Unit normal pointing to the positive side
    pub fn normal(&self) -> Vector2<f32> {
        let d = self.direction();
        Vector2::new(-d.y, d.x) / d.norm()
    }

    pub fn signed_distance(&self, p: &Point2<f32>) -> f32 {
        let d = self.direction();
        let v = p - self.start;
        (d.x * v.y - d.y * v.x) / d.norm()
    }

    pub fn side_of(&self, p: &Point2<f32>, dead_zone: f32) -> Option<Side> {
        Side::from_distance(self.signed_distance(p), dead_zone)
    }

    /// Direction label for a move that ended on `to`
    pub fn direction_for(&self, to: Side) -> Direction {
        if to == self.in_side {
            Direction::In
        } else {
            Direction::Out
        }
    }

    /// Does the move `a -> b` pass through the finite segment?
    pub fn crosses_segment(&self, a: &Point2<f32>, b: &Point2<f32>) -> bool {
        let da = self.signed_distance(a);
        let db = self.signed_distance(b);
        if da * db > 0.0 || (da == 0.0 && db == 0.0) {
            return false;
        }
        // Where the move meets the infinite line, projected onto the segment
        let t = da / (da - db);
        let hit = a + (b - a) * t;
        let d = self.direction();
        let along = (hit - self.start).dot(&d) / d.norm_squared();
        (0.0..=1.0).contains(&along)
    }
}
