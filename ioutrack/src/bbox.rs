//! Bounding box operations and IoU calculations

use nalgebra::Point2;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Axis-aligned box in pixel coordinates, `(xmin, ymin)` top-left.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bbox {
    pub xmin: f32,
    pub ymin: f32,
    pub xmax: f32,
    pub ymax: f32,
}

impl Bbox {
    pub fn new(xmin: f32, ymin: f32, xmax: f32, ymax: f32) -> Self {
        Self {
            xmin,
            ymin,
            xmax,
            ymax,
        }
    }

    /// Build from a top-left corner plus size
    pub fn from_xywh(x: f32, y: f32, w: f32, h: f32) -> Self {
        Self::new(x, y, x + w, y + h)
    }

    pub fn width(&self) -> f32 {
        self.xmax - self.xmin
    }

    pub fn height(&self) -> f32 {
        self.ymax - self.ymin
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    pub fn center_x(&self) -> f32 {
        (self.xmin + self.xmax) / 2.0
    }

    pub fn center_y(&self) -> f32 {
        (self.ymin + self.ymax) / 2.0
    }

    pub fn centroid(&self) -> Point2<f32> {
        Point2::new(self.center_x(), self.center_y())
    }

    /// Finite coordinates with a strictly positive extent
    pub fn is_valid(&self) -> bool {
        self.to_bounds().iter().all(|v| v.is_finite())
            && self.xmax > self.xmin
            && self.ymax > self.ymin
    }

    /// Convert to bounds array [xmin, ymin, xmax, ymax]
    pub fn to_bounds(&self) -> [f32; 4] {
        [self.xmin, self.ymin, self.xmax, self.ymax]
    }

    /// Shift the box by `(dx, dy)`
    pub fn translate(&self, dx: f32, dy: f32) -> Self {
        Self::new(self.xmin + dx, self.ymin + dy, self.xmax + dx, self.ymax + dy)
    }
}

impl fmt::Display for Bbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Bbox({:.1}, {:.1}, {:.1}, {:.1})",
            self.xmin, self.ymin, self.xmax, self.ymax
        )
    }
}

/// Calculate IoU between two bounding boxes
pub fn calculate_iou(bbox1: &Bbox, bbox2: &Bbox) -> f32 {
    let x1 = bbox1.xmin.max(bbox2.xmin);
    let y1 = bbox1.ymin.max(bbox2.ymin);
    let x2 = bbox1.xmax.min(bbox2.xmax);
    let y2 = bbox1.ymax.min(bbox2.ymax);

    if x2 <= x1 || y2 <= y1 {
        return 0.0;
    }

    let intersection = (x2 - x1) * (y2 - y1);
    let union = bbox1.area() + bbox2.area() - intersection;

    if union > 0.0 {
        intersection / union
    } else {
        0.0
    }
}

/// IoU matrix between `rows` and `cols`, row-major with shape (rows.len(), cols.len())
pub fn ious(rows: &[Bbox], cols: &[Bbox]) -> Vec<f32> {
    if rows.is_empty() || cols.is_empty() {
        return Vec::new();
    }

    rows.par_iter()
        .flat_map_iter(|row| cols.iter().map(move |col| calculate_iou(row, col)))
        .collect()
}
