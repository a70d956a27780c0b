//! Per-frame detection value type

use crate::bbox::Bbox;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One object observation in one frame
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub bbox: Bbox,
    pub class_id: u32,
    pub confidence: f32,
    pub timestamp: DateTime<Utc>,
}

impl Detection {
    pub fn new(bbox: Bbox, class_id: u32, confidence: f32, timestamp: DateTime<Utc>) -> Self {
        Self {
            bbox,
            class_id,
            confidence,
            timestamp,
        }
    }

    /// Usable by the tracker: valid box and a finite confidence in [0, 1]
    pub fn is_valid(&self) -> bool {
        self.bbox.is_valid() && self.confidence.is_finite() && (0.0..=1.0).contains(&self.confidence)
    }
}
