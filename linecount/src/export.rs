//! Daily CSV export of crossing events

use crate::error::Result;
use crate::store::EventStore;
use crate::types::{CrossingEvent, Direction};
use chrono::{DateTime, NaiveDate, Utc};
use ioutrack::TrackId;
use serde::Serialize;
use std::path::{Path, PathBuf};

pub const CSV_HEADER: [&str; 8] = [
    "timestamp_utc",
    "direction",
    "track_id",
    "x1",
    "y1",
    "x2",
    "y2",
    "confidence",
];

#[derive(Debug, Serialize)]
struct CsvRow {
    timestamp_utc: DateTime<Utc>,
    direction: Direction,
    track_id: TrackId,
    x1: f32,
    y1: f32,
    x2: f32,
    y2: f32,
    confidence: f32,
}

impl From<&CrossingEvent> for CsvRow {
    fn from(event: &CrossingEvent) -> Self {
        Self {
            timestamp_utc: event.timestamp,
            direction: event.direction,
            track_id: event.track_id,
            x1: event.bbox.xmin,
            y1: event.bbox.ymin,
            x2: event.bbox.xmax,
            y2: event.bbox.ymax,
            confidence: event.confidence,
        }
    }
}

/// `<csv_dir>/<day>_counts.csv`
pub fn csv_path(csv_dir: &Path, day: NaiveDate) -> PathBuf {
    csv_dir.join(format!("{}_counts.csv", day))
}

/// Write every event of `day` (UTC) to its CSV file, replacing an earlier
/// export of the same day. A day without events still gets a header-only file.
///
/// Returns the written path and the number of rows.
pub fn export_csv(store: &dyn EventStore, day: NaiveDate, csv_dir: &Path) -> Result<(PathBuf, usize)> {
    let events = store.query(day)?;
    std::fs::create_dir_all(csv_dir)?;
    let path = csv_path(csv_dir, day);
    let tmp = path.with_extension("csv.tmp");

    let mut writer = csv::WriterBuilder::new().has_headers(false).from_path(&tmp)?;
    writer.write_record(CSV_HEADER)?;
    for event in &events {
        writer.serialize(CsvRow::from(event))?;
    }
    writer.flush()?;
    drop(writer);
    std::fs::rename(&tmp, &path)?;

    log::info!("Exported {} events for {} to {}", events.len(), day, path.display());
    Ok((path, events.len()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryEventStore;
    use chrono::{Duration, TimeZone};
    use ioutrack::Bbox;

    fn event(track_id: TrackId, direction: Direction, timestamp: DateTime<Utc>) -> CrossingEvent {
        CrossingEvent {
            track_id,
            direction,
            timestamp,
            bbox: Bbox::new(10.0, 20.0, 30.5, 40.0),
            class_id: 0,
            confidence: 0.75,
        }
    }

    fn temp_dir(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "linecount-{}-{}-{}",
            name,
            std::process::id(),
            Utc::now().timestamp_nanos_opt().unwrap_or_default()
        ))
    }

    #[test]
    fn test_export_writes_only_that_day() {
        let store = MemoryEventStore::new();
        let noon = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        store.append(&event(7, Direction::In, noon)).unwrap();
        store.append(&event(8, Direction::Out, noon + Duration::minutes(5))).unwrap();
        store.append(&event(9, Direction::In, noon + Duration::days(1))).unwrap();

        let dir = temp_dir("export");
        let (path, rows) = export_csv(&store, noon.date_naive(), &dir).unwrap();
        assert_eq!(rows, 2);
        assert_eq!(path, dir.join("2024-05-01_counts.csv"));

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "timestamp_utc,direction,track_id,x1,y1,x2,y2,confidence");
        assert!(lines[1].starts_with("2024-05-01T12:00:00Z,IN,7,10.0,20.0,30.5,40.0,0.75"));
        assert!(lines[2].contains(",OUT,8,"));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_empty_day_gets_header_and_rerun_replaces() {
        let store = MemoryEventStore::new();
        let day = NaiveDate::from_ymd_opt(2024, 6, 2).unwrap();
        let dir = temp_dir("export-empty");

        let (path, rows) = export_csv(&store, day, &dir).unwrap();
        assert_eq!(rows, 0);
        assert_eq!(std::fs::read_to_string(&path).unwrap().lines().count(), 1);

        let t = Utc.with_ymd_and_hms(2024, 6, 2, 8, 0, 0).unwrap();
        store.append(&event(1, Direction::In, t)).unwrap();
        let (_, rows) = export_csv(&store, day, &dir).unwrap();
        assert_eq!(rows, 1);
        assert_eq!(std::fs::read_to_string(&path).unwrap().lines().count(), 2);
        assert!(!path.with_extension("csv.tmp").exists());
        std::fs::remove_dir_all(&dir).ok();
    }
}
