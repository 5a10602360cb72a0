//! Event persistence: append-only CSV log and JPEG snapshots.

use crate::types::Rect;
use chrono::{DateTime, Local};
use image::RgbImage;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Label recorded for a face that matched nobody.
pub const UNKNOWN_LABEL: &str = "UNKNOWN";

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";
const FILE_TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";

#[derive(Error, Debug)]
pub enum EventLogError {
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("csv: {0}")]
    Csv(#[from] csv::Error),
    #[error("snapshot encoding: {0}")]
    Image(#[from] image::ImageError),
}

/// One row of the event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub timestamp: String,
    pub label: String,
    #[serde(serialize_with = "three_decimals", deserialize_with = "text_or_number")]
    pub distance: f32,
    pub bbox_x: i32,
    pub bbox_y: i32,
    pub bbox_w: u32,
    pub bbox_h: u32,
    pub image_path: String,
}

fn three_decimals<S: Serializer>(value: &f32, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&format!("{value:.3}"))
}

fn text_or_number<'de, D: Deserializer<'de>>(d: D) -> Result<f32, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Distance {
        Number(f32),
        Text(String),
    }
    match Distance::deserialize(d)? {
        Distance::Number(v) => Ok(v),
        Distance::Text(t) => t.trim().parse().map_err(serde::de::Error::custom),
    }
}

impl EventRecord {
    pub fn new(at: DateTime<Local>, label: &str, distance: f32, bbox: Rect, image_path: &Path) -> Self {
        Self {
            timestamp: at.format(TIMESTAMP_FORMAT).to_string(),
            label: label.to_string(),
            distance,
            bbox_x: bbox.x,
            bbox_y: bbox.y,
            bbox_w: bbox.width,
            bbox_h: bbox.height,
            image_path: image_path.to_string_lossy().into_owned(),
        }
    }

    pub fn bbox(&self) -> Rect {
        Rect::new(self.bbox_x, self.bbox_y, self.bbox_w, self.bbox_h)
    }

    /// Snapshot file name without its directory.
    pub fn image_file_name(&self) -> Option<String> {
        Path::new(&self.image_path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
    }
}

/// Append-only CSV event log.
#[derive(Debug, Clone)]
pub struct EventLog {
    path: PathBuf,
}

impl EventLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one row, writing the header first if the file is new.
    pub fn append(&self, record: &EventRecord) -> Result<(), EventLogError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| EventLogError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let is_new = !self.path.exists();
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|source| EventLogError::Io {
                path: self.path.clone(),
                source,
            })?;

        let mut writer = csv::WriterBuilder::new()
            .has_headers(is_new)
            .from_writer(file);
        writer.serialize(record)?;
        writer.flush().map_err(|source| EventLogError::Io {
            path: self.path.clone(),
            source,
        })?;
        Ok(())
    }

    /// All rows in file order. A log that does not exist yet is empty.
    pub fn read_all(&self) -> Result<Vec<EventRecord>, EventLogError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let mut reader = csv::Reader::from_path(&self.path)?;
        reader
            .deserialize()
            .collect::<Result<Vec<EventRecord>, csv::Error>>()
            .map_err(EventLogError::from)
    }

    /// Newest-first rows, at most `limit`.
    pub fn recent(&self, limit: usize) -> Result<Vec<EventRecord>, EventLogError> {
        let mut records = self.read_all()?;
        // Stable sort: rows logged within the same second stay newest-last-appended first.
        records.reverse();
        records.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        records.truncate(limit);
        Ok(records)
    }
}

/// Directory of event snapshots.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Encode `frame` as `<timestamp>_<label>.jpg` and return the path written.
    pub fn save(&self, frame: &RgbImage, label: &str, at: DateTime<Local>) -> Result<PathBuf, EventLogError> {
        std::fs::create_dir_all(&self.dir).map_err(|source| EventLogError::Io {
            path: self.dir.clone(),
            source,
        })?;
        let path = self
            .dir
            .join(format!("{}_{label}.jpg", at.format(FILE_TIMESTAMP_FORMAT)));
        frame.save_with_format(&path, image::ImageFormat::Jpeg)?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(2025, 10, 11, h, m, s).unwrap()
    }

    #[test]
    fn test_round_trip_with_three_decimal_distance() {
        let dir = tempfile::tempdir().unwrap();
        let log = EventLog::new(dir.path().join("events").join("events.csv"));
        let rec = EventRecord::new(
            at(11, 22, 33),
            UNKNOWN_LABEL,
            0.123456,
            Rect::new(10, 20, 90, 110),
            Path::new("data/events/2025-10-11_11-22-33_unknown.jpg"),
        );
        log.append(&rec).unwrap();

        let back = log.read_all().unwrap();
        assert_eq!(back.len(), 1);
        let got = &back[0];
        assert_eq!(got.timestamp, "2025-10-11T11:22:33");
        assert_eq!(got.label, "UNKNOWN");
        assert!((got.distance - 0.123).abs() < 1e-6);
        assert_eq!(got.bbox(), Rect::new(10, 20, 90, 110));
        assert_eq!(got.image_path, rec.image_path);
        assert_eq!(got.image_file_name().as_deref(), Some("2025-10-11_11-22-33_unknown.jpg"));
    }

    #[test]
    fn test_header_written_once() {
        let dir = tempfile::tempdir().unwrap();
        let log = EventLog::new(dir.path().join("events.csv"));
        for s in 0..3 {
            let rec = EventRecord::new(at(1, 0, s), UNKNOWN_LABEL, 0.5, Rect::new(0, 0, 1, 1), Path::new("x.jpg"));
            log.append(&rec).unwrap();
        }
        let text = std::fs::read_to_string(log.path()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0], "timestamp,label,distance,bbox_x,bbox_y,bbox_w,bbox_h,image_path");
        assert_eq!(lines[1], "2025-10-11T01:00:00,UNKNOWN,0.500,0,0,1,1,x.jpg");
    }

    #[test]
    fn test_infinite_distance_survives_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let log = EventLog::new(dir.path().join("events.csv"));
        let rec = EventRecord::new(at(2, 0, 0), UNKNOWN_LABEL, f32::INFINITY, Rect::new(0, 0, 1, 1), Path::new("x.jpg"));
        log.append(&rec).unwrap();
        assert!(log.read_all().unwrap()[0].distance.is_infinite());
    }

    #[test]
    fn test_json_distance_is_text_and_reads_back() {
        let rec = EventRecord::new(at(4, 5, 6), "Alice", 0.25, Rect::new(1, 2, 3, 4), Path::new("a.jpg"));
        let json = serde_json::to_value(&rec).unwrap();
        assert_eq!(json["distance"], "0.250");
        let back: EventRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back.distance, 0.25);
        let numeric: EventRecord = serde_json::from_str(
            r#"{"timestamp":"t","label":"x","distance":0.5,"bbox_x":0,"bbox_y":0,"bbox_w":1,"bbox_h":1,"image_path":""}"#,
        )
        .unwrap();
        assert_eq!(numeric.distance, 0.5);
    }

    #[test]
    fn test_recent_is_newest_first_and_limited() {
        let dir = tempfile::tempdir().unwrap();
        let log = EventLog::new(dir.path().join("events.csv"));
        for (h, label) in [(3, "a"), (1, "b"), (2, "c")] {
            log.append(&EventRecord::new(at(h, 0, 0), label, 0.1, Rect::new(0, 0, 1, 1), Path::new(""))).unwrap();
        }
        let labels: Vec<String> = log.recent(2).unwrap().into_iter().map(|r| r.label).collect();
        assert_eq!(labels, vec!["a", "c"]);
        assert!(EventLog::new(dir.path().join("none.csv")).recent(5).unwrap().is_empty());
    }

    #[test]
    fn test_snapshot_file_name() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().join("snaps"));
        let path = store
            .save(&RgbImage::new(32, 24), "unknown", at(11, 22, 33))
            .unwrap();
        assert_eq!(path, dir.path().join("snaps").join("2025-10-11_11-22-33_unknown.jpg"));
        assert_eq!(image::open(&path).unwrap().width(), 32);
    }
}
