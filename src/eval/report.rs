//! Result records and the output artifact.
//!
//! A run produces one JSON file: an array of per-image records in dataset
//! order, written once after the loop completes. An optional CSV summary can
//! be emitted next to it.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::ser::PrettyFormatter;

use crate::error::Result;

/// Description generated for one image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptionRecord {
    /// Dataset image id.
    pub image_id: u64,

    /// Path the image was loaded from (reflects the convention that won).
    pub path: PathBuf,

    /// Trimmed model output.
    pub text: String,
}

/// All records of one evaluation run, in dataset order.
#[derive(Debug, Clone, Default)]
pub struct EvalReport {
    /// Per-image records, appended as the loop progresses.
    pub records: Vec<CaptionRecord>,
}

impl EvalReport {
    /// Create an empty report.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records collected so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether no records have been collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Append a record.
    pub fn push(&mut self, record: CaptionRecord) {
        self.records.push(record);
    }

    /// Artifact path for a given output folder and sigma value.
    #[must_use]
    pub fn json_path(output_folder: &Path, sigma: f64) -> PathBuf {
        output_folder.join(format!("vg_{sigma}.json"))
    }

    /// Write the records as a 4-space-indented JSON array.
    ///
    /// The output folder is created if absent. Returns the artifact path.
    pub fn write_json(&self, output_folder: &Path, sigma: f64) -> Result<PathBuf> {
        std::fs::create_dir_all(output_folder)?;
        let path = Self::json_path(output_folder, sigma);

        let mut writer = BufWriter::new(File::create(&path)?);
        let formatter = PrettyFormatter::with_indent(b"    ");
        let mut serializer = serde_json::Serializer::with_formatter(&mut writer, formatter);
        self.records.serialize(&mut serializer)?;
        writer.flush()?;
        Ok(path)
    }

    /// Write a CSV summary next to the JSON artifact. Returns its path.
    pub fn write_csv_summary(&self, output_folder: &Path, sigma: f64) -> Result<PathBuf> {
        std::fs::create_dir_all(output_folder)?;
        let path = output_folder.join(format!("vg_{sigma}.csv"));

        let mut wtr = csv::Writer::from_path(&path)?;
        wtr.write_record(["image_id", "path", "text"])?;
        for record in &self.records {
            wtr.write_record([
                &record.image_id.to_string(),
                &record.path.display().to_string(),
                &record.text,
            ])?;
        }
        wtr.flush()?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_report() -> EvalReport {
        let mut report = EvalReport::new();
        report.push(CaptionRecord {
            image_id: 1,
            path: PathBuf::from("/data/images2/VG_100K_2/1.jpg"),
            text: "a cat".to_string(),
        });
        report.push(CaptionRecord {
            image_id: 2,
            path: PathBuf::from("/data/images/VG_100K/2.jpg"),
            text: "a dog".to_string(),
        });
        report
    }

    #[test]
    fn test_json_path_includes_sigma() {
        let path = EvalReport::json_path(Path::new("/out"), 0.5);
        assert_eq!(path, PathBuf::from("/out/vg_0.5.json"));
    }

    #[test]
    fn test_write_json_is_array_with_four_space_indent() {
        let dir = tempfile::tempdir().unwrap();
        let report = sample_report();

        let path = report.write_json(dir.path(), 0.5).unwrap();
        let contents = std::fs::read_to_string(path).unwrap();

        assert!(contents.starts_with('['));
        assert!(contents.contains("\n    {"));
        assert!(contents.contains("\n        \"image_id\": 1"));

        // round-trips back to the same records
        let parsed: Vec<CaptionRecord> = serde_json::from_str(&contents).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].image_id, 1);
        assert_eq!(parsed[1].text, "a dog");
    }

    #[test]
    fn test_write_json_creates_output_folder() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("out/results");

        let report = sample_report();
        let path = report.write_json(&nested, 0.0).unwrap();
        assert!(path.is_file());
    }

    #[test]
    fn test_write_csv_summary() {
        let dir = tempfile::tempdir().unwrap();
        let report = sample_report();

        let path = report.write_csv_summary(dir.path(), 1.5).unwrap();
        let contents = std::fs::read_to_string(path).unwrap();
        let mut lines = contents.lines();
        assert_eq!(lines.next(), Some("image_id,path,text"));
        assert!(lines.next().unwrap().starts_with("1,"));
    }

    #[test]
    fn test_empty_report_serializes_to_empty_array() {
        let dir = tempfile::tempdir().unwrap();
        let report = EvalReport::new();
        let path = report.write_json(dir.path(), 0.0).unwrap();
        assert_eq!(std::fs::read_to_string(path).unwrap(), "[]");
    }
}
