//! Visual Genome dataset metadata and image path resolution.
//!
//! The ground-truth folder holds an `objects.json` manifest: a JSON array of
//! per-image annotation objects. Only the `image_id` field matters here; the
//! rest of each record is annotation payload and is ignored. Image files live
//! under one of two directory conventions, reflecting the two-part release of
//! the image set.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Error, Result};

/// Manifest file name inside the ground-truth folder.
pub const OBJECTS_FILE: &str = "objects.json";

/// Number of manifest entries evaluated by default.
pub const DEFAULT_ENTRY_LIMIT: usize = 100;

/// Subdirectory for the second image release, tried first.
const PRIMARY_SUBDIR: &str = "images2/VG_100K_2";

/// Subdirectory for the first image release, used as fallback.
const SECONDARY_SUBDIR: &str = "images/VG_100K";

/// One entry of the `objects.json` manifest.
///
/// Annotation fields beyond the image id are ignored on deserialization.
#[derive(Debug, Clone, Deserialize)]
pub struct ObjectsEntry {
    /// Dataset-wide image identifier.
    pub image_id: u64,
}

/// Load image ids from the manifest, truncated to `limit` entries.
///
/// # Arguments
///
/// * `gt_dir` - Ground-truth folder containing `objects.json`.
/// * `limit` - Maximum number of leading entries to keep.
///
/// # Errors
///
/// Returns [`Error::Dataset`] if the manifest is missing or not valid JSON.
pub fn load_image_ids(gt_dir: &Path, limit: usize) -> Result<Vec<u64>> {
    let path = gt_dir.join(OBJECTS_FILE);
    let bytes = fs::read(&path).map_err(|e| Error::Dataset {
        path: path.clone(),
        reason: e.to_string(),
    })?;
    let entries: Vec<ObjectsEntry> =
        serde_json::from_slice(&bytes).map_err(|e| Error::Dataset {
            path,
            reason: e.to_string(),
        })?;
    Ok(entries
        .into_iter()
        .take(limit)
        .map(|entry| entry.image_id)
        .collect())
}

/// Candidate path under the primary convention.
#[must_use]
pub fn primary_path(image_root: &Path, image_id: u64) -> PathBuf {
    image_root.join(PRIMARY_SUBDIR).join(format!("{image_id}.jpg"))
}

/// Candidate path under the secondary convention.
#[must_use]
pub fn secondary_path(image_root: &Path, image_id: u64) -> PathBuf {
    image_root.join(SECONDARY_SUBDIR).join(format!("{image_id}.jpg"))
}

/// Resolve an image id to an existing file.
///
/// The primary convention is preferred; the secondary one is used when the
/// primary file is absent. There is no further fallback.
///
/// # Errors
///
/// Returns [`Error::MissingImage`] naming both candidates when neither file
/// exists.
pub fn resolve_image_path(image_root: &Path, image_id: u64) -> Result<PathBuf> {
    let primary = primary_path(image_root, image_id);
    if primary.is_file() {
        return Ok(primary);
    }
    let secondary = secondary_path(image_root, image_id);
    if secondary.is_file() {
        return Ok(secondary);
    }
    Err(Error::MissingImage {
        image_id,
        primary,
        secondary,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_manifest(dir: &Path, ids: &[u64]) {
        let entries: Vec<serde_json::Value> = ids
            .iter()
            .map(|id| serde_json::json!({ "image_id": id, "objects": [] }))
            .collect();
        fs::write(
            dir.join(OBJECTS_FILE),
            serde_json::to_vec(&entries).unwrap(),
        )
        .unwrap();
    }

    #[test]
    fn test_load_image_ids_in_order() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(dir.path(), &[5, 3, 9]);

        let ids = load_image_ids(dir.path(), DEFAULT_ENTRY_LIMIT).unwrap();
        assert_eq!(ids, vec![5, 3, 9]);
    }

    #[test]
    fn test_load_image_ids_truncates_to_limit() {
        let dir = tempfile::tempdir().unwrap();
        let ids: Vec<u64> = (0..150).collect();
        write_manifest(dir.path(), &ids);

        let loaded = load_image_ids(dir.path(), DEFAULT_ENTRY_LIMIT).unwrap();
        assert_eq!(loaded.len(), 100);
        assert_eq!(loaded[99], 99);
    }

    #[test]
    fn test_load_image_ids_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_image_ids(dir.path(), 10).unwrap_err();
        assert!(matches!(err, Error::Dataset { .. }));
    }

    #[test]
    fn test_resolve_prefers_primary() {
        let root = tempfile::tempdir().unwrap();
        let primary_dir = root.path().join(PRIMARY_SUBDIR);
        let secondary_dir = root.path().join(SECONDARY_SUBDIR);
        fs::create_dir_all(&primary_dir).unwrap();
        fs::create_dir_all(&secondary_dir).unwrap();
        fs::write(primary_dir.join("7.jpg"), b"x").unwrap();
        fs::write(secondary_dir.join("7.jpg"), b"x").unwrap();

        let resolved = resolve_image_path(root.path(), 7).unwrap();
        assert_eq!(resolved, primary_path(root.path(), 7));
    }

    #[test]
    fn test_resolve_falls_back_to_secondary() {
        let root = tempfile::tempdir().unwrap();
        let secondary_dir = root.path().join(SECONDARY_SUBDIR);
        fs::create_dir_all(&secondary_dir).unwrap();
        fs::write(secondary_dir.join("7.jpg"), b"x").unwrap();

        let resolved = resolve_image_path(root.path(), 7).unwrap();
        assert_eq!(resolved, secondary_path(root.path(), 7));
    }

    #[test]
    fn test_resolve_missing_both() {
        let root = tempfile::tempdir().unwrap();
        let err = resolve_image_path(root.path(), 42).unwrap_err();
        match err {
            Error::MissingImage { image_id, .. } => assert_eq!(image_id, 42),
            other => panic!("unexpected error: {other}"),
        }
    }
}
