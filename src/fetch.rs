//! Image loading from local paths or remote URLs.
//!
//! Dataset entries normally resolve to local files, but a source may also be
//! an `http(s)` URL; both are decoded with the `image` crate and converted to
//! a fixed 3-channel RGB8 layout before preprocessing.

use std::path::Path;

use image::RgbImage;

use crate::error::{Error, Result};

/// Whether a source string denotes a remote resource.
#[must_use]
pub fn is_remote(source: &str) -> bool {
    source.starts_with("http://") || source.starts_with("https://")
}

/// Load an image from a local path or remote URL as RGB8.
///
/// # Errors
///
/// Returns [`Error::ImageFetch`] when a remote fetch fails and
/// [`Error::ImageLoad`] when the file cannot be opened or decoded.
pub fn load_image(source: &str) -> Result<RgbImage> {
    if is_remote(source) {
        let response = reqwest::blocking::get(source).map_err(|e| Error::ImageFetch {
            url: source.to_string(),
            reason: e.to_string(),
        })?;
        let bytes = response.bytes().map_err(|e| Error::ImageFetch {
            url: source.to_string(),
            reason: e.to_string(),
        })?;
        let img = image::load_from_memory(&bytes).map_err(|e| Error::ImageLoad {
            path: source.into(),
            reason: e.to_string(),
        })?;
        Ok(img.to_rgb8())
    } else {
        load_local(Path::new(source))
    }
}

/// Load a local image file as RGB8.
pub fn load_local(path: &Path) -> Result<RgbImage> {
    let img = image::ImageReader::open(path)
        .and_then(image::ImageReader::with_guessed_format)
        .map_err(|e| Error::ImageLoad {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?
        .decode()
        .map_err(|e| Error::ImageLoad {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
    Ok(img.to_rgb8())
}
