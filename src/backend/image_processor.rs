//! CLIP-style image preprocessing.
//!
//! Turns an RGB8 image into the normalized CHW float tensor the vision tower
//! expects: shortest-edge resize, center crop, rescale, per-channel
//! normalization. The parameters come from the model's
//! `preprocessor_config.json`.

use std::path::Path;

use candle_core::{Device, Tensor};
use image::imageops::FilterType;
use image::RgbImage;
use serde::Deserialize;

use crate::error::{Error, Result};

/// OpenAI CLIP channel means.
const DEFAULT_MEAN: [f32; 3] = [0.481_454_66, 0.457_827_5, 0.408_210_73];

/// OpenAI CLIP channel standard deviations.
const DEFAULT_STD: [f32; 3] = [0.268_629_54, 0.261_302_58, 0.275_777_11];

/// A size value that HF configs write either as an integer or as a map.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(untagged)]
enum SizeSpec {
    Scalar(u32),
    Edges {
        #[serde(default)]
        shortest_edge: Option<u32>,
        #[serde(default)]
        height: Option<u32>,
        #[serde(default)]
        width: Option<u32>,
    },
}

impl SizeSpec {
    fn resolve(self, default: u32) -> u32 {
        match self {
            Self::Scalar(v) => v,
            Self::Edges {
                shortest_edge,
                height,
                width,
            } => shortest_edge.or(height).or(width).unwrap_or(default),
        }
    }
}

/// Subset of `preprocessor_config.json` this processor reads.
#[derive(Debug, Clone, Deserialize)]
struct RawPreprocessorConfig {
    #[serde(default)]
    size: Option<SizeSpec>,
    #[serde(default)]
    crop_size: Option<SizeSpec>,
    #[serde(default = "default_true")]
    do_resize: bool,
    #[serde(default = "default_true")]
    do_center_crop: bool,
    #[serde(default = "default_true")]
    do_normalize: bool,
    #[serde(default)]
    image_mean: Option<[f32; 3]>,
    #[serde(default)]
    image_std: Option<[f32; 3]>,
    #[serde(default)]
    rescale_factor: Option<f32>,
}

fn default_true() -> bool {
    true
}

/// Image preprocessor matching the HF CLIP processing pipeline.
#[derive(Debug, Clone)]
pub struct ClipImageProcessor {
    size: u32,
    crop_size: u32,
    do_resize: bool,
    do_center_crop: bool,
    do_normalize: bool,
    image_mean: [f32; 3],
    image_std: [f32; 3],
    rescale_factor: f32,
}

impl Default for ClipImageProcessor {
    fn default() -> Self {
        Self {
            size: 336,
            crop_size: 336,
            do_resize: true,
            do_center_crop: true,
            do_normalize: true,
            image_mean: DEFAULT_MEAN,
            image_std: DEFAULT_STD,
            rescale_factor: 1.0 / 255.0,
        }
    }
}

impl ClipImageProcessor {
    /// Build a processor from raw `preprocessor_config.json` bytes.
    ///
    /// Missing fields fall back to the CLIP ViT-L/336 defaults.
    pub fn from_json_bytes(bytes: &[u8]) -> Result<Self> {
        let raw: RawPreprocessorConfig = serde_json::from_slice(bytes)?;
        let defaults = Self::default();
        let size = raw.size.map_or(defaults.size, |s| s.resolve(defaults.size));
        Ok(Self {
            size,
            // Without an explicit crop the resized square is used directly.
            crop_size: raw.crop_size.map_or(size, |s| s.resolve(size)),
            do_resize: raw.do_resize,
            do_center_crop: raw.do_center_crop,
            do_normalize: raw.do_normalize,
            image_mean: raw.image_mean.unwrap_or(defaults.image_mean),
            image_std: raw.image_std.unwrap_or(defaults.image_std),
            rescale_factor: raw.rescale_factor.unwrap_or(defaults.rescale_factor),
        })
    }

    /// Build a processor from a `preprocessor_config.json` file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path).map_err(|e| {
            Error::ModelLoad(format!("{}: {e}", path.display()))
        })?;
        Self::from_json_bytes(&bytes)
    }

    /// Side length of the tensor this processor produces.
    #[must_use]
    pub fn output_size(&self) -> u32 {
        if self.do_center_crop {
            self.crop_size
        } else {
            self.size
        }
    }

    /// Preprocess an RGB8 image into a `(1, 3, H, W)` float tensor.
    pub fn preprocess(&self, image: &RgbImage, device: &Device) -> Result<Tensor> {
        let resized = if self.do_resize {
            resize_shortest_edge(image, self.size)
        } else {
            image.clone()
        };
        let cropped = if self.do_center_crop {
            center_crop(&resized, self.crop_size)
        } else {
            resized
        };

        let (width, height) = cropped.dimensions();
        let mut data = vec![0f32; 3 * (width as usize) * (height as usize)];
        let plane = (width as usize) * (height as usize);
        for (x, y, pixel) in cropped.enumerate_pixels() {
            let idx = (y as usize) * (width as usize) + (x as usize);
            for c in 0..3 {
                let mut value = f32::from(pixel[c]) * self.rescale_factor;
                if self.do_normalize {
                    value = (value - self.image_mean[c]) / self.image_std[c];
                }
                data[c * plane + idx] = value;
            }
        }

        let tensor = Tensor::from_vec(data, (1, 3, height as usize, width as usize), device)?;
        Ok(tensor)
    }
}

/// Resize so the shortest edge equals `target`, preserving aspect ratio.
fn resize_shortest_edge(image: &RgbImage, target: u32) -> RgbImage {
    let (width, height) = image.dimensions();
    let shortest = width.min(height);
    if shortest == target {
        return image.clone();
    }
    let scale = f64::from(target) / f64::from(shortest);
    let new_width = (f64::from(width) * scale).round().max(1.0) as u32;
    let new_height = (f64::from(height) * scale).round().max(1.0) as u32;
    image::imageops::resize(image, new_width, new_height, FilterType::CatmullRom)
}

/// Crop a centered square of side `size`, padding never required because the
/// shortest edge is at least `size` after resize.
fn center_crop(image: &RgbImage, size: u32) -> RgbImage {
    let (width, height) = image.dimensions();
    let size = size.min(width).min(height);
    let left = (width - size) / 2;
    let top = (height - size) / 2;
    image::imageops::crop_imm(image, left, top, size, size).to_image()
}
