//! Model backend seam.
//!
//! The backend bundles a pretrained multimodal model, its tokenizer, and its
//! image preprocessor behind the [`ModelBackend`] trait. The evaluation
//! driver only sequences calls through this seam; everything about weights,
//! attention, and sampling internals stays on the backend side.

pub mod image_processor;
pub mod llava;

use std::path::PathBuf;

use image::RgbImage;

use crate::error::Result;

pub use image_processor::ClipImageProcessor;
pub use llava::LlavaBackend;

/// Reserved sentinel index marking the image position in a token sequence.
///
/// Not a real vocabulary id; the backend replaces it with projected image
/// embeddings before the first forward pass.
pub const IMAGE_TOKEN_INDEX: i64 = -200;

/// Sampling and length parameters for one generation call.
#[derive(Debug, Clone, Copy)]
pub struct GenerationParams {
    /// Sample from the distribution instead of taking the argmax.
    pub do_sample: bool,
    /// Softmax temperature used when sampling.
    pub temperature: f64,
    /// Nucleus sampling probability mass.
    pub top_p: f64,
    /// RNG seed for sampling.
    pub seed: u64,
    /// Bound on the total sequence length, prompt included.
    pub max_length: usize,
    /// Penalty applied to recently generated tokens; 1.0 disables it.
    pub repeat_penalty: f32,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            do_sample: true,
            temperature: 0.2,
            top_p: 0.95,
            seed: 299_792_458,
            max_length: 1024,
            repeat_penalty: 1.0,
        }
    }
}

/// How model parameters are initialized at construction.
///
/// Replaces the usual global "skip default init" toggle with an explicit
/// per-construction choice.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WeightInit {
    /// Load every tensor from the checkpoint files.
    #[default]
    Pretrained,
    /// Build the graph with zeroed parameters. Output is meaningless; useful
    /// for exercising shapes and plumbing without downloading weights.
    Zeros,
}

/// Device the backend should compute on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DevicePreference {
    /// CUDA when available, otherwise CPU.
    #[default]
    Auto,
    /// Force CPU.
    Cpu,
}

/// Options for constructing a backend.
#[derive(Debug, Clone)]
pub struct BackendOptions {
    /// Local directory or Hugging Face repo id holding the model.
    pub model_path: String,

    /// Optional base model; its tensors are loaded first and overridden by
    /// any tensor the model path provides.
    pub model_base: Option<String>,

    /// Opaque numeric parameter forwarded to the model. Not interpreted by
    /// the harness.
    pub sigma: f64,

    /// Parameter initialization mode.
    pub weight_init: WeightInit,

    /// Compute device preference.
    pub device: DevicePreference,
}

impl BackendOptions {
    /// Options for a model path with everything else at defaults.
    #[must_use]
    pub fn new(model_path: impl Into<String>) -> Self {
        Self {
            model_path: model_path.into(),
            model_base: None,
            sigma: 0.0,
            weight_init: WeightInit::default(),
            device: DevicePreference::default(),
        }
    }
}

/// Files a backend needs to construct itself, wherever they came from.
///
/// Local directories are used as-is; hub repos are downloaded into the cache
/// first. Weight files are ordered base-first so later entries override.
#[derive(Debug, Clone)]
pub struct ModelFiles {
    /// Parsed `config.json` location.
    pub config: PathBuf,
    /// Parsed `generation_config.json` location, if present.
    pub generation_config: Option<PathBuf>,
    /// Parsed `preprocessor_config.json` location.
    pub preprocessor_config: PathBuf,
    /// `tokenizer.json` location.
    pub tokenizer: PathBuf,
    /// Safetensors checkpoint files in override order.
    pub weights: Vec<PathBuf>,
}

/// A pretrained multimodal model with tokenizer and image preprocessor.
///
/// `generate` returns the full token sequence, prompt prefix included, so the
/// caller can sanity-check the prefix and decode only the generated suffix.
pub trait ModelBackend {
    /// Maximum total sequence length the model supports.
    fn context_length(&self) -> usize;

    /// Whether prompts must wrap the image placeholder in start/end markers.
    fn uses_image_markers(&self) -> bool;

    /// Tokenize a prompt, mapping the image placeholder to
    /// [`IMAGE_TOKEN_INDEX`].
    fn encode_prompt(&self, prompt: &str) -> Result<Vec<i64>>;

    /// Run bounded text generation conditioned on the image and prompt.
    ///
    /// Generation halts on the end-of-sequence token, when the decoded tail
    /// ends with `stop`, or at the `params.max_length` bound.
    fn generate(
        &mut self,
        input_ids: &[i64],
        image: &RgbImage,
        params: &GenerationParams,
        stop: &str,
    ) -> Result<Vec<i64>>;

    /// Decode tokens to text, skipping special tokens and the image sentinel.
    fn decode(&self, tokens: &[i64]) -> Result<String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generation_params_defaults() {
        let params = GenerationParams::default();
        assert!(params.do_sample);
        assert!((params.temperature - 0.2).abs() < f64::EPSILON);
        assert_eq!(params.max_length, 1024);
    }

    #[test]
    fn test_backend_options_new() {
        let opts = BackendOptions::new("llava-hf/llava-1.5-7b-hf");
        assert_eq!(opts.model_path, "llava-hf/llava-1.5-7b-hf");
        assert!(opts.model_base.is_none());
        assert_eq!(opts.weight_init, WeightInit::Pretrained);
        assert!((opts.sigma - 0.0).abs() < f64::EPSILON);
    }
}
