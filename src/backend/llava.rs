//! Candle-based LLaVA backend.
//!
//! Loads a LLaVA checkpoint (local directory or Hugging Face repo), its
//! tokenizer, and its CLIP preprocessor, and runs sampled autoregressive
//! generation with the image spliced in at the sentinel position.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use candle_core::{DType, Device, IndexOp, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::generation::{LogitsProcessor, Sampling};
use candle_transformers::models::llama::Cache;
use candle_transformers::models::llava::config::{
    HFGenerationConfig, HFLLaVAConfig, HFPreProcessorConfig, LLaVAConfig,
};
use candle_transformers::models::llava::LLaVA;
use candle_transformers::utils::apply_repeat_penalty;
use hf_hub::api::sync::Api;
use image::RgbImage;
use log::{debug, warn};
use serde_json::Value;
use tokenizers::Tokenizer;

use crate::backend::image_processor::ClipImageProcessor;
use crate::backend::{
    BackendOptions, DevicePreference, GenerationParams, ModelBackend, ModelFiles, WeightInit,
    IMAGE_TOKEN_INDEX,
};
use crate::conversation::IMAGE_PLACEHOLDER;
use crate::error::{Error, Result};

/// Fallback context length when the config does not state one.
const DEFAULT_CONTEXT_LENGTH: usize = 4096;

/// How many trailing tokens are decoded when checking the stop keyword.
const STOP_TAIL_TOKENS: usize = 8;

impl ModelFiles {
    /// Locate all files for a model, downloading from the hub when the path
    /// is not a local directory.
    ///
    /// Base-model weights, when given, are placed before the model's own so
    /// that later files override earlier ones at load time. Zero-initialized
    /// construction skips weight resolution entirely.
    pub fn locate(model_path: &str, model_base: Option<&str>, init: WeightInit) -> Result<Self> {
        let mut weights = Vec::new();
        if init == WeightInit::Pretrained {
            if let Some(base) = model_base {
                weights.extend(locate_weight_files(base)?);
            }
            weights.extend(locate_weight_files(model_path)?);
        }

        let dir = Path::new(model_path);
        if dir.is_dir() {
            let generation_config = existing(dir.join("generation_config.json"));
            Ok(Self {
                config: required(dir.join("config.json"))?,
                generation_config,
                preprocessor_config: required(dir.join("preprocessor_config.json"))?,
                tokenizer: required(dir.join("tokenizer.json"))?,
                weights,
            })
        } else {
            let repo = Api::new()
                .map_err(|e| Error::ModelLoad(e.to_string()))?
                .model(model_path.to_string());
            let get = |file: &str| {
                repo.get(file)
                    .map_err(|e| Error::ModelLoad(format!("{model_path}/{file}: {e}")))
            };
            Ok(Self {
                config: get("config.json")?,
                generation_config: repo.get("generation_config.json").ok(),
                preprocessor_config: get("preprocessor_config.json")?,
                tokenizer: get("tokenizer.json")?,
                weights,
            })
        }
    }
}

fn required(path: PathBuf) -> Result<PathBuf> {
    if path.is_file() {
        Ok(path)
    } else {
        Err(Error::ModelLoad(format!("missing {}", path.display())))
    }
}

fn existing(path: PathBuf) -> Option<PathBuf> {
    path.is_file().then_some(path)
}

/// Safetensors files for one model location, sharded or single-file.
fn locate_weight_files(model_path: &str) -> Result<Vec<PathBuf>> {
    let dir = Path::new(model_path);
    if dir.is_dir() {
        let index = dir.join("model.safetensors.index.json");
        if index.is_file() {
            let names = sharded_weight_names(&std::fs::read(&index)?)?;
            return Ok(names.into_iter().map(|name| dir.join(name)).collect());
        }
        return Ok(vec![required(dir.join("model.safetensors"))?]);
    }

    let repo = Api::new()
        .map_err(|e| Error::ModelLoad(e.to_string()))?
        .model(model_path.to_string());
    if let Ok(index) = repo.get("model.safetensors.index.json") {
        let names = sharded_weight_names(&std::fs::read(index)?)?;
        return names
            .into_iter()
            .map(|name| {
                repo.get(&name)
                    .map_err(|e| Error::ModelLoad(format!("{model_path}/{name}: {e}")))
            })
            .collect();
    }
    repo.get("model.safetensors")
        .map(|p| vec![p])
        .map_err(|e| Error::ModelLoad(format!("{model_path}/model.safetensors: {e}")))
}

/// Unique shard file names from a `model.safetensors.index.json` weight map.
fn sharded_weight_names(index_bytes: &[u8]) -> Result<Vec<String>> {
    let index: Value = serde_json::from_slice(index_bytes)?;
    let map = index
        .get("weight_map")
        .and_then(Value::as_object)
        .ok_or_else(|| Error::ModelLoad("malformed safetensors index".to_string()))?;
    let mut names: Vec<String> = map
        .values()
        .filter_map(Value::as_str)
        .map(str::to_string)
        .collect();
    names.sort();
    names.dedup();
    Ok(names)
}

/// Stitch per-chunk token ids around the image sentinel.
///
/// The first chunk keeps its leading BOS; later chunks drop theirs so the
/// sentinel sits directly between the surrounding text tokens.
fn splice_image_tokens(chunks: &[Vec<i64>], bos: i64) -> Vec<i64> {
    let mut ids = Vec::new();
    for (i, chunk) in chunks.iter().enumerate() {
        if i == 0 {
            ids.extend_from_slice(chunk);
            continue;
        }
        ids.push(IMAGE_TOKEN_INDEX);
        let rest = if chunk.first() == Some(&bos) {
            &chunk[1..]
        } else {
            chunk.as_slice()
        };
        ids.extend_from_slice(rest);
    }
    ids
}

/// LLaVA model, tokenizer, and preprocessor behind the [`ModelBackend`] seam.
pub struct LlavaBackend {
    llava: LLaVA,
    tokenizer: Tokenizer,
    processor: ClipImageProcessor,
    llava_config: LLaVAConfig,
    cache: Cache,
    device: Device,
    dtype: DType,
    eos_token_id: usize,
    context_length: usize,
    use_image_markers: bool,
    /// Opaque passthrough parameter carried for the model's sake.
    #[allow(dead_code)]
    sigma: f64,
}

impl LlavaBackend {
    /// Load a backend according to `options`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ModelLoad`] when any required file is missing or
    /// malformed; tensor and tokenizer failures map to their own variants.
    pub fn load(options: &BackendOptions) -> Result<Self> {
        let files = ModelFiles::locate(
            &options.model_path,
            options.model_base.as_deref(),
            options.weight_init,
        )?;

        let (device, dtype) = select_device(options.device)?;
        debug!("backend device {device:?}, dtype {dtype:?}");

        let config_bytes = std::fs::read(&files.config)?;
        let raw_config: Value = serde_json::from_slice(&config_bytes)?;
        let hf_config: HFLLaVAConfig = serde_json::from_slice(&config_bytes)?;

        let generation_config: HFGenerationConfig = match &files.generation_config {
            Some(path) => serde_json::from_slice(&std::fs::read(path)?)?,
            None => serde_json::from_value(serde_json::json!({
                "bos_token_id": 1,
                "eos_token_id": 2,
                "pad_token_id": 0
            }))?,
        };

        let preprocessor_bytes = std::fs::read(&files.preprocessor_config)?;
        let hf_preprocessor: HFPreProcessorConfig = serde_json::from_slice(&preprocessor_bytes)?;
        let processor = ClipImageProcessor::from_json_bytes(&preprocessor_bytes)?;

        let llava_config =
            hf_config.to_llava_config(&generation_config, &hf_preprocessor);
        let llama_config = llava_config.to_llama_config();
        let clip_vision_config = hf_config.to_clip_vision_config();

        let tokenizer = Tokenizer::from_file(&files.tokenizer)
            .map_err(|e| Error::ModelLoad(format!("tokenizer: {e}")))?;

        let vb = match options.weight_init {
            WeightInit::Pretrained => {
                let mut tensors: HashMap<String, Tensor> = HashMap::new();
                for file in &files.weights {
                    // later files (the model's own) override base tensors
                    tensors.extend(candle_core::safetensors::load(file, &device)?);
                }
                for value in tensors.values_mut() {
                    if value.dtype() != dtype {
                        *value = value.to_dtype(dtype)?;
                    }
                }
                VarBuilder::from_tensors(tensors, dtype, &device)
            }
            WeightInit::Zeros => {
                warn!("zero-initialized parameters requested; output will be meaningless");
                VarBuilder::zeros(dtype, &device)
            }
        };

        let cache = Cache::new(true, dtype, &llama_config, &device)?;
        let llava = LLaVA::load(vb, &llava_config, Some(clip_vision_config))
            .map_err(|e| Error::ModelLoad(e.to_string()))?;

        let context_length = context_length_from_config(&raw_config);
        let use_image_markers = raw_config
            .get("mm_use_im_start_end")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let eos_token_id = llava_config.eos_token_id;

        debug!(
            "loaded {} (context {context_length}, sigma {})",
            options.model_path, options.sigma
        );

        Ok(Self {
            llava,
            tokenizer,
            processor,
            llava_config,
            cache,
            device,
            dtype,
            eos_token_id,
            context_length,
            use_image_markers,
            sigma: options.sigma,
        })
    }

    /// Decode the trailing tokens and test for the stop keyword.
    fn tail_matches_stop(&self, generated: &[u32], stop: &str) -> Result<bool> {
        if generated.is_empty() {
            return Ok(false);
        }
        let tail_start = generated.len().saturating_sub(STOP_TAIL_TOKENS);
        let text = self
            .tokenizer
            .decode(&generated[tail_start..], false)
            .map_err(Error::from)?;
        Ok(text.trim_end().ends_with(stop))
    }
}

fn select_device(preference: DevicePreference) -> Result<(Device, DType)> {
    match preference {
        DevicePreference::Cpu => Ok((Device::Cpu, DType::F32)),
        DevicePreference::Auto => match Device::cuda_if_available(0) {
            Ok(device) if device.is_cuda() => Ok((device, DType::BF16)),
            Ok(device) => Ok((device, DType::F32)),
            Err(e) => {
                warn!("CUDA unavailable, using CPU: {e}");
                Ok((Device::Cpu, DType::F32))
            }
        },
    }
}

fn context_length_from_config(raw: &Value) -> usize {
    raw.get("max_position_embeddings")
        .or_else(|| {
            raw.get("text_config")
                .and_then(|tc| tc.get("max_position_embeddings"))
        })
        .and_then(Value::as_u64)
        .map_or(DEFAULT_CONTEXT_LENGTH, |v| v as usize)
}

impl ModelBackend for LlavaBackend {
    fn context_length(&self) -> usize {
        self.context_length
    }

    fn uses_image_markers(&self) -> bool {
        self.use_image_markers
    }

    fn encode_prompt(&self, prompt: &str) -> Result<Vec<i64>> {
        let chunks = prompt
            .split(IMAGE_PLACEHOLDER)
            .map(|chunk| {
                self.tokenizer
                    .encode(chunk, true)
                    .map(|enc| enc.get_ids().iter().map(|&id| i64::from(id)).collect())
            })
            .collect::<std::result::Result<Vec<Vec<i64>>, _>>()
            .map_err(Error::from)?;
        Ok(splice_image_tokens(&chunks, self.llava_config.bos_token_id as i64))
    }

    fn generate(
        &mut self,
        input_ids: &[i64],
        image: &RgbImage,
        params: &GenerationParams,
        stop: &str,
    ) -> Result<Vec<i64>> {
        let image_tensor = self
            .processor
            .preprocess(image, &self.device)?
            .to_dtype(self.dtype)?;
        let image_size = image.dimensions();

        let input = Tensor::from_vec(input_ids.to_vec(), (1, input_ids.len()), &self.device)?;
        let mut embeds = self
            .llava
            .prepare_inputs_labels_for_multimodal(&input, &[image_tensor], &[image_size])
            .map_err(|e| Error::Generation(e.to_string()))?;

        let sampling = if params.do_sample && params.temperature > 0.0 {
            Sampling::TopP {
                p: params.top_p,
                temperature: params.temperature,
            }
        } else {
            Sampling::ArgMax
        };
        let mut logits_processor = LogitsProcessor::from_sampling(params.seed, sampling);

        // fresh KV cache per image
        let mut cache = self.cache.clone();
        let max_total = params.max_length.min(self.context_length);

        let mut output: Vec<i64> = input_ids.to_vec();
        let mut generated: Vec<u32> = Vec::new();
        let mut index_pos = 0usize;
        let mut step = 0usize;

        loop {
            let (_, embed_len, _) = embeds.dims3()?;
            // total length bound counts the image-token expansion
            if embed_len >= max_total {
                break;
            }
            let (context_size, context_index) = if step > 0 {
                (1, index_pos)
            } else {
                (embed_len, 0)
            };
            let input_slice = embeds.i((.., embed_len - context_size.., ..))?;
            let logits = self
                .llava
                .forward(&input_slice, context_index, &mut cache)
                .map_err(|e| Error::Generation(e.to_string()))?
                .squeeze(0)?;
            let logits = if params.repeat_penalty == 1.0 {
                logits
            } else {
                apply_repeat_penalty(&logits, params.repeat_penalty, &generated)?
            };
            index_pos += context_size;
            step += 1;

            let next = logits_processor.sample(&logits)?;
            if next as usize == self.eos_token_id {
                break;
            }
            generated.push(next);
            output.push(i64::from(next));
            if !stop.is_empty() && self.tail_matches_stop(&generated, stop)? {
                break;
            }

            let next_tensor = Tensor::from_vec(vec![next], (1,), &self.device)?;
            let next_embeds = self
                .llava
                .llama
                .embed(&next_tensor)
                .map_err(|e| Error::Generation(e.to_string()))?
                .unsqueeze(0)?;
            embeds = Tensor::cat(&[&embeds, &next_embeds], 1)?;
        }

        debug!("generated {} tokens", generated.len());
        Ok(output)
    }

    fn decode(&self, tokens: &[i64]) -> Result<String> {
        let ids: Vec<u32> = tokens
            .iter()
            .filter(|&&id| id >= 0)
            .map(|&id| id as u32)
            .collect();
        self.tokenizer.decode(&ids, true).map_err(Error::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_splice_image_tokens_single_image() {
        // "<s>prefix" + "<image>" + "<s>suffix"
        let chunks = vec![vec![1, 10, 11], vec![1, 20, 21]];
        let ids = splice_image_tokens(&chunks, 1);
        assert_eq!(ids, vec![1, 10, 11, IMAGE_TOKEN_INDEX, 20, 21]);
    }

    #[test]
    fn test_splice_image_tokens_no_image() {
        let chunks = vec![vec![1, 10, 11]];
        assert_eq!(splice_image_tokens(&chunks, 1), vec![1, 10, 11]);
    }

    #[test]
    fn test_splice_image_tokens_keeps_non_bos_chunk() {
        let chunks = vec![vec![1, 10], vec![20, 21]];
        let ids = splice_image_tokens(&chunks, 1);
        assert_eq!(ids, vec![1, 10, IMAGE_TOKEN_INDEX, 20, 21]);
    }

    #[test]
    fn test_sharded_weight_names_dedup_sorted() {
        let index = br#"{
            "metadata": {"total_size": 2},
            "weight_map": {
                "a.weight": "model-00002-of-00002.safetensors",
                "b.weight": "model-00001-of-00002.safetensors",
                "c.weight": "model-00001-of-00002.safetensors"
            }
        }"#;
        let names = sharded_weight_names(index).unwrap();
        assert_eq!(
            names,
            vec![
                "model-00001-of-00002.safetensors".to_string(),
                "model-00002-of-00002.safetensors".to_string()
            ]
        );
    }

    #[test]
    fn test_sharded_weight_names_malformed() {
        let err = sharded_weight_names(br#"{"metadata": {}}"#).unwrap_err();
        assert!(matches!(err, Error::ModelLoad(_)));
    }

    #[test]
    fn test_context_length_from_config() {
        let raw: Value =
            serde_json::from_str(r#"{"text_config": {"max_position_embeddings": 2048}}"#).unwrap();
        assert_eq!(context_length_from_config(&raw), 2048);
        let raw: Value = serde_json::from_str("{}").unwrap();
        assert_eq!(context_length_from_config(&raw), DEFAULT_CONTEXT_LENGTH);
    }
}
