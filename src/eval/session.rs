//! Evaluation session driving the per-image generation loop.
//!
//! This module provides [`EvalSession`], the main entry point. A session
//! owns a model backend and a configuration, builds the prompt once, and
//! processes dataset entries strictly sequentially: resolve path, load
//! image, encode, generate, decode the new suffix, trim the stop marker,
//! record.

use std::path::PathBuf;

use log::{debug, warn};

use crate::backend::{GenerationParams, ModelBackend};
use crate::conversation::{image_query, ConvTemplate};
use crate::dataset::{self, DEFAULT_ENTRY_LIMIT};
use crate::error::{Error, Result};
use crate::eval::report::{CaptionRecord, EvalReport};
use crate::fetch;

/// Configuration for an evaluation session.
#[derive(Debug, Clone)]
pub struct EvalConfig {
    /// User query posed for every image.
    pub query: String,

    /// Conversation template wrapping the query.
    pub template: ConvTemplate,

    /// Folder containing the `objects.json` manifest.
    pub gt_file_path: PathBuf,

    /// Root folder of the image set.
    pub image_path: PathBuf,

    /// Folder the artifact is written into.
    pub output_folder: PathBuf,

    /// Opaque numeric parameter; names the artifact and is forwarded to the
    /// backend at load time.
    pub sigma: f64,

    /// Number of leading manifest entries to evaluate.
    pub limit: usize,

    /// Sampling and length parameters.
    pub generation: GenerationParams,

    /// Skip entries whose image resolves to neither path convention instead
    /// of aborting the run.
    pub skip_missing: bool,

    /// Also write a CSV summary next to the JSON artifact.
    pub csv_summary: bool,
}

impl EvalConfig {
    /// Create a new configuration builder.
    #[must_use]
    pub fn builder() -> EvalConfigBuilder {
        EvalConfigBuilder::default()
    }
}

impl Default for EvalConfig {
    fn default() -> Self {
        EvalConfigBuilder::default().build()
    }
}

/// Builder for [`EvalConfig`].
#[derive(Debug, Default)]
pub struct EvalConfigBuilder {
    query: Option<String>,
    template: Option<ConvTemplate>,
    gt_file_path: Option<PathBuf>,
    image_path: Option<PathBuf>,
    output_folder: Option<PathBuf>,
    sigma: Option<f64>,
    limit: Option<usize>,
    generation: Option<GenerationParams>,
    skip_missing: bool,
    csv_summary: bool,
}

impl EvalConfigBuilder {
    /// Set the per-image user query.
    #[must_use]
    pub fn query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    /// Set the conversation template.
    #[must_use]
    pub fn template(mut self, template: ConvTemplate) -> Self {
        self.template = Some(template);
        self
    }

    /// Set the ground-truth folder holding `objects.json`.
    #[must_use]
    pub fn gt_file_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.gt_file_path = Some(path.into());
        self
    }

    /// Set the image root folder.
    #[must_use]
    pub fn image_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.image_path = Some(path.into());
        self
    }

    /// Set the output folder.
    #[must_use]
    pub fn output_folder(mut self, path: impl Into<PathBuf>) -> Self {
        self.output_folder = Some(path.into());
        self
    }

    /// Set the sigma passthrough value.
    #[must_use]
    pub fn sigma(mut self, sigma: f64) -> Self {
        self.sigma = Some(sigma);
        self
    }

    /// Set the manifest entry limit.
    #[must_use]
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Set the generation parameters.
    #[must_use]
    pub fn generation(mut self, generation: GenerationParams) -> Self {
        self.generation = Some(generation);
        self
    }

    /// Skip unresolvable images instead of aborting.
    #[must_use]
    pub fn skip_missing(mut self, skip: bool) -> Self {
        self.skip_missing = skip;
        self
    }

    /// Emit a CSV summary alongside the JSON artifact.
    #[must_use]
    pub fn csv_summary(mut self, csv: bool) -> Self {
        self.csv_summary = csv;
        self
    }

    /// Build the configuration, applying defaults for unset fields.
    #[must_use]
    pub fn build(self) -> EvalConfig {
        EvalConfig {
            query: self
                .query
                .unwrap_or_else(|| "Describe this image as detail as possible.".to_string()),
            template: self.template.unwrap_or_default(),
            gt_file_path: self
                .gt_file_path
                .unwrap_or_else(|| PathBuf::from("./data/VisualGenome_task")),
            image_path: self.image_path.unwrap_or_else(|| PathBuf::from("./data")),
            output_folder: self.output_folder.unwrap_or_else(|| PathBuf::from("./")),
            sigma: self.sigma.unwrap_or(0.0),
            limit: self.limit.unwrap_or(DEFAULT_ENTRY_LIMIT),
            generation: self.generation.unwrap_or_default(),
            skip_missing: self.skip_missing,
            csv_summary: self.csv_summary,
        }
    }
}

/// Evaluation session: one backend, one configuration, one run.
pub struct EvalSession<B: ModelBackend> {
    config: EvalConfig,
    backend: B,
}

impl<B: ModelBackend> EvalSession<B> {
    /// Create a session from a configuration and a loaded backend.
    pub fn new(config: EvalConfig, backend: B) -> Self {
        Self { config, backend }
    }

    /// The active configuration.
    #[must_use]
    pub fn config(&self) -> &EvalConfig {
        &self.config
    }

    /// Run the evaluation loop over the dataset.
    ///
    /// Entries are processed strictly in manifest order, one at a time.
    /// Records accumulate in memory; nothing is written until
    /// [`write_report`](Self::write_report).
    ///
    /// # Errors
    ///
    /// Any stage failure aborts the run, except an unresolvable image when
    /// `skip_missing` is set, which logs and continues.
    pub fn run(&mut self) -> Result<EvalReport> {
        let query = image_query(&self.config.query, self.backend.uses_image_markers());
        let prompt = self.config.template.prompt(&query);
        let stop = self.config.template.stop_marker();
        debug!("prompt: {prompt}");

        let image_ids = dataset::load_image_ids(&self.config.gt_file_path, self.config.limit)?;
        debug!("evaluating {} images", image_ids.len());

        let mut report = EvalReport::new();
        for (index, image_id) in image_ids.iter().copied().enumerate() {
            let path = match dataset::resolve_image_path(&self.config.image_path, image_id) {
                Ok(path) => path,
                Err(err @ Error::MissingImage { .. }) if self.config.skip_missing => {
                    warn!("skipping: {err}");
                    continue;
                }
                Err(err) => return Err(err),
            };

            let image = fetch::load_local(&path)?;
            let input_ids = self.backend.encode_prompt(&prompt)?;
            let output_ids =
                self.backend
                    .generate(&input_ids, &image, &self.config.generation, stop)?;

            let input_len = input_ids.len();
            let n_diff = prefix_divergence(&input_ids, &output_ids);
            if n_diff > 0 {
                warn!("{n_diff} output tokens are not the same as the input tokens");
            }

            let suffix = if output_ids.len() > input_len {
                &output_ids[input_len..]
            } else {
                &[]
            };
            let raw = self.backend.decode(suffix)?;
            let text = trim_response(&raw, stop);

            println!("{image_id} {text}");
            debug!("[{}/{}] image {image_id} done", index + 1, image_ids.len());

            report.push(CaptionRecord {
                image_id,
                path,
                text,
            });
        }

        Ok(report)
    }

    /// Write the artifact (and the CSV summary when configured) to the
    /// output folder. Returns the JSON artifact path.
    pub fn write_report(&self, report: &EvalReport) -> Result<PathBuf> {
        let path = report.write_json(&self.config.output_folder, self.config.sigma)?;
        if self.config.csv_summary {
            report.write_csv_summary(&self.config.output_folder, self.config.sigma)?;
        }
        Ok(path)
    }
}

/// Count positions where the generated sequence disagrees with its prompt
/// prefix. A truncated prefix counts every missing position.
fn prefix_divergence(input_ids: &[i64], output_ids: &[i64]) -> usize {
    let compared = input_ids.len().min(output_ids.len());
    let mismatched = input_ids[..compared]
        .iter()
        .zip(&output_ids[..compared])
        .filter(|(a, b)| a != b)
        .count();
    mismatched + (input_ids.len() - compared)
}

/// Strip whitespace, then a trailing stop marker, then whitespace again.
fn trim_response(text: &str, stop: &str) -> String {
    let trimmed = text.trim();
    let trimmed = if !stop.is_empty() {
        trimmed.strip_suffix(stop).unwrap_or(trimmed)
    } else {
        trimmed
    };
    trimmed.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;
    use std::fs;
    use std::path::Path;

    /// Backend stub with a byte-level "tokenizer" and canned responses.
    struct MockBackend {
        responses: Vec<String>,
        calls: usize,
        diverge_prefix: bool,
        emit_stop: bool,
    }

    impl MockBackend {
        fn new(responses: &[&str]) -> Self {
            Self {
                responses: responses.iter().map(|s| s.to_string()).collect(),
                calls: 0,
                diverge_prefix: false,
                emit_stop: false,
            }
        }
    }

    impl ModelBackend for MockBackend {
        fn context_length(&self) -> usize {
            4096
        }

        fn uses_image_markers(&self) -> bool {
            false
        }

        fn encode_prompt(&self, prompt: &str) -> Result<Vec<i64>> {
            Ok(prompt.bytes().map(i64::from).collect())
        }

        fn generate(
            &mut self,
            input_ids: &[i64],
            _image: &RgbImage,
            _params: &GenerationParams,
            stop: &str,
        ) -> Result<Vec<i64>> {
            let mut output = input_ids.to_vec();
            if self.diverge_prefix && !output.is_empty() {
                output[0] += 1;
            }
            let response = self
                .responses
                .get(self.calls % self.responses.len())
                .cloned()
                .unwrap_or_default();
            self.calls += 1;
            output.extend(response.bytes().map(i64::from));
            if self.emit_stop {
                output.extend(stop.bytes().map(i64::from));
            }
            Ok(output)
        }

        fn decode(&self, tokens: &[i64]) -> Result<String> {
            let bytes: Vec<u8> = tokens.iter().map(|&t| t as u8).collect();
            Ok(String::from_utf8_lossy(&bytes).into_owned())
        }
    }

    fn write_manifest(dir: &Path, ids: &[u64]) {
        let entries: Vec<serde_json::Value> = ids
            .iter()
            .map(|id| serde_json::json!({ "image_id": id }))
            .collect();
        fs::write(
            dir.join("objects.json"),
            serde_json::to_vec(&entries).unwrap(),
        )
        .unwrap();
    }

    fn write_image(root: &Path, subdir: &str, id: u64) {
        let dir = root.join(subdir);
        fs::create_dir_all(&dir).unwrap();
        let img = RgbImage::from_pixel(2, 2, image::Rgb([1, 2, 3]));
        img.save(dir.join(format!("{id}.jpg"))).unwrap();
    }

    fn test_config(gt: &Path, images: &Path, out: &Path) -> EvalConfig {
        EvalConfig::builder()
            .gt_file_path(gt)
            .image_path(images)
            .output_folder(out)
            .build()
    }

    #[test]
    fn test_run_records_in_dataset_order() {
        let gt = tempfile::tempdir().unwrap();
        let images = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        write_manifest(gt.path(), &[1, 2, 3]);
        for id in [1, 2, 3] {
            write_image(images.path(), "images2/VG_100K_2", id);
        }

        let backend = MockBackend::new(&["a cat", "a dog", "a fish"]);
        let mut session = EvalSession::new(
            test_config(gt.path(), images.path(), out.path()),
            backend,
        );

        let report = session.run().unwrap();
        assert_eq!(report.len(), 3);
        assert_eq!(report.records[0].image_id, 1);
        assert_eq!(report.records[0].text, "a cat");
        assert_eq!(report.records[1].text, "a dog");
        assert_eq!(report.records[2].text, "a fish");
        assert_eq!(
            report.records[0].path,
            images.path().join("images2/VG_100K_2/1.jpg")
        );
    }

    #[test]
    fn test_run_uses_secondary_path_when_primary_absent() {
        let gt = tempfile::tempdir().unwrap();
        let images = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        write_manifest(gt.path(), &[9]);
        write_image(images.path(), "images/VG_100K", 9);

        let backend = MockBackend::new(&["a boat"]);
        let mut session = EvalSession::new(
            test_config(gt.path(), images.path(), out.path()),
            backend,
        );

        let report = session.run().unwrap();
        assert_eq!(
            report.records[0].path,
            images.path().join("images/VG_100K/9.jpg")
        );
    }

    #[test]
    fn test_run_aborts_on_missing_image_by_default() {
        let gt = tempfile::tempdir().unwrap();
        let images = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        write_manifest(gt.path(), &[1, 2]);
        write_image(images.path(), "images2/VG_100K_2", 1);

        let backend = MockBackend::new(&["a cat"]);
        let mut session = EvalSession::new(
            test_config(gt.path(), images.path(), out.path()),
            backend,
        );

        let err = session.run().unwrap_err();
        assert!(matches!(err, Error::MissingImage { image_id: 2, .. }));
    }

    #[test]
    fn test_run_skips_missing_when_configured() {
        let gt = tempfile::tempdir().unwrap();
        let images = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        write_manifest(gt.path(), &[1, 2, 3]);
        write_image(images.path(), "images2/VG_100K_2", 1);
        write_image(images.path(), "images2/VG_100K_2", 3);

        let backend = MockBackend::new(&["a cat", "a fish"]);
        let config = EvalConfig::builder()
            .gt_file_path(gt.path())
            .image_path(images.path())
            .output_folder(out.path())
            .skip_missing(true)
            .build();
        let mut session = EvalSession::new(config, backend);

        let report = session.run().unwrap();
        assert_eq!(report.len(), 2);
        assert_eq!(report.records[0].image_id, 1);
        assert_eq!(report.records[1].image_id, 3);
    }

    #[test]
    fn test_run_respects_entry_limit() {
        let gt = tempfile::tempdir().unwrap();
        let images = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let ids: Vec<u64> = (0..150).collect();
        write_manifest(gt.path(), &ids);
        for id in 0..5 {
            write_image(images.path(), "images2/VG_100K_2", id);
        }

        let backend = MockBackend::new(&["something"]);
        let config = EvalConfig::builder()
            .gt_file_path(gt.path())
            .image_path(images.path())
            .output_folder(out.path())
            .limit(5)
            .build();
        let mut session = EvalSession::new(config, backend);

        let report = session.run().unwrap();
        assert_eq!(report.len(), 5);
    }

    #[test]
    fn test_run_trims_trailing_stop_marker() {
        let gt = tempfile::tempdir().unwrap();
        let images = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        write_manifest(gt.path(), &[1]);
        write_image(images.path(), "images2/VG_100K_2", 1);

        let mut backend = MockBackend::new(&["a cat  "]);
        backend.emit_stop = true;
        let mut session = EvalSession::new(
            test_config(gt.path(), images.path(), out.path()),
            backend,
        );

        let report = session.run().unwrap();
        let stop = ConvTemplate::default().stop_marker();
        assert_eq!(report.records[0].text, "a cat");
        assert!(!report.records[0].text.ends_with(stop));
    }

    #[test]
    fn test_run_survives_prefix_divergence() {
        let gt = tempfile::tempdir().unwrap();
        let images = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        write_manifest(gt.path(), &[1]);
        write_image(images.path(), "images2/VG_100K_2", 1);

        let mut backend = MockBackend::new(&["a cat"]);
        backend.diverge_prefix = true;
        let mut session = EvalSession::new(
            test_config(gt.path(), images.path(), out.path()),
            backend,
        );

        let report = session.run().unwrap();
        assert_eq!(report.records[0].text, "a cat");
    }

    #[test]
    fn test_write_report_places_artifact_by_sigma() {
        let gt = tempfile::tempdir().unwrap();
        let images = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        write_manifest(gt.path(), &[1]);
        write_image(images.path(), "images2/VG_100K_2", 1);

        let backend = MockBackend::new(&["a cat"]);
        let config = EvalConfig::builder()
            .gt_file_path(gt.path())
            .image_path(images.path())
            .output_folder(out.path())
            .sigma(2.5)
            .csv_summary(true)
            .build();
        let mut session = EvalSession::new(config, backend);

        let report = session.run().unwrap();
        let path = session.write_report(&report).unwrap();
        assert_eq!(path, out.path().join("vg_2.5.json"));
        assert!(out.path().join("vg_2.5.csv").is_file());
    }

    #[test]
    fn test_prefix_divergence_counts() {
        assert_eq!(prefix_divergence(&[1, 2, 3], &[1, 2, 3, 9]), 0);
        assert_eq!(prefix_divergence(&[1, 2, 3], &[1, 5, 3, 9]), 1);
        assert_eq!(prefix_divergence(&[1, 2, 3], &[1, 2]), 1);
    }

    #[test]
    fn test_trim_response() {
        assert_eq!(trim_response("  a cat </s>", "</s>"), "a cat");
        assert_eq!(trim_response("a cat", "</s>"), "a cat");
        assert_eq!(trim_response(" a cat### ", "###"), "a cat");
        assert_eq!(trim_response("", "</s>"), "");
    }

    #[test]
    fn test_config_builder_defaults() {
        let config = EvalConfig::default();
        assert_eq!(config.limit, 100);
        assert_eq!(config.template, ConvTemplate::V1);
        assert!(!config.skip_missing);
        assert_eq!(config.query, "Describe this image as detail as possible.");
    }
}
