//! vlm-eval CLI - Vision-language model captioning evaluation

use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Context, Result};
use clap::Parser;

use vlm_eval::{
    BackendOptions, ConvTemplate, DevicePreference, EvalConfig, EvalSession, GenerationParams,
    LlavaBackend, WeightInit,
};

/// Generate image descriptions over a Visual Genome image set and write them
/// to a JSON artifact.
#[derive(Parser)]
#[command(name = "vlm-eval")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Model location: local directory or Hugging Face repo id
    #[arg(long, default_value = "llava-hf/llava-1.5-7b-hf")]
    model_path: String,

    /// Optional base model whose tensors are loaded first
    #[arg(long)]
    model_base: Option<String>,

    /// Opaque numeric parameter forwarded to the backend; names the artifact
    #[arg(long, default_value_t = 0.0)]
    sigma: f64,

    /// Folder containing the objects.json manifest
    #[arg(long, default_value = "./data/VisualGenome_task")]
    gt_file_path: PathBuf,

    /// Root folder of the image set
    #[arg(long, default_value = "./data")]
    image_path: PathBuf,

    /// Query posed for every image
    #[arg(long, default_value = "Describe this image as detail as possible.")]
    query: String,

    /// Conversation template (v0, v1)
    #[arg(long, default_value = "v1", value_parser = parse_template)]
    conv_mode: ConvTemplate,

    /// Folder the artifact is written into
    #[arg(long, default_value = "./")]
    output_folder: PathBuf,

    /// Number of leading manifest entries to evaluate
    #[arg(long, default_value_t = 100)]
    limit: usize,

    /// Sampling temperature
    #[arg(long, default_value_t = 0.2)]
    temperature: f64,

    /// Bound on the total token sequence length
    #[arg(long, default_value_t = 1024)]
    max_length: usize,

    /// RNG seed for sampling
    #[arg(long)]
    seed: Option<u64>,

    /// Force CPU execution
    #[arg(long)]
    cpu: bool,

    /// Build the model with zeroed parameters (plumbing smoke tests)
    #[arg(long)]
    zero_weights: bool,

    /// Skip images that resolve to neither path convention
    #[arg(long)]
    skip_missing: bool,

    /// Also write a CSV summary next to the JSON artifact
    #[arg(long)]
    csv_summary: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn parse_template(s: &str) -> Result<ConvTemplate, String> {
    ConvTemplate::from_str(s)
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(if cli.verbose {
        "debug"
    } else {
        "warn"
    }))
    .init();

    if cli.verbose {
        eprintln!("Loading model: {}", cli.model_path);
    }
    let backend_options = BackendOptions {
        model_path: cli.model_path.clone(),
        model_base: cli.model_base.clone(),
        sigma: cli.sigma,
        weight_init: if cli.zero_weights {
            WeightInit::Zeros
        } else {
            WeightInit::Pretrained
        },
        device: if cli.cpu {
            DevicePreference::Cpu
        } else {
            DevicePreference::Auto
        },
    };
    let backend = LlavaBackend::load(&backend_options)
        .with_context(|| format!("Failed to load model from {}", cli.model_path))?;

    let mut generation = GenerationParams {
        temperature: cli.temperature,
        max_length: cli.max_length,
        ..GenerationParams::default()
    };
    if let Some(seed) = cli.seed {
        generation.seed = seed;
    }

    let config = EvalConfig::builder()
        .query(cli.query)
        .template(cli.conv_mode)
        .gt_file_path(cli.gt_file_path)
        .image_path(cli.image_path)
        .output_folder(cli.output_folder)
        .sigma(cli.sigma)
        .limit(cli.limit)
        .generation(generation)
        .skip_missing(cli.skip_missing)
        .csv_summary(cli.csv_summary)
        .build();

    let mut session = EvalSession::new(config, backend);
    let report = session.run().context("Evaluation run failed")?;
    let path = session
        .write_report(&report)
        .context("Failed to write report")?;

    println!("Wrote {} records to {}", report.len(), path.display());
    Ok(())
}
