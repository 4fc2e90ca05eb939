//! # vlm-eval
//!
//! Evaluation harness for image captioning with a pretrained vision-language
//! model.
//!
//! The harness drives one model through a fixed loop over a Visual Genome
//! image set: build a prompt, and for each image load it, generate a
//! bounded-length description, and record the trimmed output. All records are
//! written at once as a JSON array after the loop completes.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use vlm_eval::{BackendOptions, EvalConfig, EvalSession, LlavaBackend};
//!
//! let backend = LlavaBackend::load(&BackendOptions::new("llava-hf/llava-1.5-7b-hf"))?;
//!
//! let config = EvalConfig::builder()
//!     .gt_file_path("./data/VisualGenome_task")
//!     .image_path("./data")
//!     .output_folder("./results")
//!     .build();
//!
//! let mut session = EvalSession::new(config, backend);
//! let report = session.run()?;
//! session.write_report(&report)?;
//! ```
//!
//! ## Modules
//!
//! - [`error`]: Error types for the library
//! - [`conversation`]: Conversation templates and stop markers
//! - [`dataset`]: Manifest loading and image path resolution
//! - [`fetch`]: Local and remote image loading
//! - [`backend`]: Model backend seam and its candle implementation
//! - [`eval`]: Evaluation session and report generation

pub mod backend;
pub mod conversation;
pub mod dataset;
pub mod error;
pub mod eval;
pub mod fetch;

// Re-export commonly used types
pub use backend::{
    BackendOptions, DevicePreference, GenerationParams, LlavaBackend, ModelBackend, WeightInit,
};
pub use conversation::ConvTemplate;
pub use error::{Error, Result};
pub use eval::{CaptionRecord, EvalConfig, EvalReport, EvalSession};
