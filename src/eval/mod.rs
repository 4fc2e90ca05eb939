//! Evaluation session and report generation.
//!
//! This module provides the core evaluation infrastructure:
//!
//! - [`session::EvalSession`]: the sequential per-image generation loop
//! - [`session::EvalConfig`]: configuration for a run
//! - [`report`]: result records and the output artifact

pub mod report;
pub mod session;

pub use report::{CaptionRecord, EvalReport};
pub use session::{EvalConfig, EvalSession};
