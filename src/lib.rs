//! `diffusion-atelier` is an orchestration layer over pretrained image-diffusion pipelines.
//!
//! The crate manages pipeline state — deciding when an already-loaded pipeline can be reused,
//! when only the task wiring must change, and when a full rebuild is required — and drives a
//! staged generation request (conditioning, denoising, detail correction, upscaling,
//! persistence) over that state. Model numerics live behind the [`DiffusionBackend`] trait;
//! this crate never touches the weights themselves.
//!
//! ```ignore
//! use diffusion_atelier::{DiffusionSession, GenerationOptions, SessionOptions, Task};
//!
//! let mut session = DiffusionSession::new(backend, externals, SessionOptions::default());
//! session.load_model("./models/dreamshaper.safetensors", Task::Txt2Img, None)?;
//!
//! let output = session.generate(&GenerationOptions::default().with_prompts("photo of a red fox", None).with_seed(42))?;
//! output.images[0].save("result.png")?;
//! ```
//!
//! See [`DiffusionSession`] for the pipeline-state machine and [`GenerationOptions`] for the
//! full request surface.

#![warn(missing_docs)]
#![warn(rustdoc::all)]
#![warn(clippy::correctness, clippy::suspicious, clippy::complexity, clippy::perf, clippy::style)]
#![allow(clippy::tabs_in_doc_comments)]

pub mod backend;
pub mod conditioning;
pub mod config;
pub mod control;
pub mod error;
pub mod generation;
pub mod persist;
pub mod pipelines;
pub mod postprocess;
pub mod schedulers;
pub mod session;
pub mod styles;
pub mod util;

pub use self::backend::{DiffusionBackend, PromptEmbedder};
pub use self::config::ModelSource;
pub use self::error::AtelierError;
pub use self::generation::{DetailCorrectionOverrides, DetailCorrectionPass, GenerationOptions, GenerationOutput, UpscaleOptions};
pub use self::pipelines::*;
pub use self::schedulers::*;
pub use self::session::{DiffusionSession, SessionExternals, SessionOptions};

/// A device on which to place a diffusion pipeline.
///
/// If the configured accelerator is not available, backends fall back to the CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum DiffusionDevice {
	/// Use the CPU as a device. **This is the default device unless another device is specified.**
	Cpu,
	/// Use an accelerator (CUDA or similar) as a device. The value is the device ID, which can be
	/// set to 0 in most cases.
	Accelerator(usize)
}

impl Default for DiffusionDevice {
	fn default() -> Self {
		Self::Cpu
	}
}

impl DiffusionDevice {
	/// Whether this device is an accelerator.
	pub fn is_accelerator(&self) -> bool {
		matches!(self, Self::Accelerator(_))
	}
}

/// Floating-point precision the pipeline weights are held in.
///
/// Half precision is the default for accelerator devices; CPU sessions are always promoted to
/// full precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiffusionPrecision {
	/// 16-bit floating point. Half the memory of [`DiffusionPrecision::Full`], with a small
	/// quality cost. Not usable on CPU devices.
	Half,
	/// 32-bit floating point.
	Full
}

impl Default for DiffusionPrecision {
	fn default() -> Self {
		Self::Half
	}
}

impl DiffusionPrecision {
	/// Resolves the effective precision for `device`; CPU devices always compute in full
	/// precision.
	pub fn for_device(self, device: DiffusionDevice) -> Self {
		if device.is_accelerator() { self } else { Self::Full }
	}
}
