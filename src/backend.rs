//! The seam between the orchestration engine and the model numerics.
//!
//! Everything this crate treats as an external collaborator — component loading, denoising
//! execution, preprocessor detectors, the prompt-weighting engine, detail correction,
//! upscaling, persistence — is consumed through the narrow traits in this module. The engine
//! owns *when* these run and what state they run against; implementations own the math.

use std::path::{Path, PathBuf};

use image::RgbImage;
use ndarray::ArrayD;
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::conditioning::Conditioning;
use crate::config::ModelSource;
use crate::control::{ControlInput, DetectorKind, DetectorParams};
use crate::persist::ImageMetadata;
use crate::pipelines::{ComponentHandle, ComponentSet, PipelineFamily, PipelineVariant, Task};
use crate::postprocess::{DetailCorrectionJob, UpscaleJob};
use crate::{DiffusionDevice, DiffusionPrecision};

/// FreeU scaling constants, chosen per model family.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FreeUConfig {
	/// Stage-1 skip scaling factor.
	pub s1: f32,
	/// Stage-2 skip scaling factor.
	pub s2: f32,
	/// Stage-1 backbone scaling factor.
	pub b1: f32,
	/// Stage-2 backbone scaling factor.
	pub b2: f32
}

impl FreeUConfig {
	/// The published FreeU constants for `family`.
	pub fn for_family(family: PipelineFamily) -> Self {
		match family {
			PipelineFamily::StableDiffusion => FreeUConfig { s1: 0.9, s2: 0.2, b1: 1.2, b2: 1.4 },
			PipelineFamily::StableDiffusionXl => FreeUConfig { s1: 0.6, s2: 0.4, b1: 1.1, b2: 1.2 }
		}
	}
}

/// A seeded pseudo-random generator bound to a compute device.
///
/// The generator is defined entirely by its seed so post-processing passes can reuse it without
/// re-randomization; [`NoiseGenerator::rng`] always starts the stream from the beginning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoiseGenerator {
	/// The seed this generator draws from.
	pub seed: u64,
	/// The device noise is sampled on.
	pub device: DiffusionDevice
}

impl NoiseGenerator {
	/// Creates a generator bound to `device`.
	pub fn on(seed: u64, device: DiffusionDevice) -> Self {
		Self { seed, device }
	}

	/// Creates a host-CPU generator, the fallback when accelerator binding fails.
	pub fn host(seed: u64) -> Self {
		Self { seed, device: DiffusionDevice::Cpu }
	}

	/// A fresh RNG seeded from this generator's seed.
	pub fn rng(&self) -> StdRng {
		StdRng::seed_from_u64(self.seed)
	}
}

/// The full input set for one denoise call against an assembled variant.
#[derive(Debug)]
pub struct DenoiseInputs<'a> {
	/// The task the active variant was assembled for.
	pub task: Task,
	/// Prepared prompt conditioning.
	pub conditioning: &'a Conditioning,
	/// Output width; meaningful for text-to-image only.
	pub width: u32,
	/// Output height; meaningful for text-to-image only.
	pub height: u32,
	/// Denoising step count.
	pub steps: u32,
	/// Classifier-free guidance scale.
	pub guidance_scale: f32,
	/// One generator per image in the batch.
	pub generators: &'a [NoiseGenerator],
	/// Prepared control input for non-text-to-image tasks.
	pub control: Option<&'a ControlInput>,
	/// Denoising strength for image-to-image and inpainting.
	pub strength: f32,
	/// Control-module conditioning scale.
	pub control_conditioning_scale: f32,
	/// The `(start, end)` fraction of steps the control module applies over.
	pub control_guidance: (f32, f32),
	/// Adapter conditioning scale (adapter-guided tasks).
	pub adapter_conditioning_scale: f32,
	/// The fraction of timesteps the adapter applies for (adapter-guided tasks).
	pub adapter_conditioning_factor: f32
}

/// The result of one denoise call.
#[derive(Debug, Default)]
pub struct DenoiseOutput {
	/// The decoded output images, one per generator.
	pub images: Vec<RgbImage>,
	/// Raw latents, carried opaquely for upscale passes that operate pre-decode.
	pub latents: Option<ArrayD<f32>>
}

/// Supplies loaded model components and executes assembled pipeline variants.
///
/// The engine calls these methods in a strict order per request (assembly before adapter
/// reconciliation before denoising) and is the sole owner of when [`reclaim_memory`] runs;
/// implementations should release any accelerator scratch memory there.
///
/// [`reclaim_memory`]: DiffusionBackend::reclaim_memory
pub trait DiffusionBackend {
	/// Loads the canonical sub-components of a base model.
	fn load_components(&mut self, source: &ModelSource, family: PipelineFamily, precision: DiffusionPrecision) -> anyhow::Result<ComponentSet>;

	/// Loads a replacement color decoder from a single file or pretrained repository.
	fn load_vae(&mut self, vae_id: &str, precision: DiffusionPrecision) -> anyhow::Result<ComponentHandle>;

	/// Casts a loaded component to `precision` in place. A failure here is degraded, not fatal:
	/// the engine keeps the component at its prior precision.
	fn cast_component(&mut self, component: &ComponentHandle, precision: DiffusionPrecision) -> anyhow::Result<()>;

	/// Loads a control or adapter module by its published repository id.
	fn load_control_module(&mut self, model_id: &str, precision: DiffusionPrecision) -> anyhow::Result<ComponentHandle>;

	/// Moves every component of `variant` to `device`.
	fn move_to_device(&mut self, variant: &PipelineVariant, device: DiffusionDevice) -> anyhow::Result<()>;

	/// Merges a low-rank adapter into the variant's weights at `scale`. Unloading re-applies the
	/// merge with inverted scale, which is numerically approximate rather than a bit-exact
	/// inverse.
	fn merge_adapter(&mut self, variant: &PipelineVariant, adapter_id: &str, scale: f32) -> anyhow::Result<()>;

	/// Registers a textual-inversion token with the tokenizer/encoder stack.
	fn register_embedding(&mut self, components: &ComponentSet, token: &str, source: &str) -> anyhow::Result<()>;

	/// Enables FreeU with `config`, or disables it when `None`.
	fn set_freeu(&mut self, variant: &PipelineVariant, config: Option<FreeUConfig>) -> anyhow::Result<()>;

	/// Constructs the heavy tokenizer/encoder-wrapping prompt embedder for `components`.
	fn embedder(&mut self, components: &ComponentSet, clip_skip: bool) -> anyhow::Result<Box<dyn PromptEmbedder>>;

	/// Binds a seeded generator to `device`. The default binding never fails; accelerator
	/// backends may, in which case the engine falls back to a host generator with a warning.
	fn bind_generator(&mut self, seed: u64, device: DiffusionDevice) -> anyhow::Result<NoiseGenerator> {
		Ok(NoiseGenerator::on(seed, device))
	}

	/// Runs the iterative denoising loop for one batch.
	fn denoise(&mut self, variant: &PipelineVariant, inputs: &DenoiseInputs<'_>) -> anyhow::Result<DenoiseOutput>;

	/// Releases unused accelerator memory. Called at every stage transition of a generation
	/// request and after every pipeline swap.
	fn reclaim_memory(&mut self);
}

/// The weighting-syntax flavor understood by the external syntax engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WeightingSyntax {
	/// `(word:weight)` emphasis syntax.
	#[default]
	Classic,
	/// `(word)weight` compel syntax.
	Compel
}

/// The external prompt-weighting/tokenization engine, wrapped around one model's
/// tokenizer/encoder stack.
pub trait PromptEmbedder {
	/// Parses weighted phrases in `text` and produces an embedding tensor of shape
	/// `[1, tokens, dim]`.
	fn weight_and_embed(&mut self, text: &str, syntax: WeightingSyntax) -> anyhow::Result<ndarray::Array3<f32>>;

	/// Dual-encoder embedding covering `[prompt, negative_prompt]` in one pass: a conditioning
	/// tensor of shape `[2, tokens, dim]` and a pooled tensor of shape `[2, dim]`.
	fn weight_and_embed_dual(&mut self, texts: [&str; 2], syntax: WeightingSyntax) -> anyhow::Result<(ndarray::Array3<f32>, ndarray::Array2<f32>)>;
}

/// Loads single-purpose preprocessor detection models by kind. `load` is expected to be cheap
/// for a repeated kind; the engine handles swap-and-release itself.
pub trait DetectorProvider {
	/// Loads the detector for `kind`.
	fn load(&mut self, kind: DetectorKind) -> anyhow::Result<Box<dyn Detector>>;
}

/// A loaded single-purpose detection model (`image → control signal`).
pub trait Detector {
	/// Extracts the control signal from `image`.
	fn detect(&mut self, image: &RgbImage, params: &DetectorParams) -> anyhow::Result<RgbImage>;
}

/// The external region-detect-and-inpaint detail-correction pass.
pub trait DetailCorrector {
	/// Corrects detected regions in each image, denoising over the job's pipeline variant and
	/// generators. A failure leaves the input images untouched.
	fn correct(&mut self, images: &[RgbImage], job: &DetailCorrectionJob, pipeline: &PipelineVariant) -> anyhow::Result<Vec<RgbImage>>;
}

/// The external super-resolution upscale pass.
pub trait Upscaler {
	/// Upscales each image, optionally running a denoise pass over `pipeline` afterwards. A
	/// failure leaves the input images untouched.
	fn upscale(&mut self, images: &[RgbImage], job: &UpscaleJob, pipeline: Option<&PipelineVariant>) -> anyhow::Result<Vec<RgbImage>>;
}

/// Image persistence with embedded metadata.
pub trait ImageStore {
	/// Saves `image` under `directory` with `metadata` embedded, returning the stored path.
	fn save(&mut self, image: &RgbImage, directory: &Path, metadata: &ImageMetadata) -> anyhow::Result<PathBuf>;
}
