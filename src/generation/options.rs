//! The generation request surface and its defaults.

use image::RgbImage;

use crate::backend::WeightingSyntax;
use crate::control::PreprocessorChoice;
use crate::session::caches::{AdapterRequest, ADAPTER_SLOTS};

/// A resolved detail-correction pass configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct DetailCorrectionPass {
	/// Correction prompt; an empty prompt falls back to the request prompt.
	pub prompt: String,
	/// Correction negative prompt; empty falls back to the request negative prompt.
	pub negative_prompt: String,
	/// Denoising strength over the detected regions.
	pub strength: f32,
	/// Detected-mask dilation in pixels.
	pub mask_dilation: u32,
	/// Detected-mask blur in pixels.
	pub mask_blur: u32,
	/// Padding around the detected region in pixels.
	pub mask_padding: u32,
	/// A sampler override for the correction denoise; `None` reuses the request sampler.
	pub sampler: Option<String>,
	/// Detect faces.
	pub face_detector: bool,
	/// Detect whole persons.
	pub person_detector: bool,
	/// Detect hands.
	pub hand_detector: bool
}

impl Default for DetailCorrectionPass {
	fn default() -> Self {
		Self {
			prompt: String::new(),
			negative_prompt: String::new(),
			strength: 0.35,
			mask_dilation: 4,
			mask_blur: 4,
			mask_padding: 32,
			sampler: None,
			face_detector: true,
			person_detector: true,
			hand_detector: false
		}
	}
}

/// Per-request overrides over the default [`DetailCorrectionPass`] configuration. Unset fields
/// keep their defaults.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DetailCorrectionOverrides {
	/// Overrides [`DetailCorrectionPass::prompt`].
	pub prompt: Option<String>,
	/// Overrides [`DetailCorrectionPass::negative_prompt`].
	pub negative_prompt: Option<String>,
	/// Overrides [`DetailCorrectionPass::strength`].
	pub strength: Option<f32>,
	/// Overrides [`DetailCorrectionPass::mask_dilation`].
	pub mask_dilation: Option<u32>,
	/// Overrides [`DetailCorrectionPass::mask_blur`].
	pub mask_blur: Option<u32>,
	/// Overrides [`DetailCorrectionPass::mask_padding`].
	pub mask_padding: Option<u32>,
	/// Overrides [`DetailCorrectionPass::sampler`].
	pub sampler: Option<String>,
	/// Overrides [`DetailCorrectionPass::face_detector`].
	pub face_detector: Option<bool>,
	/// Overrides [`DetailCorrectionPass::person_detector`].
	pub person_detector: Option<bool>,
	/// Overrides [`DetailCorrectionPass::hand_detector`].
	pub hand_detector: Option<bool>
}

impl DetailCorrectionOverrides {
	/// Merges these overrides over the pass defaults.
	pub fn merge(&self) -> DetailCorrectionPass {
		let defaults = DetailCorrectionPass::default();
		DetailCorrectionPass {
			prompt: self.prompt.clone().unwrap_or(defaults.prompt),
			negative_prompt: self.negative_prompt.clone().unwrap_or(defaults.negative_prompt),
			strength: self.strength.unwrap_or(defaults.strength),
			mask_dilation: self.mask_dilation.unwrap_or(defaults.mask_dilation),
			mask_blur: self.mask_blur.unwrap_or(defaults.mask_blur),
			mask_padding: self.mask_padding.unwrap_or(defaults.mask_padding),
			sampler: self.sampler.clone().or(defaults.sampler),
			face_detector: self.face_detector.unwrap_or(defaults.face_detector),
			person_detector: self.person_detector.unwrap_or(defaults.person_detector),
			hand_detector: self.hand_detector.unwrap_or(defaults.hand_detector)
		}
	}
}

/// Upscale-pass options within a generation request.
#[derive(Debug, Clone, PartialEq)]
pub struct UpscaleOptions {
	/// Path or identifier of the super-resolution model.
	pub model_path: String,
	/// The factor the output size is increased by.
	pub scale: f32,
	/// Processing tile size in pixels.
	pub tile: u32,
	/// Overlap between processing tiles in pixels.
	pub tile_overlap: u32,
	/// Step count of the post-upscale denoise. Zero skips the denoise entirely.
	pub steps: u32,
	/// Denoising strength of the post-upscale denoise.
	pub denoising_strength: f32,
	/// Prompt for the post-upscale denoise; empty falls back to the request prompt.
	pub prompt: String,
	/// Negative prompt for the post-upscale denoise; empty falls back to the request negative.
	pub negative_prompt: String,
	/// A sampler override for the post-upscale denoise; `None` reuses the request sampler.
	pub sampler: Option<String>
}

impl UpscaleOptions {
	/// Upscale options for `model_path` with default pass parameters.
	pub fn new(model_path: impl Into<String>) -> Self {
		Self {
			model_path: model_path.into(),
			scale: 1.5,
			tile: 100,
			tile_overlap: 10,
			steps: 25,
			denoising_strength: 0.35,
			prompt: String::new(),
			negative_prompt: String::new(),
			sampler: None
		}
	}
}

/// All options of one generation request.
///
/// Defaults follow what the orchestration layer was tuned for: 512×512, 30 steps, guidance 7.5,
/// clip-skip enabled, a random seed, the `DPM++ 2M` sampler. Options that only apply to some
/// tasks are ignored by the others; the reference `image` (and the `mask` for inpainting) are
/// the only options whose absence is fatal when the task requires them.
#[derive(Debug, Clone)]
pub struct GenerationOptions {
	/// The positive prompt.
	pub prompt: String,
	/// The negative prompt.
	pub negative_prompt: String,
	/// Output width in pixels. Aligned up to the nearest multiple of 8 if misaligned.
	pub width: u32,
	/// Output height in pixels. Aligned up to the nearest multiple of 8 if misaligned.
	pub height: u32,
	/// Denoising step count.
	pub steps: u32,
	/// Classifier-free guidance scale.
	pub guidance_scale: f32,
	/// Whether to read the penultimate text-encoder layer.
	pub clip_skip: bool,
	/// The base seed. Negative requests an independent random seed per image.
	pub seed: i64,
	/// The sampler name; must be one of [`crate::schedulers::SAMPLER_NAMES`].
	pub sampler: String,
	/// The prompt-weighting syntax flavor.
	pub syntax: WeightingSyntax,
	/// The number of images to generate per batch.
	pub image_count: u32,
	/// How many times the whole request is repeated back-to-back.
	pub loop_generation: u32,

	/// The low-rank adapter slots, each `(source, merge scale)`.
	pub adapters: [AdapterRequest; ADAPTER_SLOTS],
	/// `(token, source)` textual-inversion pairs.
	pub textual_inversion: Vec<(String, String)>,
	/// Whether to enable FreeU scaling for this request.
	pub freeu: bool,
	/// Named styles to apply to the prompt pair, in order.
	pub styles: Vec<String>,

	/// The reference image. Required for every task except text-to-image.
	pub image: Option<RgbImage>,
	/// The inpainting mask. Required for inpainting.
	pub mask: Option<RgbImage>,
	/// The preprocessor variant for tasks that offer a choice.
	pub preprocessor: PreprocessorChoice,
	/// Whether adapter-guided tasks run their preprocessor (disable when the reference image is
	/// already a control signal).
	pub adapter_preprocessor: bool,
	/// Detector working resolution.
	pub preprocess_resolution: u32,
	/// Output resolution for reference-image tasks; the image is fit to this on its longest side.
	pub image_resolution: u32,
	/// Canny lower threshold.
	pub low_threshold: u32,
	/// Canny upper threshold.
	pub high_threshold: u32,
	/// MLSD value threshold.
	pub value_threshold: f32,
	/// MLSD distance threshold.
	pub distance_threshold: f32,

	/// Denoising strength for image-to-image and inpainting.
	pub strength: f32,
	/// Control-module conditioning scale.
	pub controlnet_conditioning_scale: f32,
	/// Fraction of steps at which control guidance starts.
	pub control_guidance_start: f32,
	/// Fraction of steps at which control guidance ends.
	pub control_guidance_end: f32,
	/// Adapter conditioning scale (adapter-guided tasks).
	pub adapter_conditioning_scale: f32,
	/// Fraction of timesteps the adapter applies for (adapter-guided tasks).
	pub adapter_conditioning_factor: f32,

	/// First detail-correction pass; `Some` enables it.
	pub detail_correction_a: Option<DetailCorrectionOverrides>,
	/// Second detail-correction pass; `Some` enables it.
	pub detail_correction_b: Option<DetailCorrectionOverrides>,
	/// Upscale pass; `Some` enables it.
	pub upscale: Option<UpscaleOptions>,
	/// Run the upscale pass before the detail-correction passes. Independent of
	/// [`GenerationOptions::upscale_after_detail_correction`]; both may be set.
	pub upscale_before_detail_correction: bool,
	/// Run the upscale pass after the detail-correction passes.
	pub upscale_after_detail_correction: bool,

	/// Whether noise generators are bound on the host CPU even for accelerator sessions.
	pub generator_on_cpu: bool,
	/// Whether outputs are persisted to storage.
	pub save_images: bool,
	/// Directory persisted images are written under.
	pub image_storage_location: String,

	/// Keep the prompt-embedder helper loaded after this request.
	pub retain_embedder: bool,
	/// Keep the detail-correction variant assembled after this request.
	pub retain_detail_variant: bool,
	/// Keep the post-upscale denoise variant assembled after this request.
	pub retain_hires_variant: bool
}

impl Default for GenerationOptions {
	fn default() -> Self {
		Self {
			prompt: String::new(),
			negative_prompt: String::new(),
			width: 512,
			height: 512,
			steps: 30,
			guidance_scale: 7.5,
			clip_skip: true,
			seed: -1,
			sampler: "DPM++ 2M".to_string(),
			syntax: WeightingSyntax::default(),
			image_count: 1,
			loop_generation: 1,
			adapters: Default::default(),
			textual_inversion: Vec::new(),
			freeu: false,
			styles: Vec::new(),
			image: None,
			mask: None,
			preprocessor: PreprocessorChoice::default(),
			adapter_preprocessor: true,
			preprocess_resolution: 512,
			image_resolution: 512,
			low_threshold: 100,
			high_threshold: 200,
			value_threshold: 0.1,
			distance_threshold: 0.1,
			strength: 0.35,
			controlnet_conditioning_scale: 1.0,
			control_guidance_start: 0.0,
			control_guidance_end: 1.0,
			adapter_conditioning_scale: 1.0,
			adapter_conditioning_factor: 1.0,
			detail_correction_a: None,
			detail_correction_b: None,
			upscale: None,
			upscale_before_detail_correction: false,
			upscale_after_detail_correction: true,
			generator_on_cpu: false,
			save_images: true,
			image_storage_location: "./images".to_string(),
			retain_embedder: true,
			retain_detail_variant: false,
			retain_hires_variant: false
		}
	}
}

impl GenerationOptions {
	/// Sets the positive and (optionally) negative prompt.
	pub fn with_prompts(mut self, prompt: impl Into<String>, negative_prompt: Option<&str>) -> Self {
		self.prompt = prompt.into();
		self.negative_prompt = negative_prompt.unwrap_or_default().to_string();
		self
	}

	/// Sets the output size. Applies to text-to-image only; reference-image tasks derive their
	/// geometry from `image_resolution`.
	pub fn with_size(mut self, width: u32, height: u32) -> Self {
		self.width = width;
		self.height = height;
		self
	}

	/// Sets the denoising step count.
	pub fn with_steps(mut self, steps: u32) -> Self {
		self.steps = steps;
		self
	}

	/// Sets the classifier-free guidance scale.
	pub fn with_guidance_scale(mut self, scale: f32) -> Self {
		self.guidance_scale = scale;
		self
	}

	/// Sets the base seed. A negative seed requests an independent random seed per image.
	pub fn with_seed(mut self, seed: i64) -> Self {
		self.seed = seed;
		self
	}

	/// Sets the sampler by name.
	pub fn with_sampler(mut self, sampler: impl Into<String>) -> Self {
		self.sampler = sampler.into();
		self
	}

	/// Sets the number of images per batch.
	pub fn with_image_count(mut self, count: u32) -> Self {
		self.image_count = count;
		self
	}

	/// Sets the reference image.
	pub fn with_image(mut self, image: RgbImage) -> Self {
		self.image = Some(image);
		self
	}

	/// Sets the inpainting mask.
	pub fn with_mask(mut self, mask: RgbImage) -> Self {
		self.mask = Some(mask);
		self
	}

	/// Assigns an adapter to slot `slot` (0-based).
	pub fn with_adapter(mut self, slot: usize, source: impl Into<String>, scale: f32) -> Self {
		self.adapters[slot] = Some((source.into(), scale));
		self
	}

	/// Adds a `(token, source)` textual-inversion pair.
	pub fn with_textual_inversion(mut self, token: impl Into<String>, source: impl Into<String>) -> Self {
		self.textual_inversion.push((token.into(), source.into()));
		self
	}

	/// Selects the styles to apply, in order.
	pub fn with_styles(mut self, styles: impl IntoIterator<Item = impl Into<String>>) -> Self {
		self.styles = styles.into_iter().map(Into::into).collect();
		self
	}

	/// Enables FreeU scaling.
	pub fn with_freeu(mut self) -> Self {
		self.freeu = true;
		self
	}

	/// Enables the first detail-correction pass with `overrides`.
	pub fn with_detail_correction(mut self, overrides: DetailCorrectionOverrides) -> Self {
		self.detail_correction_a = Some(overrides);
		self
	}

	/// Enables the upscale pass.
	pub fn with_upscale(mut self, upscale: UpscaleOptions) -> Self {
		self.upscale = Some(upscale);
		self
	}

	/// Sets whether outputs are persisted, and where.
	pub fn with_storage(mut self, save: bool, location: impl Into<String>) -> Self {
		self.save_images = save;
		self.image_storage_location = location.into();
		self
	}
}

/// The result of a generation request.
#[derive(Debug, Default)]
pub struct GenerationOutput {
	/// The output images. For control-guided tasks the first image of each batch is the prepared
	/// control preview, not a generation result.
	pub images: Vec<RgbImage>,
	/// Where each image was persisted, or a placeholder when persistence was disabled or failed.
	pub saved: Vec<String>,
	/// The seed each image was generated from. Preview frames record seed 0.
	pub seeds: Vec<u64>
}
