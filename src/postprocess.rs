//! Post-denoise passes: detail correction and super-resolution upscaling.
//!
//! The passes themselves run in external collaborators ([`crate::backend::DetailCorrector`] and
//! [`crate::backend::Upscaler`]); this module owns the job descriptions handed to them and the
//! auxiliary pipeline variants they denoise over.

use crate::backend::NoiseGenerator;
use crate::conditioning::Conditioning;
use crate::generation::{DetailCorrectionPass, UpscaleOptions};
use crate::pipelines::{ComponentSet, PipelineVariant, VariantKind};
use crate::schedulers::SchedulerConfig;

/// One detail-correction pass, fully resolved: the pass configuration plus the conditioning,
/// schedule, and generators its inpainting denoise runs with.
#[derive(Debug)]
pub struct DetailCorrectionJob {
	/// The resolved pass configuration.
	pub pass: DetailCorrectionPass,
	/// Conditioning for the correction denoise. Falls back to the request conditioning when the
	/// pass declares no prompts of its own.
	pub conditioning: Conditioning,
	/// Step count of the correction denoise.
	pub steps: u32,
	/// Guidance scale of the correction denoise.
	pub guidance_scale: f32,
	/// The schedule the correction denoise runs with.
	pub schedule: SchedulerConfig,
	/// The request generators, reused so correction noise stays tied to the request seeds.
	pub generators: Vec<NoiseGenerator>
}

/// One upscale pass, fully resolved.
#[derive(Debug)]
pub struct UpscaleJob {
	/// The upscale options as requested.
	pub options: UpscaleOptions,
	/// Conditioning for the post-upscale denoise; `None` when the denoise is skipped.
	pub conditioning: Option<Conditioning>,
	/// Guidance scale of the post-upscale denoise.
	pub guidance_scale: f32,
	/// The schedule the post-upscale denoise runs with.
	pub schedule: SchedulerConfig,
	/// The request generators, reused so the denoise stays tied to the request seeds.
	pub generators: Vec<NoiseGenerator>
}

/// Picks the effective prompt for a post-processing pass: the pass's own prompt when it has
/// one, the request prompt otherwise. The second value reports whether the fallback applied.
pub fn prompt_fallback<'a>(pass_prompt: &'a str, request_prompt: &'a str) -> (&'a str, bool) {
	if pass_prompt.trim().is_empty() { (request_prompt, true) } else { (pass_prompt, false) }
}

/// Assembles the auxiliary variant a post-processing pass denoises over: a plain inpainting
/// re-wire for detail correction, an image-to-image re-wire for the post-upscale denoise. No
/// weights are copied and no control module is attached.
pub(crate) fn auxiliary_variant(kind: VariantKind, components: &ComponentSet) -> PipelineVariant {
	debug_assert!(matches!(kind, VariantKind::Inpaint | VariantKind::Img2Img));
	PipelineVariant::assemble(kind, components, None)
}

#[cfg(test)]
mod tests {
	use super::prompt_fallback;

	#[test]
	fn empty_pass_prompt_falls_back() {
		assert_eq!(prompt_fallback("", "a red fox"), ("a red fox", true));
		assert_eq!(prompt_fallback("   ", "a red fox"), ("a red fox", true));
		assert_eq!(prompt_fallback("detailed face", "a red fox"), ("detailed face", false));
	}
}
