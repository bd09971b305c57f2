//! Error types for session and generation failures.
//!
//! Fatal configuration errors get their own variants so callers can match on them; everything
//! the engine can recover from (adapter load failures, persistence failures, precision-cast
//! fallbacks) is logged and degraded instead of surfacing here.

use thiserror::Error;

/// Errors surfaced by [`DiffusionSession`](crate::DiffusionSession) operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AtelierError {
	/// A single-file checkpoint could not be classified as a supported model family.
	#[error("model type `{0}` not supported")]
	UnsupportedCheckpoint(String),
	/// The pipeline class named in a repository manifest is not a supported family.
	#[error("pipeline class `{0}` in model manifest not supported")]
	UnsupportedPipelineClass(String),
	/// The requested sampler name is not in the scheduler registry.
	#[error("sampler `{name}` not found; valid samplers: {valid}")]
	UnknownSampler {
		/// The sampler name that was requested.
		name: String,
		/// Comma-separated list of valid sampler names.
		valid: String
	},
	/// A task other than text-to-image was requested without a reference image.
	#[error("a reference image is required for the `{0}` task")]
	MissingReferenceImage(String),
	/// Inpainting was requested without an image mask.
	#[error("no image mask was found for inpainting")]
	MissingMask,
	/// The inpainting mask does not cover the reference image: after resizing, their dimensions
	/// differ (typically from mismatched aspect ratios).
	#[error("inpainting mask size {}x{} does not match the image size {}x{}", mask.0, mask.1, image.0, image.1)]
	MaskSizeMismatch {
		/// The resized reference image dimensions.
		image: (u32, u32),
		/// The resized mask dimensions.
		mask: (u32, u32)
	},
	/// The denoiser produced a degenerate (near-zero-size) intermediate tensor, typically from
	/// `steps` or `strength` set too low.
	#[error("steps / strength too low for the model to produce a satisfactory response")]
	DegenerateOutput,
	/// Denoising failed for a reason outside the known failure signatures. The original backend
	/// message is preserved.
	#[error("generation failed: {0}")]
	Generation(String),
	/// An attempt was made to generate without any model loaded into the session.
	#[error("no base model has been loaded into this session")]
	NoModelLoaded,
	/// A backend or collaborator failure during pipeline assembly.
	#[error(transparent)]
	Backend(#[from] anyhow::Error)
}

/// Known denoise failure signatures, detected structurally by downcast with a message-substring
/// fallback for foreign backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DenoiseSignature {
	/// The numerically-unstable-sampler signature. Retried once with the fallback sampler.
	#[error("Tensor with 2 elements cannot be converted to Scalar")]
	UnstableSampler,
	/// The degenerate-latent signature, translated into [`AtelierError::DegenerateOutput`].
	#[error("The size of tensor a (0) must match the size of tensor b (3) at non-singleton dimension")]
	DegenerateLatent
}

impl DenoiseSignature {
	/// Classifies a backend error against the known signatures.
	pub fn classify(error: &anyhow::Error) -> Option<DenoiseSignature> {
		if let Some(signature) = error.downcast_ref::<DenoiseSignature>() {
			return Some(*signature);
		}
		let message = error.to_string();
		if message.contains("Tensor with 2 elements cannot be converted to Scalar") {
			Some(DenoiseSignature::UnstableSampler)
		} else if message.contains("The size of tensor a (0) must match the size of tensor b (3)") {
			Some(DenoiseSignature::DegenerateLatent)
		} else {
			None
		}
	}
}
