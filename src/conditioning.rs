//! Prompt conditioning: textual-inversion registration, weighting delegation, and embedding
//! shape compatibility.

use ndarray::{s, Array2, Array3};
use tracing::debug;

use crate::backend::{DiffusionBackend, PromptEmbedder, WeightingSyntax};
use crate::pipelines::ComponentSet;
use crate::session::caches::EmbeddingLedger;
use crate::util::prompting::separate_inversion_vectors;

/// Model-ready prompt conditioning, shaped per encoder family.
#[derive(Debug, Clone)]
pub enum Conditioning {
	/// Single-encoder conditioning: independent positive and negative embeddings, padded to the
	/// same token length.
	Single {
		/// The positive prompt embedding, `[1, tokens, dim]`.
		prompt: Array3<f32>,
		/// The negative prompt embedding, `[1, tokens, dim]`.
		negative: Array3<f32>
	},
	/// Dual-encoder conditioning covering `[prompt, negative_prompt]` along the batch axis.
	Dual {
		/// The conditioning tensor, `[2, tokens, dim]`.
		conditioning: Array3<f32>,
		/// The pooled tensor, `[2, dim]`.
		pooled: Array2<f32>
	}
}

/// Inputs for one conditioning build.
#[derive(Debug, Clone, Copy)]
pub struct EmbedRequest<'a> {
	/// The positive prompt.
	pub prompt: &'a str,
	/// The negative prompt.
	pub negative_prompt: &'a str,
	/// `(token, source)` textual-inversion pairs to have registered before tokenization.
	pub textual_inversion: &'a [(String, String)],
	/// Whether to read the penultimate encoder layer.
	pub clip_skip: bool,
	/// The weighting syntax flavor.
	pub syntax: WeightingSyntax
}

/// Builds prompt embeddings, caching the heavy tokenizer/encoder-wrapping helper across calls.
///
/// The cached embedder is retained by default; callers that want the memory back after a
/// request call [`ConditioningBuilder::release`].
#[derive(Default)]
pub struct ConditioningBuilder {
	embedder: Option<Box<dyn PromptEmbedder>>,
	embedder_clip_skip: bool
}

impl ConditioningBuilder {
	/// Builds conditioning for `request`, applying pending textual-inversion registration first.
	pub fn embed(
		&mut self,
		backend: &mut dyn DiffusionBackend,
		components: &ComponentSet,
		ledger: &mut EmbeddingLedger,
		dual_encoder: bool,
		request: &EmbedRequest<'_>
	) -> anyhow::Result<Conditioning> {
		ledger.register(backend, components, request.textual_inversion);

		// Multi-vector inversion tokens expand into whitespace-separated vectors which the
		// weighting engine would otherwise treat as independent concepts.
		let (prompt, negative_prompt) = if ledger.any_loaded() {
			(separate_inversion_vectors(request.prompt), separate_inversion_vectors(request.negative_prompt))
		} else {
			(request.prompt.to_string(), request.negative_prompt.to_string())
		};

		if self.embedder.is_some() && self.embedder_clip_skip != request.clip_skip {
			debug!("clip-skip changed, rebuilding embedder");
			self.embedder = None;
		}
		if self.embedder.is_none() {
			self.embedder = Some(backend.embedder(components, request.clip_skip)?);
			self.embedder_clip_skip = request.clip_skip;
		}
		let embedder = self.embedder.as_mut().unwrap();

		if dual_encoder {
			let (conditioning, pooled) = embedder.weight_and_embed_dual([&prompt, &negative_prompt], request.syntax)?;
			Ok(Conditioning::Dual { conditioning, pooled })
		} else {
			let prompt_emb = embedder.weight_and_embed(&prompt, request.syntax)?;
			let negative_emb = embedder.weight_and_embed(&negative_prompt, request.syntax)?;
			let (prompt_emb, negative_emb) = pad_to_same_length(prompt_emb, negative_emb);
			Ok(Conditioning::Single { prompt: prompt_emb, negative: negative_emb })
		}
	}

	/// Whether the heavy embedder helper is currently cached.
	pub fn is_cached(&self) -> bool {
		self.embedder.is_some()
	}

	/// Drops the cached embedder helper so its memory can be reclaimed.
	pub fn release(&mut self) {
		self.embedder = None;
	}
}

/// Pads the shorter of two `[1, tokens, dim]` embeddings with zeros along the token axis so the
/// pair is shape-compatible for classifier-free guidance.
pub(crate) fn pad_to_same_length(a: Array3<f32>, b: Array3<f32>) -> (Array3<f32>, Array3<f32>) {
	let len = a.shape()[1].max(b.shape()[1]);
	(pad_tokens(a, len), pad_tokens(b, len))
}

fn pad_tokens(emb: Array3<f32>, len: usize) -> Array3<f32> {
	let (batch, tokens, dim) = (emb.shape()[0], emb.shape()[1], emb.shape()[2]);
	if tokens == len {
		return emb;
	}
	let mut padded = Array3::zeros((batch, len, dim));
	padded.slice_mut(s![.., ..tokens, ..]).assign(&emb);
	padded
}

#[cfg(test)]
mod tests {
	use ndarray::Array3;

	use super::pad_to_same_length;

	#[test]
	fn uneven_embeddings_padded_to_longer() {
		let a = Array3::from_elem((1, 77, 8), 1.0f32);
		let b = Array3::from_elem((1, 154, 8), 2.0f32);
		let (a, b) = pad_to_same_length(a, b);
		assert_eq!(a.shape(), b.shape());
		assert_eq!(a[[0, 76, 0]], 1.0);
		assert_eq!(a[[0, 77, 0]], 0.0);
		assert_eq!(b[[0, 153, 0]], 2.0);
	}

	#[test]
	fn equal_embeddings_untouched() {
		let a = Array3::from_elem((1, 77, 8), 1.0f32);
		let b = Array3::from_elem((1, 77, 8), 2.0f32);
		let (a2, b2) = pad_to_same_length(a.clone(), b.clone());
		assert_eq!(a, a2);
		assert_eq!(b, b2);
	}
}
