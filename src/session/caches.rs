//! Session-lifetime caches: remembered task variants, merged adapter slots, and registered
//! textual-inversion tokens.
//!
//! All three caches describe state that lives *inside* the loaded weights or the loaded
//! tokenizer stack, so every one of them must be cleared when the base model is torn down.

use std::collections::{HashMap, HashSet};

use tracing::{debug, error, warn};

use crate::backend::DiffusionBackend;
use crate::pipelines::{ComponentSet, PipelineFamily, PipelineVariant, Task};
use crate::schedulers::FlashFamily;

/// Previously assembled task variants, kept so switching back to a recent task re-wires nothing.
#[derive(Debug, Default)]
pub struct TaskPipelineMemory {
	variants: HashMap<Task, PipelineVariant>
}

impl TaskPipelineMemory {
	/// Takes the remembered variant for `task`, if one exists.
	pub fn take(&mut self, task: Task) -> Option<PipelineVariant> {
		self.variants.remove(&task)
	}

	/// Remembers `variant` as the assembly for `task`.
	pub fn store(&mut self, task: Task, variant: PipelineVariant) {
		self.variants.insert(task, variant);
	}

	/// Forgets every remembered variant. Required whenever the underlying components change.
	pub fn clear(&mut self) {
		self.variants.clear();
	}

	/// The number of remembered variants.
	pub fn len(&self) -> usize {
		self.variants.len()
	}

	/// Whether no variants are remembered.
	pub fn is_empty(&self) -> bool {
		self.variants.is_empty()
	}
}

/// The number of user-controlled low-rank adapter slots.
pub const ADAPTER_SLOTS: usize = 5;

/// A requested adapter assignment: `(adapter source, merge scale)`.
pub type AdapterRequest = Option<(String, f32)>;

/// Tracks which low-rank adapters are currently merged into the active weights.
///
/// Merging is destructive, so "unloading" re-applies the merge with inverted scale; the result
/// is numerically approximate rather than a bit-exact restore. Slot reconciliation is
/// best-effort: a slot whose adapter fails to merge is logged and left empty rather than
/// failing the whole request.
#[derive(Debug, Default)]
pub struct AdapterSlots {
	slots: [AdapterRequest; ADAPTER_SLOTS],
	flash: Option<FlashFamily>
}

impl AdapterSlots {
	/// Brings the merged adapter set in line with `requested`. Unchanged slots are skipped
	/// without touching the backend.
	pub fn reconcile(&mut self, backend: &mut dyn DiffusionBackend, variant: &PipelineVariant, requested: &[AdapterRequest; ADAPTER_SLOTS]) {
		for (slot, request) in self.slots.iter_mut().zip(requested) {
			if *slot == *request {
				continue;
			}
			if let Some((old_id, old_scale)) = slot.take() {
				debug!("unmerging adapter `{old_id}`");
				if let Err(e) = backend.merge_adapter(variant, &old_id, -old_scale) {
					warn!("could not unmerge adapter `{old_id}`: {e}");
				}
			}
			if let Some((id, scale)) = request {
				match backend.merge_adapter(variant, id, *scale) {
					Ok(()) => {
						debug!("merged adapter `{id}` at scale {scale}");
						*slot = Some((id.clone(), *scale));
					}
					Err(e) => error!("adapter `{id}` could not be merged and its slot was left empty: {e}")
				}
			}
		}
	}

	/// Brings the flash (consistency-distillation) adapter in line with the sampler selection.
	/// The flash adapter is keyed by its family; switching samplers within the same family keeps
	/// the merged weights.
	pub fn reconcile_flash(&mut self, backend: &mut dyn DiffusionBackend, variant: &PipelineVariant, family: PipelineFamily, requested: Option<FlashFamily>) {
		if self.flash == requested {
			return;
		}
		if let Some(old) = self.flash.take() {
			let old_id = old.adapter_id(family);
			debug!("unmerging flash adapter `{old_id}`");
			if let Err(e) = backend.merge_adapter(variant, old_id, -1.0) {
				warn!("could not unmerge flash adapter `{old_id}`: {e}");
			}
		}
		if let Some(flash) = requested {
			let id = flash.adapter_id(family);
			match backend.merge_adapter(variant, id, 1.0) {
				Ok(()) => {
					debug!("merged flash adapter `{id}`");
					self.flash = Some(flash);
				}
				Err(e) => error!("flash adapter `{id}` could not be merged: {e}")
			}
		}
	}

	/// The currently merged flash family, if any.
	pub fn flash(&self) -> Option<FlashFamily> {
		self.flash
	}

	/// The number of occupied user slots.
	pub fn occupied(&self) -> usize {
		self.slots.iter().filter(|slot| slot.is_some()).count()
	}

	/// Forgets all merged state. Only valid when the weights themselves are being discarded.
	pub fn clear(&mut self) {
		self.slots = Default::default();
		self.flash = None;
	}
}

/// Tracks which textual-inversion tokens have been registered with the loaded tokenizer stack.
///
/// Registration is additive for the lifetime of the loaded model; there is no per-token
/// unregistration, so the ledger only ever grows until the model is torn down.
#[derive(Debug, Default)]
pub struct EmbeddingLedger {
	loaded: HashSet<(String, String)>
}

impl EmbeddingLedger {
	/// Registers each `(token, source)` pair that is not already registered. Failures are logged
	/// and skipped; an embedding that cannot load never fails the request.
	pub fn register(&mut self, backend: &mut dyn DiffusionBackend, components: &ComponentSet, pairs: &[(String, String)]) {
		for pair in pairs {
			if self.loaded.contains(pair) {
				continue;
			}
			let (token, source) = pair;
			match backend.register_embedding(components, token, source) {
				Ok(()) => {
					debug!("registered embedding `{token}` from `{source}`");
					self.loaded.insert(pair.clone());
				}
				Err(e) => warn!("embedding `{token}` from `{source}` could not be registered: {e}")
			}
		}
	}

	/// Whether any embedding has been registered against the current model.
	pub fn any_loaded(&self) -> bool {
		!self.loaded.is_empty()
	}

	/// Forgets all registered tokens. Only valid when the tokenizer stack is being discarded.
	pub fn clear(&mut self) {
		self.loaded.clear();
	}
}
