// Copyright 2022-2023 pyke.io
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The pipeline-state machine: deciding how much of the loaded state a model request can reuse.

use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::backend::{DetailCorrector, DetectorProvider, DiffusionBackend, ImageStore, Upscaler};
use crate::conditioning::ConditioningBuilder;
use crate::config::ModelSource;
use crate::control::ControlInputBuilder;
use crate::error::AtelierError;
use crate::pipelines::{ComponentSet, PipelineFamily, PipelineVariant, Task};
use crate::styles::StyleLibrary;
use crate::{DiffusionDevice, DiffusionPrecision};

pub mod caches;

use self::caches::{AdapterSlots, EmbeddingLedger, TaskPipelineMemory};

/// The full identity of a loaded pipeline. Two equal identities are interchangeable without
/// touching the backend.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineIdentity {
	/// The base model identifier the pipeline was loaded from.
	pub model_id: String,
	/// The task the active variant is assembled for.
	pub task: Task,
	/// The replacement color decoder, if one is attached.
	pub vae_model: Option<String>,
	/// The effective weight precision.
	pub precision: DiffusionPrecision,
	/// The device the pipeline lives on.
	pub device: DiffusionDevice
}

/// Session-wide configuration, fixed at construction.
#[derive(Debug, Default, Clone)]
pub struct SessionOptions {
	/// The device pipelines are placed on.
	pub device: DiffusionDevice,
	/// The requested weight precision. CPU sessions are promoted to full precision regardless.
	pub precision: DiffusionPrecision,
	/// An optional style table to load at construction; see [`StyleLibrary`].
	pub styles_file: Option<PathBuf>
}

impl SessionOptions {
	/// Places pipelines on `device`.
	pub fn with_device(mut self, device: DiffusionDevice) -> Self {
		self.device = device;
		self
	}

	/// Requests weight precision `precision`.
	pub fn with_precision(mut self, precision: DiffusionPrecision) -> Self {
		self.precision = precision;
		self
	}

	/// Loads the style table at `path` when the session is constructed.
	pub fn with_styles_file(mut self, path: impl Into<PathBuf>) -> Self {
		self.styles_file = Some(path.into());
		self
	}
}

/// The external collaborators a session drives: preprocessor detectors, the detail-correction
/// pass, the upscaler, and image persistence.
pub struct SessionExternals {
	/// Loads preprocessor detection models.
	pub detectors: Box<dyn DetectorProvider>,
	/// Runs the region-detect-and-inpaint detail-correction pass.
	pub corrector: Box<dyn DetailCorrector>,
	/// Runs the super-resolution upscale pass.
	pub upscaler: Box<dyn Upscaler>,
	/// Persists output images with embedded metadata.
	pub store: Box<dyn ImageStore>
}

/// A stateful diffusion session: one loaded base pipeline at a time, plus the caches that let
/// consecutive requests skip redundant loading.
///
/// [`DiffusionSession::load_model`] is idempotent and diff-aware: it compares the requested
/// [`PipelineIdentity`] against the loaded one and performs the cheapest sufficient transition —
/// nothing, a task-only re-wire over the shared components, or a full teardown and rebuild.
pub struct DiffusionSession {
	pub(crate) backend: Box<dyn DiffusionBackend>,
	pub(crate) corrector: Box<dyn DetailCorrector>,
	pub(crate) upscaler: Box<dyn Upscaler>,
	pub(crate) store: Box<dyn ImageStore>,
	pub(crate) device: DiffusionDevice,
	pub(crate) precision: DiffusionPrecision,

	identity: Option<PipelineIdentity>,
	pub(crate) family: Option<PipelineFamily>,
	pub(crate) components: Option<ComponentSet>,
	pub(crate) active: Option<PipelineVariant>,
	// Which task's control module is actually mounted; diverges from the identity task only
	// after a preprocessor-driven hot swap.
	pub(crate) live_control_task: Option<Task>,

	task_memory: TaskPipelineMemory,
	pub(crate) adapters: AdapterSlots,
	pub(crate) embeddings: EmbeddingLedger,
	pub(crate) conditioning: ConditioningBuilder,
	pub(crate) control_input: ControlInputBuilder,
	pub(crate) styles: StyleLibrary,
	pub(crate) freeu_enabled: bool,

	// Auxiliary variants kept across requests when the caller opts into retention.
	pub(crate) retained_detail: Option<PipelineVariant>,
	pub(crate) retained_hires: Option<PipelineVariant>
}

impl DiffusionSession {
	/// Creates a session with no model loaded.
	pub fn new(backend: Box<dyn DiffusionBackend>, externals: SessionExternals, options: SessionOptions) -> Self {
		let SessionExternals { detectors, corrector, upscaler, store } = externals;
		let precision = options.precision.for_device(options.device);
		let mut styles = StyleLibrary::default();
		if let Some(path) = &options.styles_file {
			styles.load_file(path);
		}
		Self {
			backend,
			corrector,
			upscaler,
			store,
			device: options.device,
			precision,
			identity: None,
			family: None,
			components: None,
			active: None,
			live_control_task: None,
			task_memory: TaskPipelineMemory::default(),
			adapters: AdapterSlots::default(),
			embeddings: EmbeddingLedger::default(),
			conditioning: ConditioningBuilder::default(),
			control_input: ControlInputBuilder::new(detectors),
			styles,
			freeu_enabled: false,
			retained_detail: None,
			retained_hires: None
		}
	}

	/// Loads (or re-wires, or reuses) the pipeline for `model` and `task`.
	///
	/// `vae` optionally attaches a replacement color decoder. The transition performed depends on
	/// how much of the requested identity matches the loaded one:
	/// - a fully matching identity returns immediately;
	/// - a matching base model with a different task re-wires the shared components into a new
	///   variant, remembering the outgoing one for cheap switch-back;
	/// - anything else tears the loaded pipeline down completely before rebuilding.
	pub fn load_model(&mut self, model: impl AsRef<Path>, task: Task, vae: Option<&str>) -> Result<(), AtelierError> {
		let source = ModelSource::resolve(model.as_ref());
		let requested = PipelineIdentity {
			model_id: source.id(),
			task,
			vae_model: vae.map(str::to_string),
			precision: self.precision,
			device: self.device
		};

		match &self.identity {
			Some(current) if *current == requested => {
				debug!("model {} already loaded for {}", requested.model_id, task.name());
				Ok(())
			}
			Some(current) if current.model_id == requested.model_id && current.vae_model == requested.vae_model => {
				self.switch_task(requested)
			}
			_ => self.rebuild(&source, requested)
		}
	}

	/// Re-wires the shared components for a new task. Merged adapters and registered embeddings
	/// live in the shared weights and survive this transition.
	fn switch_task(&mut self, requested: PipelineIdentity) -> Result<(), AtelierError> {
		let task = requested.task;
		let family = self.family.ok_or(AtelierError::NoModelLoaded)?;
		info!("switching task to {}", task.name());

		if let (Some(current), Some(outgoing)) = (&self.identity, self.active.take()) {
			self.task_memory.store(current.task, outgoing);
		}

		let variant = match self.task_memory.take(task) {
			Some(remembered) => {
				debug!("reusing remembered variant for {}", task.name());
				remembered
			}
			None => self.assemble_variant(task, family)?
		};
		self.backend.move_to_device(&variant, self.device)?;
		self.active = Some(variant);
		self.live_control_task = Some(task);
		self.identity = Some(requested);
		self.backend.reclaim_memory();
		Ok(())
	}

	/// Tears everything down and builds the requested pipeline from scratch.
	fn rebuild(&mut self, source: &ModelSource, requested: PipelineIdentity) -> Result<(), AtelierError> {
		self.release_pipeline();

		let family = source.family()?;
		info!("loading {} for {} ({family:?})", requested.model_id, requested.task.name());
		let mut components = self.backend.load_components(source, family, requested.precision)?;

		if let Some(vae_id) = &requested.vae_model {
			let vae = self.backend.load_vae(vae_id, requested.precision)?;
			if let Err(e) = self.backend.cast_component(&vae, requested.precision) {
				warn!("replacement VAE `{vae_id}` kept at its stored precision: {e}");
			}
			components = components.with_vae(vae);
		}

		self.family = Some(family);
		self.components = Some(components);

		let variant = self.assemble_variant(requested.task, family)?;
		self.backend.move_to_device(&variant, self.device)?;
		self.active = Some(variant);
		self.live_control_task = Some(requested.task);
		self.identity = Some(requested);
		self.backend.reclaim_memory();
		Ok(())
	}

	/// Assembles a task variant over the loaded components, loading the task's control module
	/// when its flavor carries one.
	fn assemble_variant(&mut self, task: Task, family: PipelineFamily) -> Result<PipelineVariant, AtelierError> {
		let components = self.components.as_ref().ok_or(AtelierError::NoModelLoaded)?;
		let kind = task.variant_kind(family);
		let control = match task.control_model_id(family) {
			Some(model_id) if kind.has_control_module() => {
				debug!("loading control module `{model_id}`");
				Some(self.backend.load_control_module(model_id, self.precision)?)
			}
			_ => None
		};
		Ok(PipelineVariant::assemble(kind, components, control))
	}

	/// Hot-swaps the active variant's control module to the one published for `task`, keeping
	/// all shared components. Used when a preprocessor choice calls for a sibling control module.
	pub(crate) fn swap_control_module(&mut self, task: Task) -> Result<(), AtelierError> {
		let family = self.family.ok_or(AtelierError::NoModelLoaded)?;
		let Some(model_id) = task.control_model_id(family) else {
			return Ok(());
		};
		debug!("hot-swapping control module to `{model_id}`");
		let control = self.backend.load_control_module(model_id, self.precision)?;
		let variant = self.active.as_mut().ok_or(AtelierError::NoModelLoaded)?;
		variant.replace_control(control);
		self.live_control_task = Some(task);
		self.backend.reclaim_memory();
		Ok(())
	}

	/// Drops every piece of loaded pipeline state and asks the backend to reclaim memory.
	fn release_pipeline(&mut self) {
		if self.identity.is_some() {
			debug!("releasing loaded pipeline");
		}
		self.identity = None;
		self.family = None;
		self.active = None;
		self.live_control_task = None;
		self.components = None;
		self.task_memory.clear();
		self.adapters.clear();
		self.embeddings.clear();
		self.conditioning.release();
		self.control_input.release();
		self.retained_detail = None;
		self.retained_hires = None;
		self.freeu_enabled = false;
		self.backend.reclaim_memory();
	}

	/// The identity of the loaded pipeline, if one is loaded.
	pub fn identity(&self) -> Option<&PipelineIdentity> {
		self.identity.as_ref()
	}

	/// The family of the loaded pipeline, if one is loaded.
	pub fn family(&self) -> Option<PipelineFamily> {
		self.family
	}

	/// The shared components of the loaded pipeline, if one is loaded.
	pub fn components(&self) -> Option<&ComponentSet> {
		self.components.as_ref()
	}

	/// The active task variant, if one is assembled.
	pub fn active_variant(&self) -> Option<&PipelineVariant> {
		self.active.as_ref()
	}

	/// The names of the loaded styles.
	pub fn style_names(&self) -> impl Iterator<Item = &str> {
		self.styles.names()
	}

	/// Loads (or replaces) the style table from a JSON file.
	pub fn load_styles(&mut self, path: impl AsRef<Path>) {
		self.styles.load_file(path);
	}
}
