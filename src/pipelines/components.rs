// Copyright 2022-2023 pyke.io
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// 	http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::any::Any;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// An opaque, reference-counted handle to a loaded sub-component (a text encoder, tokenizer,
/// VAE, denoising network, or control module) owned by the backend.
///
/// Handles are cheap to clone; cloning shares the underlying component, it never duplicates
/// weights. Identity is pointer identity.
#[derive(Clone)]
pub struct ComponentHandle(Arc<dyn Any + Send + Sync>);

impl ComponentHandle {
	/// Wraps a backend-owned component.
	pub fn new<T: Any + Send + Sync>(component: T) -> Self {
		Self(Arc::new(component))
	}

	/// Borrows the wrapped component, if it is of type `T`.
	pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
		self.0.downcast_ref()
	}

	/// Whether two handles refer to the same loaded component.
	pub fn ptr_eq(&self, other: &ComponentHandle) -> bool {
		Arc::ptr_eq(&self.0, &other.0)
	}
}

impl std::fmt::Debug for ComponentHandle {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "ComponentHandle({:p})", Arc::as_ptr(&self.0))
	}
}

/// The noise-schedule configuration a base model ships with. Recorded at load time as the
/// session baseline; sampler selection reconstructs schedules from this config plus a parameter
/// overlay.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct BaseScheduleConfig {
	/// Number of diffusion steps used to train the model.
	pub num_train_timesteps: u32,
	/// The starting β value of inference.
	pub beta_start: f32,
	/// The final β value.
	pub beta_end: f32,
	/// How β values are spread over the schedule (`linear`, `scaled-linear`).
	pub beta_schedule: String,
	/// What the denoising network predicts (`epsilon`, `v-prediction`).
	pub prediction_type: String
}

impl Default for BaseScheduleConfig {
	fn default() -> Self {
		Self {
			num_train_timesteps: 1000,
			beta_start: 0.00085,
			beta_end: 0.012,
			beta_schedule: "scaled-linear".to_string(),
			prediction_type: "epsilon".to_string()
		}
	}
}

/// The canonical sub-components of one loaded base model.
///
/// Exactly one `ComponentSet` exists per base model in memory at a time; every task-specialized
/// [`PipelineVariant`](crate::pipelines::PipelineVariant) borrows these handles rather than
/// reloading weights. The second encoder/tokenizer pair is only present for dual-encoder
/// families.
#[derive(Debug, Clone)]
pub struct ComponentSet {
	/// The primary text encoder.
	pub text_encoder: ComponentHandle,
	/// The second text encoder (dual-encoder families only).
	pub text_encoder_2: Option<ComponentHandle>,
	/// The primary tokenizer.
	pub tokenizer: ComponentHandle,
	/// The second tokenizer (dual-encoder families only).
	pub tokenizer_2: Option<ComponentHandle>,
	/// The variational autoencoder (image encoder/decoder).
	pub vae: ComponentHandle,
	/// The denoising network.
	pub unet: ComponentHandle,
	/// The noise-schedule configuration the model shipped with.
	pub default_schedule: BaseScheduleConfig
}

impl ComponentSet {
	/// Replaces the color decoder with `vae`, sharing all other components.
	pub fn with_vae(mut self, vae: ComponentHandle) -> Self {
		self.vae = vae;
		self
	}
}
