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

//! The staged execution of one generation request: validation, adapter reconciliation,
//! conditioning, control preparation, denoising (with the automatic unstable-sampler retry),
//! post-processing, and persistence.

mod options;

pub use self::options::{DetailCorrectionOverrides, DetailCorrectionPass, GenerationOptions, GenerationOutput, UpscaleOptions};

use std::path::Path;

use image::RgbImage;
use rand::Rng;
use tracing::{debug, error, info, warn};

use crate::backend::{DenoiseInputs, DenoiseOutput, FreeUConfig, NoiseGenerator, WeightingSyntax};
use crate::conditioning::{Conditioning, EmbedRequest};
use crate::control::{lineart_control_task, ControlParams};
use crate::error::{AtelierError, DenoiseSignature};
use crate::persist::ImageMetadata;
use crate::pipelines::{Task, VariantKind};
use crate::postprocess::{auxiliary_variant, prompt_fallback, DetailCorrectionJob, UpscaleJob};
use crate::schedulers::{resolve_sampler, FlashFamily, SchedulerConfig, FALLBACK_SAMPLER};
use crate::session::DiffusionSession;
use crate::util::geometry::{align_up, correct_guidance_window};
use crate::util::prompting::cleanup_prompt;
use crate::DiffusionDevice;

/// The placeholder recorded in [`GenerationOutput::saved`] when an image was not persisted.
pub const NOT_SAVED: &str = "not saved in storage";

// Random seeds stay within the 32-bit signed range for interoperability with external tooling
// that records seeds.
const MAX_RANDOM_SEED: u64 = 2_147_483_647;

/// Request-wide parameters the post-processing passes fall back to when they declare none of
/// their own.
struct PassContext<'a> {
	prompt: &'a str,
	negative_prompt: &'a str,
	conditioning: &'a Conditioning,
	schedule: &'a SchedulerConfig,
	generators: &'a [NoiseGenerator],
	steps: u32,
	guidance_scale: f32,
	clip_skip: bool,
	syntax: WeightingSyntax,
	dual_encoder: bool
}

impl DiffusionSession {
	/// Runs one generation request against the loaded pipeline.
	///
	/// Fatal errors (no model loaded, a missing reference image or mask, an unknown sampler, a
	/// degenerate denoise) surface as [`AtelierError`]; everything else the engine can degrade
	/// on — adapter merge failures, post-processing failures, persistence failures — is logged
	/// and worked around instead.
	pub fn generate(&mut self, options: &GenerationOptions) -> Result<GenerationOutput, AtelierError> {
		let identity = self.identity().cloned().ok_or(AtelierError::NoModelLoaded)?;
		let task = identity.task;
		let family = self.family.ok_or(AtelierError::NoModelLoaded)?;

		if task.requires_image() && options.image.is_none() {
			return Err(AtelierError::MissingReferenceImage(task.name().to_string()));
		}
		if task == Task::Inpaint && options.mask.is_none() {
			return Err(AtelierError::MissingMask);
		}

		let (width, height) = (align_up(options.width, 8), align_up(options.height, 8));
		if (width, height) != (options.width, options.height) {
			warn!("output dimensions must be multiples of 8; adjusted to {width}x{height}");
		}
		let (control_guidance, window_reset) = correct_guidance_window(options.control_guidance_start, options.control_guidance_end);
		if window_reset {
			warn!("control guidance start must precede its end; the window was reset to (0.0, 1.0)");
		}

		// For SD 1.5 line-art tasks the mounted control module follows the preprocessor choice.
		if let Some(wanted) = lineart_control_task(family, task, options.preprocessor) {
			if self.live_control_task != Some(wanted) {
				self.swap_control_module(wanted)?;
			}
		}

		let (prompt, negative_prompt) = self.styles.apply(&options.styles, &options.prompt, &options.negative_prompt);
		let (prompt, negative_prompt) = (cleanup_prompt(prompt), cleanup_prompt(negative_prompt));

		{
			let variant = self.active.as_ref().ok_or(AtelierError::NoModelLoaded)?;
			self.adapters.reconcile(&mut *self.backend, variant, &options.adapters);
			self.adapters.reconcile_flash(&mut *self.backend, variant, family, FlashFamily::of_sampler(&options.sampler));
			if options.freeu != self.freeu_enabled {
				self.backend.set_freeu(variant, options.freeu.then(|| FreeUConfig::for_family(family)))?;
				self.freeu_enabled = options.freeu;
			}
		}
		self.backend.reclaim_memory();

		let schedule = {
			let components = self.components.as_ref().ok_or(AtelierError::NoModelLoaded)?;
			resolve_sampler(&options.sampler, &components.default_schedule)?
		};
		if let Some(variant) = self.active.as_mut() {
			variant.schedule = schedule.clone();
		}

		let dual_encoder = family.dual_encoder();
		let conditioning = {
			let request = EmbedRequest {
				prompt: &prompt,
				negative_prompt: &negative_prompt,
				textual_inversion: &options.textual_inversion,
				clip_skip: options.clip_skip,
				syntax: options.syntax
			};
			let components = self.components.as_ref().ok_or(AtelierError::NoModelLoaded)?;
			self.conditioning.embed(&mut *self.backend, components, &mut self.embeddings, dual_encoder, &request)?
		};
		self.backend.reclaim_memory();

		let control = match (&options.image, task) {
			(Some(image), Task::Inpaint) => {
				let mask = options.mask.as_ref().ok_or(AtelierError::MissingMask)?;
				Some(self.control_input.prepare_inpaint(image, mask, options.image_resolution)?)
			}
			(Some(image), _) => {
				let params = ControlParams {
					preprocessor: options.preprocessor,
					preprocess_resolution: options.preprocess_resolution,
					image_resolution: options.image_resolution,
					adapter_preprocessor: options.adapter_preprocessor,
					low_threshold: options.low_threshold,
					high_threshold: options.high_threshold,
					value_threshold: options.value_threshold,
					distance_threshold: options.distance_threshold
				};
				Some(self.control_input.prepare(task, image, &params)?)
			}
			(None, _) => None
		};
		self.control_input.release();
		self.backend.reclaim_memory();

		let count = options.image_count.max(1) as usize;
		let mut rng = rand::thread_rng();
		let generator_device = if options.generator_on_cpu { DiffusionDevice::Cpu } else { self.device };

		let mut output = GenerationOutput::default();
		for iteration in 0..options.loop_generation.max(1) {
			if options.loop_generation > 1 {
				debug!("generation loop {} of {}", iteration + 1, options.loop_generation);
			}

			// Each loop iteration draws a fresh seed batch; an explicit seed leads every batch,
			// the rest re-randomize.
			let mut seeds: Vec<u64> = if options.seed < 0 {
				(0..count).map(|_| rng.gen_range(0..MAX_RANDOM_SEED)).collect()
			} else {
				std::iter::once(options.seed as u64).chain((1..count).map(|_| rng.gen_range(0..MAX_RANDOM_SEED))).collect()
			};
			if task == Task::Img2Img && count > 1 {
				// image-to-image shares one noise stream across the whole batch
				seeds = vec![seeds[0]; count];
			}
			info!("Seeds: {seeds:?}");

			let generators: Vec<NoiseGenerator> = seeds
				.iter()
				.map(|&seed| match self.backend.bind_generator(seed, generator_device) {
					Ok(generator) => generator,
					Err(e) => {
						warn!("generator could not be bound to {generator_device:?}, falling back to the host: {e}");
						NoiseGenerator::host(seed)
					}
				})
				.collect();

			let ctx = PassContext {
				prompt: &prompt,
				negative_prompt: &negative_prompt,
				conditioning: &conditioning,
				schedule: &schedule,
				generators: &generators,
				steps: options.steps,
				guidance_scale: options.guidance_scale,
				clip_skip: options.clip_skip,
				syntax: options.syntax,
				dual_encoder
			};

			let inputs = DenoiseInputs {
				task,
				conditioning: &conditioning,
				width,
				height,
				steps: options.steps,
				guidance_scale: options.guidance_scale,
				generators: &generators,
				control: control.as_ref(),
				strength: options.strength,
				control_conditioning_scale: options.controlnet_conditioning_scale,
				control_guidance,
				adapter_conditioning_scale: options.adapter_conditioning_scale,
				adapter_conditioning_factor: options.adapter_conditioning_factor
			};
			let mut images = self.denoise_with_retry(&inputs, &options.sampler)?.images;
			self.backend.reclaim_memory();

			if let Some(upscale) = &options.upscale {
				if options.upscale_before_detail_correction {
					images = self.upscale_pass(images, upscale, &ctx, options.retain_hires_variant);
				}
			}
			if let Some(overrides) = &options.detail_correction_a {
				images = self.detail_pass(images, overrides, &ctx, options.retain_detail_variant);
			}
			if let Some(overrides) = &options.detail_correction_b {
				images = self.detail_pass(images, overrides, &ctx, options.retain_detail_variant);
			}
			if let Some(upscale) = &options.upscale {
				if options.upscale_after_detail_correction {
					images = self.upscale_pass(images, upscale, &ctx, options.retain_hires_variant);
				}
			}

			// Guided tasks lead their batch with the prepared control image, recorded as seed 0.
			let mut frames: Vec<(u64, RgbImage)> = Vec::with_capacity(images.len() + 1);
			if task.has_control_preview() {
				if let Some(input) = &control {
					frames.push((0, input.image().clone()));
				}
			}
			frames.extend(seeds.iter().copied().zip(images));

			for (seed, image) in frames {
				let metadata = ImageMetadata {
					prompt: prompt.clone(),
					negative_prompt: negative_prompt.clone(),
					model_id: identity.model_id.clone(),
					vae_model: identity.vae_model.clone(),
					steps: options.steps,
					guidance_scale: options.guidance_scale,
					sampler: options.sampler.clone(),
					seed,
					width,
					height,
					clip_skip: options.clip_skip
				};
				let saved = if options.save_images {
					match self.store.save(&image, Path::new(&options.image_storage_location), &metadata) {
						Ok(path) => path.display().to_string(),
						Err(e) => {
							error!("image could not be persisted: {e}");
							NOT_SAVED.to_string()
						}
					}
				} else {
					NOT_SAVED.to_string()
				};
				output.saved.push(saved);
				output.seeds.push(seed);
				output.images.push(image);
			}
		}

		if !options.retain_embedder {
			self.conditioning.release();
		}
		self.backend.reclaim_memory();
		Ok(output)
	}

	/// Runs one denoise call, retrying once with the deterministic fallback sampler when the
	/// failure matches the unstable-sampler signature. The retry reuses the same generators, so
	/// a successful retry stays tied to the request seeds.
	fn denoise_with_retry(&mut self, inputs: &DenoiseInputs<'_>, sampler: &str) -> Result<DenoiseOutput, AtelierError> {
		let variant = self.active.as_ref().ok_or(AtelierError::NoModelLoaded)?;
		let base = variant.schedule.base.clone();
		match self.backend.denoise(variant, inputs) {
			Ok(output) => Ok(output),
			Err(e) => match DenoiseSignature::classify(&e) {
				Some(DenoiseSignature::UnstableSampler) => {
					warn!("sampler `{sampler}` is unstable with this model; retrying once with {FALLBACK_SAMPLER}");
					if let Some(variant) = self.active.as_mut() {
						variant.schedule = resolve_sampler(FALLBACK_SAMPLER, &base)?;
					}
					let variant = self.active.as_ref().ok_or(AtelierError::NoModelLoaded)?;
					self.backend.denoise(variant, inputs).map_err(map_denoise_error)
				}
				Some(DenoiseSignature::DegenerateLatent) => Err(AtelierError::DegenerateOutput),
				None => Err(AtelierError::Generation(e.to_string()))
			}
		}
	}

	/// Runs one detail-correction pass. Failures keep the uncorrected images.
	fn detail_pass(&mut self, images: Vec<RgbImage>, overrides: &DetailCorrectionOverrides, ctx: &PassContext<'_>, retain: bool) -> Vec<RgbImage> {
		let pass = overrides.merge();
		let (pass_prompt, prompt_fell_back) = prompt_fallback(&pass.prompt, ctx.prompt);
		let (pass_negative, negative_fell_back) = prompt_fallback(&pass.negative_prompt, ctx.negative_prompt);
		let conditioning = if prompt_fell_back && negative_fell_back {
			ctx.conditioning.clone()
		} else {
			match self.pass_conditioning(pass_prompt, pass_negative, ctx) {
				Ok(conditioning) => conditioning,
				Err(e) => {
					error!("detail-correction conditioning failed, skipping the pass: {e}");
					return images;
				}
			}
		};
		let schedule = pass_schedule(pass.sampler.as_deref(), ctx);
		let Some(components) = self.components.as_ref() else {
			return images;
		};
		let variant = self.retained_detail.take().unwrap_or_else(|| auxiliary_variant(VariantKind::Inpaint, components));
		let job = DetailCorrectionJob {
			pass,
			conditioning,
			steps: ctx.steps,
			guidance_scale: ctx.guidance_scale,
			schedule,
			generators: ctx.generators.to_vec()
		};
		let corrected = match self.corrector.correct(&images, &job, &variant) {
			Ok(corrected) => corrected,
			Err(e) => {
				error!("detail correction failed, keeping the uncorrected images: {e}");
				images
			}
		};
		if retain {
			self.retained_detail = Some(variant);
		}
		self.backend.reclaim_memory();
		corrected
	}

	/// Runs the upscale pass. Failures keep the original images.
	fn upscale_pass(&mut self, images: Vec<RgbImage>, upscale: &UpscaleOptions, ctx: &PassContext<'_>, retain: bool) -> Vec<RgbImage> {
		let denoise_after = upscale.steps > 0;
		let conditioning = if denoise_after {
			let (pass_prompt, prompt_fell_back) = prompt_fallback(&upscale.prompt, ctx.prompt);
			let (pass_negative, negative_fell_back) = prompt_fallback(&upscale.negative_prompt, ctx.negative_prompt);
			if prompt_fell_back && negative_fell_back {
				Some(ctx.conditioning.clone())
			} else {
				match self.pass_conditioning(pass_prompt, pass_negative, ctx) {
					Ok(conditioning) => Some(conditioning),
					Err(e) => {
						error!("post-upscale conditioning failed, skipping the upscale pass: {e}");
						return images;
					}
				}
			}
		} else {
			None
		};
		let schedule = pass_schedule(upscale.sampler.as_deref(), ctx);
		let variant = if denoise_after {
			let Some(components) = self.components.as_ref() else {
				return images;
			};
			Some(self.retained_hires.take().unwrap_or_else(|| auxiliary_variant(VariantKind::Img2Img, components)))
		} else {
			None
		};
		let job = UpscaleJob {
			options: upscale.clone(),
			conditioning,
			guidance_scale: ctx.guidance_scale,
			schedule,
			generators: ctx.generators.to_vec()
		};
		let upscaled = match self.upscaler.upscale(&images, &job, variant.as_ref()) {
			Ok(upscaled) => upscaled,
			Err(e) => {
				error!("upscale failed, keeping the original images: {e}");
				images
			}
		};
		if retain {
			self.retained_hires = variant;
		}
		self.backend.reclaim_memory();
		upscaled
	}

	/// Builds conditioning for a post-processing pass's own prompts.
	fn pass_conditioning(&mut self, prompt: &str, negative_prompt: &str, ctx: &PassContext<'_>) -> anyhow::Result<Conditioning> {
		let components = self.components.as_ref().ok_or(AtelierError::NoModelLoaded)?;
		let request = EmbedRequest {
			prompt,
			negative_prompt,
			textual_inversion: &[],
			clip_skip: ctx.clip_skip,
			syntax: ctx.syntax
		};
		self.conditioning.embed(&mut *self.backend, components, &mut self.embeddings, ctx.dual_encoder, &request)
	}
}

/// The schedule a post-processing pass denoises with: its own sampler when it names a valid one,
/// the request schedule otherwise.
fn pass_schedule(sampler: Option<&str>, ctx: &PassContext<'_>) -> SchedulerConfig {
	match sampler {
		Some(name) => match resolve_sampler(name, &ctx.schedule.base) {
			Ok(schedule) => schedule,
			Err(e) => {
				warn!("{e}; using the request sampler for this pass");
				ctx.schedule.clone()
			}
		},
		None => ctx.schedule.clone()
	}
}

fn map_denoise_error(e: anyhow::Error) -> AtelierError {
	match DenoiseSignature::classify(&e) {
		Some(DenoiseSignature::DegenerateLatent) => AtelierError::DegenerateOutput,
		_ => AtelierError::Generation(e.to_string())
	}
}
