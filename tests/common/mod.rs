//! A recording backend and stub collaborators for driving sessions without any real model.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use byteorder::{LittleEndian, WriteBytesExt};
use diffusion_atelier::backend::{
	DenoiseInputs, DenoiseOutput, DetailCorrector, Detector, DetectorProvider, DiffusionBackend, FreeUConfig, NoiseGenerator, PromptEmbedder, Upscaler,
	WeightingSyntax
};
use diffusion_atelier::config::ModelSource;
use diffusion_atelier::control::{DetectorKind, DetectorParams};
use diffusion_atelier::persist::PngStore;
use diffusion_atelier::postprocess::{DetailCorrectionJob, UpscaleJob};
use diffusion_atelier::{
	BaseScheduleConfig, ComponentHandle, ComponentSet, DiffusionDevice, DiffusionPrecision, DiffusionSession, GenerationOptions, PipelineFamily,
	PipelineVariant, SessionExternals, SessionOptions
};
use image::{Rgb, RgbImage};
use ndarray::{Array2, Array3};

pub const SD15_KEY: &str = "model.diffusion_model.input_blocks.0.0.weight";
pub const SDXL_KEY: &str = "conditioner.embedders.1.model.ln_final.bias";

/// Everything the recording backend and stub collaborators observed.
#[derive(Debug, Default)]
pub struct Counters {
	pub component_loads: Vec<String>,
	pub vae_loads: Vec<String>,
	pub control_loads: Vec<String>,
	pub adapter_merges: Vec<(String, f32)>,
	pub embedding_registrations: Vec<(String, String)>,
	pub freeu_sets: Vec<bool>,
	pub move_calls: usize,
	pub reclaim_calls: usize,
	pub generator_bindings: Vec<(u64, DiffusionDevice)>,
	pub denoise_calls: usize,
	pub denoise_samplers: Vec<String>,
	pub denoise_seeds: Vec<Vec<u64>>,
	pub denoise_dimensions: Vec<(u32, u32)>,
	pub detector_loads: Vec<DetectorKind>,
	pub correct_calls: usize,
	pub upscale_calls: usize
}

type Shared<T> = Arc<Mutex<T>>;

/// A backend that records every call and synthesizes tiny outputs. Denoise failures can be
/// scripted by pushing errors onto `failures`; each queued error fails exactly one call.
pub struct RecordingBackend {
	pub counters: Shared<Counters>,
	pub failures: Shared<VecDeque<anyhow::Error>>
}

impl DiffusionBackend for RecordingBackend {
	fn load_components(&mut self, source: &ModelSource, family: PipelineFamily, _precision: DiffusionPrecision) -> anyhow::Result<ComponentSet> {
		self.counters.lock().unwrap().component_loads.push(source.id());
		let dual = family.dual_encoder();
		Ok(ComponentSet {
			text_encoder: ComponentHandle::new("text_encoder"),
			text_encoder_2: dual.then(|| ComponentHandle::new("text_encoder_2")),
			tokenizer: ComponentHandle::new("tokenizer"),
			tokenizer_2: dual.then(|| ComponentHandle::new("tokenizer_2")),
			vae: ComponentHandle::new("vae"),
			unet: ComponentHandle::new("unet"),
			default_schedule: BaseScheduleConfig::default()
		})
	}

	fn load_vae(&mut self, vae_id: &str, _precision: DiffusionPrecision) -> anyhow::Result<ComponentHandle> {
		self.counters.lock().unwrap().vae_loads.push(vae_id.to_string());
		Ok(ComponentHandle::new(format!("vae:{vae_id}")))
	}

	fn cast_component(&mut self, _component: &ComponentHandle, _precision: DiffusionPrecision) -> anyhow::Result<()> {
		Ok(())
	}

	fn load_control_module(&mut self, model_id: &str, _precision: DiffusionPrecision) -> anyhow::Result<ComponentHandle> {
		self.counters.lock().unwrap().control_loads.push(model_id.to_string());
		Ok(ComponentHandle::new(format!("control:{model_id}")))
	}

	fn move_to_device(&mut self, _variant: &PipelineVariant, _device: DiffusionDevice) -> anyhow::Result<()> {
		self.counters.lock().unwrap().move_calls += 1;
		Ok(())
	}

	fn merge_adapter(&mut self, _variant: &PipelineVariant, adapter_id: &str, scale: f32) -> anyhow::Result<()> {
		self.counters.lock().unwrap().adapter_merges.push((adapter_id.to_string(), scale));
		Ok(())
	}

	fn register_embedding(&mut self, _components: &ComponentSet, token: &str, source: &str) -> anyhow::Result<()> {
		self.counters.lock().unwrap().embedding_registrations.push((token.to_string(), source.to_string()));
		Ok(())
	}

	fn set_freeu(&mut self, _variant: &PipelineVariant, config: Option<FreeUConfig>) -> anyhow::Result<()> {
		self.counters.lock().unwrap().freeu_sets.push(config.is_some());
		Ok(())
	}

	fn embedder(&mut self, _components: &ComponentSet, _clip_skip: bool) -> anyhow::Result<Box<dyn PromptEmbedder>> {
		Ok(Box::new(StubEmbedder))
	}

	fn bind_generator(&mut self, seed: u64, device: DiffusionDevice) -> anyhow::Result<NoiseGenerator> {
		self.counters.lock().unwrap().generator_bindings.push((seed, device));
		Ok(NoiseGenerator::on(seed, device))
	}

	fn denoise(&mut self, variant: &PipelineVariant, inputs: &DenoiseInputs<'_>) -> anyhow::Result<DenoiseOutput> {
		{
			let mut counters = self.counters.lock().unwrap();
			counters.denoise_calls += 1;
			counters.denoise_samplers.push(variant.schedule.sampler_name.clone());
			counters.denoise_seeds.push(inputs.generators.iter().map(|g| g.seed).collect());
			counters.denoise_dimensions.push((inputs.width, inputs.height));
		}
		if let Some(error) = self.failures.lock().unwrap().pop_front() {
			return Err(error);
		}
		Ok(DenoiseOutput {
			images: inputs.generators.iter().map(|_| RgbImage::from_pixel(8, 8, Rgb([127, 127, 127]))).collect(),
			latents: None
		})
	}

	fn reclaim_memory(&mut self) {
		self.counters.lock().unwrap().reclaim_calls += 1;
	}
}

struct StubEmbedder;

impl PromptEmbedder for StubEmbedder {
	fn weight_and_embed(&mut self, _text: &str, _syntax: WeightingSyntax) -> anyhow::Result<Array3<f32>> {
		Ok(Array3::from_elem((1, 77, 8), 0.5))
	}

	fn weight_and_embed_dual(&mut self, _texts: [&str; 2], _syntax: WeightingSyntax) -> anyhow::Result<(Array3<f32>, Array2<f32>)> {
		Ok((Array3::from_elem((2, 77, 8), 0.5), Array2::from_elem((2, 8), 0.5)))
	}
}

pub struct StubDetectors(pub Shared<Counters>);

impl DetectorProvider for StubDetectors {
	fn load(&mut self, kind: DetectorKind) -> anyhow::Result<Box<dyn Detector>> {
		self.0.lock().unwrap().detector_loads.push(kind);
		Ok(Box::new(StubDetector))
	}
}

struct StubDetector;

impl Detector for StubDetector {
	fn detect(&mut self, image: &RgbImage, _params: &DetectorParams) -> anyhow::Result<RgbImage> {
		Ok(image.clone())
	}
}

pub struct StubCorrector(pub Shared<Counters>);

impl DetailCorrector for StubCorrector {
	fn correct(&mut self, images: &[RgbImage], _job: &DetailCorrectionJob, _pipeline: &PipelineVariant) -> anyhow::Result<Vec<RgbImage>> {
		self.0.lock().unwrap().correct_calls += 1;
		Ok(images.to_vec())
	}
}

pub struct StubUpscaler(pub Shared<Counters>);

impl Upscaler for StubUpscaler {
	fn upscale(&mut self, images: &[RgbImage], _job: &UpscaleJob, _pipeline: Option<&PipelineVariant>) -> anyhow::Result<Vec<RgbImage>> {
		self.0.lock().unwrap().upscale_calls += 1;
		Ok(images.to_vec())
	}
}

/// A session wired to the recording backend, plus handles to everything it records.
pub struct Harness {
	pub session: DiffusionSession,
	pub counters: Shared<Counters>,
	pub failures: Shared<VecDeque<anyhow::Error>>,
	pub dir: tempfile::TempDir
}

impl Harness {
	pub fn new() -> Self {
		let _ = tracing_subscriber::fmt().with_test_writer().try_init();
		let counters: Shared<Counters> = Arc::default();
		let failures: Shared<VecDeque<anyhow::Error>> = Arc::default();
		let backend = Box::new(RecordingBackend { counters: Arc::clone(&counters), failures: Arc::clone(&failures) });
		let externals = SessionExternals {
			detectors: Box::new(StubDetectors(Arc::clone(&counters))),
			corrector: Box::new(StubCorrector(Arc::clone(&counters))),
			upscaler: Box::new(StubUpscaler(Arc::clone(&counters))),
			store: Box::new(PngStore)
		};
		let session = DiffusionSession::new(backend, externals, SessionOptions::default());
		Harness {
			session,
			counters,
			failures,
			dir: tempfile::tempdir().unwrap()
		}
	}

	/// Writes a minimal single-file checkpoint whose header classifies as SD 1.5.
	pub fn sd15_checkpoint(&self, name: &str) -> PathBuf {
		self.checkpoint(name, &[SD15_KEY])
	}

	/// Writes a minimal single-file checkpoint whose header classifies as SDXL.
	pub fn sdxl_checkpoint(&self, name: &str) -> PathBuf {
		self.checkpoint(name, &[SDXL_KEY, SD15_KEY])
	}

	fn checkpoint(&self, name: &str, keys: &[&str]) -> PathBuf {
		use std::io::Write;
		let mut header = serde_json::Map::new();
		for key in keys {
			header.insert((*key).to_string(), serde_json::json!({ "dtype": "F16", "shape": [1], "data_offsets": [0, 2] }));
		}
		let header = serde_json::to_vec(&header).unwrap();
		let path = self.dir.path().join(name);
		let mut file = std::fs::File::create(&path).unwrap();
		file.write_u64::<LittleEndian>(header.len() as u64).unwrap();
		file.write_all(&header).unwrap();
		path
	}
}

/// A one-step, non-persisting request; the smallest thing that runs the whole stage sequence.
pub fn quick_options() -> GenerationOptions {
	GenerationOptions::default().with_prompts("a red fox", None).with_steps(1).with_storage(false, "./images")
}

pub fn reference_image() -> RgbImage {
	RgbImage::from_pixel(64, 64, Rgb([200, 180, 160]))
}
