//! Model source resolution: single-file checkpoint classification and repository manifest
//! reading.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt};
use serde::Deserialize;
use tracing::debug;

use crate::error::AtelierError;
use crate::pipelines::PipelineFamily;

/// Where a base model is loaded from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelSource {
	/// A local single-file checkpoint. The model family is auto-detected by inspecting the
	/// checkpoint's structure; see [`classify_checkpoint`].
	SingleFile(PathBuf),
	/// A pretrained repository directory containing a `model_index.json` manifest. The pipeline
	/// family is resolved from the manifest's `_class_name` field; see [`read_pipeline_family`].
	Repository(PathBuf)
}

impl ModelSource {
	/// Resolves a model identifier into a source: an existing file is a single-file checkpoint,
	/// anything else is treated as a repository directory.
	pub fn resolve(id: impl AsRef<Path>) -> Self {
		let path = id.as_ref();
		if path.is_file() {
			ModelSource::SingleFile(path.to_path_buf())
		} else {
			ModelSource::Repository(path.to_path_buf())
		}
	}

	/// The identifier this source was resolved from, for metadata and logging.
	pub fn id(&self) -> String {
		match self {
			ModelSource::SingleFile(path) | ModelSource::Repository(path) => path.display().to_string()
		}
	}

	/// Resolves the pipeline family of this source.
	pub fn family(&self) -> Result<PipelineFamily, AtelierError> {
		match self {
			ModelSource::SingleFile(path) => classify_checkpoint(path),
			ModelSource::Repository(path) => read_pipeline_family(path)
		}
	}
}

// The conditioner prefix only appears in checkpoints with a second (OpenCLIP) text encoder.
const SDXL_CONDITIONER_KEY: &str = "conditioner.embedders.1";
const SD_UNET_INPUT_KEY: &str = "model.diffusion_model.input_blocks.0.0.weight";

/// Classifies a single-file checkpoint by inspecting its structure.
///
/// For `.safetensors` files the 8-byte little-endian header length and JSON header are read; a
/// dual-encoder conditioner key classifies the checkpoint as SDXL, the SD UNet input-block key
/// as SD 1.5. Non-safetensors single files are assumed to be SD 1.5.
pub fn classify_checkpoint(path: impl AsRef<Path>) -> Result<PipelineFamily, AtelierError> {
	let path = path.as_ref();
	if path.extension().map_or(true, |ext| ext != "safetensors") {
		return Ok(PipelineFamily::StableDiffusion);
	}

	let mut file = File::open(path).map_err(anyhow::Error::from)?;
	let header_len = file.read_u64::<LittleEndian>().map_err(anyhow::Error::from)?;
	let mut header = vec![0u8; header_len as usize];
	file.read_exact(&mut header).map_err(anyhow::Error::from)?;
	let header: serde_json::Map<String, serde_json::Value> = serde_json::from_slice(&header).map_err(anyhow::Error::from)?;

	let family = if header.keys().any(|key| key.starts_with(SDXL_CONDITIONER_KEY)) {
		PipelineFamily::StableDiffusionXl
	} else if header.contains_key(SD_UNET_INPUT_KEY) {
		PipelineFamily::StableDiffusion
	} else {
		return Err(AtelierError::UnsupportedCheckpoint(path.display().to_string()));
	};
	debug!("inferred model type for {} is {family:?}", path.display());
	Ok(family)
}

#[derive(Debug, Deserialize)]
struct PipelineManifest {
	#[serde(rename = "_class_name")]
	class_name: String
}

/// Reads the pipeline family of a pretrained repository from its `model_index.json` manifest.
pub fn read_pipeline_family(repo: impl AsRef<Path>) -> Result<PipelineFamily, AtelierError> {
	let manifest_path = repo.as_ref().join("model_index.json");
	let manifest: PipelineManifest = serde_json::from_reader(File::open(manifest_path).map_err(anyhow::Error::from)?).map_err(anyhow::Error::from)?;
	match manifest.class_name.as_str() {
		"StableDiffusionPipeline" => Ok(PipelineFamily::StableDiffusion),
		"StableDiffusionXLPipeline" => Ok(PipelineFamily::StableDiffusionXl),
		other => Err(AtelierError::UnsupportedPipelineClass(other.to_string()))
	}
}
