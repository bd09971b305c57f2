//! Image persistence with embedded generation metadata.

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use image::RgbImage;
use serde::{Deserialize, Serialize};

use crate::backend::ImageStore;

/// The metadata record embedded into every persisted image, in fixed field order.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ImageMetadata {
	/// The positive prompt, after style application.
	pub prompt: String,
	/// The negative prompt, after style application.
	pub negative_prompt: String,
	/// The base model identifier.
	pub model_id: String,
	/// The replacement VAE identifier, if one was attached.
	pub vae_model: Option<String>,
	/// Denoising step count.
	pub steps: u32,
	/// Classifier-free guidance scale.
	pub guidance_scale: f32,
	/// The sampler name.
	pub sampler: String,
	/// The seed this image was generated from.
	pub seed: u64,
	/// Output width in pixels.
	pub width: u32,
	/// Output height in pixels.
	pub height: u32,
	/// Whether clip-skip was enabled.
	pub clip_skip: bool
}

/// The keyword of the `tEXt` chunk the metadata record is stored under.
pub const METADATA_KEYWORD: &str = "parameters";

/// Persists images as PNG files with the metadata record embedded as a `tEXt` chunk.
#[derive(Debug, Default, Clone)]
pub struct PngStore;

impl ImageStore for PngStore {
	fn save(&mut self, image: &RgbImage, directory: &Path, metadata: &ImageMetadata) -> anyhow::Result<PathBuf> {
		std::fs::create_dir_all(directory)?;
		let stamp = SystemTime::now().duration_since(UNIX_EPOCH)?.as_nanos();
		let path = directory.join(format!("{stamp}_{}.png", metadata.seed));

		let file = BufWriter::new(File::create(&path)?);
		let mut encoder = png::Encoder::new(file, image.width(), image.height());
		encoder.set_color(png::ColorType::Rgb);
		encoder.set_depth(png::BitDepth::Eight);
		encoder.add_text_chunk(METADATA_KEYWORD.to_string(), serde_json::to_string(metadata)?)?;
		let mut writer = encoder.write_header()?;
		writer.write_image_data(image.as_raw())?;
		writer.finish()?;
		Ok(path)
	}
}

/// Reads back the metadata record embedded in a PNG written by [`PngStore`].
pub fn read_metadata(path: impl AsRef<Path>) -> anyhow::Result<ImageMetadata> {
	let decoder = png::Decoder::new(File::open(path.as_ref())?);
	let reader = decoder.read_info()?;
	let chunk = reader
		.info()
		.uncompressed_latin1_text
		.iter()
		.find(|chunk| chunk.keyword == METADATA_KEYWORD)
		.ok_or_else(|| anyhow::anyhow!("no `{METADATA_KEYWORD}` text chunk in {}", path.as_ref().display()))?;
	Ok(serde_json::from_str(&chunk.text)?)
}

#[cfg(test)]
mod tests {
	use image::{Rgb, RgbImage};

	use super::*;

	#[test]
	fn metadata_survives_round_trip() {
		let dir = tempfile::tempdir().unwrap();
		let metadata = ImageMetadata {
			prompt: "a red fox".to_string(),
			negative_prompt: "blurry".to_string(),
			model_id: "./models/dreamshaper.safetensors".to_string(),
			vae_model: None,
			steps: 30,
			guidance_scale: 7.5,
			sampler: "DPM++ 2M Karras".to_string(),
			seed: 42,
			width: 512,
			height: 512,
			clip_skip: true
		};
		let image = RgbImage::from_pixel(8, 8, Rgb([200, 100, 50]));
		let path = PngStore.save(&image, dir.path(), &metadata).unwrap();
		assert_eq!(read_metadata(path).unwrap(), metadata);
	}
}
