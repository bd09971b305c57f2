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

//! Control input preparation: preprocessor dispatch, detector lifecycle, and inpaint
//! composites.

use image::{imageops, RgbImage};
use ndarray::Array4;
use tracing::debug;

use crate::backend::{Detector, DetectorProvider};
use crate::error::AtelierError;
use crate::pipelines::{PipelineFamily, Task};
use crate::util::geometry::fit_resolution;

/// A single-purpose preprocessor detection model, selected by task (and preprocessor choice)
/// and lazily loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum DetectorKind {
	/// Canny edge detection.
	Canny,
	/// Pose detection.
	Openpose,
	/// Line-segment (MLSD) detection.
	Mlsd,
	/// Holistic edge detection.
	Hed,
	/// PidiNet soft-edge detection.
	PidiNet,
	/// Midas depth estimation.
	Midas,
	/// Transformer (DPT) depth estimation.
	Dpt,
	/// Surface-normal estimation.
	NormalBae,
	/// Line-art extraction.
	Lineart,
	/// Anime line-art extraction.
	LineartAnime,
	/// Content shuffle.
	ContentShuffle,
	/// Semantic segmentation.
	UperNet
}

/// The caller's preprocessor selection, where a task supports more than one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[non_exhaustive]
pub enum PreprocessorChoice {
	/// No feature extraction; the reference image passes through (resized only).
	#[default]
	None,
	/// Midas depth estimation (default for depth tasks).
	Midas,
	/// DPT depth estimation.
	Dpt,
	/// Holistic edge detection.
	Hed,
	/// Holistic edge detection, safe mode.
	HedSafe,
	/// PidiNet soft edges.
	PidiNet,
	/// PidiNet soft edges, safe mode.
	PidiNetSafe,
	/// Line-art extraction.
	Lineart,
	/// Coarse line-art extraction.
	LineartCoarse,
	/// Anime line-art extraction. On SD 1.5 line-art tasks this also swaps in the anime
	/// line-art control module.
	LineartAnime,
	/// Semantic segmentation.
	UperNet,
	/// Content shuffle.
	ContentShuffle
}

/// Parameters forwarded to the loaded detector.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectorParams {
	/// Resolution the detector runs at.
	pub detect_resolution: u32,
	/// Resolution of the produced conditioning image.
	pub image_resolution: u32,
	/// Canny low threshold.
	pub low_threshold: u32,
	/// Canny high threshold.
	pub high_threshold: u32,
	/// MLSD value threshold.
	pub value_threshold: f32,
	/// MLSD distance threshold.
	pub distance_threshold: f32,
	/// HED scribble mode.
	pub scribble: bool,
	/// HED/PidiNet safe mode.
	pub safe: bool,
	/// Coarse line-art extraction.
	pub coarse: bool,
	/// Openpose hand and face detection.
	pub hand_and_face: bool
}

impl Default for DetectorParams {
	fn default() -> Self {
		Self {
			detect_resolution: 512,
			image_resolution: 512,
			low_threshold: 100,
			high_threshold: 200,
			value_threshold: 0.1,
			distance_threshold: 0.1,
			scribble: false,
			safe: false,
			coarse: false,
			hand_and_face: false
		}
	}
}

/// Control-related request parameters, extracted from the full generation options.
#[derive(Debug, Clone, Copy)]
pub struct ControlParams {
	/// The caller's preprocessor selection.
	pub preprocessor: PreprocessorChoice,
	/// Resolution detectors run at.
	pub preprocess_resolution: u32,
	/// Resolution of the produced conditioning image.
	pub image_resolution: u32,
	/// Whether adapter-guided tasks run their canonical preprocessor (`false` passes the
	/// reference image through unprocessed).
	pub adapter_preprocessor: bool,
	/// Canny low threshold.
	pub low_threshold: u32,
	/// Canny high threshold.
	pub high_threshold: u32,
	/// MLSD value threshold.
	pub value_threshold: f32,
	/// MLSD distance threshold.
	pub distance_threshold: f32
}

/// The conditioning input produced for the guided-generation pipeline.
#[derive(Debug)]
pub enum ControlInput {
	/// A single conditioning image.
	Image(RgbImage),
	/// The inpainting triple.
	Inpaint {
		/// The resized base image.
		image: RgbImage,
		/// The resized mask.
		mask: RgbImage,
		/// The composite conditioning tensor (`[1, 3, H, W]`, masked pixels marked `-1`).
		composite: Array4<f32>
	}
}

impl ControlInput {
	/// The conditioning (or base) image of this input.
	pub fn image(&self) -> &RgbImage {
		match self {
			ControlInput::Image(image) => image,
			ControlInput::Inpaint { image, .. } => image
		}
	}
}

/// The canonical preprocessor of an adapter-guided task, if `task` is one.
pub fn adapter_preprocessor(task: Task) -> Option<DetectorKind> {
	match task {
		Task::SdxlCannyT2i => Some(DetectorKind::Canny),
		Task::SdxlOpenposeT2i => Some(DetectorKind::Openpose),
		Task::SdxlSketchT2i => Some(DetectorKind::PidiNet),
		Task::SdxlDepthMidasT2i => Some(DetectorKind::Midas),
		Task::SdxlLineartT2i => Some(DetectorKind::Lineart),
		_ => None
	}
}

/// For SD 1.5 line-art tasks the control module follows the preprocessor: selecting the anime
/// preprocessor requires the anime line-art control module. Returns the task whose control
/// module should be live, when a swap may be needed.
pub fn lineart_control_task(family: PipelineFamily, task: Task, preprocessor: PreprocessorChoice) -> Option<Task> {
	if family != PipelineFamily::StableDiffusion || !matches!(task, Task::Lineart | Task::LineartAnime) {
		return None;
	}
	if preprocessor == PreprocessorChoice::LineartAnime {
		Some(Task::LineartAnime)
	} else {
		Some(Task::Lineart)
	}
}

/// Prepares conditioning images for guided tasks, delegating feature extraction to an external
/// registry of detectors selected by task. At most one detector is loaded at a time; requesting
/// a different one releases the previous detector's memory.
pub struct ControlInputBuilder {
	provider: Box<dyn DetectorProvider>,
	loaded: Option<(DetectorKind, Box<dyn Detector>)>
}

impl ControlInputBuilder {
	/// Creates a builder over `provider`.
	pub fn new(provider: Box<dyn DetectorProvider>) -> Self {
		Self { provider, loaded: None }
	}

	/// The currently loaded detector kind, if any.
	pub fn loaded_kind(&self) -> Option<DetectorKind> {
		self.loaded.as_ref().map(|(kind, _)| *kind)
	}

	/// Releases the loaded detector.
	pub fn release(&mut self) {
		self.loaded = None;
	}

	/// Prepares the conditioning image for a non-inpaint guided task.
	pub fn prepare(&mut self, task: Task, image: &RgbImage, params: &ControlParams) -> anyhow::Result<ControlInput> {
		let detector_params = DetectorParams {
			detect_resolution: params.preprocess_resolution,
			image_resolution: params.image_resolution,
			low_threshold: params.low_threshold,
			high_threshold: params.high_threshold,
			value_threshold: params.value_threshold,
			distance_threshold: params.distance_threshold,
			scribble: matches!(params.preprocessor, PreprocessorChoice::HedSafe),
			safe: matches!(params.preprocessor, PreprocessorChoice::HedSafe | PreprocessorChoice::PidiNetSafe),
			coarse: params.preprocessor == PreprocessorChoice::LineartCoarse,
			hand_and_face: matches!(task, Task::Openpose | Task::SdxlOpenposeT2i)
		};

		let kind = match self.plan(task, params) {
			Some(kind) => kind,
			None => return Ok(ControlInput::Image(resize_image(image, params.image_resolution)))
		};

		let detector = self.detector(kind)?;
		let control_image = detector.detect(image, &detector_params)?;
		Ok(ControlInput::Image(control_image))
	}

	/// Prepares the inpainting triple: resized base image, resized mask, and the composite
	/// conditioning tensor with masked pixels marked.
	///
	/// The mask must share the image's aspect ratio; a mask that resizes to different dimensions
	/// is a fatal request error.
	pub fn prepare_inpaint(&mut self, image: &RgbImage, mask: &RgbImage, image_resolution: u32) -> anyhow::Result<ControlInput> {
		let init_image = resize_image(image, image_resolution);
		let control_mask = resize_image(mask, image_resolution);
		if control_mask.dimensions() != init_image.dimensions() {
			return Err(AtelierError::MaskSizeMismatch { image: init_image.dimensions(), mask: control_mask.dimensions() }.into());
		}
		let composite = make_inpaint_composite(&init_image, &control_mask);
		Ok(ControlInput::Inpaint { image: init_image, mask: control_mask, composite })
	}

	/// The detector a task/preprocessor combination delegates to, or `None` for pass-through.
	fn plan(&self, task: Task, params: &ControlParams) -> Option<DetectorKind> {
		if params.preprocessor == PreprocessorChoice::None && adapter_preprocessor(task).is_none() {
			return match task {
				Task::Canny => Some(DetectorKind::Canny),
				Task::Openpose => Some(DetectorKind::Openpose),
				Task::Mlsd => Some(DetectorKind::Mlsd),
				Task::Scribble | Task::Softedge => Some(DetectorKind::Hed),
				Task::Segmentation => Some(DetectorKind::UperNet),
				Task::Depth => Some(DetectorKind::Midas),
				Task::NormalBae => Some(DetectorKind::NormalBae),
				Task::Lineart => Some(DetectorKind::Lineart),
				Task::LineartAnime => Some(DetectorKind::LineartAnime),
				Task::Shuffle => Some(DetectorKind::ContentShuffle),
				// ip2p, img2img, pattern and tile tasks pass the reference image through.
				_ => None
			};
		}

		if let Some(canonical) = adapter_preprocessor(task) {
			return if params.adapter_preprocessor { Some(canonical) } else { None };
		}

		match params.preprocessor {
			PreprocessorChoice::None => None,
			PreprocessorChoice::Midas => Some(DetectorKind::Midas),
			PreprocessorChoice::Dpt => Some(DetectorKind::Dpt),
			PreprocessorChoice::Hed | PreprocessorChoice::HedSafe => Some(DetectorKind::Hed),
			PreprocessorChoice::PidiNet | PreprocessorChoice::PidiNetSafe => Some(DetectorKind::PidiNet),
			PreprocessorChoice::Lineart | PreprocessorChoice::LineartCoarse => Some(DetectorKind::Lineart),
			PreprocessorChoice::LineartAnime => Some(DetectorKind::LineartAnime),
			PreprocessorChoice::UperNet => Some(DetectorKind::UperNet),
			PreprocessorChoice::ContentShuffle => Some(DetectorKind::ContentShuffle)
		}
	}

	/// Returns the loaded detector for `kind`, swapping out (and releasing) any previously
	/// loaded detector of a different kind.
	fn detector(&mut self, kind: DetectorKind) -> anyhow::Result<&mut Box<dyn Detector>> {
		let reload = match &self.loaded {
			Some((loaded_kind, _)) => *loaded_kind != kind,
			None => true
		};
		if reload {
			if let Some((old, _)) = self.loaded.take() {
				debug!("releasing {old:?} detector for {kind:?}");
			}
			self.loaded = Some((kind, self.provider.load(kind)?));
		}
		Ok(&mut self.loaded.as_mut().unwrap().1)
	}
}

/// Resizes `image` so its longest side is `resolution`, with both sides normalized to a
/// multiple of 64.
pub fn resize_image(image: &RgbImage, resolution: u32) -> RgbImage {
	let (h, w) = fit_resolution(image.height(), image.width(), resolution);
	let filter = if resolution > image.width().max(image.height()) {
		imageops::FilterType::Lanczos3
	} else {
		imageops::FilterType::Triangle
	};
	imageops::resize(image, w, h, filter)
}

/// Builds the inpaint conditioning tensor: the base image normalized to `[0, 1]` in `NCHW`
/// layout, with pixels under the mask set to the `-1` masked marker.
fn make_inpaint_composite(image: &RgbImage, mask: &RgbImage) -> Array4<f32> {
	let (width, height) = (image.width() as usize, image.height() as usize);
	let mut composite = Array4::zeros((1, 3, height, width));
	for (x, y, pixel) in image.enumerate_pixels() {
		let masked = mask.get_pixel(x, y)[0] > 127;
		for channel in 0..3 {
			composite[[0, channel, y as usize, x as usize]] = if masked { -1.0 } else { f32::from(pixel[channel]) / 255.0 };
		}
	}
	composite
}
