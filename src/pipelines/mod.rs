//! Pipeline families, tasks, and the task-specialized variant wiring.

mod components;
mod variants;

pub use self::components::{BaseScheduleConfig, ComponentHandle, ComponentSet};
pub use self::variants::{PipelineVariant, VariantKind};

/// The model family of a loaded base pipeline.
///
/// The two families differ in text-encoder count (and therefore embedding shape), default
/// geometry, and which control modules exist for them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineFamily {
	/// Stable Diffusion 1.5: a single CLIP text encoder.
	StableDiffusion,
	/// Stable Diffusion XL: dual text encoders with pooled embeddings.
	StableDiffusionXl
}

impl PipelineFamily {
	/// Whether this family uses a dual-text-encoder conditioning stack.
	pub fn dual_encoder(&self) -> bool {
		matches!(self, PipelineFamily::StableDiffusionXl)
	}
}

/// The generation task a pipeline is assembled for.
///
/// Tasks other than [`Task::Txt2Img`] require a reference image. Control-guided tasks prepend
/// the prepared control image to the output batch as a preview frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum Task {
	/// Plain text-to-image generation.
	Txt2Img,
	/// Image-to-image generation, guided by a reference image and `strength`.
	Img2Img,
	/// Inpainting within a mask. Control-net guided for the SD 1.5 family.
	Inpaint,
	/// Pose-guided generation.
	Openpose,
	/// Edge-guided generation (Canny).
	Canny,
	/// Line-structure-guided generation (MLSD).
	Mlsd,
	/// Scribble-guided generation.
	Scribble,
	/// Soft-edge-guided generation.
	Softedge,
	/// Segmentation-map-guided generation.
	Segmentation,
	/// Depth-guided generation.
	Depth,
	/// Surface-normal-guided generation.
	NormalBae,
	/// Line-art-guided generation.
	Lineart,
	/// Anime line-art-guided generation.
	LineartAnime,
	/// Content-shuffle-guided generation.
	Shuffle,
	/// Instruction-pix2pix generation; the reference image passes through unprocessed.
	Ip2p,
	/// Pattern (QR-code monster) guided generation.
	Pattern,
	/// SDXL tile-realistic control generation.
	SdxlTileRealistic,
	/// SDXL edge-guided adapter generation.
	SdxlCannyT2i,
	/// SDXL sketch-guided adapter generation.
	SdxlSketchT2i,
	/// SDXL line-art-guided adapter generation.
	SdxlLineartT2i,
	/// SDXL depth-guided adapter generation.
	SdxlDepthMidasT2i,
	/// SDXL pose-guided adapter generation.
	SdxlOpenposeT2i
}

impl Task {
	/// The canonical task name, as used in logs and persisted metadata.
	pub fn name(&self) -> &'static str {
		match self {
			Task::Txt2Img => "txt2img",
			Task::Img2Img => "img2img",
			Task::Inpaint => "inpaint",
			Task::Openpose => "openpose",
			Task::Canny => "canny",
			Task::Mlsd => "mlsd",
			Task::Scribble => "scribble",
			Task::Softedge => "softedge",
			Task::Segmentation => "segmentation",
			Task::Depth => "depth",
			Task::NormalBae => "normalbae",
			Task::Lineart => "lineart",
			Task::LineartAnime => "lineart_anime",
			Task::Shuffle => "shuffle",
			Task::Ip2p => "ip2p",
			Task::Pattern => "pattern",
			Task::SdxlTileRealistic => "sdxl_tile_realistic",
			Task::SdxlCannyT2i => "sdxl_canny_t2i",
			Task::SdxlSketchT2i => "sdxl_sketch_t2i",
			Task::SdxlLineartT2i => "sdxl_lineart_t2i",
			Task::SdxlDepthMidasT2i => "sdxl_depth-midas_t2i",
			Task::SdxlOpenposeT2i => "sdxl_openpose_t2i"
		}
	}

	/// Whether this task requires a reference image before any model is invoked.
	pub fn requires_image(&self) -> bool {
		!matches!(self, Task::Txt2Img)
	}

	/// Whether the output batch carries a leading control preview frame that is not a true
	/// generation result.
	pub fn has_control_preview(&self) -> bool {
		!matches!(self, Task::Txt2Img | Task::Img2Img | Task::Inpaint)
	}

	/// The pipeline flavor this task assembles for `family`.
	pub fn variant_kind(&self, family: PipelineFamily) -> VariantKind {
		match (self, family) {
			(Task::Txt2Img, _) => VariantKind::Plain,
			(Task::Img2Img, _) => VariantKind::Img2Img,
			(Task::Inpaint, PipelineFamily::StableDiffusion) => VariantKind::ControlInpaint,
			(Task::Inpaint, PipelineFamily::StableDiffusionXl) => VariantKind::Inpaint,
			(Task::SdxlCannyT2i | Task::SdxlSketchT2i | Task::SdxlLineartT2i | Task::SdxlDepthMidasT2i | Task::SdxlOpenposeT2i, _) => VariantKind::Adapter,
			(_, _) => VariantKind::ControlGuided
		}
	}

	/// The published control-module repository for this task, if its variant carries one.
	/// Control tasks with per-family modules resolve to the module of `family`.
	pub fn control_model_id(&self, family: PipelineFamily) -> Option<&'static str> {
		let xl = matches!(family, PipelineFamily::StableDiffusionXl);
		match self {
			Task::Txt2Img | Task::Img2Img => None,
			Task::Inpaint => {
				if xl {
					None
				} else {
					Some("lllyasviel/control_v11p_sd15_inpaint")
				}
			}
			Task::Openpose => Some(if xl { "OzzyGT/controlnet-openpose-sdxl-1.0" } else { "lllyasviel/control_v11p_sd15_openpose" }),
			Task::Canny => Some(if xl { "diffusers/controlnet-canny-sdxl-1.0-mid" } else { "lllyasviel/control_v11p_sd15_canny" }),
			Task::Depth => Some(if xl { "diffusers/controlnet-depth-sdxl-1.0-mid" } else { "lllyasviel/control_v11f1p_sd15_depth" }),
			Task::Pattern => Some(if xl { "r3gm/control_v1p_sdxl_qrcode_monster_fp16" } else { "monster-labs/control_v1p_sd15_qrcode_monster" }),
			Task::Mlsd => Some("lllyasviel/control_v11p_sd15_mlsd"),
			Task::Scribble => Some("lllyasviel/control_v11p_sd15_scribble"),
			Task::Softedge => Some("lllyasviel/control_v11p_sd15_softedge"),
			Task::Segmentation => Some("lllyasviel/control_v11p_sd15_seg"),
			Task::NormalBae => Some("lllyasviel/control_v11p_sd15_normalbae"),
			Task::Lineart => Some("lllyasviel/control_v11p_sd15_lineart"),
			Task::LineartAnime => Some("lllyasviel/control_v11p_sd15s2_lineart_anime"),
			Task::Shuffle => Some("lllyasviel/control_v11e_sd15_shuffle"),
			Task::Ip2p => Some("lllyasviel/control_v11e_sd15_ip2p"),
			Task::SdxlTileRealistic => Some("OzzyGT/SDXL_Controlnet_Tile_Realistic"),
			Task::SdxlCannyT2i => Some("TencentARC/t2i-adapter-canny-sdxl-1.0"),
			Task::SdxlSketchT2i => Some("TencentARC/t2i-adapter-sketch-sdxl-1.0"),
			Task::SdxlLineartT2i => Some("TencentARC/t2i-adapter-lineart-sdxl-1.0"),
			Task::SdxlDepthMidasT2i => Some("TencentARC/t2i-adapter-depth-midas-sdxl-1.0"),
			Task::SdxlOpenposeT2i => Some("TencentARC/t2i-adapter-openpose-sdxl-1.0")
		}
	}
}

#[cfg(test)]
mod tests {
	use super::{PipelineFamily, Task, VariantKind};

	#[test]
	fn inpaint_is_control_guided_only_for_sd15() {
		assert_eq!(Task::Inpaint.variant_kind(PipelineFamily::StableDiffusion), VariantKind::ControlInpaint);
		assert_eq!(Task::Inpaint.variant_kind(PipelineFamily::StableDiffusionXl), VariantKind::Inpaint);
		assert!(Task::Inpaint.control_model_id(PipelineFamily::StableDiffusionXl).is_none());
	}

	#[test]
	fn adapter_tasks_dispatch_to_adapter_variant() {
		for task in [Task::SdxlCannyT2i, Task::SdxlSketchT2i, Task::SdxlLineartT2i, Task::SdxlDepthMidasT2i, Task::SdxlOpenposeT2i] {
			assert_eq!(task.variant_kind(PipelineFamily::StableDiffusionXl), VariantKind::Adapter);
			assert!(task.control_model_id(PipelineFamily::StableDiffusionXl).is_some());
		}
	}

	#[test]
	fn preview_frame_only_for_guided_tasks() {
		assert!(!Task::Txt2Img.has_control_preview());
		assert!(!Task::Inpaint.has_control_preview());
		assert!(Task::Canny.has_control_preview());
	}
}
