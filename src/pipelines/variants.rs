use crate::schedulers::SchedulerConfig;

use super::{ComponentHandle, ComponentSet};

/// The flavor of an assembled pipeline variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VariantKind {
	/// Plain text-to-image.
	Plain,
	/// Image-to-image over the same components.
	Img2Img,
	/// Mask-guided inpainting without a control module.
	Inpaint,
	/// Control-net-guided inpainting.
	ControlInpaint,
	/// Control-net-guided generation.
	ControlGuided,
	/// Adapter-guided generation.
	Adapter
}

impl VariantKind {
	/// Whether this flavor carries a task-specific control or adapter module.
	pub fn has_control_module(&self) -> bool {
		matches!(self, VariantKind::ControlInpaint | VariantKind::ControlGuided | VariantKind::Adapter)
	}
}

/// A fully assembled, task-specialized pipeline: borrowed sub-component handles plus an
/// optional task-specific control module and the active noise schedule.
///
/// Variants are constructed by re-wiring the shared [`ComponentSet`], never by copying weights,
/// so cloning one (for the task memory cache) is cheap.
#[derive(Debug, Clone)]
pub struct PipelineVariant {
	/// The flavor this variant was assembled for.
	pub kind: VariantKind,
	/// The shared sub-components borrowed from the base model.
	pub components: ComponentSet,
	/// The task-specific control or adapter module, present iff `kind.has_control_module()`.
	pub control: Option<ComponentHandle>,
	/// The noise schedule the next denoise call will run with.
	pub schedule: SchedulerConfig
}

impl PipelineVariant {
	/// Assembles a variant by borrowing `components` and attaching the optional control module.
	/// The schedule starts as the model's default and is replaced per request.
	pub fn assemble(kind: VariantKind, components: &ComponentSet, control: Option<ComponentHandle>) -> Self {
		debug_assert_eq!(kind.has_control_module(), control.is_some());
		Self {
			kind,
			components: components.clone(),
			control,
			schedule: SchedulerConfig::from_base(&components.default_schedule)
		}
	}

	/// Swaps the control module in place, keeping all shared components. Used for control-module
	/// hot swaps on an otherwise unchanged pipeline.
	pub fn replace_control(&mut self, control: ComponentHandle) {
		self.control = Some(control);
	}
}
