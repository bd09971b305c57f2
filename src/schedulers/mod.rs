//! The sampler registry.
//!
//! Samplers are resolved by name into a deterministic reconstruction of the model's base
//! noise-schedule configuration plus a parameter overlay. This is pure lookup — the solver
//! mathematics live in the backend; the engine only decides *which* schedule the next denoise
//! call runs with.

use serde::{Deserialize, Serialize};

use crate::error::AtelierError;
use crate::pipelines::{BaseScheduleConfig, PipelineFamily};

/// The solver a schedule is reconstructed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
#[non_exhaustive]
pub enum SolverKind {
	/// DPM-Solver++ multistep.
	DpmSolverMultistep,
	/// DPM-Solver++ singlestep.
	DpmSolverSinglestep,
	/// DPM-Solver SDE.
	DpmSolverSde,
	/// KDPM2 discrete.
	Kdpm2,
	/// KDPM2 ancestral discrete.
	Kdpm2Ancestral,
	/// Euler discrete.
	Euler,
	/// Euler ancestral discrete.
	EulerAncestral,
	/// Heun discrete.
	Heun,
	/// Linear multistep.
	Lms,
	/// DDIM. The deterministic fallback solver for unstable-sampler retries.
	Ddim,
	/// DDPM.
	Ddpm,
	/// DEIS multistep.
	Deis,
	/// UniPC multistep.
	UniPc,
	/// PNDM, the schedule most base models ship with.
	Pndm,
	/// Euler with EDM formulation.
	EulerEdm,
	/// DPM-Solver++ multistep with EDM formulation.
	DpmSolverMultistepEdm,
	/// Trajectory consistency distillation. Requires the TCD acceleration adapter.
	Tcd,
	/// Latent consistency. Requires the LCM acceleration adapter.
	Lcm
}

/// Parameter overlay applied on top of the base schedule when reconstructing a solver config.
#[derive(Debug, Default, Clone, Copy, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct SchedulerOverlay {
	/// Use Karras sigma spacing.
	pub karras_sigmas: bool,
	/// Use Lu lambdas (DPM-Solver++ only).
	pub lu_lambdas: bool,
	/// Take a final Euler step (DPM-Solver++ only).
	pub euler_at_final: bool,
	/// Use the SDE algorithm variant (DPM-Solver++ only).
	pub sde: bool,
	/// Override the solver order.
	pub solver_order: Option<u8>
}

/// A fully resolved noise-schedule configuration: the session's base schedule, the solver to
/// reconstruct, and the overlay parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
	/// The base schedule recorded when the model was loaded.
	pub base: BaseScheduleConfig,
	/// The solver to reconstruct.
	pub solver: SolverKind,
	/// The parameter overlay.
	pub overlay: SchedulerOverlay,
	/// The sampler name this config was resolved from.
	pub sampler_name: String
}

impl SchedulerConfig {
	/// The schedule a freshly loaded model runs with before a sampler is selected.
	pub fn from_base(base: &BaseScheduleConfig) -> Self {
		Self {
			base: base.clone(),
			solver: SolverKind::Pndm,
			overlay: SchedulerOverlay::default(),
			sampler_name: "PNDM".to_string()
		}
	}
}

/// The deterministic sampler used for the single automatic retry after an unstable-sampler
/// failure.
pub const FALLBACK_SAMPLER: &str = "DDIM";

/// Every sampler name the registry resolves.
pub const SAMPLER_NAMES: &[&str] = &[
	"DPM++ 2M",
	"DPM++ 2M Karras",
	"DPM++ 2M SDE",
	"DPM++ 2M SDE Karras",
	"DPM++ 2S",
	"DPM++ 2S Karras",
	"DPM++ 1S",
	"DPM++ 1S Karras",
	"DPM++ 3M",
	"DPM++ 3M Karras",
	"DPM++ SDE",
	"DPM++ SDE Karras",
	"KDPM2",
	"KDPM2 Karras",
	"KDPM2 a",
	"KDPM2 a Karras",
	"Euler",
	"Euler a",
	"Heun",
	"Heun Karras",
	"LMS",
	"LMS Karras",
	"DDIM",
	"DDPM",
	"DEIS",
	"UniPC",
	"UniPC Karras",
	"PNDM",
	"Euler EDM",
	"Euler EDM Karras",
	"DPM++ 2M EDM",
	"DPM++ 2M EDM Karras",
	"DPM++ 2M Lu",
	"DPM++ 2M Ef",
	"DPM++ 2M SDE Lu",
	"DPM++ 2M SDE Ef",
	"TCD",
	"LCM"
];

/// Resolves a sampler name against the session's base schedule. An unknown name is a fatal
/// configuration error listing the valid samplers.
pub fn resolve_sampler(name: &str, base: &BaseScheduleConfig) -> Result<SchedulerConfig, AtelierError> {
	let (solver, overlay) = lookup(name).ok_or_else(|| AtelierError::UnknownSampler {
		name: name.to_string(),
		valid: SAMPLER_NAMES.join(", ")
	})?;
	Ok(SchedulerConfig {
		base: base.clone(),
		solver,
		overlay,
		sampler_name: name.to_string()
	})
}

fn lookup(name: &str) -> Option<(SolverKind, SchedulerOverlay)> {
	let karras = SchedulerOverlay { karras_sigmas: true, ..Default::default() };
	let plain = SchedulerOverlay::default();
	Some(match name {
		"DPM++ 2M" => (SolverKind::DpmSolverMultistep, plain),
		"DPM++ 2M Karras" => (SolverKind::DpmSolverMultistep, karras),
		"DPM++ 2M SDE" => (SolverKind::DpmSolverMultistep, SchedulerOverlay { sde: true, ..plain }),
		"DPM++ 2M SDE Karras" => (SolverKind::DpmSolverMultistep, SchedulerOverlay { sde: true, ..karras }),
		"DPM++ 2S" => (SolverKind::DpmSolverSinglestep, plain),
		"DPM++ 2S Karras" => (SolverKind::DpmSolverSinglestep, karras),
		"DPM++ 1S" => (SolverKind::DpmSolverMultistep, SchedulerOverlay { solver_order: Some(1), ..plain }),
		"DPM++ 1S Karras" => (SolverKind::DpmSolverMultistep, SchedulerOverlay { solver_order: Some(1), ..karras }),
		"DPM++ 3M" => (SolverKind::DpmSolverMultistep, SchedulerOverlay { solver_order: Some(3), ..plain }),
		"DPM++ 3M Karras" => (SolverKind::DpmSolverMultistep, SchedulerOverlay { solver_order: Some(3), ..karras }),
		"DPM++ SDE" => (SolverKind::DpmSolverSde, plain),
		"DPM++ SDE Karras" => (SolverKind::DpmSolverSde, karras),
		"KDPM2" => (SolverKind::Kdpm2, plain),
		"KDPM2 Karras" => (SolverKind::Kdpm2, karras),
		"KDPM2 a" => (SolverKind::Kdpm2Ancestral, plain),
		"KDPM2 a Karras" => (SolverKind::Kdpm2Ancestral, karras),
		"Euler" => (SolverKind::Euler, plain),
		"Euler a" => (SolverKind::EulerAncestral, plain),
		"Heun" => (SolverKind::Heun, plain),
		"Heun Karras" => (SolverKind::Heun, karras),
		"LMS" => (SolverKind::Lms, plain),
		"LMS Karras" => (SolverKind::Lms, karras),
		"DDIM" => (SolverKind::Ddim, plain),
		"DDPM" => (SolverKind::Ddpm, plain),
		"DEIS" => (SolverKind::Deis, plain),
		"UniPC" => (SolverKind::UniPc, plain),
		"UniPC Karras" => (SolverKind::UniPc, karras),
		"PNDM" => (SolverKind::Pndm, plain),
		"Euler EDM" => (SolverKind::EulerEdm, plain),
		"Euler EDM Karras" => (SolverKind::EulerEdm, karras),
		"DPM++ 2M EDM" => (SolverKind::DpmSolverMultistepEdm, SchedulerOverlay { solver_order: Some(2), ..plain }),
		"DPM++ 2M EDM Karras" => (SolverKind::DpmSolverMultistepEdm, SchedulerOverlay { solver_order: Some(2), ..karras }),
		"DPM++ 2M Lu" => (SolverKind::DpmSolverMultistep, SchedulerOverlay { lu_lambdas: true, ..plain }),
		"DPM++ 2M Ef" => (SolverKind::DpmSolverMultistep, SchedulerOverlay { euler_at_final: true, ..plain }),
		"DPM++ 2M SDE Lu" => (SolverKind::DpmSolverMultistep, SchedulerOverlay { sde: true, lu_lambdas: true, ..plain }),
		"DPM++ 2M SDE Ef" => (SolverKind::DpmSolverMultistep, SchedulerOverlay { sde: true, euler_at_final: true, ..plain }),
		"TCD" => (SolverKind::Tcd, plain),
		"LCM" => (SolverKind::Lcm, plain),
		_ => return None
	})
}

/// Acceleration-adapter families. Selecting a sampler of one of these families implicitly
/// requests that family's published low-rank adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlashFamily {
	/// Latent consistency models.
	Lcm,
	/// Trajectory consistency distillation.
	Tcd
}

impl FlashFamily {
	/// The flash family a sampler name belongs to, if any.
	pub fn of_sampler(name: &str) -> Option<FlashFamily> {
		match name {
			"LCM" => Some(FlashFamily::Lcm),
			"TCD" => Some(FlashFamily::Tcd),
			_ => None
		}
	}

	/// The published acceleration adapter for this family and model family.
	pub fn adapter_id(&self, family: PipelineFamily) -> &'static str {
		match (self, family) {
			(FlashFamily::Lcm, PipelineFamily::StableDiffusion) => "latent-consistency/lcm-lora-sdv1-5",
			(FlashFamily::Lcm, PipelineFamily::StableDiffusionXl) => "latent-consistency/lcm-lora-sdxl",
			(FlashFamily::Tcd, PipelineFamily::StableDiffusion) => "h1t/TCD-SD15-LoRA",
			(FlashFamily::Tcd, PipelineFamily::StableDiffusionXl) => "h1t/TCD-SDXL-LoRA"
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn every_listed_sampler_resolves() {
		let base = BaseScheduleConfig::default();
		for name in SAMPLER_NAMES {
			let config = resolve_sampler(name, &base).unwrap();
			assert_eq!(config.sampler_name, *name);
			assert_eq!(config.base, base);
		}
	}

	#[test]
	fn unknown_sampler_is_fatal() {
		let err = resolve_sampler("DPM++ 4M", &BaseScheduleConfig::default()).unwrap_err();
		assert!(matches!(err, AtelierError::UnknownSampler { .. }));
		assert!(err.to_string().contains("DPM++ 2M Karras"));
	}

	#[test]
	fn karras_overlay_applied() {
		let config = resolve_sampler("DPM++ 2M Karras", &BaseScheduleConfig::default()).unwrap();
		assert_eq!(config.solver, SolverKind::DpmSolverMultistep);
		assert!(config.overlay.karras_sigmas);
		assert!(!config.overlay.sde);
	}

	#[test]
	fn flash_families() {
		assert_eq!(FlashFamily::of_sampler("LCM"), Some(FlashFamily::Lcm));
		assert_eq!(FlashFamily::of_sampler("TCD"), Some(FlashFamily::Tcd));
		assert_eq!(FlashFamily::of_sampler("DDIM"), None);
		assert_eq!(FlashFamily::Tcd.adapter_id(PipelineFamily::StableDiffusion), "h1t/TCD-SD15-LoRA");
	}
}
