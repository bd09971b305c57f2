//! Geometry alignment helpers for denoiser stride requirements.

use num_traits::{PrimInt, Unsigned};

/// Rounds `value` up to the nearest multiple of `unit`. The result is never zero.
///
/// ```
/// # use diffusion_atelier::util::geometry::align_up;
/// assert_eq!(align_up(513u32, 8), 520);
/// assert_eq!(align_up(512u32, 8), 512);
/// ```
pub fn align_up<T: PrimInt + Unsigned>(value: T, unit: T) -> T {
	let value = value.max(T::one());
	let rem = value % unit;
	if rem.is_zero() { value } else { value + (unit - rem) }
}

/// Scales `(height, width)` so the longest side is `resolution`, then rounds each side to the
/// nearest multiple of 64 to satisfy the denoising network's stride requirements.
pub fn fit_resolution(height: u32, width: u32, resolution: u32) -> (u32, u32) {
	let k = f64::from(resolution) / f64::from(height.max(width));
	let h = ((f64::from(height) * k / 64.0).round() as u32).max(1) * 64;
	let w = ((f64::from(width) * k / 64.0).round() as u32).max(1) * 64;
	(h, w)
}

/// Corrects an inverted guidance window. A `start >= end` pair is reset to the full `(0.0, 1.0)`
/// window; the caller is expected to warn when the second tuple element is `true`.
pub fn correct_guidance_window(start: f32, end: f32) -> ((f32, f32), bool) {
	if start >= end { ((0.0, 1.0), true) } else { ((start, end), false) }
}

#[cfg(test)]
mod tests {
	use super::{align_up, correct_guidance_window, fit_resolution};

	#[test]
	fn align_up_is_smallest_multiple_not_below() {
		for input in 1u32..300 {
			let aligned = align_up(input, 8);
			assert_eq!(aligned % 8, 0);
			assert!(aligned >= input);
			assert!(aligned - input < 8);
		}
	}

	#[test]
	fn align_up_never_zero() {
		assert_eq!(align_up(0u32, 8), 8);
	}

	#[test]
	fn fit_resolution_is_aligned_to_64() {
		let (h, w) = fit_resolution(768, 512, 512);
		assert_eq!(h % 64, 0);
		assert_eq!(w % 64, 0);
		assert_eq!(h, 512);
		assert_eq!(w, 320);
	}

	#[test]
	fn inverted_window_resets_to_full() {
		assert_eq!(correct_guidance_window(0.8, 0.2), ((0.0, 1.0), true));
		assert_eq!(correct_guidance_window(0.5, 0.5), ((0.0, 1.0), true));
		assert_eq!(correct_guidance_window(0.2, 0.8), ((0.2, 0.8), false));
	}
}
