//! Utilities for cleaning and modifying prompts.

use lazy_static::lazy_static;
use regex::{Captures, Regex};

lazy_static! {
	static ref TRAILING_LEADING_COMMA: Regex = Regex::new(r#"^,+\s*|,+\s*$"#).unwrap();
	static ref COMMA: Regex = Regex::new(r#"\s*,+\s*"#).unwrap();
	static ref WHITESPACE: Regex = Regex::new(r#"\s+"#).unwrap();
	static ref INVERSION_VECTOR: Regex = Regex::new(r#"\b(\w+_\d+)\b(?:\s+)"#).unwrap();
}

/// Cleans up a potentially dirty prompt. This removes extraneous parentheses and commas, and cleans up trailing commas
/// and whitespace.
///
/// ```
/// # use diffusion_atelier::util::prompting::cleanup_prompt;
/// assert_eq!(
/// 	cleanup_prompt("(masterpiece,, best quality,:1.1)), 1girl,").as_str(),
/// 	"(masterpiece, best quality:1.1), 1girl"
/// );
/// ```
pub fn cleanup_prompt<S: AsRef<str>>(prompt: S) -> String {
	let split_regex: Regex = Regex::new(r#"\(*?(?:\([^)(]*(?:\([^)(]*(?:\([^)(]*(?:\([^)(]*\)[^)(]*)*\)[^)(]*)*\)[^)(]*)*\))\)*?|\b[^,]+\b"#).unwrap();
	let cleanup_emphasis_regex: Regex = Regex::new(r#"\(*?(\([^)(]*(?:\([^)(]*(?:\([^)(]*(?:\([^)(]*\)[^)(]*)*\)[^)(]*)*\)[^)(]*)*\))\)*"#).unwrap();
	let emphasis_trailing_comma_regex: Regex = Regex::new(r#"(\(+)([^:]*?),+(:\d[^)]+)?(\)+)"#).unwrap();

	fn emphasis_trailing_comma(cap: &Captures<'_>) -> String {
		cap.get(1).unwrap().as_str().to_owned() + cap.get(2).unwrap().as_str() + cap.get(3).unwrap().as_str() + cap.get(4).unwrap().as_str()
	}
	fn cleanup_emphasis(cap: &Captures<'_>) -> String {
		cap.get(1).unwrap().as_str().to_string()
	}
	fn cleanup_concept(cap: &Captures<'_>) -> String {
		cap.get(0).unwrap().as_str().trim().to_string()
	}

	let prompt = cleanup_emphasis_regex.replace_all(prompt.as_ref(), cleanup_emphasis);
	let prompt = emphasis_trailing_comma_regex.replace_all(prompt.as_ref(), emphasis_trailing_comma);
	let prompt = split_regex.replace_all(prompt.as_ref(), cleanup_concept);
	let prompt = COMMA.replace_all(prompt.as_ref(), ", ");
	let prompt = WHITESPACE.replace_all(prompt.as_ref(), " ");
	let prompt = TRAILING_LEADING_COMMA.replace_all(prompt.as_ref(), "");
	prompt.trim().to_string()
}

/// Combines 2 concepts into one prompt.
///
/// The output prompt is only minimally cleaned (removing extraneous/trailing commas). You should pass the output prompt
/// into [`cleanup_prompt`] for best results.
///
/// ```
/// # use diffusion_atelier::util::prompting::combine_concepts;
/// assert_eq!(
/// 	combine_concepts("masterpiece, best quality,,", "1girl, solo, blue hair, ").as_str(),
/// 	"masterpiece, best quality, 1girl, solo, blue hair"
/// );
/// ```
pub fn combine_concepts<A: AsRef<str>, B: AsRef<str>>(a: A, b: B) -> String {
	let a = TRAILING_LEADING_COMMA.replace_all(a.as_ref(), "");
	let b = TRAILING_LEADING_COMMA.replace_all(b.as_ref(), "");
	if a.trim().is_empty() {
		return b.trim().to_string();
	}
	if b.trim().is_empty() {
		return a.trim().to_string();
	}
	a.trim().to_string() + ", " + b.trim()
}

/// Comma-separates expanded multi-vector textual inversion tokens.
///
/// Multi-vector embeddings expand a single activation token into `token_0 token_1 ...`; weighting
/// engines treat whitespace-separated words as independent concepts, so the expansion is stitched
/// back together with commas before weighting.
///
/// ```
/// # use diffusion_atelier::util::prompting::separate_inversion_vectors;
/// assert_eq!(separate_inversion_vectors("style_0 style_1 1girl"), "style_0, style_1, 1girl");
/// ```
pub fn separate_inversion_vectors<S: AsRef<str>>(prompt: S) -> String {
	let prompt = INVERSION_VECTOR.replace_all(prompt.as_ref(), "$1, ");
	prompt.trim().to_string()
}

#[cfg(test)]
mod tests {
	use super::{cleanup_prompt, combine_concepts, separate_inversion_vectors};

	#[test]
	fn test_cleanup_prompt() {
		assert_eq!(
			cleanup_prompt("(best quality,, masterpiece,:1.3)),  1girl, solo, blue hair, ").as_str(),
			"(best quality, masterpiece:1.3), 1girl, solo, blue hair"
		);
	}

	#[test]
	fn test_combine_concepts() {
		assert_eq!(combine_concepts("masterpiece, best quality,,", "1girl, solo, blue hair, ").as_str(), "masterpiece, best quality, 1girl, solo, blue hair");
		assert_eq!(combine_concepts("", "1girl, solo,").as_str(), "1girl, solo");
	}

	#[test]
	fn test_separate_inversion_vectors() {
		assert_eq!(separate_inversion_vectors("badhand_0 badhand_1 badhand_2, portrait"), "badhand_0, badhand_1, badhand_2, portrait");
		assert_eq!(separate_inversion_vectors("no inversions here"), "no inversions here");
	}
}
