//! Style prompt tables: named prompt templates applied to the prompt pair before conditioning.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{debug, error, info, warn};

#[derive(Debug, Deserialize)]
struct StyleEntry {
	name: String,
	prompt: String,
	negative_prompt: String
}

/// A table of named styles. A style's positive template contains a `{prompt}` placeholder; its
/// negative fragment is combined with the request's negative prompt.
#[derive(Debug, Default)]
pub struct StyleLibrary {
	styles: HashMap<String, (String, String)>,
	loaded_path: Option<PathBuf>
}

impl StyleLibrary {
	/// Loads a style table from a JSON file, replacing the current table. The loaded path is
	/// remembered so repeated requests with the same file skip the reload.
	pub fn load_file(&mut self, path: impl AsRef<Path>) {
		let path = path.as_ref();
		if self.loaded_path.as_deref() == Some(path) {
			return;
		}
		let entries: Vec<StyleEntry> = match std::fs::read_to_string(path).map_err(anyhow::Error::from).and_then(|raw| Ok(serde_json::from_str(&raw)?)) {
			Ok(entries) => entries,
			Err(e) => {
				error!("could not load styles file {}: {e}", path.display());
				return;
			}
		};
		self.styles = entries.into_iter().map(|entry| (entry.name, (entry.prompt, entry.negative_prompt))).collect();
		self.loaded_path = Some(path.to_path_buf());
		info!("styles file loaded with {} styles", self.styles.len());
		debug!("styles: {:?}", self.styles.keys().collect::<Vec<_>>());
	}

	/// The names of every loaded style.
	pub fn names(&self) -> impl Iterator<Item = &str> {
		self.styles.keys().map(String::as_str)
	}

	/// Applies the selected styles to a prompt pair. Unknown style names fall back to the raw
	/// prompt with a warning. Multiple styles chain: each style's template wraps the output of
	/// the previous one, and negative fragments accumulate.
	pub fn apply(&self, selected: &[String], prompt: &str, negative_prompt: &str) -> (String, String) {
		let mut styled_prompt = prompt.to_string();
		let mut styled_negative = negative_prompt.to_string();
		for name in selected {
			if name.is_empty() {
				continue;
			}
			match self.styles.get(name) {
				Some((template, negative)) => {
					styled_prompt = template.replace("{prompt}", &styled_prompt);
					styled_negative = crate::util::prompting::combine_concepts(&styled_negative, negative);
				}
				None => {
					warn!("style `{name}` not found, using the raw prompt");
				}
			}
		}
		(styled_prompt, styled_negative)
	}
}
