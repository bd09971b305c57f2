//! Persisted images carry their generation metadata and can be read back.

mod common;

use common::{quick_options, Harness};
use diffusion_atelier::persist::read_metadata;
use diffusion_atelier::Task;

#[test]
fn persisted_images_embed_their_metadata() {
	let mut h = Harness::new();
	let model = h.sd15_checkpoint("model.safetensors");
	h.session.load_model(&model, Task::Txt2Img, None).unwrap();

	let storage = h.dir.path().join("images");
	let options = quick_options().with_seed(42).with_storage(true, storage.to_str().unwrap());
	let output = h.session.generate(&options).unwrap();

	assert_eq!(output.saved.len(), 1);
	let metadata = read_metadata(&output.saved[0]).unwrap();
	assert_eq!(metadata.prompt, "a red fox");
	assert_eq!(metadata.model_id, model.display().to_string());
	assert_eq!(metadata.seed, 42);
	assert_eq!(metadata.sampler, "DPM++ 2M");
	assert_eq!((metadata.width, metadata.height), (512, 512));
	assert!(metadata.clip_skip);
	assert!(metadata.vae_model.is_none());
}

#[test]
fn failed_persistence_degrades_to_a_placeholder() {
	let mut h = Harness::new();
	let model = h.sd15_checkpoint("model.safetensors");
	h.session.load_model(&model, Task::Txt2Img, None).unwrap();

	// a storage path that cannot be created as a directory
	let blocker = h.dir.path().join("blocker");
	std::fs::write(&blocker, b"not a directory").unwrap();
	let options = quick_options().with_seed(1).with_storage(true, blocker.to_str().unwrap());

	let output = h.session.generate(&options).unwrap();
	assert_eq!(output.saved, vec![diffusion_atelier::generation::NOT_SAVED.to_string()]);
	assert_eq!(output.images.len(), 1);
}
