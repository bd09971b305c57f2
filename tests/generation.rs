//! The staged generation request: validation, seed policy, denoise retry, and output shape.

mod common;

use common::{quick_options, reference_image, Harness};
use diffusion_atelier::error::DenoiseSignature;
use diffusion_atelier::generation::NOT_SAVED;
use diffusion_atelier::{AtelierError, Task};

#[test]
fn txt2img_end_to_end() {
	let mut h = Harness::new();
	let model = h.sd15_checkpoint("model.safetensors");
	h.session.load_model(&model, Task::Txt2Img, None).unwrap();

	let output = h.session.generate(&quick_options().with_seed(42)).unwrap();
	assert_eq!(output.images.len(), 1);
	assert_eq!(output.seeds, vec![42]);
	assert_eq!(output.saved, vec![NOT_SAVED.to_string()]);
	assert_eq!(h.counters.lock().unwrap().denoise_calls, 1);
}

#[test]
fn generating_without_a_model_is_fatal() {
	let mut h = Harness::new();
	assert!(matches!(h.session.generate(&quick_options()), Err(AtelierError::NoModelLoaded)));
}

#[test]
fn explicit_seed_leads_the_batch() {
	let mut h = Harness::new();
	let model = h.sd15_checkpoint("model.safetensors");
	h.session.load_model(&model, Task::Txt2Img, None).unwrap();

	h.session.generate(&quick_options().with_seed(7).with_image_count(3)).unwrap();
	let bindings = h.counters.lock().unwrap().generator_bindings.clone();
	assert_eq!(bindings.len(), 3);
	assert_eq!(bindings[0].0, 7);
	for (seed, _) in &bindings {
		assert!(*seed < 2_147_483_647);
	}
}

#[test]
fn negative_seed_randomizes_every_image() {
	let mut h = Harness::new();
	let model = h.sd15_checkpoint("model.safetensors");
	h.session.load_model(&model, Task::Txt2Img, None).unwrap();

	let output = h.session.generate(&quick_options().with_seed(-1).with_image_count(4)).unwrap();
	assert_eq!(output.seeds.len(), 4);
	assert!(output.seeds.iter().all(|seed| *seed < 2_147_483_647));
}

#[test]
fn img2img_shares_one_seed_across_the_batch() {
	let mut h = Harness::new();
	let model = h.sd15_checkpoint("model.safetensors");
	h.session.load_model(&model, Task::Img2Img, None).unwrap();

	let options = quick_options().with_seed(9).with_image_count(3).with_image(reference_image());
	let output = h.session.generate(&options).unwrap();
	assert_eq!(output.seeds, vec![9, 9, 9]);
}

#[test]
fn guided_task_without_an_image_fails_before_the_denoiser() {
	let mut h = Harness::new();
	let model = h.sd15_checkpoint("model.safetensors");
	h.session.load_model(&model, Task::Canny, None).unwrap();

	let err = h.session.generate(&quick_options()).unwrap_err();
	assert!(matches!(err, AtelierError::MissingReferenceImage(ref task) if task == "canny"));
	assert_eq!(h.counters.lock().unwrap().denoise_calls, 0);
}

#[test]
fn inpainting_without_a_mask_is_fatal() {
	let mut h = Harness::new();
	let model = h.sd15_checkpoint("model.safetensors");
	h.session.load_model(&model, Task::Inpaint, None).unwrap();

	let err = h.session.generate(&quick_options().with_image(reference_image())).unwrap_err();
	assert!(matches!(err, AtelierError::MissingMask));
}

#[test]
fn unknown_sampler_is_fatal() {
	let mut h = Harness::new();
	let model = h.sd15_checkpoint("model.safetensors");
	h.session.load_model(&model, Task::Txt2Img, None).unwrap();

	let err = h.session.generate(&quick_options().with_sampler("DPM++ 9M")).unwrap_err();
	assert!(matches!(err, AtelierError::UnknownSampler { .. }));
	assert_eq!(h.counters.lock().unwrap().denoise_calls, 0);
}

#[test]
fn unstable_sampler_retries_once_with_the_fallback() {
	let mut h = Harness::new();
	let model = h.sd15_checkpoint("model.safetensors");
	h.session.load_model(&model, Task::Txt2Img, None).unwrap();
	h.failures.lock().unwrap().push_back(anyhow::Error::new(DenoiseSignature::UnstableSampler));

	let output = h.session.generate(&quick_options().with_seed(42).with_sampler("DPM++ 2M Karras")).unwrap();
	assert_eq!(output.images.len(), 1);

	let counters = h.counters.lock().unwrap();
	assert_eq!(counters.denoise_calls, 2);
	assert_eq!(counters.denoise_samplers, vec!["DPM++ 2M Karras".to_string(), "DDIM".to_string()]);
	// the retry reuses the same generators; the output stays tied to the request seed
	assert_eq!(counters.denoise_seeds[0], counters.denoise_seeds[1]);
}

#[test]
fn degenerate_latents_surface_a_configuration_error() {
	let mut h = Harness::new();
	let model = h.sd15_checkpoint("model.safetensors");
	h.session.load_model(&model, Task::Txt2Img, None).unwrap();
	h.failures.lock().unwrap().push_back(anyhow::Error::new(DenoiseSignature::DegenerateLatent));

	let err = h.session.generate(&quick_options()).unwrap_err();
	assert!(matches!(err, AtelierError::DegenerateOutput));
}

#[test]
fn unknown_denoise_failures_keep_the_backend_message() {
	let mut h = Harness::new();
	let model = h.sd15_checkpoint("model.safetensors");
	h.session.load_model(&model, Task::Txt2Img, None).unwrap();
	h.failures.lock().unwrap().push_back(anyhow::anyhow!("out of memory"));

	let err = h.session.generate(&quick_options()).unwrap_err();
	assert!(matches!(err, AtelierError::Generation(ref message) if message.contains("out of memory")));
}

#[test]
fn guided_tasks_prepend_the_control_preview() {
	let mut h = Harness::new();
	let model = h.sd15_checkpoint("model.safetensors");
	h.session.load_model(&model, Task::Canny, None).unwrap();

	let options = quick_options().with_seed(3).with_image_count(2).with_image(reference_image());
	let output = h.session.generate(&options).unwrap();
	// two generated frames plus the preview, which records seed 0
	assert_eq!(output.images.len(), 3);
	assert_eq!(output.seeds[0], 0);
	assert_eq!(output.seeds[1], 3);
	assert_eq!(h.counters.lock().unwrap().detector_loads, vec![diffusion_atelier::control::DetectorKind::Canny]);
}

#[test]
fn loop_generation_repeats_the_request() {
	let mut h = Harness::new();
	let model = h.sd15_checkpoint("model.safetensors");
	h.session.load_model(&model, Task::Txt2Img, None).unwrap();

	let mut options = quick_options().with_seed(1);
	options.loop_generation = 3;
	let output = h.session.generate(&options).unwrap();
	assert_eq!(output.images.len(), 3);
	assert_eq!(h.counters.lock().unwrap().denoise_calls, 3);
}

#[test]
fn loop_iterations_redraw_their_seeds() {
	let mut h = Harness::new();
	let model = h.sd15_checkpoint("model.safetensors");
	h.session.load_model(&model, Task::Txt2Img, None).unwrap();

	let mut options = quick_options().with_seed(-1);
	options.loop_generation = 2;
	h.session.generate(&options).unwrap();

	let seeds = h.counters.lock().unwrap().denoise_seeds.clone();
	assert_eq!(seeds.len(), 2);
	assert_ne!(seeds[0], seeds[1]);
}

#[test]
fn explicit_seed_leads_every_loop_iteration() {
	let mut h = Harness::new();
	let model = h.sd15_checkpoint("model.safetensors");
	h.session.load_model(&model, Task::Txt2Img, None).unwrap();

	let mut options = quick_options().with_seed(7).with_image_count(2);
	options.loop_generation = 2;
	h.session.generate(&options).unwrap();

	let seeds = h.counters.lock().unwrap().denoise_seeds.clone();
	assert_eq!(seeds.len(), 2);
	assert_eq!(seeds[0][0], 7);
	assert_eq!(seeds[1][0], 7);
}

#[test]
fn mismatched_inpaint_mask_is_fatal() {
	let mut h = Harness::new();
	let model = h.sd15_checkpoint("model.safetensors");
	h.session.load_model(&model, Task::Inpaint, None).unwrap();

	let options = quick_options()
		.with_image(image::RgbImage::new(512, 512))
		.with_mask(image::RgbImage::new(1024, 512));
	let err = h.session.generate(&options).unwrap_err();
	assert!(err.to_string().contains("does not match the image"));
	assert_eq!(h.counters.lock().unwrap().denoise_calls, 0);
}

#[test]
fn upscale_can_run_on_both_sides_of_detail_correction() {
	let mut h = Harness::new();
	let model = h.sd15_checkpoint("model.safetensors");
	h.session.load_model(&model, Task::Txt2Img, None).unwrap();

	let mut options = quick_options()
		.with_seed(5)
		.with_detail_correction(Default::default())
		.with_upscale(diffusion_atelier::UpscaleOptions::new("./upscalers/ultrasharp.pth"));
	options.upscale_before_detail_correction = true;
	options.upscale_after_detail_correction = true;
	h.session.generate(&options).unwrap();

	let counters = h.counters.lock().unwrap();
	assert_eq!(counters.correct_calls, 1);
	assert_eq!(counters.upscale_calls, 2);
}

#[test]
fn post_passes_run_in_the_requested_order() {
	let mut h = Harness::new();
	let model = h.sd15_checkpoint("model.safetensors");
	h.session.load_model(&model, Task::Txt2Img, None).unwrap();

	let options = quick_options()
		.with_seed(5)
		.with_detail_correction(Default::default())
		.with_upscale(diffusion_atelier::UpscaleOptions::new("./upscalers/ultrasharp.pth"));
	let output = h.session.generate(&options).unwrap();
	assert_eq!(output.images.len(), 1);

	let counters = h.counters.lock().unwrap();
	assert_eq!(counters.correct_calls, 1);
	assert_eq!(counters.upscale_calls, 1);
}

#[test]
fn freeu_toggles_with_the_request() {
	let mut h = Harness::new();
	let model = h.sd15_checkpoint("model.safetensors");
	h.session.load_model(&model, Task::Txt2Img, None).unwrap();

	h.session.generate(&quick_options().with_freeu()).unwrap();
	h.session.generate(&quick_options().with_freeu()).unwrap();
	h.session.generate(&quick_options()).unwrap();

	// enabled once, left alone while unchanged, disabled once
	assert_eq!(h.counters.lock().unwrap().freeu_sets, vec![true, false]);
}

#[test]
fn misaligned_dimensions_are_corrected() {
	let mut h = Harness::new();
	let model = h.sd15_checkpoint("model.safetensors");
	h.session.load_model(&model, Task::Txt2Img, None).unwrap();

	h.session.generate(&quick_options().with_seed(1).with_size(513, 769)).unwrap();
	assert_eq!(h.counters.lock().unwrap().denoise_dimensions, vec![(520, 776)]);
}
