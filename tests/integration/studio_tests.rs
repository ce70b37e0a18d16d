//! Full workflow integration tests
//!
//! load → fuse → render → decode against tiny local fixtures, through the
//! same `Studio` the server and the CLI drive.

use easel::device;
use easel::pipeline::{CandleBackend, GenerationRequest};
use easel::tagger::TagPromptRequest;
use easel::Studio;

use super::fixtures::*;
use super::init_test_logging;

fn test_studio(dir: &std::path::Path) -> Studio {
    let (device, dtype) = device::cpu();
    Studio::with_backend(test_config(dir), device, dtype, Box::new(CandleBackend))
}

fn small_request() -> GenerationRequest {
    GenerationRequest {
        prompt: "1girl solo green skirt".to_string(),
        negative_prompt: String::new(),
        width: 320,
        height: 256,
        steps: 2,
        guidance_scale: 7.0,
        clip_skip: 2,
        num_images: 1,
        seed: Some(11),
    }
}

#[test]
fn test_generation_produces_decodable_pngs() {
    init_test_logging();
    let (_tmp, dir) = create_test_dir();
    let mut studio = test_studio(&dir);
    let model = dir.join("anylora-studio");
    write_model_dir(&model, 8);
    studio.load_model(&model.to_string_lossy(), None).unwrap();

    let mut request = small_request();
    request.num_images = 2;
    let set = studio.generate(&request).unwrap();

    assert_eq!(set.paths.len(), 2);
    for path in &set.paths {
        let image = image::open(path).unwrap().to_rgb8();
        assert_eq!(image.width(), 320);
        assert_eq!(image.height(), 256);
    }
}

#[test]
fn test_adapter_fusion_workflow() {
    init_test_logging();
    let (_tmp, dir) = create_test_dir();
    let mut studio = test_studio(&dir);
    let model = dir.join("anylora-studio");
    let adapter = dir.join("miku-adapter");
    write_model_dir(&model, 8);
    write_adapter_dir(&adapter, 8, 8, 2);

    let report = studio
        .load_model(&model.to_string_lossy(), Some(&adapter.to_string_lossy()))
        .unwrap();
    assert!(report.notices[0].starts_with("Loaded LoRA "));
    assert!(studio.pipeline().unwrap().adapter_id.is_some());

    let set = studio.generate(&small_request()).unwrap();
    assert!(set.paths[0].exists());
}

#[test]
fn test_incompatible_adapter_still_renders() {
    init_test_logging();
    let (_tmp, dir) = create_test_dir();
    let mut studio = test_studio(&dir);
    let model = dir.join("anylora-studio");
    let adapter = dir.join("wrong-adapter");
    write_model_dir(&model, 8);
    write_adapter_dir(&adapter, 12, 12, 2);

    let report = studio
        .load_model(&model.to_string_lossy(), Some(&adapter.to_string_lossy()))
        .unwrap();
    assert_eq!(report.notices.len(), 3);
    assert!(studio.pipeline().unwrap().adapter_id.is_none());

    let set = studio.generate(&small_request()).unwrap();
    assert!(set.paths[0].exists());
}

#[test]
fn test_tag_flow_gates_generate_from_tags_on_model() {
    init_test_logging();
    let (_tmp, dir) = create_test_dir();
    let mut studio = test_studio(&dir);
    let tag_request = TagPromptRequest::from_defaults(&studio.config().tagger.defaults);

    let report = studio.generate_tags(&tag_request).unwrap();
    assert!(report.ui.can_copy);
    assert!(!report.ui.can_generate_from_tags);

    let model = dir.join("anylora-studio");
    write_model_dir(&model, 8);
    let report = studio.load_model(&model.to_string_lossy(), None).unwrap();
    assert!(report.ui.can_generate_from_tags);
}

#[test]
fn test_seeded_generation_is_reproducible_across_sessions() {
    init_test_logging();
    let (_tmp, dir) = create_test_dir();
    let model = dir.join("anylora-studio");
    write_model_dir(&model, 8);

    let mut first_bytes = Vec::new();
    for session_dir in ["a", "b"] {
        let session = dir.join(session_dir);
        std::fs::create_dir_all(&session).unwrap();
        let mut studio = test_studio(&session);
        studio.load_model(&model.to_string_lossy(), None).unwrap();
        let set = studio.generate(&small_request()).unwrap();
        let bytes = std::fs::read(&set.paths[0]).unwrap();
        if first_bytes.is_empty() {
            first_bytes = bytes;
        } else {
            assert_eq!(first_bytes, bytes);
        }
    }
}
