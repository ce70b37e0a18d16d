//! Test fixtures shared across integration tests
//!
//! The model directories written here mirror the diffusers layout the
//! loader expects, scaled down to a six-word vocabulary and single-digit
//! hidden widths so tests stay fast on a laptop CPU.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor};
use easel::AppConfig;
use tempfile::TempDir;

pub const TINY_TOKENIZER: &str = r#"{
    "version": "1.0",
    "truncation": null,
    "padding": null,
    "added_tokens": [],
    "normalizer": null,
    "pre_tokenizer": {"type": "Whitespace"},
    "post_processor": null,
    "decoder": null,
    "model": {
        "type": "WordLevel",
        "vocab": {"[UNK]": 0, "<|eos|>": 1, "1girl": 2, "solo": 3, "green": 4, "skirt": 5},
        "unk_token": "[UNK]"
    }
}"#;

pub const TINY_VOCAB: usize = 6;

/// Create a temporary directory for test outputs
pub fn create_test_dir() -> (TempDir, PathBuf) {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let path = temp_dir.path().to_path_buf();
    (temp_dir, path)
}

fn constant_row_table(vocab: usize, hidden: usize) -> Tensor {
    let data: Vec<f32> = (0..vocab)
        .flat_map(|row| std::iter::repeat(row as f32).take(hidden))
        .collect();
    Tensor::from_vec(data, (vocab, hidden), &Device::Cpu).unwrap()
}

/// Lay out a minimal diffusers-style model directory.
pub fn write_model_dir(root: &Path, hidden: usize) {
    std::fs::create_dir_all(root.join("tokenizer")).unwrap();
    std::fs::create_dir_all(root.join("text_encoder")).unwrap();
    std::fs::create_dir_all(root.join("scheduler")).unwrap();
    std::fs::write(root.join("tokenizer/tokenizer.json"), TINY_TOKENIZER).unwrap();

    let mut tensors = HashMap::new();
    tensors.insert(
        "text_model.embeddings.token_embedding.weight".to_string(),
        constant_row_table(TINY_VOCAB, hidden),
    );
    tensors.insert(
        "text_model.encoder.layers.0.self_attn.q_proj.weight".to_string(),
        Tensor::full(1.0f32, (hidden, hidden), &Device::Cpu).unwrap(),
    );
    candle_core::safetensors::save(&tensors, root.join("text_encoder/model.safetensors")).unwrap();

    std::fs::write(
        root.join("scheduler/scheduler_config.json"),
        r#"{
            "_class_name": "EulerDiscreteScheduler",
            "num_train_timesteps": 1000,
            "beta_start": 0.00085,
            "beta_end": 0.012,
            "beta_schedule": "scaled_linear"
        }"#,
    )
    .unwrap();
}

/// Lay out an adapter directory holding one peft-convention pair that
/// targets the first text encoder's q_proj.
pub fn write_adapter_dir(root: &Path, in_dim: usize, out_dim: usize, rank: usize) {
    std::fs::create_dir_all(root).unwrap();
    let mut tensors = HashMap::new();
    tensors.insert(
        "text_encoder.text_model.encoder.layers.0.self_attn.q_proj.lora_A.weight".to_string(),
        Tensor::full(1.0f32, (rank, in_dim), &Device::Cpu).unwrap(),
    );
    tensors.insert(
        "text_encoder.text_model.encoder.layers.0.self_attn.q_proj.lora_B.weight".to_string(),
        Tensor::full(1.0f32, (out_dim, rank), &Device::Cpu).unwrap(),
    );
    candle_core::safetensors::save(&tensors, root.join("pytorch_lora_weights.safetensors"))
        .unwrap();
}

/// Lay out a flat tag-model directory with a tied output head.
pub fn write_tag_model_dir(root: &Path, hidden: usize) {
    std::fs::create_dir_all(root).unwrap();
    std::fs::write(root.join("tokenizer.json"), TINY_TOKENIZER).unwrap();
    std::fs::write(root.join("config.json"), r#"{"eos_token_id": 1}"#).unwrap();

    let data: Vec<f32> = (0..TINY_VOCAB * hidden)
        .map(|i| (i % 7) as f32 * 0.25)
        .collect();
    let mut tensors = HashMap::new();
    tensors.insert(
        "model.embed_tokens.weight".to_string(),
        Tensor::from_vec(data, (TINY_VOCAB, hidden), &Device::Cpu).unwrap(),
    );
    candle_core::safetensors::save(&tensors, root.join("model.safetensors")).unwrap();
}

/// App configuration keeping everything inside `dir`: outputs land under
/// it and the tag model points at a fixture written beside them.
pub fn test_config(dir: &Path) -> AppConfig {
    let tag_model = dir.join("tag-model");
    write_tag_model_dir(&tag_model, 4);

    let mut config = AppConfig::default();
    config.storage.output_dir = dir.join("outputs");
    config.tagger.model_id = tag_model.to_string_lossy().into_owned();
    config.tagger.max_new_tokens = 8;
    config.tagger.seed = Some(0);
    config
}

/// A request body small enough to render in milliseconds on CPU.
pub fn small_generation_body() -> serde_json::Value {
    serde_json::json!({
        "prompt": "1girl solo",
        "negative_prompt": "",
        "width": 256,
        "height": 256,
        "steps": 2,
        "guidance_scale": 7.0,
        "clip_skip": 2,
        "num_images": 1,
        "seed": 5
    })
}
