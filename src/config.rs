//! Configuration structures for the easel studio

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::tagger::template::{AspectRatio, Rating, TagLength};

/// Main configuration for the studio
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// HTTP server settings
    pub server: ServerConfig,
    /// Generation defaults and accepted ranges
    pub generation: GenerationConfig,
    /// Tag prompt generator settings
    pub tagger: TaggerConfig,
    /// Model and adapter choice lists shown in the UI
    pub catalog: CatalogConfig,
    /// Output storage settings
    pub storage: StorageConfig,
}

impl AppConfig {
    /// Load configuration from a YAML or JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config: Self = match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => serde_yaml::from_str(&content).map_err(|e| {
                Error::config(format!("failed to parse {}: {}", path.display(), e))
            })?,
            Some("json") => serde_json::from_str(&content)?,
            _ => {
                return Err(Error::config(format!(
                    "unsupported config format for {} (expected .yaml, .yml or .json)",
                    path.display()
                )))
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.server.host.is_empty() {
            return Err(Error::config("Server host must not be empty"));
        }
        if self.server.port == 0 {
            return Err(Error::config("Server port must be > 0"));
        }

        let limits = &self.generation.limits;
        if limits.min_size < 8 || limits.min_size % 8 != 0 {
            return Err(Error::config(
                "Minimum image size must be a multiple of 8 and at least 8",
            ));
        }
        if limits.min_size >= limits.max_size {
            return Err(Error::config(
                "Minimum image size must be below the maximum",
            ));
        }
        if limits.max_steps == 0 {
            return Err(Error::config("Maximum step count must be > 0"));
        }
        if limits.min_guidance >= limits.max_guidance {
            return Err(Error::config(
                "Minimum guidance scale must be below the maximum",
            ));
        }
        if limits.max_clip_skip == 0 || limits.max_images == 0 {
            return Err(Error::config(
                "Clip-skip and image-count limits must be > 0",
            ));
        }

        let defaults = &self.generation.defaults;
        if defaults.width < limits.min_size
            || defaults.width > limits.max_size
            || defaults.height < limits.min_size
            || defaults.height > limits.max_size
        {
            return Err(Error::config(
                "Default image size is outside the configured limits",
            ));
        }
        if defaults.steps == 0 || defaults.steps > limits.max_steps {
            return Err(Error::config(
                "Default step count is outside the configured limits",
            ));
        }
        if defaults.num_images == 0 || defaults.num_images > limits.max_images {
            return Err(Error::config(
                "Default image count is outside the configured limits",
            ));
        }

        if self.tagger.max_new_tokens == 0 || self.tagger.max_new_tokens > 2048 {
            return Err(Error::config(
                "Tagger max_new_tokens must be between 1 and 2048",
            ));
        }
        if self.tagger.temperature <= 0.0 || self.tagger.temperature > 2.0 {
            return Err(Error::config(
                "Tagger temperature must be between 0.0 and 2.0",
            ));
        }
        if self.tagger.top_p <= 0.0 || self.tagger.top_p > 1.0 {
            return Err(Error::config("Tagger top_p must be in (0.0, 1.0]"));
        }
        if self.tagger.top_k == 0 {
            return Err(Error::config("Tagger top_k must be > 0"));
        }

        Ok(())
    }
}

/// HTTP server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind when sharing is disabled
    pub host: String,
    /// Port to bind
    pub port: u16,
    /// Bind on all interfaces so the studio is reachable from other machines
    pub share: bool,
    /// Enable permissive CORS for the JSON API
    pub cors: bool,
}

impl ServerConfig {
    /// Host the listener actually binds. Sharing overrides the configured
    /// host with all interfaces.
    pub fn bind_host(&self) -> &str {
        if self.share {
            "0.0.0.0"
        } else {
            &self.host
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 7860,
            share: true,
            cors: true,
        }
    }
}

/// Generation defaults plus the ranges the UI sliders expose
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// Values pre-filled in the UI and used when an API field is omitted
    pub defaults: GenerationDefaults,
    /// Accepted ranges for request validation and slider bounds
    pub limits: GenerationLimits,
}

/// Default generation parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationDefaults {
    /// Default model repository id
    pub model_id: String,
    /// Default LoRA adapter repository id
    pub adapter_id: Option<String>,
    /// Default prompt
    pub prompt: String,
    /// Default negative prompt
    pub negative_prompt: String,
    /// Default image width in pixels
    pub width: usize,
    /// Default image height in pixels
    pub height: usize,
    /// Default denoising step count
    pub steps: usize,
    /// Default guidance scale
    pub guidance_scale: f64,
    /// Default clip-skip depth
    pub clip_skip: usize,
    /// Default number of images per request
    pub num_images: usize,
}

impl Default for GenerationDefaults {
    fn default() -> Self {
        Self {
            model_id: "John6666/anima-pencil-xl-v5-sdxl".to_string(),
            adapter_id: Some("xshini/Nakano_Miku_xl".to_string()),
            prompt: "1girl, solo, nakano miku, solo, green skirt, headphones around neck, \
                     looking at viewer, blush, closed mouth, white shirt, long sleeves, \
                     blue cardigan, pleated skirt, black pantyhose"
                .to_string(),
            negative_prompt: "NSFW, lowres, bad anatomy, bad hands, text, error, \
                              missing fingers, extra digit, fewer digits, cropped, \
                              worst quality, low quality, normal quality, jpeg artifacts, \
                              signature, watermark, username, blurry, artist name,"
                .to_string(),
            width: 1024,
            height: 1024,
            steps: 20,
            guidance_scale: 7.0,
            clip_skip: 2,
            num_images: 1,
        }
    }
}

/// Accepted parameter ranges
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationLimits {
    /// Smallest accepted width/height
    pub min_size: usize,
    /// Largest accepted width/height
    pub max_size: usize,
    /// Slider step for width/height
    pub size_step: usize,
    /// Largest accepted step count
    pub max_steps: usize,
    /// Smallest accepted guidance scale
    pub min_guidance: f64,
    /// Largest accepted guidance scale
    pub max_guidance: f64,
    /// Slider step for the guidance scale
    pub guidance_step: f64,
    /// Largest accepted clip-skip depth
    pub max_clip_skip: usize,
    /// Largest accepted image count per request
    pub max_images: usize,
}

impl Default for GenerationLimits {
    fn default() -> Self {
        Self {
            min_size: 256,
            max_size: 2048,
            size_step: 64,
            max_steps: 50,
            min_guidance: 1.0,
            max_guidance: 20.0,
            guidance_step: 0.5,
            max_clip_skip: 12,
            max_images: 5,
        }
    }
}

/// Tag prompt generator settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TaggerConfig {
    /// Tag language model repository id
    pub model_id: String,
    /// Maximum number of sampled tag tokens
    pub max_new_tokens: usize,
    /// Sampling temperature
    pub temperature: f64,
    /// Nucleus sampling threshold
    pub top_p: f64,
    /// Top-k sampling cutoff
    pub top_k: usize,
    /// Fixed sampling seed; random when unset
    pub seed: Option<u64>,
    /// Values pre-filled in the tag fields
    pub defaults: TagDefaults,
}

impl Default for TaggerConfig {
    fn default() -> Self {
        Self {
            model_id: "p1atdev/dart-v2-moe-sft".to_string(),
            max_new_tokens: 128,
            temperature: 1.0,
            top_p: 1.0,
            top_k: 100,
            seed: None,
            defaults: TagDefaults::default(),
        }
    }
}

/// Default tag field values
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TagDefaults {
    /// Copyright (franchise) tags
    pub copyright: String,
    /// Character tags
    pub character: String,
    /// Free-form general tags
    pub general: String,
    /// Content rating band
    pub rating: Rating,
    /// Aspect-ratio band
    pub aspect_ratio: AspectRatio,
    /// Requested output length band
    pub length: TagLength,
}

impl Default for TagDefaults {
    fn default() -> Self {
        Self {
            copyright: "Go-Toubun no Hanayome".to_string(),
            character: "nakano miku".to_string(),
            general: "1girl, solo".to_string(),
            rating: Rating::General,
            aspect_ratio: AspectRatio::Square,
            length: TagLength::Short,
        }
    }
}

/// Model and adapter choice lists for the UI dropdowns.
///
/// Free-text ids are always accepted; these lists only seed the dropdowns.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    /// Model repository ids
    pub models: Vec<String>,
    /// LoRA adapter repository ids
    pub adapters: Vec<String>,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            models: DEFAULT_MODEL_CHOICES.iter().map(|s| s.to_string()).collect(),
            adapters: DEFAULT_ADAPTER_CHOICES
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

/// Output storage settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory that generated images are written into
    pub output_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("outputs"),
        }
    }
}

/// Model ids seeding the model dropdown
pub const DEFAULT_MODEL_CHOICES: &[&str] = &[
    "stablediffusionapi/abyssorangemix3a1b",
    "Ojimi/anime-kawai-diffusion",
    "Linaqruf/anything-v3-1",
    "circulus/canvers-anime-v3.8.1",
    "redstonehero/cetusmix_v4",
    "DGSpitzer/Cyberpunk-Anime-Diffusion",
    "dreamlike-art/dreamlike-anime-1.0",
    "Lykon/dreamshaper-8",
    "emilianJR/majicMIX_realistic_v6",
    "Meina/MeinaMix_V11",
    "Meina/MeinaPastel_V7",
    "jzli/RealCartoon3D-v11",
    "Meina/MeinaUnreal_V5",
    "redstonehero/xxmix_9realistic_v40",
    "stablediffusionapi/yesmix-v35",
    "Lykon/AAM_AnyLora_AnimeMix",
    "Lykon/AnyLoRA",
    "xshini/pooribumix_V1",
    "John6666/anima-pencil-sdxl",
    "GraydientPlatformAPI/perfectpony-xl",
    "cagliostrolab/animagine-xl-3.1",
    "John6666/anima-pencil-xl-v5-sdxl",
];

/// Adapter ids seeding the LoRA dropdown
pub const DEFAULT_ADAPTER_CHOICES: &[&str] = &[
    "xshini/KizunaAi",
    "xshini/NakanoMiku",
    "xshini/HiguchiKaede",
    "xshini/tokisaki-Kurumi-XL",
];
