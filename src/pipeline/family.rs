//! Model family classification

use serde::{Deserialize, Serialize};
use std::fmt;

/// The two pipeline families the studio knows how to drive.
///
/// Classification is a substring heuristic over the repository id, not a
/// manifest inspection. Ids that merely contain "xl" route to [`Large`];
/// that misclassification is accepted, matching how users name checkpoints
/// in practice.
///
/// [`Large`]: PipelineFamily::Large
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineFamily {
    /// Single text encoder, 512-ish native resolution
    Base,
    /// Dual text encoder with a pooled projection, 1024-ish native resolution
    Large,
}

impl PipelineFamily {
    /// Classify a model id. Case-insensitive; checks for the common XL
    /// spellings ("sd-xl", "sdxl", and bare "xl").
    pub fn classify(model_id: &str) -> Self {
        let id = model_id.to_lowercase();
        if id.contains("sd-xl") || id.contains("sdxl") || id.contains("xl") {
            Self::Large
        } else {
            Self::Base
        }
    }

    /// Number of text encoders this family conditions on
    pub fn encoder_count(&self) -> usize {
        match self {
            Self::Base => 1,
            Self::Large => 2,
        }
    }
}

impl fmt::Display for PipelineFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Base => write!(f, "base"),
            Self::Large => write!(f, "large"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("John6666/anima-pencil-xl-v5-sdxl", PipelineFamily::Large; "xl and sdxl spelled out")]
    #[test_case("cagliostrolab/animagine-xl-3.1", PipelineFamily::Large; "dashed xl")]
    #[test_case("stabilityai/stable-diffusion-xl-base-1.0", PipelineFamily::Large; "sd dash xl")]
    #[test_case("SomeOrg/SDXL-Turbo", PipelineFamily::Large; "uppercase sdxl")]
    #[test_case("org/model-XL", PipelineFamily::Large; "uppercase xl suffix")]
    #[test_case("Lykon/AnyLoRA", PipelineFamily::Base; "plain base model")]
    #[test_case("Meina/MeinaMix_V11", PipelineFamily::Base; "no xl anywhere")]
    #[test_case("dreamlike-art/dreamlike-anime-1.0", PipelineFamily::Base; "dashes but no xl")]
    #[test_case("org/pixel-art-v2", PipelineFamily::Base; "x and l not adjacent")]
    #[test_case("GraydientPlatformAPI/perfectpony-xl", PipelineFamily::Large; "xl at the end")]
    fn test_classify(id: &str, expected: PipelineFamily) {
        assert_eq!(PipelineFamily::classify(id), expected);
    }

    #[test]
    fn test_encoder_count() {
        assert_eq!(PipelineFamily::Base.encoder_count(), 1);
        assert_eq!(PipelineFamily::Large.encoder_count(), 2);
    }

    #[test]
    fn test_display() {
        assert_eq!(PipelineFamily::Base.to_string(), "base");
        assert_eq!(PipelineFamily::Large.to_string(), "large");
    }
}
