//! Danbooru-style tag prompt template
//!
//! The tag-completion model is steered with a fixed-grammar prompt built
//! from literal delimiter markers. The grammar is what the model was
//! trained on, so the markers must match byte for byte, including the
//! unclosed `<general>` section.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::config::TagDefaults;
use crate::error::Error;

/// Content rating condition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rating {
    /// Strictly safe-for-work output
    Sfw,
    /// The model's default, mildly filtered bucket
    General,
    /// Allows suggestive but not explicit tags
    Sensitive,
}

impl Rating {
    /// Every rating, in the order the page lists them
    pub const ALL: [Self; 3] = [Self::Sfw, Self::General, Self::Sensitive];

    /// Marker spelling inside the template
    pub fn wire_name(self) -> &'static str {
        match self {
            Self::Sfw => "sfw",
            Self::General => "general",
            Self::Sensitive => "sensitive",
        }
    }
}

/// Aspect-ratio condition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AspectRatio {
    /// Far wider than tall
    UltraWide,
    /// Landscape
    Wide,
    /// Equal sides
    Square,
    /// Portrait
    Tall,
    /// Far taller than wide
    UltraTall,
}

impl AspectRatio {
    /// Every ratio, in the order the page lists them
    pub const ALL: [Self; 5] = [
        Self::UltraWide,
        Self::Wide,
        Self::Square,
        Self::Tall,
        Self::UltraTall,
    ];

    /// Marker spelling inside the template
    pub fn wire_name(self) -> &'static str {
        match self {
            Self::UltraWide => "ultra_wide",
            Self::Wide => "wide",
            Self::Square => "square",
            Self::Tall => "tall",
            Self::UltraTall => "ultra_tall",
        }
    }
}

/// How many tags the model should aim to produce
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TagLength {
    /// A handful of tags
    VeryShort,
    /// Roughly a caption's worth
    Short,
    /// The model's sweet spot
    Medium,
    /// Detailed scene coverage
    Long,
    /// Everything the model can justify
    VeryLong,
}

impl TagLength {
    /// Every length, in the order the page lists them
    pub const ALL: [Self; 5] = [
        Self::VeryShort,
        Self::Short,
        Self::Medium,
        Self::Long,
        Self::VeryLong,
    ];

    /// Marker spelling inside the template
    pub fn wire_name(self) -> &'static str {
        match self {
            Self::VeryShort => "very_short",
            Self::Short => "short",
            Self::Medium => "medium",
            Self::Long => "long",
            Self::VeryLong => "very_long",
        }
    }
}

macro_rules! impl_wire_traits {
    ($ty:ty, $what:literal) => {
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.wire_name())
            }
        }

        impl FromStr for $ty {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::ALL
                    .into_iter()
                    .find(|v| v.wire_name() == s)
                    .ok_or_else(|| {
                        Error::invalid_input(format!("unknown {} value: {}", $what, s))
                    })
            }
        }
    };
}

impl_wire_traits!(Rating, "rating");
impl_wire_traits!(AspectRatio, "aspect ratio");
impl_wire_traits!(TagLength, "length");

/// One tag-completion request as submitted from the page or the CLI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagPromptRequest {
    /// Copyright (series) tags
    pub copyright: String,
    /// Character tags
    pub character: String,
    /// Free general tags seeding the completion
    pub general: String,
    /// Content rating condition
    pub rating: Rating,
    /// Canvas shape condition
    pub aspect_ratio: AspectRatio,
    /// Output volume condition
    pub length: TagLength,
}

impl TagPromptRequest {
    /// Request pre-filled from the configured defaults.
    pub fn from_defaults(defaults: &TagDefaults) -> Self {
        Self {
            copyright: defaults.copyright.clone(),
            character: defaults.character.clone(),
            general: defaults.general.clone(),
            rating: defaults.rating,
            aspect_ratio: defaults.aspect_ratio,
            length: defaults.length,
        }
    }

    /// Render the templated prompt the completion model is conditioned on.
    pub fn render(&self) -> String {
        format!(
            "<|bos|>\
             <copyright>{}</copyright>\
             <character>{}</character>\
             <|rating:{}|><|aspect_ratio:{}|><|length:{}|>\
             <general>{}<|identity:none|><|input_end|>",
            self.copyright,
            self.character,
            self.rating,
            self.aspect_ratio,
            self.length,
            self.general,
        )
    }
}
