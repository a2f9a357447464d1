use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unsupported model '{0}'")]
pub struct UnsupportedModel(pub String);

/// Backend that serves one or more [`ImageModel`]s.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    OpenAi,
    Stability,
    Dryrun,
}

impl ProviderKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Stability => "stability",
            Self::Dryrun => "dryrun",
        }
    }

    /// Environment variable holding the provider's key, if it needs one.
    pub fn credential_env(self) -> Option<&'static str> {
        match self {
            Self::OpenAi => Some("OPENAI_API_KEY"),
            Self::Stability => Some("STABILITY_API_KEY"),
            Self::Dryrun => None,
        }
    }
}

/// Closed set of generation models a request can name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ImageModel {
    #[serde(rename = "dall-e-3")]
    DallE3,
    #[serde(rename = "stabilitydiffusion-3")]
    StableDiffusion3,
    #[serde(rename = "stable-image-core")]
    StableImageCore,
    #[serde(rename = "dryrun")]
    Dryrun,
}

impl ImageModel {
    pub const ALL: [ImageModel; 4] = [
        ImageModel::DallE3,
        ImageModel::StableDiffusion3,
        ImageModel::StableImageCore,
        ImageModel::Dryrun,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::DallE3 => "dall-e-3",
            Self::StableDiffusion3 => "stabilitydiffusion-3",
            Self::StableImageCore => "stable-image-core",
            Self::Dryrun => "dryrun",
        }
    }

    pub fn title(self) -> &'static str {
        match self {
            Self::DallE3 => "Dall-E 3",
            Self::StableDiffusion3 => "Stability Diffusion 3",
            Self::StableImageCore => "Stable Image Core",
            Self::Dryrun => "Dryrun",
        }
    }

    pub fn provider(self) -> ProviderKind {
        match self {
            Self::DallE3 => ProviderKind::OpenAi,
            Self::StableDiffusion3 | Self::StableImageCore => ProviderKind::Stability,
            Self::Dryrun => ProviderKind::Dryrun,
        }
    }

    pub fn parse(raw: &str) -> Result<Self, UnsupportedModel> {
        let normalized = raw.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|model| model.name() == normalized)
            .ok_or_else(|| UnsupportedModel(raw.trim().to_string()))
    }
}

impl FromStr for ImageModel {
    type Err = UnsupportedModel;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        Self::parse(raw)
    }
}

impl fmt::Display for ImageModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
