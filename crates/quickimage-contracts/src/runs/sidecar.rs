use serde::{Deserialize, Serialize};

use super::ProviderOptions;

pub const METADATA_SCHEMA_VERSION: u64 = 1;

/// JSON sidecar stored as `<id>.json` beside a successful artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageMetadata {
    #[serde(default = "default_schema_version")]
    pub schema_version: u64,
    /// Filled from the file stem on read, so hand-written sidecars without an
    /// `id` still resolve.
    #[serde(default)]
    pub id: String,
    pub model: String,
    pub prompt: String,
    /// Extension of the canonical artifact (`png`, `jpg`, `webp`).
    #[serde(default = "default_format")]
    pub format: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aspect_ratio: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revised_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temporary_live_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub background_removed_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jpeg_path: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl ImageMetadata {
    pub fn new(
        id: impl Into<String>,
        model: impl Into<String>,
        prompt: impl Into<String>,
        format: impl Into<String>,
    ) -> Self {
        Self {
            schema_version: METADATA_SCHEMA_VERSION,
            id: id.into(),
            model: model.into(),
            prompt: prompt.into(),
            format: format.into(),
            created_at: None,
            size: None,
            aspect_ratio: None,
            style: None,
            quality: None,
            revised_prompt: None,
            temporary_live_url: None,
            background_removed_path: None,
            jpeg_path: None,
            warnings: Vec::new(),
        }
    }

    /// Copies the provider parameters that were actually sent.
    pub fn with_applied_options(mut self, options: &ProviderOptions) -> Self {
        self.size = options.size.clone();
        self.aspect_ratio = options.aspect_ratio.clone();
        self.style = options.style.clone();
        self.quality = options.quality.clone();
        self
    }

    pub fn prompt_contains(&self, lowered_query: &str) -> bool {
        self.prompt.to_lowercase().contains(lowered_query)
    }
}

fn default_schema_version() -> u64 {
    METADATA_SCHEMA_VERSION
}

fn default_format() -> String {
    "png".to_string()
}
