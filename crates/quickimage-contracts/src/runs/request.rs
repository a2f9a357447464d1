use serde::{Deserialize, Serialize};

/// Provider-specific knobs. Each provider reads the fields it understands and
/// validates them against its own allowed values.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderOptions {
    /// `WIDTHxHEIGHT`, e.g. `1024x1024`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
    /// Aspect-ratio token, e.g. `16:9`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aspect_ratio: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_format: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackgroundMode {
    /// Overwrite the source artifact.
    Replace,
    /// Write `<id>-background-removed.png` next to the untouched source.
    KeepBothVersions,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostProcessOptions {
    #[serde(default)]
    pub remove_background: bool,
    #[serde(default)]
    pub remove_background_keep_original: bool,
    #[serde(default)]
    pub save_jpeg_copy: bool,
}

impl PostProcessOptions {
    /// Keeping the original wins when both flags are set.
    pub fn background_mode(&self) -> Option<BackgroundMode> {
        if self.remove_background_keep_original {
            Some(BackgroundMode::KeepBothVersions)
        } else if self.remove_background {
            Some(BackgroundMode::Replace)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub id: String,
    /// Raw model name as supplied by the caller; resolved by the engine.
    pub model: String,
    pub prompt: String,
    #[serde(default)]
    pub provider_options: ProviderOptions,
    #[serde(default)]
    pub post_process: PostProcessOptions,
}

impl GenerationRequest {
    pub fn new(id: impl Into<String>, model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            model: model.into(),
            prompt: prompt.into(),
            provider_options: ProviderOptions::default(),
            post_process: PostProcessOptions::default(),
        }
    }

    pub fn with_provider_options(mut self, options: ProviderOptions) -> Self {
        self.provider_options = options;
        self
    }

    pub fn with_post_process(mut self, post_process: PostProcessOptions) -> Self {
        self.post_process = post_process;
        self
    }
}
