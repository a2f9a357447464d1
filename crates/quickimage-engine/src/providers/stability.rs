use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use quickimage_contracts::models::{ImageModel, ProviderKind, UnsupportedModel};
use quickimage_contracts::runs::{GenerationRequest, ProviderOptions};
use reqwest::header::ACCEPT;
use reqwest::multipart::{Form as MultipartForm, Part as MultipartPart};
use reqwest::Client as HttpClient;
use serde_json::Value;
use tracing::debug;

use super::{
    content_type, missing_credentials, output_extension_from_mime_or_format, pick_option,
    read_bytes, read_json, send_checked, ImageProvider, RawImage,
};
use crate::config::ProviderConfig;
use crate::error::GenerationError;
use crate::poller::{JobTransport, PollStatus};

const PROVIDER: &str = "stability";

const SD3_PATH: &str = "v2beta/stable-image/generate/sd3";
const CORE_PATH: &str = "v2beta/stable-image/generate/core";
const VIDEO_PATH: &str = "v2beta/image-to-video";

const ASPECT_RATIOS: [&str; 9] = [
    "1:1", "16:9", "21:9", "2:3", "3:2", "4:5", "5:4", "9:16", "9:21",
];
const OUTPUT_FORMATS: [&str; 3] = ["png", "jpeg", "webp"];
const STYLE_PRESETS: [&str; 17] = [
    "3d-model",
    "analog-film",
    "anime",
    "cinematic",
    "comic-book",
    "digital-art",
    "enhance",
    "fantasy-art",
    "isometric",
    "line-art",
    "low-poly",
    "modeling-compound",
    "neon-punk",
    "origami",
    "photographic",
    "pixel-art",
    "tile-texture",
];

const VIDEO_SEED: &str = "0";
const VIDEO_CFG_SCALE: &str = "1.8";
const VIDEO_MOTION_BUCKET_ID: &str = "127";

pub struct StabilityProvider {
    config: ProviderConfig,
    http: HttpClient,
}

impl StabilityProvider {
    pub fn new(config: ProviderConfig, http: HttpClient) -> Self {
        Self { config, http }
    }

    pub fn require_key(&self) -> Result<&str, GenerationError> {
        self.config
            .api_key()
            .ok_or_else(|| missing_credentials(ProviderKind::Stability))
    }

    fn resolve_options(
        model: ImageModel,
        options: &ProviderOptions,
    ) -> Result<ProviderOptions, GenerationError> {
        let aspect_ratio = pick_option(
            "aspect_ratio",
            options.aspect_ratio.as_deref(),
            ASPECT_RATIOS[0],
            &ASPECT_RATIOS,
        )?;
        let output_format = pick_option(
            "output_format",
            options.output_format.as_deref(),
            OUTPUT_FORMATS[0],
            &OUTPUT_FORMATS,
        )?;
        // Only Core understands presets; SD3 has no style parameter.
        let style = match (model, options.style.as_deref().map(str::trim)) {
            (ImageModel::StableImageCore, Some(raw)) if !raw.is_empty() => Some(pick_option(
                "style",
                Some(raw),
                STYLE_PRESETS[0],
                &STYLE_PRESETS,
            )?),
            _ => None,
        };
        Ok(ProviderOptions {
            size: None,
            aspect_ratio: Some(aspect_ratio),
            quality: None,
            style,
            output_format: Some(output_format),
        })
    }

    fn decode_json_image(payload: &Value) -> Result<Vec<u8>, GenerationError> {
        let image_b64 = payload
            .get("image")
            .or_else(|| payload.get("base64"))
            .or_else(|| {
                payload
                    .get("artifacts")
                    .and_then(Value::as_array)
                    .and_then(|rows| rows.first())
                    .and_then(Value::as_object)
                    .and_then(|row| row.get("base64"))
            })
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| {
                GenerationError::invalid_response(PROVIDER, "JSON response missing image bytes")
            })?;
        BASE64.decode(image_b64.as_bytes()).map_err(|err| {
            GenerationError::invalid_response(PROVIDER, format!("image base64 decode failed: {err}"))
        })
    }

    async fn generate_still(
        &self,
        api_key: &str,
        path: &str,
        model: ImageModel,
        request: &GenerationRequest,
    ) -> Result<RawImage, GenerationError> {
        let applied = Self::resolve_options(model, &request.provider_options)?;
        let output_format = applied.output_format.clone().unwrap_or_default();
        let mut form = MultipartForm::new()
            .text("prompt", request.prompt.clone())
            .text("output_format", output_format.clone());
        if let Some(aspect_ratio) = &applied.aspect_ratio {
            form = form.text("aspect_ratio", aspect_ratio.clone());
        }
        if let Some(style_preset) = &applied.style {
            form = form.text("style_preset", style_preset.clone());
        }
        let endpoint = self.config.endpoint(path);
        debug!(id = %request.id, endpoint = %endpoint, "stability image request");

        let response = send_checked(
            PROVIDER,
            self.http
                .post(&endpoint)
                .bearer_auth(api_key)
                .header(ACCEPT, "image/*")
                .multipart(form),
        )
        .await?;

        let is_image = content_type(&response)
            .map(|value| value.starts_with("image/"))
            .unwrap_or(false);
        let (bytes, mime_type) = if is_image {
            read_bytes(PROVIDER, response).await?
        } else {
            let payload = read_json(PROVIDER, response).await?;
            (Self::decode_json_image(&payload)?, None)
        };
        if bytes.is_empty() {
            return Err(GenerationError::invalid_response(PROVIDER, "empty image body"));
        }

        Ok(RawImage {
            extension: output_extension_from_mime_or_format(mime_type.as_deref(), &output_format),
            bytes,
            mime_type,
            revised_prompt: None,
            temporary_url: None,
            applied,
        })
    }

    /// Starts an image-to-video job and returns its id. `frame` must already
    /// be the 1024x576 PNG the endpoint expects.
    pub async fn submit_video(&self, api_key: &str, frame: Vec<u8>) -> Result<String, GenerationError> {
        let image = MultipartPart::bytes(frame)
            .file_name("image.png")
            .mime_str("image/png")
            .map_err(|source| GenerationError::Transport {
                provider: PROVIDER,
                source,
            })?;
        let form = MultipartForm::new()
            .part("image", image)
            .text("seed", VIDEO_SEED)
            .text("cfg_scale", VIDEO_CFG_SCALE)
            .text("motion_bucket_id", VIDEO_MOTION_BUCKET_ID);
        let endpoint = self.config.endpoint(VIDEO_PATH);
        debug!(endpoint = %endpoint, "stability video submit");

        let response = send_checked(
            PROVIDER,
            self.http.post(&endpoint).bearer_auth(api_key).multipart(form),
        )
        .await?;
        let payload = read_json(PROVIDER, response).await?;
        payload
            .get("id")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
            .ok_or_else(|| GenerationError::invalid_response(PROVIDER, "video submit returned no job id"))
    }

    pub fn video_jobs<'a>(&'a self, api_key: &'a str) -> StabilityVideoJobs<'a> {
        StabilityVideoJobs {
            provider: self,
            api_key,
        }
    }
}

#[async_trait]
impl ImageProvider for StabilityProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Stability
    }

    fn has_credentials(&self) -> bool {
        self.config.api_key().is_some()
    }

    async fn generate(
        &self,
        model: ImageModel,
        request: &GenerationRequest,
    ) -> Result<RawImage, GenerationError> {
        let api_key = self.require_key()?;
        let path = match model {
            ImageModel::StableDiffusion3 => SD3_PATH,
            ImageModel::StableImageCore => CORE_PATH,
            ImageModel::DallE3 | ImageModel::Dryrun => {
                return Err(UnsupportedModel(model.name().to_string()).into())
            }
        };
        self.generate_still(api_key, path, model, request).await
    }
}

/// Polls the image-to-video result endpoint for one API key.
pub struct StabilityVideoJobs<'a> {
    provider: &'a StabilityProvider,
    api_key: &'a str,
}

#[async_trait]
impl JobTransport for StabilityVideoJobs<'_> {
    async fn poll(&self, job_id: &str) -> Result<PollStatus, GenerationError> {
        let endpoint = self
            .provider
            .config
            .endpoint(&format!("{VIDEO_PATH}/result/{job_id}"));
        // 202 is a success status, so the status split happens here rather
        // than in send_checked.
        let response = self
            .provider
            .http
            .get(&endpoint)
            .bearer_auth(self.api_key)
            .header(ACCEPT, "video/*")
            .send()
            .await
            .map_err(|source| GenerationError::Transport {
                provider: PROVIDER,
                source,
            })?;
        match response.status().as_u16() {
            202 => Ok(PollStatus::StillRunning),
            200 => {
                let (bytes, _) = read_bytes(PROVIDER, response).await?;
                Ok(PollStatus::Complete(bytes))
            }
            status => {
                let body = response.text().await.unwrap_or_default();
                Ok(PollStatus::Unexpected { status, body })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use quickimage_contracts::models::ImageModel;
    use quickimage_contracts::runs::ProviderOptions;
    use serde_json::json;

    use super::StabilityProvider;
    use crate::error::GenerationError;

    #[test]
    fn sd3_ignores_style_and_defaults_to_square_png() -> anyhow::Result<()> {
        let options = ProviderOptions {
            style: Some("anime".to_string()),
            ..ProviderOptions::default()
        };
        let applied = StabilityProvider::resolve_options(ImageModel::StableDiffusion3, &options)?;
        assert_eq!(applied.aspect_ratio.as_deref(), Some("1:1"));
        assert_eq!(applied.output_format.as_deref(), Some("png"));
        assert_eq!(applied.style, None);
        Ok(())
    }

    #[test]
    fn core_validates_style_presets() -> anyhow::Result<()> {
        let mut options = ProviderOptions {
            style: Some("Pixel-Art".to_string()),
            aspect_ratio: Some("16:9".to_string()),
            ..ProviderOptions::default()
        };
        let applied = StabilityProvider::resolve_options(ImageModel::StableImageCore, &options)?;
        assert_eq!(applied.style.as_deref(), Some("pixel-art"));
        assert_eq!(applied.aspect_ratio.as_deref(), Some("16:9"));

        options.style = Some("watercolour".to_string());
        assert!(matches!(
            StabilityProvider::resolve_options(ImageModel::StableImageCore, &options),
            Err(GenerationError::InvalidRequest(_))
        ));
        Ok(())
    }

    #[test]
    fn rejects_unknown_aspect_ratio() {
        let options = ProviderOptions {
            aspect_ratio: Some("7:3".to_string()),
            ..ProviderOptions::default()
        };
        assert!(matches!(
            StabilityProvider::resolve_options(ImageModel::StableDiffusion3, &options),
            Err(GenerationError::InvalidRequest(message)) if message.contains("7:3")
        ));
    }

    #[test]
    fn json_payloads_fall_back_to_artifact_base64() -> anyhow::Result<()> {
        let payload = json!({"artifacts": [{"base64": "aGVsbG8="}]});
        assert_eq!(StabilityProvider::decode_json_image(&payload)?, b"hello");
        assert!(StabilityProvider::decode_json_image(&json!({})).is_err());
        Ok(())
    }
}
