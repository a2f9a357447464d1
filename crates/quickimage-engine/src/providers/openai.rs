use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use quickimage_contracts::models::{ImageModel, ProviderKind, UnsupportedModel};
use quickimage_contracts::runs::{GenerationRequest, ProviderOptions};
use reqwest::Client as HttpClient;
use serde_json::{json, Value};
use tracing::debug;

use super::{
    download_image, missing_credentials, output_extension_from_mime_or_format, pick_option,
    read_json, send_checked, ImageProvider, RawImage,
};
use crate::config::ProviderConfig;
use crate::error::GenerationError;

const PROVIDER: &str = "openai";

const DALL_E_3_SIZES: [&str; 3] = ["1024x1024", "1792x1024", "1024x1792"];
const DALL_E_3_QUALITIES: [&str; 2] = ["standard", "hd"];
const DALL_E_3_STYLES: [&str; 2] = ["vivid", "natural"];

pub struct OpenAiProvider {
    config: ProviderConfig,
    http: HttpClient,
}

impl OpenAiProvider {
    pub fn new(config: ProviderConfig, http: HttpClient) -> Self {
        Self { config, http }
    }

    /// DALL-E 3 takes the size as a `WIDTHxHEIGHT` string plus style and
    /// quality tiers.
    fn resolve_dall_e_3_options(options: &ProviderOptions) -> Result<ProviderOptions, GenerationError> {
        let size = pick_option(
            "size",
            options.size.as_deref(),
            DALL_E_3_SIZES[0],
            &DALL_E_3_SIZES,
        )?;
        let quality = pick_option(
            "quality",
            options.quality.as_deref(),
            DALL_E_3_QUALITIES[0],
            &DALL_E_3_QUALITIES,
        )?;
        let style = pick_option(
            "style",
            options.style.as_deref(),
            DALL_E_3_STYLES[0],
            &DALL_E_3_STYLES,
        )?;
        Ok(ProviderOptions {
            size: Some(size),
            quality: Some(quality),
            style: Some(style),
            aspect_ratio: None,
            output_format: Some("png".to_string()),
        })
    }

    async fn generate_dall_e_3(
        &self,
        api_key: &str,
        request: &GenerationRequest,
    ) -> Result<RawImage, GenerationError> {
        let applied = Self::resolve_dall_e_3_options(&request.provider_options)?;
        let endpoint = self.config.endpoint("images/generations");
        let payload = json!({
            "model": ImageModel::DallE3.name(),
            "prompt": request.prompt,
            "n": 1,
            "size": applied.size,
            "quality": applied.quality,
            "style": applied.style,
        });
        debug!(id = %request.id, endpoint = %endpoint, "openai image request");

        let response = send_checked(
            PROVIDER,
            self.http.post(&endpoint).bearer_auth(api_key).json(&payload),
        )
        .await?;
        let body = read_json(PROVIDER, response).await?;
        let item = body
            .get("data")
            .and_then(Value::as_array)
            .and_then(|rows| rows.first())
            .and_then(Value::as_object)
            .ok_or_else(|| GenerationError::invalid_response(PROVIDER, "response has no image data"))?;
        let revised_prompt = item
            .get("revised_prompt")
            .and_then(Value::as_str)
            .map(str::to_string);

        if let Some(b64) = item.get("b64_json").and_then(Value::as_str) {
            let bytes = BASE64.decode(b64.as_bytes()).map_err(|err| {
                GenerationError::invalid_response(PROVIDER, format!("image base64 decode failed: {err}"))
            })?;
            return Ok(RawImage {
                bytes,
                mime_type: Some("image/png".to_string()),
                extension: "png",
                revised_prompt,
                temporary_url: None,
                applied,
            });
        }

        let url = item
            .get("url")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| GenerationError::invalid_response(PROVIDER, "image item has neither url nor b64_json"))?;
        // The URL expires after roughly an hour, so the bytes are fetched now.
        let (bytes, mime_type) = download_image(&self.http, PROVIDER, url).await?;
        Ok(RawImage {
            extension: output_extension_from_mime_or_format(mime_type.as_deref(), "png"),
            bytes,
            mime_type,
            revised_prompt,
            temporary_url: Some(url.to_string()),
            applied,
        })
    }
}

#[async_trait]
impl ImageProvider for OpenAiProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenAi
    }

    fn has_credentials(&self) -> bool {
        self.config.api_key().is_some()
    }

    async fn generate(
        &self,
        model: ImageModel,
        request: &GenerationRequest,
    ) -> Result<RawImage, GenerationError> {
        let Some(api_key) = self.config.api_key() else {
            return Err(missing_credentials(ProviderKind::OpenAi));
        };
        match model {
            ImageModel::DallE3 => self.generate_dall_e_3(api_key, request).await,
            ImageModel::StableDiffusion3 | ImageModel::StableImageCore | ImageModel::Dryrun => {
                Err(UnsupportedModel(model.name().to_string()).into())
            }
        }
    }
}
