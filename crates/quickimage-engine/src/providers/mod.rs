//! Provider clients. Each one turns a [`GenerationRequest`] into one image's
//! bytes, failing fast when its key is missing.

mod dryrun;
mod openai;
mod stability;

use async_trait::async_trait;
use quickimage_contracts::models::{ImageModel, ProviderKind};
use quickimage_contracts::runs::{GenerationRequest, ProviderOptions};
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client as HttpClient, RequestBuilder, Response};
use serde_json::Value;

pub use dryrun::DryrunProvider;
pub use openai::OpenAiProvider;
pub use stability::{StabilityProvider, StabilityVideoJobs};

use crate::config::EngineConfig;
use crate::error::GenerationError;

/// Image bytes as returned (or downloaded) from a provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawImage {
    pub bytes: Vec<u8>,
    pub mime_type: Option<String>,
    /// Artifact extension derived from the MIME type or the requested format.
    pub extension: &'static str,
    pub revised_prompt: Option<String>,
    /// Short-lived URL the bytes were fetched from; informational only.
    pub temporary_url: Option<String>,
    /// Provider parameters actually sent, defaults filled in.
    pub applied: ProviderOptions,
}

#[async_trait]
pub trait ImageProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    fn has_credentials(&self) -> bool;

    async fn generate(
        &self,
        model: ImageModel,
        request: &GenerationRequest,
    ) -> Result<RawImage, GenerationError>;
}

/// The fixed set of provider clients, selected by model.
pub struct ProviderSet {
    openai: OpenAiProvider,
    stability: StabilityProvider,
    dryrun: DryrunProvider,
}

impl ProviderSet {
    pub fn from_config(config: &EngineConfig, http: HttpClient) -> Self {
        Self {
            openai: OpenAiProvider::new(config.openai.clone(), http.clone()),
            stability: StabilityProvider::new(config.stability.clone(), http),
            dryrun: DryrunProvider,
        }
    }

    pub fn client(&self, model: ImageModel) -> &dyn ImageProvider {
        match model.provider() {
            ProviderKind::OpenAi => &self.openai,
            ProviderKind::Stability => &self.stability,
            ProviderKind::Dryrun => &self.dryrun,
        }
    }

    pub fn stability(&self) -> &StabilityProvider {
        &self.stability
    }
}

pub(crate) fn missing_credentials(kind: ProviderKind) -> GenerationError {
    GenerationError::MissingCredentials {
        provider: kind.name(),
        variable: kind.credential_env().unwrap_or("API key"),
    }
}

/// Sends the request and turns non-2xx answers into `ProviderRejected`
/// with the raw body preserved.
pub(crate) async fn send_checked(
    provider: &'static str,
    request: RequestBuilder,
) -> Result<Response, GenerationError> {
    let response = request
        .send()
        .await
        .map_err(|source| GenerationError::Transport { provider, source })?;
    if !response.status().is_success() {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        return Err(GenerationError::ProviderRejected {
            provider,
            status,
            body,
        });
    }
    Ok(response)
}

pub(crate) async fn read_json(
    provider: &'static str,
    response: Response,
) -> Result<Value, GenerationError> {
    let body = response
        .text()
        .await
        .map_err(|source| GenerationError::Transport { provider, source })?;
    serde_json::from_str(&body).map_err(|err| {
        GenerationError::invalid_response(provider, format!("invalid JSON payload: {err}"))
    })
}

pub(crate) async fn read_bytes(
    provider: &'static str,
    response: Response,
) -> Result<(Vec<u8>, Option<String>), GenerationError> {
    let mime_type = content_type(&response);
    let bytes = response
        .bytes()
        .await
        .map_err(|source| GenerationError::Transport { provider, source })?
        .to_vec();
    Ok((bytes, mime_type))
}

/// Fetches bytes behind a temporary provider URL.
pub(crate) async fn download_image(
    http: &HttpClient,
    provider: &'static str,
    url: &str,
) -> Result<(Vec<u8>, Option<String>), GenerationError> {
    let response = send_checked(provider, http.get(url)).await?;
    read_bytes(provider, response).await
}

pub(crate) fn content_type(response: &Response) -> Option<String> {
    response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_ascii_lowercase())
}

pub(crate) fn normalize_output_extension(output_format: &str) -> &'static str {
    let mut lowered = output_format.trim().to_ascii_lowercase();
    if let Some(value) = lowered.strip_prefix("image/") {
        lowered = value.to_string();
    }
    match lowered.as_str() {
        "jpg" | "jpeg" => "jpg",
        "webp" => "webp",
        _ => "png",
    }
}

pub(crate) fn output_extension_from_mime_or_format(
    mime: Option<&str>,
    output_format: &str,
) -> &'static str {
    if let Some(mime) = mime {
        let lowered = mime.to_ascii_lowercase();
        if lowered.contains("jpeg") || lowered.contains("jpg") {
            return "jpg";
        }
        if lowered.contains("webp") {
            return "webp";
        }
        if lowered.contains("png") {
            return "png";
        }
    }
    normalize_output_extension(output_format)
}

/// Lowercases `raw` (or takes `default`) and checks it against `allowed`.
pub(crate) fn pick_option(
    field: &str,
    raw: Option<&str>,
    default: &'static str,
    allowed: &[&'static str],
) -> Result<String, GenerationError> {
    let value = raw
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_ascii_lowercase)
        .unwrap_or_else(|| default.to_string());
    if allowed.contains(&value.as_str()) {
        return Ok(value);
    }
    Err(GenerationError::InvalidRequest(format!(
        "{field} '{value}' is not one of [{}]",
        allowed.join(", ")
    )))
}
