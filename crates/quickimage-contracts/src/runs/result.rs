use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::GenerationRequest;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    MissingCredentials,
    UnsupportedModel,
    InvalidRequest,
    TransportError,
    ProviderRejected,
    InvalidResponse,
    StorageError,
    PollingFailed,
    PollingTimedOut,
}

/// User-displayable failure attached to a failed [`GenerationResult`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReport {
    pub kind: FailureKind,
    pub message: String,
}

impl FailureReport {
    pub const PREFIX: &'static str = "Error: ";

    pub fn new(kind: FailureKind, detail: impl fmt::Display) -> Self {
        Self {
            kind,
            message: format!("{}{}", Self::PREFIX, detail),
        }
    }
}

/// Outcome of one generation attempt. Built once by the engine and never
/// mutated; a retry produces a new value under the same id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationResult {
    pub id: String,
    pub model: String,
    pub prompt: String,
    pub succeeded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<FailureReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revised_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temporary_remote_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub background_removed_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jpeg_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl GenerationResult {
    pub fn failed(request: &GenerationRequest, report: FailureReport) -> Self {
        Self {
            id: request.id.clone(),
            model: request.model.clone(),
            prompt: request.prompt.clone(),
            succeeded: false,
            error: Some(report),
            revised_prompt: None,
            temporary_remote_url: None,
            artifact_path: None,
            background_removed_path: None,
            jpeg_path: None,
            metadata_path: None,
            warnings: Vec::new(),
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error.as_ref().map(|report| report.message.as_str())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{FailureKind, FailureReport, GenerationResult};
    use crate::runs::GenerationRequest;

    #[test]
    fn failure_messages_carry_the_error_prefix() {
        let report = FailureReport::new(FailureKind::MissingCredentials, "OPENAI_API_KEY not set");
        assert_eq!(report.message, "Error: OPENAI_API_KEY not set");
    }

    #[test]
    fn failed_result_serializes_without_paths() -> anyhow::Result<()> {
        let request = GenerationRequest::new("abc", "dall-e-3", "a red bicycle");
        let result = GenerationResult::failed(
            &request,
            FailureReport::new(FailureKind::ProviderRejected, "OpenAI request failed (400)"),
        );
        let value = serde_json::to_value(&result)?;
        assert_eq!(value["succeeded"], json!(false));
        assert_eq!(value["error"]["kind"], json!("provider_rejected"));
        assert!(value.get("artifact_path").is_none());
        assert!(value.get("metadata_path").is_none());
        assert_eq!(
            result.error_message(),
            Some("Error: OpenAI request failed (400)")
        );
        Ok(())
    }
}
