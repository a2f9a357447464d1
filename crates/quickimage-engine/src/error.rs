use std::time::Duration;

use quickimage_contracts::library::StoreError;
use quickimage_contracts::models::UnsupportedModel;
use quickimage_contracts::runs::{FailureKind, FailureReport};
use thiserror::Error;

const DISPLAY_BODY_MAX_CHARS: usize = 2048;

/// Failure of a single generation attempt. Every variant is fatal to that
/// attempt; background-removal problems are [`crate::postprocess::PostProcessError`]
/// and never end up here.
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("{variable} not set")]
    MissingCredentials {
        provider: &'static str,
        variable: &'static str,
    },
    #[error(transparent)]
    UnsupportedModel(#[from] UnsupportedModel),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("{provider} request failed: {source}")]
    Transport {
        provider: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error("{provider} request failed ({status}): {}", truncate_text(body, DISPLAY_BODY_MAX_CHARS))]
    ProviderRejected {
        provider: &'static str,
        status: u16,
        body: String,
    },
    #[error("{provider} returned an unusable response: {detail}")]
    InvalidResponse {
        provider: &'static str,
        detail: String,
    },
    #[error(transparent)]
    Storage(#[from] StoreError),
    #[error("job {job_id} failed while polling ({status}): {}", truncate_text(body, DISPLAY_BODY_MAX_CHARS))]
    PollingFailed {
        job_id: String,
        status: u16,
        body: String,
    },
    #[error("job {job_id} still running after {attempts} polls ({:.1}s)", elapsed.as_secs_f64())]
    PollingTimedOut {
        job_id: String,
        attempts: u32,
        elapsed: Duration,
    },
}

impl GenerationError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::MissingCredentials { .. } => FailureKind::MissingCredentials,
            Self::UnsupportedModel(_) => FailureKind::UnsupportedModel,
            Self::InvalidRequest(_) => FailureKind::InvalidRequest,
            Self::Transport { .. } => FailureKind::TransportError,
            Self::ProviderRejected { .. } => FailureKind::ProviderRejected,
            Self::InvalidResponse { .. } => FailureKind::InvalidResponse,
            Self::Storage(_) => FailureKind::StorageError,
            Self::PollingFailed { .. } => FailureKind::PollingFailed,
            Self::PollingTimedOut { .. } => FailureKind::PollingTimedOut,
        }
    }

    pub fn report(&self) -> FailureReport {
        FailureReport::new(self.kind(), self)
    }

    pub(crate) fn invalid_response(provider: &'static str, detail: impl Into<String>) -> Self {
        Self::InvalidResponse {
            provider,
            detail: detail.into(),
        }
    }
}

pub(crate) fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}
