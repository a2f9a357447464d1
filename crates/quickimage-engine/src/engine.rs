use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use indexmap::IndexMap;
use quickimage_contracts::events::{EventPayload, EventWriter};
use quickimage_contracts::ids::object_id;
use quickimage_contracts::library::{
    validate_id, ArtifactStore, SearchError, SearchIndex, SearchOrder, Staging, StoreError,
};
use quickimage_contracts::models::ImageModel;
use quickimage_contracts::runs::{
    BackgroundMode, GenerationRequest, GenerationResult, ImageMetadata,
};
use reqwest::Client as HttpClient;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::error::GenerationError;
use crate::poller::{JobPoller, JobState, VideoJob};
use crate::postprocess::PostProcessor;
use crate::providers::{ProviderSet, RawImage};

/// Presence of one model's API key, as shown to the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeyStatus {
    pub exists: bool,
    /// Environment variable the key is read from; empty when none is needed.
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoRequest {
    pub id: String,
    pub source_image: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VideoResult {
    pub id: String,
    pub job_id: String,
    pub video_path: PathBuf,
    pub states: Vec<JobState>,
    pub attempts: u32,
}

/// Generation pipeline: provider, artifact, post-processing, sidecar,
/// report. Holds only configuration and clients; concurrent calls for
/// different ids share nothing but the image directory.
pub struct Engine {
    store: ArtifactStore,
    search: SearchIndex,
    providers: ProviderSet,
    processor: PostProcessor,
    poller: JobPoller,
    events: Option<EventWriter>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        let store = ArtifactStore::new(&config.image_dir);
        let events = config
            .events_path
            .as_ref()
            .map(|path| EventWriter::new(path, object_id()));
        Self {
            search: SearchIndex::new(store.clone()),
            store,
            providers: ProviderSet::from_config(&config, HttpClient::new()),
            processor: PostProcessor::new(config.background_removal),
            poller: JobPoller::new(config.poll),
            events,
        }
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    /// Runs one generation attempt. Failures come back inside the result;
    /// this never returns early with an error.
    pub async fn generate(&self, request: &GenerationRequest) -> GenerationResult {
        info!(id = %request.id, model = %request.model, "generation started");
        self.emit(
            "generation_started",
            json!({
                "id": request.id,
                "model": request.model,
                "prompt": request.prompt,
            }),
        );

        let result = match self.run_generation(request).await {
            Ok(result) => result,
            Err(err) => {
                let report = err.report();
                warn!(id = %request.id, kind = ?report.kind, error = %err, "generation failed");
                self.emit(
                    "generation_failed",
                    json!({
                        "id": request.id,
                        "kind": report.kind,
                        "message": report.message,
                    }),
                );
                GenerationResult::failed(request, report)
            }
        };

        self.emit(
            "generation_reported",
            json!({
                "id": result.id,
                "succeeded": result.succeeded,
                "warnings": result.warnings,
            }),
        );
        result
    }

    async fn run_generation(
        &self,
        request: &GenerationRequest,
    ) -> Result<GenerationResult, GenerationError> {
        if request.prompt.trim().is_empty() {
            return Err(GenerationError::InvalidRequest("prompt is empty".to_string()));
        }
        validate_id(&request.id).map_err(|err| GenerationError::InvalidRequest(err.to_string()))?;
        let model = ImageModel::parse(&request.model)?;

        let raw = self
            .providers
            .client(model)
            .generate(model, request)
            .await?;

        let id = request.id.as_str();
        let staging = self.store.begin_staging(id).await?;
        let staged_artifact = match self
            .store
            .write_staged(&staging, raw.extension, &raw.bytes)
            .await
        {
            Ok(path) => path,
            Err(err) => {
                self.store.abandon(staging).await;
                return Err(err.into());
            }
        };

        let mut warnings = Vec::new();
        let background_removed_path = self
            .apply_background_removal(request, &staged_artifact, &mut warnings)
            .await;
        let jpeg_path = self
            .apply_jpeg_copy(request, &staging, raw.extension, &mut warnings)
            .await;

        let artifact_path = self.store.artifact_path(id, raw.extension);
        let metadata = build_metadata(
            model,
            request,
            &raw,
            background_removed_path.as_deref(),
            jpeg_path.as_deref(),
            &warnings,
        );
        // Files left over from an earlier attempt under this id are replaced
        // here; on failure they stay exactly as they were.
        let metadata_path = self.store.commit(staging, &metadata).await?;
        self.emit(
            "artifact_saved",
            json!({
                "id": id,
                "path": artifact_path.display().to_string(),
                "bytes": raw.bytes.len(),
            }),
        );
        info!(id, path = %artifact_path.display(), "generation succeeded");

        Ok(GenerationResult {
            id: request.id.clone(),
            model: model.name().to_string(),
            prompt: request.prompt.clone(),
            succeeded: true,
            error: None,
            revised_prompt: raw.revised_prompt,
            temporary_remote_url: raw.temporary_url,
            artifact_path: Some(artifact_path),
            background_removed_path,
            jpeg_path,
            metadata_path: Some(metadata_path),
            warnings,
        })
    }

    /// Works on the staged artifact and returns the derived file's final
    /// path, if one is kept next to the original.
    async fn apply_background_removal(
        &self,
        request: &GenerationRequest,
        staged_artifact: &Path,
        warnings: &mut Vec<String>,
    ) -> Option<PathBuf> {
        let mode = request.post_process.background_mode()?;
        match self.processor.remove_background(staged_artifact, mode).await {
            Ok(_) => {
                let path = match mode {
                    BackgroundMode::KeepBothVersions => {
                        Some(self.store.background_removed_path(&request.id))
                    }
                    BackgroundMode::Replace => None,
                };
                self.emit(
                    "background_removed",
                    json!({
                        "id": request.id,
                        "mode": mode,
                        "path": path.as_ref().map(|path| path.display().to_string()),
                    }),
                );
                path
            }
            Err(err) => {
                warn!(id = %request.id, error = %err, "background removal failed");
                self.post_process_failed(request, "remove_background", err.to_string(), warnings);
                None
            }
        }
    }

    async fn apply_jpeg_copy(
        &self,
        request: &GenerationRequest,
        staging: &Staging,
        extension: &str,
        warnings: &mut Vec<String>,
    ) -> Option<PathBuf> {
        if !request.post_process.save_jpeg_copy {
            return None;
        }
        let final_path = self.store.jpeg_copy_path(&request.id);
        // The artifact already is `<id>.jpg`.
        if extension == "jpg" {
            return Some(final_path);
        }
        let staged_artifact = staging.artifact_path(extension);
        match self
            .processor
            .save_jpeg_copy(&staged_artifact, &staging.jpeg_copy_path())
            .await
        {
            Ok(_) => Some(final_path),
            Err(err) => {
                warn!(id = %request.id, error = %err, "jpeg copy failed");
                self.post_process_failed(request, "save_jpeg_copy", err.to_string(), warnings);
                None
            }
        }
    }

    fn post_process_failed(
        &self,
        request: &GenerationRequest,
        step: &str,
        message: String,
        warnings: &mut Vec<String>,
    ) {
        self.emit(
            "post_process_failed",
            json!({
                "id": request.id,
                "step": step,
                "message": message,
            }),
        );
        warnings.push(format!("{step} failed: {message}"));
    }

    pub async fn search(
        &self,
        query: &str,
        limit: usize,
        order: SearchOrder,
    ) -> Result<Vec<ImageMetadata>, SearchError> {
        self.search.search(query, limit, order).await
    }

    pub async fn list_newest(&self, limit: usize) -> Result<Vec<ImageMetadata>, StoreError> {
        self.store.list_newest_first(limit).await
    }

    pub async fn read_metadata(&self, id: &str) -> Result<ImageMetadata, StoreError> {
        self.store.read_metadata(id).await
    }

    /// Key presence per model, in catalogue order.
    pub fn api_key_status(&self) -> IndexMap<String, KeyStatus> {
        ImageModel::ALL
            .into_iter()
            .map(|model| {
                let client = self.providers.client(model);
                let status = KeyStatus {
                    exists: client.has_credentials(),
                    name: model.provider().credential_env().unwrap_or_default().to_string(),
                };
                (model.name().to_string(), status)
            })
            .collect()
    }

    /// Turns a still image into `<id>.mp4` through the Stability
    /// image-to-video job API.
    pub async fn generate_video(&self, request: &VideoRequest) -> Result<VideoResult, GenerationError> {
        validate_id(&request.id).map_err(|err| GenerationError::InvalidRequest(err.to_string()))?;
        let stability = self.providers.stability();
        let api_key = stability.require_key()?;

        let frame = self
            .processor
            .prepare_video_frame(&request.source_image)
            .await
            .map_err(|err| GenerationError::InvalidRequest(format!("cannot prepare video frame: {err}")))?;
        let job_id = stability.submit_video(api_key, frame).await?;
        info!(id = %request.id, job_id = %job_id, "video job submitted");
        self.emit(
            "video_job_submitted",
            json!({ "id": request.id, "job_id": job_id }),
        );

        let mut job = VideoJob::submitted(job_id);
        let outcome = self.poller.run(&stability.video_jobs(api_key), &mut job).await;
        self.emit(
            "video_job_finished",
            json!({
                "id": request.id,
                "job_id": job.job_id,
                "state": job.state(),
                "attempts": job.attempts,
            }),
        );
        outcome?;

        let bytes = job.result.take().ok_or_else(|| {
            GenerationError::invalid_response("stability", "completed job carried no video")
        })?;
        let video_path = self.store.write_artifact(&request.id, "mp4", &bytes).await?;
        info!(id = %request.id, path = %video_path.display(), "video saved");

        Ok(VideoResult {
            id: request.id.clone(),
            states: job.history().to_vec(),
            attempts: job.attempts,
            job_id: job.job_id,
            video_path,
        })
    }

    fn emit(&self, event_type: &str, payload: Value) {
        let Some(events) = &self.events else {
            return;
        };
        let payload: EventPayload = match payload {
            Value::Object(map) => map,
            _ => EventPayload::new(),
        };
        if let Err(err) = events.emit(event_type, payload) {
            warn!(event = event_type, error = %err, "failed to append event");
        }
    }
}

fn build_metadata(
    model: ImageModel,
    request: &GenerationRequest,
    raw: &RawImage,
    background_removed_path: Option<&Path>,
    jpeg_path: Option<&Path>,
    warnings: &[String],
) -> ImageMetadata {
    let mut metadata = ImageMetadata::new(&request.id, model.name(), &request.prompt, raw.extension)
        .with_applied_options(&raw.applied);
    metadata.created_at = Some(Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true));
    metadata.revised_prompt = raw.revised_prompt.clone();
    metadata.temporary_live_url = raw.temporary_url.clone();
    metadata.background_removed_path = background_removed_path.map(|path| path.display().to_string());
    metadata.jpeg_path = jpeg_path.map(|path| path.display().to_string());
    metadata.warnings = warnings.to_vec();
    metadata
}
