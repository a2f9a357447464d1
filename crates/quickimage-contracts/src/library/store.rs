use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::fs;
use tracing::{debug, warn};

use crate::runs::ImageMetadata;

const METADATA_EXTENSION: &str = "json";
const BACKGROUND_REMOVED_SUFFIX: &str = "-background-removed";
const IMAGE_EXTENSIONS: [&str; 3] = ["png", "jpg", "webp"];

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid artifact id '{0}'")]
    InvalidId(String),
    #[error("no metadata stored for id '{0}'")]
    NotFound(String),
    #[error("refusing to write metadata for '{id}': artifact {} does not exist", path.display())]
    MissingArtifact { id: String, path: PathBuf },
    #[error("failed to {action} {}: {source}", path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("metadata for '{id}' is not valid JSON: {source}")]
    Corrupt {
        id: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode metadata for '{id}': {source}")]
    Encode {
        id: String,
        #[source]
        source: serde_json::Error,
    },
}

impl StoreError {
    fn io(action: &'static str, path: &Path, source: io::Error) -> Self {
        Self::Io {
            action,
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Ids double as file stems, so only `[A-Za-z0-9_-]` is accepted.
pub fn validate_id(id: &str) -> Result<(), StoreError> {
    let valid = !id.is_empty()
        && id
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_');
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidId(id.to_string()))
    }
}

/// Whole-file replacement: bytes land in a hidden temp file in the same
/// directory and are renamed over `path`, so readers never observe a partial
/// file.
pub async fn write_file_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let parent = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .await
        .map_err(|err| StoreError::io("create directory", parent, err))?;

    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("artifact");
    let temp_path = parent.join(format!(".{file_name}.tmp-{}", uuid::Uuid::new_v4().simple()));
    if let Err(err) = fs::write(&temp_path, bytes).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(StoreError::io("write", &temp_path, err));
    }
    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(StoreError::io("replace", path, err));
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn artifact_path(&self, id: &str, extension: &str) -> PathBuf {
        self.root.join(format!("{id}.{extension}"))
    }

    pub fn metadata_path(&self, id: &str) -> PathBuf {
        self.root.join(format!("{id}.{METADATA_EXTENSION}"))
    }

    pub fn background_removed_path(&self, id: &str) -> PathBuf {
        self.root.join(format!("{id}{BACKGROUND_REMOVED_SUFFIX}.png"))
    }

    pub fn jpeg_copy_path(&self, id: &str) -> PathBuf {
        self.artifact_path(id, "jpg")
    }

    pub async fn write_artifact(
        &self,
        id: &str,
        extension: &str,
        bytes: &[u8],
    ) -> Result<PathBuf, StoreError> {
        validate_id(id)?;
        let path = self.artifact_path(id, extension);
        write_file_atomic(&path, bytes).await?;
        debug!(id, path = %path.display(), bytes = bytes.len(), "artifact written");
        Ok(path)
    }

    /// Writes `<id>.json`. The canonical artifact named by
    /// `metadata.format` must already exist.
    pub async fn write_metadata(&self, metadata: &ImageMetadata) -> Result<PathBuf, StoreError> {
        let id = metadata.id.as_str();
        validate_id(id)?;
        let artifact = self.artifact_path(id, &metadata.format);
        if !path_exists(&artifact).await {
            return Err(StoreError::MissingArtifact {
                id: id.to_string(),
                path: artifact,
            });
        }
        let encoded = serde_json::to_vec_pretty(metadata).map_err(|source| StoreError::Encode {
            id: id.to_string(),
            source,
        })?;
        let path = self.metadata_path(id);
        write_file_atomic(&path, &encoded).await?;
        debug!(id, path = %path.display(), "metadata written");
        Ok(path)
    }

    pub async fn read_metadata(&self, id: &str) -> Result<ImageMetadata, StoreError> {
        validate_id(id)?;
        let path = self.metadata_path(id);
        let raw = match fs::read(&path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(id.to_string()))
            }
            Err(err) => return Err(StoreError::io("read", &path, err)),
        };
        let mut metadata: ImageMetadata =
            serde_json::from_slice(&raw).map_err(|source| StoreError::Corrupt {
                id: id.to_string(),
                source,
            })?;
        metadata.id = id.to_string();
        Ok(metadata)
    }

    pub async fn has_artifact(&self, metadata: &ImageMetadata) -> bool {
        path_exists(&self.artifact_path(&metadata.id, &metadata.format)).await
    }

    /// Up to `limit` sidecars with a backing artifact, ids descending.
    pub async fn list_newest_first(&self, limit: usize) -> Result<Vec<ImageMetadata>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut ids = self.sidecar_ids().await?;
        ids.sort_unstable_by(|a, b| b.cmp(a));

        let mut out = Vec::new();
        for id in ids {
            if out.len() >= limit {
                break;
            }
            if let Some(metadata) = self.load_live(&id).await? {
                out.push(metadata);
            }
        }
        Ok(out)
    }

    /// Every sidecar with a backing artifact, in directory order.
    pub async fn scan(&self) -> Result<Vec<ImageMetadata>, StoreError> {
        let mut out = Vec::new();
        for id in self.sidecar_ids().await? {
            if let Some(metadata) = self.load_live(&id).await? {
                out.push(metadata);
            }
        }
        Ok(out)
    }

    /// Image files an id can own besides its sidecar: one canonical
    /// artifact per image extension plus the background-removed rendition.
    pub fn image_paths(&self, id: &str) -> Vec<PathBuf> {
        IMAGE_EXTENSIONS
            .iter()
            .map(|extension| self.artifact_path(id, extension))
            .chain(std::iter::once(self.background_removed_path(id)))
            .collect()
    }

    pub async fn begin_staging(&self, id: &str) -> Result<Staging, StoreError> {
        validate_id(id)?;
        let dir = self
            .root
            .join(format!(".{id}.staging-{}", uuid::Uuid::new_v4().simple()));
        fs::create_dir_all(&dir)
            .await
            .map_err(|err| StoreError::io("create directory", &dir, err))?;
        Ok(Staging {
            id: id.to_string(),
            dir,
        })
    }

    pub async fn write_staged(
        &self,
        staging: &Staging,
        extension: &str,
        bytes: &[u8],
    ) -> Result<PathBuf, StoreError> {
        let path = staging.artifact_path(extension);
        write_file_atomic(&path, bytes).await?;
        Ok(path)
    }

    /// Drops a staged attempt without touching stored files.
    pub async fn abandon(&self, staging: Staging) {
        remove_dir_quietly(&staging.dir).await;
    }

    /// Swaps the staged files in for every image file the id owned before,
    /// then writes `metadata`. The previous files are parked in a hidden
    /// backup directory and moved back if any step fails, so a failed commit
    /// leaves the earlier state exactly as it was.
    pub async fn commit(
        &self,
        staging: Staging,
        metadata: &ImageMetadata,
    ) -> Result<PathBuf, StoreError> {
        let backup = self
            .root
            .join(format!(".{}.backup-{}", staging.id, uuid::Uuid::new_v4().simple()));
        let mut parked = Vec::new();
        let mut placed = Vec::new();
        let outcome = self
            .swap_in(&staging, &backup, metadata, &mut parked, &mut placed)
            .await;

        if outcome.is_err() {
            for path in &placed {
                if let Err(err) = fs::remove_file(path).await {
                    warn!(path = %path.display(), error = %err, "failed to remove uncommitted file");
                }
            }
            for (original, aside) in &parked {
                if let Err(err) = fs::rename(aside, original).await {
                    warn!(path = %original.display(), error = %err, "failed to restore previous file");
                }
            }
        }
        remove_dir_quietly(&backup).await;
        remove_dir_quietly(&staging.dir).await;
        outcome
    }

    async fn swap_in(
        &self,
        staging: &Staging,
        backup: &Path,
        metadata: &ImageMetadata,
        parked: &mut Vec<(PathBuf, PathBuf)>,
        placed: &mut Vec<PathBuf>,
    ) -> Result<PathBuf, StoreError> {
        let staged = staged_file_names(&staging.dir).await?;
        fs::create_dir_all(backup)
            .await
            .map_err(|err| StoreError::io("create directory", backup, err))?;

        for original in self.image_paths(&staging.id) {
            if !path_exists(&original).await {
                continue;
            }
            let Some(name) = original.file_name() else {
                continue;
            };
            let aside = backup.join(name);
            fs::rename(&original, &aside)
                .await
                .map_err(|err| StoreError::io("move aside", &original, err))?;
            parked.push((original, aside));
        }

        for name in staged {
            let target = self.root.join(&name);
            fs::rename(staging.dir.join(&name), &target)
                .await
                .map_err(|err| StoreError::io("move into place", &target, err))?;
            placed.push(target);
        }

        self.write_metadata(metadata).await
    }

    async fn sidecar_ids(&self) -> Result<Vec<String>, StoreError> {
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(StoreError::io("list", &self.root, err)),
        };
        let mut ids = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|err| StoreError::io("list", &self.root, err))?
        {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            let Some(id) = name.strip_suffix(".json") else {
                continue;
            };
            if validate_id(id).is_ok() {
                ids.push(id.to_string());
            }
        }
        Ok(ids)
    }

    /// Loads a sidecar only if its artifact is present. Sidecars that vanish
    /// mid-scan or fail to parse are skipped.
    async fn load_live(&self, id: &str) -> Result<Option<ImageMetadata>, StoreError> {
        let metadata = match self.read_metadata(id).await {
            Ok(metadata) => metadata,
            Err(StoreError::NotFound(_)) => return Ok(None),
            Err(err @ StoreError::Corrupt { .. }) => {
                warn!(id, error = %err, "skipping unreadable sidecar");
                return Ok(None);
            }
            Err(err) => return Err(err),
        };
        if !self.has_artifact(&metadata).await {
            debug!(id, "skipping sidecar without artifact");
            return Ok(None);
        }
        Ok(Some(metadata))
    }
}

/// One generation attempt's files, written to a hidden directory inside the
/// store root until [`ArtifactStore::commit`] moves them into place. Scans
/// ignore hidden entries, so staged files are never listed.
#[derive(Debug)]
pub struct Staging {
    id: String,
    dir: PathBuf,
}

impl Staging {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn artifact_path(&self, extension: &str) -> PathBuf {
        self.dir.join(format!("{}.{extension}", self.id))
    }

    pub fn jpeg_copy_path(&self) -> PathBuf {
        self.artifact_path("jpg")
    }
}

async fn staged_file_names(dir: &Path) -> Result<Vec<String>, StoreError> {
    let mut entries = fs::read_dir(dir)
        .await
        .map_err(|err| StoreError::io("list", dir, err))?;
    let mut names = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|err| StoreError::io("list", dir, err))?
    {
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        if !name.starts_with('.') {
            names.push(name);
        }
    }
    Ok(names)
}

async fn remove_dir_quietly(dir: &Path) {
    match fs::remove_dir_all(dir).await {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => warn!(path = %dir.display(), error = %err, "failed to remove working directory"),
    }
}

async fn path_exists(path: &Path) -> bool {
    fs::try_exists(path).await.unwrap_or(false)
}
