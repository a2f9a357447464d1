use thiserror::Error;
use tracing::debug;

use super::{ArtifactStore, StoreError};
use crate::runs::ImageMetadata;

pub const DEFAULT_SEARCH_LIMIT: usize = 100;
pub const DEFAULT_LIST_LIMIT: usize = 50;

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("search query is empty")]
    EmptyQuery,
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SearchOrder {
    /// Order in which the directory scan encountered the sidecars.
    #[default]
    Storage,
    /// Id descending, same rule as [`ArtifactStore::list_newest_first`].
    NewestFirst,
}

/// Prompt search over the sidecars of an [`ArtifactStore`]. There is no
/// persistent index; every query scans the directory.
#[derive(Debug, Clone)]
pub struct SearchIndex {
    store: ArtifactStore,
}

impl SearchIndex {
    pub fn new(store: ArtifactStore) -> Self {
        Self { store }
    }

    /// Case-insensitive substring match of `query` against each prompt.
    pub async fn search(
        &self,
        query: &str,
        limit: usize,
        order: SearchOrder,
    ) -> Result<Vec<ImageMetadata>, SearchError> {
        if query.is_empty() {
            return Err(SearchError::EmptyQuery);
        }
        let needle = query.to_lowercase();
        let mut rows = self.store.scan().await?;
        if order == SearchOrder::NewestFirst {
            rows.sort_unstable_by(|a, b| b.id.cmp(&a.id));
        }
        let matches: Vec<ImageMetadata> = rows
            .into_iter()
            .filter(|row| row.prompt_contains(&needle))
            .take(limit)
            .collect();
        debug!(query, matches = matches.len(), "search finished");
        Ok(matches)
    }
}
