//! On-disk image library: one directory of `<id>.<ext>` artifacts with
//! `<id>.json` sidecars, plus derived `<id>-background-removed.png` files.

mod search;
mod store;

pub use search::{SearchError, SearchIndex, SearchOrder, DEFAULT_LIST_LIMIT, DEFAULT_SEARCH_LIMIT};
pub use store::{validate_id, write_file_atomic, ArtifactStore, Staging, StoreError};
