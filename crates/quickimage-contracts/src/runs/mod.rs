mod request;
mod result;
mod sidecar;

pub use request::{BackgroundMode, GenerationRequest, PostProcessOptions, ProviderOptions};
pub use result::{FailureKind, FailureReport, GenerationResult};
pub use sidecar::{ImageMetadata, METADATA_SCHEMA_VERSION};
