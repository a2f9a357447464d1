//! Image generation engine: provider clients, local post-processing, the
//! video job poller and the [`Engine`] that ties them to the on-disk library.

pub mod config;
pub mod error;
pub mod poller;
pub mod postprocess;
pub mod providers;

mod engine;

pub use config::{BackgroundRemovalConfig, EngineConfig, PollPolicy, ProviderConfig};
pub use engine::{Engine, KeyStatus, VideoRequest, VideoResult};
pub use error::GenerationError;
pub use postprocess::{PostProcessError, PostProcessor};
