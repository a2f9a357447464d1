use std::env;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_IMAGE_DIR: &str = "images";
pub const DEFAULT_OPENAI_API_BASE: &str = "https://api.openai.com/v1";
pub const DEFAULT_STABILITY_API_BASE: &str = "https://api.stability.ai";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderConfig {
    pub api_key: Option<String>,
    pub api_base: String,
}

impl ProviderConfig {
    pub fn new(api_base: impl Into<String>) -> Self {
        Self {
            api_key: None,
            api_base: api_base.into(),
        }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    /// Key with surrounding whitespace removed; blank keys count as absent.
    pub fn api_key(&self) -> Option<&str> {
        self.api_key
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }

    pub fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.api_base.trim().trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

/// How the async job poller waits. The interval is fixed (no backoff, no
/// jitter); either cap ends the wait with a timeout failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub max_attempts: Option<u32>,
    pub timeout: Option<Duration>,
}

impl PollPolicy {
    pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(250);
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(600);

    /// Polls until a terminal status arrives, however long that takes.
    pub fn unbounded() -> Self {
        Self {
            interval: Self::DEFAULT_INTERVAL,
            max_attempts: None,
            timeout: None,
        }
    }
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Self::DEFAULT_INTERVAL,
            max_attempts: None,
            timeout: Some(Self::DEFAULT_TIMEOUT),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackgroundRemovalConfig {
    /// Max RGB distance from the estimated background colour that still
    /// counts as background.
    pub tolerance: u8,
}

impl Default for BackgroundRemovalConfig {
    fn default() -> Self {
        Self { tolerance: 40 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub image_dir: PathBuf,
    pub events_path: Option<PathBuf>,
    pub openai: ProviderConfig,
    pub stability: ProviderConfig,
    pub poll: PollPolicy,
    pub background_removal: BackgroundRemovalConfig,
}

impl EngineConfig {
    /// Defaults with no API keys; only the dryrun model works out of the box.
    pub fn new(image_dir: impl Into<PathBuf>) -> Self {
        Self {
            image_dir: image_dir.into(),
            events_path: None,
            openai: ProviderConfig::new(DEFAULT_OPENAI_API_BASE),
            stability: ProviderConfig::new(DEFAULT_STABILITY_API_BASE),
            poll: PollPolicy::default(),
            background_removal: BackgroundRemovalConfig::default(),
        }
    }

    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let value = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let mut config = Self::new(
            value("QUICKIMAGE_IMAGE_DIR").unwrap_or_else(|| DEFAULT_IMAGE_DIR.to_string()),
        );
        config.events_path = value("QUICKIMAGE_EVENTS_PATH").map(PathBuf::from);
        config.openai.api_key = value("OPENAI_API_KEY");
        if let Some(base) = value("OPENAI_API_BASE") {
            config.openai.api_base = base;
        }
        config.stability.api_key = value("STABILITY_API_KEY").or_else(|| value("STABILITY_KEY"));
        if let Some(base) = value("STABILITY_API_BASE") {
            config.stability.api_base = base;
        }
        if let Some(interval) = value("QUICKIMAGE_POLL_INTERVAL_MS").and_then(|raw| raw.parse().ok()) {
            config.poll.interval = Duration::from_millis(interval);
        }
        config.poll.max_attempts =
            value("QUICKIMAGE_POLL_MAX_ATTEMPTS").and_then(|raw| raw.parse().ok());
        if let Some(timeout) = value("QUICKIMAGE_POLL_TIMEOUT_SECS").and_then(|raw| raw.parse::<u64>().ok()) {
            config.poll.timeout = (timeout > 0).then(|| Duration::from_secs(timeout));
        }
        config
    }
}
