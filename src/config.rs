use std::{collections::BTreeMap, path::{Path, PathBuf}, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{catalog::{Catalog, ModelSpec}, error::ConfigError};

pub const DEFAULT_MODEL_DIR: &str = "app/src/main/assets/models";
pub const DEFAULT_MODEL_URL: &str = "https://huggingface.co/ggerganov/whisper.cpp/resolve/main";
pub const DEFAULT_MODEL_NAMES: [&str; 4] = [
    "ggml-tiny-q5_1.bin",
    "ggml-base-q5_1.bin",
    "ggml-tiny.en-q5_1.bin",
    "ggml-silero-v5.1.2.bin",
];

/// Built-in overrides: (model name, environment key, default URL).
pub const DEFAULT_OVERRIDES: [(&str, &str, &str); 1] = [(
    "ggml-silero-v5.1.2.bin",
    "SILERO_URL",
    "https://huggingface.co/ggml-org/whisper-vad/resolve/main/ggml-silero-v5.1.2.bin",
)];

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(20);
pub const DEFAULT_STALL_WINDOW: Duration = Duration::from_secs(30);
pub const DEFAULT_MIN_RATE: u64 = 1024;
pub const DEFAULT_BACKOFF_UNIT: Duration = Duration::from_secs(1);

/// Resolved settings for one fetch session.
#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub model_dir: PathBuf,
    pub model_url: String,
    pub model_names: Vec<String>,
    pub overrides: BTreeMap<String, String>,
    pub max_attempts: u32,
    pub connect_timeout: Duration,
    pub stall_window: Duration,
    /// Bytes per second the transfer must sustain over `stall_window`.
    pub min_rate: u64,
    pub backoff_unit: Duration,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            model_dir: PathBuf::from(DEFAULT_MODEL_DIR),
            model_url: DEFAULT_MODEL_URL.to_string(),
            model_names: DEFAULT_MODEL_NAMES.iter().map(|s| s.to_string()).collect(),
            overrides: DEFAULT_OVERRIDES
                .iter()
                .map(|(name, _, url)| (name.to_string(), url.to_string()))
                .collect(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            stall_window: DEFAULT_STALL_WINDOW,
            min_rate: DEFAULT_MIN_RATE,
            backoff_unit: DEFAULT_BACKOFF_UNIT,
        }
    }
}

impl FetchConfig {
    pub fn catalog(&self) -> Catalog {
        Catalog::new(self.model_url.clone(), self.overrides.clone())
    }

    pub fn specs(&self) -> Result<Vec<ModelSpec>, ConfigError> {
        self.catalog().specs(self.model_names.as_slice())
    }
}

/// On-disk TOML configuration. Every field is optional and only replaces the
/// corresponding default when present.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub model_dir: Option<PathBuf>,
    pub model_url: Option<String>,
    pub models: Option<Vec<String>>,
    pub overrides: BTreeMap<String, String>,
    pub max_attempts: Option<u32>,
    pub connect_timeout_secs: Option<u64>,
    pub stall_window_secs: Option<u64>,
    pub min_rate_bytes_per_sec: Option<u64>,
    pub backoff_unit_ms: Option<u64>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;
        let cfg: FileConfig = toml::from_str(&data)?;
        Ok(cfg)
    }
}

/// Layers configuration: defaults, then file, then environment, then explicit
/// values (CLI flags). Later layers win.
#[derive(Debug, Clone, Default)]
pub struct ConfigBuilder {
    config: FetchConfig,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn file(mut self, file: FileConfig) -> Self {
        let c = &mut self.config;
        if let Some(dir) = file.model_dir { c.model_dir = dir; }
        if let Some(url) = file.model_url { c.model_url = url; }
        if let Some(models) = file.models { c.model_names = models; }
        c.overrides.extend(file.overrides);
        if let Some(n) = file.max_attempts { c.max_attempts = n; }
        if let Some(s) = file.connect_timeout_secs { c.connect_timeout = Duration::from_secs(s); }
        if let Some(s) = file.stall_window_secs { c.stall_window = Duration::from_secs(s); }
        if let Some(r) = file.min_rate_bytes_per_sec { c.min_rate = r; }
        if let Some(ms) = file.backoff_unit_ms { c.backoff_unit = Duration::from_millis(ms); }
        self
    }

    /// Apply `MODEL_DIR`, `MODEL_URL`, `MODEL_NAMES` and the per-override URL
    /// keys. The lookup is injected so callers decide where values come from.
    pub fn env<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let c = &mut self.config;
        if let Some(dir) = get("MODEL_DIR") { c.model_dir = PathBuf::from(dir); }
        if let Some(url) = get("MODEL_URL") { c.model_url = url; }
        if let Some(names) = get("MODEL_NAMES") {
            c.model_names = names.split_whitespace().map(str::to_string).collect();
        }
        for (name, key, _) in DEFAULT_OVERRIDES {
            if let Some(url) = get(key) {
                c.overrides.insert(name.to_string(), url);
            }
        }
        self
    }

    pub fn model_dir(mut self, dir: Option<PathBuf>) -> Self {
        if let Some(dir) = dir { self.config.model_dir = dir; }
        self
    }

    pub fn model_url(mut self, url: Option<String>) -> Self {
        if let Some(url) = url { self.config.model_url = url; }
        self
    }

    pub fn model_names(mut self, names: Vec<String>) -> Self {
        if !names.is_empty() { self.config.model_names = names; }
        self
    }

    /// Parse `NAME=URL` pairs and add them to the override table.
    pub fn overrides<S: AsRef<str>>(mut self, pairs: &[S]) -> Result<Self, ConfigError> {
        for pair in pairs {
            let pair = pair.as_ref();
            match pair.split_once('=') {
                Some((name, url)) if !name.is_empty() && !url.is_empty() => {
                    self.config.overrides.insert(name.to_string(), url.to_string());
                }
                _ => return Err(ConfigError::InvalidOverride(pair.to_string())),
            }
        }
        Ok(self)
    }

    pub fn build(self) -> Result<FetchConfig, ConfigError> {
        if self.config.max_attempts == 0 {
            return Err(ConfigError::ZeroAttempts);
        }
        Ok(self.config)
    }
}
