//! Configuration system (layered: explicit values > env > TOML file > defaults).

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::agent_loop::LoopLimits;
use crate::checkpoint::{CheckpointStore, FileCheckpointStore, MemoryCheckpointStore};
use crate::error::ParleyError;
use crate::policy::ToolPolicy;
use crate::types::GenerationSettings;

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant";
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";
const CONFIG_FILE_NAME: &str = "config.toml";

/// `~/.parley`, or `.parley` when no home directory is known.
pub fn default_data_dir() -> PathBuf {
    directories::UserDirs::new()
        .map(|dirs| dirs.home_dir().join(".parley"))
        .unwrap_or_else(|| PathBuf::from(".parley"))
}

/// Root configuration.
///
/// ```toml
/// system_prompt = "You are a helpful assistant"
///
/// [model]
/// name = "gpt-4o-mini"
/// temperature = 0.2
///
/// [limits]
/// max_iterations = 10
/// tool_timeout_ms = 30000
///
/// [checkpoint]
/// backend = "file"
///
/// [policy]
/// admin = ["*"]
/// user = ["get_price"]
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParleyConfig {
    pub system_prompt: String,
    pub model: ModelConfig,
    pub limits: LoopLimits,
    pub checkpoint: CheckpointConfig,
    pub policy: ToolPolicy,
}

impl Default for ParleyConfig {
    fn default() -> Self {
        Self {
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            model: ModelConfig::default(),
            limits: LoopLimits::default(),
            checkpoint: CheckpointConfig::default(),
            policy: ToolPolicy::default(),
        }
    }
}

/// Model adapter settings.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub name: String,
    /// Never written back out.
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    #[serde(flatten)]
    pub settings: GenerationSettings,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_MODEL.to_string(),
            api_key: None,
            base_url: None,
            settings: GenerationSettings::default(),
        }
    }
}

impl fmt::Debug for ModelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelConfig")
            .field("name", &self.name)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("base_url", &self.base_url)
            .field("settings", &self.settings)
            .finish()
    }
}

/// Which checkpoint engine to open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum CheckpointBackend {
    Memory,
    #[default]
    File,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    pub backend: CheckpointBackend,
    /// Session directory for the file backend. Defaults to `~/.parley/sessions`.
    pub dir: Option<PathBuf>,
}

impl CheckpointConfig {
    /// Open the configured store.
    pub fn open(&self) -> Arc<dyn CheckpointStore> {
        match self.backend {
            CheckpointBackend::Memory => Arc::new(MemoryCheckpointStore::new()),
            CheckpointBackend::File => Arc::new(FileCheckpointStore::new(
                self.dir.clone().unwrap_or_else(FileCheckpointStore::default_dir),
            )),
        }
    }
}

impl ParleyConfig {
    /// Load `.env`, then the TOML file (the given path, else
    /// `~/.parley/config.toml` when present), then environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ParleyError> {
        let _ = dotenvy::dotenv(); // load .env if present, ignore error

        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => {
                let default_path = default_data_dir().join(CONFIG_FILE_NAME);
                if default_path.is_file() {
                    Self::from_file(&default_path)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_env_from(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ParleyError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ParleyError::Configuration(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&raw)
            .map_err(|e| ParleyError::Configuration(format!("{}: {e}", path.display())))
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ParleyError> {
        toml::from_str(raw).map_err(|e| ParleyError::Configuration(e.to_string()))
    }

    /// Apply environment overrides, reading variables through `lookup`.
    ///
    /// Recognised: `OPENAI_API_KEY`, `OPENAI_BASE_URL`, `PARLEY_MODEL`,
    /// `PARLEY_SYSTEM_PROMPT`, `PARLEY_MAX_ITERATIONS`,
    /// `PARLEY_MODEL_TIMEOUT_MS`, `PARLEY_TOOL_TIMEOUT_MS`,
    /// `PARLEY_STRICT_TOOLS`, `PARLEY_CHECKPOINT`, `PARLEY_DATA_DIR`.
    pub fn apply_env_from(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ParleyError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(key) = get("OPENAI_API_KEY") {
            self.model.api_key = Some(key);
        }
        if let Some(url) = get("OPENAI_BASE_URL") {
            self.model.base_url = Some(url);
        }
        if let Some(name) = get("PARLEY_MODEL") {
            self.model.name = name;
        }
        if let Some(prompt) = get("PARLEY_SYSTEM_PROMPT") {
            self.system_prompt = prompt;
        }
        if let Some(v) = get("PARLEY_MAX_ITERATIONS") {
            self.limits.max_iterations = parse_env("PARLEY_MAX_ITERATIONS", &v)?;
        }
        if let Some(v) = get("PARLEY_MODEL_TIMEOUT_MS") {
            self.limits.model_timeout_ms = parse_env("PARLEY_MODEL_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = get("PARLEY_TOOL_TIMEOUT_MS") {
            self.limits.tool_timeout_ms = parse_env("PARLEY_TOOL_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = get("PARLEY_STRICT_TOOLS") {
            self.limits.strict_tool_resolution = parse_env("PARLEY_STRICT_TOOLS", &v)?;
        }
        if let Some(v) = get("PARLEY_CHECKPOINT") {
            self.checkpoint.backend = parse_env("PARLEY_CHECKPOINT", &v)?;
        }
        if let Some(dir) = get("PARLEY_DATA_DIR") {
            self.checkpoint.dir = Some(PathBuf::from(dir).join("sessions"));
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ParleyError> {
        if self.model.name.trim().is_empty() {
            return Err(ParleyError::Configuration("model name is empty".into()));
        }
        if self.limits.max_iterations == 0 {
            return Err(ParleyError::Configuration(
                "limits.max_iterations must be at least 1".into(),
            ));
        }
        self.policy.validate()
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ParleyError> {
    value
        .trim()
        .parse()
        .map_err(|_| ParleyError::Configuration(format!("{key} has invalid value '{value}'")))
}
