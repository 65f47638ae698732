use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use wpg_engine::{PipelineConfig, SyncConfig, DEFAULT_DATASET_ID, DEFAULT_HEIGHT, DEFAULT_WIDTH};
use wpg_provider_adapter::DEFAULT_PROVIDER_TIMEOUT;

pub const LOCAL_CONFIG_FILE: &str = "wpg.toml";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub data_dir: PathBuf,
    pub dataset_id: String,
    pub mirror_dir: Option<PathBuf>,
    pub timeout_secs: u64,
    pub image: ImageConfig,
    pub prompts: PromptConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageConfig {
    pub url_template: Option<String>,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptConfig {
    pub command: Option<String>,
    pub file: Option<PathBuf>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            dataset_id: DEFAULT_DATASET_ID.to_string(),
            mirror_dir: None,
            timeout_secs: DEFAULT_PROVIDER_TIMEOUT.as_secs(),
            image: ImageConfig::default(),
            prompts: PromptConfig::default(),
        }
    }
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            url_template: None,
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
        }
    }
}

impl AppConfig {
    /// Explicit path, else `./wpg.toml`, else `<config dir>/wpg/config.toml`,
    /// else defaults. Returns the file actually read.
    pub fn load(explicit: Option<&Path>) -> Result<(Self, Option<PathBuf>)> {
        let path = match explicit {
            Some(path) => {
                if !path.is_file() {
                    bail!("config file {} does not exist", path.display());
                }
                Some(path.to_path_buf())
            }
            None => [
                Some(PathBuf::from(LOCAL_CONFIG_FILE)),
                dirs::config_dir().map(|dir| dir.join("wpg").join("config.toml")),
            ]
            .into_iter()
            .flatten()
            .find(|candidate| candidate.is_file()),
        };

        let config = match &path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        Ok((config, path))
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        toml::from_str(&contents).with_context(|| format!("Failed to parse {}", path.display()))
    }

    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        let lookup = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(value) = lookup("WPG_DATA_DIR") {
            self.data_dir = PathBuf::from(value);
        }
        if let Some(value) = lookup("WPG_DATASET_ID") {
            self.dataset_id = value;
        }
        if let Some(value) = lookup("WPG_MIRROR_DIR") {
            self.mirror_dir = Some(PathBuf::from(value));
        }
        if let Some(value) = lookup("IMAGE_GENERATOR_URL_TEMPLATE") {
            self.image.url_template = Some(value);
        }
        if let Some(value) = lookup("WPG_PROMPT_COMMAND") {
            self.prompts.command = Some(value);
        }
        if let Some(value) = lookup("WPG_PROMPTS_FILE") {
            self.prompts.file = Some(PathBuf::from(value));
        }
        if let Some(value) = lookup("WPG_TIMEOUT_SECS") {
            self.timeout_secs = value
                .trim()
                .parse()
                .with_context(|| format!("WPG_TIMEOUT_SECS must be whole seconds, got {value:?}"))?;
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            width: self.image.width,
            height: self.image.height,
        }
    }

    pub fn sync_config(&self) -> SyncConfig {
        SyncConfig {
            dataset_id: self.dataset_id.clone(),
        }
    }
}
