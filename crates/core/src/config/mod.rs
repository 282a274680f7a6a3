use crate::llm::SamplingConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

fn default_temperature() -> f32 {
    0.7
}

fn default_top_p() -> f32 {
    0.9
}

fn default_max_tokens() -> u32 {
    3000
}

fn default_timeout() -> u64 {
    600
}

fn default_backend_retries() -> u32 {
    3
}

fn default_retry_delay() -> u64 {
    2
}

fn default_min_chapters() -> u32 {
    10
}

fn default_volume_count() -> u32 {
    1
}

fn default_use_master_outline() -> bool {
    true
}

fn default_word_count() -> u32 {
    3000
}

fn default_max_attempts() -> u32 {
    10
}

fn default_step_limit() -> usize {
    1000
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to access config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// 一个可选的文本生成后端档案，按 `interface_format` 分发到具体适配器。
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct LlmConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub interface_format: String,
    #[serde(default)]
    pub model_name: String,
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default = "default_backend_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay")]
    pub retry_delay: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: String::new(),
            interface_format: String::new(),
            model_name: String::new(),
            timeout: default_timeout(),
            max_retries: default_backend_retries(),
            retry_delay: default_retry_delay(),
        }
    }
}

impl LlmConfig {
    pub fn is_meaningful(&self) -> bool {
        !(self.api_key.is_empty()
            && self.base_url.is_empty()
            && self.interface_format.is_empty()
            && self.model_name.is_empty())
    }
}

fn default_sampling() -> SamplingConfig {
    SamplingConfig {
        max_tokens: default_max_tokens(),
        temperature: default_temperature(),
        top_p: default_top_p(),
    }
}

/// 每个内容代理各自的采样参数。
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AgentProfiles {
    #[serde(default = "default_sampling")]
    pub outline: SamplingConfig,
    #[serde(default = "default_sampling")]
    pub character: SamplingConfig,
    #[serde(default = "default_sampling")]
    pub writer: SamplingConfig,
    #[serde(default = "default_sampling")]
    pub reflect: SamplingConfig,
    #[serde(default = "default_sampling")]
    pub entity: SamplingConfig,
}

impl Default for AgentProfiles {
    fn default() -> Self {
        Self {
            outline: default_sampling(),
            character: default_sampling(),
            writer: default_sampling(),
            reflect: default_sampling(),
            entity: default_sampling(),
        }
    }
}

/// 生成范围参数，在工作流构建时固定。
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct GenerationConfig {
    #[serde(default = "default_min_chapters")]
    pub min_chapters: u32,
    #[serde(default = "default_volume_count")]
    pub volume_count: u32,
    #[serde(default = "default_use_master_outline")]
    pub use_master_outline: bool,
    #[serde(default = "default_word_count")]
    pub word_count: u32,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_step_limit")]
    pub step_limit: usize,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            min_chapters: default_min_chapters(),
            volume_count: default_volume_count(),
            use_master_outline: default_use_master_outline(),
            word_count: default_word_count(),
            max_attempts: default_max_attempts(),
            step_limit: default_step_limit(),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct PromptConfig {
    #[serde(default)]
    pub custom_directories: Vec<PathBuf>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct RecentUsage {
    #[serde(default)]
    pub last_llm_interface: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub llm_profiles: BTreeMap<String, LlmConfig>,
    #[serde(default)]
    pub agents: AgentProfiles,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub prompts: PromptConfig,
    #[serde(default)]
    pub recent: RecentUsage,
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_llm_profile(&self, name: &str) -> Option<&LlmConfig> {
        self.llm_profiles.get(name)
    }

    pub fn upsert_llm_profile<S: Into<String>>(&mut self, name: S, profile: LlmConfig) {
        self.llm_profiles.insert(name.into(), profile);
    }

    pub fn primary_llm_profile(&self) -> Option<(&String, &LlmConfig)> {
        self.llm_profiles.iter().next()
    }

    pub fn from_json_str(input: &str) -> Result<Self, ConfigError> {
        if input.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_json::from_str(input)?)
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let data = fs::read_to_string(path)?;
        Self::from_json_str(&data)
    }

    pub fn to_path(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let serialized = serde_json::to_string_pretty(self)?;
        fs::write(path, serialized)?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
    config: Config,
}

impl ConfigStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let config = if path.exists() {
            Config::from_path(&path)?
        } else {
            Config::default()
        };
        Ok(Self { path, config })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    pub fn save(&self) -> Result<(), ConfigError> {
        self.config.to_path(&self.path)
    }

    pub fn touch_llm_interface<S: Into<String>>(&mut self, name: S) {
        self.config.recent.last_llm_interface = Some(name.into());
    }

    pub fn last_llm_interface(&self) -> Option<&str> {
        self.config
            .recent
            .last_llm_interface
            .as_deref()
            .filter(|name| self.config.llm_profiles.contains_key(*name))
    }

    /// 最近使用的接口失效时回退到第一个可用档案。
    pub fn ensure_recent_defaults(&mut self) {
        let valid = self
            .config
            .recent
            .last_llm_interface
            .as_ref()
            .map(|name| self.config.llm_profiles.contains_key(name))
            == Some(true);
        if !valid {
            self.config.recent.last_llm_interface =
                self.config.llm_profiles.keys().next().cloned();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn parses_config_with_defaults() {
        let json = r#"{
            "llm_profiles": {
                "deepseek": {
                    "api_key": "sk-123",
                    "interface_format": "DeepSeek",
                    "model_name": "deepseek-chat"
                }
            },
            "generation": {"min_chapters": 24, "volume_count": 3}
        }"#;

        let config = Config::from_json_str(json).unwrap();
        let profile = config.get_llm_profile("deepseek").unwrap();
        assert_eq!(profile.max_retries, 3);
        assert_eq!(config.generation.min_chapters, 24);
        assert!(config.generation.use_master_outline);
        assert_eq!(config.agents.writer.max_tokens, 3000);
    }

    #[test]
    fn empty_input_yields_default_config() {
        let config = Config::from_json_str("  ").unwrap();
        assert!(config.llm_profiles.is_empty());
        assert_eq!(config.generation.step_limit, 1000);
    }

    #[test]
    fn store_persists_and_reopens() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("config.json");

        let mut store = ConfigStore::open(path.clone()).unwrap();
        store
            .config_mut()
            .upsert_llm_profile("ollama", LlmConfig::default());
        store.touch_llm_interface("ollama");
        store.save().unwrap();

        let store = ConfigStore::open(path).unwrap();
        assert_eq!(store.last_llm_interface(), Some("ollama"));
    }

    #[test]
    fn recent_defaults_backfill_first_profile() {
        let mut store = ConfigStore::open(PathBuf::from("/nonexistent/config.json")).unwrap();
        store
            .config_mut()
            .upsert_llm_profile("openai", LlmConfig::default());
        store.ensure_recent_defaults();
        assert_eq!(store.last_llm_interface(), Some("openai"));
    }
}
