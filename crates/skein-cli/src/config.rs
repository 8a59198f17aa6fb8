//! Configuration file support

use anyhow::Context;
use serde::{Deserialize, Serialize};
use skein_task::TaskConfig;
use std::fs;
use std::path::PathBuf;

pub const DEFAULT_MODEL: &str = "claude-sonnet-4-5";

/// Configuration for skein
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Default model to use
    pub model: Option<String>,
    /// Where task transcripts and checkpoints live
    pub data_dir: Option<PathBuf>,
    /// Custom system prompt file path
    pub system_prompt_file: Option<PathBuf>,
    /// API keys (alternative to environment variables)
    pub api_keys: ApiKeys,
    /// Engine settings, see [`TaskConfig`]
    pub task: TaskConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiKeys {
    pub anthropic: Option<String>,
}

impl Config {
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("skein")
    }

    /// `SKEIN_CONFIG_PATH` wins over the default location
    pub fn config_path() -> PathBuf {
        if let Ok(path) = std::env::var("SKEIN_CONFIG_PATH") {
            return PathBuf::from(path);
        }
        Self::config_dir().join("config.toml")
    }

    /// Load the config file. A missing or unreadable file yields defaults.
    pub fn load() -> Self {
        let path = Self::config_path();
        if !path.exists() {
            return Self::default();
        }

        match fs::read_to_string(&path) {
            Ok(content) => match Self::parse(&content) {
                Ok(config) => config,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "failed to parse config file");
                    Self::default()
                }
            },
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "failed to read config file");
                Self::default()
            }
        }
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        toml::from_str(content).context("invalid config TOML")
    }

    pub fn save(&self) -> anyhow::Result<PathBuf> {
        let path = Self::config_path();
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
        }
        let content = toml::to_string_pretty(self).context("serializing config")?;
        fs::write(&path, content).with_context(|| format!("writing {}", path.display()))?;
        Ok(path)
    }

    /// Create a default config file if it doesn't exist
    pub fn init() -> anyhow::Result<PathBuf> {
        let path = Self::config_path();
        if path.exists() {
            return Ok(path);
        }
        let config = Config {
            model: Some(DEFAULT_MODEL.to_string()),
            ..Default::default()
        };
        config.save()
    }

    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("skein")
        })
    }

    /// Config file first, then `ANTHROPIC_API_KEY`
    pub fn api_key(&self) -> Option<String> {
        self.api_keys
            .anthropic
            .clone()
            .or_else(|| std::env::var("ANTHROPIC_API_KEY").ok())
            .filter(|key| !key.trim().is_empty())
    }

    pub fn system_prompt(&self) -> anyhow::Result<Option<String>> {
        let Some(path) = &self.system_prompt_file else {
            return Ok(None);
        };
        let prompt = fs::read_to_string(path).with_context(|| format!("reading system prompt {}", path.display()))?;
        Ok(Some(prompt))
    }
}

pub fn example_config() -> &'static str {
    r#"# skein configuration file
# Place at ~/.config/skein/config.toml or point SKEIN_CONFIG_PATH at it

model = "claude-sonnet-4-5"

# data_dir = "~/.local/share/skein"
# system_prompt_file = "~/.config/skein/system_prompt.md"

[api_keys]
# anthropic = "sk-ant-..."

# Engine settings. Anything left out keeps its default.
[task]
mode = "code"
rate_limit_seconds = 0
auto_retry = true
consecutive_mistake_limit = 3
enable_checkpoints = true

[task.context]
condense_threshold_percent = 100
"#
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_keeps_defaults() {
        let config = Config::parse(
            r#"
model = "claude-opus-4"

[task]
rate_limit_seconds = 2
"#,
        )
        .unwrap();
        assert_eq!(config.model.as_deref(), Some("claude-opus-4"));
        assert_eq!(config.task.rate_limit_seconds, 2);
        assert_eq!(config.task.mode, "code");
        assert_eq!(config.task.queue.max_size, 10);
    }

    #[test]
    fn test_example_config_parses() {
        let config = Config::parse(example_config()).unwrap();
        assert!(config.task.enable_checkpoints);
    }
}
