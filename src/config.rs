use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ToolConfig {
    /// Wait budget for callback-completed verbs, in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Wait budget for migration phases; unbounded when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub migration_timeout_ms: Option<u64>,
    #[serde(default)]
    pub backend: Backend,
    #[serde(default = "default_format")]
    pub format: OutputFormat,
    #[serde(default = "default_history")]
    pub history: bool,
    /// Exit the shell on the first protocol violation.
    #[serde(default)]
    pub fail_fast: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    Auto,
    Vmcompute,
    Sim,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Table,
    Json,
}

fn default_timeout_ms() -> u64 {
    5000
}

fn default_format() -> OutputFormat {
    OutputFormat::Table
}

fn default_history() -> bool {
    true
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            migration_timeout_ms: None,
            backend: Backend::default(),
            format: default_format(),
            history: default_history(),
            fail_fast: false,
        }
    }
}

impl ToolConfig {
    /// Load `~/.hcstool/config.toml`, writing the defaults there on first use.
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;

        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            let config = Self::default();
            config.save_to(&config_path)?;
            Ok(config)
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let contents =
            fs::read_to_string(path).context(format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&contents).context(format!("Failed to parse config file: {}", path.display()))
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .context(format!("Failed to create config directory: {}", parent.display()))?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(path, contents).context(format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn migration_timeout(&self) -> Option<Duration> {
        self.migration_timeout_ms.map(Duration::from_millis)
    }

    fn config_path() -> Result<PathBuf> {
        let home = dirs::home_dir().context("Failed to determine home directory")?;
        Ok(home.join(".hcstool").join("config.toml"))
    }
}

/// Where the shell keeps its line history, if the platform has a data dir.
pub fn history_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "hcstool").map(|dirs| dirs.data_dir().join("history.txt"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ToolConfig::default();
        assert_eq!(config.timeout(), Duration::from_secs(5));
        assert_eq!(config.migration_timeout(), None);
        assert_eq!(config.backend, Backend::Auto);
        assert_eq!(config.format, OutputFormat::Table);
        assert!(config.history);
        assert!(!config.fail_fast);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let config: ToolConfig = toml::from_str("backend = \"sim\"\nfail_fast = true\n").unwrap();
        assert_eq!(config.backend, Backend::Sim);
        assert!(config.fail_fast);
        assert_eq!(config.timeout_ms, 5000);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let config = ToolConfig {
            timeout_ms: 250,
            migration_timeout_ms: Some(60_000),
            format: OutputFormat::Json,
            ..ToolConfig::default()
        };
        config.save_to(&path).unwrap();

        assert_eq!(ToolConfig::load_from(&path).unwrap(), config);
    }

    #[test]
    fn test_bad_file_names_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "timeout_ms = \"soon\"").unwrap();

        let err = ToolConfig::load_from(&path).unwrap_err();
        assert!(err.to_string().contains("config.toml"));
    }
}
