use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::adapters::HostConfig;
use crate::core::{ParseOptions, PrefetchConfig, DEFAULT_CACHE_CAPACITY};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,

    #[serde(default = "default_prefetch_ahead")]
    pub prefetch_ahead: usize,

    #[serde(default = "default_prefetch_concurrency")]
    pub prefetch_concurrency: usize,

    #[serde(default)]
    pub skip_threshold: usize,

    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,

    pub token: Option<String>,
    pub parse_endpoint: Option<String>,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache_capacity: default_cache_capacity(),
            prefetch_ahead: default_prefetch_ahead(),
            prefetch_concurrency: default_prefetch_concurrency(),
            skip_threshold: 0,
            api_base_url: default_api_base_url(),
            token: None,
            parse_endpoint: None,
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        for name in [".reviewlens.yml", ".reviewlens.yaml"] {
            let path = PathBuf::from(name);
            if path.exists() {
                return Self::load_from(&path);
            }
        }

        if let Some(home_dir) = dirs::home_dir() {
            let home_config = home_dir.join(".reviewlens.yml");
            if home_config.exists() {
                return Self::load_from(&home_config);
            }
        }

        Ok(Config::default())
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        Ok(config)
    }

    pub fn merge_with_cli(&mut self, cli_token: Option<String>, cli_parse_endpoint: Option<String>) {
        if let Some(token) = cli_token {
            self.token = Some(token);
        }
        if let Some(endpoint) = cli_parse_endpoint {
            self.parse_endpoint = Some(endpoint);
        }
    }

    pub fn normalize(&mut self) {
        self.cache_capacity = self.cache_capacity.max(1);
        self.prefetch_concurrency = self.prefetch_concurrency.max(1);
        self.request_timeout_secs = self.request_timeout_secs.max(1);
        if self.api_base_url.trim().is_empty() {
            self.api_base_url = default_api_base_url();
        }
    }

    pub fn host_config(&self) -> HostConfig {
        HostConfig {
            api_base_url: self.api_base_url.clone(),
            token: self.token.clone(),
            timeout_secs: self.request_timeout_secs,
        }
    }

    pub fn parse_options(&self) -> ParseOptions {
        ParseOptions {
            skip_threshold: self.skip_threshold,
        }
    }

    pub fn prefetch(&self) -> PrefetchConfig {
        PrefetchConfig {
            ahead: self.prefetch_ahead,
            concurrency: self.prefetch_concurrency,
        }
    }
}

fn default_cache_capacity() -> usize {
    DEFAULT_CACHE_CAPACITY
}

fn default_prefetch_ahead() -> usize {
    PrefetchConfig::default().ahead
}

fn default_prefetch_concurrency() -> usize {
    PrefetchConfig::default().concurrency
}

fn default_api_base_url() -> String {
    "https://api.github.com".to_string()
}

fn default_request_timeout_secs() -> u64 {
    30
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "cache_capacity: 20\nskip_threshold: 3\nparse_endpoint: http://localhost:8080/parse").unwrap();

        let config = Config::load_from(file.path()).unwrap();
        assert_eq!(config.cache_capacity, 20);
        assert_eq!(config.skip_threshold, 3);
        assert_eq!(config.prefetch_ahead, 5);
        assert_eq!(config.prefetch_concurrency, 3);
        assert_eq!(config.parse_endpoint.as_deref(), Some("http://localhost:8080/parse"));
        assert_eq!(config.api_base_url, "https://api.github.com");
    }

    #[test]
    fn test_invalid_file_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "cache_capacity: [not, a, number]").unwrap();
        assert!(Config::load_from(file.path()).is_err());
    }

    #[test]
    fn test_merge_and_normalize() {
        let mut config = Config {
            cache_capacity: 0,
            prefetch_concurrency: 0,
            api_base_url: "  ".to_string(),
            ..Config::default()
        };
        config.merge_with_cli(Some("cli-token".to_string()), None);
        config.normalize();

        assert_eq!(config.cache_capacity, 1);
        assert_eq!(config.prefetch().concurrency, 1);
        assert_eq!(config.api_base_url, "https://api.github.com");
        assert_eq!(config.host_config().token.as_deref(), Some("cli-token"));
        assert!(config.parse_endpoint.is_none());
    }
}
