//! Application configuration, persisted as JSON.

use std::path::{Path, PathBuf};

use anyhow::Context as _;
use llama_bridge::{ContextParams, ModelParams, SamplerParams};
use serde::{Deserialize, Serialize};

/// Global configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Model used when a command is given none.
    #[serde(default)]
    pub model: Option<PathBuf>,
    #[serde(default = "default_ctx_size")]
    pub ctx_size: u32,
    /// Inference threads (unset = all cores).
    #[serde(default)]
    pub threads: Option<i32>,
    #[serde(default)]
    pub n_gpu_layers: i32,
    #[serde(default = "default_sampler")]
    pub sampler: SamplerParams,
}

fn default_host() -> String {
    "127.0.0.1".into()
}
fn default_port() -> u16 {
    8080
}
fn default_ctx_size() -> u32 {
    2048
}
fn default_sampler() -> SamplerParams {
    SamplerParams::default()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            model: None,
            ctx_size: default_ctx_size(),
            threads: None,
            n_gpu_layers: 0,
            sampler: default_sampler(),
        }
    }
}

impl AppConfig {
    /// `~/.config/llama-bridge/config.json` on Linux.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("llama-bridge")
            .join("config.json")
    }

    /// Load from `path`, or return defaults if the file doesn't exist.
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
    }

    /// Persist to `path`, creating parent directories.
    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let data = serde_json::to_string_pretty(self)?;
        std::fs::write(path, data).with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }

    /// Update a single key from its string form. `none` clears optional keys.
    pub fn set(&mut self, key: &str, value: &str) -> anyhow::Result<()> {
        match key {
            "host" => self.host = value.to_string(),
            "port" => self.port = value.parse()?,
            "model" => self.model = optional(value).map(PathBuf::from),
            "ctx_size" => self.ctx_size = value.parse()?,
            "threads" => self.threads = optional(value).map(str::parse::<i32>).transpose()?,
            "n_gpu_layers" => self.n_gpu_layers = value.parse()?,
            "temperature" => self.sampler.temperature = value.parse()?,
            "top_p" => self.sampler.top_p = value.parse()?,
            "top_k" => self.sampler.top_k = value.parse()?,
            "repetition_penalty" => self.sampler.repetition_penalty = value.parse()?,
            "repeat_last_n" => self.sampler.repeat_last_n = value.parse()?,
            "max_tokens" => self.sampler.max_tokens = value.parse()?,
            "seed" => self.sampler.seed = optional(value).map(str::parse::<u64>).transpose()?,
            _ => anyhow::bail!("Unknown config key: {key}"),
        }
        self.sampler.validate()?;
        Ok(())
    }

    pub fn model_params(&self) -> ModelParams {
        ModelParams {
            n_gpu_layers: self.n_gpu_layers,
            ..Default::default()
        }
    }

    pub fn context_params(&self) -> ContextParams {
        let defaults = ContextParams::default();
        ContextParams {
            n_ctx: self.ctx_size,
            n_threads: self.threads.unwrap_or(defaults.n_threads),
            ..defaults
        }
    }
}

fn optional(value: &str) -> Option<&str> {
    match value {
        "" | "none" | "null" => None,
        v => Some(v),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = AppConfig::load_from(&dir.path().join("config.json")).unwrap();
        assert_eq!(cfg, AppConfig::default());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let mut cfg = AppConfig::default();
        cfg.set("port", "9090").unwrap();
        cfg.set("model", "/models/tiny.gguf").unwrap();
        cfg.set("seed", "7").unwrap();
        cfg.save_to(&path).unwrap();

        let loaded = AppConfig::load_from(&path).unwrap();
        assert_eq!(loaded.port, 9090);
        assert_eq!(loaded.model, Some(PathBuf::from("/models/tiny.gguf")));
        assert_eq!(loaded.sampler.seed, Some(7));
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"port": 1234, "sampler": {"temperature": 0.0}}"#).unwrap();

        let cfg = AppConfig::load_from(&path).unwrap();
        assert_eq!(cfg.port, 1234);
        assert_eq!(cfg.host, "127.0.0.1");
        assert_eq!(cfg.sampler.temperature, 0.0);
        assert_eq!(cfg.sampler.top_k, SamplerParams::default().top_k);
    }

    #[test]
    fn test_set_rejects_unknown_and_invalid_values() {
        let mut cfg = AppConfig::default();
        assert!(cfg.set("colour", "blue").is_err());
        assert!(cfg.set("port", "not-a-port").is_err());
        assert!(cfg.set("temperature", "-1").is_err());
    }

    #[test]
    fn test_none_clears_optional_keys() {
        let mut cfg = AppConfig::default();
        cfg.set("threads", "8").unwrap();
        assert_eq!(cfg.context_params().n_threads, 8);
        cfg.set("threads", "none").unwrap();
        assert_eq!(cfg.threads, None);
    }
}
