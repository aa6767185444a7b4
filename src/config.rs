use std::fs;
use std::path::Path;

use anyhow::{Context as _, Result};
use serde::{Deserialize, Serialize};

use crate::retrieval::rerank::{EngineTag, RerankerModel};
use crate::retrieval::EngineOptions;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub version: u32,
    pub engine: EngineConfig,
    pub rerank: RerankConfig,
    pub providers: ProvidersConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Default result count per query.
    pub limit: usize,
    /// Cosine threshold for the semantic cache layer.
    pub semantic_cache_threshold: f64,
    /// Capacity of each query-cache layer.
    pub cache_capacity: usize,
    pub experimental_mmr: bool,
    pub exploration: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RerankConfig {
    pub enabled: bool,
    /// "ollama" | "openai"
    pub engine: String,
    pub model: String,
    pub timeout_secs: u64,
    /// Attempts per scoring batch before falling back to fused order.
    pub max_attempts: u32,
    /// Base retry delay; doubles on each attempt.
    pub retry_backoff_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ProvidersConfig {
    pub ollama: OllamaProviderConfig,
    pub openai: OpenAiProviderConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OllamaProviderConfig {
    pub base_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenAiProviderConfig {
    pub base_url: String,
    pub api_key_env: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: 1,
            engine: EngineConfig::default(),
            rerank: RerankConfig::default(),
            providers: ProvidersConfig::default(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            limit: 5,
            semantic_cache_threshold: 0.95,
            cache_capacity: 100,
            experimental_mmr: true,
            exploration: true,
        }
    }
}

impl Default for RerankConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            engine: "ollama".to_string(),
            model: "qwen2.5".to_string(),
            timeout_secs: 60,
            max_attempts: 3,
            retry_backoff_ms: 250,
        }
    }
}

impl Default for OllamaProviderConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
        }
    }
}

impl Default for OpenAiProviderConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:1234/v1".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
        }
    }
}

impl Config {
    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            cache_capacity: self.engine.cache_capacity,
            semantic_cache_threshold: self.engine.semantic_cache_threshold,
            experimental_mmr: self.engine.experimental_mmr,
            exploration: self.engine.exploration,
            pool_size: None,
        }
    }

    /// The configured scoring backend, if reranking is enabled and the
    /// engine tag is recognized.
    pub fn reranker_model(&self) -> Option<RerankerModel> {
        if !self.rerank.enabled {
            return None;
        }
        let engine = match EngineTag::parse(&self.rerank.engine) {
            Some(engine) => engine,
            None => {
                tracing::warn!(engine = self.rerank.engine.as_str(), "unknown rerank engine");
                return None;
            }
        };

        let (base_url, api_key_env) = match engine {
            EngineTag::Ollama => (self.providers.ollama.base_url.clone(), String::new()),
            EngineTag::OpenAi => (
                self.providers.openai.base_url.clone(),
                self.providers.openai.api_key_env.clone(),
            ),
        };

        Some(RerankerModel {
            name: self.rerank.model.clone(),
            engine,
            base_url,
            api_key_env,
            timeout_secs: self.rerank.timeout_secs,
            max_attempts: self.rerank.max_attempts,
            retry_backoff_ms: self.rerank.retry_backoff_ms,
        })
    }
}

pub fn load_or_default(config_path: &Path) -> Result<Config> {
    if !config_path.exists() {
        return Ok(Config::default());
    }
    load(config_path)
}

/// Creates the config file with defaults if missing, then loads it.
pub fn ensure_config(config_path: &Path) -> Result<Config> {
    if let Some(parent) = config_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        }
    }

    if config_path.exists() {
        return load(config_path);
    }

    let cfg = Config::default();
    save_config(config_path, &cfg)?;
    Ok(cfg)
}

pub fn save_config(config_path: &Path, cfg: &Config) -> Result<()> {
    let body = toml::to_string_pretty(cfg).context("serialize config")?;
    fs::write(config_path, body).with_context(|| format!("write {}", config_path.display()))?;
    Ok(())
}

fn load(config_path: &Path) -> Result<Config> {
    let body = fs::read_to_string(config_path)
        .with_context(|| format!("read {}", config_path.display()))?;
    let cfg: Config =
        toml::from_str(&body).with_context(|| format!("parse TOML {}", config_path.display()))?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_round_trip_through_toml() {
        let cfg = Config::default();
        let body = toml::to_string_pretty(&cfg).expect("serialize");
        let back: Config = toml::from_str(&body).expect("parse");
        assert_eq!(back.engine.limit, 5);
        assert_eq!(back.engine.cache_capacity, 100);
        assert!(back.engine.experimental_mmr);
    }

    #[test]
    fn partial_config_fills_defaults() {
        let cfg: Config = toml::from_str("[engine]\nlimit = 10\n").expect("parse");
        assert_eq!(cfg.engine.limit, 10);
        assert!((cfg.engine.semantic_cache_threshold - 0.95).abs() < 1e-12);
        assert!(!cfg.rerank.enabled);
    }

    #[test]
    fn reranker_model_requires_enabled_and_known_engine() {
        let mut cfg = Config::default();
        assert!(cfg.reranker_model().is_none());

        cfg.rerank.enabled = true;
        let model = cfg.reranker_model().expect("model");
        assert_eq!(model.name, "qwen2.5");
        assert_eq!(model.base_url, "http://localhost:11434");
        assert_eq!(model.max_attempts, 3);
        assert_eq!(model.retry_backoff_ms, 250);

        cfg.rerank.engine = "mystery".to_string();
        assert!(cfg.reranker_model().is_none());
    }
}
