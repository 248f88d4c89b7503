//! Environment-driven configuration (§6 "Configuration").
//!
//! Loaded the way the reference CLI loads its config: an optional TOML file
//! overlaid with environment variables, with every field falling back to a
//! documented default.

use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use tracing::{debug, info};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub llm_backend_url: Option<String>,
    pub llm_api_key: Option<String>,
    pub llm_model: String,
    pub llm_mock: bool,
    pub llm_retries: u32,
    pub llm_backoff_base_ms: u64,
    pub embedding_model: String,
    pub embedding_cache_size: usize,
    pub evaluation_cache_size: usize,
    pub max_iterations: u32,
    pub evaluation_mode: String,
    pub quality_threshold: f64,
    pub use_memory: bool,
    pub semantic_default_k: usize,
    pub semantic_min_similarity: f32,
    pub max_decompose_depth: u32,
    pub default_parallelism: usize,
    pub task_timeout_sec: u64,
    pub data_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            llm_backend_url: None,
            llm_api_key: None,
            llm_model: "mock".to_string(),
            llm_mock: true,
            llm_retries: 3,
            llm_backoff_base_ms: 500,
            embedding_model: "mock-embed".to_string(),
            embedding_cache_size: 4096,
            evaluation_cache_size: 4096,
            max_iterations: 5,
            evaluation_mode: "single_judge".to_string(),
            quality_threshold: crate::evaluate::DEFAULT_QUALITY_THRESHOLD,
            use_memory: false,
            semantic_default_k: 5,
            semantic_min_similarity: 0.2,
            max_decompose_depth: 3,
            default_parallelism: num_cpus::get().max(1),
            task_timeout_sec: 600,
            data_dir: dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("taskloom"),
        }
    }
}

impl Config {
    /// Load config from an optional TOML file (`TASKLOOM_CONFIG`, default
    /// `<config_dir>/taskloom/config.toml`) overlaid with environment
    /// variables.
    pub fn load() -> anyhow::Result<Self> {
        info!("loading configuration");
        let config_path = Self::config_path();

        let mut config = if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            debug!(path = %config_path.display(), "read config file");
            toml::from_str(&content)?
        } else {
            Self::default()
        };

        config.apply_env();
        std::fs::create_dir_all(&config.data_dir)?;
        Ok(config)
    }

    fn config_path() -> PathBuf {
        env::var("TASKLOOM_CONFIG").map(PathBuf::from).unwrap_or_else(|_| {
            dirs::config_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("taskloom")
                .join("config.toml")
        })
    }

    fn apply_env(&mut self) {
        if let Ok(v) = env::var("LLM_BACKEND_URL") {
            self.llm_backend_url = Some(v);
        }
        if let Ok(v) = env::var("LLM_API_KEY") {
            self.llm_api_key = Some(v);
        }
        if let Ok(v) = env::var("LLM_MODEL") {
            self.llm_model = v;
        }
        if let Ok(v) = env::var("LLM_MOCK") {
            self.llm_mock = v == "1" || v.eq_ignore_ascii_case("true");
        }
        if let Ok(v) = env::var("LLM_RETRIES").ok().and_then(|s| s.parse().ok()) {
            self.llm_retries = v;
        }
        if let Ok(v) = env::var("LLM_BACKOFF_BASE")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
        {
            self.llm_backoff_base_ms = v;
        }
        if let Ok(v) = env::var("EMBEDDING_MODEL") {
            self.embedding_model = v;
        }
        if let Some(v) = env::var("EMBEDDING_CACHE_SIZE").ok().and_then(|s| s.parse().ok()) {
            self.embedding_cache_size = v;
        }
        if let Some(v) = env::var("EVALUATION_CACHE_SIZE").ok().and_then(|s| s.parse().ok()) {
            self.evaluation_cache_size = v;
        }
        if let Some(v) = env::var("MAX_ITERATIONS").ok().and_then(|s| s.parse().ok()) {
            self.max_iterations = v;
        }
        if let Ok(v) = env::var("EVALUATION_MODE") {
            self.evaluation_mode = v;
        }
        if let Some(v) = env::var("QUALITY_THRESHOLD").ok().and_then(|s| s.parse().ok()) {
            self.quality_threshold = v;
        }
        if let Ok(v) = env::var("USE_MEMORY") {
            self.use_memory = v == "1" || v.eq_ignore_ascii_case("true");
        }
        if let Some(v) = env::var("SEMANTIC_DEFAULT_K").ok().and_then(|s| s.parse().ok()) {
            self.semantic_default_k = v;
        }
        if let Some(v) = env::var("SEMANTIC_MIN_SIMILARITY")
            .ok()
            .and_then(|s| s.parse().ok())
        {
            self.semantic_min_similarity = v;
        }
        if let Some(v) = env::var("MAX_DECOMPOSE_DEPTH").ok().and_then(|s| s.parse().ok()) {
            self.max_decompose_depth = v;
        }
        if let Some(v) = env::var("DEFAULT_PARALLELISM").ok().and_then(|s| s.parse().ok()) {
            self.default_parallelism = v;
        }
        if let Some(v) = env::var("TASK_TIMEOUT_SEC").ok().and_then(|s| s.parse().ok()) {
            self.task_timeout_sec = v;
        }
        if let Ok(v) = env::var("DATA_DIR") {
            self.data_dir = PathBuf::from(v);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_sane_parallelism() {
        let config = Config::default();
        assert!(config.default_parallelism >= 1);
        assert_eq!(config.max_decompose_depth, 3);
        assert!((config.quality_threshold - 0.8).abs() < 1e-9);
    }
}
