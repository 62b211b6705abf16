use serde::Deserialize;
use std::env;

/// Workspace-wide settings. `SURGE_CONFIG` (a YAML path) wins outright,
/// otherwise individual env vars override the defaults.
#[derive(Debug, Clone, Deserialize)]
pub struct SurgeConfig {
    pub ollama_url: String,
    pub listen_addr: String,
    pub default_model: String,
    pub run_timeout_secs: u64,
    pub sample_interval_ms: u64,
}

impl Default for SurgeConfig {
    fn default() -> Self {
        Self {
            ollama_url: "http://localhost:11434".into(),
            listen_addr: "0.0.0.0:8000".into(),
            default_model: "qwen3:4b-q8_0".into(),
            run_timeout_secs: 60,
            sample_interval_ms: 200,
        }
    }
}

impl SurgeConfig {
    pub fn load() -> Self {
        if let Ok(path) = env::var("SURGE_CONFIG") {
            let Ok(text) = std::fs::read_to_string(path) else { return Self::default() };
            let Ok(cfg) = serde_yaml::from_str::<SurgeConfig>(&text) else { return Self::default() };
            return cfg;
        }
        let mut cfg = Self::default();
        if let Ok(url) = env::var("SURGE_OLLAMA_URL") {
            cfg.ollama_url = url;
        }
        if let Ok(addr) = env::var("SURGE_LISTEN_ADDR") {
            cfg.listen_addr = addr;
        }
        if let Ok(model) = env::var("SURGE_MODEL") {
            cfg.default_model = model;
        }
        if let Some(v) = env::var("SURGE_RUN_TIMEOUT_SECS").ok().and_then(|v| v.parse().ok()) { cfg.run_timeout_secs = v; }
        if let Some(v) = env::var("SURGE_SAMPLE_INTERVAL_MS").ok().and_then(|v| v.parse().ok()) { cfg.sample_interval_ms = v; }
        cfg
    }
}
