use crate::errors::{EngineError, EngineResult};
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};

const CONFIG_FILE_NAME: &str = "config.toml";

/// Engine tunables. Every field has a default, so no user-authored config
/// file is required; a TOML file and `SEALSEARCH_*` env vars can override.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub data_dir: Option<PathBuf>,
    /// Mailbox label the backfill pages through ("5" is all mail).
    pub label: String,
    pub remove_quotes: bool,
    pub wifi_only: bool,
    pub worker_limit: usize,
    pub max_fetch_failures: u32,
    pub retry_backoff_ms: u64,
    pub storage_limit_bytes: Option<u64>,
    pub blob_threshold_bytes: usize,
    pub cache_memory_fraction: f64,
    pub cache_message_bytes: u64,
    pub scan_memory_fraction: f64,
    pub scan_row_bytes: u64,
    pub min_scan_batch: usize,
    pub max_scan_batch: usize,
    pub page_size: usize,
    pub min_cache_results: usize,
    pub eta_window: usize,
    pub busy_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            label: "5".to_string(),
            remove_quotes: true,
            wifi_only: false,
            worker_limit: 8,
            max_fetch_failures: 3,
            retry_backoff_ms: 1000,
            storage_limit_bytes: Some(600 * 1024 * 1024),
            blob_threshold_bytes: 64 * 1024,
            cache_memory_fraction: 0.10,
            cache_message_bytes: 8 * 1024,
            scan_memory_fraction: 0.05,
            scan_row_bytes: 16 * 1024,
            min_scan_batch: 32,
            max_scan_batch: 2000,
            page_size: 50,
            min_cache_results: 15,
            eta_window: 10,
            busy_timeout_ms: 5000,
        }
    }
}

impl EngineConfig {
    /// Defaults, then the TOML file (if any), then env overrides.
    pub fn load() -> EngineResult<Self> {
        let mut config = match config_file_path() {
            Some(path) if path.exists() => Self::from_file(&path)?,
            _ => Self::default(),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> EngineResult<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("reading {}: {e}", path.display())))?;
        toml::from_str(&raw)
            .map_err(|e| EngineError::Config(format!("parsing {}: {e}", path.display())))
    }

    fn apply_env(&mut self) {
        if let Ok(dir) = env::var("SEALSEARCH_DATA_DIR") {
            self.data_dir = Some(PathBuf::from(dir));
        }
        if let Ok(label) = env::var("SEALSEARCH_LABEL") {
            self.label = label;
        }
        if let Some(v) = env_flag("SEALSEARCH_REMOVE_QUOTES") {
            self.remove_quotes = v;
        }
        if let Some(v) = env_flag("SEALSEARCH_WIFI_ONLY") {
            self.wifi_only = v;
        }
        if let Some(v) = env_parse("SEALSEARCH_WORKER_LIMIT") {
            self.worker_limit = v;
        }
        if let Some(v) = env_parse("SEALSEARCH_RETRY_BACKOFF_MS") {
            self.retry_backoff_ms = v;
        }
        if let Ok(raw) = env::var("SEALSEARCH_STORAGE_LIMIT_BYTES") {
            // 0 lifts the limit.
            self.storage_limit_bytes = raw.parse::<u64>().ok().filter(|v| *v > 0);
        }
        if let Some(v) = env_parse("SEALSEARCH_PAGE_SIZE") {
            self.page_size = v;
        }
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.worker_limit == 0 {
            return Err(EngineError::Config("worker_limit must be at least 1".into()));
        }
        if self.page_size == 0 {
            return Err(EngineError::Config("page_size must be at least 1".into()));
        }
        if self.min_scan_batch == 0 || self.min_scan_batch > self.max_scan_batch {
            return Err(EngineError::Config(format!(
                "invalid scan batch bounds {}..{}",
                self.min_scan_batch, self.max_scan_batch
            )));
        }
        for (name, fraction) in [
            ("cache_memory_fraction", self.cache_memory_fraction),
            ("scan_memory_fraction", self.scan_memory_fraction),
        ] {
            if !(0.0..=1.0).contains(&fraction) {
                return Err(EngineError::Config(format!("{name} must be within 0..=1")));
            }
        }
        Ok(())
    }

    pub fn resolve_data_dir(&self) -> EngineResult<PathBuf> {
        match &self.data_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir).map_err(|e| {
                    EngineError::Config(format!("creating data dir {}: {e}", dir.display()))
                })?;
                Ok(dir.clone())
            }
            None => crate::storage::default_data_dir(),
        }
    }
}

fn config_file_path() -> Option<PathBuf> {
    if let Ok(path) = env::var("SEALSEARCH_CONFIG") {
        return Some(PathBuf::from(path));
    }
    dirs::config_dir().map(|dir| dir.join("sealsearch").join(CONFIG_FILE_NAME))
}

fn env_flag(key: &str) -> Option<bool> {
    env::var(key)
        .ok()
        .map(|s| s == "1" || s.eq_ignore_ascii_case("true"))
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|s| s.parse::<T>().ok())
}
