use std::ffi::OsString;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

pub const MAX_PAGE_SIZE: usize = 100;
pub const MAX_RETRY_DELAY_MS: u64 = 30_000;

#[derive(Debug, Deserialize)]
pub struct AppConfig {
    pub redmine: RedmineConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub learning: LearningConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RedmineConfig {
    pub base_url: String,
    pub api_key: String,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_max_batch_ids")]
    pub max_batch_ids: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
}

impl RedmineConfig {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            page_size: default_page_size(),
            max_batch_ids: default_max_batch_ids(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            max_in_flight: default_max_in_flight(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_metadata_ttl_secs")]
    pub metadata_ttl_secs: u64,
    #[serde(default = "default_metadata_ttl_secs")]
    pub versions_ttl_secs: u64,
    #[serde(default = "default_wiki_ttl_secs")]
    pub wiki_ttl_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_stale_ttl_secs")]
    pub stale_ttl_secs: u64,
    #[serde(default)]
    pub snapshot_path: Option<PathBuf>,
}

impl CacheConfig {
    pub fn metadata_ttl(&self) -> Duration {
        Duration::from_secs(self.metadata_ttl_secs)
    }

    pub fn versions_ttl(&self) -> Duration {
        Duration::from_secs(self.versions_ttl_secs)
    }

    pub fn wiki_ttl(&self) -> Duration {
        Duration::from_secs(self.wiki_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn stale_ttl(&self) -> Duration {
        Duration::from_secs(self.stale_ttl_secs)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            metadata_ttl_secs: default_metadata_ttl_secs(),
            versions_ttl_secs: default_metadata_ttl_secs(),
            wiki_ttl_secs: default_wiki_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            stale_ttl_secs: default_stale_ttl_secs(),
            snapshot_path: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PoolConfig {
    #[serde(default = "default_core_threads")]
    pub core_threads: usize,
    #[serde(default = "default_max_threads")]
    pub max_threads: usize,
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
}

impl PoolConfig {
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            core_threads: default_core_threads(),
            max_threads: default_max_threads(),
            keep_alive_secs: default_keep_alive_secs(),
        }
    }
}

#[derive(Debug, Default, Deserialize, Clone)]
pub struct LearningConfig {
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub debug: bool,
}

#[derive(Debug, Default)]
pub struct AppConfigOverrides {
    pub redmine_base_url: Option<String>,
    pub redmine_api_key: Option<String>,
    pub redmine_page_size: Option<usize>,
    pub redmine_max_retries: Option<usize>,
    pub cache_metadata_ttl_secs: Option<u64>,
    pub cache_snapshot_path: Option<PathBuf>,
    pub pool_max_threads: Option<usize>,
    pub learning_dir: Option<PathBuf>,
    pub logging_debug: Option<bool>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config file not found at {path}. expected at $XDG_CONFIG_HOME/redmine-access/config.toml or ~/.config/redmine-access/config.toml")]
    MissingConfigFile { path: PathBuf },
    #[error("failed to resolve config path: HOME is not set and XDG_CONFIG_HOME is unset")]
    MissingHomeDirectory,
    #[error("failed to read config file at {path}: {source}")]
    ReadFailed {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse TOML config at {path}: {source}")]
    ParseFailed {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

pub fn load() -> Result<AppConfig, ConfigError> {
    let path = resolve_config_path()?;
    load_from(&path)
}

pub fn load_from(path: &std::path::Path) -> Result<AppConfig, ConfigError> {
    let path = path.to_path_buf();
    let raw = std::fs::read_to_string(&path).map_err(|source| {
        if source.kind() == std::io::ErrorKind::NotFound {
            ConfigError::MissingConfigFile { path: path.clone() }
        } else {
            ConfigError::ReadFailed {
                path: path.clone(),
                source,
            }
        }
    })?;

    let cfg = toml::from_str::<AppConfig>(&raw).map_err(|source| ConfigError::ParseFailed {
        path: path.clone(),
        source,
    })?;
    cfg.validate()?;
    Ok(cfg)
}

pub fn resolve_config_path() -> Result<PathBuf, ConfigError> {
    let xdg_config_home = std::env::var_os("XDG_CONFIG_HOME");
    let home = std::env::var_os("HOME");
    resolve_config_path_from_env(xdg_config_home, home)
}

fn resolve_config_path_from_env(
    xdg_config_home: Option<OsString>,
    home: Option<OsString>,
) -> Result<PathBuf, ConfigError> {
    if let Some(dir) = xdg_config_home.filter(|value| !value.is_empty()) {
        return Ok(PathBuf::from(dir).join("redmine-access").join("config.toml"));
    }

    let home = home
        .filter(|value| !value.is_empty())
        .ok_or(ConfigError::MissingHomeDirectory)?;
    Ok(PathBuf::from(home)
        .join(".config")
        .join("redmine-access")
        .join("config.toml"))
}

pub fn default_learning_dir() -> Result<PathBuf, ConfigError> {
    resolve_learning_dir_from_env(
        std::env::var_os("XDG_CACHE_HOME"),
        std::env::var_os("HOME"),
    )
}

fn resolve_learning_dir_from_env(
    xdg_cache_home: Option<OsString>,
    home: Option<OsString>,
) -> Result<PathBuf, ConfigError> {
    if let Some(dir) = xdg_cache_home.filter(|value| !value.is_empty()) {
        return Ok(PathBuf::from(dir)
            .join("redmine-access")
            .join("custom_fields"));
    }

    let home = home
        .filter(|value| !value.is_empty())
        .ok_or(ConfigError::MissingHomeDirectory)?;
    Ok(PathBuf::from(home)
        .join(".cache")
        .join("redmine-access")
        .join("custom_fields"))
}

impl AppConfig {
    pub fn apply_overrides(&mut self, overrides: &AppConfigOverrides) -> Result<(), ConfigError> {
        if let Some(value) = &overrides.redmine_base_url {
            self.redmine.base_url = value.clone();
        }
        if let Some(value) = &overrides.redmine_api_key {
            self.redmine.api_key = value.clone();
        }
        if let Some(value) = overrides.redmine_page_size {
            self.redmine.page_size = value;
        }
        if let Some(value) = overrides.redmine_max_retries {
            self.redmine.max_retries = value;
        }
        if let Some(value) = overrides.cache_metadata_ttl_secs {
            self.cache.metadata_ttl_secs = value;
        }
        if let Some(value) = &overrides.cache_snapshot_path {
            self.cache.snapshot_path = Some(value.clone());
        }
        if let Some(value) = overrides.pool_max_threads {
            self.pool.max_threads = value;
        }
        if let Some(value) = &overrides.learning_dir {
            self.learning.dir = Some(value.clone());
        }
        if let Some(value) = overrides.logging_debug {
            self.logging.debug = value;
        }

        self.validate()
    }

    pub fn learning_dir(&self) -> Result<PathBuf, ConfigError> {
        match &self.learning.dir {
            Some(dir) => Ok(dir.clone()),
            None => default_learning_dir(),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.redmine.base_url.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "redmine.base_url must not be empty".into(),
            ));
        }
        if self.redmine.api_key.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "redmine.api_key must not be empty".into(),
            ));
        }
        if self.redmine.page_size == 0 || self.redmine.page_size > MAX_PAGE_SIZE {
            return Err(ConfigError::Invalid(format!(
                "redmine.page_size must be between 1 and {MAX_PAGE_SIZE}"
            )));
        }
        if self.redmine.max_batch_ids == 0 || self.redmine.max_batch_ids > MAX_PAGE_SIZE {
            return Err(ConfigError::Invalid(format!(
                "redmine.max_batch_ids must be between 1 and {MAX_PAGE_SIZE}"
            )));
        }
        if self.redmine.timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "redmine.timeout_secs must be > 0".into(),
            ));
        }
        if self.redmine.max_in_flight == 0 {
            return Err(ConfigError::Invalid(
                "redmine.max_in_flight must be > 0".into(),
            ));
        }
        if self.cache.sweep_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "cache.sweep_interval_secs must be > 0".into(),
            ));
        }
        if self.cache.stale_ttl_secs == 0 {
            return Err(ConfigError::Invalid(
                "cache.stale_ttl_secs must be > 0".into(),
            ));
        }
        if self.redmine.retry_delay_ms > MAX_RETRY_DELAY_MS {
            return Err(ConfigError::Invalid(format!(
                "redmine.retry_delay_ms must be <= {MAX_RETRY_DELAY_MS}"
            )));
        }
        if self.pool.core_threads == 0 {
            return Err(ConfigError::Invalid("pool.core_threads must be > 0".into()));
        }
        if self.pool.max_threads < self.pool.core_threads {
            return Err(ConfigError::Invalid(
                "pool.max_threads must be >= pool.core_threads".into(),
            ));
        }

        Ok(())
    }
}

const fn default_page_size() -> usize {
    100
}

const fn default_max_batch_ids() -> usize {
    50
}

const fn default_timeout_secs() -> u64 {
    30
}

const fn default_max_retries() -> usize {
    3
}

const fn default_retry_delay_ms() -> u64 {
    1000
}

const fn default_max_in_flight() -> usize {
    4
}

const fn default_metadata_ttl_secs() -> u64 {
    300
}

const fn default_stale_ttl_secs() -> u64 {
    24 * 60 * 60
}

const fn default_wiki_ttl_secs() -> u64 {
    120
}

const fn default_sweep_interval_secs() -> u64 {
    60
}

const fn default_core_threads() -> usize {
    4
}

const fn default_max_threads() -> usize {
    16
}

const fn default_keep_alive_secs() -> u64 {
    60
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_path_prefers_xdg_config_home() {
        let path = resolve_config_path_from_env(
            Some(OsString::from("/tmp/xdg-home")),
            Some(OsString::from("/tmp/home")),
        )
        .expect("xdg path should resolve");

        assert_eq!(
            path,
            PathBuf::from("/tmp/xdg-home/redmine-access/config.toml")
        );
    }

    #[test]
    fn resolve_path_falls_back_to_home_dot_config() {
        let path = resolve_config_path_from_env(None, Some(OsString::from("/tmp/home")))
            .expect("home path should resolve");

        assert_eq!(
            path,
            PathBuf::from("/tmp/home/.config/redmine-access/config.toml")
        );
    }

    #[test]
    fn resolve_path_requires_home_when_xdg_missing() {
        let err = resolve_config_path_from_env(None, None).expect_err("resolution should fail");
        assert!(matches!(err, ConfigError::MissingHomeDirectory));
    }

    #[test]
    fn learning_dir_follows_xdg_cache_home() {
        let dir = resolve_learning_dir_from_env(
            Some(OsString::from("/tmp/cache")),
            Some(OsString::from("/tmp/home")),
        )
        .expect("cache dir should resolve");
        assert_eq!(dir, PathBuf::from("/tmp/cache/redmine-access/custom_fields"));

        let dir = resolve_learning_dir_from_env(None, Some(OsString::from("/tmp/home")))
            .expect("home dir should resolve");
        assert_eq!(
            dir,
            PathBuf::from("/tmp/home/.cache/redmine-access/custom_fields")
        );
    }

    #[test]
    fn minimal_config_takes_defaults() {
        let raw = r#"
            [redmine]
            base_url = "https://redmine.example.com"
            api_key = "secret"
        "#;

        let cfg: AppConfig = toml::from_str(raw).expect("toml should parse");
        cfg.validate().expect("defaults should validate");
        assert_eq!(cfg.redmine.page_size, 100);
        assert_eq!(cfg.redmine.max_batch_ids, 50);
        assert_eq!(cfg.cache.metadata_ttl(), Duration::from_secs(300));
        assert_eq!(cfg.cache.sweep_interval(), Duration::from_secs(60));
        assert_eq!(cfg.cache.stale_ttl(), Duration::from_secs(86_400));
        assert!(cfg.cache.snapshot_path.is_none());
        assert_eq!(cfg.pool.core_threads, 4);
        assert!(!cfg.logging.debug);
    }

    #[test]
    fn validates_rejects_out_of_range_values() {
        let raw = r#"
            [redmine]
            base_url = "https://redmine.example.com"
            api_key = "secret"
            page_size = 500

            [pool]
            core_threads = 8
            max_threads = 2
        "#;

        let cfg: AppConfig = toml::from_str(raw).expect("toml should parse");
        let err = cfg.validate().expect_err("invalid values should fail");
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn validates_rejects_unbounded_retry_delay() {
        let raw = r#"
            [redmine]
            base_url = "https://redmine.example.com"
            api_key = "secret"
            retry_delay_ms = 3600000
        "#;

        let cfg: AppConfig = toml::from_str(raw).expect("toml should parse");
        let err = cfg.validate().expect_err("huge retry delay should fail");
        assert!(matches!(err, ConfigError::Invalid(msg) if msg.contains("retry_delay_ms")));
    }

    #[test]
    fn validates_rejects_empty_credentials() {
        let raw = r#"
            [redmine]
            base_url = "https://redmine.example.com"
            api_key = "  "
        "#;

        let cfg: AppConfig = toml::from_str(raw).expect("toml should parse");
        let err = cfg.validate().expect_err("blank api key should fail");
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn config_example_parses() {
        let raw = include_str!("../config.example.toml");
        let cfg: AppConfig = toml::from_str(raw).expect("example config should parse");
        cfg.validate().expect("example config should validate");
    }

    #[test]
    fn apply_overrides_updates_values() {
        let raw = include_str!("../config.example.toml");
        let mut cfg: AppConfig = toml::from_str(raw).expect("example config should parse");

        let overrides = AppConfigOverrides {
            redmine_base_url: Some("https://override.example.com".into()),
            redmine_api_key: Some("override-key".into()),
            redmine_page_size: Some(25),
            redmine_max_retries: Some(0),
            cache_metadata_ttl_secs: Some(15),
            cache_snapshot_path: Some(PathBuf::from("/tmp/override.db")),
            pool_max_threads: Some(32),
            learning_dir: Some(PathBuf::from("/tmp/fields")),
            logging_debug: Some(true),
        };

        cfg.apply_overrides(&overrides)
            .expect("overrides should validate");

        assert_eq!(cfg.redmine.base_url, "https://override.example.com");
        assert_eq!(cfg.redmine.api_key, "override-key");
        assert_eq!(cfg.redmine.page_size, 25);
        assert_eq!(cfg.redmine.max_retries, 0);
        assert_eq!(cfg.cache.metadata_ttl_secs, 15);
        assert_eq!(
            cfg.cache.snapshot_path.as_deref(),
            Some(std::path::Path::new("/tmp/override.db"))
        );
        assert_eq!(cfg.pool.max_threads, 32);
        assert_eq!(
            cfg.learning_dir().expect("dir"),
            PathBuf::from("/tmp/fields")
        );
        assert!(cfg.logging.debug);
    }

    #[test]
    fn apply_overrides_revalidates() {
        let raw = include_str!("../config.example.toml");
        let mut cfg: AppConfig = toml::from_str(raw).expect("example config should parse");
        let overrides = AppConfigOverrides {
            redmine_page_size: Some(0),
            ..AppConfigOverrides::default()
        };
        assert!(cfg.apply_overrides(&overrides).is_err());
    }
}
