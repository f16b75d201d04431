//! Configuration Module
//!
//! Handles configuration loading from YAML files and environment variables,
//! validation, and the live-updatable handle the caches read their byte
//! budgets from.

use crate::cache_types::CacheKind;
use crate::eviction::{
    CacheBudget, EvictionPolicy, DEFAULT_TARGET_PERCENT, DEFAULT_THROTTLE_INTERVAL,
    DEFAULT_TRIGGER_PERCENT,
};
use crate::{CacheError, Result};
use clap::{Arg, ArgAction, ArgMatches, Command};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{info, warn};

const GIB: u64 = 1024 * 1024 * 1024;

/// Custom deserializer for PathBuf that expands ~ to home directory
mod pathbuf_serde {
    use serde::{Deserialize, Deserializer};
    use std::path::PathBuf;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<PathBuf, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(expand_tilde(&s))
    }

    pub fn deserialize_option<'de, D>(deserializer: D) -> Result<Option<PathBuf>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = Option::<String>::deserialize(deserializer)?;
        Ok(s.map(|s| expand_tilde(&s)))
    }

    pub(crate) fn expand_tilde(path: &str) -> PathBuf {
        if let Some(rest) = path.strip_prefix("~/") {
            if let Some(home) = std::env::var_os("HOME") {
                let mut result = PathBuf::from(home);
                result.push(rest);
                return result;
            }
        }
        PathBuf::from(path)
    }
}

/// Custom deserializer for Duration from string format like "30s", "5m", "1h"
pub(crate) mod duration_serde {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    pub(crate) fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        if s.is_empty() {
            return Err("Empty duration string".to_string());
        }

        let num_end = s
            .char_indices()
            .find(|(_, c)| !(c.is_ascii_digit() || *c == '.'))
            .map_or(s.len(), |(i, _)| i);

        if num_end == 0 {
            return Err(format!("No number found in duration string: {}", s));
        }

        let num_str = &s[..num_end];
        let unit = s[num_end..].trim();

        let value: f64 = num_str
            .parse()
            .map_err(|e| format!("Failed to parse number '{}': {}", num_str, e))?;

        let seconds = match unit {
            "s" | "sec" | "secs" | "second" | "seconds" | "" => value,
            "m" | "min" | "mins" | "minute" | "minutes" => value * 60.0,
            "h" | "hr" | "hrs" | "hour" | "hours" => value * 3600.0,
            "ms" | "millis" | "millisecond" | "milliseconds" => value / 1000.0,
            _ => return Err(format!("Unknown duration unit: {}", unit)),
        };

        Duration::try_from_secs_f64(seconds)
            .map_err(|e| format!("Duration '{}' out of range: {}", s, e))
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Cache locations and budgets
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(
        default = "default_cache_dir",
        deserialize_with = "pathbuf_serde::deserialize"
    )]
    pub cache_dir: PathBuf,
    /// Server/account identity whose namespaces the CLI operates on
    #[serde(default = "default_instance_id")]
    pub instance_id: String,
    #[serde(default = "default_page_cache_max_size")]
    pub page_cache_max_size: u64,
    #[serde(default = "default_thumbnail_cache_max_size")]
    pub thumbnail_cache_max_size: u64,
    #[serde(default = "default_book_file_cache_max_size")]
    pub book_file_cache_max_size: u64,
    #[serde(default)]
    pub eviction: EvictionConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            instance_id: default_instance_id(),
            page_cache_max_size: default_page_cache_max_size(),
            thumbnail_cache_max_size: default_thumbnail_cache_max_size(),
            book_file_cache_max_size: default_book_file_cache_max_size(),
            eviction: EvictionConfig::default(),
        }
    }
}

impl CacheConfig {
    pub fn max_bytes(&self, kind: CacheKind) -> u64 {
        match kind {
            CacheKind::PageImage => self.page_cache_max_size,
            CacheKind::Thumbnail => self.thumbnail_cache_max_size,
            CacheKind::BookFile => self.book_file_cache_max_size,
        }
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        for kind in CacheKind::ALL {
            if self.max_bytes(kind) == 0 {
                return Err(format!("{} cache max size must be greater than 0", kind));
            }
        }
        if self.instance_id.is_empty() {
            return Err("instance_id must not be empty".to_string());
        }
        self.eviction.validate()
    }
}

fn default_cache_dir() -> PathBuf {
    pathbuf_serde::expand_tilde("~/.cache/media-disk-cache")
}

fn default_instance_id() -> String {
    "default".to_string()
}

fn default_page_cache_max_size() -> u64 {
    8 * GIB
}

fn default_thumbnail_cache_max_size() -> u64 {
    GIB
}

fn default_book_file_cache_max_size() -> u64 {
    4 * GIB
}

/// Watermark and throttle settings shared by every cache kind
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvictionConfig {
    /// Percentage of the budget at which eviction starts (default: 90)
    #[serde(default = "default_trigger_percent")]
    pub trigger_percent: u8,
    /// Percentage of the budget an eviction pass reduces to (default: 80)
    #[serde(default = "default_target_percent")]
    pub target_percent: u8,
    /// Minimum spacing between unforced eviction passes (default: 5s)
    #[serde(
        default = "default_throttle_interval",
        deserialize_with = "duration_serde::deserialize"
    )]
    pub throttle_interval: Duration,
}

impl Default for EvictionConfig {
    fn default() -> Self {
        Self {
            trigger_percent: default_trigger_percent(),
            target_percent: default_target_percent(),
            throttle_interval: default_throttle_interval(),
        }
    }
}

impl EvictionConfig {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if !(1..=100).contains(&self.trigger_percent) {
            return Err(format!(
                "eviction.trigger_percent must be between 1 and 100, got {}",
                self.trigger_percent
            ));
        }
        if !(1..=100).contains(&self.target_percent) {
            return Err(format!(
                "eviction.target_percent must be between 1 and 100, got {}",
                self.target_percent
            ));
        }
        if self.target_percent >= self.trigger_percent {
            return Err(format!(
                "eviction.target_percent ({}) must be lower than eviction.trigger_percent ({})",
                self.target_percent, self.trigger_percent
            ));
        }
        Ok(())
    }

    pub fn policy(&self) -> EvictionPolicy {
        EvictionPolicy {
            trigger_percent: self.trigger_percent,
            target_percent: self.target_percent,
            throttle_interval: self.throttle_interval,
        }
    }
}

fn default_trigger_percent() -> u8 {
    DEFAULT_TRIGGER_PERCENT
}

fn default_target_percent() -> u8 {
    DEFAULT_TARGET_PERCENT
}

fn default_throttle_interval() -> Duration {
    DEFAULT_THROTTLE_INTERVAL
}

/// Application logging
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Directory for daily rolling log files; console only when unset
    #[serde(default, deserialize_with = "pathbuf_serde::deserialize_option")]
    pub log_dir: Option<PathBuf>,
    #[serde(default = "default_log_file_prefix")]
    pub log_file_prefix: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_dir: None,
            log_file_prefix: default_log_file_prefix(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_file_prefix() -> String {
    "media-cache.log".to_string()
}

impl Config {
    /// Load configuration from an optional YAML file, then the environment.
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let mut config = match config_path {
            Some(path) => Self::load_from_file(path)?,
            None => Self::default(),
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from YAML file
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            CacheError::ConfigError(format!("Failed to read config file {:?}: {}", path, e))
        })?;

        let config = Self::from_yaml(&content).map_err(|e| {
            CacheError::ConfigError(format!("Failed to parse config file {:?}: {}", path, e))
        })?;

        info!("Configuration loaded from file: {:?}", path);
        Ok(config)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) {
        if let Ok(cache_dir) = std::env::var("CACHE_DIR") {
            self.cache.cache_dir = pathbuf_serde::expand_tilde(&cache_dir);
        }

        if let Ok(instance_id) = std::env::var("CACHE_INSTANCE_ID") {
            self.cache.instance_id = instance_id;
        }

        for (var, target) in [
            ("PAGE_CACHE_MAX_SIZE", &mut self.cache.page_cache_max_size),
            ("THUMBNAIL_CACHE_MAX_SIZE", &mut self.cache.thumbnail_cache_max_size),
            ("BOOK_FILE_CACHE_MAX_SIZE", &mut self.cache.book_file_cache_max_size),
        ] {
            if let Ok(value) = std::env::var(var) {
                match value.trim().parse() {
                    Ok(bytes) => *target = bytes,
                    Err(e) => warn!("Ignoring invalid {}='{}': {}", var, value, e),
                }
            }
        }

        if let Ok(interval) = std::env::var("EVICTION_THROTTLE_INTERVAL") {
            match duration_serde::parse_duration(&interval) {
                Ok(duration) => self.cache.eviction.throttle_interval = duration,
                Err(e) => warn!("Ignoring invalid EVICTION_THROTTLE_INTERVAL: {}", e),
            }
        }

        if let Ok(log_level) = std::env::var("LOG_LEVEL") {
            self.logging.log_level = log_level;
        }

        if let Ok(log_dir) = std::env::var("LOG_DIR") {
            self.logging.log_dir = Some(pathbuf_serde::expand_tilde(&log_dir));
        }
    }

    /// Command line for the `media-cache` maintenance tool
    pub fn build_cli() -> Command {
        let kind_arg = Arg::new("kind")
            .short('k')
            .long("kind")
            .value_name("KIND")
            .help("Cache kind: page, thumbnail or book (default: all)");

        Command::new("media-cache")
            .version(env!("CARGO_PKG_VERSION"))
            .about("Inspect and maintain the media client's on-disk caches")
            .subcommand_required(true)
            .arg(
                Arg::new("config")
                    .short('c')
                    .long("config")
                    .value_name("FILE")
                    .global(true)
                    .help("Configuration file path"),
            )
            .arg(
                Arg::new("instance")
                    .short('i')
                    .long("instance")
                    .value_name("ID")
                    .global(true)
                    .help("Server instance whose caches to operate on"),
            )
            .arg(
                Arg::new("cache-dir")
                    .long("cache-dir")
                    .value_name("DIR")
                    .global(true)
                    .help("Cache base directory"),
            )
            .subcommand(Command::new("stats").about("Print sizes and counters as JSON"))
            .subcommand(
                Command::new("evict")
                    .about("Run an eviction pass now, ignoring the throttle")
                    .arg(kind_arg.clone()),
            )
            .subcommand(
                Command::new("clear")
                    .about("Remove cached content")
                    .arg(kind_arg)
                    .arg(
                        Arg::new("all-instances")
                            .long("all-instances")
                            .action(ArgAction::SetTrue)
                            .help("Clear the kind for every instance, not just the selected one"),
                    ),
            )
            .subcommand(
                Command::new("drop-book")
                    .about("Remove cached pages and files of one book")
                    .arg(Arg::new("book-id").value_name("BOOK_ID").required(true)),
            )
    }

    /// Load configuration from the file named on the command line, the
    /// environment and command-line overrides, in that order.
    pub fn load_from_matches(matches: &ArgMatches) -> Result<Self> {
        let mut config = match matches.get_one::<String>("config") {
            Some(path) => Self::load_from_file(Path::new(path))?,
            None => Self::default(),
        };

        config.apply_env_overrides();
        config.apply_cli_overrides(matches);
        config.validate()?;
        Ok(config)
    }

    fn apply_cli_overrides(&mut self, matches: &ArgMatches) {
        if let Some(cache_dir) = matches.get_one::<String>("cache-dir") {
            self.cache.cache_dir = pathbuf_serde::expand_tilde(cache_dir);
        }

        if let Some(instance_id) = matches.get_one::<String>("instance") {
            self.cache.instance_id = instance_id.clone();
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.cache.validate().map_err(|e| {
            CacheError::ConfigError(format!("Invalid cache configuration: {}", e))
        })
    }
}

/// Live configuration shared by every cache opened from it.
///
/// Budgets are read through [`CacheBudget`] on each eviction decision, so an
/// [`SharedConfig::update`] takes effect on the next write.
#[derive(Debug, Clone)]
pub struct SharedConfig {
    inner: Arc<RwLock<Config>>,
}

impl SharedConfig {
    pub fn new(config: Config) -> Self {
        Self {
            inner: Arc::new(RwLock::new(config)),
        }
    }

    /// Copy of the current configuration.
    pub fn snapshot(&self) -> Config {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Apply `change` and keep it only if the result validates.
    pub fn update(&self, change: impl FnOnce(&mut Config)) -> Result<()> {
        let mut guard = self
            .inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut candidate = guard.clone();
        change(&mut candidate);
        candidate.validate()?;
        *guard = candidate;
        Ok(())
    }
}

impl CacheBudget for SharedConfig {
    fn max_bytes(&self, kind: CacheKind) -> u64 {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .cache
            .max_bytes(kind)
    }
}
