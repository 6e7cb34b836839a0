//! Configuration System
//!
//! Handles loading configuration from files and environment variables.
//! Supports TOML config files and environment variable overrides.

use crate::storage::registry::PointConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub archive: ArchiveConfig,

    #[serde(default)]
    pub archiver: ArchiverConfig,

    #[serde(default)]
    pub buffer: BufferConfig,

    #[serde(default)]
    pub points: Vec<PointConfig>,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Which archive backend to construct
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Partitioned, rotated, compressed text files
    Flatfile,
    /// Single SQLite database
    Sqlite,
    /// Process memory only, lost on exit
    Memory,
    /// Accept and discard every write
    None,
}

impl Default for BackendKind {
    fn default() -> Self {
        BackendKind::Flatfile
    }
}

impl std::str::FromStr for BackendKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "flatfile" => Ok(BackendKind::Flatfile),
            "sqlite" => Ok(BackendKind::Sqlite),
            "memory" => Ok(BackendKind::Memory),
            "none" => Ok(BackendKind::None),
            other => Err(ConfigError::Invalid(format!(
                "unknown archive backend {:?}",
                other
            ))),
        }
    }
}

/// Archive backend configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ArchiveConfig {
    #[serde(default)]
    pub backend: BackendKind,

    /// Root directory of the flat-file archive
    #[serde(default = "default_archive_dir")]
    pub dir: String,

    /// Where compressed segments are expanded while being read
    #[serde(default)]
    pub temp_dir: Option<String>,

    /// Active segment size (bytes) above which it is rotated
    #[serde(default = "default_max_segment_size")]
    pub max_segment_size: u64,

    /// Active segment age (seconds) above which it is rotated, 0 disables
    #[serde(default = "default_max_segment_age")]
    pub max_segment_age_secs: u64,

    /// Most records returned by one archive query
    #[serde(default = "default_max_records")]
    pub max_records: usize,

    /// Database file for the sqlite backend
    #[serde(default)]
    pub sqlite_path: Option<String>,
}

fn default_archive_dir() -> String {
    dirs::data_local_dir()
        .map(|p| p.join("pointstore").join("archive").to_string_lossy().to_string())
        .unwrap_or_else(|| "./pointstore_archive".to_string())
}

fn default_max_segment_size() -> u64 {
    1_000_000 // 1 MB
}

fn default_max_segment_age() -> u64 {
    86_400 // 1 day
}

fn default_max_records() -> usize {
    5000
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            dir: default_archive_dir(),
            temp_dir: None,
            max_segment_size: default_max_segment_size(),
            max_segment_age_secs: default_max_segment_age(),
            max_records: default_max_records(),
            sqlite_path: None,
        }
    }
}

impl ArchiveConfig {
    /// Config rooted at a specific archive directory
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_string_lossy().to_string(),
            ..Default::default()
        }
    }

    pub fn archive_dir(&self) -> PathBuf {
        expand_home(&self.dir)
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.temp_dir
            .as_deref()
            .map(expand_home)
            .unwrap_or_else(|| std::env::temp_dir().join("pointstore"))
    }

    pub fn sqlite_path(&self) -> PathBuf {
        self.sqlite_path
            .as_deref()
            .map(expand_home)
            .unwrap_or_else(|| self.archive_dir().join("archive.db"))
    }

    /// Rotation age in microseconds, `None` when disabled
    pub fn max_segment_age_micros(&self) -> Option<i64> {
        if self.max_segment_age_secs == 0 {
            None
        } else {
            let secs = i64::try_from(self.max_segment_age_secs).unwrap_or(i64::MAX);
            Some(secs.saturating_mul(1_000_000))
        }
    }
}

/// Write-behind archiver configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ArchiverConfig {
    /// Pause between points within one flush pass
    #[serde(default = "default_flush_point_delay")]
    pub flush_point_delay_ms: u64,

    /// Pause when no point has pending data
    #[serde(default = "default_idle_delay")]
    pub idle_delay_ms: u64,

    /// Pending samples kept per point before the oldest are dropped
    #[serde(default = "default_max_pending")]
    pub max_pending_per_point: usize,

    /// Delay before the first purge pass
    #[serde(default = "default_purge_initial_delay")]
    pub purge_initial_delay_secs: u64,

    /// Period between purge passes, measured from the start of the previous pass
    #[serde(default = "default_purge_interval")]
    pub purge_interval_secs: u64,

    /// Pause between points within one purge pass
    #[serde(default = "default_purge_point_delay")]
    pub purge_point_delay_ms: u64,
}

fn default_flush_point_delay() -> u64 {
    1
}

fn default_idle_delay() -> u64 {
    50
}

fn default_max_pending() -> usize {
    100_000
}

fn default_purge_initial_delay() -> u64 {
    120
}

fn default_purge_interval() -> u64 {
    86_400
}

fn default_purge_point_delay() -> u64 {
    250
}

impl Default for ArchiverConfig {
    fn default() -> Self {
        Self {
            flush_point_delay_ms: default_flush_point_delay(),
            idle_delay_ms: default_idle_delay(),
            max_pending_per_point: default_max_pending(),
            purge_initial_delay_secs: default_purge_initial_delay(),
            purge_interval_secs: default_purge_interval(),
            purge_point_delay_ms: default_purge_point_delay(),
        }
    }
}

impl ArchiverConfig {
    pub fn flush_point_delay(&self) -> Duration {
        Duration::from_millis(self.flush_point_delay_ms)
    }

    pub fn idle_delay(&self) -> Duration {
        Duration::from_millis(self.idle_delay_ms)
    }

    pub fn purge_initial_delay(&self) -> Duration {
        Duration::from_secs(self.purge_initial_delay_secs)
    }

    pub fn purge_interval(&self) -> Duration {
        Duration::from_secs(self.purge_interval_secs)
    }

    pub fn purge_point_delay(&self) -> Duration {
        Duration::from_millis(self.purge_point_delay_ms)
    }
}

/// Recent-history buffer configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BufferConfig {
    /// Capacity for points without an explicit `buffer_size`
    #[serde(default = "default_buffer_capacity")]
    pub default_capacity: usize,
}

fn default_buffer_capacity() -> usize {
    100
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            default_capacity: default_buffer_capacity(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default = "default_log_format")]
    pub format: String,

    pub file: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            file: None,
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        Self::parse(&content).map_err(|e| match e {
            ConfigError::Parse { error, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                error,
            },
            other => other,
        })
    }

    /// Parse configuration from TOML text
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content).map_err(|e| ConfigError::Parse {
            path: PathBuf::new(),
            error: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from environment variables only
    pub fn from_env() -> Self {
        let mut config = Config::default();
        config.apply_env_overrides();
        config
    }

    /// Load configuration with environment variable overrides
    pub fn load_with_env(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load from default locations or environment
    pub fn load_default() -> Self {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("pointstore").join("config.toml")),
            Some(PathBuf::from("/etc/pointstore/config.toml")),
            Some(PathBuf::from("./config.toml")),
        ];

        for path_opt in config_paths.iter().flatten() {
            if path_opt.exists() {
                match Self::load_with_env(path_opt) {
                    Ok(config) => {
                        tracing::info!("Loaded config from {:?}", path_opt);
                        return config;
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load config from {:?}: {}", path_opt, e);
                    }
                }
            }
        }

        tracing::info!("Using default config with environment overrides");
        Self::from_env()
    }

    /// Apply environment variable overrides to an existing config
    fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var("POINTSTORE_ARCHIVE_DIR") {
            self.archive.dir = dir;
        }
        if let Ok(dir) = std::env::var("POINTSTORE_TEMP_DIR") {
            self.archive.temp_dir = Some(dir);
        }
        if let Ok(backend) = std::env::var("POINTSTORE_BACKEND") {
            match backend.parse() {
                Ok(kind) => self.archive.backend = kind,
                Err(e) => tracing::warn!("Ignoring POINTSTORE_BACKEND: {}", e),
            }
        }
        if let Ok(max) = std::env::var("POINTSTORE_MAX_RECORDS") {
            if let Ok(n) = max.parse() {
                self.archive.max_records = n;
            }
        }

        if let Ok(level) = std::env::var("POINTSTORE_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(format) = std::env::var("POINTSTORE_LOG_FORMAT") {
            self.logging.format = format;
        }
    }

    /// Reject settings no archive can run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.archive.max_records == 0 {
            return Err(ConfigError::Invalid("archive.max_records must be positive".into()));
        }
        if self.archive.max_segment_size == 0 {
            return Err(ConfigError::Invalid(
                "archive.max_segment_size must be positive".into(),
            ));
        }
        if self.buffer.default_capacity == 0 {
            return Err(ConfigError::Invalid(
                "buffer.default_capacity must be positive".into(),
            ));
        }
        if self.archiver.max_pending_per_point == 0 {
            return Err(ConfigError::Invalid(
                "archiver.max_pending_per_point must be positive".into(),
            ));
        }

        let mut seen = HashSet::new();
        for point in &self.points {
            let id = point.id();
            id.validate()
                .map_err(|e| ConfigError::Invalid(e.to_string()))?;
            if point.buffer_size == Some(0) {
                return Err(ConfigError::Invalid(format!("{}: buffer_size must be positive", id)));
            }
            if !seen.insert(id.clone()) {
                return Err(ConfigError::Invalid(format!("point {} defined twice", id)));
            }
        }
        Ok(())
    }
}

/// Resolve a leading `~` to the home directory
///
/// Paths without one, and all paths when no home directory is known, are
/// taken as written.
pub fn expand_home(path: &str) -> PathBuf {
    let rest = match path.strip_prefix('~') {
        Some("") => "",
        Some(rest) if rest.starts_with('/') || rest.starts_with(std::path::MAIN_SEPARATOR) => {
            &rest[1..]
        }
        _ => return PathBuf::from(path),
    };
    match dirs::home_dir() {
        Some(home) if rest.is_empty() => home,
        Some(home) => home.join(rest),
        None => PathBuf::from(path),
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {error}")]
    Io { path: PathBuf, error: String },

    #[error("Failed to parse config file {path:?}: {error}")]
    Parse { path: PathBuf, error: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Generate a default config file content
pub fn generate_default_config() -> String {
    r#"# Pointstore Configuration
#
# Environment variables override these settings:
# - POINTSTORE_ARCHIVE_DIR
# - POINTSTORE_TEMP_DIR
# - POINTSTORE_BACKEND
# - POINTSTORE_MAX_RECORDS
# - POINTSTORE_LOG_LEVEL
# - POINTSTORE_LOG_FORMAT

[archive]
# Backend: flatfile, sqlite, memory or none
backend = "flatfile"

# Root directory of the archive (one directory per point), ~ is the home directory
dir = "~/.local/share/pointstore/archive"

# Scratch directory for decompressing rotated segments
# temp_dir = "/tmp/pointstore"

# Rotate the active segment once it is larger than this (bytes)
max_segment_size = 1000000

# Rotate the active segment once it spans more than this (seconds, 0 = never)
max_segment_age_secs = 86400

# Most records returned by a single archive query
max_records = 5000

[archiver]
# Pause between points while flushing (ms)
flush_point_delay_ms = 1

# Pause when nothing is pending (ms)
idle_delay_ms = 50

# Pending samples kept per point before the oldest are dropped
max_pending_per_point = 100000

# Delay before the first retention purge (s)
purge_initial_delay_secs = 120

# Time between retention purges (s)
purge_interval_secs = 86400

# Pause between points while purging (ms)
purge_point_delay_ms = 250

[buffer]
# Recent-history samples kept for points without buffer_size
default_capacity = 100

# One entry per point
[[points]]
source = "siteA"
name = "temp"
buffer_size = 3
# Days of archive to keep, 0 or negative keeps everything
longevity_days = 7

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log format: pretty (for development) or json (for production)
format = "pretty"

# Optional log file path
# file = "/var/log/pointstore/pointstore.log"
"#
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_parses() {
        let config = Config::parse(&generate_default_config()).unwrap();
        assert_eq!(config.archive.backend, BackendKind::Flatfile);
        assert_eq!(config.archive.max_records, 5000);
        assert_eq!(config.points.len(), 1);
        assert_eq!(config.points[0].id().to_string(), "siteA.temp");
        assert_eq!(config.points[0].buffer_size, Some(3));
        assert_eq!(config.points[0].longevity_days, 7);
    }

    #[test]
    fn test_defaults_fill_missing_sections() {
        let config = Config::parse("[archive]\nbackend = \"memory\"\n").unwrap();
        assert_eq!(config.archive.backend, BackendKind::Memory);
        assert_eq!(config.archive.max_segment_size, 1_000_000);
        assert_eq!(config.buffer.default_capacity, 100);
        assert_eq!(config.logging.level, "info");
        assert!(config.points.is_empty());
    }

    #[test]
    fn test_unknown_backend_fails_fast() {
        let err = Config::parse("[archive]\nbackend = \"mysql\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!("mysql".parse::<BackendKind>().is_err());
    }

    #[test]
    fn test_validation() {
        assert!(Config::parse("[archive]\nmax_records = 0\n").is_err());

        let dup = r#"
            [[points]]
            source = "a"
            name = "x"
            [[points]]
            source = "a"
            name = "x"
        "#;
        assert!(matches!(Config::parse(dup), Err(ConfigError::Invalid(_))));

        let bad_name = "[[points]]\nsource = \"a\"\nname = \"../x\"\n";
        assert!(Config::parse(bad_name).is_err());
    }

    #[test]
    fn test_segment_age_disabled() {
        let mut archive = ArchiveConfig::default();
        assert_eq!(archive.max_segment_age_micros(), Some(86_400_000_000));
        archive.max_segment_age_secs = 0;
        assert_eq!(archive.max_segment_age_micros(), None);

        archive.max_segment_age_secs = u64::MAX;
        assert_eq!(archive.max_segment_age_micros(), Some(i64::MAX));
    }

    #[test]
    fn test_home_expansion() {
        assert_eq!(expand_home("/var/lib/points"), PathBuf::from("/var/lib/points"));
        assert_eq!(expand_home("relative/dir"), PathBuf::from("relative/dir"));
        assert_eq!(expand_home("~user/dir"), PathBuf::from("~user/dir"));

        let Some(home) = dirs::home_dir() else { return };
        assert_eq!(expand_home("~"), home);

        let archive = Config::parse(&generate_default_config()).unwrap().archive;
        assert_eq!(
            archive.archive_dir(),
            home.join(".local/share/pointstore/archive")
        );
        assert!(!archive.archive_dir().starts_with("~"));
        assert_eq!(archive.sqlite_path(), archive.archive_dir().join("archive.db"));
    }
}
