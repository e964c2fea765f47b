//! Configuration types for rar-bridge
//!
//! The service reads a single TOML document (`config.toml` by default) with
//! the sections `[paths]`, `[options]`, `[virtual_http]`, `[external_mount]`,
//! `[plex]`, `[[directory_pairs]]`, `[logging]`, `[tools]` and `[reencode]`.
//! Every key has a default; missing required path keys are rejected by
//! [`Config::validate`] so startup fails with a configuration error rather
//! than part-way through processing. Unrecognized top-level sections are
//! ignored with a warning.

use crate::error::{Error, Result};
use crate::types::{DirectoryPair, StrategyKind};
use serde::{Deserialize, Deserializer, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Directory roles of the on-disk layout
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Directory observed for new archive sets (required unless
    /// `directory_pairs` is given)
    #[serde(default)]
    pub watch: Option<PathBuf>,

    /// Library directory materialized files appear in (required unless
    /// `directory_pairs` is given)
    #[serde(default)]
    pub target: Option<PathBuf>,

    /// Transient extraction scratch (default: `<root>/work`)
    #[serde(default)]
    pub work: Option<PathBuf>,

    /// Quarantine directory for failed archive sets (default: `<root>/failed`)
    #[serde(default)]
    pub failed: Option<PathBuf>,

    /// Destination for relocated processed archive sets (default:
    /// `<root>/archive`)
    #[serde(default)]
    pub archive: Option<PathBuf>,
}

/// Processing behavior options
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OptionsConfig {
    /// Default materialization strategy for sources without an override
    #[serde(default)]
    pub processing_mode: StrategyKind,

    /// Delete the source archive set on success instead of relocating it
    #[serde(default)]
    pub delete_archives: bool,

    /// Consult the duplicate index in extract mode (default: true)
    #[serde(default = "default_true")]
    pub duplicate_check: bool,

    /// Recognized archive-volume suffixes (default: `[".rar"]`)
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,

    /// Quiescence window in seconds before an archive set is considered
    /// complete (default: 10)
    #[serde(default = "default_stabilization")]
    pub file_stabilization_time: u64,

    /// Horizon in seconds after which an unstable set is submitted anyway
    /// (default: 3600)
    #[serde(default = "default_max_file_age")]
    pub max_file_age: u64,

    /// Retry attempts before a transiently failing item is quarantined
    /// (default: 3)
    #[serde(default = "default_max_retry_attempts")]
    pub max_retry_attempts: u32,

    /// Fixed delay in seconds between retry attempts (default: 60)
    #[serde(default = "default_retry_interval")]
    pub retry_interval: u64,

    /// Wall-clock bound in hours on retrying a single item (default: 4)
    #[serde(default = "default_max_retry_age_hours")]
    pub max_retry_age_hours: u64,

    /// Submit archive sets already present in the sources at startup
    /// (default: true)
    #[serde(default = "default_true")]
    pub scan_existing_files: bool,

    /// Smallest entry size exposed, in bytes (default: 1 MiB)
    #[serde(default = "default_min_file_size")]
    pub min_file_size: u64,

    /// Largest entry size exposed, in bytes (default: 100 GiB)
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,

    /// Wall-clock budget in seconds for the archive integrity test
    /// (default: 300)
    #[serde(default = "default_test_timeout")]
    pub test_timeout: u64,

    /// Grace period in seconds the worker gets to finish its current item at
    /// shutdown (default: 30)
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace: u64,
}

impl Default for OptionsConfig {
    fn default() -> Self {
        Self {
            processing_mode: StrategyKind::default(),
            delete_archives: false,
            duplicate_check: true,
            extensions: default_extensions(),
            file_stabilization_time: default_stabilization(),
            max_file_age: default_max_file_age(),
            max_retry_attempts: default_max_retry_attempts(),
            retry_interval: default_retry_interval(),
            max_retry_age_hours: default_max_retry_age_hours(),
            scan_existing_files: true,
            min_file_size: default_min_file_size(),
            max_file_size: default_max_file_size(),
            test_timeout: default_test_timeout(),
            shutdown_grace: default_shutdown_grace(),
        }
    }
}

/// Bind scope of the virtual-HTTP server
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BindScope {
    /// Listen on 127.0.0.1 only (default)
    #[default]
    Loopback,
    /// Listen on all interfaces and advertise the LAN address
    Any,
}

/// Virtual-HTTP (Strategy B) settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VirtualHttpConfig {
    /// Inclusive port window the server picks a free port from
    /// (default: `[8765, 8865]`)
    #[serde(default = "default_port_range")]
    pub port_range: [u16; 2],

    /// Maximum concurrently served streams (default: 10)
    #[serde(default = "default_max_streams")]
    pub max_concurrent_streams: usize,

    /// Body streaming chunk size in bytes (default: 8 KiB)
    #[serde(default = "default_chunk_size")]
    pub stream_chunk_size: usize,

    /// Bind scope, `loopback` or `any`
    #[serde(default)]
    pub bind: BindScope,

    /// Total content size in bytes above which a virtual-http item falls back
    /// to extraction (default: 15 GiB)
    #[serde(default = "default_fallback_threshold")]
    pub fallback_threshold: u64,
}

impl Default for VirtualHttpConfig {
    fn default() -> Self {
        Self {
            port_range: default_port_range(),
            max_concurrent_streams: default_max_streams(),
            stream_chunk_size: default_chunk_size(),
            bind: BindScope::default(),
            fallback_threshold: default_fallback_threshold(),
        }
    }
}

/// External-mount (Strategy C) settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExternalMountConfig {
    /// Mount helper executable (default: `rar2fs`)
    #[serde(default = "default_mount_executable")]
    pub executable: PathBuf,

    /// Base directory mount points are created under
    /// (default: `<root>/mounts`)
    #[serde(default)]
    pub mount_base: Option<PathBuf>,

    /// Extra `-o` options passed to the helper
    #[serde(default)]
    pub mount_options: Vec<String>,

    /// Seconds to wait for a launched mount to expose entries (default: 30)
    #[serde(default = "default_readiness_timeout")]
    pub readiness_timeout: u64,

    /// Seconds to wait for the helper to exit at unmount (default: 10)
    #[serde(default = "default_unmount_timeout")]
    pub unmount_timeout: u64,
}

impl Default for ExternalMountConfig {
    fn default() -> Self {
        Self {
            executable: default_mount_executable(),
            mount_base: None,
            mount_options: Vec::new(),
            readiness_timeout: default_readiness_timeout(),
            unmount_timeout: default_unmount_timeout(),
        }
    }
}

/// Media-server (Plex) integration settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PlexConfig {
    /// Base URL of the media server, e.g. `http://127.0.0.1:32400`
    pub host: String,

    /// Authentication token sent as `X-Plex-Token`
    pub token: String,

    /// Library section refreshed when a pair has no `library_id` override
    #[serde(default = "default_library_key", deserialize_with = "string_or_int")]
    pub library_key: String,
}

/// Per-source override of the global watch/target/strategy settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DirectoryPairConfig {
    /// Directory observed for new archive sets
    pub source: PathBuf,

    /// Library directory materialized files appear in
    pub target: PathBuf,

    /// Strategy override (falls back to `options.processing_mode`)
    #[serde(default)]
    pub strategy: Option<StrategyKind>,

    /// Library section override (falls back to `plex.library_key`)
    #[serde(default, deserialize_with = "opt_string_or_int")]
    pub library_id: Option<String>,

    /// Whether this pair is active (default: true)
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Whether subdirectories are observed too (default: true)
    #[serde(default = "default_true")]
    pub recursive: bool,
}

/// Log sink settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: `error`, `warn`, `info`, `debug` or `trace`
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Size threshold retained for compatibility with older configurations;
    /// rotation is per-run with count-capped retention
    #[serde(default = "default_max_log_size")]
    pub max_log_size: u64,

    /// Number of previous run logs kept (default: 5)
    #[serde(default = "default_backup_count")]
    pub backup_count: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            max_log_size: default_max_log_size(),
            backup_count: default_backup_count(),
        }
    }
}

/// External binary discovery settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Path to the unrar executable (auto-detected from PATH if unset)
    #[serde(default)]
    pub unrar_path: Option<PathBuf>,

    /// Whether to search PATH for external binaries when no explicit path is
    /// set (default: true)
    #[serde(default = "default_true")]
    pub search_path: bool,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            unrar_path: None,
            search_path: true,
        }
    }
}

/// Optional post-extraction re-encode hook
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReencodeConfig {
    /// Enable re-encoding of extracted files (default: false)
    #[serde(default)]
    pub enabled: bool,

    /// Encoder executable (e.g. HandBrakeCLI); required when enabled
    #[serde(default)]
    pub executable: Option<PathBuf>,

    /// Encoder preset name
    #[serde(default = "default_reencode_preset")]
    pub preset: String,

    /// Encoder quality value
    #[serde(default = "default_reencode_quality")]
    pub quality: f64,

    /// Wall-clock budget in seconds for one encode (default: 7200)
    #[serde(default = "default_reencode_timeout")]
    pub timeout: u64,
}

impl Default for ReencodeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            executable: None,
            preset: default_reencode_preset(),
            quality: default_reencode_quality(),
            timeout: default_reencode_timeout(),
        }
    }
}

/// Main configuration for the bridge
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Directory roles
    #[serde(default)]
    pub paths: PathsConfig,

    /// Processing behavior
    #[serde(default)]
    pub options: OptionsConfig,

    /// Virtual-HTTP server settings
    #[serde(default)]
    pub virtual_http: VirtualHttpConfig,

    /// External-mount helper settings
    #[serde(default)]
    pub external_mount: ExternalMountConfig,

    /// Media-server integration; refresh calls are skipped when absent
    #[serde(default)]
    pub plex: Option<PlexConfig>,

    /// Per-source overrides; when empty the global watch/target pair is used
    #[serde(default)]
    pub directory_pairs: Vec<DirectoryPairConfig>,

    /// Log sink settings
    #[serde(default)]
    pub logging: LoggingConfig,

    /// External binary discovery
    #[serde(default)]
    pub tools: ToolsConfig,

    /// Post-extraction re-encode hook
    #[serde(default)]
    pub reencode: ReencodeConfig,

    /// Install root every relative path resolves against (the directory the
    /// configuration file was loaded from)
    #[serde(skip)]
    pub root: PathBuf,
}

/// Top-level sections this version understands; anything else is warned about.
const KNOWN_SECTIONS: &[&str] = &[
    "paths",
    "options",
    "virtual_http",
    "external_mount",
    "plex",
    "directory_pairs",
    "logging",
    "tools",
    "reencode",
];

impl Config {
    /// Load and validate a configuration document.
    ///
    /// Unrecognized top-level sections are logged as warnings and ignored;
    /// missing required keys abort with [`Error::Config`].
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| Error::Config {
            message: format!("cannot read {}: {}", path.display(), e),
            key: None,
        })?;

        if let Ok(value) = contents.parse::<toml::Value>() {
            if let Some(table) = value.as_table() {
                for key in table.keys() {
                    if !KNOWN_SECTIONS.contains(&key.as_str()) {
                        tracing::warn!(section = %key, "ignoring unrecognized configuration section");
                    }
                }
            }
        }

        let mut config: Config = toml::from_str(&contents).map_err(|e| Error::Config {
            message: format!("cannot parse {}: {}", path.display(), e),
            key: None,
        })?;

        config.root = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        config.validate()?;
        Ok(config)
    }

    /// Check the invariants startup depends on.
    pub fn validate(&self) -> Result<()> {
        if self.directory_pairs.is_empty()
            && (self.paths.watch.is_none() || self.paths.target.is_none())
        {
            return Err(Error::Config {
                message: "either [paths] watch+target or at least one [[directory_pairs]] entry is required"
                    .into(),
                key: Some("paths.watch".into()),
            });
        }
        let [lo, hi] = self.virtual_http.port_range;
        if lo == 0 || lo > hi {
            return Err(Error::Config {
                message: format!("invalid port range {lo}-{hi}"),
                key: Some("virtual_http.port_range".into()),
            });
        }
        if self.options.file_stabilization_time == 0 {
            return Err(Error::Config {
                message: "file_stabilization_time must be at least 1 second".into(),
                key: Some("options.file_stabilization_time".into()),
            });
        }
        if self.options.retry_interval == 0 {
            return Err(Error::Config {
                message: "retry_interval must be at least 1 second".into(),
                key: Some("options.retry_interval".into()),
            });
        }
        if self.options.min_file_size > self.options.max_file_size {
            return Err(Error::Config {
                message: "min_file_size exceeds max_file_size".into(),
                key: Some("options.min_file_size".into()),
            });
        }
        if self.reencode.enabled && self.reencode.executable.is_none() {
            return Err(Error::Config {
                message: "reencode.executable is required when reencode.enabled".into(),
                key: Some("reencode.executable".into()),
            });
        }
        Ok(())
    }

    /// Resolved list of active source/target pairs.
    ///
    /// `[[directory_pairs]]` entries win; the global `[paths]` watch/target
    /// pair with `options.processing_mode` is the single-pair fallback.
    pub fn directory_pairs(&self) -> Vec<DirectoryPair> {
        let default_library = self
            .plex
            .as_ref()
            .map(|p| p.library_key.clone())
            .unwrap_or_else(default_library_key);

        if self.directory_pairs.is_empty() {
            match (&self.paths.watch, &self.paths.target) {
                (Some(watch), Some(target)) => vec![DirectoryPair {
                    source: self.resolve(watch),
                    target: self.resolve(target),
                    strategy: self.options.processing_mode,
                    library_id: default_library,
                    enabled: true,
                    recursive: true,
                }],
                _ => Vec::new(),
            }
        } else {
            self.directory_pairs
                .iter()
                .filter(|p| p.enabled)
                .map(|p| DirectoryPair {
                    source: self.resolve(&p.source),
                    target: self.resolve(&p.target),
                    strategy: p.strategy.unwrap_or(self.options.processing_mode),
                    library_id: p.library_id.clone().unwrap_or_else(|| default_library.clone()),
                    enabled: true,
                    recursive: p.recursive,
                })
                .collect()
        }
    }

    /// Extraction scratch directory.
    pub fn work_dir(&self) -> PathBuf {
        self.dir_or(&self.paths.work, "work")
    }

    /// Quarantine directory.
    pub fn failed_dir(&self) -> PathBuf {
        self.dir_or(&self.paths.failed, "failed")
    }

    /// Destination for relocated processed archives.
    pub fn archive_dir(&self) -> PathBuf {
        self.dir_or(&self.paths.archive, "archive")
    }

    /// Mount-point base directory.
    pub fn mounts_dir(&self) -> PathBuf {
        self.dir_or(&self.external_mount.mount_base, "mounts")
    }

    /// Persistent fingerprint index location.
    pub fn database_path(&self) -> PathBuf {
        self.root.join("data").join("duplicates.db")
    }

    /// Rotated log sink directory.
    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    /// Stabilization window (§ directory watcher).
    pub fn stabilization_window(&self) -> Duration {
        Duration::from_secs(self.options.file_stabilization_time)
    }

    /// Unstable-but-submit-anyway horizon.
    pub fn max_file_age(&self) -> Duration {
        Duration::from_secs(self.options.max_file_age)
    }

    /// Fixed retry cadence.
    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.options.retry_interval)
    }

    /// Wall-clock bound on retrying one item.
    pub fn max_retry_age(&self) -> Duration {
        Duration::from_secs(self.options.max_retry_age_hours * 3600)
    }

    /// Integrity-test budget.
    pub fn test_timeout(&self) -> Duration {
        Duration::from_secs(self.options.test_timeout)
    }

    /// Worker drain budget at shutdown.
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.options.shutdown_grace)
    }

    fn dir_or(&self, configured: &Option<PathBuf>, fallback: &str) -> PathBuf {
        match configured {
            Some(p) => self.resolve(p),
            None => self.root.join(fallback),
        }
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_extensions() -> Vec<String> {
    vec![".rar".to_string()]
}

fn default_stabilization() -> u64 {
    10
}

fn default_max_file_age() -> u64 {
    3600
}

fn default_max_retry_attempts() -> u32 {
    3
}

fn default_retry_interval() -> u64 {
    60
}

fn default_max_retry_age_hours() -> u64 {
    4
}

fn default_min_file_size() -> u64 {
    1024 * 1024
}

fn default_max_file_size() -> u64 {
    100 * 1024 * 1024 * 1024
}

fn default_test_timeout() -> u64 {
    300
}

fn default_shutdown_grace() -> u64 {
    30
}

fn default_port_range() -> [u16; 2] {
    [8765, 8865]
}

fn default_max_streams() -> usize {
    10
}

fn default_chunk_size() -> usize {
    8 * 1024
}

fn default_fallback_threshold() -> u64 {
    15 * 1024 * 1024 * 1024
}

fn default_mount_executable() -> PathBuf {
    PathBuf::from("rar2fs")
}

fn default_readiness_timeout() -> u64 {
    30
}

fn default_unmount_timeout() -> u64 {
    10
}

fn default_library_key() -> String {
    "1".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_log_size() -> u64 {
    10 * 1024 * 1024
}

fn default_backup_count() -> usize {
    5
}

fn default_reencode_preset() -> String {
    "Fast 1080p30".to_string()
}

fn default_reencode_quality() -> f64 {
    22.0
}

fn default_reencode_timeout() -> u64 {
    7200
}

/// Accept both `library_key = 1` and `library_key = "1"`.
fn string_or_int<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<String, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrInt {
        Str(String),
        Int(i64),
    }
    Ok(match StringOrInt::deserialize(deserializer)? {
        StringOrInt::Str(s) => s,
        StringOrInt::Int(i) => i.to_string(),
    })
}

/// Optional variant of [`string_or_int`].
fn opt_string_or_int<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<Option<String>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrInt {
        Str(String),
        Int(i64),
    }
    Ok(Option::<StringOrInt>::deserialize(deserializer)?.map(|v| match v {
        StringOrInt::Str(s) => s,
        StringOrInt::Int(i) => i.to_string(),
    }))
}
