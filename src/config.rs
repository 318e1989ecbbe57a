//! Configuration for the project file index.
//!
//! Layered the usual way:
//! - Default values
//! - TOML configuration file (`.projfs/settings.toml`)
//! - Environment variable overrides
//!
//! # Environment Variables
//!
//! Environment variables must be prefixed with `PROJFS_` and use double
//! underscores to separate nested levels:
//! - `PROJFS_CRAWL__MAX_CONCURRENT_IO=8` sets `crawl.max_concurrent_io`
//! - `PROJFS_WATCH__BACKEND=recursive` sets `watch.backend`
//! - `PROJFS_PROJECT__MANIFEST_FILENAME=manifest.json` sets `project.manifest_filename`

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Directory holding the settings file, searched for upwards from the cwd.
pub const CONFIG_DIR_NAME: &str = ".projfs";

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct Settings {
    /// Version of the configuration schema
    #[serde(default = "default_version")]
    pub version: u32,

    #[serde(default)]
    pub crawl: CrawlConfig,

    #[serde(default)]
    pub project: ProjectConfig,

    #[serde(default)]
    pub watch: WatchConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct CrawlConfig {
    /// Basenames that are never indexed (VCS metadata, package manager caches).
    #[serde(default = "default_denylist")]
    pub denylist: Vec<String>,

    /// Basenames crawled to completion before their siblings start.
    #[serde(default = "default_priority")]
    pub priority: Vec<String>,

    /// Upper bound on stat/read_dir/read calls in flight.
    #[serde(default = "default_max_concurrent_io")]
    pub max_concurrent_io: usize,

    /// Extensions recognized by the default file handlers.
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct ProjectConfig {
    #[serde(default = "default_manifest_filename")]
    pub manifest_filename: String,

    /// Directory holding third-party packages.
    #[serde(default = "default_dependency_dir")]
    pub dependency_dir: String,

    /// Directory that may hold the project config file.
    #[serde(default = "default_config_dir")]
    pub config_dir: String,

    #[serde(default = "default_config_filenames")]
    pub config_filenames: Vec<String>,

    /// Manifest field whose presence makes its directory a project root.
    #[serde(default = "default_embedded_config_field")]
    pub embedded_config_field: String,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum WatchBackendKind {
    /// Recursive where the OS supports it, per-directory elsewhere.
    #[default]
    Auto,
    Recursive,
    PerDirectory,
}

impl WatchBackendKind {
    /// Resolve `Auto` for the current platform.
    pub fn resolve(self) -> WatchBackendKind {
        match self {
            WatchBackendKind::Auto => {
                if cfg!(any(target_os = "macos", target_os = "windows")) {
                    WatchBackendKind::Recursive
                } else {
                    WatchBackendKind::PerDirectory
                }
            }
            other => other,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct WatchConfig {
    #[serde(default)]
    pub backend: WatchBackendKind,

    /// Capacity of the file event broadcast channel.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct LoggingConfig {
    /// Default level: error, warn, info, debug, trace
    #[serde(default = "default_log_level")]
    pub default: String,

    /// Per-module overrides, e.g. `crawler = "debug"`
    #[serde(default)]
    pub modules: HashMap<String, String>,
}

// Default value functions
fn default_version() -> u32 {
    1
}
fn default_denylist() -> Vec<String> {
    [".git", ".hg", ".svn", ".cache", ".yarn", ".pnpm-store"]
        .into_iter()
        .map(String::from)
        .collect()
}
fn default_priority() -> Vec<String> {
    vec![default_config_dir(), default_manifest_filename()]
}
fn default_max_concurrent_io() -> usize {
    num_cpus::get() * 4
}
fn default_extensions() -> Vec<String> {
    [
        "js", "jsx", "mjs", "cjs", "ts", "tsx", "mts", "cts", "json", "jsonc", "md", "css",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}
fn default_manifest_filename() -> String {
    "package.json".to_string()
}
fn default_dependency_dir() -> String {
    "node_modules".to_string()
}
fn default_config_dir() -> String {
    ".config".to_string()
}
fn default_config_filenames() -> Vec<String> {
    vec!["projfs.json".to_string()]
}
fn default_embedded_config_field() -> String {
    "projfs".to_string()
}
fn default_event_capacity() -> usize {
    1024
}
fn default_log_level() -> String {
    "warn".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: default_version(),
            crawl: CrawlConfig::default(),
            project: ProjectConfig::default(),
            watch: WatchConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            denylist: default_denylist(),
            priority: default_priority(),
            max_concurrent_io: default_max_concurrent_io(),
            extensions: default_extensions(),
        }
    }
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            manifest_filename: default_manifest_filename(),
            dependency_dir: default_dependency_dir(),
            config_dir: default_config_dir(),
            config_filenames: default_config_filenames(),
            embedded_config_field: default_embedded_config_field(),
        }
    }
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            backend: WatchBackendKind::default(),
            event_capacity: default_event_capacity(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            default: default_log_level(),
            modules: HashMap::new(),
        }
    }
}

impl Settings {
    /// Load configuration from all sources
    pub fn load() -> Result<Self, Box<figment::Error>> {
        let config_path = Self::find_workspace_config()
            .unwrap_or_else(|| PathBuf::from(CONFIG_DIR_NAME).join("settings.toml"));
        Self::load_from(config_path)
    }

    /// Load configuration from a specific file, still honoring env overrides.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, Box<figment::Error>> {
        Figment::new()
            .merge(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path.as_ref()))
            // Double underscore separates nested levels; single underscores
            // stay inside field names.
            .merge(Env::prefixed("PROJFS_").split("__"))
            .extract()
            .map_err(Box::new)
    }

    /// Find `.projfs/settings.toml` from the current directory up to root
    fn find_workspace_config() -> Option<PathBuf> {
        let current = std::env::current_dir().ok()?;

        for ancestor in current.ancestors() {
            let config_dir = ancestor.join(CONFIG_DIR_NAME);
            if config_dir.is_dir() {
                return Some(config_dir.join("settings.toml"));
            }
        }

        None
    }

    /// Save current configuration to file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), Box<dyn std::error::Error>> {
        let parent = path.as_ref().parent().ok_or("Invalid path")?;
        std::fs::create_dir_all(parent)?;

        let toml_string = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_string)?;

        Ok(())
    }
}
