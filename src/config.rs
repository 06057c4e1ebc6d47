//! Configuration for gantry paths and engine defaults.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (GANTRY_HOME)
//! 2. Config file (.gantry/config.yaml)
//! 3. Defaults (~/.gantry)
//!
//! Config file discovery:
//! - Searches current directory and parents for .gantry/config.yaml
//! - Paths in config file are relative to the config file's parent directory

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<std::result::Result<ResolvedConfig, String>> = OnceLock::new();

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    pub version: String,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub engine: Option<EngineConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// Engine state directory (relative to config file)
    pub home: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    pub concurrency: Option<usize>,
    pub retention_days: Option<u64>,
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Absolute path to gantry home (engine state)
    pub home: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    /// Engine settings
    pub engine: EngineSettings,
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Default parallel-job limit for `run`
    pub concurrency: usize,
    /// Retention window for `gc`, in days
    pub retention_days: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            concurrency: 4,
            retention_days: 30,
        }
    }
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(".gantry").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to the config file's parent
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    // Default home directory
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(".gantry");

    // Check for config file
    let config_file = find_config_file();

    let (home, engine) = if let Some(ref config_path) = config_file {
        let config = load_config_file(config_path)?;

        // Resolve home path
        let home = if let Ok(env_home) = std::env::var("GANTRY_HOME") {
            PathBuf::from(env_home)
        } else if let Some(ref home_path) = config.paths.home {
            // home is relative to .gantry/ directory
            let gantry_dir = config_path.parent().unwrap_or(Path::new("."));
            resolve_path(gantry_dir, home_path)
        } else {
            default_home.clone()
        };

        let defaults = EngineSettings::default();
        let engine = EngineSettings {
            concurrency: config
                .engine
                .as_ref()
                .and_then(|e| e.concurrency)
                .unwrap_or(defaults.concurrency),
            retention_days: config
                .engine
                .as_ref()
                .and_then(|e| e.retention_days)
                .unwrap_or(defaults.retention_days),
        };

        (home, engine)
    } else {
        // No config file - use env vars or defaults
        let home = std::env::var("GANTRY_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_home.clone());

        (home, EngineSettings::default())
    };

    Ok(ResolvedConfig {
        home,
        config_file,
        engine,
    })
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| e.to_string()));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

/// Force reload configuration (useful for testing)
pub fn reload_config() -> Result<ResolvedConfig> {
    load_config()
}

// ============================================================================
// Convenience functions
// ============================================================================

/// Get the gantry home directory (engine state).
pub fn gantry_home() -> Result<PathBuf> {
    Ok(config()?.home.clone())
}

/// Get the runs directory ($GANTRY_HOME/runs)
pub fn runs_dir() -> Result<PathBuf> {
    Ok(config()?.home.join("runs"))
}
