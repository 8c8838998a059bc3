//! Configuration for jobscout.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (JOBSCOUT_HOME, JOBSCOUT_COST_CEILING_USD, JOBSCOUT_STORE)
//! 2. Config file (.jobscout/config.yaml)
//! 3. Defaults (~/.jobscout)
//!
//! Config file discovery:
//! - Searches current directory and parents for .jobscout/config.yaml
//! - Relative paths in the config file resolve against the .jobscout/ directory

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, OnceLock};

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::core::{CheckpointStore, FileCheckpointStore, SqliteCheckpointStore};

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

/// Default spend ceiling per run, in USD
pub const DEFAULT_COST_CEILING_USD: f64 = 5.0;

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    pub version: String,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub orchestrator: Option<OrchestratorConfig>,
    #[serde(default)]
    pub checkpoints: Option<CheckpointsConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// Engine state directory (relative to .jobscout/)
    pub home: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrchestratorConfig {
    pub cost_ceiling_usd: Option<f64>,
    pub step_timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CheckpointsConfig {
    pub backend: Option<String>,
    /// Directory (file backend) or database file (sqlite backend)
    pub location: Option<String>,
}

/// Where checkpoints are kept
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreBackend {
    #[default]
    File,
    Sqlite,
}

impl FromStr for StoreBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "file" | "files" => Ok(Self::File),
            "sqlite" => Ok(Self::Sqlite),
            other => bail!("Unknown checkpoint backend '{}' (expected file or sqlite)", other),
        }
    }
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Absolute path to jobscout home (engine state)
    pub home: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    pub settings: OrchestratorSettings,
    pub store: StoreSettings,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorSettings {
    pub cost_ceiling_usd: f64,
    pub step_timeout_seconds: u64,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            cost_ceiling_usd: DEFAULT_COST_CEILING_USD,
            step_timeout_seconds: 300,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoreSettings {
    pub backend: StoreBackend,
    pub location: PathBuf,
}

impl StoreSettings {
    fn default_for(home: &Path, backend: StoreBackend) -> Self {
        let location = match backend {
            StoreBackend::File => home.join("runs"),
            StoreBackend::Sqlite => home.join("checkpoints.db"),
        };
        Self { backend, location }
    }
}

impl ResolvedConfig {
    /// Open the configured checkpoint store
    pub fn open_store(&self) -> Result<Arc<dyn CheckpointStore>> {
        match self.store.backend {
            StoreBackend::File => Ok(Arc::new(FileCheckpointStore::open(&self.store.location)?)),
            StoreBackend::Sqlite => Ok(Arc::new(SqliteCheckpointStore::open(&self.store.location)?)),
        }
    }
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(".jobscout").join("config.yaml");
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

/// Resolve a path that may be relative to `base`
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

/// Snapshot of the environment variables that override config
#[derive(Debug, Clone, Default)]
struct EnvOverrides {
    home: Option<String>,
    cost_ceiling_usd: Option<String>,
    store: Option<String>,
}

impl EnvOverrides {
    fn from_env() -> Self {
        Self {
            home: std::env::var("JOBSCOUT_HOME").ok(),
            cost_ceiling_usd: std::env::var("JOBSCOUT_COST_CEILING_USD").ok(),
            store: std::env::var("JOBSCOUT_STORE").ok(),
        }
    }
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(".jobscout");

    let config_file = find_config_file();
    let file = config_file.as_deref().map(load_config_file).transpose()?;

    resolve(default_home, config_file, file, EnvOverrides::from_env())
}

fn resolve(
    default_home: PathBuf,
    config_path: Option<PathBuf>,
    file: Option<ConfigFile>,
    env: EnvOverrides,
) -> Result<ResolvedConfig> {
    // Relative paths in the file are anchored at .jobscout/
    let anchor = config_path
        .as_deref()
        .and_then(Path::parent)
        .unwrap_or(Path::new("."))
        .to_path_buf();

    let home = if let Some(env_home) = env.home {
        PathBuf::from(env_home)
    } else if let Some(home_path) = file.as_ref().and_then(|f| f.paths.home.as_deref()) {
        resolve_path(&anchor, home_path)
    } else {
        default_home
    };

    let mut settings = OrchestratorSettings::default();
    if let Some(orch) = file.as_ref().and_then(|f| f.orchestrator.as_ref()) {
        if let Some(ceiling) = orch.cost_ceiling_usd {
            settings.cost_ceiling_usd = ceiling;
        }
        if let Some(timeout) = orch.step_timeout_seconds {
            settings.step_timeout_seconds = timeout;
        }
    }
    if let Some(raw) = env.cost_ceiling_usd {
        settings.cost_ceiling_usd = raw
            .parse()
            .with_context(|| format!("Invalid JOBSCOUT_COST_CEILING_USD: {}", raw))?;
    }
    if settings.cost_ceiling_usd < 0.0 {
        bail!("Cost ceiling must not be negative: {}", settings.cost_ceiling_usd);
    }

    let checkpoints = file.as_ref().and_then(|f| f.checkpoints.as_ref());
    let backend = match env
        .store
        .as_deref()
        .or_else(|| checkpoints.and_then(|c| c.backend.as_deref()))
    {
        Some(raw) => raw.parse()?,
        None => StoreBackend::default(),
    };
    let mut store = StoreSettings::default_for(&home, backend);
    if let Some(location) = checkpoints.and_then(|c| c.location.as_deref()) {
        store.location = resolve_path(&anchor, location);
    }

    Ok(ResolvedConfig {
        home,
        config_file: config_path,
        settings,
        store,
    })
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| format!("{:#}", e)));

    match result {
        Ok(config) => Ok(config),
        Err(e) => bail!("{}", e),
    }
}

/// Open the checkpoint store named by the configuration
pub fn open_store() -> Result<Arc<dyn CheckpointStore>> {
    config()?.open_store()
}
