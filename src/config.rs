use std::collections::{BTreeMap, HashMap};
use std::env;
use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::de::Deserializer;
use serde::{Deserialize, Serialize};
use tracing::debug;

pub const DATA_DIR_ENV: &str = "REORG_DATA_DIR";
pub const CONFIG_ENV: &str = "REORG_CONFIG";
const DEFAULT_DATA_DIR: &str = ".reorg";

/// Per-plugin settings from the `plugins:` section of the config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginSettings {
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    /// Overrides the manifest's schedule when set and non-empty.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,
    #[serde(default, deserialize_with = "string_map")]
    pub config: HashMap<String, String>,
}

fn enabled_by_default() -> bool {
    true
}

impl Default for PluginSettings {
    fn default() -> Self {
        Self { enabled: true, schedule: None, config: HashMap::new() }
    }
}

impl PluginSettings {
    pub fn schedule_override(&self) -> Option<&str> {
        self.schedule.as_deref().map(str::trim).filter(|s| !s.is_empty())
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Scalar {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Bool(b) => write!(f, "{b}"),
            Scalar::Int(i) => write!(f, "{i}"),
            Scalar::Float(x) => write!(f, "{x}"),
            Scalar::Text(s) => f.write_str(s),
        }
    }
}

/// Plugin config maps are flat strings; YAML scalars such as `auto: true`
/// are accepted and stringified.
fn string_map<'de, D>(deserializer: D) -> Result<HashMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<HashMap<String, Scalar>> = Option::deserialize(deserializer)?;
    Ok(raw
        .unwrap_or_default()
        .into_iter()
        .map(|(k, v)| (k, v.to_string()))
        .collect())
}

#[derive(Debug, Default, Deserialize)]
pub struct PluginsSection {
    #[serde(default)]
    pub dir: Option<String>,
    #[serde(flatten)]
    pub entries: BTreeMap<String, PluginSettings>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub plugins: PluginsSection,
}

impl ConfigFile {
    pub fn parse(text: &str) -> anyhow::Result<Self> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml_bw::from_str(text)?)
    }

    /// A missing file yields the defaults.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("invalid config file {}", path.display()))
    }
}

/// Everything a command needs to know about where things live.
#[derive(Debug, Clone)]
pub struct Settings {
    pub data_dir: PathBuf,
    pub config_file: PathBuf,
    pub plugin_dir: PathBuf,
    pub state_dir: PathBuf,
    pub log_dir: PathBuf,
    pub plugins: BTreeMap<String, PluginSettings>,
    /// `.env` files applied to the environment, in load order.
    pub env_files: Vec<PathBuf>,
}

impl Settings {
    /// Resolves directories from the flags and environment, loads `.env`
    /// files and parses the config file.
    /// Runs before logging is set up, so it logs nothing itself; the loaded
    /// `.env` files are reported through [`Settings::env_files`].
    pub fn load(data_dir: Option<PathBuf>, config_file: Option<PathBuf>) -> anyhow::Result<Self> {
        let mut env_files = Vec::new();
        load_env_file(Path::new(".env"), &mut env_files)?;
        let data_dir = resolve_data_dir(data_dir);
        load_env_file(&data_dir.join(".env"), &mut env_files)?;

        let config_file = config_file
            .or_else(|| env::var_os(CONFIG_ENV).map(PathBuf::from))
            .unwrap_or_else(|| data_dir.join("config.yaml"));
        let file = ConfigFile::load(&config_file)?;
        let mut settings = Self::from_file(data_dir, config_file, file);
        settings.env_files = env_files;
        Ok(settings)
    }

    pub fn from_file(data_dir: PathBuf, config_file: PathBuf, file: ConfigFile) -> Self {
        let plugin_dir = match file.plugins.dir.as_deref().map(str::trim).filter(|d| !d.is_empty()) {
            Some(dir) => expand_home(dir),
            None => data_dir.join("plugins"),
        };
        Self {
            state_dir: data_dir.join("state"),
            log_dir: data_dir.join("logs"),
            plugins: file.plugins.entries,
            env_files: Vec::new(),
            plugin_dir,
            config_file,
            data_dir,
        }
    }

    /// The settings for `name`, or the defaults when it has no entry.
    pub fn plugin(&self, name: &str) -> PluginSettings {
        self.plugins.get(name).cloned().unwrap_or_default()
    }

    pub fn store_file(&self) -> PathBuf {
        self.data_dir.join("store.json")
    }
}

pub fn resolve_data_dir(flag: Option<PathBuf>) -> PathBuf {
    if let Some(dir) = flag {
        return dir;
    }
    if let Some(dir) = env::var(DATA_DIR_ENV).ok().filter(|d| !d.trim().is_empty()) {
        return expand_home(&dir);
    }
    dirs::home_dir()
        .map(|home| home.join(DEFAULT_DATA_DIR))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR))
}

pub fn expand_home(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}

fn load_env_file(path: &Path, loaded: &mut Vec<PathBuf>) -> anyhow::Result<()> {
    if !path.exists() {
        return Ok(());
    }
    dotenvy::from_path(path).with_context(|| format!("could not load .env from {}", path.display()))?;
    loaded.push(path.to_path_buf());
    Ok(())
}
