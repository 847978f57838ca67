//! Context configuration
//!
//! A [`Config`] says where the subsystem looks for modules and which
//! modprobe configuration files it reads. The empty config leaves both to
//! the subsystem defaults (`/lib/modules/$(uname -r)` and the usual
//! `modprobe.d` directories).
//!
//! Files are looked up the XDG way: every `$XDG_CONFIG_DIRS/kmodctl/config.toml`
//! first, then `$XDG_CONFIG_HOME/kmodctl/config.toml`. Later files override
//! earlier ones key by key.
//!
//! ```toml
//! module_dir = "/lib/modules/6.8.0-custom"
//! config_paths = ["/etc/modprobe.d", "/run/modprobe.d"]
//! ```

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Environment variable that overrides `module_dir` from any file.
pub const MODULE_DIR_ENV: &str = "KMODCTL_MODULE_DIR";

const CONFIG_DIR_NAME: &str = "kmodctl";
const CONFIG_FILE_NAME: &str = "config.toml";

/// Errors while reading configuration files.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid TOML in {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Where the subsystem should look for modules and modprobe configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Config {
    /// Module search directory; `None` means the running kernel's tree.
    pub module_dir: Option<PathBuf>,
    /// modprobe configuration files/directories; empty means the defaults.
    pub config_paths: Vec<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct ConfigToml {
    module_dir: Option<PathBuf>,
    config_paths: Option<Vec<PathBuf>>,
}

impl ConfigToml {
    fn merge(&mut self, other: ConfigToml) {
        if other.module_dir.is_some() {
            self.module_dir = other.module_dir;
        }
        if other.config_paths.is_some() {
            self.config_paths = other.config_paths;
        }
    }
}

impl From<ConfigToml> for Config {
    fn from(raw: ConfigToml) -> Self {
        Config {
            module_dir: raw.module_dir,
            config_paths: raw.config_paths.unwrap_or_default(),
        }
    }
}

impl Config {
    /// Use `dir` as the module search directory.
    pub fn with_module_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.module_dir = Some(dir.into());
        self
    }

    /// Read modprobe configuration from `path` in addition to any already set.
    pub fn with_config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_paths.push(path.into());
        self
    }

    /// Load a single, explicitly named file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        read_toml(path).map(Config::from)
    }

    /// Merge every existing file in `candidates`, in order. Missing files are
    /// skipped; no file at all yields the default config.
    pub fn load_from(candidates: &[PathBuf]) -> Result<Self, ConfigError> {
        let mut merged = ConfigToml::default();
        for path in candidates {
            if !path.exists() {
                continue;
            }
            merged.merge(read_toml(path)?);
        }
        Ok(merged.into())
    }

    /// Load from the XDG search path, then apply the environment override.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::load_from(&search_paths())?;
        if let Some(dir) = std::env::var_os(MODULE_DIR_ENV).filter(|v| !v.is_empty()) {
            config.module_dir = Some(PathBuf::from(dir));
        }
        Ok(config)
    }
}

/// Candidate config files, lowest precedence first.
pub fn search_paths() -> Vec<PathBuf> {
    let mut paths: Vec<PathBuf> = split_xdg_config_dirs()
        .into_iter()
        .map(|dir| dir.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
        .collect();
    paths.push(xdg_config_home().join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME));
    paths
}

fn split_xdg_config_dirs() -> Vec<PathBuf> {
    let raw = std::env::var("XDG_CONFIG_DIRS").unwrap_or_else(|_| "/etc/xdg".to_owned());
    raw.split(':')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
        .collect()
}

fn xdg_config_home() -> PathBuf {
    if let Ok(raw) = std::env::var("XDG_CONFIG_HOME") {
        let trimmed = raw.trim();
        if !trimmed.is_empty() {
            return PathBuf::from(trimmed);
        }
    }
    dirs::config_dir().unwrap_or_else(|| PathBuf::from(".").join(".config"))
}

fn read_toml(path: &Path) -> Result<ConfigToml, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str::<ConfigToml>(&text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}
