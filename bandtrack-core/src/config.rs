//! Configuration loading and root folder resolution
//!
//! Root folder priority order:
//! 1. Command-line argument (highest priority)
//! 2. Environment variable (`BANDTRACK_ROOT_FOLDER`, then legacy `BANDTRACK_ROOT`)
//! 3. TOML config file (`root_folder` key)
//! 4. OS-dependent compiled default (fallback)
//!
//! A missing or unreadable config file never stops startup: it is logged and
//! the compiled defaults are used instead.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Primary root folder environment variable
pub const ROOT_FOLDER_ENV: &str = "BANDTRACK_ROOT_FOLDER";
/// Legacy alias, consulted after [`ROOT_FOLDER_ENV`]
pub const ROOT_FOLDER_ENV_LEGACY: &str = "BANDTRACK_ROOT";
/// Database file name used when the config file does not override it
pub const DEFAULT_DATABASE_FILE: &str = "bandtrack.db";

/// Logging section of the TOML config
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Database section of the TOML config
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// File name inside the root folder
    #[serde(default)]
    pub file_name: Option<String>,
}

/// Contents of `config.toml`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TomlConfig {
    #[serde(default)]
    pub root_folder: Option<PathBuf>,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
}

impl TomlConfig {
    /// Parse a config file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse {}: {}", path.display(), e)))
    }
}

/// Values used when nothing else is configured
#[derive(Debug, Clone)]
pub struct CompiledDefaults {
    pub root_folder: PathBuf,
    pub log_level: String,
    pub log_file: Option<PathBuf>,
}

impl CompiledDefaults {
    pub fn for_current_platform() -> Self {
        Self {
            root_folder: default_root_folder(),
            log_level: default_log_level(),
            log_file: None,
        }
    }
}

fn default_root_folder() -> PathBuf {
    if cfg!(target_os = "linux") {
        // ~/.local/share/bandtrack (or /var/lib/bandtrack for system-wide)
        dirs::data_local_dir()
            .map(|d| d.join("bandtrack"))
            .unwrap_or_else(|| PathBuf::from("/var/lib/bandtrack"))
    } else if cfg!(target_os = "macos") {
        dirs::data_dir()
            .map(|d| d.join("bandtrack"))
            .unwrap_or_else(|| PathBuf::from("/Library/Application Support/bandtrack"))
    } else if cfg!(target_os = "windows") {
        dirs::data_local_dir()
            .map(|d| d.join("bandtrack"))
            .unwrap_or_else(|| PathBuf::from("C:\\ProgramData\\bandtrack"))
    } else {
        PathBuf::from("./bandtrack_data")
    }
}

/// Locate the platform config file, if one exists
fn default_config_file() -> Option<PathBuf> {
    let user_config = dirs::config_dir().map(|d| d.join("bandtrack").join("config.toml"));
    if let Some(path) = user_config {
        if path.exists() {
            return Some(path);
        }
    }

    if cfg!(target_os = "linux") {
        let system_config = PathBuf::from("/etc/bandtrack/config.toml");
        if system_config.exists() {
            return Some(system_config);
        }
    }

    None
}

/// Resolves the root folder and loads the TOML config for one binary
pub struct RootFolderResolver {
    module_name: String,
    cli_arg: Option<PathBuf>,
    config_file: Option<PathBuf>,
}

impl RootFolderResolver {
    pub fn new(module_name: impl Into<String>) -> Self {
        Self {
            module_name: module_name.into(),
            cli_arg: None,
            config_file: None,
        }
    }

    /// Root folder given on the command line
    pub fn with_cli_arg(mut self, path: Option<PathBuf>) -> Self {
        self.cli_arg = path;
        self
    }

    /// Use an explicit config file instead of the platform location
    pub fn with_config_file(mut self, path: Option<PathBuf>) -> Self {
        self.config_file = path;
        self
    }

    /// Load the TOML config, falling back to defaults on any problem
    pub fn config(&self) -> TomlConfig {
        let path = match self.config_file.clone().or_else(default_config_file) {
            Some(path) => path,
            None => {
                debug!(module = %self.module_name, "No config file found, using defaults");
                return TomlConfig::default();
            }
        };

        match TomlConfig::load(&path) {
            Ok(config) => config,
            Err(e) => {
                warn!(
                    module = %self.module_name,
                    "Ignoring config file {}: {}",
                    path.display(),
                    e
                );
                TomlConfig::default()
            }
        }
    }

    pub fn resolve(&self) -> PathBuf {
        if let Some(path) = &self.cli_arg {
            return path.clone();
        }

        for var in [ROOT_FOLDER_ENV, ROOT_FOLDER_ENV_LEGACY] {
            if let Ok(path) = std::env::var(var) {
                if !path.is_empty() {
                    return PathBuf::from(path);
                }
            }
        }

        if let Some(path) = self.config().root_folder {
            return path;
        }

        CompiledDefaults::for_current_platform().root_folder
    }
}

/// Prepares the resolved root folder and locates the database inside it
pub struct RootFolderInitializer {
    root_folder: PathBuf,
    database_file: String,
}

impl RootFolderInitializer {
    pub fn new(root_folder: PathBuf) -> Self {
        Self {
            root_folder,
            database_file: DEFAULT_DATABASE_FILE.to_string(),
        }
    }

    /// Override the database file name from `[database] file_name`
    pub fn with_database_config(mut self, config: &DatabaseConfig) -> Self {
        if let Some(name) = &config.file_name {
            self.database_file = name.clone();
        }
        self
    }

    pub fn ensure_directory_exists(&self) -> Result<()> {
        std::fs::create_dir_all(&self.root_folder)?;
        Ok(())
    }

    pub fn database_path(&self) -> PathBuf {
        self.root_folder.join(&self.database_file)
    }

    pub fn database_exists(&self) -> bool {
        self.database_path().exists()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logging_defaults() {
        let logging = LoggingConfig::default();
        assert_eq!(logging.level, "info");
        assert!(logging.file.is_none());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: TomlConfig = toml::from_str("root_folder = \"/srv/band\"").unwrap();
        assert_eq!(config.root_folder, Some(PathBuf::from("/srv/band")));
        assert_eq!(config.logging.level, "info");
        assert!(config.database.file_name.is_none());
    }

    #[test]
    fn test_database_file_override() {
        let config = DatabaseConfig {
            file_name: Some("rehearsals.db".to_string()),
        };
        let init = RootFolderInitializer::new(PathBuf::from("/tmp/bt")).with_database_config(&config);
        assert_eq!(init.database_path(), PathBuf::from("/tmp/bt/rehearsals.db"));
    }

    #[test]
    fn test_cli_arg_wins() {
        let resolver = RootFolderResolver::new("test")
            .with_cli_arg(Some(PathBuf::from("/tmp/from-cli")));
        assert_eq!(resolver.resolve(), PathBuf::from("/tmp/from-cli"));
    }
}
