//! Configuration file loading.

use std::fs;
use std::path::{Path, PathBuf};

use leaseq_queue::QueueConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("Environment variable not set: {0}")]
    EnvVarNotSet(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter when RUST_LOG is unset.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Directory for daily-rotated log files (console only when unset).
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            dir: None,
        }
    }
}

/// Base directory for leaseq state.
pub(crate) fn leaseq_dir() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".leaseq"))
        .unwrap_or_else(|| PathBuf::from(".leaseq"))
}

/// Configuration loader with environment variable substitution.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<AppConfig, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.display().to_string()));
        }
        let content = fs::read_to_string(path)?;
        Self::load_str(&content)
    }

    /// Load configuration from a string.
    pub fn load_str(content: &str) -> Result<AppConfig, ConfigError> {
        let expanded = Self::expand_env_vars(content)?;
        let mut config: AppConfig = toml::from_str(&expanded)?;
        config.queue.db_path = config.queue.db_path.map(|p| Self::expand_pathbuf(&p));
        config.logging.dir = config.logging.dir.map(|p| Self::expand_pathbuf(&p));
        Ok(config)
    }

    /// Resolve the effective configuration for the CLI.
    ///
    /// An explicit path must exist; the default path is optional. The
    /// database falls back to `~/.leaseq/queue.db`.
    pub fn resolve(
        explicit: Option<&Path>,
        db_override: Option<&Path>,
    ) -> Result<AppConfig, ConfigError> {
        let mut config = match explicit {
            Some(path) => Self::load(path)?,
            None => {
                let default_path = leaseq_dir().join("config.toml");
                if default_path.exists() {
                    Self::load(&default_path)?
                } else {
                    AppConfig::default()
                }
            }
        };

        if let Some(db) = db_override {
            config.queue.db_path = Some(Self::expand_pathbuf(db));
        }
        if config.queue.db_path.is_none() {
            config.queue.db_path = Some(leaseq_dir().join("queue.db"));
        }

        config.queue.validate().map_err(|e| ConfigError::InvalidValue {
            field: "queue".to_string(),
            message: e.to_string(),
        })?;
        Ok(config)
    }

    /// Expand environment variables in the format `${VAR}`.
    fn expand_env_vars(content: &str) -> Result<String, ConfigError> {
        let mut result = content.to_string();
        let re = regex::Regex::new(r"\$\{([^}]+)\}").map_err(|e| ConfigError::InvalidValue {
            field: "pattern".to_string(),
            message: e.to_string(),
        })?;

        for cap in re.captures_iter(content) {
            let var_name = &cap[1];
            let var_value = std::env::var(var_name)
                .map_err(|_| ConfigError::EnvVarNotSet(var_name.to_string()))?;
            result = result.replace(&cap[0], &var_value);
        }

        Ok(result)
    }

    /// Expand shell-style paths (e.g., `~/.leaseq`).
    pub fn expand_path(path: &str) -> String {
        shellexpand::tilde(path).to_string()
    }

    fn expand_pathbuf(path: &Path) -> PathBuf {
        match path.to_str() {
            Some(s) => PathBuf::from(Self::expand_path(s)),
            None => path.to_path_buf(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::{NamedTempFile, TempDir};

    #[test]
    fn test_load_empty_config() {
        let config = ConfigLoader::load_str("").unwrap();
        assert_eq!(config, AppConfig::default());
        assert_eq!(config.queue.lease_secs, 300);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_load_queue_section() {
        let content = r#"
            [queue]
            db_path = "/var/lib/leaseq/queue.db"
            lease_secs = 60
            max_retries = 5
            retention_days = 14
            workers = 8

            [logging]
            level = "debug"
        "#;
        let config = ConfigLoader::load_str(content).unwrap();
        assert_eq!(config.queue.db_path, Some(PathBuf::from("/var/lib/leaseq/queue.db")));
        assert_eq!(config.queue.lease_secs, 60);
        assert_eq!(config.queue.max_retries, 5);
        assert_eq!(config.queue.retention_days, 14);
        assert_eq!(config.queue.workers, 8);
        assert_eq!(config.queue.poll_interval_ms, 500);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_tilde_paths_expanded() {
        let content = r#"
            [queue]
            db_path = "~/queue.db"

            [logging]
            dir = "~/logs"
        "#;
        let config = ConfigLoader::load_str(content).unwrap();
        let db = config.queue.db_path.unwrap();
        assert!(!db.to_string_lossy().starts_with('~'));
        assert!(db.ends_with("queue.db"));
        assert!(!config.logging.dir.unwrap().to_string_lossy().starts_with('~'));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[queue]").unwrap();
        writeln!(file, "lease_secs = 42").unwrap();

        let config = ConfigLoader::load(file.path()).unwrap();
        assert_eq!(config.queue.lease_secs, 42);
    }

    #[test]
    fn test_load_nonexistent_file() {
        let result = ConfigLoader::load(Path::new("/nonexistent/path/config.toml"));
        assert!(matches!(result, Err(ConfigError::NotFound(_))));
    }

    #[test]
    fn test_load_invalid_toml() {
        let result = ConfigLoader::load_str("invalid = [unclosed");
        assert!(matches!(result, Err(ConfigError::TomlParse(_))));
    }

    #[test]
    fn test_expand_env_vars() {
        let path = std::env::var("PATH").unwrap_or_default();
        if path.is_empty() {
            return;
        }
        let expanded = ConfigLoader::expand_env_vars("value = \"${PATH}\"").unwrap();
        assert_eq!(expanded, format!("value = \"{}\"", path));
    }

    #[test]
    fn test_expand_env_vars_not_set() {
        let result = ConfigLoader::expand_env_vars("value = \"${LEASEQ_UNSET_TEST_VAR_12345}\"");
        assert!(matches!(result, Err(ConfigError::EnvVarNotSet(_))));
    }

    #[test]
    fn test_resolve_db_override() {
        let dir = TempDir::new().unwrap();
        let mut file = NamedTempFile::new_in(dir.path()).unwrap();
        writeln!(file, "[queue]").unwrap();
        writeln!(file, "db_path = \"/from/file.db\"").unwrap();

        let db = dir.path().join("override.db");
        let config = ConfigLoader::resolve(Some(file.path()), Some(db.as_path())).unwrap();
        assert_eq!(config.queue.db_path, Some(db));
    }

    #[test]
    fn test_resolve_rejects_invalid_queue() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[queue]").unwrap();
        writeln!(file, "workers = 0").unwrap();

        let result = ConfigLoader::resolve(Some(file.path()), None);
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_resolve_explicit_missing_file() {
        let result = ConfigLoader::resolve(Some(Path::new("/nonexistent/leaseq.toml")), None);
        assert!(result.is_err());
    }
}
