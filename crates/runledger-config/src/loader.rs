use std::path::{Path, PathBuf};

use runledger_common::{Error, Result};
use tracing::{debug, info};

use crate::model::AppConfig;

const CONFIG_FILE_NAMES: [&str; 3] = ["config.yml", "config.yaml", "config.toml"];

/// Resolves and parses the `AppConfig` for this process.
pub struct ConfigLoader {
    config_dir: PathBuf,
    explicit_path: Option<PathBuf>,
}

impl ConfigLoader {
    /// Loader rooted at `~/.runledger`.
    pub fn new() -> Self {
        let config_dir = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".runledger");
        Self {
            config_dir,
            explicit_path: None,
        }
    }

    pub fn with_dir(config_dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: config_dir.into(),
            explicit_path: None,
        }
    }

    /// Load exactly this file; a missing file is an error.
    pub fn with_file(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let config_dir = path.parent().unwrap_or(Path::new(".")).to_path_buf();
        Self {
            config_dir,
            explicit_path: Some(path),
        }
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    /// Parse the config file (defaults when no default file exists) and
    /// apply `RUNLEDGER_*` environment overrides.
    pub fn load(&self) -> Result<AppConfig> {
        let mut config = match self.resolve_path()? {
            Some(path) => {
                info!("loading config from {}", path.display());
                parse_config_file(&path)?
            }
            None => {
                debug!(
                    "no config file in {}, using defaults",
                    self.config_dir.display()
                );
                AppConfig::default()
            }
        };
        apply_env_overrides(&mut config, |name| std::env::var(name).ok())?;
        Ok(config)
    }

    fn resolve_path(&self) -> Result<Option<PathBuf>> {
        if let Some(path) = &self.explicit_path {
            if !path.exists() {
                return Err(Error::Config(format!(
                    "config file not found: {}",
                    path.display()
                )));
            }
            return Ok(Some(path.clone()));
        }

        Ok(CONFIG_FILE_NAMES
            .iter()
            .map(|name| self.config_dir.join(name))
            .find(|candidate| candidate.exists()))
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_config_file(path: &Path) -> Result<AppConfig> {
    let contents = std::fs::read_to_string(path)?;

    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    match ext {
        "yml" | "yaml" => serde_yaml::from_str(&contents)
            .map_err(|e| Error::Config(format!("YAML parse error: {e}"))),
        "toml" => {
            toml::from_str(&contents).map_err(|e| Error::Config(format!("TOML parse error: {e}")))
        }
        other => Err(Error::Config(format!(
            "unsupported config extension: {other}"
        ))),
    }
}

/// Overlay `RUNLEDGER_*` variables read through `lookup` onto `config`.
pub fn apply_env_overrides<F>(config: &mut AppConfig, lookup: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(path) = lookup("RUNLEDGER_DB_PATH") {
        config.database.path = Some(PathBuf::from(path));
    }
    if let Some(collection) = lookup("RUNLEDGER_COLLECTION") {
        config.database.collection = collection;
    }
    if let Some(raw) = lookup("RUNLEDGER_AUTO_RUN") {
        config.auto_run = parse_bool("RUNLEDGER_AUTO_RUN", &raw)?;
    }
    if let Some(id) = lookup("RUNLEDGER_INSTANCE_ID") {
        config.instance_id = Some(id);
    }
    Ok(())
}

fn parse_bool(name: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(Error::Config(format!("{name} must be a boolean, got {other:?}"))),
    }
}
