//! Configuration discovery, loading and validation for temaki.
//!
//! The configuration file is looked up from the working directory upwards,
//! stopping at the first directory that holds one of
//! [`CONFIG_FILE_NAMES`]. TOML and YAML are both accepted; the format is
//! picked from the file extension.
//!
//! # The Configuration File Format is described in [`schema`].

pub mod schema;

pub use schema::*;

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use tracing::debug;

/// File names searched for, in order of preference, in every directory.
pub const CONFIG_FILE_NAMES: [&str; 3] = ["temaki.toml", "temaki.yml", "temaki.yaml"];

/// Lazily compiled regex for environment variable names.
static ENV_NAME_PATTERN: OnceLock<Result<Regex, regex::Error>> = OnceLock::new();

/// Errors that can occur while locating or loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// No configuration file between the start directory and the root.
    #[error("No temaki configuration ({}) found in {} or any parent directory", CONFIG_FILE_NAMES.join(", "), .start.display())]
    NotFound { start: PathBuf },

    #[error("{} is a directory", .0.display())]
    IsDirectory(PathBuf),

    #[error("Failed to read config file {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse TOML config: {0}")]
    ParseToml(#[from] toml::de::Error),

    #[error("Failed to parse YAML config: {0}")]
    ParseYaml(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Result type for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Serialization format of a configuration file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Toml,
    Yaml,
}

impl ConfigFormat {
    /// Picks the format from the file extension; anything but `.yml` and
    /// `.yaml` is TOML.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some("yml") | Some("yaml") => ConfigFormat::Yaml,
            _ => ConfigFormat::Toml,
        }
    }
}

/// Walks from `start` towards the filesystem root and returns the first
/// configuration file found.
///
/// # Errors
///
/// - [`ConfigError::NotFound`] when no directory on the way holds a config
/// - [`ConfigError::IsDirectory`] when a config name exists but is a directory
pub fn find_config(start: &Path) -> ConfigResult<PathBuf> {
    let mut dir = Some(start);

    while let Some(current) = dir {
        for name in CONFIG_FILE_NAMES {
            let candidate = current.join(name);
            if candidate.is_dir() {
                return Err(ConfigError::IsDirectory(candidate));
            }
            if candidate.is_file() {
                debug!("Found config at {}", candidate.display());
                return Ok(candidate);
            }
        }
        dir = current.parent();
    }

    Err(ConfigError::NotFound {
        start: start.to_path_buf(),
    })
}

/// Loads and validates configuration from a file.
///
/// Relative `runner.dockerfile` paths are resolved against the directory
/// holding the file.
///
/// # Example
///
/// ```no_run
/// use temaki::config::load_config;
/// use std::path::Path;
///
/// let config = load_config(Path::new("temaki.toml"))?;
/// println!("Services: {}", config.services.len());
/// # Ok::<(), temaki::config::ConfigError>(())
/// ```
pub fn load_config(path: &Path) -> ConfigResult<Config> {
    if path.is_dir() {
        return Err(ConfigError::IsDirectory(path.to_path_buf()));
    }

    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    let mut config = load_config_str(&content, ConfigFormat::from_path(path))?;

    let base_dir = path.parent().unwrap_or(Path::new("."));
    config.resolve_paths(base_dir)?;

    Ok(config)
}

/// Loads and validates configuration from a string.
///
/// # Example
///
/// ```
/// use temaki::config::{load_config_str, ConfigFormat};
///
/// let config = load_config_str(r#"
///     cmd = "pytest"
///
///     [services.REDIS_URL]
///     image = "redis:7"
///     port = 6379
///     format = "redis://{{Host}}:{{Port}}"
/// "#, ConfigFormat::Toml)?;
///
/// assert_eq!(config.services.len(), 1);
/// # Ok::<(), temaki::config::ConfigError>(())
/// ```
pub fn load_config_str(content: &str, format: ConfigFormat) -> ConfigResult<Config> {
    let mut config: Config = match format {
        ConfigFormat::Toml => toml::from_str(content)?,
        ConfigFormat::Yaml => serde_yaml::from_str(content)?,
    };

    config.fold_runner_shorthand()?;
    config.validate()?;
    Ok(config)
}

impl Config {
    /// Checks the invariants serde cannot express.
    pub fn validate(&self) -> ConfigResult<()> {
        let env_name = env_name_pattern()?;

        if self.settings.probe_attempts == 0 {
            return Err(ConfigError::Invalid(
                "settings.probe_attempts must be at least 1".to_string(),
            ));
        }

        for (name, service) in &self.services {
            if !env_name.is_match(name) {
                return Err(ConfigError::Invalid(format!(
                    "service name '{}' is not a valid environment variable name",
                    name
                )));
            }
            if service.image.trim().is_empty() {
                return Err(ConfigError::Invalid(format!("service '{}' has no image", name)));
            }
            if service.port == 0 {
                return Err(ConfigError::Invalid(format!(
                    "service '{}' must expose a non-zero port",
                    name
                )));
            }
            if service.format.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "service '{}' has an empty format",
                    name
                )));
            }
            if let Some(bad) = service.env.keys().find(|k| !env_name.is_match(k)) {
                return Err(ConfigError::Invalid(format!(
                    "service '{}' env key '{}' is not a valid environment variable name",
                    name, bad
                )));
            }
        }

        if let RunnerConfig::Container(runner) = &self.runner {
            if runner.image.trim().is_empty() {
                return Err(ConfigError::Invalid("runner.image is empty".to_string()));
            }
        }

        Ok(())
    }

    /// Turns top-level `dockerfile` / `image` into a container runner.
    pub fn fold_runner_shorthand(&mut self) -> ConfigResult<()> {
        let Some(dockerfile) = self.dockerfile.take() else {
            if self.image.is_some() {
                return Err(ConfigError::Invalid(
                    "top-level image is only valid together with dockerfile".to_string(),
                ));
            }
            return Ok(());
        };

        if matches!(self.runner, RunnerConfig::Container(_)) {
            return Err(ConfigError::Invalid(
                "top-level dockerfile conflicts with [runner]".to_string(),
            ));
        }

        let image = self.image.take();
        self.runner = RunnerConfig::Container(ContainerRunnerConfig {
            dockerfile,
            image: image.unwrap_or_else(schema::default_image_name),
            network_mode: None,
        });
        Ok(())
    }

    /// Expands `~` and `$VAR` in the dockerfile path and anchors relative
    /// paths at `base_dir`.
    pub fn resolve_paths(&mut self, base_dir: &Path) -> ConfigResult<()> {
        if let RunnerConfig::Container(runner) = &mut self.runner {
            let raw = runner.dockerfile.to_string_lossy().to_string();
            let expanded = shellexpand::full(&raw).map_err(|e| {
                ConfigError::Invalid(format!("runner.dockerfile '{}': {}", raw, e))
            })?;
            let path = PathBuf::from(expanded.as_ref());
            runner.dockerfile = if path.is_relative() {
                base_dir.join(path)
            } else {
                path
            };
        }
        Ok(())
    }

    /// Command-line words given after `run` replace the configured command.
    pub fn override_cmd(&mut self, words: &[String]) {
        if !words.is_empty() {
            self.cmd = Some(words.join(" "));
        }
    }
}

fn env_name_pattern() -> ConfigResult<&'static Regex> {
    let result = ENV_NAME_PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$"));

    match result {
        Ok(regex) => Ok(regex),
        Err(e) => Err(ConfigError::Invalid(format!("env name pattern: {}", e))),
    }
}
