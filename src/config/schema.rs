//! Configuration schema definitions for temaki.
//!
//! All types deserialize from either `temaki.toml` or `temaki.yml`; the
//! field names are the same in both formats.
//!
//! # Schema Overview
//!
//! ```text
//! Config (root)
//! ├── cmd                    - Test command (overridable from the CLI)
//! ├── SettingsConfig         - Probe budget, stop grace, hook timeout
//! ├── RunnerConfig           - Tagged enum selecting how the test command runs
//! │   ├── Local              - Child process on this machine
//! │   └── Container          - Built image run as a container
//! └── services               - Map of env var name -> ServiceConfig
//!     └── HooksConfig        - pre-run / post-run commands
//! ```

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::Duration;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};

/// Root configuration structure for temaki.
///
/// # TOML Structure
///
/// ```toml
/// cmd = "pytest tests"
///
/// [services.DATABASE_URL]
/// image = "postgres:16"
/// port = 5432
/// format = "postgres://postgres@{{Host}}:{{Port}}/postgres"
/// env = { POSTGRES_HOST_AUTH_METHOD = "trust" }
///
/// [services.DATABASE_URL.hooks]
/// pre-run = ["psql -U postgres -c 'select 1'"]
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Test command line, tokenized with shell-word rules.
    pub cmd: Option<String>,

    /// Tuning knobs (optional, has defaults).
    #[serde(default)]
    pub settings: SettingsConfig,

    /// How the test command runs (optional, defaults to local).
    #[serde(default)]
    pub runner: RunnerConfig,

    /// Services keyed by the environment variable that will hold their
    /// rendered endpoint. Ordered by name.
    #[serde(default)]
    pub services: BTreeMap<String, ServiceConfig>,

    /// Top-level shorthand for a container runner, as written in older
    /// `temaki.yml` files. Folded into `runner` when loading.
    #[serde(default, skip_serializing)]
    pub dockerfile: Option<PathBuf>,

    /// Image tag for the `dockerfile` shorthand.
    #[serde(default, skip_serializing)]
    pub image: Option<String>,
}

/// Tuning settings.
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `probe_attempts` | 11 |
/// | `probe_interval_ms` | 1000 |
/// | `stop_timeout_secs` | 10 |
/// | `hook_timeout_secs` | None (no timeout) |
/// | `docker_host` | None (`DOCKER_HOST` or the local socket) |
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SettingsConfig {
    /// Connection attempts before a service is declared unreachable.
    #[serde(default = "default_probe_attempts")]
    pub probe_attempts: u32,

    /// Pause between connection attempts in milliseconds.
    #[serde(default = "default_probe_interval_ms")]
    pub probe_interval_ms: u64,

    /// Grace period given to a container on stop before it is killed.
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_secs: u64,

    /// Upper bound for a single hook command. Unset means hooks may run
    /// forever.
    pub hook_timeout_secs: Option<u64>,

    /// Container runtime address; takes precedence over `DOCKER_HOST`.
    ///
    /// # Example
    /// ```toml
    /// docker_host = "tcp://192.168.1.100:2375"
    /// ```
    pub docker_host: Option<String>,
}

impl SettingsConfig {
    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    pub fn hook_timeout(&self) -> Option<Duration> {
        self.hook_timeout_secs.map(Duration::from_secs)
    }
}

impl Default for SettingsConfig {
    fn default() -> Self {
        Self {
            probe_attempts: default_probe_attempts(),
            probe_interval_ms: default_probe_interval_ms(),
            stop_timeout_secs: default_stop_timeout(),
            hook_timeout_secs: None,
            docker_host: None,
        }
    }
}

fn default_probe_attempts() -> u32 {
    11
}

fn default_probe_interval_ms() -> u64 {
    1000
}

fn default_stop_timeout() -> u64 {
    10
}

/// Test runner configuration.
///
/// This is a tagged enum selected by the `type` field.
///
/// # Example
///
/// ```toml
/// # Run the command on this machine (default)
/// [runner]
/// type = "local"
///
/// # Build an image and run the command inside it
/// [runner]
/// type = "container"
/// dockerfile = "Dockerfile.test"
/// image = "myapp-tests"
/// network_mode = "host"
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RunnerConfig {
    /// Run the test command as a local child process.
    #[default]
    Local,

    /// Build an image and run the test command as a container.
    Container(ContainerRunnerConfig),
}

/// Configuration for the containerized runner.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ContainerRunnerConfig {
    /// Dockerfile path. Its directory is the build context. Relative paths
    /// are resolved against the directory holding the config file.
    pub dockerfile: PathBuf,

    /// Tag for the built image.
    ///
    /// Default: `temaki-tests`
    #[serde(default = "default_image_name")]
    pub image: String,

    /// Docker network mode for the test container, e.g. `host`.
    pub network_mode: Option<String>,
}

pub(crate) fn default_image_name() -> String {
    "temaki-tests".to_string()
}

/// One service container.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceConfig {
    /// Image reference, e.g. `redis:7`.
    pub image: String,

    /// TCP port the service listens on inside the container. Quoted
    /// numbers (`port: "6379"`) are accepted too.
    #[serde(deserialize_with = "deserialize_port")]
    pub port: u16,

    /// Connection-string template. `{{Host}}` and `{{Port}}` are replaced by
    /// the published address (`{{Port0}}` is an alias of `{{Port}}`).
    pub format: String,

    /// Extra environment for the service container, as a map or as a list
    /// of `NAME=VALUE` strings.
    #[serde(default, deserialize_with = "deserialize_env")]
    pub env: HashMap<String, String>,

    /// Commands run inside the container around the test run.
    #[serde(default)]
    pub hooks: HooksConfig,

    /// Copy the container's own output to stderr, prefixed with the service
    /// name.
    #[serde(default)]
    pub follow_logs: bool,
}

/// Hook commands, each tokenized with shell-word rules.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct HooksConfig {
    /// Run after the service accepts connections, before the test command.
    #[serde(default, rename = "pre-run")]
    pub pre_run: Vec<String>,

    /// Run after the test command, before the container is stopped.
    #[serde(default, rename = "post-run")]
    pub post_run: Vec<String>,
}

fn deserialize_port<'de, D>(deserializer: D) -> Result<u16, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum PortValue {
        Number(u16),
        Text(String),
    }

    match PortValue::deserialize(deserializer)? {
        PortValue::Number(port) => Ok(port),
        PortValue::Text(text) => {
            let trimmed = text.trim();
            let number = trimmed.strip_suffix("/tcp").unwrap_or(trimmed);
            number
                .parse()
                .map_err(|_| D::Error::custom(format!("invalid port '{}'", text)))
        }
    }
}

fn deserialize_env<'de, D>(deserializer: D) -> Result<HashMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum EnvValue {
        Map(HashMap<String, String>),
        List(Vec<String>),
    }

    match EnvValue::deserialize(deserializer)? {
        EnvValue::Map(map) => Ok(map),
        EnvValue::List(entries) => entries
            .into_iter()
            .map(|entry| match entry.split_once('=') {
                Some((name, value)) => Ok((name.to_string(), value.to_string())),
                None => Err(D::Error::custom(format!(
                    "env entry '{}' is not NAME=VALUE",
                    entry
                ))),
            })
            .collect(),
    }
}
