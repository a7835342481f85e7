use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CONFIG_ENV: &str = "SANDBOX_ORCHESTRATOR_CONFIG";
pub const TOKEN_ENV: &str = "SANDBOX_ORCHESTRATOR_TOKEN";
pub const ENGINE_ENV: &str = "SANDBOX_ORCHESTRATOR_ENGINE";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config {path}: {message}")]
    Parse { path: PathBuf, message: String },
    #[error("unknown engine kind: {0}")]
    UnknownEngine(String),
    #[error("invalid setting {field}: {message}")]
    Invalid {
        field: &'static str,
        message: String,
    },
}

impl From<ConfigError> for sandbox_orchestrator_error::OrchestratorError {
    fn from(value: ConfigError) -> Self {
        Self::InvalidRequest {
            message: value.to_string(),
        }
    }
}

/// Top-level configuration, built once at startup and handed to
/// [`crate::context::AppContext::build`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub server: ServerConfig,
    pub auth: AuthSettings,
    pub engine: EngineKind,
    pub docker: DockerConfig,
    pub specs: SpecConfig,
    pub readiness: ReadinessConfig,
    pub webhooks: WebhookConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthSettings {
    pub token: Option<String>,
    pub admin_users: Vec<String>,
}

/// Container engines known at compile time. The kind is picked by config;
/// [`crate::engine::build_engine`] maps it to a constructor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    #[default]
    Docker,
    Mock,
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Docker => f.write_str("docker"),
            Self::Mock => f.write_str("mock"),
        }
    }
}

impl FromStr for EngineKind {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "docker" => Ok(Self::Docker),
            "mock" => Ok(Self::Mock),
            other => Err(ConfigError::UnknownEngine(other.to_string())),
        }
    }
}

/// A container port published on a freshly allocated host port. The host
/// port is also handed to the container as an env var named `name`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExposedPort {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_container_port")]
    pub container_port: u16,
}

fn default_container_port() -> u16 {
    8000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerConfig {
    pub container_name_prefix: String,
    pub volume_name_prefix: String,
    pub exposed_url_pattern: String,
    pub stop_timeout_secs: u64,
    pub exposed_ports: Vec<ExposedPort>,
    pub agent_server_port: String,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            container_name_prefix: "openhands-agent-server-".to_string(),
            volume_name_prefix: "openhands-workspace-".to_string(),
            exposed_url_pattern: "http://localhost:{port}".to_string(),
            stop_timeout_secs: 10,
            exposed_ports: vec![ExposedPort {
                name: "APPLICATION_SERVER_PORT".to_string(),
                description: "The port on which the application server runs within the container"
                    .to_string(),
                container_port: default_container_port(),
            }],
            agent_server_port: "APPLICATION_SERVER_PORT".to_string(),
        }
    }
}

impl DockerConfig {
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    pub fn format_url(&self, host_port: &str) -> String {
        self.exposed_url_pattern.replace("{port}", host_port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpecConfig {
    pub repository: String,
    pub command: String,
    pub working_dir: String,
    pub initial_env: BTreeMap<String, String>,
    pub default_spec: Option<String>,
}

impl Default for SpecConfig {
    fn default() -> Self {
        Self {
            repository: "ghcr.io/all-hands-ai/runtime".to_string(),
            command: "python -u -m openhands_server.runtime".to_string(),
            working_dir: "/openhands/code".to_string(),
            initial_env: BTreeMap::new(),
            default_spec: None,
        }
    }
}

impl SpecConfig {
    pub fn command_args(&self) -> Vec<String> {
        self.command.split_whitespace().map(str::to_string).collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadinessConfig {
    pub timeout_secs: u64,
    pub poll_interval_ms: u64,
    pub backoff_multiplier: f64,
    pub max_poll_interval_ms: u64,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 120,
            poll_interval_ms: 2_000,
            backoff_multiplier: 1.0,
            max_poll_interval_ms: 10_000,
        }
    }
}

impl ReadinessConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn max_poll_interval(&self) -> Duration {
        Duration::from_millis(self.max_poll_interval_ms).max(self.poll_interval())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(ConfigError::Invalid {
                field: "readiness.backoff_multiplier",
                message: format!(
                    "must be a finite number >= 1.0, got {}",
                    self.backoff_multiplier
                ),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    pub max_batch_size: usize,
    pub max_wait_ms: u64,
    pub request_timeout_ms: u64,
    pub max_retry_attempts: Option<u32>,
    pub max_retry_delay_ms: u64,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 10,
            max_wait_ms: 1_000,
            request_timeout_ms: 30_000,
            max_retry_attempts: None,
            max_retry_delay_ms: 60_000,
        }
    }
}

impl WebhookConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub database_url: String,
    pub subscribers_path: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite::memory:".to_string(),
            subscribers_path: None,
        }
    }
}

impl OrchestratorConfig {
    /// Loads the config file (explicit path, then `SANDBOX_ORCHESTRATOR_CONFIG`,
    /// then the per-user config dir if a file exists there) and applies env
    /// overrides on top.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from))
            .or_else(|| default_config_path().filter(|path| path.exists()));

        let mut config = match path {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.readiness.validate()
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw).map_err(|message| ConfigError::Parse {
            path: path.to_path_buf(),
            message,
        })
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, String> {
        toml_edit::de::from_str(raw).map_err(|err| err.to_string())
    }

    fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(token) = std::env::var(TOKEN_ENV) {
            if !token.is_empty() {
                self.auth.token = Some(token);
            }
        }
        if let Ok(engine) = std::env::var(ENGINE_ENV) {
            self.engine = engine.parse()?;
        }
        Ok(())
    }
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("sandbox-orchestrator").join("config.toml"))
}
