//! cbcore-config - agent configuration
//!
//! Connection-string parsing, the agent option table and file/environment
//! loading through figment.

mod agent;
pub mod connstr;

pub use agent::{
    AgentConfig, AuthMechanism, BootstrapOn, CircuitBreakerConfig, CompressionConfig,
    ConfigPollerConfig, Credentials, DcpConfig, DcpPriority, HttpConfig, IoConfig, KvConfig,
    NetworkType, OrphanReporterConfig, SecurityConfig, SeedConfig, TimeoutsConfig,
};
pub use connstr::{ConnSpec, parse_duration};

use figment::{
    Figment,
    providers::{Env, Format, Toml},
};
use secrecy::{ExposeSecret, Secret};
use serde::Deserialize;
use thiserror::Error;

pub use secrecy;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load config: {0}")]
    Load(#[from] Box<figment::Error>),

    #[error("Invalid connection string: {0}")]
    InvalidConnStr(String),

    #[error("Invalid value `{value}` for option `{key}`")]
    InvalidOption { key: String, value: String },
}

impl From<figment::Error> for ConfigError {
    fn from(e: figment::Error) -> Self {
        Self::Load(Box::new(e))
    }
}

/// Agent settings as read from config files and the environment.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentSettings {
    pub connection_string: String,
    pub username: Option<String>,
    pub password: Option<Secret<String>>,
    pub bucket: Option<String>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Default key/value timeout in milliseconds.
    pub kv_timeout_ms: Option<u64>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl AgentSettings {
    /// Loads `<dir>/default.toml`, `<dir>/<APP_ENV>.toml` and `CBCORE_*`
    /// environment variables, later sources overriding earlier ones.
    pub fn load(config_dir: &str) -> Result<Self, ConfigError> {
        let env = std::env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());

        let settings: Self = Figment::new()
            .merge(Toml::file(format!("{}/default.toml", config_dir)))
            .merge(Toml::file(format!("{}/{}.toml", config_dir, env)))
            .merge(Env::prefixed("CBCORE_"))
            .extract()?;

        Ok(settings)
    }

    /// Resolves the settings into an agent configuration.
    pub fn into_agent_config(self) -> Result<AgentConfig, ConfigError> {
        let mut config = AgentConfig::from_connection_string(&self.connection_string)?;
        if let Some(bucket) = self.bucket {
            config.bucket_name = Some(bucket);
        }
        if let (Some(username), Some(password)) = (self.username, self.password) {
            config.security.credentials = Some(Credentials::new(username, password.expose_secret().clone()));
        }
        if let Some(ms) = self.kv_timeout_ms {
            config.timeouts.kv = std::time::Duration::from_millis(ms);
        }
        Ok(config)
    }
}
