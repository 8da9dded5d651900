//! Agent configuration.

use std::path::PathBuf;
use std::time::Duration;

use secrecy::Secret;
use serde::{Deserialize, Serialize};

/// Which config poller(s) may be used to bootstrap.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BootstrapOn {
    /// Binary poller preferred, HTTP streaming as fall-back.
    #[default]
    Both,
    /// Binary poller only.
    Cccp,
    /// HTTP streaming poller only.
    Http,
}

/// Address family used when reading node addresses from cluster configs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkType {
    /// Pick by matching the bootstrap addresses against the first config.
    #[default]
    Auto,
    Default,
    External,
    /// A named alternate-address family.
    Named(String),
}

/// Change-stream connection priority.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DcpPriority {
    #[default]
    Low,
    Medium,
    High,
}

impl DcpPriority {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

/// SASL mechanisms the client can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuthMechanism {
    #[serde(rename = "SCRAM-SHA512")]
    ScramSha512,
    #[serde(rename = "SCRAM-SHA256")]
    ScramSha256,
    #[serde(rename = "SCRAM-SHA1")]
    ScramSha1,
    #[serde(rename = "PLAIN")]
    Plain,
}

impl AuthMechanism {
    /// Mechanism name as listed by the server.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ScramSha512 => "SCRAM-SHA512",
            Self::ScramSha256 => "SCRAM-SHA256",
            Self::ScramSha1 => "SCRAM-SHA1",
            Self::Plain => "PLAIN",
        }
    }

    /// Parses a server-listed mechanism name. Both `SCRAM-SHA-512` and
    /// `SCRAM-SHA512` spellings are accepted.
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_uppercase().replace("SHA-", "SHA").as_str() {
            "SCRAM-SHA512" => Some(Self::ScramSha512),
            "SCRAM-SHA256" => Some(Self::ScramSha256),
            "SCRAM-SHA1" => Some(Self::ScramSha1),
            "PLAIN" => Some(Self::Plain),
            _ => None,
        }
    }

    /// Default preference order for non-TLS connections.
    pub fn defaults(tls: bool) -> Vec<AuthMechanism> {
        if tls {
            vec![Self::Plain]
        } else {
            vec![Self::ScramSha512, Self::ScramSha256, Self::ScramSha1]
        }
    }
}

/// Username/password credentials.
#[derive(Debug, Clone, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: Secret<String>,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: Secret::new(password.into()),
        }
    }
}

/// Seed addresses, `host:port`.
#[derive(Debug, Clone, Default)]
pub struct SeedConfig {
    pub memd_addrs: Vec<String>,
    pub http_addrs: Vec<String>,
}

/// Transport security settings.
#[derive(Debug, Clone, Default)]
pub struct SecurityConfig {
    pub use_tls: bool,
    /// PEM bundle of trusted roots. System roots are not loaded.
    pub ca_cert_path: Option<PathBuf>,
    pub credentials: Option<Credentials>,
    /// Allowed mechanisms in preference order. Empty selects the defaults.
    pub auth_mechanisms: Vec<AuthMechanism>,
}

/// HELLO feature toggles and network selection.
#[derive(Debug, Clone)]
pub struct IoConfig {
    pub network_type: NetworkType,
    pub use_mutation_tokens: bool,
    pub use_durations: bool,
    pub use_out_of_order: bool,
    pub use_collections: bool,
    pub use_json_hello: bool,
    pub use_xerror_hello: bool,
    pub use_sync_replication: bool,
    pub use_preserve_expiry: bool,
    pub use_create_as_deleted: bool,
    pub use_replace_body_with_xattr: bool,
    pub use_cluster_map_notifications: bool,
}

impl Default for IoConfig {
    fn default() -> Self {
        Self {
            network_type: NetworkType::Auto,
            use_mutation_tokens: true,
            use_durations: true,
            use_out_of_order: true,
            use_collections: true,
            use_json_hello: true,
            use_xerror_hello: true,
            use_sync_replication: true,
            use_preserve_expiry: true,
            use_create_as_deleted: true,
            use_replace_body_with_xattr: true,
            use_cluster_map_notifications: false,
        }
    }
}

/// Key/value connection settings.
#[derive(Debug, Clone)]
pub struct KvConfig {
    /// Deadline for dial plus bootstrap of one connection.
    pub connect_timeout: Duration,
    /// Minimum wait before re-dialing an address that failed bootstrap.
    pub server_wait_timeout: Duration,
    /// Connections per data node.
    pub pool_size: usize,
    /// Bound of each pipeline queue.
    pub max_queue_size: usize,
}

impl Default for KvConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(7),
            server_wait_timeout: Duration::from_secs(5),
            pool_size: 1,
            max_queue_size: 2048,
        }
    }
}

/// Snappy settings.
#[derive(Debug, Clone)]
pub struct CompressionConfig {
    pub enabled: bool,
    pub disable_decompression: bool,
    /// Values shorter than this are sent as-is.
    pub min_size: usize,
    /// Compressed values larger than `ratio * original` are discarded.
    pub min_ratio: f64,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            disable_decompression: false,
            min_size: 32,
            min_ratio: 0.83,
        }
    }
}

/// Config poller settings.
#[derive(Debug, Clone)]
pub struct ConfigPollerConfig {
    pub bootstrap_on: BootstrapOn,
    /// Pause between binary poller rounds.
    pub cccp_poll_period: Duration,
    /// Deadline of one binary config fetch.
    pub cccp_max_wait: Duration,
    /// Maximum age of one HTTP streaming connection.
    pub http_redial_period: Duration,
    /// Pause after every endpoint failed once.
    pub http_retry_delay: Duration,
    /// Deadline to receive the first config on a fresh HTTP stream.
    pub http_max_wait: Duration,
}

impl Default for ConfigPollerConfig {
    fn default() -> Self {
        Self {
            bootstrap_on: BootstrapOn::Both,
            cccp_poll_period: Duration::from_millis(2500),
            cccp_max_wait: Duration::from_secs(3),
            http_redial_period: Duration::from_secs(10),
            http_retry_delay: Duration::from_secs(10),
            http_max_wait: Duration::from_secs(5),
        }
    }
}

/// HTTP client pool settings.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub max_idle_conns: usize,
    pub max_idle_conns_per_host: usize,
    pub idle_conn_timeout: Duration,
    pub connect_timeout: Duration,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            max_idle_conns: 0,
            max_idle_conns_per_host: 100,
            idle_conn_timeout: Duration::from_millis(4500),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// Circuit breaker settings.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub enabled: bool,
    /// Minimum completions in a window before the breaker can open.
    pub volume_threshold: u64,
    pub error_threshold_percentage: f64,
    /// How long the breaker stays open before sending a canary.
    pub sleep_window: Duration,
    pub rolling_window: Duration,
    pub canary_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            volume_threshold: 20,
            error_threshold_percentage: 50.0,
            sleep_window: Duration::from_secs(5),
            rolling_window: Duration::from_secs(60),
            canary_timeout: Duration::from_secs(5),
        }
    }
}

/// Orphaned response logging settings.
#[derive(Debug, Clone)]
pub struct OrphanReporterConfig {
    pub enabled: bool,
    pub interval: Duration,
    pub sample_size: usize,
}

impl Default for OrphanReporterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(10),
            sample_size: 10,
        }
    }
}

/// Change-stream settings.
#[derive(Debug, Clone)]
pub struct DcpConfig {
    pub priority: DcpPriority,
    /// Flow-control window in bytes. Zero disables flow control.
    pub buffer_size: usize,
    /// Bound of the per-connection event queue.
    pub queue_size: usize,
    pub use_expiry_opcode: bool,
    pub use_stream_id: bool,
    pub use_oso: bool,
    pub use_seqno_advanced: bool,
    pub use_collections: bool,
    /// Name of the DCP connection.
    pub connection_name: String,
    /// Open-connection flags (producer, include xattrs, ...).
    pub open_flags: u32,
}

impl Default for DcpConfig {
    fn default() -> Self {
        Self {
            priority: DcpPriority::Low,
            buffer_size: 20 * 1024 * 1024,
            queue_size: 2048,
            use_expiry_opcode: false,
            use_stream_id: false,
            use_oso: false,
            use_seqno_advanced: false,
            use_collections: true,
            connection_name: String::new(),
            open_flags: 0x01,
        }
    }
}

/// Default operation timeouts.
#[derive(Debug, Clone)]
pub struct TimeoutsConfig {
    pub kv: Duration,
    pub kv_durable: Duration,
    pub query: Duration,
    pub analytics: Duration,
    pub search: Duration,
    pub view: Duration,
    pub management: Duration,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            kv: Duration::from_millis(2500),
            kv_durable: Duration::from_secs(10),
            query: Duration::from_secs(75),
            analytics: Duration::from_secs(75),
            search: Duration::from_secs(75),
            view: Duration::from_secs(75),
            management: Duration::from_secs(75),
        }
    }
}

/// Everything an Agent needs to start.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub user_agent: String,
    pub bucket_name: Option<String>,
    pub seed: SeedConfig,
    pub security: SecurityConfig,
    pub io: IoConfig,
    pub kv: KvConfig,
    pub compression: CompressionConfig,
    pub config_poller: ConfigPollerConfig,
    pub http: HttpConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub orphan_reporter: OrphanReporterConfig,
    pub dcp: DcpConfig,
    pub timeouts: TimeoutsConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            user_agent: concat!("cbcore/", env!("CARGO_PKG_VERSION")).to_string(),
            bucket_name: None,
            seed: SeedConfig::default(),
            security: SecurityConfig::default(),
            io: IoConfig::default(),
            kv: KvConfig::default(),
            compression: CompressionConfig::default(),
            config_poller: ConfigPollerConfig::default(),
            http: HttpConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            orphan_reporter: OrphanReporterConfig::default(),
            dcp: DcpConfig::default(),
            timeouts: TimeoutsConfig::default(),
        }
    }
}

impl AgentConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bucket(mut self, bucket: impl Into<String>) -> Self {
        self.bucket_name = Some(bucket.into());
        self
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.security.credentials = Some(Credentials::new(username, password));
        self
    }

    pub fn with_memd_addrs(mut self, addrs: Vec<String>) -> Self {
        self.seed.memd_addrs = addrs;
        self
    }

    pub fn with_http_addrs(mut self, addrs: Vec<String>) -> Self {
        self.seed.http_addrs = addrs;
        self
    }

    pub fn with_tls(mut self, ca_cert_path: Option<PathBuf>) -> Self {
        self.security.use_tls = true;
        self.security.ca_cert_path = ca_cert_path;
        self
    }

    pub fn with_auth_mechanisms(mut self, mechanisms: Vec<AuthMechanism>) -> Self {
        self.security.auth_mechanisms = mechanisms;
        self
    }

    pub fn with_kv_pool_size(mut self, size: usize) -> Self {
        self.kv.pool_size = size.max(1);
        self
    }

    pub fn with_kv_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.kv = timeout;
        self
    }

    pub fn with_bootstrap_on(mut self, on: BootstrapOn) -> Self {
        self.config_poller.bootstrap_on = on;
        self
    }

    pub fn with_compression(mut self, enabled: bool) -> Self {
        self.compression.enabled = enabled;
        self
    }

    pub fn with_circuit_breaker(mut self, enabled: bool) -> Self {
        self.circuit_breaker.enabled = enabled;
        self
    }

    pub fn with_orphan_reporter(mut self, config: OrphanReporterConfig) -> Self {
        self.orphan_reporter = config;
        self
    }

    pub fn with_dcp(mut self, config: DcpConfig) -> Self {
        self.dcp = config;
        self
    }

    /// Mechanisms to offer, falling back to the defaults for the transport.
    pub fn effective_auth_mechanisms(&self) -> Vec<AuthMechanism> {
        if self.security.auth_mechanisms.is_empty() {
            AuthMechanism::defaults(self.security.use_tls)
        } else {
            self.security.auth_mechanisms.clone()
        }
    }
}
