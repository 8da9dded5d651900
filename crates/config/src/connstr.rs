//! Connection string parsing.
//!
//! `couchbase://host1,host2:11210?kv_pool_size=2&network=external`

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::ConfigError;
use crate::agent::{AgentConfig, BootstrapOn, DcpPriority, NetworkType};

pub const DEFAULT_MEMD_PORT: u16 = 11210;
pub const DEFAULT_MEMD_TLS_PORT: u16 = 11207;
pub const DEFAULT_HTTP_PORT: u16 = 8091;
pub const DEFAULT_HTTP_TLS_PORT: u16 = 18091;

/// One host from the connection string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPort {
    pub host: String,
    pub port: Option<u16>,
}

/// A parsed, not yet resolved, connection string.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnSpec {
    /// `couchbase`, `couchbases` or empty when no scheme was given.
    pub scheme: String,
    pub hosts: Vec<HostPort>,
    /// Option values by key; repeated keys keep every value in order.
    pub options: BTreeMap<String, Vec<String>>,
}

impl ConnSpec {
    pub fn use_tls(&self) -> bool {
        self.scheme == "couchbases"
    }

    /// Last value supplied for `key`.
    pub fn option(&self, key: &str) -> Option<&str> {
        self.options.get(key).and_then(|v| v.last()).map(String::as_str)
    }

    /// Seed addresses for the binary protocol and for HTTP.
    pub fn resolve_addrs(&self) -> (Vec<String>, Vec<String>) {
        let tls = self.use_tls();
        let memd_default = if tls { DEFAULT_MEMD_TLS_PORT } else { DEFAULT_MEMD_PORT };
        let http_default = if tls { DEFAULT_HTTP_TLS_PORT } else { DEFAULT_HTTP_PORT };

        let mut memd = Vec::new();
        let mut http = Vec::new();
        for hp in &self.hosts {
            let host = format_host(&hp.host);
            match hp.port {
                None => {
                    memd.push(format!("{host}:{memd_default}"));
                    http.push(format!("{host}:{http_default}"));
                }
                Some(p) if p == http_default => {
                    memd.push(format!("{host}:{memd_default}"));
                    http.push(format!("{host}:{p}"));
                }
                Some(p) => memd.push(format!("{host}:{p}")),
            }
        }
        (memd, http)
    }
}

fn format_host(host: &str) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]")
    } else {
        host.to_string()
    }
}

/// Parses a connection string without interpreting its options.
pub fn parse(conn_str: &str) -> Result<ConnSpec, ConfigError> {
    let mut spec = ConnSpec::default();
    let mut rest = conn_str.trim();

    if let Some(idx) = rest.find("://") {
        let scheme = &rest[..idx];
        match scheme {
            "couchbase" | "couchbases" => spec.scheme = scheme.to_string(),
            other => return Err(ConfigError::InvalidConnStr(format!("unknown scheme `{other}`"))),
        }
        rest = &rest[idx + 3..];
    }

    let (hosts, query) = match rest.split_once('?') {
        Some((h, q)) => (h, Some(q)),
        None => (rest, None),
    };
    let hosts = hosts.trim_end_matches('/');

    for raw in hosts.split([',', ';']).filter(|s| !s.is_empty()) {
        spec.hosts.push(parse_host(raw)?);
    }
    if spec.hosts.is_empty() {
        return Err(ConfigError::InvalidConnStr("no hosts".into()));
    }

    if let Some(query) = query {
        for pair in query.split('&').filter(|s| !s.is_empty()) {
            let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
            let k = decode(k)?;
            let v = decode(v)?;
            spec.options.entry(k).or_default().push(v);
        }
    }
    Ok(spec)
}

fn decode(s: &str) -> Result<String, ConfigError> {
    urlencoding::decode(s)
        .map(|c| c.into_owned())
        .map_err(|e| ConfigError::InvalidConnStr(format!("bad escape in `{s}`: {e}")))
}

fn parse_host(raw: &str) -> Result<HostPort, ConfigError> {
    // [ipv6]:port
    if let Some(stripped) = raw.strip_prefix('[') {
        let (host, tail) = stripped
            .split_once(']')
            .ok_or_else(|| ConfigError::InvalidConnStr(format!("unterminated ipv6 host `{raw}`")))?;
        let port = match tail.strip_prefix(':') {
            Some(p) => Some(parse_port(p)?),
            None if tail.is_empty() => None,
            None => return Err(ConfigError::InvalidConnStr(format!("bad host `{raw}`"))),
        };
        return Ok(HostPort {
            host: host.to_string(),
            port,
        });
    }
    match raw.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => Ok(HostPort {
            host: host.to_string(),
            port: Some(parse_port(port)?),
        }),
        _ => Ok(HostPort {
            host: raw.to_string(),
            port: None,
        }),
    }
}

fn parse_port(p: &str) -> Result<u16, ConfigError> {
    p.parse()
        .map_err(|_| ConfigError::InvalidConnStr(format!("bad port `{p}`")))
}

/// Parses a duration given either as integer milliseconds or with a unit
/// suffix (`ns`, `us`, `ms`, `s`, `m`, `h`). Fractions are allowed with units.
pub fn parse_duration(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Ok(ms) = value.parse::<u64>() {
        return Some(Duration::from_millis(ms));
    }
    let split = value.find(|c: char| c.is_ascii_alphabetic())?;
    let (num, unit) = value.split_at(split);
    let num: f64 = num.parse().ok()?;
    if num < 0.0 || !num.is_finite() {
        return None;
    }
    let secs = match unit {
        "ns" => num / 1e9,
        "us" => num / 1e6,
        "ms" => num / 1e3,
        "s" => num,
        "m" => num * 60.0,
        "h" => num * 3600.0,
        _ => return None,
    };
    Some(Duration::from_secs_f64(secs))
}

/// Parses booleans the way connection strings spell them.
pub fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Some(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Some(false),
        _ => None,
    }
}

fn invalid(key: &str, value: &str) -> ConfigError {
    ConfigError::InvalidOption {
        key: key.to_string(),
        value: value.to_string(),
    }
}

fn opt_duration(spec: &ConnSpec, key: &str) -> Result<Option<Duration>, ConfigError> {
    spec.option(key)
        .map(|v| parse_duration(v).ok_or_else(|| invalid(key, v)))
        .transpose()
}

fn opt_bool(spec: &ConnSpec, key: &str) -> Result<Option<bool>, ConfigError> {
    spec.option(key)
        .map(|v| parse_bool(v).ok_or_else(|| invalid(key, v)))
        .transpose()
}

fn opt_parse<T: std::str::FromStr>(spec: &ConnSpec, key: &str) -> Result<Option<T>, ConfigError> {
    spec.option(key)
        .map(|v| v.parse::<T>().map_err(|_| invalid(key, v)))
        .transpose()
}

impl AgentConfig {
    /// Builds a config from a connection string, applying every recognised option.
    pub fn from_connection_string(conn_str: &str) -> Result<Self, ConfigError> {
        let spec = parse(conn_str)?;
        let mut config = AgentConfig::default();
        config.apply_conn_spec(&spec)?;
        Ok(config)
    }

    /// Applies seed addresses and options from a parsed connection string.
    pub fn apply_conn_spec(&mut self, spec: &ConnSpec) -> Result<(), ConfigError> {
        let (memd, http) = spec.resolve_addrs();
        self.seed.memd_addrs = memd;
        self.seed.http_addrs = http;
        self.security.use_tls = spec.use_tls();

        if let Some(v) = spec.option("bootstrap_on") {
            self.config_poller.bootstrap_on = match v {
                "both" => BootstrapOn::Both,
                "cccp" => BootstrapOn::Cccp,
                "http" => BootstrapOn::Http,
                _ => return Err(invalid("bootstrap_on", v)),
            };
        }
        if let Some(v) = spec.option("ca_cert_path") {
            self.security.ca_cert_path = Some(PathBuf::from(v));
        }
        if let Some(v) = spec.option("network") {
            self.io.network_type = match v {
                "" | "auto" => NetworkType::Auto,
                "default" => NetworkType::Default,
                "external" => NetworkType::External,
                other => NetworkType::Named(other.to_string()),
            };
        }
        if let Some(d) = opt_duration(spec, "kv_connect_timeout")? {
            self.kv.connect_timeout = d;
        }
        if let Some(d) = opt_duration(spec, "config_poll_timeout")? {
            self.config_poller.cccp_max_wait = d;
        }
        if let Some(d) = opt_duration(spec, "config_poll_interval")? {
            self.config_poller.cccp_poll_period = d;
        }
        if let Some(b) = opt_bool(spec, "enable_mutation_tokens")? {
            self.io.use_mutation_tokens = b;
        }
        if let Some(b) = opt_bool(spec, "compression")? {
            self.compression.enabled = b;
        }
        if let Some(n) = opt_parse::<usize>(spec, "compression_min_size")? {
            self.compression.min_size = n;
        }
        if let Some(r) = opt_parse::<f64>(spec, "compression_min_ratio")? {
            self.compression.min_ratio = r;
        }
        if let Some(b) = opt_bool(spec, "enable_server_durations")? {
            self.io.use_durations = b;
        }
        if let Some(n) = opt_parse::<usize>(spec, "max_idle_http_connections")? {
            self.http.max_idle_conns = n;
        }
        if let Some(n) = opt_parse::<usize>(spec, "max_perhost_idle_http_connections")? {
            self.http.max_idle_conns_per_host = n;
        }
        if let Some(d) = opt_duration(spec, "idle_http_connection_timeout")? {
            self.http.idle_conn_timeout = d;
        }
        if let Some(b) = opt_bool(spec, "orphaned_response_logging")? {
            self.orphan_reporter.enabled = b;
        }
        if let Some(d) = opt_duration(spec, "orphaned_response_logging_interval")? {
            self.orphan_reporter.interval = d;
        }
        if let Some(n) = opt_parse::<usize>(spec, "orphaned_response_logging_sample_size")? {
            self.orphan_reporter.sample_size = n;
        }
        if let Some(d) = opt_duration(spec, "http_redial_period")? {
            self.config_poller.http_redial_period = d;
        }
        if let Some(d) = opt_duration(spec, "http_retry_delay")? {
            self.config_poller.http_retry_delay = d;
        }
        if let Some(n) = opt_parse::<usize>(spec, "kv_pool_size")? {
            self.kv.pool_size = n.max(1);
        }
        if let Some(n) = opt_parse::<usize>(spec, "max_queue_size")? {
            self.kv.max_queue_size = n;
        }
        if let Some(v) = spec.option("dcp_priority") {
            self.dcp.priority = match v {
                "" | "low" => DcpPriority::Low,
                "medium" => DcpPriority::Medium,
                "high" => DcpPriority::High,
                _ => return Err(invalid("dcp_priority", v)),
            };
        }
        if let Some(n) = opt_parse::<usize>(spec, "dcp_buffer_size")? {
            self.dcp.buffer_size = n;
        }
        if let Some(b) = opt_bool(spec, "enable_dcp_expiry")? {
            self.dcp.use_expiry_opcode = b;
        }
        Ok(())
    }
}
