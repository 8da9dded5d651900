//! Immutable routing snapshot built from a cluster configuration.

use std::collections::HashMap;

use tracing::debug;

use super::cfg_json::{ClusterConfigJson, NodeExtJson, bracket_host, host_from_host_port};
use super::ketama::KetamaContinuum;
use super::vbucket::VbucketMap;

/// Network family name for the addresses in the top level of `nodesExt`.
pub const DEFAULT_NETWORK: &str = "default";
/// Network family name advertised for clients outside the cluster network.
pub const EXTERNAL_NETWORK: &str = "external";

/// How keys are mapped to nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BucketType {
    /// No bucket is selected (cluster level session).
    #[default]
    None,
    /// Partitioned bucket routed by vbucket map.
    Vbucket,
    /// Hashed bucket routed by ketama ring.
    Ketama,
    Invalid,
}

/// One cluster view. Never mutated once published.
#[derive(Debug, Clone, Default)]
pub struct RouteConfig {
    pub rev_id: i64,
    pub rev_epoch: i64,
    pub uuid: String,
    pub name: String,
    pub bucket_type: BucketType,
    /// Data node addresses as `host:port`; vbucket map entries index into this.
    pub kv_server_list: Vec<String>,
    pub mgmt_ep_list: Vec<String>,
    pub capi_ep_list: Vec<String>,
    pub n1ql_ep_list: Vec<String>,
    pub fts_ep_list: Vec<String>,
    pub cbas_ep_list: Vec<String>,
    pub vb_map: Option<VbucketMap>,
    pub ketama_map: Option<KetamaContinuum>,
    pub bucket_capabilities_ver: String,
    pub bucket_capabilities: Vec<String>,
    pub cluster_capabilities_ver: Vec<i32>,
    pub cluster_capabilities: HashMap<String, Vec<String>>,
}

struct ServicePorts<'a> {
    host: String,
    ports: &'a std::collections::BTreeMap<String, u16>,
    tls: bool,
}

impl ServicePorts<'_> {
    fn port(&self, service: &str) -> Option<u16> {
        let key = if self.tls { format!("{service}SSL") } else { service.to_string() };
        self.ports.get(&key).copied()
    }

    fn addr(&self, service: &str) -> Option<String> {
        self.port(service).map(|p| format!("{}:{p}", self.host))
    }

    fn url(&self, service: &str) -> Option<String> {
        let scheme = if self.tls { "https" } else { "http" };
        self.addr(service).map(|a| format!("{scheme}://{a}"))
    }
}

fn node_ports<'a>(node: &'a NodeExtJson, network: &str, tls: bool) -> Option<ServicePorts<'a>> {
    if network == DEFAULT_NETWORK {
        return Some(ServicePorts {
            host: bracket_host(&node.hostname),
            ports: &node.services,
            tls,
        });
    }
    let alt = node.alternate_addresses.get(network)?;
    let ports = if alt.ports.is_empty() { &node.services } else { &alt.ports };
    Some(ServicePorts {
        host: bracket_host(&alt.hostname),
        ports,
        tls,
    })
}

impl RouteConfig {
    /// Builds the routing view of `cfg` for one network family.
    pub fn build(cfg: &ClusterConfigJson, use_tls: bool, network: &str) -> Self {
        let bucket_type = match cfg.node_locator.as_str() {
            "vbucket" => BucketType::Vbucket,
            "ketama" => BucketType::Ketama,
            "" => BucketType::None,
            other => {
                debug!(locator = other, "Unknown node locator");
                BucketType::Invalid
            }
        };

        let mut rc = RouteConfig {
            rev_id: cfg.rev,
            rev_epoch: cfg.rev_epoch,
            uuid: cfg.uuid.clone(),
            name: cfg.name.clone(),
            bucket_type,
            bucket_capabilities_ver: cfg.bucket_capabilities_ver.clone(),
            bucket_capabilities: cfg.bucket_capabilities.clone(),
            cluster_capabilities_ver: cfg.cluster_capabilities_ver.clone(),
            cluster_capabilities: cfg.cluster_capabilities.clone(),
            ..Default::default()
        };

        if cfg.nodes_ext.is_empty() {
            rc.fill_from_legacy_nodes(cfg, use_tls);
        } else {
            rc.fill_from_nodes_ext(cfg, use_tls, network);
        }

        match bucket_type {
            BucketType::Vbucket => {
                if let Some(map) = &cfg.vbucket_server_map {
                    rc.vb_map = Some(VbucketMap::new(map.vbucket_map.clone(), map.num_replicas));
                }
            }
            BucketType::Ketama => {
                rc.ketama_map = Some(KetamaContinuum::new(&rc.kv_server_list));
            }
            _ => {}
        }
        rc
    }

    fn fill_from_nodes_ext(&mut self, cfg: &ClusterConfigJson, tls: bool, network: &str) {
        let nodes: Vec<Option<ServicePorts<'_>>> = cfg.nodes_ext.iter().map(|n| node_ports(n, network, tls)).collect();

        for node in nodes.iter().flatten() {
            if let Some(url) = node.url("mgmt") {
                self.mgmt_ep_list.push(url);
            }
            if let Some(url) = node.url("capi") {
                self.capi_ep_list.push(url);
            }
            if let Some(url) = node.url("n1ql") {
                self.n1ql_ep_list.push(url);
            }
            if let Some(url) = node.url("fts") {
                self.fts_ep_list.push(url);
            }
            if let Some(url) = node.url("cbas") {
                self.cbas_ep_list.push(url);
            }
        }

        match (&self.bucket_type, &cfg.vbucket_server_map) {
            (BucketType::Vbucket, Some(map)) => {
                // Keep serverList order so vbucket map indexes stay valid.
                for entry in &map.server_list {
                    let owner = cfg.nodes_ext.iter().zip(nodes.iter()).find(|(raw, _)| {
                        raw.services
                            .get("kv")
                            .is_some_and(|p| format!("{}:{p}", bracket_host(&raw.hostname)) == *entry)
                    });
                    let addr = owner.and_then(|(_, ports)| ports.as_ref().and_then(|p| p.addr("kv")));
                    self.kv_server_list.push(addr.unwrap_or_else(|| entry.clone()));
                }
            }
            _ => {
                for node in nodes.iter().flatten() {
                    if let Some(addr) = node.addr("kv") {
                        self.kv_server_list.push(addr);
                    }
                }
            }
        }
    }

    fn fill_from_legacy_nodes(&mut self, cfg: &ClusterConfigJson, tls: bool) {
        let scheme = if tls { "https" } else { "http" };
        for node in &cfg.nodes {
            let host = bracket_host(host_from_host_port(&node.hostname));
            if let Some(port) = node.ports.get("direct") {
                self.kv_server_list.push(format!("{host}:{port}"));
            }
            let mgmt_port = node.hostname.rsplit(':').next().and_then(|p| p.parse::<u16>().ok()).unwrap_or(8091);
            self.mgmt_ep_list.push(format!("{scheme}://{host}:{mgmt_port}"));
            if !node.couch_api_base.is_empty()
                && let Ok(url) = url::Url::parse(&node.couch_api_base)
            {
                let base = url.origin().ascii_serialization();
                self.capi_ep_list.push(base);
            }
        }
        if let (BucketType::Vbucket, Some(map)) = (&self.bucket_type, &cfg.vbucket_server_map) {
            self.kv_server_list = map.server_list.clone();
        }
    }

    pub fn is_valid(&self) -> bool {
        if self.kv_server_list.is_empty() || self.mgmt_ep_list.is_empty() {
            return false;
        }
        match self.bucket_type {
            BucketType::Vbucket => self.vb_map.as_ref().is_some_and(VbucketMap::is_valid),
            BucketType::Ketama => self.ketama_map.as_ref().is_some_and(KetamaContinuum::is_valid),
            BucketType::None => true,
            BucketType::Invalid => false,
        }
    }

    /// True for cluster level configs fetched without a bucket.
    pub fn is_gcccp_config(&self) -> bool {
        self.bucket_type == BucketType::None
    }

    pub fn is_newer_than(&self, other: &RouteConfig) -> bool {
        if self.rev_epoch != other.rev_epoch {
            return self.rev_epoch > other.rev_epoch;
        }
        self.rev_id > other.rev_id
    }

    pub fn has_bucket_capability(&self, cap: &str) -> bool {
        self.bucket_capabilities.iter().any(|c| c == cap)
    }

    pub fn has_cluster_capability(&self, category: &str, cap: &str) -> bool {
        self.cluster_capabilities
            .get(category)
            .is_some_and(|caps| caps.iter().any(|c| c == cap))
    }

    pub fn num_vbuckets(&self) -> Option<usize> {
        self.vb_map.as_ref().map(VbucketMap::num_vbuckets)
    }
}

/// Picks the network family for a first config based on the seed addresses.
///
/// A seed that matches a default-network node selects `default`; otherwise an
/// `external` family selects itself when every node advertises it.
pub fn network_for_seeds(cfg: &ClusterConfigJson, seeds: &[String]) -> String {
    let seed_hosts: Vec<&str> = seeds.iter().map(|s| host_from_host_port(s)).collect();
    let matches_default = cfg.nodes_ext.iter().any(|n| seed_hosts.contains(&n.hostname.as_str()))
        || cfg
            .nodes
            .iter()
            .any(|n| seed_hosts.contains(&host_from_host_port(&n.hostname)));
    if matches_default {
        return DEFAULT_NETWORK.to_string();
    }

    let external_valid = !cfg.nodes_ext.is_empty()
        && cfg.nodes_ext.iter().all(|n| {
            n.alternate_addresses
                .get(EXTERNAL_NETWORK)
                .is_some_and(|alt| !alt.hostname.is_empty())
        });
    if external_valid {
        EXTERNAL_NETWORK.to_string()
    } else {
        DEFAULT_NETWORK.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TWO_NODES: &str = r#"{
        "rev": 12,
        "name": "beer-sample",
        "nodeLocator": "vbucket",
        "nodesExt": [
            {"hostname": "10.0.0.1", "services": {"kv": 11210, "kvSSL": 11207, "mgmt": 8091, "mgmtSSL": 18091, "n1ql": 8093},
             "alternateAddresses": {"external": {"hostname": "ext1.example.com", "ports": {"kv": 31210, "mgmt": 38091}}}},
            {"hostname": "10.0.0.2", "services": {"kv": 11210, "kvSSL": 11207, "mgmt": 8091, "mgmtSSL": 18091, "fts": 8094},
             "alternateAddresses": {"external": {"hostname": "ext2.example.com", "ports": {"kv": 31210, "mgmt": 38091}}}}
        ],
        "vBucketServerMap": {"numReplicas": 1, "serverList": ["10.0.0.2:11210", "10.0.0.1:11210"],
                             "vBucketMap": [[0, 1], [1, 0]]},
        "bucketCapabilities": ["collections"],
        "clusterCapabilities": {"n1ql": ["enhancedPreparedStatements"]}
    }"#;

    fn parse() -> ClusterConfigJson {
        ClusterConfigJson::parse(TWO_NODES.as_bytes(), "10.0.0.1").unwrap()
    }

    #[test]
    fn test_kv_list_follows_server_list_order() {
        let rc = RouteConfig::build(&parse(), false, DEFAULT_NETWORK);
        assert_eq!(rc.kv_server_list, vec!["10.0.0.2:11210", "10.0.0.1:11210"]);
        assert_eq!(rc.mgmt_ep_list, vec!["http://10.0.0.1:8091", "http://10.0.0.2:8091"]);
        assert_eq!(rc.n1ql_ep_list, vec!["http://10.0.0.1:8093"]);
        assert_eq!(rc.fts_ep_list, vec!["http://10.0.0.2:8094"]);
        assert!(rc.is_valid());
        assert_eq!(rc.num_vbuckets(), Some(2));
    }

    #[test]
    fn test_tls_and_external_network() {
        let rc = RouteConfig::build(&parse(), true, DEFAULT_NETWORK);
        assert_eq!(rc.kv_server_list, vec!["10.0.0.2:11207", "10.0.0.1:11207"]);
        assert_eq!(rc.mgmt_ep_list[0], "https://10.0.0.1:18091");

        let rc = RouteConfig::build(&parse(), false, EXTERNAL_NETWORK);
        assert_eq!(rc.kv_server_list, vec!["ext2.example.com:31210", "ext1.example.com:31210"]);
        assert_eq!(rc.mgmt_ep_list[1], "http://ext2.example.com:38091");
    }

    #[test]
    fn test_capabilities() {
        let rc = RouteConfig::build(&parse(), false, DEFAULT_NETWORK);
        assert!(rc.has_bucket_capability("collections"));
        assert!(!rc.has_bucket_capability("durableWrite"));
        assert!(rc.has_cluster_capability("n1ql", "enhancedPreparedStatements"));
    }

    #[test]
    fn test_invalid_without_map() {
        let mut cfg = parse();
        cfg.vbucket_server_map = None;
        let rc = RouteConfig::build(&cfg, false, DEFAULT_NETWORK);
        assert!(!rc.is_valid());
    }

    #[test]
    fn test_gcccp_config() {
        let mut cfg = parse();
        cfg.node_locator.clear();
        cfg.name.clear();
        cfg.vbucket_server_map = None;
        let rc = RouteConfig::build(&cfg, false, DEFAULT_NETWORK);
        assert!(rc.is_gcccp_config());
        assert!(rc.is_valid());
        assert_eq!(rc.kv_server_list.len(), 2);
    }

    #[test]
    fn test_network_selection() {
        let cfg = parse();
        assert_eq!(network_for_seeds(&cfg, &["10.0.0.2:11210".into()]), DEFAULT_NETWORK);
        assert_eq!(network_for_seeds(&cfg, &["ext1.example.com:31210".into()]), EXTERNAL_NETWORK);
        let mut no_alt = cfg.clone();
        no_alt.nodes_ext[1].alternate_addresses.clear();
        assert_eq!(network_for_seeds(&no_alt, &["ext1.example.com".into()]), DEFAULT_NETWORK);
    }

    #[test]
    fn test_epoch_compared_first() {
        let a = RouteConfig { rev_id: 100, rev_epoch: 1, ..Default::default() };
        let b = RouteConfig { rev_id: 1, rev_epoch: 2, ..Default::default() };
        assert!(b.is_newer_than(&a));
        assert!(!a.is_newer_than(&b));
    }
}
