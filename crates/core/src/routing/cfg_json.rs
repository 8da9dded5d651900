//! Wire form of the cluster configuration document.

use std::collections::{BTreeMap, HashMap};

use cbcore_errors::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};

/// Placeholder the server puts where the receiving node's hostname belongs.
pub const HOST_PLACEHOLDER: &str = "$HOST";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeJson {
    #[serde(default, rename = "couchApiBase", skip_serializing_if = "String::is_empty")]
    pub couch_api_base: String,
    #[serde(default)]
    pub hostname: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub ports: BTreeMap<String, u16>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlternateAddressJson {
    #[serde(default)]
    pub hostname: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub ports: BTreeMap<String, u16>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeExtJson {
    #[serde(default)]
    pub services: BTreeMap<String, u16>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hostname: String,
    #[serde(default, rename = "thisNode", skip_serializing_if = "std::ops::Not::not")]
    pub this_node: bool,
    #[serde(default, rename = "alternateAddresses", skip_serializing_if = "BTreeMap::is_empty")]
    pub alternate_addresses: BTreeMap<String, AlternateAddressJson>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VBucketServerMapJson {
    #[serde(default, rename = "hashAlgorithm", skip_serializing_if = "String::is_empty")]
    pub hash_algorithm: String,
    #[serde(default, rename = "numReplicas")]
    pub num_replicas: usize,
    #[serde(default, rename = "serverList")]
    pub server_list: Vec<String>,
    #[serde(default, rename = "vBucketMap")]
    pub vbucket_map: Vec<Vec<i32>>,
}

/// A cluster or bucket configuration as served over CCCP or HTTP streaming.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfigJson {
    #[serde(default)]
    pub rev: i64,
    #[serde(default, rename = "revEpoch", skip_serializing_if = "is_zero")]
    pub rev_epoch: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub uuid: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, rename = "nodeLocator", skip_serializing_if = "String::is_empty")]
    pub node_locator: String,
    #[serde(default)]
    pub nodes: Vec<NodeJson>,
    #[serde(default, rename = "nodesExt")]
    pub nodes_ext: Vec<NodeExtJson>,
    #[serde(default, rename = "vBucketServerMap", skip_serializing_if = "Option::is_none")]
    pub vbucket_server_map: Option<VBucketServerMapJson>,
    #[serde(default, rename = "bucketCapabilitiesVer", skip_serializing_if = "String::is_empty")]
    pub bucket_capabilities_ver: String,
    #[serde(default, rename = "bucketCapabilities", skip_serializing_if = "Vec::is_empty")]
    pub bucket_capabilities: Vec<String>,
    #[serde(default, rename = "clusterCapabilitiesVer", skip_serializing_if = "Vec::is_empty")]
    pub cluster_capabilities_ver: Vec<i32>,
    #[serde(default, rename = "clusterCapabilities", skip_serializing_if = "HashMap::is_empty")]
    pub cluster_capabilities: HashMap<String, Vec<String>>,
}

fn is_zero(v: &i64) -> bool {
    *v == 0
}

impl ClusterConfigJson {
    /// Parses a configuration, replacing the host placeholder with `source_host`.
    pub fn parse(bytes: &[u8], source_host: &str) -> CoreResult<Self> {
        let text = std::str::from_utf8(bytes).map_err(|e| CoreError::protocol(format!("config is not utf-8: {e}")))?;
        let text = text.replace(HOST_PLACEHOLDER, &bracket_host(source_host));
        let mut cfg: Self =
            serde_json::from_str(&text).map_err(|e| CoreError::protocol(format!("invalid cluster config: {e}")))?;
        for node in cfg.nodes_ext.iter_mut().filter(|n| n.hostname.is_empty()) {
            node.hostname = source_host.to_string();
        }
        Ok(cfg)
    }

    pub fn to_bytes(&self) -> CoreResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| CoreError::protocol(e.to_string()))
    }
}

/// Host part of a `host:port` address, with IPv6 brackets removed.
pub fn host_from_host_port(addr: &str) -> &str {
    if let Some(rest) = addr.strip_prefix('[')
        && let Some(end) = rest.find(']')
    {
        return &rest[..end];
    }
    match addr.rfind(':') {
        Some(idx) if addr[..idx].find(':').is_none() => &addr[..idx],
        Some(_) => addr,
        None => addr,
    }
}

/// Wraps IPv6 literals in brackets so a port can be appended.
pub fn bracket_host(host: &str) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]")
    } else {
        host.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TERSE: &str = r#"{
        "rev": 1073,
        "name": "default",
        "uuid": "8a5e4b3f",
        "nodeLocator": "vbucket",
        "nodes": [{"hostname": "$HOST:8091", "ports": {"direct": 11210}}],
        "nodesExt": [{"services": {"kv": 11210, "mgmt": 8091, "n1ql": 8093}, "thisNode": true}],
        "vBucketServerMap": {"hashAlgorithm": "CRC", "numReplicas": 0, "serverList": ["$HOST:11210"], "vBucketMap": [[0],[0],[0],[0]]},
        "bucketCapabilities": ["collections", "durableWrite"],
        "clusterCapabilitiesVer": [1, 0],
        "clusterCapabilities": {"n1ql": ["enhancedPreparedStatements"]}
    }"#;

    #[test]
    fn test_parse_splices_host() {
        let cfg = ClusterConfigJson::parse(TERSE.as_bytes(), "10.0.0.5").unwrap();
        assert_eq!(cfg.rev, 1073);
        assert_eq!(cfg.nodes[0].hostname, "10.0.0.5:8091");
        assert_eq!(cfg.nodes_ext[0].hostname, "10.0.0.5");
        let map = cfg.vbucket_server_map.as_ref().unwrap();
        assert_eq!(map.server_list, vec!["10.0.0.5:11210".to_string()]);
        assert_eq!(map.vbucket_map.len(), 4);
    }

    #[test]
    fn test_parse_brackets_ipv6_source() {
        let cfg = ClusterConfigJson::parse(TERSE.as_bytes(), "::1").unwrap();
        assert_eq!(cfg.nodes[0].hostname, "[::1]:8091");
    }

    #[test]
    fn test_serialize_then_parse_is_identity() {
        let cfg = ClusterConfigJson::parse(TERSE.as_bytes(), "node1").unwrap();
        let bytes = cfg.to_bytes().unwrap();
        let again = ClusterConfigJson::parse(&bytes, "ignored").unwrap();
        assert_eq!(cfg, again);
    }

    #[test]
    fn test_invalid_json_is_rejected() {
        assert!(ClusterConfigJson::parse(b"{not json", "h").is_err());
    }

    #[test]
    fn test_host_from_host_port() {
        assert_eq!(host_from_host_port("10.1.1.1:11210"), "10.1.1.1");
        assert_eq!(host_from_host_port("[::1]:11210"), "::1");
        assert_eq!(host_from_host_port("localhost"), "localhost");
    }
}
