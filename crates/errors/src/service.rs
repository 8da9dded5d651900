//! Service identifiers shared by routing and error records.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A cluster service the client talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceType {
    /// Binary key/value.
    Memd,
    /// Cluster management REST.
    Mgmt,
    /// Views.
    Capi,
    /// Query.
    N1ql,
    /// Full-text search.
    Fts,
    /// Analytics.
    Cbas,
}

impl ServiceType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Memd => "kv",
            Self::Mgmt => "mgmt",
            Self::Capi => "views",
            Self::N1ql => "query",
            Self::Fts => "search",
            Self::Cbas => "analytics",
        }
    }

    /// Services reachable over HTTP.
    pub const HTTP: [ServiceType; 5] = [Self::Mgmt, Self::Capi, Self::N1ql, Self::Fts, Self::Cbas];
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
