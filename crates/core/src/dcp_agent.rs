//! Agent variant for change-stream consumers.
//!
//! Connections negotiate a DCP session during bootstrap, so every request
//! the agent sends runs on a producer connection. One connection per node.

use std::sync::Arc;
use std::time::Duration;

use cbcore_config::AgentConfig;
use cbcore_errors::{CoreError, CoreResult};
use tracing::info;

use crate::agent::Agent;
use crate::kv::bootstrap::DcpBootstrap;
use crate::ops::{FailoverEntry, OpOptions, StreamObserver, StreamOptions, StreamStart, VbSeqno};
use crate::routing::ConfigManager;

pub struct DcpAgent {
    inner: Agent,
    connection_name: String,
}

impl DcpAgent {
    pub fn new(config: AgentConfig) -> CoreResult<Self> {
        if config.bucket_name.as_deref().is_none_or(str::is_empty) {
            return Err(CoreError::invalid_argument("a DCP agent needs a bucket"));
        }
        let connection_name = config.dcp.connection_name.clone();
        if connection_name.is_empty() {
            return Err(CoreError::invalid_argument("a DCP agent needs a connection name"));
        }
        let dcp = DcpBootstrap {
            connection_name: connection_name.clone(),
            config: config.dcp.clone(),
        };
        info!(connection = %connection_name, priority = config.dcp.priority.as_str(), "Creating DCP agent");
        Ok(Self {
            inner: Agent::build(config, Some(dcp))?,
            connection_name,
        })
    }

    pub fn connection_name(&self) -> &str {
        &self.connection_name
    }

    pub fn config_manager(&self) -> &Arc<ConfigManager> {
        self.inner.config_manager()
    }

    pub fn config_rev(&self) -> i64 {
        self.inner.config_rev()
    }

    /// Number of vbuckets in the current config, 0 before the first.
    pub fn num_vbuckets(&self) -> usize {
        self.inner.mux().state().map(|s| s.num_vbuckets()).unwrap_or(0)
    }

    pub async fn wait_until_ready(&self, timeout: Duration) -> CoreResult<()> {
        self.inner.wait_until_ready(timeout).await
    }

    /// Opens a stream on `vbucket`; events go to `observer`, which sees
    /// exactly one `end` call once the stream is open.
    pub async fn open_stream(
        &self,
        vbucket: u16,
        opts: &StreamOptions,
        observer: Arc<dyn StreamObserver>,
    ) -> CoreResult<StreamStart> {
        self.inner.kv().open_stream(vbucket, opts, observer).await
    }

    pub async fn close_stream(&self, vbucket: u16, stream_id: Option<u16>) -> CoreResult<()> {
        self.inner.kv().close_stream(vbucket, stream_id, &OpOptions::new()).await
    }

    pub async fn get_failover_log(&self, vbucket: u16) -> CoreResult<Vec<FailoverEntry>> {
        self.inner.kv().get_failover_log(vbucket, &OpOptions::new()).await
    }

    pub async fn get_vbucket_seqnos(&self, vb_state: u32, collection_id: Option<u32>) -> CoreResult<Vec<VbSeqno>> {
        self.inner
            .kv()
            .get_vbucket_seqnos(vb_state, collection_id, &OpOptions::new())
            .await
    }

    pub async fn close(&self) -> CoreResult<()> {
        self.inner.close().await
    }
}

#[cfg(test)]
mod tests {
    use cbcore_config::DcpConfig;
    use cbcore_errors::ErrorKind;

    use super::*;

    fn config() -> AgentConfig {
        AgentConfig::new()
            .with_memd_addrs(vec!["127.0.0.1:1".into()])
            .with_bootstrap_on(cbcore_config::BootstrapOn::Cccp)
    }

    #[test]
    fn test_requires_bucket_and_name() {
        let err = DcpAgent::new(config()).err().unwrap();
        assert!(err.is(ErrorKind::InvalidArgument));

        let mut no_name = config().with_bucket("default");
        no_name.dcp.connection_name.clear();
        let err = DcpAgent::new(no_name).err().unwrap();
        assert!(err.is(ErrorKind::InvalidArgument));
    }

    #[tokio::test]
    async fn test_builds_and_closes() {
        let cfg = config().with_bucket("default").with_dcp(DcpConfig {
            connection_name: "indexer".into(),
            ..Default::default()
        });
        let agent = DcpAgent::new(cfg).unwrap();
        assert_eq!(agent.connection_name(), "indexer");
        assert_eq!(agent.num_vbuckets(), 0);
        agent.close().await.unwrap();
    }
}
