//! Produces bootstrapped memd clients.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use cbcore_errors::{CoreError, CoreResult};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::bootstrap::{BootstrapProps, bootstrap};
use super::client::{MemdClient, MemdClientProps, PostErrorHandler, passthrough_error_handler};
use super::transport::Connector;

#[derive(Clone)]
pub struct DialerProps {
    pub connect_timeout: Duration,
    pub server_wait_timeout: Duration,
    pub client: MemdClientProps,
    pub bootstrap: BootstrapProps,
}

struct Failure {
    at: Instant,
    error: CoreError,
}

pub struct Dialer {
    connector: Arc<dyn Connector>,
    props: DialerProps,
    failures: Mutex<HashMap<String, Failure>>,
}

impl Dialer {
    pub fn new(connector: Arc<dyn Connector>, props: DialerProps) -> Self {
        Self {
            connector,
            props,
            failures: Mutex::new(HashMap::new()),
        }
    }

    pub fn bootstrap_props(&self) -> &BootstrapProps {
        &self.props.bootstrap
    }

    /// The error from the last failed dial to `address`, if it has not
    /// connected since.
    pub fn last_error(&self, address: &str) -> Option<CoreError> {
        self.failures.lock().get(address).map(|f| f.error.clone())
    }

    fn record_failure(&self, address: &str, error: &CoreError) {
        self.failures.lock().insert(
            address.to_string(),
            Failure {
                at: Instant::now(),
                error: error.clone(),
            },
        );
    }

    /// Dials `address`, first waiting out the remainder of the server wait
    /// period if the previous attempt against it failed.
    pub async fn slow_dial(
        &self,
        address: &str,
        post_error: PostErrorHandler,
        cancel: &CancellationToken,
    ) -> CoreResult<Arc<MemdClient>> {
        let failed_at = self.failures.lock().get(address).map(|f| f.at);
        if let Some(failed_at) = failed_at {
            let waited = failed_at.elapsed();
            if waited < self.props.server_wait_timeout {
                let wait = self.props.server_wait_timeout - waited;
                debug!(address, wait_ms = wait.as_millis() as u64, "Waiting before redialing failed server");
                tokio::select! {
                    _ = cancel.cancelled() => return Err(CoreError::canceled()),
                    _ = tokio::time::sleep(wait) => {}
                }
            }
        }

        let deadline = Instant::now() + self.props.connect_timeout;
        let result = tokio::select! {
            _ = cancel.cancelled() => return Err(CoreError::canceled()),
            result = self.dial(address, deadline) => result,
        };
        match result {
            Ok(client) => {
                self.failures.lock().remove(address);
                client.set_post_error_handler(post_error);
                Ok(client)
            }
            Err(e) => {
                self.record_failure(address, &e);
                Err(e)
            }
        }
    }

    async fn dial(&self, address: &str, deadline: Instant) -> CoreResult<Arc<MemdClient>> {
        let conn = self.connector.connect(address, deadline).await?;
        let mut props = self.props.client.clone();
        props.post_error = passthrough_error_handler();
        let client = MemdClient::start(conn, props);

        if let Err(e) = bootstrap(&client, &self.props.bootstrap, deadline).await {
            warn!(address, error = %e, "Memd client bootstrap failed");
            client.close(Some(e.clone()));
            return Err(e);
        }
        Ok(client)
    }
}

#[cfg(test)]
mod tests {
    use cbcore_config::AgentConfig;
    use cbcore_memd::{MemdCodec, Opcode, Packet, Status};
    use futures::{SinkExt, StreamExt};
    use tokio::net::TcpListener;
    use tokio_util::codec::Framed;

    use super::*;
    use crate::error_map::ErrorMapComponent;
    use crate::kv::bootstrap::HelloProps;
    use crate::kv::transport::TcpConnector;

    fn props(server_wait: Duration) -> DialerProps {
        DialerProps {
            connect_timeout: Duration::from_secs(1),
            server_wait_timeout: server_wait,
            client: MemdClientProps::new("dialer-test"),
            bootstrap: BootstrapProps {
                bucket: None,
                user_agent: "cbcore-test".into(),
                credentials: None,
                auth_mechanisms: Vec::new(),
                error_map: Arc::new(ErrorMapComponent::new()),
                hello: HelloProps::from_config(&AgentConfig::default()),
                dcp: None,
            },
        }
    }

    /// Answers every request with success and an empty body.
    async fn accept_and_ack(listener: TcpListener) {
        let (sock, _) = listener.accept().await.unwrap();
        let mut framed = Framed::new(sock, MemdCodec::new());
        while let Some(Ok(req)) = framed.next().await {
            let status = if req.command == Opcode::GET_ERROR_MAP {
                Status::UNKNOWN_COMMAND
            } else {
                Status::SUCCESS
            };
            if framed.send(Packet::response_to(&req, status)).await.is_err() {
                break;
            }
        }
    }

    #[tokio::test]
    async fn test_dial_bootstraps_without_credentials() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(accept_and_ack(listener));

        let dialer = Dialer::new(Arc::new(TcpConnector), props(Duration::from_secs(5)));
        let client = dialer
            .slow_dial(&addr, passthrough_error_handler(), &CancellationToken::new())
            .await
            .unwrap();
        assert!(!client.is_closed());
        assert!(dialer.last_error(&addr).is_none());
    }

    #[tokio::test]
    async fn test_failed_dial_is_recorded_and_dampened() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let dialer = Dialer::new(Arc::new(TcpConnector), props(Duration::from_millis(200)));
        let cancel = CancellationToken::new();
        assert!(dialer.slow_dial(&addr, passthrough_error_handler(), &cancel).await.is_err());
        assert!(dialer.last_error(&addr).is_some());

        let started = Instant::now();
        assert!(dialer.slow_dial(&addr, passthrough_error_handler(), &cancel).await.is_err());
        assert!(started.elapsed() >= Duration::from_millis(150));
    }

    #[tokio::test]
    async fn test_cancel_interrupts_server_wait() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let dialer = Dialer::new(Arc::new(TcpConnector), props(Duration::from_secs(30)));
        let cancel = CancellationToken::new();
        let _ = dialer.slow_dial(&addr, passthrough_error_handler(), &cancel).await;
        cancel.cancel();
        let err = dialer
            .slow_dial(&addr, passthrough_error_handler(), &cancel)
            .await
            .err()
            .unwrap();
        assert!(err.is(cbcore_errors::ErrorKind::RequestCanceled));
    }
}
