//! Per-connection bootstrap: HELLO, error map, SASL, bucket selection and
//! the optional DCP handshake.
//!
//! Requests are written back to back and only awaited afterwards, so a
//! healthy bootstrap costs one round trip plus one per extra SASL step.

use std::sync::Arc;
use std::time::Instant;

use cbcore_config::{AgentConfig, AuthMechanism, Credentials, DcpConfig};
use cbcore_errors::{CoreError, CoreResult, ErrorKind};
use cbcore_memd::feature::{decode_features, encode_features};
use cbcore_memd::{HelloFeature, Opcode, Packet};
use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{debug, info};

use super::client::MemdClient;
use super::request::{Request, Response};
use crate::auth::{SaslClient, next_mechanism, parse_mechanisms};
use crate::error_map::{ErrorMap, ErrorMapComponent};
use crate::retry::FailFastRetryStrategy;

/// Which optional HELLO features to request.
#[derive(Debug, Clone, Default)]
pub struct HelloProps {
    pub mutation_tokens: bool,
    pub collections: bool,
    pub compression: bool,
    pub durations: bool,
    pub out_of_order: bool,
    pub json: bool,
    pub xerror: bool,
    pub sync_replication: bool,
    pub cluster_map_notifications: bool,
}

impl HelloProps {
    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            mutation_tokens: config.io.use_mutation_tokens,
            collections: config.io.use_collections,
            compression: config.compression.enabled,
            durations: config.io.use_durations,
            out_of_order: config.io.use_out_of_order,
            json: config.io.use_json_hello,
            xerror: config.io.use_xerror_hello,
            sync_replication: config.io.use_sync_replication,
            cluster_map_notifications: config.io.use_cluster_map_notifications,
        }
    }

    /// Feature list offered in HELLO.
    pub fn features(&self) -> Vec<HelloFeature> {
        let mut features = vec![HelloFeature::TLS, HelloFeature::XATTR, HelloFeature::SELECT_BUCKET];
        if self.xerror {
            features.push(HelloFeature::XERROR);
        }
        if self.json {
            features.push(HelloFeature::JSON);
        }
        if self.mutation_tokens {
            features.push(HelloFeature::SEQNO);
        }
        if self.compression {
            features.push(HelloFeature::SNAPPY);
        }
        if self.durations {
            features.push(HelloFeature::DURATIONS);
        }
        if self.collections {
            features.push(HelloFeature::COLLECTIONS);
        }
        if self.out_of_order {
            features.push(HelloFeature::UNORDERED_EXEC);
        }
        // Informational only.
        features.push(HelloFeature::ALT_REQUESTS);
        features.push(HelloFeature::CREATE_AS_DELETED);
        features.push(HelloFeature::REPLACE_BODY_WITH_XATTR);
        features.push(HelloFeature::PRESERVE_EXPIRY);
        if self.sync_replication {
            features.push(HelloFeature::SYNC_REPLICATION);
        }
        if self.cluster_map_notifications {
            features.push(HelloFeature::DUPLEX);
            features.push(HelloFeature::CLUSTER_MAP_NOTIF);
        }
        features
    }
}

/// DCP connection settings applied after bucket selection.
#[derive(Debug, Clone)]
pub struct DcpBootstrap {
    pub connection_name: String,
    pub config: DcpConfig,
}

impl DcpBootstrap {
    fn controls(&self) -> Vec<(&'static str, String)> {
        let cfg = &self.config;
        let mut controls = vec![
            ("enable_noop", "true".to_string()),
            ("set_noop_interval", "180".to_string()),
            ("set_priority", cfg.priority.as_str().to_string()),
        ];
        if cfg.buffer_size > 0 {
            controls.push(("connection_buffer_size", cfg.buffer_size.to_string()));
        }
        if cfg.use_expiry_opcode {
            controls.push(("enable_expiry_opcode", "true".to_string()));
        }
        if cfg.use_stream_id {
            controls.push(("enable_stream_id", "true".to_string()));
        }
        if cfg.use_oso {
            let value = if cfg.use_seqno_advanced { "true_with_seqno_advanced" } else { "true" };
            controls.push(("enable_out_of_order_snapshots", value.to_string()));
        }
        controls
    }
}

/// Everything one connection needs to become usable.
#[derive(Clone)]
pub struct BootstrapProps {
    pub bucket: Option<String>,
    pub user_agent: String,
    pub credentials: Option<Credentials>,
    pub auth_mechanisms: Vec<AuthMechanism>,
    pub error_map: Arc<ErrorMapComponent>,
    pub hello: HelloProps,
    pub dcp: Option<DcpBootstrap>,
}

#[derive(Serialize)]
struct ClientInfo<'a> {
    a: &'a str,
    i: &'a str,
}

type Pending = oneshot::Receiver<CoreResult<Response>>;

async fn exec(client: &Arc<MemdClient>, packet: Packet, deadline: Instant) -> CoreResult<Pending> {
    let (tx, rx) = oneshot::channel();
    let req = Arc::new(
        Request::new(packet, move |r| {
            let _ = tx.send(r);
        })
        .with_retry_strategy(Arc::new(FailFastRetryStrategy))
        .with_deadline(deadline),
    );
    req.start_timer();
    if let Err(e) = client.send_request(&req).await {
        req.internal_cancel();
        return Err(e);
    }
    Ok(rx)
}

async fn wait(rx: Pending) -> CoreResult<Response> {
    rx.await.map_err(|_| CoreError::canceled())?
}

struct AuthAttempt {
    mechanism: AuthMechanism,
    sasl: SaslClient,
    pending: Pending,
}

async fn start_auth(
    client: &Arc<MemdClient>,
    mechanism: AuthMechanism,
    creds: &Credentials,
    deadline: Instant,
) -> CoreResult<AuthAttempt> {
    let sasl = SaslClient::new(mechanism, creds);
    let packet = Packet::request(Opcode::SASL_AUTH)
        .with_key(mechanism.as_str())
        .with_value(sasl.initial_response());
    let pending = exec(client, packet, deadline).await?;
    Ok(AuthAttempt {
        mechanism,
        sasl,
        pending,
    })
}

async fn select_bucket(client: &Arc<MemdClient>, bucket: Option<&str>, deadline: Instant) -> CoreResult<Option<Pending>> {
    match bucket {
        Some(bucket) => {
            let packet = Packet::request(Opcode::SELECT_BUCKET).with_key(bucket.to_string());
            Ok(Some(exec(client, packet, deadline).await?))
        }
        None => Ok(None),
    }
}

/// Completes one SASL exchange. Bucket selection is written as soon as the
/// last auth step is on the wire and its receiver handed back.
async fn run_auth(
    client: &Arc<MemdClient>,
    attempt: AuthAttempt,
    bucket: Option<&str>,
    deadline: Instant,
) -> (CoreResult<()>, Option<Pending>) {
    let AuthAttempt {
        mechanism,
        mut sasl,
        pending,
    } = attempt;

    if !sasl.is_multi_step() {
        let select = match select_bucket(client, bucket, deadline).await {
            Ok(select) => select,
            Err(e) => return (Err(e), None),
        };
        return (wait(pending).await.map(|_| ()), select);
    }

    let challenge = match wait(pending).await {
        Ok(resp) => resp,
        Err(e) => return (Err(e), None),
    };
    let body = match sasl.step(&challenge.packet.value) {
        Ok(body) => body,
        Err(e) => return (Err(e), None),
    };
    let step = Packet::request(Opcode::SASL_STEP)
        .with_key(mechanism.as_str())
        .with_value(body);
    let step_rx = match exec(client, step, deadline).await {
        Ok(rx) => rx,
        Err(e) => return (Err(e), None),
    };
    let select = match select_bucket(client, bucket, deadline).await {
        Ok(select) => select,
        Err(e) => return (Err(e), None),
    };
    let result = match wait(step_rx).await {
        Ok(resp) => sasl.finish(&resp.packet.value),
        Err(e) => Err(e),
    };
    (result, select)
}

/// Runs the bootstrap sequence on a fresh connection.
pub async fn bootstrap(client: &Arc<MemdClient>, props: &BootstrapProps, deadline: Instant) -> CoreResult<()> {
    debug!(address = %client.address(), "Fetching cluster client data");
    let bucket = props.bucket.as_deref();

    let info = serde_json::to_string(&ClientInfo {
        a: &props.user_agent,
        i: client.conn_id(),
    })
    .map_err(|e| CoreError::protocol(e.to_string()))?;
    let hello = Packet::request(Opcode::HELLO)
        .with_key(info)
        .with_value(encode_features(&props.hello.features()));
    let hello_rx = exec(client, hello, deadline).await?;

    let errmap = Packet::request(Opcode::GET_ERROR_MAP).with_value(1u16.to_be_bytes().to_vec());
    let errmap_rx = match exec(client, errmap, deadline).await {
        Ok(rx) => Some(rx),
        Err(e) => {
            debug!(address = %client.address(), error = %e, "Failed to execute get error map");
            None
        }
    };

    let mut mechanisms = props.auth_mechanisms.clone();
    let mut list_rx = None;
    let mut auth_result = Ok(());
    let mut first_mechanism = None;
    let mut select_rx = None;
    match (&props.credentials, mechanisms.is_empty()) {
        (Some(creds), false) => {
            match exec(client, Packet::request(Opcode::SASL_LIST_MECHS), deadline).await {
                Ok(rx) => list_rx = Some(rx),
                Err(e) => debug!(address = %client.address(), error = %e, "Failed to execute list auth mechs"),
            }
            let mechanism = mechanisms.remove(0);
            first_mechanism = Some(mechanism);
            let attempt = start_auth(client, mechanism, creds, deadline).await?;
            let (result, select) = run_auth(client, attempt, bucket, deadline).await;
            auth_result = result;
            select_rx = select;
        }
        _ => select_rx = select_bucket(client, bucket, deadline).await?,
    }

    let hello_resp = wait(hello_rx).await?;
    let features = decode_features(&hello_resp.packet.value);
    debug!(address = %client.address(), features = ?features, "HELLO negotiated");
    client.set_features(features);

    if let Some(rx) = errmap_rx {
        match wait(rx).await.and_then(|resp| ErrorMap::parse(&resp.packet.value)) {
            Ok(map) => {
                props.error_map.store(map);
            }
            Err(e) => debug!(address = %client.address(), error = %e, "Failed to fetch kv error map"),
        }
    }

    let mut server_mechanisms = Vec::new();
    if let Some(rx) = list_rx {
        match wait(rx).await {
            Ok(resp) => {
                server_mechanisms = parse_mechanisms(&resp.packet.value);
                debug!(address = %client.address(), mechanisms = ?server_mechanisms, "Server supported auth mechanisms");
            }
            Err(e) => debug!(address = %client.address(), error = %e, "Failed to fetch auth mechanisms"),
        }
    }

    if let Err(mut err) = auth_result {
        debug!(address = %client.address(), error = %err, "Failed to perform auth against server");
        if err.is(ErrorKind::RequestCanceled) {
            return Err(err);
        }
        if err.is(ErrorKind::AuthenticationFailure) {
            if props.auth_mechanisms.len() == 1 {
                return Err(err);
            }
            if first_mechanism.is_some_and(|m| server_mechanisms.contains(&m)) {
                return Err(err);
            }
            info!(address = %client.address(), "Unsupported authentication mechanism, trying the next supported one");
        }

        let Some(creds) = &props.credentials else {
            return Err(err);
        };
        loop {
            let Some((mechanism, rest)) = next_mechanism(&mechanisms, &server_mechanisms) else {
                debug!(address = %client.address(), "Failed to authenticate, all options exhausted");
                return Err(err);
            };
            mechanisms = rest;
            debug!(address = %client.address(), mechanism = mechanism.as_str(), "Retrying authentication");
            let attempt = start_auth(client, mechanism, creds, deadline).await?;
            let (result, select) = run_auth(client, attempt, bucket, deadline).await;
            match result {
                Ok(()) => {
                    select_rx = select;
                    break;
                }
                Err(e) => err = e,
            }
        }
    }

    if let Some(rx) = select_rx {
        wait(rx).await.map_err(|e| {
            if e.is(ErrorKind::DocumentNotFound) {
                CoreError::message(ErrorKind::BucketNotFound, bucket.unwrap_or_default().to_string())
            } else {
                e
            }
        })?;
    }

    if let Some(dcp) = &props.dcp {
        open_dcp(client, dcp, deadline).await?;
    }

    debug!(address = %client.address(), conn_id = %client.conn_id(), "Client bootstrapped");
    Ok(())
}

async fn open_dcp(client: &Arc<MemdClient>, dcp: &DcpBootstrap, deadline: Instant) -> CoreResult<()> {
    let mut extras = Vec::with_capacity(8);
    extras.extend_from_slice(&0u32.to_be_bytes());
    extras.extend_from_slice(&dcp.config.open_flags.to_be_bytes());
    let open = Packet::request(Opcode::DCP_OPEN_CONNECTION)
        .with_key(dcp.connection_name.clone())
        .with_extras(extras);
    let open_rx = exec(client, open, deadline).await?;

    let mut control_rxs = Vec::new();
    for (key, value) in dcp.controls() {
        let packet = Packet::request(Opcode::DCP_CONTROL).with_key(key).with_value(value.into_bytes());
        control_rxs.push((key, exec(client, packet, deadline).await?));
    }
    let end_on_close = Packet::request(Opcode::DCP_CONTROL)
        .with_key("send_stream_end_on_client_close_stream")
        .with_value(b"true".to_vec());
    let end_on_close_rx = exec(client, end_on_close, deadline).await?;

    wait(open_rx).await?;
    for (key, rx) in control_rxs {
        wait(rx).await.map_err(|e| CoreError::message(e.kind(), format!("DCP control {key} failed: {e}")))?;
    }
    if let Err(e) = wait(end_on_close_rx).await {
        debug!(address = %client.address(), error = %e, "Server does not send stream-end on close");
        client.set_stream_end_not_supported(true);
    }
    if dcp.config.buffer_size > 0 {
        client.enable_dcp_buffer_ack(dcp.config.buffer_size / 2);
    }
    Ok(())
}
