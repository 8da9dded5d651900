//! cbcore - cluster client core
//!
//! Topology tracking, binary-protocol routing and pooling, config polling,
//! retries and circuit breaking, plus the HTTP query services. Start from
//! [`Agent`] (or [`DcpAgent`] for change streams).

pub mod agent;
pub mod auth;
pub mod circuit_breaker;
pub mod collections;
pub mod dcp_agent;
pub mod error_map;
pub mod http;
pub mod kv;
pub mod ops;
pub mod poller;
pub mod retry;
pub mod routing;
pub mod zombie_logger;

pub use agent::{Agent, PingOptions};
pub use cbcore_config::AgentConfig;
pub use cbcore_errors::{CoreError, CoreResult, ErrorKind, RetryReason, ServiceType};
pub use dcp_agent::DcpAgent;
pub use ops::{KvOps, OpOptions};
pub use retry::{BestEffortRetryStrategy, ExponentialBackoff, FailFastRetryStrategy, RetryStrategy};
