//! Binary protocol plumbing: requests, queues, connections, pipelines and
//! the mux that routes between them.

pub mod bootstrap;
pub mod client;
pub mod dialer;
pub mod mux;
pub mod op_map;
pub mod pipeline;
pub mod pipeline_client;
pub mod queue;
pub mod request;
pub mod transport;

pub use client::{MemdClient, MemdClientProps};
pub use mux::{CapabilityStatus, KvMux, KvMuxProps, MuxState};
pub use request::{Request, Response, StreamSink};
