//! Cluster topology: config parsing, routing structures and the config manager.

pub mod cfg_json;
pub mod config_manager;
pub mod ketama;
pub mod route_config;
pub mod vbucket;

pub use cfg_json::ClusterConfigJson;
pub use config_manager::{ConfigManager, RouteConfigWatcher};
pub use route_config::{BucketType, RouteConfig};
