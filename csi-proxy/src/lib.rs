//! Multiplexing CSI proxy
//!
//! Serves one CSI plugin endpoint in front of many independently configured
//! storage backends ("connections"). Volume and snapshot handles carry the
//! connection name, so every call after CreateVolume routes itself.
//!
//! This library provides:
//! - Identity, Controller and Node services that route to backends
//! - The handle codec and the node id serializer
//! - The connection cache and the backend factory guard
//! - A forwarding backend for upstream CSI plugins reachable over gRPC

/// CSI proto generated types
pub mod csi {
    tonic::include_proto!("csi.v1");
}

pub mod backend;
pub mod cache;
pub mod config;
pub mod controller;
pub mod error;
pub mod factory;
pub mod handle;
pub mod identity;
pub mod metrics;
pub mod node;
pub mod node_id;
pub mod types;

pub use cache::{CachePolicy, ConnectionCache, KindCache};
pub use config::DriverOptions;
pub use controller::ControllerService;
pub use error::{ProxyError, Result};
pub use factory::DriverFactory;
pub use identity::IdentityService;
pub use node::NodeService;
