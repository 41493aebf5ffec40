//! Type-safe wrappers for proxy configuration values.
//!
//! Values arrive as strings from the proxy's YAML options and are parsed
//! with `FromStr` where they are used, so a bad value fails the RPC that
//! needs it rather than process startup.

use std::fmt::{self, Display};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::ProxyError;

/// Topology key prefix used when the configuration does not set one.
pub const DEFAULT_TOPOLOGY_PREFIX: &str = "org.democratic-csi.topology";

// ============================================================================
// TopologyMode
// ============================================================================

/// Shape of the topology segment reported by NodeGetInfo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TopologyMode {
    /// Every node shares one segment: `<prefix>/cluster = local`
    #[default]
    Cluster,
    /// Each node is its own segment: `<prefix>/node = <node name>`
    Node,
}

impl TopologyMode {
    /// Segment key for this mode under `prefix`.
    pub fn key(self, prefix: &str) -> String {
        format!("{prefix}/{self}")
    }
}

impl Display for TopologyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TopologyMode::Cluster => write!(f, "cluster"),
            TopologyMode::Node => write!(f, "node"),
        }
    }
}

impl FromStr for TopologyMode {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cluster" => Ok(TopologyMode::Cluster),
            "node" => Ok(TopologyMode::Node),
            _ => Err(ProxyError::UnknownTopology(s.to_string())),
        }
    }
}

// ============================================================================
// ListenAddr
// ============================================================================

/// Where the CSI endpoint listens: `unix:///path/to/csi.sock` or
/// `tcp://host:port`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenAddr {
    Unix(PathBuf),
    Tcp(SocketAddr),
}

impl Display for ListenAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenAddr::Unix(path) => write!(f, "unix://{}", path.display()),
            ListenAddr::Tcp(addr) => write!(f, "tcp://{addr}"),
        }
    }
}

impl FromStr for ListenAddr {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ProxyError::InvalidEndpoint(s.to_string());

        if let Some(path) = s.strip_prefix("unix://") {
            if !path.starts_with('/') {
                return Err(invalid());
            }
            return Ok(ListenAddr::Unix(PathBuf::from(path)));
        }
        if let Some(addr) = s.strip_prefix("tcp://") {
            return addr.parse().map(ListenAddr::Tcp).map_err(|_| invalid());
        }
        Err(invalid())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topology_mode_from_str() {
        assert_eq!(
            "cluster".parse::<TopologyMode>().unwrap(),
            TopologyMode::Cluster
        );
        assert_eq!("node".parse::<TopologyMode>().unwrap(), TopologyMode::Node);
        assert!("zone".parse::<TopologyMode>().is_err());
        assert!("".parse::<TopologyMode>().is_err());
    }

    #[test]
    fn test_topology_mode_key() {
        assert_eq!(
            TopologyMode::Node.key(DEFAULT_TOPOLOGY_PREFIX),
            "org.democratic-csi.topology/node"
        );
        assert_eq!(
            TopologyMode::Cluster.key("example.com/topo"),
            "example.com/topo/cluster"
        );
    }

    #[test]
    fn test_unknown_topology_is_invalid_argument() {
        let err = "rack".parse::<TopologyMode>().unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);
    }

    #[test]
    fn test_listen_addr_from_str() {
        assert_eq!(
            "unix:///csi/csi.sock".parse::<ListenAddr>().unwrap(),
            ListenAddr::Unix(PathBuf::from("/csi/csi.sock"))
        );
        assert_eq!(
            "tcp://127.0.0.1:10000".parse::<ListenAddr>().unwrap(),
            ListenAddr::Tcp("127.0.0.1:10000".parse().unwrap())
        );
        assert!("unix://relative.sock".parse::<ListenAddr>().is_err());
        assert!("tcp://nohost".parse::<ListenAddr>().is_err());
        assert!("/csi/csi.sock".parse::<ListenAddr>().is_err());
    }

    #[test]
    fn test_listen_addr_display() {
        let addr: ListenAddr = "unix:///csi/csi.sock".parse().unwrap();
        assert_eq!(addr.to_string(), "unix:///csi/csi.sock");
    }
}
