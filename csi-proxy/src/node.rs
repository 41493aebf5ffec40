//! CSI Node Service Implementation
//!
//! Node calls carry no connection parameter. Stage and publish find the
//! backend kind in the volume context (`provisioner_driver`, set at
//! creation) and use a node-local backend of that kind. The remaining
//! volume calls only have the volume handle. They resolve its connection to
//! learn the kind, then use the same node-local backend, so every node call
//! for a volume reaches one instance.

use std::collections::HashMap;
use std::sync::Arc;

use tonic::{Request, Response, Status};
use tracing::{debug, info};

use crate::backend::{Backend, Method, invoke};
use crate::cache::{ConnectionCache, KindCache};
use crate::config::{NodeTopologyConfig, ProxySettings};
use crate::controller::{PROVISIONER_DRIVER_KEY, respond};
use crate::csi;
use crate::error::{ProxyError, Result};
use crate::handle::Handle;
use crate::metrics::OperationTimer;
use crate::node_id::{self, NodeIdConfig, NodeIdentity};
use crate::types::TopologyMode;

/// Segment value shared by every node in cluster topology mode.
pub const CLUSTER_TOPOLOGY_VALUE: &str = "local";

/// CSI Node Service
pub struct NodeService {
    drivers: KindCache,
    connections: ConnectionCache,
    node_id: NodeIdConfig,
    topology: NodeTopologyConfig,
    /// Fixed facets instead of reading them from the machine.
    identity: Option<NodeIdentity>,
}

impl NodeService {
    pub fn new(drivers: KindCache, connections: ConnectionCache, settings: &ProxySettings) -> Self {
        Self {
            drivers,
            connections,
            node_id: settings.node_id.clone(),
            topology: settings.node_topology.clone(),
            identity: None,
        }
    }

    /// Report `identity` from NodeGetInfo instead of detecting it.
    pub fn with_identity(mut self, identity: NodeIdentity) -> Self {
        self.identity = Some(identity);
        self
    }

    fn local_identity(&self) -> Result<NodeIdentity> {
        match &self.identity {
            Some(identity) => Ok(identity.clone()),
            None => NodeIdentity::detect(&self.node_id.parts),
        }
    }

    /// Node id and topology for this node.
    pub fn node_info(&self) -> Result<csi::NodeGetInfoResponse> {
        let mode: TopologyMode = self.topology.mode.parse()?;
        let identity = self.local_identity()?;
        let node_id = identity.encode(&self.node_id)?;

        let value = match mode {
            TopologyMode::Cluster => CLUSTER_TOPOLOGY_VALUE.to_string(),
            TopologyMode::Node => match identity.node_name {
                Some(name) => name,
                None => node_id::local_node_name()?,
            },
        };

        Ok(csi::NodeGetInfoResponse {
            node_id,
            max_volumes_per_node: 0,
            accessible_topology: Some(csi::Topology {
                segments: HashMap::from([(mode.key(&self.topology.prefix), value)]),
            }),
        })
    }

    /// Node-local backend of the kind `connection` is configured with.
    async fn node_backend(&self, connection: &str) -> Result<Arc<dyn Backend>> {
        let kind = self.connections.resolve(connection).await?.kind().to_string();
        debug!(connection = %connection, driver = %kind, "Resolved node driver kind");
        self.drivers.get(&kind)
    }

    async fn route_stage_volume(
        &self,
        mut req: csi::NodeStageVolumeRequest,
    ) -> Result<csi::NodeStageVolumeResponse> {
        let kind = provisioner_driver(&req.volume_context)?;
        let target = Handle::decode_volume(&req.volume_id)?;
        info!(
            volume_id = %req.volume_id,
            driver = %kind,
            staging_target_path = %req.staging_target_path,
            "NodeStageVolume request"
        );
        req.volume_id = target.native_id;

        let backend = self.drivers.get(&kind)?;
        invoke(backend, Method::NodeStageVolume, None, |b| async move {
            b.node_stage_volume(req).await
        })
        .await
    }

    async fn route_publish_volume(
        &self,
        mut req: csi::NodePublishVolumeRequest,
    ) -> Result<csi::NodePublishVolumeResponse> {
        let kind = provisioner_driver(&req.volume_context)?;
        let target = Handle::decode_volume(&req.volume_id)?;
        info!(
            volume_id = %req.volume_id,
            driver = %kind,
            target_path = %req.target_path,
            readonly = req.readonly,
            "NodePublishVolume request"
        );
        req.volume_id = target.native_id;

        let backend = self.drivers.get(&kind)?;
        invoke(backend, Method::NodePublishVolume, None, |b| async move {
            b.node_publish_volume(req).await
        })
        .await
    }

    async fn route_unstage_volume(
        &self,
        mut req: csi::NodeUnstageVolumeRequest,
    ) -> Result<csi::NodeUnstageVolumeResponse> {
        let target = Handle::decode_volume(&req.volume_id)?;
        info!(
            volume_id = %req.volume_id,
            connection = %target.connection,
            staging_target_path = %req.staging_target_path,
            "NodeUnstageVolume request"
        );
        req.volume_id = target.native_id;

        let backend = self.node_backend(&target.connection).await?;
        invoke(backend, Method::NodeUnstageVolume, None, |b| async move {
            b.node_unstage_volume(req).await
        })
        .await
    }

    async fn route_unpublish_volume(
        &self,
        mut req: csi::NodeUnpublishVolumeRequest,
    ) -> Result<csi::NodeUnpublishVolumeResponse> {
        let target = Handle::decode_volume(&req.volume_id)?;
        info!(
            volume_id = %req.volume_id,
            connection = %target.connection,
            target_path = %req.target_path,
            "NodeUnpublishVolume request"
        );
        req.volume_id = target.native_id;

        let backend = self.node_backend(&target.connection).await?;
        invoke(backend, Method::NodeUnpublishVolume, None, |b| async move {
            b.node_unpublish_volume(req).await
        })
        .await
    }

    async fn route_expand_volume(
        &self,
        mut req: csi::NodeExpandVolumeRequest,
    ) -> Result<csi::NodeExpandVolumeResponse> {
        let target = Handle::decode_volume(&req.volume_id)?;
        info!(
            volume_id = %req.volume_id,
            connection = %target.connection,
            volume_path = %req.volume_path,
            "NodeExpandVolume request"
        );
        req.volume_id = target.native_id;

        let backend = self.node_backend(&target.connection).await?;
        invoke(backend, Method::NodeExpandVolume, None, |b| async move {
            b.node_expand_volume(req).await
        })
        .await
    }

    async fn route_volume_stats(
        &self,
        mut req: csi::NodeGetVolumeStatsRequest,
    ) -> Result<csi::NodeGetVolumeStatsResponse> {
        let target = Handle::decode_volume(&req.volume_id)?;
        debug!(volume_id = %req.volume_id, connection = %target.connection, "NodeGetVolumeStats request");
        req.volume_id = target.native_id;

        let backend = self.node_backend(&target.connection).await?;
        invoke(backend, Method::NodeGetVolumeStats, None, |b| async move {
            b.node_get_volume_stats(req).await
        })
        .await
    }
}

fn provisioner_driver(volume_context: &HashMap<String, String>) -> Result<String> {
    volume_context
        .get(PROVISIONER_DRIVER_KEY)
        .filter(|kind| !kind.is_empty())
        .cloned()
        .ok_or(ProxyError::MissingParameter(PROVISIONER_DRIVER_KEY))
}

fn rpc_capability(capability: csi::node_service_capability::rpc::Type) -> csi::NodeServiceCapability {
    csi::NodeServiceCapability {
        r#type: Some(csi::node_service_capability::Type::Rpc(
            csi::node_service_capability::Rpc {
                r#type: capability as i32,
            },
        )),
    }
}

#[tonic::async_trait]
impl csi::node_server::Node for NodeService {
    async fn node_stage_volume(
        &self,
        request: Request<csi::NodeStageVolumeRequest>,
    ) -> std::result::Result<Response<csi::NodeStageVolumeResponse>, Status> {
        let timer = OperationTimer::new("node_stage_volume");
        respond(timer, self.route_stage_volume(request.into_inner()).await)
    }

    async fn node_unstage_volume(
        &self,
        request: Request<csi::NodeUnstageVolumeRequest>,
    ) -> std::result::Result<Response<csi::NodeUnstageVolumeResponse>, Status> {
        let timer = OperationTimer::new("node_unstage_volume");
        respond(timer, self.route_unstage_volume(request.into_inner()).await)
    }

    async fn node_publish_volume(
        &self,
        request: Request<csi::NodePublishVolumeRequest>,
    ) -> std::result::Result<Response<csi::NodePublishVolumeResponse>, Status> {
        let timer = OperationTimer::new("node_publish_volume");
        respond(timer, self.route_publish_volume(request.into_inner()).await)
    }

    async fn node_unpublish_volume(
        &self,
        request: Request<csi::NodeUnpublishVolumeRequest>,
    ) -> std::result::Result<Response<csi::NodeUnpublishVolumeResponse>, Status> {
        let timer = OperationTimer::new("node_unpublish_volume");
        respond(timer, self.route_unpublish_volume(request.into_inner()).await)
    }

    async fn node_get_volume_stats(
        &self,
        request: Request<csi::NodeGetVolumeStatsRequest>,
    ) -> std::result::Result<Response<csi::NodeGetVolumeStatsResponse>, Status> {
        let timer = OperationTimer::new("node_get_volume_stats");
        respond(timer, self.route_volume_stats(request.into_inner()).await)
    }

    async fn node_expand_volume(
        &self,
        request: Request<csi::NodeExpandVolumeRequest>,
    ) -> std::result::Result<Response<csi::NodeExpandVolumeResponse>, Status> {
        let timer = OperationTimer::new("node_expand_volume");
        respond(timer, self.route_expand_volume(request.into_inner()).await)
    }

    /// Report node capabilities.
    async fn node_get_capabilities(
        &self,
        _request: Request<csi::NodeGetCapabilitiesRequest>,
    ) -> std::result::Result<Response<csi::NodeGetCapabilitiesResponse>, Status> {
        use csi::node_service_capability::rpc::Type;

        let capabilities = [
            Type::StageUnstageVolume,
            Type::GetVolumeStats,
            Type::ExpandVolume,
            Type::SingleNodeMultiWriter,
        ]
        .into_iter()
        .map(rpc_capability)
        .collect();

        Ok(Response::new(csi::NodeGetCapabilitiesResponse {
            capabilities,
        }))
    }

    async fn node_get_info(
        &self,
        _request: Request<csi::NodeGetInfoRequest>,
    ) -> std::result::Result<Response<csi::NodeGetInfoResponse>, Status> {
        let timer = OperationTimer::new("node_get_info");
        let result = self.node_info();
        if let Ok(info) = &result {
            info!(node_id = %info.node_id, "NodeGetInfo request");
        }
        respond(timer, result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DriverOptions;
    use crate::factory::DriverFactory;
    use crate::node_id::{NodeIdParts, PrefixEntry};

    fn service(settings: ProxySettings) -> NodeService {
        let base = DriverOptions {
            proxy: settings.clone(),
            ..Default::default()
        };
        let drivers = KindCache::new(base.clone(), DriverFactory::new());
        let connections = ConnectionCache::from_options(base, DriverFactory::new());
        NodeService::new(drivers, connections, &settings)
    }

    fn node1() -> NodeIdentity {
        NodeIdentity {
            node_name: Some("node1".to_string()),
            iqn: Some("iqn.1993-08.org.debian:01:abcd".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_node_topology() {
        let mut settings = ProxySettings::default();
        settings.node_topology.mode = "node".to_string();

        let info = service(settings).with_identity(node1()).node_info().unwrap();
        assert_eq!(info.node_id, "n=node1");

        let segments = info.accessible_topology.unwrap().segments;
        assert_eq!(segments.len(), 1);
        assert_eq!(segments["org.democratic-csi.topology/node"], "node1");
    }

    #[test]
    fn test_cluster_topology_with_custom_prefix() {
        let mut settings = ProxySettings::default();
        settings.node_topology.prefix = "example.com/zone".to_string();

        let info = service(settings).with_identity(node1()).node_info().unwrap();
        let segments = info.accessible_topology.unwrap().segments;
        assert_eq!(segments["example.com/zone/cluster"], CLUSTER_TOPOLOGY_VALUE);
    }

    #[test]
    fn test_node_id_with_iqn() {
        let mut settings = ProxySettings::default();
        settings.node_id.parts = NodeIdParts {
            node_name: true,
            iqn: true,
            ..Default::default()
        };
        settings.node_id.iqn_prefix = vec![PrefixEntry::new("d", "iqn.1993-08.org.debian:01:")];

        let info = service(settings).with_identity(node1()).node_info().unwrap();
        assert_eq!(info.node_id, "n=node1/id=abcd");
    }

    #[test]
    fn test_unknown_topology_mode() {
        let mut settings = ProxySettings::default();
        settings.node_topology.mode = "zone".to_string();

        let err = service(settings).with_identity(node1()).node_info().unwrap_err();
        assert!(matches!(err, ProxyError::UnknownTopology(_)));
        assert_eq!(err.code(), tonic::Code::InvalidArgument);
    }

    #[test]
    fn test_provisioner_driver() {
        let ctx = HashMap::from([(PROVISIONER_DRIVER_KEY.to_string(), "grpc".to_string())]);
        assert_eq!(provisioner_driver(&ctx).unwrap(), "grpc");
        assert!(matches!(
            provisioner_driver(&HashMap::new()),
            Err(ProxyError::MissingParameter(PROVISIONER_DRIVER_KEY))
        ));
    }
}
