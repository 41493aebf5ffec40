//! Forwarding backend
//!
//! Delegates every call to an upstream CSI plugin reachable over gRPC. The
//! upstream channel lives in the backend's own [`BackendContext`] and is
//! created lazily on the first call.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use tonic::Status;
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Endpoint, Identity};
use tracing::debug;

use super::{Backend, BackendContext, Method};
use crate::config::DriverOptions;
use crate::csi;
use crate::csi::controller_client::ControllerClient;
use crate::csi::node_client::NodeClient;
use crate::error::{ProxyError, Result};

/// Kind tag and options section name.
pub const KIND: &str = "grpc";

/// TLS material for the upstream connection (PEM files).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TlsConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub ca_path: PathBuf,
    pub domain: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GrpcOptions {
    endpoint: Option<String>,
    #[serde(default)]
    tls: Option<TlsConfig>,
    /// Methods the upstream implements; all when absent.
    #[serde(default)]
    methods: Option<Vec<String>>,
}

/// Backend forwarding to an upstream CSI plugin.
#[derive(Debug)]
pub struct GrpcBackend {
    endpoint: String,
    tls: Option<TlsConfig>,
    methods: Option<HashSet<Method>>,
    context: BackendContext,
}

impl GrpcBackend {
    /// Build from the `grpc` section of the merged options.
    pub fn from_options(options: &DriverOptions, context: BackendContext) -> Result<Self> {
        let grpc: GrpcOptions = options
            .section(KIND)?
            .ok_or(ProxyError::MissingParameter("grpc.endpoint"))?;

        let endpoint = grpc
            .endpoint
            .filter(|e| !e.is_empty())
            .ok_or(ProxyError::MissingParameter("grpc.endpoint"))?;
        // reject malformed URIs at build time rather than on first call
        Endpoint::from_shared(endpoint.clone())?;

        let methods = grpc
            .methods
            .map(|names| {
                names
                    .iter()
                    .map(|n| n.parse::<Method>())
                    .collect::<Result<HashSet<_>>>()
            })
            .transpose()?;

        Ok(Self {
            endpoint,
            tls: grpc.tls,
            methods,
            context,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn context(&self) -> &BackendContext {
        &self.context
    }

    async fn channel(&self) -> std::result::Result<Channel, Status> {
        self.context
            .channel(&self.endpoint, || connect(&self.endpoint, self.tls.as_ref()))
            .await
            .map_err(Status::from)
    }

    async fn controller(&self) -> std::result::Result<ControllerClient<Channel>, Status> {
        Ok(ControllerClient::new(self.channel().await?))
    }

    async fn node(&self) -> std::result::Result<NodeClient<Channel>, Status> {
        Ok(NodeClient::new(self.channel().await?))
    }
}

/// Lazily connecting channel with keepalive settings.
///
/// No request timeout is set: deadlines come from the inbound RPC.
async fn connect(endpoint: &str, tls: Option<&TlsConfig>) -> Result<Channel> {
    let mut builder = Endpoint::from_shared(endpoint.to_string())?
        .tcp_keepalive(Some(Duration::from_secs(60)))
        .tcp_nodelay(true)
        .http2_keep_alive_interval(Duration::from_secs(30))
        .keep_alive_timeout(Duration::from_secs(10))
        .keep_alive_while_idle(true);

    if let Some(tls) = tls {
        let cert = tokio::fs::read(&tls.cert_path).await?;
        let key = tokio::fs::read(&tls.key_path).await?;
        let ca = tokio::fs::read(&tls.ca_path).await?;

        let tls_config = ClientTlsConfig::new()
            .identity(Identity::from_pem(cert, key))
            .ca_certificate(Certificate::from_pem(ca))
            .domain_name(&tls.domain);

        builder = builder.tls_config(tls_config)?;
    }

    debug!(endpoint = %endpoint, tls = tls.is_some(), "Connecting to upstream CSI plugin");
    Ok(builder.connect_lazy())
}

#[tonic::async_trait]
impl Backend for GrpcBackend {
    fn kind(&self) -> &str {
        KIND
    }

    fn supports(&self, method: Method) -> bool {
        self.methods
            .as_ref()
            .is_none_or(|methods| methods.contains(&method))
    }

    async fn create_volume(
        &self,
        request: csi::CreateVolumeRequest,
    ) -> std::result::Result<csi::CreateVolumeResponse, Status> {
        let mut client = self.controller().await?;
        Ok(client.create_volume(request).await?.into_inner())
    }

    async fn delete_volume(
        &self,
        request: csi::DeleteVolumeRequest,
    ) -> std::result::Result<csi::DeleteVolumeResponse, Status> {
        let mut client = self.controller().await?;
        Ok(client.delete_volume(request).await?.into_inner())
    }

    async fn controller_get_volume(
        &self,
        request: csi::ControllerGetVolumeRequest,
    ) -> std::result::Result<csi::ControllerGetVolumeResponse, Status> {
        let mut client = self.controller().await?;
        Ok(client.controller_get_volume(request).await?.into_inner())
    }

    async fn controller_expand_volume(
        &self,
        request: csi::ControllerExpandVolumeRequest,
    ) -> std::result::Result<csi::ControllerExpandVolumeResponse, Status> {
        let mut client = self.controller().await?;
        Ok(client.controller_expand_volume(request).await?.into_inner())
    }

    async fn validate_volume_capabilities(
        &self,
        request: csi::ValidateVolumeCapabilitiesRequest,
    ) -> std::result::Result<csi::ValidateVolumeCapabilitiesResponse, Status> {
        let mut client = self.controller().await?;
        Ok(client
            .validate_volume_capabilities(request)
            .await?
            .into_inner())
    }

    async fn create_snapshot(
        &self,
        request: csi::CreateSnapshotRequest,
    ) -> std::result::Result<csi::CreateSnapshotResponse, Status> {
        let mut client = self.controller().await?;
        Ok(client.create_snapshot(request).await?.into_inner())
    }

    async fn delete_snapshot(
        &self,
        request: csi::DeleteSnapshotRequest,
    ) -> std::result::Result<csi::DeleteSnapshotResponse, Status> {
        let mut client = self.controller().await?;
        Ok(client.delete_snapshot(request).await?.into_inner())
    }

    async fn list_snapshots(
        &self,
        request: csi::ListSnapshotsRequest,
    ) -> std::result::Result<csi::ListSnapshotsResponse, Status> {
        let mut client = self.controller().await?;
        Ok(client.list_snapshots(request).await?.into_inner())
    }

    async fn get_capacity(
        &self,
        request: csi::GetCapacityRequest,
    ) -> std::result::Result<csi::GetCapacityResponse, Status> {
        let mut client = self.controller().await?;
        Ok(client.get_capacity(request).await?.into_inner())
    }

    async fn node_stage_volume(
        &self,
        request: csi::NodeStageVolumeRequest,
    ) -> std::result::Result<csi::NodeStageVolumeResponse, Status> {
        let mut client = self.node().await?;
        Ok(client.node_stage_volume(request).await?.into_inner())
    }

    async fn node_unstage_volume(
        &self,
        request: csi::NodeUnstageVolumeRequest,
    ) -> std::result::Result<csi::NodeUnstageVolumeResponse, Status> {
        let mut client = self.node().await?;
        Ok(client.node_unstage_volume(request).await?.into_inner())
    }

    async fn node_publish_volume(
        &self,
        request: csi::NodePublishVolumeRequest,
    ) -> std::result::Result<csi::NodePublishVolumeResponse, Status> {
        let mut client = self.node().await?;
        Ok(client.node_publish_volume(request).await?.into_inner())
    }

    async fn node_unpublish_volume(
        &self,
        request: csi::NodeUnpublishVolumeRequest,
    ) -> std::result::Result<csi::NodeUnpublishVolumeResponse, Status> {
        let mut client = self.node().await?;
        Ok(client.node_unpublish_volume(request).await?.into_inner())
    }

    async fn node_expand_volume(
        &self,
        request: csi::NodeExpandVolumeRequest,
    ) -> std::result::Result<csi::NodeExpandVolumeResponse, Status> {
        let mut client = self.node().await?;
        Ok(client.node_expand_volume(request).await?.into_inner())
    }

    async fn node_get_volume_stats(
        &self,
        request: csi::NodeGetVolumeStatsRequest,
    ) -> std::result::Result<csi::NodeGetVolumeStatsResponse, Status> {
        let mut client = self.node().await?;
        Ok(client.node_get_volume_stats(request).await?.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(yaml: &str) -> DriverOptions {
        DriverOptions::from_yaml(yaml).unwrap()
    }

    #[test]
    fn test_from_options() {
        let opts = options(
            r#"
driver: grpc
grpc:
  endpoint: http://10.0.0.5:50051
"#,
        );
        let backend = GrpcBackend::from_options(&opts, BackendContext::new()).unwrap();
        assert_eq!(backend.endpoint(), "http://10.0.0.5:50051");
        assert_eq!(backend.kind(), KIND);
        for method in Method::ALL {
            assert!(backend.supports(method));
        }
    }

    #[test]
    fn test_method_restriction() {
        let opts = options(
            r#"
driver: grpc
grpc:
  endpoint: http://10.0.0.5:50051
  methods: [CreateVolume, DeleteVolume]
"#,
        );
        let backend = GrpcBackend::from_options(&opts, BackendContext::new()).unwrap();
        assert!(backend.supports(Method::CreateVolume));
        assert!(backend.supports(Method::DeleteVolume));
        assert!(!backend.supports(Method::GetCapacity));
    }

    #[test]
    fn test_unknown_method_rejected() {
        let opts = options(
            r#"
driver: grpc
grpc:
  endpoint: http://10.0.0.5:50051
  methods: [ListVolumes]
"#,
        );
        let err = GrpcBackend::from_options(&opts, BackendContext::new()).unwrap_err();
        assert!(matches!(err, ProxyError::UnknownMethod(_)));
    }

    #[test]
    fn test_missing_endpoint() {
        let err = GrpcBackend::from_options(&options("driver: grpc\n"), BackendContext::new())
            .unwrap_err();
        assert!(matches!(err, ProxyError::MissingParameter("grpc.endpoint")));

        let err = GrpcBackend::from_options(
            &options("driver: grpc\ngrpc:\n  methods: []\n"),
            BackendContext::new(),
        )
        .unwrap_err();
        assert!(matches!(err, ProxyError::MissingParameter("grpc.endpoint")));
    }

    #[tokio::test]
    async fn test_channel_is_pooled_in_own_context() {
        let opts = options(
            r#"
driver: grpc
grpc:
  endpoint: http://127.0.0.1:1
"#,
        );
        let a = GrpcBackend::from_options(&opts, BackendContext::new()).unwrap();
        let b = GrpcBackend::from_options(&opts, BackendContext::new()).unwrap();

        a.channel().await.unwrap();
        a.channel().await.unwrap();

        assert_eq!(a.context().pooled_channels().await, 1);
        assert_eq!(b.context().pooled_channels().await, 0);
    }
}
