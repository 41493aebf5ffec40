//! Backend drivers the proxy delegates to.
//!
//! A backend implements some subset of the routable CSI calls. The router
//! asks [`Backend::supports`] before calling, so a missing capability turns
//! into `InvalidArgument` (or a documented default) instead of an
//! `Unimplemented` status that would make the orchestrator give up on the
//! whole plugin.

pub mod grpc;

use std::collections::HashMap;
use std::fmt::{self, Display};
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;

use tokio::sync::Mutex;
use tonic::Status;
use tonic::transport::Channel;
use tracing::debug;
use uuid::Uuid;

use crate::csi;
use crate::error::{ProxyError, Result};

/// CSI calls a backend may implement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    CreateVolume,
    DeleteVolume,
    ControllerGetVolume,
    ControllerExpandVolume,
    ValidateVolumeCapabilities,
    CreateSnapshot,
    DeleteSnapshot,
    ListSnapshots,
    GetCapacity,
    NodeStageVolume,
    NodeUnstageVolume,
    NodePublishVolume,
    NodeUnpublishVolume,
    NodeExpandVolume,
    NodeGetVolumeStats,
}

impl Method {
    pub const ALL: [Method; 15] = [
        Method::CreateVolume,
        Method::DeleteVolume,
        Method::ControllerGetVolume,
        Method::ControllerExpandVolume,
        Method::ValidateVolumeCapabilities,
        Method::CreateSnapshot,
        Method::DeleteSnapshot,
        Method::ListSnapshots,
        Method::GetCapacity,
        Method::NodeStageVolume,
        Method::NodeUnstageVolume,
        Method::NodePublishVolume,
        Method::NodeUnpublishVolume,
        Method::NodeExpandVolume,
        Method::NodeGetVolumeStats,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Method::CreateVolume => "CreateVolume",
            Method::DeleteVolume => "DeleteVolume",
            Method::ControllerGetVolume => "ControllerGetVolume",
            Method::ControllerExpandVolume => "ControllerExpandVolume",
            Method::ValidateVolumeCapabilities => "ValidateVolumeCapabilities",
            Method::CreateSnapshot => "CreateSnapshot",
            Method::DeleteSnapshot => "DeleteSnapshot",
            Method::ListSnapshots => "ListSnapshots",
            Method::GetCapacity => "GetCapacity",
            Method::NodeStageVolume => "NodeStageVolume",
            Method::NodeUnstageVolume => "NodeUnstageVolume",
            Method::NodePublishVolume => "NodePublishVolume",
            Method::NodeUnpublishVolume => "NodeUnpublishVolume",
            Method::NodeExpandVolume => "NodeExpandVolume",
            Method::NodeGetVolumeStats => "NodeGetVolumeStats",
        }
    }
}

impl Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = ProxyError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Method::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| ProxyError::UnknownMethod(s.to_string()))
    }
}

fn not_implemented(method: Method) -> Status {
    Status::unimplemented(format!("{method} is not implemented by this backend"))
}

/// A constructed backend driver instance.
///
/// Instances are stateless per call once built; all methods take `&self`.
#[tonic::async_trait]
pub trait Backend: Send + Sync {
    /// Kind tag, compared by value to detect a proxy nested in itself.
    fn kind(&self) -> &str;

    fn supports(&self, method: Method) -> bool;

    async fn create_volume(
        &self,
        _request: csi::CreateVolumeRequest,
    ) -> std::result::Result<csi::CreateVolumeResponse, Status> {
        Err(not_implemented(Method::CreateVolume))
    }

    async fn delete_volume(
        &self,
        _request: csi::DeleteVolumeRequest,
    ) -> std::result::Result<csi::DeleteVolumeResponse, Status> {
        Err(not_implemented(Method::DeleteVolume))
    }

    async fn controller_get_volume(
        &self,
        _request: csi::ControllerGetVolumeRequest,
    ) -> std::result::Result<csi::ControllerGetVolumeResponse, Status> {
        Err(not_implemented(Method::ControllerGetVolume))
    }

    async fn controller_expand_volume(
        &self,
        _request: csi::ControllerExpandVolumeRequest,
    ) -> std::result::Result<csi::ControllerExpandVolumeResponse, Status> {
        Err(not_implemented(Method::ControllerExpandVolume))
    }

    async fn validate_volume_capabilities(
        &self,
        _request: csi::ValidateVolumeCapabilitiesRequest,
    ) -> std::result::Result<csi::ValidateVolumeCapabilitiesResponse, Status> {
        Err(not_implemented(Method::ValidateVolumeCapabilities))
    }

    async fn create_snapshot(
        &self,
        _request: csi::CreateSnapshotRequest,
    ) -> std::result::Result<csi::CreateSnapshotResponse, Status> {
        Err(not_implemented(Method::CreateSnapshot))
    }

    async fn delete_snapshot(
        &self,
        _request: csi::DeleteSnapshotRequest,
    ) -> std::result::Result<csi::DeleteSnapshotResponse, Status> {
        Err(not_implemented(Method::DeleteSnapshot))
    }

    async fn list_snapshots(
        &self,
        _request: csi::ListSnapshotsRequest,
    ) -> std::result::Result<csi::ListSnapshotsResponse, Status> {
        Err(not_implemented(Method::ListSnapshots))
    }

    async fn get_capacity(
        &self,
        _request: csi::GetCapacityRequest,
    ) -> std::result::Result<csi::GetCapacityResponse, Status> {
        Err(not_implemented(Method::GetCapacity))
    }

    async fn node_stage_volume(
        &self,
        _request: csi::NodeStageVolumeRequest,
    ) -> std::result::Result<csi::NodeStageVolumeResponse, Status> {
        Err(not_implemented(Method::NodeStageVolume))
    }

    async fn node_unstage_volume(
        &self,
        _request: csi::NodeUnstageVolumeRequest,
    ) -> std::result::Result<csi::NodeUnstageVolumeResponse, Status> {
        Err(not_implemented(Method::NodeUnstageVolume))
    }

    async fn node_publish_volume(
        &self,
        _request: csi::NodePublishVolumeRequest,
    ) -> std::result::Result<csi::NodePublishVolumeResponse, Status> {
        Err(not_implemented(Method::NodePublishVolume))
    }

    async fn node_unpublish_volume(
        &self,
        _request: csi::NodeUnpublishVolumeRequest,
    ) -> std::result::Result<csi::NodeUnpublishVolumeResponse, Status> {
        Err(not_implemented(Method::NodeUnpublishVolume))
    }

    async fn node_expand_volume(
        &self,
        _request: csi::NodeExpandVolumeRequest,
    ) -> std::result::Result<csi::NodeExpandVolumeResponse, Status> {
        Err(not_implemented(Method::NodeExpandVolume))
    }

    async fn node_get_volume_stats(
        &self,
        _request: csi::NodeGetVolumeStatsRequest,
    ) -> std::result::Result<csi::NodeGetVolumeStatsResponse, Status> {
        Err(not_implemented(Method::NodeGetVolumeStats))
    }
}

/// Call `method` on `backend` if it supports it.
///
/// An unsupported method yields `default` when one is given, otherwise
/// [`ProxyError::Unsupported`]. Backend failures pass through unchanged.
pub async fn invoke<T, F, Fut>(
    backend: Arc<dyn Backend>,
    method: Method,
    default: Option<T>,
    call: F,
) -> Result<T>
where
    F: FnOnce(Arc<dyn Backend>) -> Fut,
    Fut: Future<Output = std::result::Result<T, Status>>,
{
    if !backend.supports(method) {
        return match default {
            Some(value) => {
                debug!(kind = %backend.kind(), method = %method, "Method unsupported, using default");
                Ok(value)
            }
            None => Err(ProxyError::Unsupported(method)),
        };
    }

    call(backend).await.map_err(ProxyError::Backend)
}

/// Execution context handed to each backend at construction.
///
/// Every factory build gets a fresh context, so backends of the same kind
/// serving different connections never share pooled channels.
#[derive(Debug, Clone)]
pub struct BackendContext {
    id: Uuid,
    channels: Arc<Mutex<HashMap<String, Channel>>>,
}

impl BackendContext {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            channels: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Pooled channel for `endpoint`, created with `connect` on first use.
    pub async fn channel<F, Fut>(&self, endpoint: &str, connect: F) -> Result<Channel>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Channel>>,
    {
        let mut channels = self.channels.lock().await;
        if let Some(channel) = channels.get(endpoint) {
            return Ok(channel.clone());
        }

        debug!(context = %self.id, endpoint = %endpoint, "Creating pooled channel");
        let channel = connect().await?;
        channels.insert(endpoint.to_string(), channel.clone());
        Ok(channel)
    }

    pub async fn pooled_channels(&self) -> usize {
        self.channels.lock().await.len()
    }
}

impl Default for BackendContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CapacityOnly;

    #[tonic::async_trait]
    impl Backend for CapacityOnly {
        fn kind(&self) -> &str {
            "capacity-only"
        }

        fn supports(&self, method: Method) -> bool {
            method == Method::GetCapacity
        }

        async fn get_capacity(
            &self,
            _request: csi::GetCapacityRequest,
        ) -> std::result::Result<csi::GetCapacityResponse, Status> {
            Ok(csi::GetCapacityResponse {
                available_capacity: 42,
                ..Default::default()
            })
        }
    }

    #[test]
    fn test_method_names_round_trip() {
        for method in Method::ALL {
            assert_eq!(method.as_str().parse::<Method>().unwrap(), method);
        }
        assert!("ListVolumes".parse::<Method>().is_err());
    }

    #[tokio::test]
    async fn test_invoke_supported() {
        let backend: Arc<dyn Backend> = Arc::new(CapacityOnly);
        let response = invoke(backend, Method::GetCapacity, None, |b| async move {
            b.get_capacity(csi::GetCapacityRequest::default()).await
        })
        .await
        .unwrap();
        assert_eq!(response.available_capacity, 42);
    }

    #[tokio::test]
    async fn test_invoke_unsupported_without_default() {
        let backend: Arc<dyn Backend> = Arc::new(CapacityOnly);
        let err = invoke(backend, Method::DeleteVolume, None, |b| async move {
            b.delete_volume(csi::DeleteVolumeRequest::default()).await
        })
        .await
        .unwrap_err();
        assert!(matches!(err, ProxyError::Unsupported(Method::DeleteVolume)));
        assert_eq!(err.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn test_invoke_unsupported_with_default() {
        let backend: Arc<dyn Backend> = Arc::new(CapacityOnly);
        let fallback = csi::DeleteVolumeResponse {};
        let response = invoke(backend, Method::DeleteVolume, Some(fallback), |b| async move {
            b.delete_volume(csi::DeleteVolumeRequest::default()).await
        })
        .await;
        assert!(response.is_ok());
    }

    #[tokio::test]
    async fn test_contexts_are_independent() {
        let a = BackendContext::new();
        let b = BackendContext::new();
        assert_ne!(a.id(), b.id());

        let endpoint = "http://127.0.0.1:1";
        a.channel(endpoint, || async {
            Ok(tonic::transport::Endpoint::from_static("http://127.0.0.1:1").connect_lazy())
        })
        .await
        .unwrap();

        assert_eq!(a.pooled_channels().await, 1);
        assert_eq!(b.pooled_channels().await, 0);
        assert_eq!(a.clone().pooled_channels().await, 1);
    }
}
