//! CSI Controller Service Implementation
//!
//! Routes every controller call to the backend of one connection. New
//! volumes pick their connection from the `connection` storage class
//! parameter; everything else carries it inside the volume or snapshot
//! handle. Native ids are unwrapped before delegating and newly minted ids
//! are wrapped again on the way back.

use std::collections::HashMap;

use tonic::{Request, Response, Status};
use tracing::{debug, error, info, warn};

use crate::backend::{Method, invoke};
use crate::cache::ConnectionCache;
use crate::csi;
use crate::csi::volume_content_source::Type as ContentSource;
use crate::error::{ProxyError, Result};
use crate::handle::{self, Handle, SNAPSHOT_PREFIX, VOLUME_PREFIX};
use crate::metrics::OperationTimer;

/// Storage class parameter naming the target connection.
pub const CONNECTION_PARAM: &str = "connection";

/// Volume context key carrying the backend kind to the node side.
pub const PROVISIONER_DRIVER_KEY: &str = "provisioner_driver";

/// Reported when the backend has no capacity reporting of its own.
const UNBOUNDED_CAPACITY: i64 = i64::MAX;

/// CSI Controller Service
pub struct ControllerService {
    connections: ConnectionCache,
}

impl ControllerService {
    pub fn new(connections: ConnectionCache) -> Self {
        Self { connections }
    }

    pub fn connections(&self) -> &ConnectionCache {
        &self.connections
    }

    async fn route_create_volume(
        &self,
        mut req: csi::CreateVolumeRequest,
    ) -> Result<csi::CreateVolumeResponse> {
        let connection = take_connection(&mut req.parameters)?;
        if let Some(source) = req.volume_content_source.as_mut() {
            unwrap_content_source(source, &connection)?;
        }

        info!(name = %req.name, connection = %connection, "CreateVolume request");

        let backend = self.connections.resolve(&connection).await?;
        let kind = backend.kind().to_string();
        let mut response = invoke(backend, Method::CreateVolume, None, |b| async move {
            b.create_volume(req).await
        })
        .await?;

        if let Some(volume) = response.volume.as_mut() {
            volume.volume_id = handle::encode_volume(&connection, &volume.volume_id);
            volume
                .volume_context
                .entry(PROVISIONER_DRIVER_KEY.to_string())
                .or_insert(kind);
            if let Some(source) = volume.content_source.as_mut() {
                wrap_content_source(source, &connection);
            }
            info!(volume_id = %volume.volume_id, "Volume created");
        }

        Ok(response)
    }

    async fn route_delete_volume(
        &self,
        mut req: csi::DeleteVolumeRequest,
    ) -> Result<csi::DeleteVolumeResponse> {
        let target = Handle::decode_volume(&req.volume_id)?;
        info!(volume_id = %req.volume_id, connection = %target.connection, "DeleteVolume request");
        req.volume_id = target.native_id;

        let backend = self.connections.resolve(&target.connection).await?;
        invoke(backend, Method::DeleteVolume, None, |b| async move {
            b.delete_volume(req).await
        })
        .await
    }

    async fn route_get_volume(
        &self,
        mut req: csi::ControllerGetVolumeRequest,
    ) -> Result<csi::ControllerGetVolumeResponse> {
        let target = Handle::decode_volume(&req.volume_id)?;
        debug!(volume_id = %req.volume_id, connection = %target.connection, "ControllerGetVolume request");
        req.volume_id = target.native_id;

        let backend = self.connections.resolve(&target.connection).await?;
        invoke(backend, Method::ControllerGetVolume, None, |b| async move {
            b.controller_get_volume(req).await
        })
        .await
    }

    async fn route_expand_volume(
        &self,
        mut req: csi::ControllerExpandVolumeRequest,
    ) -> Result<csi::ControllerExpandVolumeResponse> {
        let target = Handle::decode_volume(&req.volume_id)?;
        info!(
            volume_id = %req.volume_id,
            connection = %target.connection,
            required_bytes = req.capacity_range.as_ref().map(|r| r.required_bytes),
            "ControllerExpandVolume request"
        );
        req.volume_id = target.native_id;

        let backend = self.connections.resolve(&target.connection).await?;
        invoke(backend, Method::ControllerExpandVolume, None, |b| async move {
            b.controller_expand_volume(req).await
        })
        .await
    }

    async fn route_validate_volume_capabilities(
        &self,
        mut req: csi::ValidateVolumeCapabilitiesRequest,
    ) -> Result<csi::ValidateVolumeCapabilitiesResponse> {
        let target = Handle::decode_volume(&req.volume_id)?;
        debug!(volume_id = %req.volume_id, connection = %target.connection, "ValidateVolumeCapabilities request");
        req.volume_id = target.native_id;

        let backend = self.connections.resolve(&target.connection).await?;
        invoke(
            backend,
            Method::ValidateVolumeCapabilities,
            None,
            |b| async move { b.validate_volume_capabilities(req).await },
        )
        .await
    }

    async fn route_create_snapshot(
        &self,
        mut req: csi::CreateSnapshotRequest,
    ) -> Result<csi::CreateSnapshotResponse> {
        let source = Handle::decode_volume(&req.source_volume_id)?;
        info!(
            name = %req.name,
            source_volume_id = %req.source_volume_id,
            connection = %source.connection,
            "CreateSnapshot request"
        );
        req.source_volume_id = source.native_id;

        let backend = self.connections.resolve(&source.connection).await?;
        let mut response = invoke(backend, Method::CreateSnapshot, None, |b| async move {
            b.create_snapshot(req).await
        })
        .await?;

        if let Some(snapshot) = response.snapshot.as_mut() {
            wrap_snapshot(snapshot, &source.connection);
            info!(snapshot_id = %snapshot.snapshot_id, "Snapshot created");
        }

        Ok(response)
    }

    async fn route_delete_snapshot(
        &self,
        mut req: csi::DeleteSnapshotRequest,
    ) -> Result<csi::DeleteSnapshotResponse> {
        let target = Handle::decode_snapshot(&req.snapshot_id)?;
        info!(snapshot_id = %req.snapshot_id, connection = %target.connection, "DeleteSnapshot request");
        req.snapshot_id = target.native_id;

        let backend = self.connections.resolve(&target.connection).await?;
        invoke(backend, Method::DeleteSnapshot, None, |b| async move {
            b.delete_snapshot(req).await
        })
        .await
    }

    async fn route_list_snapshots(
        &self,
        mut req: csi::ListSnapshotsRequest,
    ) -> Result<csi::ListSnapshotsResponse> {
        let snapshot = non_empty(&req.snapshot_id)
            .map(Handle::decode_snapshot)
            .transpose();
        let source = non_empty(&req.source_volume_id)
            .map(Handle::decode_volume)
            .transpose();

        // a handle this proxy never issued cannot name an existing snapshot
        let (snapshot, source) = match (snapshot, source) {
            (Ok(snapshot), Ok(source)) => (snapshot, source),
            (Err(e), _) | (_, Err(e)) => {
                debug!(error = %e, "ListSnapshots filter is not a proxy handle");
                return Ok(csi::ListSnapshotsResponse::default());
            }
        };

        let connection = match (&snapshot, &source) {
            (Some(snapshot), Some(source)) if snapshot.connection != source.connection => {
                return Err(ProxyError::CrossConnection {
                    operation: "snapshot listing",
                    source_connection: source.connection.clone(),
                    target: snapshot.connection.clone(),
                });
            }
            (Some(handle), _) | (None, Some(handle)) => handle.connection.clone(),
            (None, None) => {
                return Err(ProxyError::MissingParameter("snapshot_id or source_volume_id"));
            }
        };

        info!(
            snapshot_id = %req.snapshot_id,
            source_volume_id = %req.source_volume_id,
            connection = %connection,
            "ListSnapshots request"
        );
        if let Some(snapshot) = snapshot {
            req.snapshot_id = snapshot.native_id;
        }
        if let Some(source) = source {
            req.source_volume_id = source.native_id;
        }

        let backend = self.connections.resolve(&connection).await?;
        let mut response = invoke(backend, Method::ListSnapshots, None, |b| async move {
            b.list_snapshots(req).await
        })
        .await?;

        for snapshot in response.entries.iter_mut().filter_map(|e| e.snapshot.as_mut()) {
            wrap_snapshot(snapshot, &connection);
        }

        Ok(response)
    }

    async fn route_get_capacity(
        &self,
        mut req: csi::GetCapacityRequest,
    ) -> Result<csi::GetCapacityResponse> {
        let connection = take_connection(&mut req.parameters)?;
        debug!(connection = %connection, "GetCapacity request");

        let backend = self.connections.resolve(&connection).await?;
        let unbounded = csi::GetCapacityResponse {
            available_capacity: UNBOUNDED_CAPACITY,
            ..Default::default()
        };
        invoke(backend, Method::GetCapacity, Some(unbounded), |b| async move {
            b.get_capacity(req).await
        })
        .await
    }
}

/// Record the outcome and convert it into a gRPC reply.
pub(crate) fn respond<T>(timer: OperationTimer, result: Result<T>) -> std::result::Result<Response<T>, Status> {
    let operation = timer.operation();
    match timer.observe(result) {
        Ok(response) => Ok(Response::new(response)),
        Err(e @ ProxyError::Backend(_)) => {
            error!(operation, error = %e, "Backend call failed");
            Err(e.into())
        }
        Err(e) => {
            warn!(operation, error = %e, "Request rejected");
            Err(e.into())
        }
    }
}

fn non_empty(value: &str) -> Option<&str> {
    (!value.is_empty()).then_some(value)
}

/// Remove and return the `connection` parameter.
fn take_connection(parameters: &mut HashMap<String, String>) -> Result<String> {
    parameters
        .remove(CONNECTION_PARAM)
        .filter(|c| !c.is_empty())
        .ok_or(ProxyError::MissingParameter(CONNECTION_PARAM))
}

/// Native id of `handle`, which must belong to `connection`.
fn native_in(connection: &str, handle: &str, prefix: &str, operation: &'static str) -> Result<String> {
    let source = Handle::decode(handle, prefix)?;
    if source.connection != connection {
        return Err(ProxyError::CrossConnection {
            operation,
            source_connection: source.connection,
            target: connection.to_string(),
        });
    }
    Ok(source.native_id)
}

fn unwrap_content_source(source: &mut csi::VolumeContentSource, connection: &str) -> Result<()> {
    match source.r#type.as_mut() {
        Some(ContentSource::Snapshot(snapshot)) => {
            snapshot.snapshot_id =
                native_in(connection, &snapshot.snapshot_id, SNAPSHOT_PREFIX, "snapshot restore")?;
        }
        Some(ContentSource::Volume(volume)) => {
            volume.volume_id = native_in(connection, &volume.volume_id, VOLUME_PREFIX, "clone")?;
        }
        None => return Err(ProxyError::UnknownContentSource),
    }
    Ok(())
}

fn wrap_content_source(source: &mut csi::VolumeContentSource, connection: &str) {
    match source.r#type.as_mut() {
        Some(ContentSource::Snapshot(snapshot)) => {
            snapshot.snapshot_id = handle::encode_snapshot(connection, &snapshot.snapshot_id);
        }
        Some(ContentSource::Volume(volume)) => {
            volume.volume_id = handle::encode_volume(connection, &volume.volume_id);
        }
        None => {}
    }
}

fn wrap_snapshot(snapshot: &mut csi::Snapshot, connection: &str) {
    snapshot.snapshot_id = handle::encode_snapshot(connection, &snapshot.snapshot_id);
    if !snapshot.source_volume_id.is_empty() {
        snapshot.source_volume_id = handle::encode_volume(connection, &snapshot.source_volume_id);
    }
}

fn rpc_capability(
    capability: csi::controller_service_capability::rpc::Type,
) -> csi::ControllerServiceCapability {
    csi::ControllerServiceCapability {
        r#type: Some(csi::controller_service_capability::Type::Rpc(
            csi::controller_service_capability::Rpc {
                r#type: capability as i32,
            },
        )),
    }
}

#[tonic::async_trait]
impl csi::controller_server::Controller for ControllerService {
    async fn create_volume(
        &self,
        request: Request<csi::CreateVolumeRequest>,
    ) -> std::result::Result<Response<csi::CreateVolumeResponse>, Status> {
        let timer = OperationTimer::new("create_volume");
        respond(timer, self.route_create_volume(request.into_inner()).await)
    }

    async fn delete_volume(
        &self,
        request: Request<csi::DeleteVolumeRequest>,
    ) -> std::result::Result<Response<csi::DeleteVolumeResponse>, Status> {
        let timer = OperationTimer::new("delete_volume");
        respond(timer, self.route_delete_volume(request.into_inner()).await)
    }

    async fn validate_volume_capabilities(
        &self,
        request: Request<csi::ValidateVolumeCapabilitiesRequest>,
    ) -> std::result::Result<Response<csi::ValidateVolumeCapabilitiesResponse>, Status> {
        let timer = OperationTimer::new("validate_volume_capabilities");
        respond(
            timer,
            self.route_validate_volume_capabilities(request.into_inner())
                .await,
        )
    }

    async fn get_capacity(
        &self,
        request: Request<csi::GetCapacityRequest>,
    ) -> std::result::Result<Response<csi::GetCapacityResponse>, Status> {
        let timer = OperationTimer::new("get_capacity");
        respond(timer, self.route_get_capacity(request.into_inner()).await)
    }

    /// Report controller capabilities.
    async fn controller_get_capabilities(
        &self,
        _request: Request<csi::ControllerGetCapabilitiesRequest>,
    ) -> std::result::Result<Response<csi::ControllerGetCapabilitiesResponse>, Status> {
        use csi::controller_service_capability::rpc::Type;

        let capabilities = [
            Type::CreateDeleteVolume,
            Type::CreateDeleteSnapshot,
            Type::ListSnapshots,
            Type::CloneVolume,
            Type::ExpandVolume,
            Type::GetCapacity,
            Type::GetVolume,
            Type::SingleNodeMultiWriter,
        ]
        .into_iter()
        .map(rpc_capability)
        .collect();

        Ok(Response::new(csi::ControllerGetCapabilitiesResponse {
            capabilities,
        }))
    }

    async fn create_snapshot(
        &self,
        request: Request<csi::CreateSnapshotRequest>,
    ) -> std::result::Result<Response<csi::CreateSnapshotResponse>, Status> {
        let timer = OperationTimer::new("create_snapshot");
        respond(timer, self.route_create_snapshot(request.into_inner()).await)
    }

    async fn delete_snapshot(
        &self,
        request: Request<csi::DeleteSnapshotRequest>,
    ) -> std::result::Result<Response<csi::DeleteSnapshotResponse>, Status> {
        let timer = OperationTimer::new("delete_snapshot");
        respond(timer, self.route_delete_snapshot(request.into_inner()).await)
    }

    async fn list_snapshots(
        &self,
        request: Request<csi::ListSnapshotsRequest>,
    ) -> std::result::Result<Response<csi::ListSnapshotsResponse>, Status> {
        let timer = OperationTimer::new("list_snapshots");
        respond(timer, self.route_list_snapshots(request.into_inner()).await)
    }

    async fn controller_expand_volume(
        &self,
        request: Request<csi::ControllerExpandVolumeRequest>,
    ) -> std::result::Result<Response<csi::ControllerExpandVolumeResponse>, Status> {
        let timer = OperationTimer::new("expand_volume");
        respond(timer, self.route_expand_volume(request.into_inner()).await)
    }

    async fn controller_get_volume(
        &self,
        request: Request<csi::ControllerGetVolumeRequest>,
    ) -> std::result::Result<Response<csi::ControllerGetVolumeResponse>, Status> {
        let timer = OperationTimer::new("get_volume");
        respond(timer, self.route_get_volume(request.into_inner()).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn volume_source(id: &str) -> csi::VolumeContentSource {
        csi::VolumeContentSource {
            r#type: Some(ContentSource::Volume(
                csi::volume_content_source::VolumeSource {
                    volume_id: id.to_string(),
                },
            )),
        }
    }

    fn snapshot_source(id: &str) -> csi::VolumeContentSource {
        csi::VolumeContentSource {
            r#type: Some(ContentSource::Snapshot(
                csi::volume_content_source::SnapshotSource {
                    snapshot_id: id.to_string(),
                },
            )),
        }
    }

    #[test]
    fn test_take_connection() {
        let mut params = HashMap::from([
            (CONNECTION_PARAM.to_string(), "nas1".to_string()),
            ("fsType".to_string(), "ext4".to_string()),
        ]);
        assert_eq!(take_connection(&mut params).unwrap(), "nas1");
        assert!(!params.contains_key(CONNECTION_PARAM));
        assert_eq!(params.len(), 1);

        assert!(matches!(
            take_connection(&mut params),
            Err(ProxyError::MissingParameter(CONNECTION_PARAM))
        ));

        params.insert(CONNECTION_PARAM.to_string(), String::new());
        assert!(take_connection(&mut params).is_err());
    }

    #[test]
    fn test_unwrap_same_connection_sources() {
        let mut source = volume_source("v:nas1/pool/vol9");
        unwrap_content_source(&mut source, "nas1").unwrap();
        assert_eq!(source, volume_source("pool/vol9"));

        let mut source = snapshot_source("s:nas1/snap1");
        unwrap_content_source(&mut source, "nas1").unwrap();
        assert_eq!(source, snapshot_source("snap1"));
    }

    #[test]
    fn test_unwrap_rejects_cross_connection() {
        let mut source = volume_source("v:nas2/volX");
        let err = unwrap_content_source(&mut source, "nas1").unwrap_err();
        assert!(matches!(err, ProxyError::CrossConnection { .. }));
        assert_eq!(err.code(), tonic::Code::InvalidArgument);

        let mut source = snapshot_source("s:nas2/snap1");
        assert!(unwrap_content_source(&mut source, "nas1").is_err());
    }

    #[test]
    fn test_unwrap_rejects_wrong_prefix_and_missing_type() {
        // a volume handle offered as a snapshot source
        let mut source = snapshot_source("v:nas1/vol1");
        assert!(matches!(
            unwrap_content_source(&mut source, "nas1"),
            Err(ProxyError::InvalidHandle { .. })
        ));

        let mut source = csi::VolumeContentSource { r#type: None };
        assert!(matches!(
            unwrap_content_source(&mut source, "nas1"),
            Err(ProxyError::UnknownContentSource)
        ));
    }

    #[test]
    fn test_wrap_snapshot() {
        let mut snapshot = csi::Snapshot {
            snapshot_id: "snap456".to_string(),
            source_volume_id: "vol123".to_string(),
            ..Default::default()
        };
        wrap_snapshot(&mut snapshot, "nas1");
        assert_eq!(snapshot.snapshot_id, "s:nas1/snap456");
        assert_eq!(snapshot.source_volume_id, "v:nas1/vol123");
    }
}
