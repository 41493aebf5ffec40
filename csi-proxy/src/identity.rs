//! CSI Identity Service Implementation
//!
//! Identifies the proxy itself. Backends behind it are never visible here.

use std::collections::HashMap;

use tonic::{Request, Response, Status};

use crate::csi;

pub const DRIVER_NAME: &str = "org.democratic-csi.proxy";
pub const DRIVER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// CSI Identity Service
pub struct IdentityService {
    name: String,
}

impl IdentityService {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Default for IdentityService {
    fn default() -> Self {
        Self::new(DRIVER_NAME)
    }
}

#[tonic::async_trait]
impl csi::identity_server::Identity for IdentityService {
    async fn get_plugin_info(
        &self,
        _request: Request<csi::GetPluginInfoRequest>,
    ) -> Result<Response<csi::GetPluginInfoResponse>, Status> {
        Ok(Response::new(csi::GetPluginInfoResponse {
            name: self.name.clone(),
            vendor_version: DRIVER_VERSION.to_string(),
            manifest: HashMap::new(),
        }))
    }

    /// Controller service with online expansion. Topology is reported per
    /// node through NodeGetInfo, not advertised as a constraint.
    async fn get_plugin_capabilities(
        &self,
        _request: Request<csi::GetPluginCapabilitiesRequest>,
    ) -> Result<Response<csi::GetPluginCapabilitiesResponse>, Status> {
        use csi::plugin_capability::{Service, Type, VolumeExpansion, service, volume_expansion};

        let capabilities = vec![
            csi::PluginCapability {
                r#type: Some(Type::Service(Service {
                    r#type: service::Type::ControllerService as i32,
                })),
            },
            csi::PluginCapability {
                r#type: Some(Type::VolumeExpansion(VolumeExpansion {
                    r#type: volume_expansion::Type::Online as i32,
                })),
            },
        ];

        Ok(Response::new(csi::GetPluginCapabilitiesResponse { capabilities }))
    }

    async fn probe(
        &self,
        _request: Request<csi::ProbeRequest>,
    ) -> Result<Response<csi::ProbeResponse>, Status> {
        // backends are built on demand, so there is nothing to wait for
        Ok(Response::new(csi::ProbeResponse { ready: Some(true) }))
    }
}
