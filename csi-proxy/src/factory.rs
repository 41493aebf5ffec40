//! Backend construction guard.
//!
//! Validates the requested kind, builds the backend with a fresh
//! [`BackendContext`], and refuses anything that turns out to be this proxy
//! again.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{info, warn};

use crate::backend::grpc::{self, GrpcBackend};
use crate::backend::{Backend, BackendContext};
use crate::config::DriverOptions;
use crate::error::{ProxyError, Result};
use crate::metrics;

/// Kind tag of the proxy itself.
pub const PROXY_KIND: &str = "proxy";

/// Kinds that cannot run behind the proxy, including the proxy itself.
///
/// The others need per-call context (node-local options, secrets, or a
/// node identity of their own) that the proxy cannot supply.
pub const DENIED_DRIVERS: &[&str] = &[
    "zfs-local-ephemeral-inline",
    "zfs-local-dataset",
    "zfs-local-zvol",
    "objectivefs",
    "local-hostpath",
    "synology-nfs",
    "synology-smb",
    "synology-iscsi",
    PROXY_KIND,
];

/// Builds a backend of one kind from merged options.
pub type Constructor =
    Arc<dyn Fn(&DriverOptions, BackendContext) -> Result<Arc<dyn Backend>> + Send + Sync>;

/// Registry of constructible backend kinds.
#[derive(Clone, Default)]
pub struct DriverFactory {
    constructors: HashMap<String, Constructor>,
}

impl DriverFactory {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the in-tree backend kinds.
    pub fn with_builtin() -> Self {
        let mut factory = Self::new();
        factory.register(grpc::KIND, |options, context| {
            Ok(Arc::new(GrpcBackend::from_options(options, context)?) as Arc<dyn Backend>)
        });
        factory
    }

    pub fn register<F>(&mut self, kind: &str, constructor: F)
    where
        F: Fn(&DriverOptions, BackendContext) -> Result<Arc<dyn Backend>> + Send + Sync + 'static,
    {
        self.constructors
            .insert(kind.to_string(), Arc::new(constructor));
    }

    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.constructors.keys().map(String::as_str)
    }

    pub fn build(&self, options: &DriverOptions) -> Result<Arc<dyn Backend>> {
        let kind = options.driver()?;

        if is_denied(kind) {
            warn!(driver = %kind, "Refusing denied driver kind");
            return Err(ProxyError::DeniedDriver(kind.to_string()));
        }

        let constructor = self
            .constructors
            .get(kind)
            .ok_or_else(|| ProxyError::UnknownDriver(kind.to_string()))?;

        let context = BackendContext::new();
        let context_id = context.id();
        let backend = constructor(options, context)?;

        if backend.kind() == PROXY_KIND {
            warn!(driver = %kind, "Connection resolves back to the proxy");
            return Err(ProxyError::CyclicProxy);
        }

        metrics::record_backend_build(kind);
        info!(driver = %kind, backend = %backend.kind(), context = %context_id, "Constructed backend");
        Ok(backend)
    }
}

pub fn is_denied(kind: &str) -> bool {
    DENIED_DRIVERS.contains(&kind)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Method;

    struct Tagged(&'static str);

    #[tonic::async_trait]
    impl Backend for Tagged {
        fn kind(&self) -> &str {
            self.0
        }

        fn supports(&self, _method: Method) -> bool {
            false
        }
    }

    fn factory() -> DriverFactory {
        let mut factory = DriverFactory::new();
        factory.register("fake", |_, _| Ok(Arc::new(Tagged("fake")) as Arc<dyn Backend>));
        factory.register("loopback", |_, _| {
            Ok(Arc::new(Tagged(PROXY_KIND)) as Arc<dyn Backend>)
        });
        factory
    }

    #[test]
    fn test_build_registered_kind() {
        let backend = factory()
            .build(&DriverOptions::default().with_driver("fake"))
            .unwrap();
        assert_eq!(backend.kind(), "fake");
    }

    #[test]
    fn test_denied_kinds() {
        let factory = factory();
        for kind in DENIED_DRIVERS {
            let err = factory
                .build(&DriverOptions::default().with_driver(kind))
                .err()
                .unwrap();
            assert!(matches!(err, ProxyError::DeniedDriver(_)), "{kind}");
            assert_eq!(err.code(), tonic::Code::InvalidArgument);
        }
    }

    #[test]
    fn test_deny_list_is_exact_membership() {
        assert!(is_denied("synology-iscsi"));
        assert!(!is_denied("synology"));
        assert!(!is_denied("zfs-local"));
        assert!(!is_denied("freenas-api-iscsi"));
    }

    #[test]
    fn test_cyclic_proxy_detected_by_tag() {
        let err = factory()
            .build(&DriverOptions::default().with_driver("loopback"))
            .err()
            .unwrap();
        assert!(matches!(err, ProxyError::CyclicProxy));
        assert_eq!(err.to_string(), "cyclic dependency: proxy on proxy");
    }

    #[test]
    fn test_unknown_and_missing_driver() {
        let factory = factory();
        assert!(matches!(
            factory.build(&DriverOptions::default().with_driver("nope")),
            Err(ProxyError::UnknownDriver(_))
        ));
        assert!(matches!(
            factory.build(&DriverOptions::default()),
            Err(ProxyError::MissingDriver)
        ));
    }

    #[test]
    fn test_each_build_gets_fresh_context() {
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut factory = DriverFactory::new();
        let record = seen.clone();
        factory.register("fake", move |_, context| {
            record.lock().unwrap().push(context.id());
            Ok(Arc::new(Tagged("fake")) as Arc<dyn Backend>)
        });

        let options = DriverOptions::default().with_driver("fake");
        factory.build(&options).unwrap();
        factory.build(&options).unwrap();

        let ids = seen.lock().unwrap();
        assert_eq!(ids.len(), 2);
        assert_ne!(ids[0], ids[1]);
    }

    #[test]
    fn test_builtin_kinds() {
        let factory = DriverFactory::with_builtin();
        assert_eq!(factory.kinds().collect::<Vec<_>>(), vec![grpc::KIND]);
    }
}
