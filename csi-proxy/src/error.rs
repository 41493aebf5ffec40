use thiserror::Error;
use tonic::{Code, Status};

use crate::backend::Method;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("invalid handle '{handle}': {reason}")]
    InvalidHandle { handle: String, reason: &'static str },

    #[error("invalid connection name '{0}'")]
    InvalidConnectionName(String),

    #[error("parameter '{0}' is required")]
    MissingParameter(&'static str),

    #[error("cross-connection {operation} is not supported: '{source_connection}' != '{target}'")]
    CrossConnection {
        operation: &'static str,
        source_connection: String,
        target: String,
    },

    #[error("unknown volume content source type")]
    UnknownContentSource,

    #[error("proxy is not supported for driver: {0}")]
    DeniedDriver(String),

    #[error("unknown driver: {0}")]
    UnknownDriver(String),

    #[error("cyclic dependency: proxy on proxy")]
    CyclicProxy,

    #[error("underlying driver does not support {0}")]
    Unsupported(Method),

    #[error("unknown CSI method '{0}'")]
    UnknownMethod(String),

    #[error("unknown topology type '{0}': expected 'cluster' or 'node'")]
    UnknownTopology(String),

    #[error("unknown node id prefix short name '{0}'")]
    UnknownPrefix(String),

    #[error("no configured prefix matches '{0}'")]
    NoMatchingPrefix(String),

    #[error("prefix short name '{0}' must be lowercase alphanumeric")]
    InvalidShortName(String),

    #[error("prefix short name '{0}' is used by more than one entry")]
    DuplicateShortName(String),

    #[error("invalid node id segment '{0}'")]
    InvalidNodeId(String),

    #[error("node id is empty: at least one identity part must be enabled")]
    EmptyNodeId,

    #[error("invalid endpoint '{0}': expected unix:///path or tcp://host:port")]
    InvalidEndpoint(String),

    #[error("environment variable {0} is not set")]
    MissingEnv(&'static str),

    #[error("real driver is missing from config")]
    MissingDriver,

    #[error("gRPC transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("failed to parse config: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Backend(#[from] Status),
}

impl ProxyError {
    /// Status classification surfaced to the orchestrator.
    pub fn code(&self) -> Code {
        match self {
            ProxyError::MissingDriver => Code::FailedPrecondition,
            ProxyError::Transport(_) | ProxyError::Yaml(_) | ProxyError::Io(_) => Code::Internal,
            ProxyError::Backend(status) => status.code(),
            _ => Code::InvalidArgument,
        }
    }
}

impl From<ProxyError> for Status {
    fn from(err: ProxyError) -> Self {
        match err {
            ProxyError::Backend(status) => status,
            other => Status::new(other.code(), other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, ProxyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_argument_classification() {
        let err = ProxyError::Unsupported(Method::GetCapacity);
        assert_eq!(err.code(), Code::InvalidArgument);

        let status: Status = err.into();
        assert_eq!(status.code(), Code::InvalidArgument);
        assert_eq!(
            status.message(),
            "underlying driver does not support GetCapacity"
        );
    }

    #[test]
    fn test_backend_status_passes_through() {
        let err = ProxyError::Backend(Status::not_found("volume vol1 not found"));
        let status: Status = err.into();
        assert_eq!(status.code(), Code::NotFound);
        assert_eq!(status.message(), "volume vol1 not found");
    }

    #[test]
    fn test_environment_errors_are_internal() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        assert_eq!(ProxyError::from(io).code(), Code::Internal);
        assert_eq!(ProxyError::MissingDriver.code(), Code::FailedPrecondition);
    }
}
