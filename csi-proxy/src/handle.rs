//! Composite volume and snapshot handles.
//!
//! Handles returned to the orchestrator embed the connection they belong to:
//! `<prefix><connection>/<native id>`. The connection name never contains a
//! `/`, the native id may.

use std::fmt::{self, Display};

use crate::error::{ProxyError, Result};

/// Prefix of volume handles.
pub const VOLUME_PREFIX: &str = "v:";
/// Prefix of snapshot handles.
pub const SNAPSHOT_PREFIX: &str = "s:";

/// A decoded handle: which connection owns the object and its backend id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handle {
    pub connection: String,
    pub native_id: String,
}

impl Handle {
    pub fn new(connection: impl Into<String>, native_id: impl Into<String>) -> Self {
        Self {
            connection: connection.into(),
            native_id: native_id.into(),
        }
    }

    /// Parse `handle`, which must start with `prefix`.
    ///
    /// Splits at the first `/` after the prefix. The native id is not
    /// inspected.
    pub fn decode(handle: &str, prefix: &str) -> Result<Self> {
        let rest = handle
            .strip_prefix(prefix)
            .ok_or_else(|| invalid(handle, "unexpected prefix"))?;

        let (connection, native_id) = rest
            .split_once('/')
            .ok_or_else(|| invalid(handle, "missing connection separator"))?;

        if connection.is_empty() {
            return Err(invalid(handle, "empty connection name"));
        }

        Ok(Self::new(connection, native_id))
    }

    pub fn decode_volume(handle: &str) -> Result<Self> {
        Self::decode(handle, VOLUME_PREFIX)
    }

    pub fn decode_snapshot(handle: &str) -> Result<Self> {
        Self::decode(handle, SNAPSHOT_PREFIX)
    }

    /// Serialize with `prefix`. No escaping is done.
    pub fn encode(&self, prefix: &str) -> String {
        encode(&self.connection, &self.native_id, prefix)
    }
}

impl Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.connection, self.native_id)
    }
}

pub fn encode(connection: &str, native_id: &str, prefix: &str) -> String {
    format!("{prefix}{connection}/{native_id}")
}

pub fn encode_volume(connection: &str, native_id: &str) -> String {
    encode(connection, native_id, VOLUME_PREFIX)
}

pub fn encode_snapshot(connection: &str, native_id: &str) -> String {
    encode(connection, native_id, SNAPSHOT_PREFIX)
}

fn invalid(handle: &str, reason: &'static str) -> ProxyError {
    ProxyError::InvalidHandle {
        handle: handle.to_string(),
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_volume() {
        assert_eq!(encode_volume("nas1", "vol123"), "v:nas1/vol123");
        assert_eq!(encode_snapshot("nas1", "snap456"), "s:nas1/snap456");
    }

    #[test]
    fn test_decode_volume() {
        let handle = Handle::decode_volume("v:nas1/vol123").unwrap();
        assert_eq!(handle.connection, "nas1");
        assert_eq!(handle.native_id, "vol123");
    }

    #[test]
    fn test_native_id_keeps_slashes() {
        let handle = Handle::decode_volume("v:nas1/tank/k8s/pvc-1").unwrap();
        assert_eq!(handle.connection, "nas1");
        assert_eq!(handle.native_id, "tank/k8s/pvc-1");
        assert_eq!(handle.encode(VOLUME_PREFIX), "v:nas1/tank/k8s/pvc-1");
    }

    #[test]
    fn test_empty_native_id_is_accepted() {
        let handle = Handle::decode_volume("v:nas1/").unwrap();
        assert_eq!(handle.native_id, "");
    }

    #[test]
    fn test_wrong_prefix_rejected() {
        assert!(Handle::decode_volume("s:nas1/snap1").is_err());
        assert!(Handle::decode_snapshot("v:nas1/vol1").is_err());
        assert!(Handle::decode_volume("nas1/vol1").is_err());
        assert!(Handle::decode_volume("").is_err());
    }

    #[test]
    fn test_malformed_rejected() {
        let err = Handle::decode_volume("v:nas1").unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);
        assert!(Handle::decode_volume("v:/vol1").is_err());
    }

    #[test]
    fn test_round_trip() {
        let cases = [
            ("nas1", "vol123"),
            ("a", ""),
            ("conn-with.dots_and-dashes", "pool/dataset/with/slashes"),
            ("x", "id:with:colons"),
        ];
        for (connection, native_id) in cases {
            for prefix in [VOLUME_PREFIX, SNAPSHOT_PREFIX, "custom:"] {
                let encoded = encode(connection, native_id, prefix);
                let decoded = Handle::decode(&encoded, prefix).unwrap();
                assert_eq!(decoded, Handle::new(connection, native_id));
            }
        }
    }
}
