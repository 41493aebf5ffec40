//! Driver options: the proxy's own YAML file and one file per connection.
//!
//! Layers merge with increasing precedence: proxy base options, the
//! connection file, then request-scoped overrides (the node side picks the
//! driver kind from the volume context). Per field:
//!
//! - `driver`, `instanceId`: the later layer wins when it sets a value
//! - `proxy`: only the base layer counts, connections cannot reconfigure it
//! - backend sections: maps merge key by key, anything else is replaced

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_yaml::Value;

use crate::cache::CachePolicy;
use crate::error::{ProxyError, Result};
use crate::node_id::NodeIdConfig;
use crate::types::DEFAULT_TOPOLOGY_PREFIX;

const DEFAULT_CONFIG_FOLDER: &str = "/mnt/connections";
const DEFAULT_CACHE_TIMEOUT_MINUTES: i64 = 60;

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriverOptions {
    /// Backend kind.
    #[serde(default)]
    pub driver: Option<String>,
    #[serde(default)]
    pub instance_id: Option<String>,
    #[serde(default)]
    pub proxy: ProxySettings,
    /// Backend-specific sections, keyed by section name.
    #[serde(flatten)]
    pub backend: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProxySettings {
    pub config_folder: PathBuf,
    /// Idle eviction delay. `0` disables caching, negative keeps entries forever.
    pub cache_timeout_minutes: i64,
    pub node_topology: NodeTopologyConfig,
    pub node_id: NodeIdConfig,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            config_folder: PathBuf::from(DEFAULT_CONFIG_FOLDER),
            cache_timeout_minutes: DEFAULT_CACHE_TIMEOUT_MINUTES,
            node_topology: NodeTopologyConfig::default(),
            node_id: NodeIdConfig::default(),
        }
    }
}

impl ProxySettings {
    pub fn cache_policy(&self) -> CachePolicy {
        CachePolicy::from_minutes(self.cache_timeout_minutes)
    }
}

/// Kept as raw strings; the mode is parsed when NodeGetInfo runs.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct NodeTopologyConfig {
    #[serde(rename = "type")]
    pub mode: String,
    pub prefix: String,
}

impl Default for NodeTopologyConfig {
    fn default() -> Self {
        Self {
            mode: "cluster".to_string(),
            prefix: DEFAULT_TOPOLOGY_PREFIX.to_string(),
        }
    }
}

impl DriverOptions {
    /// Parse a YAML document. An empty document yields default options.
    pub fn from_yaml(content: &str) -> Result<Self> {
        let value: Value = serde_yaml::from_str(content)?;
        if value.is_null() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_value(value)?)
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        Self::from_yaml(&content)
    }

    /// The backend kind, which every usable layer stack must resolve.
    pub fn driver(&self) -> Result<&str> {
        self.driver
            .as_deref()
            .filter(|d| !d.is_empty())
            .ok_or(ProxyError::MissingDriver)
    }

    /// Apply `overlay` on top of these options.
    pub fn merged_with(&self, overlay: DriverOptions) -> DriverOptions {
        let mut merged = self.clone();

        if overlay.driver.is_some() {
            merged.driver = overlay.driver;
        }
        if overlay.instance_id.is_some() {
            merged.instance_id = overlay.instance_id;
        }
        for (key, value) in overlay.backend {
            match merged.backend.get_mut(&key) {
                Some(existing) => merge_value(existing, value),
                None => {
                    merged.backend.insert(key, value);
                }
            }
        }

        merged
    }

    /// Request-scoped override of the backend kind.
    pub fn with_driver(&self, driver: &str) -> DriverOptions {
        let mut options = self.clone();
        options.driver = Some(driver.to_string());
        options
    }

    /// Deserialize the backend section `key`, if present.
    pub fn section<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.backend.get(key) {
            Some(value) => Ok(Some(serde_yaml::from_value(value.clone())?)),
            None => Ok(None),
        }
    }
}

fn merge_value(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Mapping(base), Value::Mapping(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge_value(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

/// Validate a connection name for use as a file name.
pub fn validate_connection_name(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') || name.contains('\0')
    {
        return Err(ProxyError::InvalidConnectionName(name.to_string()));
    }
    Ok(())
}

/// `<folder>/<name>.yaml`
pub fn connection_path(folder: &Path, name: &str) -> Result<PathBuf> {
    validate_connection_name(name)?;
    Ok(folder.join(format!("{name}.yaml")))
}
