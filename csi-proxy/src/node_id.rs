//! Compact, reversible node id built from several machine identity facets.
//!
//! A node id is a `/`-separated list of segments, one per enabled facet, in
//! the fixed order node name, hostname, IQN, NQN:
//!
//! - plain facets: `n=<node name>`, `h=<hostname>`
//! - prefix-stripped facets: `i<short>=<suffix>`, `v<short>=<suffix>`, where
//!   `<short>` names an entry of the configured prefix table and the full
//!   value is `<prefix><suffix>`.
//!
//! The orchestrator limits node ids to 192 bytes, which an IQN plus an NQN
//! easily exceed without the prefix table.

use std::collections::HashSet;
use std::path::Path;

use serde::Deserialize;

use crate::error::{ProxyError, Result};

/// Environment variable holding the orchestrator's name for this node.
pub const NODE_NAME_ENV: &str = "CSI_NODE_ID";

const INITIATOR_NAME_PATH: &str = "/etc/iscsi/initiatorname.iscsi";
const HOST_NQN_PATH: &str = "/etc/nvme/hostnqn";

const NODE_NAME_CODE: char = 'n';
const HOSTNAME_CODE: char = 'h';
const IQN_CODE: char = 'i';
const NQN_CODE: char = 'v';

/// Which facets make up the node id.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NodeIdParts {
    pub node_name: bool,
    pub hostname: bool,
    pub iqn: bool,
    pub nqn: bool,
}

impl Default for NodeIdParts {
    fn default() -> Self {
        Self {
            node_name: true,
            hostname: false,
            iqn: false,
            nqn: false,
        }
    }
}

/// Maps a well-known value prefix to a short name.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrefixEntry {
    pub short_name: String,
    pub prefix: String,
}

impl PrefixEntry {
    pub fn new(short_name: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            short_name: short_name.into(),
            prefix: prefix.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NodeIdConfig {
    pub parts: NodeIdParts,
    pub iqn_prefix: Vec<PrefixEntry>,
    pub nqn_prefix: Vec<PrefixEntry>,
}

/// Identity facets of a node. Absent facets are `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeIdentity {
    pub node_name: Option<String>,
    pub hostname: Option<String>,
    pub iqn: Option<String>,
    pub nqn: Option<String>,
}

impl NodeIdentity {
    /// Read the enabled facets from the local machine.
    pub fn detect(parts: &NodeIdParts) -> Result<Self> {
        let mut identity = NodeIdentity::default();

        if parts.node_name {
            identity.node_name = Some(local_node_name()?);
        }
        if parts.hostname {
            identity.hostname = Some(hostname::get()?.to_string_lossy().to_string());
        }
        if parts.iqn {
            identity.iqn = Some(read_initiator_name(Path::new(INITIATOR_NAME_PATH))?);
        }
        if parts.nqn {
            identity.nqn = Some(read_host_nqn(Path::new(HOST_NQN_PATH))?);
        }

        Ok(identity)
    }

    /// Serialize the facets enabled in `config.parts`.
    ///
    /// An enabled facet with no value is an error, as is an empty result.
    pub fn encode(&self, config: &NodeIdConfig) -> Result<String> {
        let mut segments = Vec::with_capacity(4);

        if config.parts.node_name {
            segments.push(plain_segment(NODE_NAME_CODE, required(&self.node_name, "nodeName")?)?);
        }
        if config.parts.hostname {
            segments.push(plain_segment(HOSTNAME_CODE, required(&self.hostname, "hostname")?)?);
        }
        if config.parts.iqn {
            segments.push(prefixed_segment(
                IQN_CODE,
                required(&self.iqn, "iqn")?,
                &config.iqn_prefix,
            )?);
        }
        if config.parts.nqn {
            segments.push(prefixed_segment(
                NQN_CODE,
                required(&self.nqn, "nqn")?,
                &config.nqn_prefix,
            )?);
        }

        if segments.is_empty() {
            return Err(ProxyError::EmptyNodeId);
        }
        Ok(segments.join("/"))
    }

    /// Parse a node id produced by [`NodeIdentity::encode`] with the same
    /// prefix tables.
    pub fn decode(node_id: &str, config: &NodeIdConfig) -> Result<Self> {
        let mut identity = NodeIdentity::default();

        for segment in node_id.split('/') {
            let mut chars = segment.chars();
            let code = chars
                .next()
                .ok_or_else(|| ProxyError::InvalidNodeId(segment.to_string()))?;
            let (short_name, value) = chars
                .as_str()
                .split_once('=')
                .ok_or_else(|| ProxyError::InvalidNodeId(segment.to_string()))?;

            match code {
                NODE_NAME_CODE | HOSTNAME_CODE => {
                    if !short_name.is_empty() {
                        return Err(ProxyError::InvalidNodeId(segment.to_string()));
                    }
                    let slot = if code == NODE_NAME_CODE {
                        &mut identity.node_name
                    } else {
                        &mut identity.hostname
                    };
                    *slot = Some(value.to_string());
                }
                IQN_CODE => {
                    identity.iqn = Some(expand(short_name, value, &config.iqn_prefix)?);
                }
                NQN_CODE => {
                    identity.nqn = Some(expand(short_name, value, &config.nqn_prefix)?);
                }
                _ => return Err(ProxyError::InvalidNodeId(segment.to_string())),
            }
        }

        Ok(identity)
    }
}

/// The orchestrator's name for this node, from [`NODE_NAME_ENV`].
pub fn local_node_name() -> Result<String> {
    std::env::var(NODE_NAME_ENV)
        .ok()
        .filter(|v| !v.is_empty())
        .ok_or(ProxyError::MissingEnv(NODE_NAME_ENV))
}

fn required<'a>(value: &'a Option<String>, facet: &str) -> Result<&'a str> {
    value
        .as_deref()
        .ok_or_else(|| ProxyError::InvalidNodeId(format!("{facet} is enabled but has no value")))
}

fn plain_segment(code: char, value: &str) -> Result<String> {
    if value.contains('/') {
        return Err(ProxyError::InvalidNodeId(value.to_string()));
    }
    Ok(format!("{code}={value}"))
}

/// Each short name must name exactly one entry of the table.
fn check_unique_short_names(table: &[PrefixEntry]) -> Result<()> {
    let mut seen = HashSet::with_capacity(table.len());
    for entry in table {
        if !seen.insert(entry.short_name.as_str()) {
            return Err(ProxyError::DuplicateShortName(entry.short_name.clone()));
        }
    }
    Ok(())
}

fn prefixed_segment(code: char, value: &str, table: &[PrefixEntry]) -> Result<String> {
    check_unique_short_names(table)?;
    let (entry, suffix) = table
        .iter()
        .find_map(|entry| value.strip_prefix(&entry.prefix).map(|s| (entry, s)))
        .ok_or_else(|| ProxyError::NoMatchingPrefix(value.to_string()))?;

    if !is_valid_short_name(&entry.short_name) {
        return Err(ProxyError::InvalidShortName(entry.short_name.clone()));
    }
    if suffix.contains('/') {
        return Err(ProxyError::InvalidNodeId(value.to_string()));
    }

    Ok(format!("{code}{}={suffix}", entry.short_name))
}

fn expand(short_name: &str, suffix: &str, table: &[PrefixEntry]) -> Result<String> {
    check_unique_short_names(table)?;
    let entry = table
        .iter()
        .find(|entry| entry.short_name == short_name)
        .ok_or_else(|| ProxyError::UnknownPrefix(short_name.to_string()))?;
    Ok(format!("{}{suffix}", entry.prefix))
}

fn is_valid_short_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
}

/// Extract the `InitiatorName=` value from an open-iscsi initiator file.
fn read_initiator_name(path: &Path) -> Result<String> {
    let content = std::fs::read_to_string(path)?;
    content
        .lines()
        .filter(|line| !line.trim_start().starts_with('#'))
        .find_map(|line| line.trim().strip_prefix("InitiatorName="))
        .map(|iqn| iqn.trim().to_string())
        .filter(|iqn| !iqn.is_empty())
        .ok_or_else(|| ProxyError::InvalidNodeId(format!("no InitiatorName in {}", path.display())))
}

fn read_host_nqn(path: &Path) -> Result<String> {
    let nqn = std::fs::read_to_string(path)?.trim().to_string();
    if nqn.is_empty() {
        return Err(ProxyError::InvalidNodeId(format!(
            "empty host nqn in {}",
            path.display()
        )));
    }
    Ok(nqn)
}
