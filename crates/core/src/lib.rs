//! Keel core types: connection profile, resource coordinates, label maps and errors.

#![forbid(unsafe_code)]

mod logging;
mod profile;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub use logging::LogLevel;
pub use profile::{normalize_host, ConnectionConfig, ConnectionProfile, TlsPolicy};

/// Label key/value pairs; a selector matches only when every entry matches.
pub type LabelMap = BTreeMap<String, String>;

/// Failures surfaced by control operations.
///
/// Absence of a resource is never one of these: lookups report it as `Ok(None)` or `false`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum ControlError {
    #[error("configuration: {0}")]
    Configuration(String),
    #[error("client construction: {0}")]
    ClientConstruction(String),
    #[error("resource access: {0}")]
    ResourceAccess(String),
    #[error("apply: {0}")]
    Apply(String),
    #[error("delete: {0}")]
    Delete(String),
    #[error("inspection: {0}")]
    Inspection(String),
}

impl ControlError {
    /// True for failures rooted in the connection profile rather than the request.
    pub fn is_profile_problem(&self) -> bool {
        matches!(self, ControlError::Configuration(_) | ControlError::ClientConstruction(_))
    }
}

pub type ControlResult<T> = Result<T, ControlError>;

/// Addresses any cluster object by group/version/resource without a static schema.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceCoordinate {
    /// API group; empty for the core group.
    pub group: String,
    pub version: String,
    /// Plural resource name, e.g. `deployments`.
    pub resource: String,
    /// `None` addresses cluster-scoped resources.
    pub namespace: Option<String>,
    pub name: Option<String>,
}

impl ResourceCoordinate {
    pub fn new(group: impl Into<String>, version: impl Into<String>, resource: impl Into<String>) -> Self {
        Self { group: group.into(), version: version.into(), resource: resource.into(), namespace: None, name: None }
    }

    pub fn in_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// `group/version`, or just `version` for the core group.
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }
}

impl fmt::Display for ResourceCoordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.api_version(), self.resource)?;
        if let Some(ns) = &self.namespace {
            write!(f, " ns={}", ns)?;
        }
        if let Some(name) = &self.name {
            write!(f, " name={}", name)?;
        }
        Ok(())
    }
}

/// Parses `v1/services` or `apps/v1/deployments`.
impl FromStr for ResourceCoordinate {
    type Err = ControlError;

    fn from_str(key: &str) -> Result<Self, Self::Err> {
        let parts: Vec<_> = key.split('/').collect();
        match parts.as_slice() {
            [version, resource] if !version.is_empty() && !resource.is_empty() => Ok(Self::new("", *version, *resource)),
            [group, version, resource] if !version.is_empty() && !resource.is_empty() => Ok(Self::new(*group, *version, *resource)),
            _ => Err(ControlError::Configuration(format!(
                "invalid resource key: {} (expect v1/resource or group/v1/resource)",
                key
            ))),
        }
    }
}

pub mod prelude {
    pub use super::{ConnectionConfig, ConnectionProfile, ControlError, ControlResult, LabelMap, ResourceCoordinate, TlsPolicy};
}
