//! Keel Ops: typed operations on well-known kinds, selector resolution,
//! rolling restarts and node runtime compliance.
//!
//! Every call builds its own client from the connection profile; `KubeOps` holds no
//! client state and can be shared freely across tasks.

#![forbid(unsafe_code)]

mod compliance;
mod mesh;
mod resources;
mod rollout;
mod selector;

use std::fmt::Display;

use keel_core::{ConnectionProfile, ControlError, ControlResult};
use kube::{api::Api, Client, Resource};
use k8s_openapi::NamespaceResourceScope;

pub use compliance::{evaluate_runtimes, runtime_scheme, Compliance, ComplianceViolation, NodeRuntimeReport, DEFAULT_APPROVED_RUNTIME};
pub use mesh::{EnvoyFilter, EnvoyFilterSpec, WorkloadSelector};
pub use resources::CRD_COORDINATE;
pub use rollout::{restart_patch, WorkloadKind, RESTARTED_AT_ANNOTATION};
pub use selector::{selector_string, service_matches_selector};

/// Default implementation using kube-rs client APIs.
#[derive(Debug, Clone)]
pub struct KubeOps {
    profile: ConnectionProfile,
    approved_runtime: String,
}

impl KubeOps {
    /// The approved runtime comes from `KEEL_APPROVED_RUNTIME`, else `containerd`.
    pub fn new(profile: ConnectionProfile) -> Self {
        let approved_runtime = std::env::var("KEEL_APPROVED_RUNTIME")
            .ok()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| DEFAULT_APPROVED_RUNTIME.to_string());
        Self { profile, approved_runtime }
    }

    pub fn with_approved_runtime(mut self, runtime: impl Into<String>) -> Self {
        self.approved_runtime = runtime.into();
        self
    }

    pub fn profile(&self) -> &ConnectionProfile {
        &self.profile
    }

    pub fn approved_runtime(&self) -> &str {
        &self.approved_runtime
    }

    fn client(&self) -> ControlResult<Client> {
        keel_kubehub::client_for(&self.profile)
    }

    fn namespaced<K>(&self, namespace: &str) -> ControlResult<Api<K>>
    where
        K: Resource<Scope = NamespaceResourceScope>,
        <K as Resource>::DynamicType: Default,
    {
        Ok(Api::namespaced(self.client()?, namespace))
    }

    fn cluster<K>(&self) -> ControlResult<Api<K>>
    where
        K: Resource,
        <K as Resource>::DynamicType: Default,
    {
        Ok(Api::all(self.client()?))
    }
}

fn access_error(context: impl Display, err: kube::Error) -> ControlError {
    ControlError::ResourceAccess(format!("{}: {}", context, err))
}

/// Name of a typed object about to be written back.
fn object_name<K>(obj: &K) -> ControlResult<String>
where
    K: Resource,
    <K as Resource>::DynamicType: Default,
{
    obj.meta()
        .name
        .clone()
        .ok_or_else(|| ControlError::Configuration(format!("{} object has no metadata.name", K::kind(&Default::default()))))
}
