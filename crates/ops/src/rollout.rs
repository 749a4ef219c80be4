use std::fmt;
use std::str::FromStr;

use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::NamespaceResourceScope;
use keel_core::{ControlError, ControlResult};
use kube::{
    api::{Patch, PatchParams},
    Resource,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::info;

use crate::{access_error, KubeOps};

/// Pod-template annotation whose change makes the controller roll every pod.
pub const RESTARTED_AT_ANNOTATION: &str = "kubectl.kubernetes.io/restartedAt";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkloadKind {
    #[default]
    Deployment,
    DaemonSet,
    StatefulSet,
}

impl WorkloadKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkloadKind::Deployment => "Deployment",
            WorkloadKind::DaemonSet => "DaemonSet",
            WorkloadKind::StatefulSet => "StatefulSet",
        }
    }
}

impl fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkloadKind {
    type Err = ControlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "deployment" | "deployments" | "deploy" => Ok(WorkloadKind::Deployment),
            "daemonset" | "daemonsets" | "ds" => Ok(WorkloadKind::DaemonSet),
            "statefulset" | "statefulsets" | "sts" => Ok(WorkloadKind::StatefulSet),
            other => Err(ControlError::Configuration(format!("unsupported workload kind: {}", other))),
        }
    }
}

/// Merge patch stamping the pod template with `timestamp`.
pub fn restart_patch(timestamp: &str) -> serde_json::Value {
    serde_json::json!({
        "spec": {"template": {"metadata": {"annotations": {RESTARTED_AT_ANNOTATION: timestamp}}}}
    })
}

impl KubeOps {
    /// Rolling restart of a Deployment.
    pub async fn restart(&self, namespace: &str, name: &str) -> ControlResult<()> {
        self.restart_workload(WorkloadKind::Deployment, namespace, name).await
    }

    /// Fire-and-forget: returns once the patch is accepted, without waiting for the rollout.
    pub async fn restart_workload(&self, kind: WorkloadKind, namespace: &str, name: &str) -> ControlResult<()> {
        let ts = chrono::Utc::now().to_rfc3339();
        match kind {
            WorkloadKind::Deployment => self.stamp::<Deployment>(namespace, name, &ts).await?,
            WorkloadKind::DaemonSet => self.stamp::<DaemonSet>(namespace, name, &ts).await?,
            WorkloadKind::StatefulSet => self.stamp::<StatefulSet>(namespace, name, &ts).await?,
        }
        info!(kind = %kind, ns = %namespace, name = %name, restarted_at = %ts, "rollout restart requested");
        Ok(())
    }

    async fn stamp<K>(&self, namespace: &str, name: &str, ts: &str) -> ControlResult<()>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + fmt::Debug,
        <K as Resource>::DynamicType: Default,
    {
        let api = self.namespaced::<K>(namespace)?;
        let patch = restart_patch(ts);
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| access_error(format!("restart {}/{}", namespace, name), e))?;
        Ok(())
    }
}
