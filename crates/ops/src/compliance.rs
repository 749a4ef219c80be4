use std::fmt;

use k8s_openapi::api::core::v1::Node;
use keel_core::{ControlError, ControlResult};
use kube::api::{Api, ListParams};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use url::Url;

use crate::KubeOps;

pub const DEFAULT_APPROVED_RUNTIME: &str = "containerd";

/// What one node reports as its container runtime, e.g. `containerd://1.6.8`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRuntimeReport {
    pub node_name: String,
    pub runtime_identifier: String,
}

impl NodeRuntimeReport {
    fn from_node(node: &Node) -> Self {
        Self {
            node_name: node.metadata.name.clone().unwrap_or_default(),
            runtime_identifier: node
                .status
                .as_ref()
                .and_then(|s| s.node_info.as_ref())
                .map(|i| i.container_runtime_version.clone())
                .unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComplianceViolation {
    pub node_name: String,
    pub runtime_identifier: String,
    pub found_scheme: String,
    pub approved_runtime: String,
}

impl fmt::Display for ComplianceViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "node {} runs {:?}, expected a {} runtime",
            self.node_name, self.runtime_identifier, self.approved_runtime
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Compliance {
    Compliant { nodes_checked: usize },
    Violation(ComplianceViolation),
}

impl Compliance {
    pub fn is_compliant(&self) -> bool {
        matches!(self, Compliance::Compliant { .. })
    }
}

/// Scheme of a runtime identifier. A string with no scheme at all yields `""`.
pub fn runtime_scheme(runtime: &str) -> ControlResult<String> {
    match Url::parse(runtime) {
        Ok(url) => Ok(url.scheme().to_string()),
        Err(url::ParseError::RelativeUrlWithoutBase) => Ok(String::new()),
        Err(e) => Err(ControlError::Inspection(format!("cannot parse container runtime {:?}: {}", runtime, e))),
    }
}

/// Stops at the first node whose runtime scheme differs from `approved`.
pub fn evaluate_runtimes<I>(reports: I, approved: &str) -> ControlResult<Compliance>
where
    I: IntoIterator<Item = NodeRuntimeReport>,
{
    let mut checked = 0usize;
    for report in reports {
        let scheme = runtime_scheme(&report.runtime_identifier)?;
        checked += 1;
        if scheme != approved {
            return Ok(Compliance::Violation(ComplianceViolation {
                node_name: report.node_name,
                runtime_identifier: report.runtime_identifier,
                found_scheme: scheme,
                approved_runtime: approved.to_string(),
            }));
        }
        debug!(node = %report.node_name, runtime = %report.runtime_identifier, "node runtime approved");
    }
    Ok(Compliance::Compliant { nodes_checked: checked })
}

impl KubeOps {
    pub async fn check_node_runtime(&self) -> ControlResult<Compliance> {
        let api: Api<Node> = Api::all(self.client()?);
        let nodes = api
            .list(&ListParams::default())
            .await
            .map_err(|e| ControlError::Inspection(format!("list nodes: {}", e)))?
            .items;
        let verdict = evaluate_runtimes(nodes.iter().map(NodeRuntimeReport::from_node), &self.approved_runtime)?;
        match &verdict {
            Compliance::Compliant { nodes_checked } => info!(nodes = nodes_checked, runtime = %self.approved_runtime, "cluster runtime compliant"),
            Compliance::Violation(v) => warn!(node = %v.node_name, runtime = %v.runtime_identifier, "runtime compliance violation"),
        }
        Ok(verdict)
    }
}
