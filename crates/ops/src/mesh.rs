//! Istio `EnvoyFilter` traffic policy objects.

use keel_core::{ControlResult, LabelMap};
use kube::{
    api::{DeleteParams, ListParams, PostParams},
    CustomResource,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::resources::{fetch, fetch_all, replace};
use crate::{access_error, object_name, KubeOps};

#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[kube(group = "networking.istio.io", version = "v1alpha3", kind = "EnvoyFilter", namespaced, schema = "disabled")]
#[serde(rename_all = "camelCase")]
pub struct EnvoyFilterSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workload_selector: Option<WorkloadSelector>,
    /// Patches are passed through verbatim; their schema belongs to Envoy.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub config_patches: Vec<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct WorkloadSelector {
    #[serde(default)]
    pub labels: LabelMap,
}

impl KubeOps {
    pub async fn create_envoy_filter(&self, namespace: &str, filter: &EnvoyFilter) -> ControlResult<EnvoyFilter> {
        let name = object_name(filter)?;
        let api = self.namespaced::<EnvoyFilter>(namespace)?;
        let created = api
            .create(&PostParams::default(), filter)
            .await
            .map_err(|e| access_error(format!("create EnvoyFilter {}/{}", namespace, name), e))?;
        info!(ns = %namespace, name = %name, "envoy filter created");
        Ok(created)
    }

    pub async fn get_envoy_filter(&self, namespace: &str, name: &str) -> ControlResult<Option<EnvoyFilter>> {
        fetch(&self.namespaced::<EnvoyFilter>(namespace)?, name).await
    }

    pub async fn list_envoy_filters(&self, namespace: &str) -> ControlResult<Vec<EnvoyFilter>> {
        fetch_all(&self.namespaced::<EnvoyFilter>(namespace)?, &ListParams::default()).await
    }

    pub async fn update_envoy_filter(&self, namespace: &str, filter: &EnvoyFilter) -> ControlResult<Option<EnvoyFilter>> {
        replace(&self.namespaced::<EnvoyFilter>(namespace)?, filter).await
    }

    /// `false` when there was nothing to delete.
    pub async fn delete_envoy_filter(&self, namespace: &str, name: &str) -> ControlResult<bool> {
        let api = self.namespaced::<EnvoyFilter>(namespace)?;
        match api.delete(name, &DeleteParams::background()).await {
            Ok(_) => {
                info!(ns = %namespace, name = %name, "envoy filter deleted");
                Ok(true)
            }
            Err(e) if keel_kubehub::is_not_found(&e) => {
                debug!(ns = %namespace, name = %name, "envoy filter already absent");
                Ok(false)
            }
            Err(e) => Err(access_error(format!("delete EnvoyFilter {}/{}", namespace, name), e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::Resource;

    #[test]
    fn resource_identity() {
        assert_eq!(EnvoyFilter::group(&()), "networking.istio.io");
        assert_eq!(EnvoyFilter::version(&()), "v1alpha3");
        assert_eq!(EnvoyFilter::plural(&()), "envoyfilters");
    }

    #[test]
    fn spec_uses_camel_case_and_keeps_patches() {
        let raw = serde_json::json!({
            "apiVersion": "networking.istio.io/v1alpha3",
            "kind": "EnvoyFilter",
            "metadata": { "name": "lua", "namespace": "shop" },
            "spec": {
                "workloadSelector": { "labels": { "app": "web" } },
                "configPatches": [{ "applyTo": "HTTP_FILTER", "patch": { "operation": "INSERT_BEFORE" } }],
                "priority": 10
            }
        });
        let ef: EnvoyFilter = serde_json::from_value(raw).expect("decode");
        assert_eq!(ef.spec.priority, Some(10));
        assert_eq!(ef.spec.config_patches[0]["applyTo"], "HTTP_FILTER");
        let labels = &ef.spec.workload_selector.as_ref().expect("selector").labels;
        assert_eq!(labels.get("app").map(String::as_str), Some("web"));

        let back = serde_json::to_value(&ef).expect("encode");
        assert!(back["spec"].get("workloadSelector").is_some());
        assert!(back["spec"].get("workload_selector").is_none());
    }

    #[test]
    fn empty_spec_serializes_compactly() {
        let ef = EnvoyFilter::new("noop", EnvoyFilterSpec::default());
        let v = serde_json::to_value(&ef).expect("encode");
        assert_eq!(v["spec"], serde_json::json!({}));
    }
}
