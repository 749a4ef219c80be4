use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use keel_core::{ControlResult, LabelMap};
use kube::api::ListParams;
use tracing::{debug, info};

use crate::resources::fetch_all;
use crate::KubeOps;

/// True when every pair in `labels` appears in the service's selector. Extra selector keys
/// do not disqualify; an empty `labels` matches every service.
pub fn service_matches_selector(service: &Service, labels: &LabelMap) -> bool {
    let empty = LabelMap::new();
    let selector = service.spec.as_ref().and_then(|s| s.selector.as_ref()).unwrap_or(&empty);
    labels.iter().all(|(k, v)| selector.get(k) == Some(v))
}

/// `k1=v1,k2=v2` in key order, as the API server's equality-based label selector.
pub fn selector_string(labels: &LabelMap) -> String {
    labels.iter().map(|(k, v)| format!("{}={}", k, v)).collect::<Vec<_>>().join(",")
}

impl KubeOps {
    /// Services in `namespace` whose selector contains `labels`, in cluster order.
    pub async fn list_services_matching(&self, namespace: &str, labels: &LabelMap) -> ControlResult<Vec<Service>> {
        let all = self.list_services(namespace).await?;
        let total = all.len();
        let matched: Vec<_> = all.into_iter().filter(|svc| service_matches_selector(svc, labels)).collect();
        debug!(ns = %namespace, total, matched = matched.len(), "services filtered by selector");
        Ok(matched)
    }

    /// Deployments selected by the named service's own selector. `None` when the service is absent;
    /// a service without a selector routes to nothing.
    pub async fn deployments_behind_service(&self, namespace: &str, service: &str) -> ControlResult<Option<Vec<Deployment>>> {
        let Some(svc) = self.get_service(namespace, service).await? else {
            return Ok(None);
        };
        let selector = svc.spec.and_then(|s| s.selector).unwrap_or_default();
        if selector.is_empty() {
            debug!(ns = %namespace, service = %service, "service has no selector");
            return Ok(Some(Vec::new()));
        }
        let lp = ListParams::default().labels(&selector_string(&selector));
        let deployments = fetch_all(&self.namespaced::<Deployment>(namespace)?, &lp).await?;
        info!(ns = %namespace, service = %service, count = deployments.len(), "resolved backing deployments");
        Ok(Some(deployments))
    }
}
