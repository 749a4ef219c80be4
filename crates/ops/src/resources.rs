use std::fmt::Debug;

use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Service, ServicePort};
use keel_core::{ControlResult, LabelMap, ResourceCoordinate};
use kube::{
    api::{Api, ListParams, PostParams},
    core::DynamicObject,
    Resource,
};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, info};

use crate::{access_error, object_name, KubeOps};

/// Generic key of the cluster-scoped CRD collection.
pub const CRD_COORDINATE: &str = "apiextensions.k8s.io/v1/customresourcedefinitions";

fn kind_of<K>() -> String
where
    K: Resource,
    <K as Resource>::DynamicType: Default,
{
    K::kind(&Default::default()).into_owned()
}

pub(crate) async fn fetch<K>(api: &Api<K>, name: &str) -> ControlResult<Option<K>>
where
    K: Resource + Clone + DeserializeOwned + Debug,
    <K as Resource>::DynamicType: Default,
{
    let found = api
        .get_opt(name)
        .await
        .map_err(|e| access_error(format!("get {} {}", kind_of::<K>(), name), e))?;
    if found.is_none() {
        debug!(kind = %kind_of::<K>(), name = %name, "not found");
    }
    Ok(found)
}

pub(crate) async fn fetch_all<K>(api: &Api<K>, lp: &ListParams) -> ControlResult<Vec<K>>
where
    K: Resource + Clone + DeserializeOwned + Debug,
    <K as Resource>::DynamicType: Default,
{
    let items = api
        .list(lp)
        .await
        .map_err(|e| access_error(format!("list {}", kind_of::<K>()), e))?
        .items;
    debug!(kind = %kind_of::<K>(), count = items.len(), "listed");
    Ok(items)
}

pub(crate) async fn replace<K>(api: &Api<K>, obj: &K) -> ControlResult<Option<K>>
where
    K: Resource + Clone + Serialize + DeserializeOwned + Debug,
    <K as Resource>::DynamicType: Default,
{
    let name = object_name(obj)?;
    match api.replace(&name, &PostParams::default(), obj).await {
        Ok(updated) => {
            info!(kind = %kind_of::<K>(), name = %name, "replaced");
            Ok(Some(updated))
        }
        Err(e) if keel_kubehub::is_not_found(&e) => {
            debug!(kind = %kind_of::<K>(), name = %name, "update target not found");
            Ok(None)
        }
        Err(e) => Err(access_error(format!("update {} {}", kind_of::<K>(), name), e)),
    }
}

impl KubeOps {
    pub async fn get_service(&self, namespace: &str, name: &str) -> ControlResult<Option<Service>> {
        fetch(&self.namespaced::<Service>(namespace)?, name).await
    }

    pub async fn list_services(&self, namespace: &str) -> ControlResult<Vec<Service>> {
        fetch_all(&self.namespaced::<Service>(namespace)?, &ListParams::default()).await
    }

    /// Full replacement; `None` when the service no longer exists.
    pub async fn update_service(&self, namespace: &str, service: &Service) -> ControlResult<Option<Service>> {
        replace(&self.namespaced::<Service>(namespace)?, service).await
    }

    /// Declared ports of a service, read through the generic accessor.
    pub async fn service_ports(&self, namespace: &str, name: &str) -> ControlResult<Option<Vec<ServicePort>>> {
        let svc = self.service_via_accessor(namespace, name).await?;
        Ok(svc.map(|s| s.spec.and_then(|spec| spec.ports).unwrap_or_default()))
    }

    /// Declared selector of a service, read through the generic accessor.
    pub async fn service_selector(&self, namespace: &str, name: &str) -> ControlResult<Option<LabelMap>> {
        let svc = self.service_via_accessor(namespace, name).await?;
        Ok(svc.map(|s| s.spec.and_then(|spec| spec.selector).unwrap_or_default()))
    }

    async fn service_via_accessor(&self, namespace: &str, name: &str) -> ControlResult<Option<Service>> {
        let coord = ResourceCoordinate::new("", "v1", "services").in_namespace(namespace).named(name);
        keel_kubehub::get_as::<Service>(&self.profile, &coord).await
    }

    pub async fn get_deployment(&self, namespace: &str, name: &str) -> ControlResult<Option<Deployment>> {
        fetch(&self.namespaced::<Deployment>(namespace)?, name).await
    }

    pub async fn list_deployments(&self, namespace: &str) -> ControlResult<Vec<Deployment>> {
        fetch_all(&self.namespaced::<Deployment>(namespace)?, &ListParams::default()).await
    }

    pub async fn update_deployment(&self, namespace: &str, deployment: &Deployment) -> ControlResult<Option<Deployment>> {
        replace(&self.namespaced::<Deployment>(namespace)?, deployment).await
    }

    pub async fn get_daemonset(&self, namespace: &str, name: &str) -> ControlResult<Option<DaemonSet>> {
        fetch(&self.namespaced::<DaemonSet>(namespace)?, name).await
    }

    pub async fn get_configmap(&self, namespace: &str, name: &str) -> ControlResult<Option<ConfigMap>> {
        fetch(&self.namespaced::<ConfigMap>(namespace)?, name).await
    }

    pub async fn list_namespaces(&self) -> ControlResult<Vec<Namespace>> {
        fetch_all(&self.cluster::<Namespace>()?, &ListParams::default()).await
    }

    pub async fn get_namespace(&self, name: &str) -> ControlResult<Option<Namespace>> {
        fetch(&self.cluster::<Namespace>()?, name).await
    }

    /// CRDs stay unstructured; callers only inspect a few fields.
    pub async fn get_crd(&self, name: &str) -> ControlResult<Option<DynamicObject>> {
        let coord: ResourceCoordinate = CRD_COORDINATE.parse()?;
        keel_kubehub::get(&self.profile, &coord.named(name)).await
    }

    pub async fn resource_definition_exists(&self, name: &str) -> ControlResult<bool> {
        let exists = self.get_crd(name).await?.is_some();
        debug!(crd = %name, exists, "resource definition lookup");
        Ok(exists)
    }
}
