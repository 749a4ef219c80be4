//! Keel public API façade (in-process).
//!
//! This crate defines the trait callers (the CLI, an HTTP layer) depend on. `InProcControl`
//! talks to a cluster directly; `MockControl` returns canned answers for tests.

#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Instant;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Namespace, Service};
use keel_core::{ConnectionProfile, ControlError, ControlResult, LabelMap, ResourceCoordinate};
use kube::core::DynamicObject;
use tracing::info;

pub use keel_apply::{ManifestEngine, ManifestOutcome, ObjectRef};
pub use keel_ops::{Compliance, ComplianceViolation, KubeOps, WorkloadKind};

/// Cluster control surface exposed upward.
#[async_trait::async_trait]
pub trait ClusterControl: Send + Sync {
    /// Server-side apply every object found in the given files or directories.
    async fn apply_manifests(&self, sources: &[PathBuf]) -> ControlResult<ManifestOutcome>;

    async fn delete_manifests(&self, sources: &[PathBuf]) -> ControlResult<ManifestOutcome>;

    /// Apply a manifest held in memory (YAML or JSON, possibly multi-document).
    async fn apply_content(&self, text: &str) -> ControlResult<ManifestOutcome>;

    async fn delete_content(&self, text: &str) -> ControlResult<ManifestOutcome>;

    /// Schema-less read. `None` when the object does not exist.
    async fn get_resource(&self, coord: &ResourceCoordinate) -> ControlResult<Option<DynamicObject>>;

    /// Schema-less full replacement. `None` when the object does not exist.
    async fn update_resource(&self, coord: &ResourceCoordinate, obj: &DynamicObject) -> ControlResult<Option<DynamicObject>>;

    async fn list_resources(&self, coord: &ResourceCoordinate) -> ControlResult<Vec<DynamicObject>>;

    async fn services_matching(&self, namespace: &str, labels: &LabelMap) -> ControlResult<Vec<Service>>;

    async fn deployments_behind_service(&self, namespace: &str, service: &str) -> ControlResult<Option<Vec<Deployment>>>;

    async fn restart_workload(&self, kind: WorkloadKind, namespace: &str, name: &str) -> ControlResult<()>;

    async fn resource_definition_exists(&self, name: &str) -> ControlResult<bool>;

    async fn check_node_runtime(&self) -> ControlResult<Compliance>;

    async fn list_namespaces(&self) -> ControlResult<Vec<Namespace>>;
}

/// Direct implementation over kube-rs. Every call builds its own client.
#[derive(Debug, Clone)]
pub struct InProcControl {
    ops: KubeOps,
    engine: ManifestEngine,
}

impl InProcControl {
    pub fn new(profile: ConnectionProfile) -> Self {
        Self { ops: KubeOps::new(profile.clone()), engine: ManifestEngine::new(profile) }
    }

    pub fn with_parts(ops: KubeOps, engine: ManifestEngine) -> Self {
        Self { ops, engine }
    }

    /// Typed operations not surfaced on the trait (config maps, daemonsets, envoy filters).
    pub fn ops(&self) -> &KubeOps {
        &self.ops
    }

    pub fn engine(&self) -> &ManifestEngine {
        &self.engine
    }
}

#[async_trait::async_trait]
impl ClusterControl for InProcControl {
    async fn apply_manifests(&self, sources: &[PathBuf]) -> ControlResult<ManifestOutcome> {
        let t0 = Instant::now();
        info!(sources = sources.len(), "api: apply start");
        let res = self.engine.apply(sources).await;
        info!(took_ms = %t0.elapsed().as_millis(), ok = res.is_ok(), "api: apply done");
        res
    }

    async fn delete_manifests(&self, sources: &[PathBuf]) -> ControlResult<ManifestOutcome> {
        let t0 = Instant::now();
        info!(sources = sources.len(), "api: delete start");
        let res = self.engine.delete(sources).await;
        info!(took_ms = %t0.elapsed().as_millis(), ok = res.is_ok(), "api: delete done");
        res
    }

    async fn apply_content(&self, text: &str) -> ControlResult<ManifestOutcome> {
        let t0 = Instant::now();
        info!(bytes = text.len(), "api: apply_content start");
        let res = self.engine.apply_content(text).await;
        info!(took_ms = %t0.elapsed().as_millis(), ok = res.is_ok(), "api: apply_content done");
        res
    }

    async fn delete_content(&self, text: &str) -> ControlResult<ManifestOutcome> {
        let t0 = Instant::now();
        info!(bytes = text.len(), "api: delete_content start");
        let res = self.engine.delete_content(text).await;
        info!(took_ms = %t0.elapsed().as_millis(), ok = res.is_ok(), "api: delete_content done");
        res
    }

    async fn get_resource(&self, coord: &ResourceCoordinate) -> ControlResult<Option<DynamicObject>> {
        let t0 = Instant::now();
        let res = keel_kubehub::get(self.ops.profile(), coord).await;
        info!(coord = %coord, took_ms = %t0.elapsed().as_millis(), found = matches!(res, Ok(Some(_))), "api: get");
        res
    }

    async fn update_resource(&self, coord: &ResourceCoordinate, obj: &DynamicObject) -> ControlResult<Option<DynamicObject>> {
        let t0 = Instant::now();
        let res = keel_kubehub::update(self.ops.profile(), coord, obj).await;
        info!(coord = %coord, took_ms = %t0.elapsed().as_millis(), ok = res.is_ok(), "api: update");
        res
    }

    async fn list_resources(&self, coord: &ResourceCoordinate) -> ControlResult<Vec<DynamicObject>> {
        keel_kubehub::list(self.ops.profile(), coord).await
    }

    async fn services_matching(&self, namespace: &str, labels: &LabelMap) -> ControlResult<Vec<Service>> {
        self.ops.list_services_matching(namespace, labels).await
    }

    async fn deployments_behind_service(&self, namespace: &str, service: &str) -> ControlResult<Option<Vec<Deployment>>> {
        self.ops.deployments_behind_service(namespace, service).await
    }

    async fn restart_workload(&self, kind: WorkloadKind, namespace: &str, name: &str) -> ControlResult<()> {
        self.ops.restart_workload(kind, namespace, name).await
    }

    async fn resource_definition_exists(&self, name: &str) -> ControlResult<bool> {
        self.ops.resource_definition_exists(name).await
    }

    async fn check_node_runtime(&self) -> ControlResult<Compliance> {
        let t0 = Instant::now();
        let res = self.ops.check_node_runtime().await;
        info!(took_ms = %t0.elapsed().as_millis(), compliant = matches!(res, Ok(Compliance::Compliant { .. })), "api: check_node_runtime");
        res
    }

    async fn list_namespaces(&self) -> ControlResult<Vec<Namespace>> {
        self.ops.list_namespaces().await
    }
}

// ----------------- Mock implementation -----------------

/// Canned answers for tests. Unset answers fail with a `ResourceAccess` error.
#[derive(Default)]
pub struct MockControl {
    pub outcome: Option<ManifestOutcome>,
    pub objects: Vec<DynamicObject>,
    pub services: Vec<Service>,
    pub deployments: Option<Vec<Deployment>>,
    pub crds: Vec<String>,
    pub compliance: Option<Compliance>,
    pub namespaces: Vec<Namespace>,
    /// Every `restart_workload` call, in order.
    pub restarts: Mutex<Vec<(WorkloadKind, String, String)>>,
}

impl MockControl {
    pub fn new() -> Self {
        Self::default()
    }

    fn canned<T: Clone>(value: &Option<T>, what: &str) -> ControlResult<T> {
        value.clone().ok_or_else(|| ControlError::ResourceAccess(format!("mock: no {} configured", what)))
    }

    fn matches(obj: &DynamicObject, coord: &ResourceCoordinate) -> bool {
        let api_version = obj.types.as_ref().map(|t| t.api_version.as_str()).unwrap_or_default();
        api_version == coord.api_version()
            && (coord.namespace.is_none() || obj.metadata.namespace == coord.namespace)
            && (coord.name.is_none() || obj.metadata.name == coord.name)
    }
}

#[async_trait::async_trait]
impl ClusterControl for MockControl {
    async fn apply_manifests(&self, _sources: &[PathBuf]) -> ControlResult<ManifestOutcome> {
        Self::canned(&self.outcome, "manifest outcome")
    }

    async fn delete_manifests(&self, _sources: &[PathBuf]) -> ControlResult<ManifestOutcome> {
        Self::canned(&self.outcome, "manifest outcome")
    }

    async fn apply_content(&self, _text: &str) -> ControlResult<ManifestOutcome> {
        Self::canned(&self.outcome, "manifest outcome")
    }

    async fn delete_content(&self, _text: &str) -> ControlResult<ManifestOutcome> {
        Self::canned(&self.outcome, "manifest outcome")
    }

    async fn get_resource(&self, coord: &ResourceCoordinate) -> ControlResult<Option<DynamicObject>> {
        Ok(self.objects.iter().find(|o| Self::matches(o, coord)).cloned())
    }

    async fn update_resource(&self, coord: &ResourceCoordinate, obj: &DynamicObject) -> ControlResult<Option<DynamicObject>> {
        Ok(self.objects.iter().any(|o| Self::matches(o, coord)).then(|| obj.clone()))
    }

    async fn list_resources(&self, coord: &ResourceCoordinate) -> ControlResult<Vec<DynamicObject>> {
        Ok(self.objects.iter().filter(|o| Self::matches(o, coord)).cloned().collect())
    }

    async fn services_matching(&self, _namespace: &str, labels: &LabelMap) -> ControlResult<Vec<Service>> {
        Ok(self.services.iter().filter(|s| keel_ops::service_matches_selector(s, labels)).cloned().collect())
    }

    async fn deployments_behind_service(&self, _namespace: &str, _service: &str) -> ControlResult<Option<Vec<Deployment>>> {
        Ok(self.deployments.clone())
    }

    async fn restart_workload(&self, kind: WorkloadKind, namespace: &str, name: &str) -> ControlResult<()> {
        if let Ok(mut calls) = self.restarts.lock() {
            calls.push((kind, namespace.to_string(), name.to_string()));
        }
        Ok(())
    }

    async fn resource_definition_exists(&self, name: &str) -> ControlResult<bool> {
        Ok(self.crds.iter().any(|c| c == name))
    }

    async fn check_node_runtime(&self) -> ControlResult<Compliance> {
        Self::canned(&self.compliance, "compliance verdict")
    }

    async fn list_namespaces(&self) -> ControlResult<Vec<Namespace>> {
        Ok(self.namespaces.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ServiceSpec;

    fn service(name: &str, pairs: &[(&str, &str)]) -> Service {
        let mut svc = Service {
            spec: Some(ServiceSpec {
                selector: Some(pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()),
                ..Default::default()
            }),
            ..Default::default()
        };
        svc.metadata.name = Some(name.into());
        svc
    }

    fn dynamic(api_version: &str, ns: &str, name: &str) -> DynamicObject {
        serde_json::from_value(serde_json::json!({
            "apiVersion": api_version,
            "kind": "Thing",
            "metadata": { "name": name, "namespace": ns }
        }))
        .expect("object")
    }

    #[tokio::test]
    async fn mock_is_usable_as_trait_object() {
        let mock = MockControl {
            services: vec![service("web", &[("app", "web")]), service("db", &[("app", "db")])],
            crds: vec!["envoyfilters.networking.istio.io".into()],
            ..MockControl::new()
        };
        let api: &dyn ClusterControl = &mock;

        let mut wanted = LabelMap::new();
        wanted.insert("app".into(), "web".into());
        let svcs = api.services_matching("shop", &wanted).await.expect("services");
        assert_eq!(svcs.len(), 1);
        assert_eq!(svcs[0].metadata.name.as_deref(), Some("web"));

        assert!(api.resource_definition_exists("envoyfilters.networking.istio.io").await.expect("crd"));
        assert!(!api.resource_definition_exists("widgets.example.io").await.expect("crd"));
    }

    #[tokio::test]
    async fn mock_generic_access_honours_coordinates() {
        let mock = MockControl { objects: vec![dynamic("example.io/v1", "shop", "a"), dynamic("example.io/v1", "ops", "b")], ..MockControl::new() };
        let coord = ResourceCoordinate::new("example.io", "v1", "things").in_namespace("shop");
        assert_eq!(mock.list_resources(&coord).await.expect("list").len(), 1);
        assert!(mock.get_resource(&coord.clone().named("a")).await.expect("get").is_some());
        assert!(mock.get_resource(&coord.clone().named("b")).await.expect("get").is_none());

        let obj = dynamic("example.io/v1", "shop", "zzz");
        assert!(mock.update_resource(&coord.named("zzz"), &obj).await.expect("update").is_none());
    }

    #[tokio::test]
    async fn mock_records_restarts_and_reports_missing_answers() {
        let mock = MockControl::new();
        mock.restart_workload(WorkloadKind::StatefulSet, "db", "pg").await.expect("restart");
        let calls = mock.restarts.lock().expect("lock").clone();
        assert_eq!(calls, vec![(WorkloadKind::StatefulSet, "db".to_string(), "pg".to_string())]);

        let err = mock.check_node_runtime().await.unwrap_err();
        assert!(matches!(err, ControlError::ResourceAccess(_)));
    }

    #[tokio::test]
    async fn in_proc_rejects_empty_token_before_any_call() {
        let api = InProcControl::new(ConnectionProfile::new("https://cluster.example.com", ""));
        let err = api.list_namespaces().await.unwrap_err();
        assert!(matches!(err, ControlError::Configuration(_)), "{:?}", err);
    }
}
