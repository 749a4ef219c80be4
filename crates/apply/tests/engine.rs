#![forbid(unsafe_code)]

use keel_apply::ManifestEngine;
use keel_core::{ConnectionProfile, ControlError};
use wiremock::matchers::{body_partial_json, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const CONFIGMAP: &str = "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: cfg\ndata:\n  k: v\n";

async fn mount_core_discovery(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/api/v1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "kind": "APIResourceList",
            "groupVersion": "v1",
            "resources": [
                {
                    "name": "configmaps",
                    "singularName": "configmap",
                    "namespaced": true,
                    "kind": "ConfigMap",
                    "verbs": ["create", "delete", "get", "list", "patch", "update", "watch"]
                },
                {
                    "name": "namespaces",
                    "singularName": "namespace",
                    "namespaced": false,
                    "kind": "Namespace",
                    "verbs": ["create", "delete", "get", "list", "patch", "update", "watch"]
                }
            ]
        })))
        .mount(server)
        .await;
}

fn configmap_json(name: &str, ns: &str) -> serde_json::Value {
    serde_json::json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": { "name": name, "namespace": ns, "resourceVersion": "1" },
        "data": { "k": "v" }
    })
}

fn engine(server: &MockServer, scratch: &std::path::Path) -> ManifestEngine {
    ManifestEngine::new(ConnectionProfile::new(server.uri(), "t")).with_scratch_dir(scratch)
}

fn scratch_entries(dir: &std::path::Path) -> usize {
    std::fs::read_dir(dir).expect("read_dir").count()
}

#[tokio::test]
async fn apply_content_uses_server_side_apply_and_cleans_up() {
    let server = MockServer::start().await;
    mount_core_discovery(&server).await;
    Mock::given(method("PATCH"))
        .and(path("/api/v1/namespaces/default/configmaps/cfg"))
        .and(query_param("fieldManager", "keel"))
        .respond_with(ResponseTemplate::new(200).set_body_json(configmap_json("cfg", "default")))
        .expect(1)
        .mount(&server)
        .await;

    let scratch = tempfile::tempdir().expect("tempdir");
    let outcome = engine(&server, scratch.path()).apply_content(CONFIGMAP).await.expect("apply");
    assert_eq!(outcome.objects.len(), 1);
    assert_eq!(outcome.objects[0].namespace.as_deref(), Some("default"));
    assert_eq!(scratch_entries(scratch.path()), 0);
}

#[tokio::test]
async fn apply_failure_is_apply_error_and_still_cleans_up() {
    let server = MockServer::start().await;
    mount_core_discovery(&server).await;
    Mock::given(method("PATCH"))
        .and(path("/api/v1/namespaces/default/configmaps/cfg"))
        .respond_with(ResponseTemplate::new(422).set_body_json(serde_json::json!({
            "kind": "Status",
            "apiVersion": "v1",
            "metadata": {},
            "status": "Failure",
            "message": "ConfigMap \"cfg\" is invalid",
            "reason": "Invalid",
            "code": 422
        })))
        .mount(&server)
        .await;

    let scratch = tempfile::tempdir().expect("tempdir");
    let err = engine(&server, scratch.path()).apply_content(CONFIGMAP).await.unwrap_err();
    match err {
        ControlError::Apply(msg) => assert!(msg.contains("ConfigMap/cfg"), "{}", msg),
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(scratch_entries(scratch.path()), 0);
}

#[tokio::test]
async fn later_objects_are_attempted_after_an_earlier_failure() {
    let server = MockServer::start().await;
    mount_core_discovery(&server).await;
    Mock::given(method("PATCH"))
        .and(path("/api/v1/namespaces/shop/configmaps/bad"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;
    Mock::given(method("PATCH"))
        .and(path("/api/v1/namespaces/shop/configmaps/good"))
        .respond_with(ResponseTemplate::new(200).set_body_json(configmap_json("good", "shop")))
        .expect(1)
        .mount(&server)
        .await;

    let text = "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: bad\n  namespace: shop\n---\napiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: good\n  namespace: shop\n";
    let scratch = tempfile::tempdir().expect("tempdir");
    let err = engine(&server, scratch.path()).apply_content(text).await.unwrap_err();
    match err {
        ControlError::Apply(msg) => {
            assert!(msg.contains("ConfigMap/bad"), "{}", msg);
            assert!(!msg.contains("ConfigMap/good"), "{}", msg);
        }
        other => panic!("unexpected error: {:?}", other),
    }
}

#[tokio::test]
async fn cluster_scoped_objects_get_no_namespace() {
    let server = MockServer::start().await;
    mount_core_discovery(&server).await;
    Mock::given(method("PATCH"))
        .and(path("/api/v1/namespaces/shop"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "apiVersion": "v1",
            "kind": "Namespace",
            "metadata": { "name": "shop" }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().expect("tempdir");
    let file = dir.path().join("ns.yaml");
    std::fs::write(&file, "apiVersion: v1\nkind: Namespace\nmetadata:\n  name: shop\n").expect("write");
    let outcome = ManifestEngine::new(ConnectionProfile::new(server.uri(), "t")).apply(&[&file]).await.expect("apply");
    assert_eq!(outcome.objects[0].namespace, None);
}

#[tokio::test]
async fn delete_content_uses_background_propagation() {
    let server = MockServer::start().await;
    mount_core_discovery(&server).await;
    Mock::given(method("DELETE"))
        .and(path("/api/v1/namespaces/default/configmaps/cfg"))
        .and(body_partial_json(serde_json::json!({ "propagationPolicy": "Background" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "kind": "Status",
            "apiVersion": "v1",
            "metadata": {},
            "status": "Success",
            "details": { "name": "cfg", "kind": "configmaps" }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let scratch = tempfile::tempdir().expect("tempdir");
    let outcome = engine(&server, scratch.path()).delete_content(CONFIGMAP).await.expect("delete");
    assert_eq!(outcome.objects[0].name, "cfg");
    assert_eq!(scratch_entries(scratch.path()), 0);
}

#[tokio::test]
async fn delete_of_missing_object_is_delete_error() {
    let server = MockServer::start().await;
    mount_core_discovery(&server).await;
    Mock::given(method("DELETE"))
        .and(path("/api/v1/namespaces/default/configmaps/cfg"))
        .respond_with(ResponseTemplate::new(404).set_body_json(serde_json::json!({
            "kind": "Status",
            "apiVersion": "v1",
            "metadata": {},
            "status": "Failure",
            "message": "configmaps \"cfg\" not found",
            "reason": "NotFound",
            "code": 404
        })))
        .mount(&server)
        .await;

    let scratch = tempfile::tempdir().expect("tempdir");
    let err = engine(&server, scratch.path()).delete_content(CONFIGMAP).await.unwrap_err();
    assert!(matches!(err, ControlError::Delete(_)), "{:?}", err);
    assert_eq!(scratch_entries(scratch.path()), 0);
}

#[tokio::test]
async fn malformed_content_fails_before_contacting_the_cluster() {
    let server = MockServer::start().await;
    let scratch = tempfile::tempdir().expect("tempdir");
    let err = engine(&server, scratch.path()).apply_content("kind: ConfigMap\nmetadata:\n  name: x\n").await.unwrap_err();
    match err {
        ControlError::Apply(msg) => assert!(msg.contains("missing apiVersion"), "{}", msg),
        other => panic!("unexpected error: {:?}", other),
    }
    assert!(server.received_requests().await.unwrap_or_default().is_empty());
    assert_eq!(scratch_entries(scratch.path()), 0);

    let err = engine(&server, scratch.path()).apply_content("").await.unwrap_err();
    assert!(matches!(err, ControlError::Apply(_)));
}

#[tokio::test]
async fn unwritable_scratch_dir_is_reported() {
    let server = MockServer::start().await;
    let scratch = tempfile::tempdir().expect("tempdir");
    let missing = scratch.path().join("does-not-exist");
    let err = engine(&server, &missing).delete_content(CONFIGMAP).await.unwrap_err();
    assert!(matches!(err, ControlError::Delete(_)), "{:?}", err);
}
