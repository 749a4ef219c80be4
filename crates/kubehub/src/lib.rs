//! Keel kubehub – kube clients built from connection profiles, plus schema-less
//! (group/version/resource) access to arbitrary kinds.

#![forbid(unsafe_code)]

use keel_core::{ConnectionConfig, ConnectionProfile, ControlError, ControlResult, ResourceCoordinate};
use kube::{
    api::{Api, ListParams, PostParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{self, Scope},
    Client, Config,
};
use secrecy::SecretString;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

/// Translate derived connection settings into a kube `Config`.
pub fn kube_config(cfg: &ConnectionConfig) -> ControlResult<Config> {
    let uri: http::Uri = cfg
        .host
        .parse()
        .map_err(|e| ControlError::ClientConstruction(format!("invalid API endpoint {:?}: {}", cfg.host, e)))?;
    if uri.host().map_or(true, str::is_empty) {
        return Err(ControlError::ClientConstruction(format!("API endpoint {:?} has no host", cfg.host)));
    }
    let mut config = Config::new(uri);
    config.accept_invalid_certs = cfg.accept_invalid_certs;
    config.auth_info.token = Some(SecretString::new(cfg.bearer_token.clone()));
    Ok(config)
}

/// Build a fresh client for one operation. Must run inside a tokio runtime.
pub fn client_for(profile: &ConnectionProfile) -> ControlResult<Client> {
    profile.validate()?;
    let config = kube_config(&profile.derive_connection_config())?;
    Client::try_from(config).map_err(|e| ControlError::ClientConstruction(e.to_string()))
}

pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

/// Kind is left empty: request paths only need group, version and plural.
pub fn api_resource(coord: &ResourceCoordinate) -> ApiResource {
    let gvk = GroupVersionKind::gvk(&coord.group, &coord.version, "");
    ApiResource::from_gvk_with_plural(&gvk, &coord.resource)
}

fn dynamic_api(client: Client, coord: &ResourceCoordinate) -> Api<DynamicObject> {
    let ar = api_resource(coord);
    match coord.namespace.as_deref() {
        Some(ns) => Api::namespaced_with(client, ns, &ar),
        None => Api::all_with(client, &ar),
    }
}

fn require_name(coord: &ResourceCoordinate) -> ControlResult<&str> {
    coord
        .name
        .as_deref()
        .ok_or_else(|| ControlError::Configuration(format!("coordinate {} has no name", coord)))
}

/// Fetch one object. `Ok(None)` means the server reported it absent.
pub async fn get(profile: &ConnectionProfile, coord: &ResourceCoordinate) -> ControlResult<Option<DynamicObject>> {
    let name = require_name(coord)?;
    let api = dynamic_api(client_for(profile)?, coord);
    match api.get_opt(name).await {
        Ok(Some(obj)) => Ok(Some(obj)),
        Ok(None) => {
            debug!(coord = %coord, "resource not found");
            Ok(None)
        }
        Err(e) => {
            warn!(coord = %coord, error = %e, "get failed");
            Err(ControlError::ResourceAccess(format!("get {}: {}", coord, e)))
        }
    }
}

/// Fetch one object and decode it into a typed shape.
pub async fn get_as<K: DeserializeOwned>(profile: &ConnectionProfile, coord: &ResourceCoordinate) -> ControlResult<Option<K>> {
    match get(profile, coord).await? {
        Some(obj) => decode(&obj).map(Some),
        None => Ok(None),
    }
}

pub fn decode<K: DeserializeOwned>(obj: &DynamicObject) -> ControlResult<K> {
    let raw = serde_json::to_value(obj).map_err(|e| ControlError::ResourceAccess(format!("encoding object: {}", e)))?;
    serde_json::from_value(raw).map_err(|e| ControlError::ResourceAccess(format!("decoding object: {}", e)))
}

/// Replace an object wholesale (no merge). The name comes from the coordinate,
/// falling back to the object's own metadata.
pub async fn update(
    profile: &ConnectionProfile,
    coord: &ResourceCoordinate,
    obj: &DynamicObject,
) -> ControlResult<Option<DynamicObject>> {
    let name = coord
        .name
        .as_deref()
        .or(obj.metadata.name.as_deref())
        .ok_or_else(|| ControlError::Configuration(format!("coordinate {} and object both lack a name", coord)))?
        .to_string();
    let api = dynamic_api(client_for(profile)?, coord);
    match api.replace(&name, &PostParams::default(), obj).await {
        Ok(updated) => Ok(Some(updated)),
        Err(e) if is_not_found(&e) => {
            debug!(coord = %coord, name = %name, "update target not found");
            Ok(None)
        }
        Err(e) => {
            warn!(coord = %coord, name = %name, error = %e, "update failed");
            Err(ControlError::ResourceAccess(format!("update {} {}: {}", coord, name, e)))
        }
    }
}

/// List every object under the coordinate's namespace, or cluster-wide without one.
pub async fn list(profile: &ConnectionProfile, coord: &ResourceCoordinate) -> ControlResult<Vec<DynamicObject>> {
    let api = dynamic_api(client_for(profile)?, coord);
    let items = api
        .list(&ListParams::default())
        .await
        .map_err(|e| ControlError::ResourceAccess(format!("list {}: {}", coord, e)))?
        .items;
    debug!(coord = %coord, count = items.len(), "listed");
    Ok(items)
}

/// Resolve a kind to its API resource via the server's discovery for that group/version only.
/// Returns the resource and whether it is namespaced.
pub async fn resolve_kind(client: &Client, gvk: &GroupVersionKind) -> kube::Result<(ApiResource, bool)> {
    let (ar, caps) = discovery::pinned_kind(client, gvk).await?;
    Ok((ar, matches!(caps.scope, Scope::Namespaced)))
}

/// Split `group/version` (or a bare core `version`) and pair it with a kind.
pub fn gvk_from_api_version(api_version: &str, kind: &str) -> GroupVersionKind {
    match api_version.split_once('/') {
        Some((group, version)) => GroupVersionKind::gvk(group, version, kind),
        None => GroupVersionKind::gvk("", api_version, kind),
    }
}
