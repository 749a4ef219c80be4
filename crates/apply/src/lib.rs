//! Keel apply: declarative apply and cascading delete of manifest files or raw manifest text.

#![forbid(unsafe_code)]

mod transient;

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use keel_core::{ConnectionProfile, ControlError, ControlResult};
use kube::{
    api::{Api, DeleteParams, Patch, PatchParams},
    core::{ApiResource, DynamicObject},
    Client,
};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::{debug, info, warn};

pub use transient::TransientManifest;

pub const FIELD_MANAGER: &str = "keel";
const DEFAULT_NAMESPACE: &str = "default";
const MANIFEST_EXTENSIONS: [&str; 3] = ["yaml", "yml", "json"];

fn max_yaml_bytes() -> usize {
    std::env::var("KEEL_MAX_YAML_BYTES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(1 << 20) // 1 MiB default
}

fn max_yaml_nodes() -> usize {
    std::env::var("KEEL_MAX_YAML_NODES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(100_000)
}

fn json_node_budget_exceeded(v: &Json, max: usize) -> bool {
    fn walk(v: &Json, cur: &mut usize, max: usize) {
        if *cur >= max { return; }
        *cur += 1;
        match v {
            Json::Object(map) => {
                for (_k, vv) in map.iter() {
                    if *cur >= max { break; }
                    walk(vv, cur, max);
                }
            }
            Json::Array(arr) => {
                for vv in arr.iter() {
                    if *cur >= max { break; }
                    walk(vv, cur, max);
                }
            }
            _ => {}
        }
    }
    // A document of exactly `max` nodes is within budget.
    let limit = max.saturating_add(1);
    let mut count = 0usize;
    walk(v, &mut count, limit);
    count > max
}

/// Identity of one object handled by an apply or delete run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectRef {
    pub api_version: String,
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{} ({})", self.kind, self.name, ns),
            None => write!(f, "{}/{}", self.kind, self.name),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ManifestOutcome {
    pub objects: Vec<ObjectRef>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Apply,
    Delete,
}

impl Mode {
    fn error(self, msg: impl Into<String>) -> ControlError {
        match self {
            Mode::Apply => ControlError::Apply(msg.into()),
            Mode::Delete => ControlError::Delete(msg.into()),
        }
    }

    fn transient_prefix(self) -> &'static str {
        match self {
            Mode::Apply => "applyjson",
            Mode::Delete => "deletejson",
        }
    }
}

/// One manifest object ready to submit.
#[derive(Debug, Clone)]
struct Target {
    body: Json,
    api_version: String,
    kind: String,
    name: String,
    namespace: Option<String>,
}

impl Target {
    fn from_json(body: Json) -> Result<Self, String> {
        let api_version = body.get("apiVersion").and_then(|v| v.as_str()).ok_or("manifest missing apiVersion")?.to_string();
        let kind = body.get("kind").and_then(|v| v.as_str()).ok_or("manifest missing kind")?.to_string();
        let meta = body.get("metadata");
        let name = meta
            .and_then(|m| m.get("name"))
            .and_then(|v| v.as_str())
            .ok_or_else(|| format!("{} manifest missing metadata.name", kind))?
            .to_string();
        let namespace = meta.and_then(|m| m.get("namespace")).and_then(|v| v.as_str()).map(|s| s.to_string());
        Ok(Self { body, api_version, kind, name, namespace })
    }

    fn describe(&self) -> String {
        format!("{}/{}", self.kind, self.name)
    }
}

/// Expand paths non-recursively: a directory contributes the manifest files directly inside it.
fn collect_files<P: AsRef<Path>>(sources: &[P]) -> Result<Vec<PathBuf>, String> {
    let mut out = Vec::new();
    for src in sources {
        let src = src.as_ref();
        let meta = std::fs::metadata(src).map_err(|e| format!("{}: {}", src.display(), e))?;
        if !meta.is_dir() {
            out.push(src.to_path_buf());
            continue;
        }
        let mut entries: Vec<PathBuf> = std::fs::read_dir(src)
            .map_err(|e| format!("{}: {}", src.display(), e))?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_file())
            .filter(|p| {
                p.extension()
                    .and_then(|ext| ext.to_str())
                    .map(|ext| MANIFEST_EXTENSIONS.contains(&ext))
                    .unwrap_or(false)
            })
            .collect();
        entries.sort();
        out.extend(entries);
    }
    Ok(out)
}

/// Split a YAML (or JSON) stream into objects. Empty documents are skipped and
/// `*List` documents contribute their items.
fn parse_documents(text: &str) -> Result<Vec<Json>, String> {
    if text.len() > max_yaml_bytes() {
        return Err(format!("manifest too large (>{} bytes)", max_yaml_bytes()));
    }
    let mut out = Vec::new();
    for doc in serde_yaml::Deserializer::from_str(text) {
        let val = serde_yaml::Value::deserialize(doc).map_err(|e| format!("parsing YAML: {}", e))?;
        if val.is_null() {
            continue;
        }
        let json = serde_json::to_value(val).map_err(|e| format!("converting YAML to JSON: {}", e))?;
        if json_node_budget_exceeded(&json, max_yaml_nodes()) {
            return Err(format!("manifest document too complex (>{} nodes)", max_yaml_nodes()));
        }
        let is_list = json.get("kind").and_then(|k| k.as_str()).map(|k| k.ends_with("List")).unwrap_or(false);
        match json.get("items").and_then(|i| i.as_array()) {
            Some(items) if is_list => out.extend(items.iter().cloned()),
            _ => out.push(json),
        }
    }
    Ok(out)
}

fn ensure_namespace(v: &mut Json, ns: &str) {
    if let Some(obj) = v.as_object_mut() {
        let meta = obj.entry("metadata").or_insert_with(|| Json::Object(serde_json::Map::new()));
        if let Some(meta) = meta.as_object_mut() {
            meta.insert("namespace".into(), Json::String(ns.to_string()));
        }
    }
}

/// Applies or deletes manifests against the cluster named by a connection profile.
#[derive(Debug, Clone)]
pub struct ManifestEngine {
    profile: ConnectionProfile,
    scratch_dir: PathBuf,
    default_namespace: String,
}

impl ManifestEngine {
    /// Scratch files go to `KEEL_SCRATCH_DIR`, or the system temp directory.
    pub fn new(profile: ConnectionProfile) -> Self {
        let scratch_dir = std::env::var_os("KEEL_SCRATCH_DIR").map(PathBuf::from).unwrap_or_else(std::env::temp_dir);
        Self { profile, scratch_dir, default_namespace: DEFAULT_NAMESPACE.to_string() }
    }

    pub fn with_scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = dir.into();
        self
    }

    /// Namespace for namespaced objects whose manifest does not name one.
    pub fn with_default_namespace(mut self, ns: impl Into<String>) -> Self {
        self.default_namespace = ns.into();
        self
    }

    /// Server-side apply every object found in `sources`.
    pub async fn apply<P: AsRef<Path>>(&self, sources: &[P]) -> ControlResult<ManifestOutcome> {
        let t0 = std::time::Instant::now();
        counter!("apply_attempts", 1u64);
        let res = self.run(Mode::Apply, sources).await;
        match &res {
            Ok(outcome) => {
                histogram!("apply_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
                counter!("apply_ok", 1u64);
                info!(objects = outcome.objects.len(), "apply finished");
            }
            Err(e) => {
                counter!("apply_err", 1u64);
                warn!(error = %e, "apply failed");
            }
        }
        res
    }

    /// Delete every object found in `sources`, letting dependents go in the background.
    pub async fn delete<P: AsRef<Path>>(&self, sources: &[P]) -> ControlResult<ManifestOutcome> {
        let res = self.run(Mode::Delete, sources).await;
        match &res {
            Ok(outcome) => {
                counter!("delete_ok", 1u64);
                info!(objects = outcome.objects.len(), "delete finished");
            }
            Err(e) => {
                counter!("delete_err", 1u64);
                warn!(error = %e, "delete failed");
            }
        }
        res
    }

    /// Apply raw manifest text (YAML or JSON) via a transient file.
    pub async fn apply_content(&self, text: &str) -> ControlResult<ManifestOutcome> {
        let manifest = self.write_transient(Mode::Apply, text)?;
        self.apply(&[manifest.path()]).await
    }

    /// Delete the objects described by raw manifest text via a transient file.
    pub async fn delete_content(&self, text: &str) -> ControlResult<ManifestOutcome> {
        let manifest = self.write_transient(Mode::Delete, text)?;
        self.delete(&[manifest.path()]).await
    }

    fn write_transient(&self, mode: Mode, text: &str) -> ControlResult<TransientManifest> {
        TransientManifest::create(&self.scratch_dir, mode.transient_prefix(), text)
            .map_err(|e| mode.error(format!("writing transient manifest in {}: {}", self.scratch_dir.display(), e)))
    }

    async fn run<P: AsRef<Path>>(&self, mode: Mode, sources: &[P]) -> ControlResult<ManifestOutcome> {
        let files = collect_files(sources).map_err(|e| mode.error(e))?;
        let mut targets = Vec::new();
        for file in &files {
            let text = std::fs::read_to_string(file).map_err(|e| mode.error(format!("{}: {}", file.display(), e)))?;
            for doc in parse_documents(&text).map_err(|e| mode.error(format!("{}: {}", file.display(), e)))? {
                targets.push(Target::from_json(doc).map_err(|e| mode.error(format!("{}: {}", file.display(), e)))?);
            }
        }
        if targets.is_empty() {
            return Err(mode.error("no objects found in manifest sources"));
        }
        debug!(files = files.len(), objects = targets.len(), ?mode, "manifests loaded");

        let client = keel_kubehub::client_for(&self.profile)?;
        let mut kinds: HashMap<String, (ApiResource, bool)> = HashMap::new();
        let mut done = Vec::with_capacity(targets.len());
        let mut failures = Vec::new();
        for target in targets {
            match self.submit(&client, &mut kinds, mode, target.clone()).await {
                Ok(obj) => done.push(obj),
                Err(e) => {
                    warn!(object = %target.describe(), error = %e, ?mode, "object failed");
                    failures.push(format!("{}: {}", target.describe(), e));
                }
            }
        }
        if !failures.is_empty() {
            return Err(mode.error(failures.join("; ")));
        }
        Ok(ManifestOutcome { objects: done })
    }

    async fn submit(
        &self,
        client: &Client,
        kinds: &mut HashMap<String, (ApiResource, bool)>,
        mode: Mode,
        mut target: Target,
    ) -> Result<ObjectRef, String> {
        let key = format!("{}/{}", target.api_version, target.kind);
        let (ar, namespaced) = match kinds.get(&key) {
            Some(found) => found.clone(),
            None => {
                let gvk = keel_kubehub::gvk_from_api_version(&target.api_version, &target.kind);
                let found = keel_kubehub::resolve_kind(client, &gvk)
                    .await
                    .map_err(|e| format!("resolving {}: {}", key, e))?;
                kinds.insert(key, found.clone());
                found
            }
        };

        let namespace = if namespaced {
            let ns = target.namespace.clone().unwrap_or_else(|| self.default_namespace.clone());
            ensure_namespace(&mut target.body, &ns);
            Some(ns)
        } else {
            None
        };
        let api: Api<DynamicObject> = match namespace.as_deref() {
            Some(ns) => Api::namespaced_with(client.clone(), ns, &ar),
            None => Api::all_with(client.clone(), &ar),
        };

        match mode {
            Mode::Apply => {
                let pp = PatchParams::apply(FIELD_MANAGER).force();
                api.patch(&target.name, &pp, &Patch::Apply(&target.body)).await.map_err(|e| e.to_string())?;
                debug!(kind = %target.kind, name = %target.name, ns = ?namespace, "applied");
            }
            Mode::Delete => {
                api.delete(&target.name, &DeleteParams::background()).await.map_err(|e| e.to_string())?;
                debug!(kind = %target.kind, name = %target.name, ns = ?namespace, "deleted");
            }
        }
        Ok(ObjectRef { api_version: target.api_version, kind: target.kind, namespace, name: target.name })
    }
}
