//! Manifest text codec (YAML) and per-kind key-order policy.

use std::fmt;
use std::str::FromStr;

use caldera_core::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

/// Size limits applied to manifest text before and after parsing.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct YamlBudget {
    pub max_bytes: usize,
    /// Scalars, sequences and mappings all count as one node.
    pub max_nodes: usize,
}

impl Default for YamlBudget {
    fn default() -> Self { Self { max_bytes: 1 << 20, max_nodes: 100_000 } }
}

impl YamlBudget {
    fn too_many_nodes(&self, root: &Json) -> bool {
        let mut stack = vec![root];
        let mut seen = 0usize;
        while let Some(v) = stack.pop() {
            seen += 1;
            if seen > self.max_nodes {
                return true;
            }
            match v {
                Json::Object(map) => stack.extend(map.values()),
                Json::Array(items) => stack.extend(items.iter()),
                _ => {}
            }
        }
        false
    }

    /// Parse manifest text into a JSON object within this budget.
    pub fn parse(&self, text: &str) -> DashboardResult<Json> {
        if text.len() > self.max_bytes {
            return Err(DashboardError::Parse(format!("manifest too large ({} bytes, limit {})", text.len(), self.max_bytes)));
        }
        if text.trim().is_empty() {
            return Err(DashboardError::Parse("manifest is empty".into()));
        }
        let val: serde_yaml::Value = serde_yaml::from_str(text).map_err(|e| DashboardError::Parse(e.to_string()))?;
        let json = serde_json::to_value(val).map_err(|e| DashboardError::Parse(format!("converting YAML to JSON: {}", e)))?;
        if !json.is_object() {
            return Err(DashboardError::Parse("manifest must be a mapping".into()));
        }
        if self.too_many_nodes(&json) {
            return Err(DashboardError::Parse(format!("manifest too complex (more than {} nodes)", self.max_nodes)));
        }
        Ok(json)
    }
}

/// How object keys are ordered when a manifest is rendered as text.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum KeyOrder {
    /// As the server (or the author) declared them.
    #[default]
    Declared,
    /// Recursively sorted by key.
    Sorted,
}

impl FromStr for KeyOrder {
    type Err = DashboardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "declared" | "server" => Ok(KeyOrder::Declared),
            "sorted" | "alpha" => Ok(KeyOrder::Sorted),
            other => Err(DashboardError::Validation(format!("unknown key order: {} (expect declared or sorted)", other))),
        }
    }
}

impl fmt::Display for KeyOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            KeyOrder::Declared => "declared",
            KeyOrder::Sorted => "sorted",
        })
    }
}

/// Key order per kind. Queues render sorted, everything else as declared.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeyOrderPolicy {
    pub job: KeyOrder,
    pub queue: KeyOrder,
    pub pod: KeyOrder,
    pub podgroup: KeyOrder,
}

impl Default for KeyOrderPolicy {
    fn default() -> Self {
        Self { job: KeyOrder::Declared, queue: KeyOrder::Sorted, pod: KeyOrder::Declared, podgroup: KeyOrder::Declared }
    }
}

impl KeyOrderPolicy {
    pub fn for_kind(&self, kind: ResourceKind) -> KeyOrder {
        match kind {
            ResourceKind::Job => self.job,
            ResourceKind::Queue => self.queue,
            ResourceKind::Pod => self.pod,
            ResourceKind::PodGroup => self.podgroup,
        }
    }

    pub fn set(&mut self, kind: ResourceKind, order: KeyOrder) {
        match kind {
            ResourceKind::Job => self.job = order,
            ResourceKind::Queue => self.queue = order,
            ResourceKind::Pod => self.pod = order,
            ResourceKind::PodGroup => self.podgroup = order,
        }
    }
}

fn sorted(v: &Json) -> Json {
    match v {
        Json::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut out = serde_json::Map::new();
            for k in keys {
                out.insert(k.clone(), sorted(&map[k]));
            }
            Json::Object(out)
        }
        Json::Array(arr) => Json::Array(arr.iter().map(sorted).collect()),
        other => other.clone(),
    }
}

/// Render as YAML. Never fails: if YAML emission ever did, JSON (a YAML subset) is used.
pub fn to_text(v: &Json, order: KeyOrder) -> String {
    let doc = match order {
        KeyOrder::Declared => v.clone(),
        KeyOrder::Sorted => sorted(v),
    };
    serde_yaml::to_string(&doc).unwrap_or_else(|_| serde_json::to_string_pretty(&doc).unwrap_or_default())
}

/// Parse with the default budget.
pub fn parse_text(text: &str) -> DashboardResult<Json> { YamlBudget::default().parse(text) }

/// Drop fields the server owns so they neither show up in diffs nor get sent back.
pub fn strip_server_fields(mut v: Json) -> Json {
    if let Some(obj) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        for k in ["managedFields", "resourceVersion", "generation", "creationTimestamp", "uid", "selfLink"] {
            obj.remove(k);
        }
    }
    if let Some(obj) = v.as_object_mut() {
        obj.remove("status");
    }
    v
}

/// A new object must name its apiVersion, kind and metadata.name, and the kind must match.
pub fn validate_new(kind: ResourceKind, v: &Json) -> DashboardResult<()> {
    let api_version = v.get("apiVersion").and_then(|x| x.as_str()).ok_or_else(|| DashboardError::Validation("manifest missing apiVersion".into()))?;
    let k = v.get("kind").and_then(|x| x.as_str()).ok_or_else(|| DashboardError::Validation("manifest missing kind".into()))?;
    v.get("metadata")
        .and_then(|m| m.get("name"))
        .and_then(|x| x.as_str())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| DashboardError::Validation("manifest missing metadata.name".into()))?;
    if k != kind.as_str() {
        return Err(DashboardError::Validation(format!("manifest kind {} does not match {}", k, kind)));
    }
    if api_version != kind.api_version() {
        return Err(DashboardError::Validation(format!("manifest apiVersion {} does not match {}", api_version, kind.api_version())));
    }
    Ok(())
}

/// Starting point for the create dialog.
pub fn template(kind: ResourceKind, namespace: Option<&str>) -> Json {
    let mut meta = serde_json::Map::new();
    meta.insert("name".into(), Json::String(String::new()));
    if kind.namespaced() {
        meta.insert("namespace".into(), Json::String(namespace.unwrap_or("default").to_string()));
    }
    let spec = match kind {
        ResourceKind::Job => serde_json::json!({
            "queue": "default",
            "minAvailable": 1,
            "schedulerName": "volcano",
            "tasks": [{
                "name": "worker",
                "replicas": 1,
                "template": { "spec": { "restartPolicy": "Never", "containers": [{
                    "name": "main",
                    "image": "busybox",
                    "resources": { "requests": { "cpu": "500m", "memory": "512Mi" } }
                }] } }
            }]
        }),
        ResourceKind::Queue => serde_json::json!({ "weight": 1, "reclaimable": true }),
        ResourceKind::Pod => serde_json::json!({
            "schedulerName": "volcano",
            "containers": [{ "name": "main", "image": "busybox" }]
        }),
        ResourceKind::PodGroup => serde_json::json!({ "queue": "default", "minMember": 1 }),
    };
    let mut out = serde_json::Map::new();
    out.insert("apiVersion".into(), Json::String(kind.api_version()));
    out.insert("kind".into(), Json::String(kind.as_str().to_string()));
    out.insert("metadata".into(), Json::Object(meta));
    out.insert("spec".into(), spec);
    Json::Object(out)
}
