//! Caldera core types: resource kinds, shaped resources and identity keys.

#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use smallvec::SmallVec;

pub mod columns;
pub mod error;
pub mod patch;
pub mod phase;
pub mod quantity;
pub mod query;

pub use error::{DashboardError, DashboardResult};

pub mod prelude {
    pub use super::{Resource, ResourceKey, ResourceKind};
    pub use super::columns::{Column, ColumnValue};
    pub use super::error::{DashboardError, DashboardResult};
    pub use super::query::{FilterDimension, FilterState, ListQuery, PageRequest, QueryKey, SortDirection, SortState};
}

/// Annotation Volcano sets on pods it schedules, naming the owning queue.
pub const POD_QUEUE_ANNOTATION: &str = "scheduling.volcano.sh/queue-name";

/// The four Volcano-facing kinds the dashboard manages.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    Job,
    Queue,
    Pod,
    PodGroup,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 4] = [ResourceKind::Job, ResourceKind::Queue, ResourceKind::Pod, ResourceKind::PodGroup];

    pub fn group(&self) -> &'static str {
        match self {
            ResourceKind::Job => "batch.volcano.sh",
            ResourceKind::Queue | ResourceKind::PodGroup => "scheduling.volcano.sh",
            ResourceKind::Pod => "",
        }
    }

    pub fn version(&self) -> &'static str {
        match self {
            ResourceKind::Job => "v1alpha1",
            ResourceKind::Queue | ResourceKind::PodGroup => "v1beta1",
            ResourceKind::Pod => "v1",
        }
    }

    pub fn plural(&self) -> &'static str {
        match self {
            ResourceKind::Job => "jobs",
            ResourceKind::Queue => "queues",
            ResourceKind::Pod => "pods",
            ResourceKind::PodGroup => "podgroups",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Job => "Job",
            ResourceKind::Queue => "Queue",
            ResourceKind::Pod => "Pod",
            ResourceKind::PodGroup => "PodGroup",
        }
    }

    /// Queues are cluster-scoped; everything else lives in a namespace.
    pub fn namespaced(&self) -> bool { !matches!(self, ResourceKind::Queue) }

    pub fn api_version(&self) -> String {
        if self.group().is_empty() {
            self.version().to_string()
        } else {
            format!("{}/{}", self.group(), self.version())
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

impl FromStr for ResourceKind {
    type Err = DashboardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "job" | "jobs" | "vcjob" | "vj" => Ok(ResourceKind::Job),
            "queue" | "queues" | "q" => Ok(ResourceKind::Queue),
            "pod" | "pods" | "po" => Ok(ResourceKind::Pod),
            "podgroup" | "podgroups" | "pg" => Ok(ResourceKind::PodGroup),
            other => Err(DashboardError::Validation(format!("unknown kind: {} (expect job, queue, pod or podgroup)", other))),
        }
    }
}

/// Identity of a resource: `(kind, namespace, name)`. Namespace is empty for queues.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey {
    pub kind: ResourceKind,
    pub namespace: String,
    pub name: String,
}

impl ResourceKey {
    pub fn new(kind: ResourceKind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        let namespace = if kind.namespaced() { namespace.into() } else { String::new() };
        Self { kind, namespace, name: name.into() }
    }

    pub fn namespace_opt(&self) -> Option<&str> {
        if self.namespace.is_empty() { None } else { Some(&self.namespace) }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{} {}", self.kind, self.name)
        } else {
            write!(f, "{} {}/{}", self.kind, self.namespace, self.name)
        }
    }
}

/// A cluster object shaped for listing: identity, metadata the views need, and the
/// raw `spec`/`status` maps whose shapes vary by kind and by scheduler version.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Resource {
    pub kind: ResourceKind,
    pub api_version: String,
    pub name: String,
    pub namespace: String,
    pub uid: Option<String>,
    pub resource_version: Option<String>,
    pub creation_timestamp: DateTime<Utc>,
    pub labels: SmallVec<[(String, String); 8]>,
    pub annotations: SmallVec<[(String, String); 4]>,
    pub spec: Json,
    pub status: Json,
}

impl Resource {
    pub fn key(&self) -> ResourceKey {
        ResourceKey { kind: self.kind, namespace: self.namespace.clone(), name: self.name.clone() }
    }

    /// Shape a raw object (as returned by the cluster API) into a `Resource`.
    pub fn from_manifest(kind: ResourceKind, raw: &Json) -> DashboardResult<Self> {
        let meta = raw
            .get("metadata")
            .and_then(|m| m.as_object())
            .ok_or_else(|| DashboardError::Parse(format!("{} object missing metadata", kind)))?;
        let name = meta
            .get("name")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| DashboardError::Parse(format!("{} object missing metadata.name", kind)))?
            .to_string();
        let namespace = if kind.namespaced() {
            meta.get("namespace").and_then(|v| v.as_str()).unwrap_or("").to_string()
        } else {
            String::new()
        };
        let creation_timestamp = meta
            .get("creationTimestamp")
            .and_then(|v| v.as_str())
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
        let str_pairs = |key: &str| -> Vec<(String, String)> {
            meta.get(key)
                .and_then(|m| m.as_object())
                .map(|m| m.iter().filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string()))).collect())
                .unwrap_or_default()
        };
        Ok(Self {
            kind,
            api_version: raw.get("apiVersion").and_then(|v| v.as_str()).map(|s| s.to_string()).unwrap_or_else(|| kind.api_version()),
            name,
            namespace,
            uid: meta.get("uid").and_then(|v| v.as_str()).map(|s| s.to_string()),
            resource_version: meta.get("resourceVersion").and_then(|v| v.as_str()).map(|s| s.to_string()),
            creation_timestamp,
            labels: str_pairs("labels").into_iter().collect(),
            annotations: str_pairs("annotations").into_iter().collect(),
            spec: raw.get("spec").cloned().unwrap_or(Json::Null),
            status: raw.get("status").cloned().unwrap_or(Json::Null),
        })
    }

    /// Rebuild a manifest object in declaration order: apiVersion, kind, metadata, spec, status.
    pub fn to_manifest(&self) -> Json {
        let mut meta = serde_json::Map::new();
        meta.insert("name".into(), Json::String(self.name.clone()));
        if !self.namespace.is_empty() {
            meta.insert("namespace".into(), Json::String(self.namespace.clone()));
        }
        if let Some(uid) = &self.uid {
            meta.insert("uid".into(), Json::String(uid.clone()));
        }
        if let Some(rv) = &self.resource_version {
            meta.insert("resourceVersion".into(), Json::String(rv.clone()));
        }
        if self.creation_timestamp != DateTime::<Utc>::UNIX_EPOCH {
            meta.insert("creationTimestamp".into(), Json::String(self.creation_timestamp.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)));
        }
        if !self.labels.is_empty() {
            meta.insert("labels".into(), pairs_to_map(&self.labels));
        }
        if !self.annotations.is_empty() {
            meta.insert("annotations".into(), pairs_to_map(&self.annotations));
        }
        let mut out = serde_json::Map::new();
        out.insert("apiVersion".into(), Json::String(self.api_version.clone()));
        out.insert("kind".into(), Json::String(self.kind.as_str().to_string()));
        out.insert("metadata".into(), Json::Object(meta));
        if !self.spec.is_null() {
            out.insert("spec".into(), self.spec.clone());
        }
        if !self.status.is_null() {
            out.insert("status".into(), self.status.clone());
        }
        Json::Object(out)
    }

    /// Canonical lifecycle phase.
    pub fn phase(&self) -> String { phase::derive_phase_for(self.kind, &self.status) }

    /// Queue the resource is scheduled into (a queue resolves to itself).
    pub fn queue(&self) -> Option<&str> {
        match self.kind {
            ResourceKind::Queue => Some(self.name.as_str()),
            ResourceKind::Job | ResourceKind::PodGroup => self.spec.get("queue").and_then(|v| v.as_str()),
            ResourceKind::Pod => self.annotation(POD_QUEUE_ANNOTATION),
        }
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    /// Apply an RFC 7386 merge patch and re-shape. Identity is kept even if the patch names it.
    pub fn with_patch(&self, patch: &Json) -> DashboardResult<Self> {
        let mut raw = self.to_manifest();
        patch::merge(&mut raw, patch);
        let mut next = Resource::from_manifest(self.kind, &raw)?;
        next.name = self.name.clone();
        next.namespace = self.namespace.clone();
        Ok(next)
    }
}

fn pairs_to_map(pairs: &[(String, String)]) -> Json {
    let mut map = serde_json::Map::new();
    for (k, v) in pairs.iter() {
        map.insert(k.clone(), Json::String(v.clone()));
    }
    Json::Object(map)
}
