//! Caldera apply: manifest text codec, the dual-representation editor, and patch planning
//! for edits (merge patch + change summary + immutable-field guard).

#![forbid(unsafe_code)]

use caldera_core::patch;
use caldera_core::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::debug;

pub mod editor;
pub mod manifest;

pub use editor::{Change, EditEvent, EditMode, EditorDraft, EventOutcome, ManifestEditor, Representation, Submission};
pub use manifest::{parse_text, strip_server_fields, to_text, KeyOrder, KeyOrderPolicy, YamlBudget};

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiffSummary { pub adds: usize, pub updates: usize, pub removes: usize }

impl DiffSummary {
    pub fn is_empty(&self) -> bool { self.adds == 0 && self.updates == 0 && self.removes == 0 }
}

/// Leaf-level change counts from `base` to `target`.
pub fn diff_summary(target: &Json, base: &Json) -> DiffSummary {
    let mut s = DiffSummary::default();
    walk_changes(target, base, &mut Vec::new(), &mut |change, _| match change {
        Leaf::Added => s.adds += 1,
        Leaf::Updated => s.updates += 1,
        Leaf::Removed => s.removes += 1,
    });
    s
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Leaf {
    Added,
    Updated,
    Removed,
}

/// Visit every changed leaf with its path. Objects recurse by key; arrays recurse by index
/// over the common prefix and report extra elements as added or removed.
fn walk_changes(t: &Json, b: &Json, path: &mut Vec<String>, f: &mut dyn FnMut(Leaf, &[String])) {
    match (t, b) {
        (Json::Object(mt), Json::Object(mb)) => {
            for (k, vt) in mt.iter() {
                path.push(k.clone());
                match mb.get(k) {
                    Some(vb) => walk_changes(vt, vb, path, f),
                    None => f(Leaf::Added, path),
                }
                path.pop();
            }
            for k in mb.keys() {
                if !mt.contains_key(k) {
                    path.push(k.clone());
                    f(Leaf::Removed, path);
                    path.pop();
                }
            }
        }
        (Json::Array(at), Json::Array(ab)) => {
            let n = at.len().min(ab.len());
            for i in 0..n {
                path.push(i.to_string());
                walk_changes(&at[i], &ab[i], path, f);
                path.pop();
            }
            for i in n..at.len() {
                path.push(i.to_string());
                f(Leaf::Added, path);
                path.pop();
            }
            for i in n..ab.len() {
                path.push(i.to_string());
                f(Leaf::Removed, path);
                path.pop();
            }
        }
        (x, y) => {
            if x != y {
                f(Leaf::Updated, path);
            }
        }
    }
}

/// Split a field path into segments. A leading `/` selects JSON pointer syntax (`~1` is
/// `/`, `~0` is `~`); otherwise segments are dot-separated.
pub fn path_segments(path: &str) -> Vec<String> {
    if let Some(pointer) = path.strip_prefix('/') {
        return pointer.split('/').map(|s| s.replace("~1", "/").replace("~0", "~")).collect();
    }
    path.split('.').filter(|s| !s.is_empty()).map(str::to_string).collect()
}

const IDENTITY: &[&str] = &["apiVersion", "kind", "metadata.name", "metadata.namespace", "metadata.uid"];

/// Fields the edit flow refuses to change, beyond object identity. `*` matches any one
/// segment.
pub fn immutable_paths(kind: ResourceKind) -> &'static [&'static str] {
    match kind {
        ResourceKind::Job => &[
            "spec.tasks.*.name",
            "spec.tasks.*.replicas",
            "spec.tasks.*.template.spec.containers.*.image",
            "spec.tasks.*.template.spec.containers.*.resources.requests",
        ],
        ResourceKind::Queue => &[],
        ResourceKind::Pod => &["spec.nodeName", "spec.containers.*.image", "spec.containers.*.resources.requests"],
        ResourceKind::PodGroup => &["spec.queue", "spec.minMember"],
    }
}

/// A change at `path` touches `pattern` when either is a prefix of the other.
fn touches(pattern: &str, path: &[String]) -> bool {
    pattern.split('.').zip(path.iter()).all(|(p, s)| p == "*" || p == s)
}

/// First changed path that hits an immutable field, rendered dotted.
pub fn immutable_violation(kind: ResourceKind, changed: &[Vec<String>]) -> Option<String> {
    changed
        .iter()
        .find(|path| IDENTITY.iter().chain(immutable_paths(kind).iter()).any(|pat| touches(pat, path)))
        .map(|path| path.join("."))
}

/// What an edit sends to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchPlan {
    pub patch: Json,
    pub summary: DiffSummary,
}

impl PatchPlan {
    pub fn is_noop(&self) -> bool { self.summary.is_empty() }
}

/// Merge patch from `original` to `edited`, ignoring server-owned fields. Changes that
/// touch an immutable field fail with `ImmutableField`.
pub fn build_patch(kind: ResourceKind, original: &Json, edited: &Json) -> DashboardResult<PatchPlan> {
    let base = strip_server_fields(original.clone());
    let target = strip_server_fields(edited.clone());
    if !target.is_object() {
        return Err(DashboardError::Validation("manifest must be an object".into()));
    }
    let mut changed: Vec<Vec<String>> = Vec::new();
    walk_changes(&target, &base, &mut Vec::new(), &mut |_, p| changed.push(p.to_vec()));
    if let Some(path) = immutable_violation(kind, &changed) {
        return Err(DashboardError::ImmutableField { path });
    }
    let summary = diff_summary(&target, &base);
    let patch = patch::diff(&base, &target);
    debug!(kind = %kind, adds = summary.adds, updates = summary.updates, removes = summary.removes, "apply: patch planned");
    Ok(PatchPlan { patch, summary })
}
