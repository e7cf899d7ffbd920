//! Dual-representation manifest editor.
//!
//! A draft is kept both as a structured object (form view) and as YAML text. Exactly one
//! representation is active; edits arriving from it are synced into the other one. A sync
//! arms an echo guard on the representation it wrote, so the widget's change notification
//! for that write is recognised and dropped instead of bouncing back. Any other event from
//! the inactive side makes it active first, which from text requires the text to parse.

use caldera_core::prelude::*;
use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::{debug, warn};

use crate::manifest::{self, KeyOrder, YamlBudget};
use crate::{immutable_violation, path_segments, PatchPlan};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Representation {
    Form,
    Text,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Change {
    /// Set one field. Dotted path (`spec.tasks.0.replicas`) or JSON pointer (`/metadata/labels/app.kubernetes.io~1name`).
    SetField { path: String, value: Json },
    /// Replace the whole text buffer.
    ReplaceText(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditEvent {
    pub origin: Representation,
    pub change: Change,
}

impl EditEvent {
    pub fn form(path: impl Into<String>, value: Json) -> Self {
        Self { origin: Representation::Form, change: Change::SetField { path: path.into(), value } }
    }

    pub fn text(text: impl Into<String>) -> Self { Self { origin: Representation::Text, change: Change::ReplaceText(text.into()) } }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    /// Echo of our own sync; nothing changed.
    Echo,
    Applied,
    /// Text did not parse; the structured side is unchanged and `last_error` is set.
    Invalid,
    /// Event from the inactive side while the active text does not parse. The draft is
    /// left exactly as it was.
    Blocked,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EditMode {
    Create,
    /// Editing an existing object; `original` is its server-field-free manifest.
    Edit { key: ResourceKey, original: Json },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EditorDraft {
    pub representation: Representation,
    pub structured: Json,
    pub text: String,
    pub dirty: bool,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
enum Synced {
    Text(String),
    Form(Json),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Submission {
    Create { kind: ResourceKind, manifest: Json },
    Update { key: ResourceKey, plan: PatchPlan },
}

pub struct ManifestEditor {
    kind: ResourceKind,
    mode: EditMode,
    order: KeyOrder,
    budget: YamlBudget,
    draft: EditorDraft,
    echo: Option<Synced>,
}

impl ManifestEditor {
    /// Open an existing object. Server-owned fields are stripped before display.
    pub fn edit(kind: ResourceKind, manifest: Json, order: KeyOrder) -> DashboardResult<Self> {
        let original = manifest::strip_server_fields(manifest);
        let res = Resource::from_manifest(kind, &original)?;
        let mode = EditMode::Edit { key: res.key(), original: original.clone() };
        Ok(Self::open(kind, mode, original, order))
    }

    pub fn create(kind: ResourceKind, namespace: Option<&str>, order: KeyOrder) -> Self {
        Self::open(kind, EditMode::Create, manifest::template(kind, namespace), order)
    }

    fn open(kind: ResourceKind, mode: EditMode, structured: Json, order: KeyOrder) -> Self {
        let text = manifest::to_text(&structured, order);
        let draft = EditorDraft { representation: Representation::Form, structured, text, dirty: false, last_error: None };
        Self { kind, mode, order, budget: YamlBudget::default(), draft, echo: None }
    }

    /// Limits applied when text is parsed.
    pub fn with_budget(mut self, budget: YamlBudget) -> Self {
        self.budget = budget;
        self
    }

    pub fn kind(&self) -> ResourceKind { self.kind }
    pub fn mode(&self) -> &EditMode { &self.mode }
    pub fn draft(&self) -> &EditorDraft { &self.draft }
    pub fn representation(&self) -> Representation { self.draft.representation }

    fn is_echo(&self, ev: &EditEvent) -> bool {
        match (&self.echo, &ev.change) {
            (Some(Synced::Text(t)), Change::ReplaceText(incoming)) => ev.origin == Representation::Text && t == incoming,
            (Some(Synced::Form(s)), Change::SetField { path, value }) => {
                ev.origin == Representation::Form && lookup(s, &path_segments(path)) == Some(value)
            }
            _ => false,
        }
    }

    fn guard_armed_for(&self, r: Representation) -> bool {
        matches!((&self.echo, r), (Some(Synced::Text(_)), Representation::Text) | (Some(Synced::Form(_)), Representation::Form))
    }

    /// Feed one change notification from either representation.
    pub fn apply(&mut self, ev: EditEvent) -> DashboardResult<EventOutcome> {
        if self.guard_armed_for(ev.origin) {
            let echo = self.is_echo(&ev);
            self.echo = None;
            if echo {
                debug!(origin = ?ev.origin, "editor: echo suppressed");
                return Ok(EventOutcome::Echo);
            }
        }
        if ev.origin != self.draft.representation {
            // the user moved to the other side; take it over through the guarded transition
            if let Err(e) = self.switch_to(ev.origin) {
                debug!(origin = ?ev.origin, error = %e, "editor: active text does not parse; event dropped");
                return Ok(EventOutcome::Blocked);
            }
        }
        match ev.change {
            Change::SetField { path, value } => self.set_field(&path, value),
            Change::ReplaceText(text) => Ok(self.replace_text(text)),
        }
    }

    fn set_field(&mut self, path: &str, value: Json) -> DashboardResult<EventOutcome> {
        let segs = path_segments(path);
        if segs.is_empty() {
            return Err(DashboardError::Validation("empty field path".into()));
        }
        if lookup(&self.draft.structured, &segs) == Some(&value) {
            return Ok(EventOutcome::Applied);
        }
        if let EditMode::Edit { .. } = self.mode {
            if let Some(p) = immutable_violation(self.kind, &[segs.clone()]) {
                warn!(kind = %self.kind, path = %p, "editor: immutable field edit refused");
                return Err(DashboardError::ImmutableField { path: p });
            }
        }
        assign(&mut self.draft.structured, &segs, value)?;
        self.draft.dirty = true;
        self.draft.last_error = None;
        self.sync_into(Representation::Text);
        Ok(EventOutcome::Applied)
    }

    fn replace_text(&mut self, text: String) -> EventOutcome {
        self.draft.dirty = self.draft.dirty || text != self.draft.text;
        self.draft.text = text;
        match self.budget.parse(&self.draft.text) {
            Ok(v) => {
                self.draft.structured = v;
                self.draft.last_error = None;
                self.sync_into(Representation::Form);
                EventOutcome::Applied
            }
            Err(e) => {
                counter!("editor_parse_err_total", 1);
                self.draft.last_error = Some(e.to_string());
                EventOutcome::Invalid
            }
        }
    }

    /// Write the active content into `target` and arm the echo guard for it.
    fn sync_into(&mut self, target: Representation) {
        match target {
            Representation::Text => {
                self.draft.text = manifest::to_text(&self.draft.structured, self.order);
                self.echo = Some(Synced::Text(self.draft.text.clone()));
            }
            Representation::Form => self.echo = Some(Synced::Form(self.draft.structured.clone())),
        }
    }

    /// Switch the active representation. Text to form requires the text to parse; on
    /// failure the editor stays in text mode and the error is returned.
    pub fn switch_to(&mut self, target: Representation) -> DashboardResult<()> {
        if target == self.draft.representation {
            return Ok(());
        }
        if target == Representation::Form {
            match self.budget.parse(&self.draft.text) {
                Ok(v) => self.draft.structured = v,
                Err(e) => {
                    counter!("editor_parse_err_total", 1);
                    self.draft.last_error = Some(e.to_string());
                    return Err(e);
                }
            }
        }
        self.draft.last_error = None;
        self.draft.representation = target;
        self.sync_into(target);
        Ok(())
    }

    /// The current manifest, read from the active representation.
    pub fn current(&self) -> DashboardResult<Json> {
        match self.draft.representation {
            Representation::Form => Ok(self.draft.structured.clone()),
            Representation::Text => self.budget.parse(&self.draft.text),
        }
    }

    /// Turn the draft into what gets sent: a full manifest for create, a patch for edit.
    pub fn submission(&self) -> DashboardResult<Submission> {
        let current = self.current()?;
        match &self.mode {
            EditMode::Create => {
                let manifest = manifest::strip_server_fields(current);
                manifest::validate_new(self.kind, &manifest)?;
                Ok(Submission::Create { kind: self.kind, manifest })
            }
            EditMode::Edit { key, original } => {
                let plan = crate::build_patch(self.kind, original, &current)?;
                Ok(Submission::Update { key: key.clone(), plan })
            }
        }
    }
}

fn lookup<'a>(v: &'a Json, segs: &[String]) -> Option<&'a Json> {
    segs.iter().try_fold(v, |cur, s| match cur {
        Json::Object(m) => m.get(s),
        Json::Array(a) => s.parse::<usize>().ok().and_then(|i| a.get(i)),
        _ => None,
    })
}

/// Set `value` at `segs`, creating intermediate objects. An index equal to an array's
/// length appends.
fn assign(root: &mut Json, segs: &[String], value: Json) -> DashboardResult<()> {
    let Some((last, parents)) = segs.split_last() else {
        *root = value;
        return Ok(());
    };
    let mut cur = root;
    for s in parents {
        cur = step(cur, s)?;
    }
    *step(cur, last)? = value;
    Ok(())
}

fn index(s: &str, len: usize) -> DashboardResult<usize> {
    let i = s.parse::<usize>().map_err(|_| DashboardError::Validation(format!("expected array index, got {}", s)))?;
    if i > len {
        return Err(DashboardError::Validation(format!("index {} out of range (len {})", i, len)));
    }
    Ok(i)
}

fn step<'a>(cur: &'a mut Json, s: &str) -> DashboardResult<&'a mut Json> {
    if !cur.is_object() && !cur.is_array() {
        *cur = Json::Object(serde_json::Map::new());
    }
    match cur {
        Json::Array(a) => {
            let i = index(s, a.len())?;
            if i == a.len() {
                a.push(Json::Object(serde_json::Map::new()));
            }
            Ok(&mut a[i])
        }
        Json::Object(m) => Ok(m.entry(s.to_string()).or_insert_with(|| Json::Object(serde_json::Map::new()))),
        _ => Err(DashboardError::Validation(format!("cannot descend into {}", s))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn job_manifest() -> Json {
        json!({
            "apiVersion": "batch.volcano.sh/v1alpha1",
            "kind": "Job",
            "metadata": { "name": "train", "namespace": "ml", "resourceVersion": "7", "labels": { "tier": "bronze" } },
            "spec": {
                "queue": "gpu",
                "minAvailable": 1,
                "tasks": [{ "name": "worker", "replicas": 2, "template": { "spec": { "containers": [{ "name": "main", "image": "trainer:1" }] } } }]
            },
            "status": { "state": { "phase": "Running" } }
        })
    }

    fn editor() -> ManifestEditor { ManifestEditor::edit(ResourceKind::Job, job_manifest(), KeyOrder::Declared).unwrap() }

    #[test]
    fn form_edit_syncs_text_and_echo_is_suppressed_once() {
        let mut ed = editor();
        assert_eq!(ed.apply(EditEvent::form("spec.minAvailable", json!(2))).unwrap(), EventOutcome::Applied);
        assert!(ed.draft().dirty);
        assert!(ed.draft().text.contains("minAvailable: 2"));
        let synced = ed.draft().text.clone();
        assert_eq!(ed.apply(EditEvent::text(synced.clone())).unwrap(), EventOutcome::Echo);
        // guard is cleared; the same content again counts as a user edit
        assert_eq!(ed.apply(EditEvent::text(synced)).unwrap(), EventOutcome::Applied);
    }

    #[test]
    fn text_edit_that_differs_from_sync_is_processed() {
        let mut ed = editor();
        ed.apply(EditEvent::form("metadata.labels.tier", json!("gold"))).unwrap();
        let typed = ed.draft().text.replace("gold", "silver");
        assert_eq!(ed.apply(EditEvent::text(typed)).unwrap(), EventOutcome::Applied);
        assert_eq!(ed.draft().structured["metadata"]["labels"]["tier"], "silver");
    }

    #[test]
    fn invalid_text_blocks_switch_to_form() {
        let mut ed = editor();
        ed.switch_to(Representation::Text).unwrap();
        assert_eq!(ed.apply(EditEvent::text("metadata: [unclosed")).unwrap(), EventOutcome::Invalid);
        assert!(ed.draft().last_error.is_some());
        assert_eq!(ed.draft().structured["spec"]["minAvailable"], 1);
        assert!(matches!(ed.switch_to(Representation::Form), Err(DashboardError::Parse(_))));
        assert_eq!(ed.representation(), Representation::Text);
        assert!(matches!(ed.submission(), Err(DashboardError::Parse(_))));
    }

    #[test]
    fn form_event_cannot_overwrite_unparsable_text() {
        let mut ed = editor();
        ed.switch_to(Representation::Text).unwrap();
        let typed = "metadata: [half typed";
        assert_eq!(ed.apply(EditEvent::text(typed)).unwrap(), EventOutcome::Invalid);
        assert_eq!(ed.apply(EditEvent::form("spec.minAvailable", json!(3))).unwrap(), EventOutcome::Blocked);
        assert_eq!(ed.representation(), Representation::Text);
        assert_eq!(ed.draft().text, typed);
        assert!(ed.draft().last_error.is_some());
        assert_eq!(ed.draft().structured["spec"]["minAvailable"], 1);
    }

    #[test]
    fn form_event_takes_over_once_text_parses() {
        let mut ed = editor();
        ed.switch_to(Representation::Text).unwrap();
        let typed = ed.draft().text.replace("bronze", "gold");
        assert_eq!(ed.apply(EditEvent::text(typed)).unwrap(), EventOutcome::Applied);
        assert_eq!(ed.apply(EditEvent::form("spec.minAvailable", json!(3))).unwrap(), EventOutcome::Applied);
        assert_eq!(ed.representation(), Representation::Form);
        assert!(ed.draft().text.contains("tier: gold"), "{}", ed.draft().text);
        assert!(ed.draft().text.contains("minAvailable: 3"));
    }

    #[test]
    fn text_over_budget_is_invalid() {
        let small = "apiVersion: v\nkind: Job\nmetadata:\n  name: train\n";
        let mut ed = editor().with_budget(YamlBudget { max_bytes: 64, ..YamlBudget::default() });
        assert_eq!(ed.apply(EditEvent::text(small)).unwrap(), EventOutcome::Applied);
        assert_eq!(ed.apply(EditEvent::text(format!("{small}# {}\n", "x".repeat(64)))).unwrap(), EventOutcome::Invalid);
        assert_eq!(ed.draft().structured["metadata"]["name"], "train");
    }

    #[test]
    fn text_round_trips_through_structured() {
        let ed = editor();
        let back = manifest::parse_text(&ed.draft().text).unwrap();
        assert_eq!(back, ed.draft().structured);
        assert!(back["metadata"].get("resourceVersion").is_none());
        assert!(back.get("status").is_none());
    }

    #[test]
    fn immutable_form_edits_are_refused_in_edit_mode_only() {
        let mut ed = editor();
        let err = ed.apply(EditEvent::form("spec.tasks.0.template.spec.containers.0.image", json!("trainer:2"))).unwrap_err();
        assert!(matches!(err, DashboardError::ImmutableField { .. }));
        assert!(!ed.draft().dirty);
        assert!(matches!(ed.apply(EditEvent::form("metadata.name", json!("x"))), Err(DashboardError::ImmutableField { .. })));

        let mut fresh = ManifestEditor::create(ResourceKind::Job, Some("ml"), KeyOrder::Declared);
        fresh.apply(EditEvent::form("metadata.name", json!("new-job"))).unwrap();
        fresh.apply(EditEvent::form("spec.tasks.0.template.spec.containers.0.image", json!("x:1"))).unwrap();
        match fresh.submission().unwrap() {
            Submission::Create { manifest, .. } => assert_eq!(manifest["metadata"]["name"], "new-job"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn pointer_paths_reach_dotted_keys() {
        let mut ed = editor();
        ed.apply(EditEvent::form("/metadata/labels/app.kubernetes.io~1name", json!("trainer"))).unwrap();
        assert_eq!(ed.draft().structured["metadata"]["labels"]["app.kubernetes.io/name"], "trainer");
        match ed.submission().unwrap() {
            Submission::Update { key, plan } => {
                assert_eq!(key, ResourceKey::new(ResourceKind::Job, "ml", "train"));
                assert_eq!(plan.patch, json!({ "metadata": { "labels": { "app.kubernetes.io/name": "trainer" } } }));
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
