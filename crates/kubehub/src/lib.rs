//! Caldera kubehub: the cluster API seam and its two adapters.

#![forbid(unsafe_code)]

use caldera_core::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub mod kube_cluster;
pub mod mock;

pub use kube_cluster::KubeCluster;
pub use mock::MockCluster;

/// One page of a list call. `total_count` is the number of matches before slicing.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ListPage {
    pub items: Vec<Resource>,
    pub total_count: usize,
}

/// Push notification that something changed. Carries no payload: receivers refetch.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ChangeHint {
    pub kind: Option<ResourceKind>,
    pub namespace: Option<String>,
    pub name: Option<String>,
}

impl ChangeHint {
    pub fn for_kind(kind: ResourceKind) -> Self { Self { kind: Some(kind), ..Default::default() } }

    pub fn for_key(key: &ResourceKey) -> Self {
        Self { kind: Some(key.kind), namespace: key.namespace_opt().map(|s| s.to_string()), name: Some(key.name.clone()) }
    }
}

/// Aborts the producer tasks on `cancel()` or drop.
#[derive(Default)]
pub struct CancelHandle {
    tasks: Vec<JoinHandle<()>>,
}

impl CancelHandle {
    pub fn new(tasks: Vec<JoinHandle<()>>) -> Self { Self { tasks } }

    pub fn cancel(mut self) { self.abort_all(); }

    fn abort_all(&mut self) {
        for t in self.tasks.drain(..) {
            t.abort();
        }
    }
}

impl Drop for CancelHandle {
    fn drop(&mut self) { self.abort_all(); }
}

pub struct HintStream {
    pub rx: mpsc::Receiver<ChangeHint>,
    pub cancel: CancelHandle,
}

#[async_trait::async_trait]
pub trait ClusterApi: Send + Sync {
    async fn list(&self, kind: ResourceKind, query: &ListQuery) -> DashboardResult<ListPage>;
    async fn get_manifest(&self, key: &ResourceKey) -> DashboardResult<Json>;
    async fn delete(&self, key: &ResourceKey) -> DashboardResult<()>;
    /// Apply an RFC 7386 merge patch; returns the server's copy after the update.
    async fn update(&self, key: &ResourceKey, patch: &Json) -> DashboardResult<Resource>;
    async fn create(&self, kind: ResourceKind, manifest: &Json) -> DashboardResult<Resource>;
    /// `None` watches every managed kind. `capacity` bounds the hint channel.
    async fn watch(&self, kind: Option<ResourceKind>, capacity: usize) -> DashboardResult<HintStream>;
}

/// Filter then slice a full listing the way the list endpoints do. Order is preserved.
pub fn page_of(items: impl IntoIterator<Item = Resource>, query: &ListQuery) -> ListPage {
    let matched: Vec<Resource> = items.into_iter().filter(|r| query.matches(r)).collect();
    let total_count = matched.len();
    let items = match query.page {
        Some(p) => matched.into_iter().skip(p.offset()).take(p.page_size()).collect(),
        None => matched,
    };
    ListPage { items, total_count }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pod(name: &str, ns: &str) -> Resource {
        Resource::from_manifest(ResourceKind::Pod, &json!({ "metadata": { "name": name, "namespace": ns } })).unwrap()
    }

    #[test]
    fn page_of_counts_before_slicing() {
        let items: Vec<Resource> = (0..7).map(|i| pod(&format!("p{}", i), if i % 2 == 0 { "a" } else { "b" })).collect();
        let q = ListQuery { namespace: Some("a".into()), page: Some(PageRequest::new(2, 3)), ..Default::default() };
        let page = page_of(items, &q);
        assert_eq!(page.total_count, 4);
        assert_eq!(page.items.iter().map(|r| r.name.as_str()).collect::<Vec<_>>(), vec!["p6"]);
    }

    #[test]
    fn hint_for_queue_has_no_namespace() {
        let h = ChangeHint::for_key(&ResourceKey::new(ResourceKind::Queue, "x", "gpu"));
        assert_eq!(h.namespace, None);
        assert_eq!(h.name.as_deref(), Some("gpu"));
    }
}
