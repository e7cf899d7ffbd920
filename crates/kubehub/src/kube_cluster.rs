//! Kubernetes-backed `ClusterApi` using kube's dynamic API.

use std::time::Instant;

use caldera_core::prelude::*;
use futures::StreamExt;
use kube::{
    api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    runtime::{watcher, watcher::Event, WatchStreamExt},
    Client,
};
use serde_json::Value as Json;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{page_of, CancelHandle, ChangeHint, ClusterApi, HintStream, ListPage};

/// Kubernetes errors with a structured body become rejections carrying the server message
/// verbatim; anything else is a transport failure.
pub fn map_kube_err(e: kube::Error) -> DashboardError {
    match e {
        kube::Error::Api(resp) => DashboardError::ServerRejection {
            message: resp.message,
            details: if resp.reason.is_empty() { None } else { Some(resp.reason) },
        },
        other => DashboardError::Transport(other.to_string()),
    }
}

pub fn api_resource(kind: ResourceKind) -> ApiResource {
    let gvk = GroupVersionKind::gvk(kind.group(), kind.version(), kind.as_str());
    ApiResource::from_gvk_with_plural(&gvk, kind.plural())
}

fn strip_managed_fields(v: &mut Json) {
    if let Some(obj) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        obj.remove("managedFields");
    }
}

fn object_json(obj: &DynamicObject) -> DashboardResult<Json> {
    let mut raw = serde_json::to_value(obj).map_err(|e| DashboardError::Parse(format!("serializing object: {}", e)))?;
    strip_managed_fields(&mut raw);
    Ok(raw)
}

fn shape(kind: ResourceKind, obj: &DynamicObject) -> DashboardResult<Resource> {
    Resource::from_manifest(kind, &object_json(obj)?)
}

#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self { Self { client } }

    /// Connect with the ambient kubeconfig or in-cluster service account.
    pub async fn try_default() -> DashboardResult<Self> {
        let client = Client::try_default().await.map_err(map_kube_err)?;
        Ok(Self { client })
    }

    fn api(&self, kind: ResourceKind, namespace: Option<&str>) -> Api<DynamicObject> {
        let ar = api_resource(kind);
        match namespace.filter(|_| kind.namespaced()) {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &ar),
            None => Api::all_with(self.client.clone(), &ar),
        }
    }

    fn spawn_watch(&self, kind: ResourceKind, tx: mpsc::Sender<ChangeHint>) -> tokio::task::JoinHandle<()> {
        let api = self.api(kind, None);
        tokio::spawn(async move {
            let stream = watcher::watcher(api, watcher::Config::default()).default_backoff();
            futures::pin_mut!(stream);
            info!(kind = %kind, "watcher started");
            while let Some(ev) = stream.next().await {
                let hint = match ev {
                    Ok(Event::Applied(o)) | Ok(Event::Deleted(o)) => ChangeHint {
                        kind: Some(kind),
                        namespace: o.metadata.namespace.clone(),
                        name: o.metadata.name.clone(),
                    },
                    Ok(Event::Restarted(list)) => {
                        debug!(kind = %kind, count = list.len(), "watch restart");
                        ChangeHint::for_kind(kind)
                    }
                    Err(e) => {
                        warn!(kind = %kind, error = %e, "watch error");
                        continue;
                    }
                };
                if tx.send(hint).await.is_err() {
                    break;
                }
            }
            debug!(kind = %kind, "watcher stopped");
        })
    }
}

#[async_trait::async_trait]
impl ClusterApi for KubeCluster {
    async fn list(&self, kind: ResourceKind, query: &ListQuery) -> DashboardResult<ListPage> {
        let t0 = Instant::now();
        let api = self.api(kind, query.namespace.as_deref());
        let list = api.list(&ListParams::default()).await.map_err(map_kube_err)?;
        let mut items = Vec::with_capacity(list.items.len());
        for obj in list.items.iter() {
            match shape(kind, obj) {
                Ok(r) => items.push(r),
                Err(e) => warn!(kind = %kind, error = %e, "skipping unshapeable object"),
            }
        }
        let page = page_of(items, query);
        info!(kind = %kind, total = page.total_count, took_ms = %t0.elapsed().as_millis(), "kube: list ok");
        Ok(page)
    }

    async fn get_manifest(&self, key: &ResourceKey) -> DashboardResult<Json> {
        let obj = self.api(key.kind, key.namespace_opt()).get(&key.name).await.map_err(map_kube_err)?;
        object_json(&obj)
    }

    async fn delete(&self, key: &ResourceKey) -> DashboardResult<()> {
        let t0 = Instant::now();
        self.api(key.kind, key.namespace_opt())
            .delete(&key.name, &DeleteParams::default())
            .await
            .map_err(map_kube_err)?;
        info!(key = %key, took_ms = %t0.elapsed().as_millis(), "kube: delete ok");
        Ok(())
    }

    async fn update(&self, key: &ResourceKey, patch: &Json) -> DashboardResult<Resource> {
        let t0 = Instant::now();
        let obj = self
            .api(key.kind, key.namespace_opt())
            .patch(&key.name, &PatchParams::default(), &Patch::Merge(patch))
            .await
            .map_err(map_kube_err)?;
        info!(key = %key, took_ms = %t0.elapsed().as_millis(), "kube: update ok");
        shape(key.kind, &obj)
    }

    async fn create(&self, kind: ResourceKind, manifest: &Json) -> DashboardResult<Resource> {
        let obj: DynamicObject = serde_json::from_value(manifest.clone())
            .map_err(|e| DashboardError::Validation(format!("manifest is not a {} object: {}", kind, e)))?;
        let ns = obj.metadata.namespace.clone().unwrap_or_else(|| "default".to_string());
        let created = self
            .api(kind, Some(&ns))
            .create(&PostParams::default(), &obj)
            .await
            .map_err(map_kube_err)?;
        info!(kind = %kind, name = ?created.metadata.name, "kube: create ok");
        shape(kind, &created)
    }

    async fn watch(&self, kind: Option<ResourceKind>, capacity: usize) -> DashboardResult<HintStream> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let kinds: Vec<ResourceKind> = match kind {
            Some(k) => vec![k],
            None => ResourceKind::ALL.to_vec(),
        };
        let tasks = kinds.into_iter().map(|k| self.spawn_watch(k, tx.clone())).collect();
        Ok(HintStream { rx, cancel: CancelHandle::new(tasks) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_resource_for_volcano_kinds() {
        let ar = api_resource(ResourceKind::PodGroup);
        assert_eq!(ar.group, "scheduling.volcano.sh");
        assert_eq!(ar.version, "v1beta1");
        assert_eq!(ar.plural, "podgroups");
        assert_eq!(ar.api_version, "scheduling.volcano.sh/v1beta1");
        assert_eq!(api_resource(ResourceKind::Pod).api_version, "v1");
    }

    #[test]
    fn api_errors_become_rejections() {
        let resp = kube::core::ErrorResponse {
            status: "Failure".into(),
            message: "quota exceeded".into(),
            reason: "Forbidden".into(),
            code: 403,
        };
        let e = map_kube_err(kube::Error::Api(resp));
        assert_eq!(e.to_string(), "quota exceeded");
        assert_eq!(e, DashboardError::ServerRejection { message: "quota exceeded".into(), details: Some("Forbidden".into()) });
    }
}
