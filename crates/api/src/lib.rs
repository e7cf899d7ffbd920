//! Caldera public façade (in-process).
//!
//! `Dashboard` wires the cluster adapter, session cache, filter/sort engine, pagination,
//! mutation coordinator and manifest editor together. Frontends (the CLI today) only talk
//! to this type.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Instant;

use caldera_apply::{ManifestEditor, Submission};
use caldera_core::prelude::*;
use caldera_kubehub::{ClusterApi, KubeCluster};
use caldera_ops::MutationCoordinator;
use caldera_search::Window;
use caldera_store::{AutoRefresh, EventBridge, InvalidateScope, ResourceCache, Subscription};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value as Json;
use tokio::sync::watch;
use tracing::{debug, info};

pub mod config;

pub use caldera_apply::{EditEvent, EventOutcome, KeyOrder, Representation};
pub use caldera_ops::MutationState;
pub use config::DashboardConfig;

/// What the list view asks for.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewRequest {
    pub kind: ResourceKind,
    pub filter: FilterState,
    pub sort: SortState,
    pub page: usize,
    /// Falls back to the configured page size.
    pub page_size: Option<usize>,
}

impl ViewRequest {
    pub fn new(kind: ResourceKind) -> Self {
        Self { kind, filter: FilterState::new(), sort: SortState::default(), page: 1, page_size: None }
    }

    pub fn filter(mut self, filter: FilterState) -> Self {
        self.filter = filter;
        self
    }

    pub fn sort(mut self, sort: SortState) -> Self {
        self.sort = sort;
        self
    }

    pub fn page(mut self, page: usize, page_size: Option<usize>) -> Self {
        self.page = page;
        self.page_size = page_size;
        self
    }
}

/// One rendered page.
#[derive(Debug, Clone, Serialize)]
pub struct View {
    pub query: QueryKey,
    pub window: Window<Resource>,
    /// Rows whose mutation has not been confirmed yet.
    pub pending: Vec<ResourceKey>,
    pub fetched_at: DateTime<Utc>,
}

pub struct Dashboard {
    config: DashboardConfig,
    cache: Arc<ResourceCache>,
    ops: Arc<MutationCoordinator>,
    active: watch::Sender<Option<QueryKey>>,
}

impl Dashboard {
    pub fn new(cluster: Arc<dyn ClusterApi>, config: DashboardConfig) -> Self {
        let cache = Arc::new(ResourceCache::new(cluster));
        let ops = Arc::new(MutationCoordinator::new(Arc::clone(&cache), config.confirm_delay));
        let (active, _) = watch::channel(None);
        Self { config, cache, ops, active }
    }

    /// Connect to the cluster from the ambient kubeconfig.
    pub async fn connect(config: DashboardConfig) -> DashboardResult<Self> {
        let cluster = KubeCluster::try_default().await?;
        Ok(Self::new(Arc::new(cluster), config))
    }

    pub fn config(&self) -> &DashboardConfig { &self.config }
    pub fn cache(&self) -> &Arc<ResourceCache> { &self.cache }
    pub fn ops(&self) -> &Arc<MutationCoordinator> { &self.ops }
    pub fn active_query(&self) -> Option<QueryKey> { self.active.borrow().clone() }

    fn query_for(&self, req: &ViewRequest, page: usize, page_size: usize) -> QueryKey {
        let q = QueryKey::from_filter(req.kind, &req.filter);
        if self.config.is_server_paged(req.kind) {
            q.with_page(Some(PageRequest::new(page, page_size)))
        } else {
            q
        }
    }

    /// Render one page: cached slot (fetched on miss), then filter, sort, clamp and slice.
    /// The query becomes the active view that hints and auto-refresh keep fresh.
    pub async fn view(&self, req: &ViewRequest) -> DashboardResult<View> {
        let t0 = Instant::now();
        let page_size = req.page_size.unwrap_or(self.config.page_size).max(1);
        let mut query = self.query_for(req, req.page, page_size);
        let mut slot = self.cache.get_or_refresh(&query).await?;

        if self.config.is_server_paged(req.kind) {
            let (clamped, _) = caldera_search::server_window(slot.total_count, req.page, page_size);
            if clamped != req.page.max(1) {
                debug!(kind = %req.kind, from = req.page, to = clamped, "api: server page clamped; refetching");
                query = self.query_for(req, clamped, page_size);
                slot = self.cache.get_or_refresh(&query).await?;
            }
        }
        self.active.send_replace(Some(query.clone()));

        let rows: Vec<Resource> = caldera_search::apply(slot.items.iter(), &req.filter, &req.sort).into_iter().cloned().collect();
        let window = if self.config.is_server_paged(req.kind) {
            Window::from_server(rows, slot.total_count, req.page, page_size)
        } else {
            Window::of(&rows, req.page, page_size)
        };
        let pending = window.rows.iter().map(|r| r.key()).filter(|k| slot.is_pending(k)).collect();
        info!(query = %query, rows = window.rows.len(), page = window.page, total_pages = window.total_pages, took_ms = %t0.elapsed().as_millis(), "api: view");
        Ok(View { query, window, pending, fetched_at: slot.fetched_at })
    }

    /// Manual refresh of one query; joins a fetch already in flight.
    pub async fn refresh(&self, query: &QueryKey) -> DashboardResult<()> {
        self.cache.refresh(query).await.map(|_| ())
    }

    /// Drop cached lists of `kind` so the next view refetches.
    pub fn invalidate(&self, kind: ResourceKind) { self.cache.invalidate(InvalidateScope::Kind(kind)); }

    pub async fn manifest(&self, key: &ResourceKey) -> DashboardResult<Json> { self.cache.cluster().get_manifest(key).await }

    /// YAML in the kind's configured key order.
    pub async fn manifest_text(&self, key: &ResourceKey) -> DashboardResult<String> {
        let manifest = self.manifest(key).await?;
        Ok(caldera_apply::to_text(&manifest, self.config.key_order.for_kind(key.kind)))
    }

    pub async fn open_editor(&self, key: &ResourceKey) -> DashboardResult<ManifestEditor> {
        let manifest = self.manifest(key).await?;
        Ok(ManifestEditor::edit(key.kind, manifest, self.config.key_order.for_kind(key.kind))?.with_budget(self.config.yaml_budget))
    }

    pub fn new_editor(&self, kind: ResourceKind, namespace: Option<&str>) -> ManifestEditor {
        ManifestEditor::create(kind, namespace, self.config.key_order.for_kind(kind)).with_budget(self.config.yaml_budget)
    }

    /// Send the editor's draft. Returns `None` when an edit changes nothing.
    pub async fn submit(&self, editor: &ManifestEditor) -> DashboardResult<Option<Resource>> {
        match editor.submission()? {
            Submission::Create { kind, manifest } => self.ops.create(kind, &manifest).await.map(Some),
            Submission::Update { key, plan } if plan.is_noop() => {
                debug!(key = %key, "api: nothing to submit");
                Ok(None)
            }
            Submission::Update { key, plan } => self.ops.update(&key, &plan.patch).await.map(Some),
        }
    }

    pub async fn delete(&self, key: &ResourceKey) -> DashboardResult<()> { self.ops.delete(key).await }

    /// Keep the active view fresh: push hints invalidate, and the periodic timer ticks
    /// (when configured). Dropping the returned guard stops both.
    pub async fn watch(&self, kind: Option<ResourceKind>) -> DashboardResult<Subscription> {
        let stream = self.cache.cluster().watch(kind, self.config.queue_cap).await?;
        let mut sub = EventBridge::spawn(Arc::clone(&self.cache), stream, self.active.subscribe());
        if let Some(period) = self.config.refresh {
            sub = sub.and(AutoRefresh::spawn(Arc::clone(&self.cache), period, self.active.subscribe()));
        }
        info!(kind = ?kind, refresh = ?self.config.refresh, "api: watching");
        Ok(sub)
    }

    /// Cancel pending confirmatory refetches and refuse further mutations.
    pub fn shutdown(&self) { self.ops.shutdown(); }
}
