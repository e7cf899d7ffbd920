//! In-memory `ClusterApi` for tests and demos.
//!
//! Objects are kept in insertion order, which is also the order list calls return. Failures
//! and latencies are scripted per call so cache and coordinator races can be reproduced
//! deterministically under a paused tokio clock.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use caldera_core::prelude::*;
use chrono::Utc;
use rustc_hash::FxHashMap;
use serde_json::Value as Json;
use tokio::sync::mpsc;

use crate::{page_of, CancelHandle, ChangeHint, ClusterApi, HintStream, ListPage};

#[derive(Default)]
struct MockState {
    objects: Vec<Resource>,
    list_calls: usize,
    list_delays: VecDeque<Duration>,
    list_errors: VecDeque<DashboardError>,
    fail_delete: FxHashMap<ResourceKey, DashboardError>,
    fail_update: FxHashMap<ResourceKey, DashboardError>,
    mutation_delay: Option<Duration>,
    watchers: Vec<mpsc::Sender<ChangeHint>>,
    next_rv: u64,
}

#[derive(Default)]
pub struct MockCluster {
    state: Mutex<MockState>,
}

impl MockCluster {
    pub fn new() -> Self { Self::default() }

    pub fn with_objects(objects: impl IntoIterator<Item = Resource>) -> Self {
        let m = Self::new();
        for o in objects {
            m.insert(o);
        }
        m
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        // a panicking test thread must not wedge the others
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Insert or replace (by identity) without emitting a hint.
    pub fn insert(&self, r: Resource) {
        let mut st = self.lock();
        match st.objects.iter().position(|o| o.key() == r.key()) {
            Some(i) => st.objects[i] = r,
            None => st.objects.push(r),
        }
    }

    /// Out-of-band removal, as if another client deleted it.
    pub fn remove(&self, key: &ResourceKey) -> Option<Resource> {
        let mut st = self.lock();
        let i = st.objects.iter().position(|o| &o.key() == key)?;
        Some(st.objects.remove(i))
    }

    pub fn objects(&self, kind: ResourceKind) -> Vec<Resource> {
        self.lock().objects.iter().filter(|o| o.kind == kind).cloned().collect()
    }

    pub fn list_calls(&self) -> usize { self.lock().list_calls }

    /// Delay the next list call (one entry per call, FIFO).
    pub fn push_list_delay(&self, d: Duration) { self.lock().list_delays.push_back(d); }

    /// Fail the next list call.
    pub fn push_list_error(&self, e: DashboardError) { self.lock().list_errors.push_back(e); }

    pub fn fail_delete(&self, key: ResourceKey, e: DashboardError) { self.lock().fail_delete.insert(key, e); }

    pub fn fail_update(&self, key: ResourceKey, e: DashboardError) { self.lock().fail_update.insert(key, e); }

    /// Latency applied to delete/update/create.
    pub fn set_mutation_delay(&self, d: Option<Duration>) { self.lock().mutation_delay = d; }

    /// Push a hint to every live watcher. Closed or full channels are skipped.
    pub fn emit(&self, hint: ChangeHint) {
        let mut st = self.lock();
        st.watchers.retain(|tx| match tx.try_send(hint.clone()) {
            Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => true,
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }

    pub fn watcher_count(&self) -> usize {
        let mut st = self.lock();
        st.watchers.retain(|tx| !tx.is_closed());
        st.watchers.len()
    }

    async fn mutation_pause(&self) {
        let delay = self.lock().mutation_delay;
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }
    }
}

#[async_trait::async_trait]
impl ClusterApi for MockCluster {
    async fn list(&self, kind: ResourceKind, query: &ListQuery) -> DashboardResult<ListPage> {
        // Snapshot at request time so a slow response carries older data.
        let (delay, outcome) = {
            let mut st = self.lock();
            st.list_calls += 1;
            let delay = st.list_delays.pop_front();
            let outcome = match st.list_errors.pop_front() {
                Some(e) => Err(e),
                None => Ok(page_of(st.objects.iter().filter(|o| o.kind == kind).cloned(), query)),
            };
            (delay, outcome)
        };
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }
        outcome
    }

    async fn get_manifest(&self, key: &ResourceKey) -> DashboardResult<Json> {
        self.lock()
            .objects
            .iter()
            .find(|o| &o.key() == key)
            .map(|o| o.to_manifest())
            .ok_or_else(|| DashboardError::NotFound(key.to_string()))
    }

    async fn delete(&self, key: &ResourceKey) -> DashboardResult<()> {
        self.mutation_pause().await;
        let mut st = self.lock();
        if let Some(e) = st.fail_delete.remove(key) {
            return Err(e);
        }
        let i = st
            .objects
            .iter()
            .position(|o| &o.key() == key)
            .ok_or_else(|| DashboardError::rejection(format!("{} \"{}\" not found", key.kind.plural(), key.name)))?;
        st.objects.remove(i);
        Ok(())
    }

    async fn update(&self, key: &ResourceKey, patch: &Json) -> DashboardResult<Resource> {
        self.mutation_pause().await;
        let mut st = self.lock();
        if let Some(e) = st.fail_update.remove(key) {
            return Err(e);
        }
        st.next_rv += 1;
        let rv = st.next_rv;
        let slot = st
            .objects
            .iter_mut()
            .find(|o| &o.key() == key)
            .ok_or_else(|| DashboardError::rejection(format!("{} \"{}\" not found", key.kind.plural(), key.name)))?;
        let mut next = slot.with_patch(patch)?;
        next.resource_version = Some(format!("mock-{}", rv));
        *slot = next.clone();
        Ok(next)
    }

    async fn create(&self, kind: ResourceKind, manifest: &Json) -> DashboardResult<Resource> {
        self.mutation_pause().await;
        let mut r = Resource::from_manifest(kind, manifest)?;
        if kind.namespaced() && r.namespace.is_empty() {
            r.namespace = "default".into();
        }
        let mut st = self.lock();
        if st.objects.iter().any(|o| o.key() == r.key()) {
            return Err(DashboardError::rejection(format!("{} \"{}\" already exists", kind.plural(), r.name)));
        }
        st.next_rv += 1;
        r.uid = Some(uuid::Uuid::new_v4().to_string());
        r.resource_version = Some(format!("mock-{}", st.next_rv));
        r.creation_timestamp = Utc::now();
        st.objects.push(r.clone());
        Ok(r)
    }

    async fn watch(&self, _kind: Option<ResourceKind>, capacity: usize) -> DashboardResult<HintStream> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        self.lock().watchers.push(tx);
        Ok(HintStream { rx, cancel: CancelHandle::default() })
    }
}
