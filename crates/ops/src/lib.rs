//! Caldera ops: delete/update/create with optimistic cache updates.
//!
//! Each mutation moves `Idle → Optimistic → Confirmed | RolledBack`. The cache shows the
//! optimistic result immediately; the cluster's answer either confirms it (and a delayed
//! refetch reconciles with server truth) or rolls it back with the server message verbatim.

#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use caldera_core::patch::split_display_safe;
use caldera_core::prelude::*;
use caldera_store::{CacheAction, InvalidateScope, Reduced, ResourceCache};
use metrics::counter;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const DEFAULT_CONFIRM_DELAY: Duration = Duration::from_millis(2000);
pub const MAX_CONFIRM_DELAY: Duration = Duration::from_millis(10_000);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum MutationState {
    #[default]
    Idle,
    Optimistic,
    Confirmed,
    RolledBack,
}

#[derive(Default)]
struct Tracked {
    states: FxHashMap<ResourceKey, MutationState>,
    refetches: Vec<JoinHandle<()>>,
}

pub struct MutationCoordinator {
    cache: Arc<ResourceCache>,
    confirm_delay: Duration,
    token: CancellationToken,
    tracked: Mutex<Tracked>,
}

impl MutationCoordinator {
    pub fn new(cache: Arc<ResourceCache>, confirm_delay: Duration) -> Self {
        Self { cache, confirm_delay: confirm_delay.min(MAX_CONFIRM_DELAY), token: CancellationToken::new(), tracked: Mutex::new(Tracked::default()) }
    }

    pub fn confirm_delay(&self) -> Duration { self.confirm_delay }

    fn lock(&self) -> MutexGuard<'_, Tracked> { self.tracked.lock().unwrap_or_else(|p| p.into_inner()) }

    /// Last known state of the mutation on `key`.
    pub fn state(&self, key: &ResourceKey) -> MutationState { self.lock().states.get(key).copied().unwrap_or_default() }

    fn set_state(&self, key: &ResourceKey, s: MutationState) {
        debug!(key = %key, state = ?s, "mutation state");
        self.lock().states.insert(key.clone(), s);
    }

    fn begin(&self, key: &ResourceKey, action: CacheAction, rollback: CacheAction) -> DashboardResult<InFlight<'_>> {
        if self.token.is_cancelled() {
            return Err(DashboardError::Cancelled);
        }
        if let Reduced::Busy = self.cache.dispatch(action) {
            return Err(DashboardError::Validation(format!("a change to {} is already in flight", key)));
        }
        self.set_state(key, MutationState::Optimistic);
        Ok(InFlight { ops: self, key: key.clone(), rollback: Some(rollback) })
    }

    pub async fn delete(&self, key: &ResourceKey) -> DashboardResult<()> {
        let t0 = Instant::now();
        let inflight = self.begin(key, CacheAction::DeleteOptimistic { key: key.clone() }, CacheAction::DeleteRolledBack { key: key.clone() })?;
        counter!("mutation_delete_total", 1);
        info!(key = %key, "ops: delete start");
        let answer = self.cache.cluster().delete(key).await;
        inflight.settle();
        match answer {
            Ok(()) => {
                self.cache.dispatch(CacheAction::DeleteConfirmed { key: key.clone() });
                self.set_state(key, MutationState::Confirmed);
                self.schedule_refetch(key.kind);
                info!(key = %key, took_ms = %t0.elapsed().as_millis(), "ops: delete ok");
                Ok(())
            }
            Err(e) => {
                self.cache.dispatch(CacheAction::DeleteRolledBack { key: key.clone() });
                self.set_state(key, MutationState::RolledBack);
                counter!("mutation_rollback_total", 1);
                warn!(key = %key, error = %e, "ops: delete rejected; rolled back");
                Err(e)
            }
        }
    }

    /// Send a merge patch. Label and annotation changes show up right away; the rest waits
    /// for the server's copy.
    pub async fn update(&self, key: &ResourceKey, patch: &Json) -> DashboardResult<Resource> {
        let t0 = Instant::now();
        let (display_safe, _) = split_display_safe(patch);
        let inflight =
            self.begin(key, CacheAction::UpdateOptimistic { key: key.clone(), patch: display_safe }, CacheAction::UpdateRolledBack { key: key.clone() })?;
        counter!("mutation_update_total", 1);
        info!(key = %key, "ops: update start");
        let answer = self.cache.cluster().update(key, patch).await;
        inflight.settle();
        match answer {
            Ok(server) => {
                self.cache.dispatch(CacheAction::UpdateConfirmed { key: key.clone(), server: server.clone() });
                self.set_state(key, MutationState::Confirmed);
                self.schedule_refetch(key.kind);
                info!(key = %key, took_ms = %t0.elapsed().as_millis(), "ops: update ok");
                Ok(server)
            }
            Err(e) => {
                self.cache.dispatch(CacheAction::UpdateRolledBack { key: key.clone() });
                self.set_state(key, MutationState::RolledBack);
                counter!("mutation_rollback_total", 1);
                warn!(key = %key, error = %e, "ops: update rejected; rolled back");
                Err(e)
            }
        }
    }

    /// No optimistic insert: the server assigns identity details. Cached lists of the kind
    /// are dropped on success.
    pub async fn create(&self, kind: ResourceKind, manifest: &Json) -> DashboardResult<Resource> {
        if self.token.is_cancelled() {
            return Err(DashboardError::Cancelled);
        }
        let created = self.cache.cluster().create(kind, manifest).await?;
        self.cache.invalidate(InvalidateScope::Kind(kind));
        self.set_state(&created.key(), MutationState::Confirmed);
        info!(key = %created.key(), "ops: create ok");
        Ok(created)
    }

    /// Refetch every cached query of `kind` after the confirm delay.
    fn schedule_refetch(&self, kind: ResourceKind) {
        let cache = Arc::clone(&self.cache);
        let token = self.token.clone();
        let delay = self.confirm_delay;
        let task = tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            let queries: Vec<QueryKey> = cache.snapshot().keys().filter(|q| q.kind == kind).cloned().collect();
            for q in queries {
                tokio::select! {
                    _ = token.cancelled() => return,
                    r = cache.refresh(&q) => if let Err(e) = r { warn!(query = %q, error = %e, "confirmatory refetch failed") },
                }
            }
        });
        let mut tracked = self.lock();
        tracked.refetches.retain(|t| !t.is_finished());
        tracked.refetches.push(task);
    }

    pub fn pending_refetches(&self) -> usize {
        let mut tracked = self.lock();
        tracked.refetches.retain(|t| !t.is_finished());
        tracked.refetches.len()
    }

    /// Cancel pending confirmatory refetches; none fire afterwards. Later mutations fail
    /// with `Cancelled`.
    pub fn shutdown(&self) {
        self.token.cancel();
        for t in self.lock().refetches.drain(..) {
            t.abort();
        }
        debug!("ops: coordinator shut down");
    }
}

/// An optimistic change waiting for the cluster. Dropped unsettled (the caller gave up on
/// the future), it rolls the change back so the key is free again.
struct InFlight<'a> {
    ops: &'a MutationCoordinator,
    key: ResourceKey,
    rollback: Option<CacheAction>,
}

impl InFlight<'_> {
    fn settle(mut self) { self.rollback = None; }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if let Some(action) = self.rollback.take() {
            self.ops.cache.dispatch(action);
            self.ops.set_state(&self.key, MutationState::RolledBack);
            counter!("mutation_abandoned_total", 1);
            warn!(key = %self.key, "ops: mutation dropped before the cluster answered; rolled back");
        }
    }
}

impl Drop for MutationCoordinator {
    fn drop(&mut self) { self.shutdown(); }
}
