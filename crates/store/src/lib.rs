//! Caldera store: the session cache of list results.
//!
//! Readers call [`ResourceCache::get`] and receive an immutable snapshot; all writes go
//! through [`CacheState::reduce`] under one lock and are published with an `ArcSwap`.
//! Fetches are single-flight per `QueryKey`: a manual refresh joins the fetch already in
//! flight, a timer tick skips it.

#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use arc_swap::ArcSwap;
use caldera_core::prelude::*;
use caldera_kubehub::ClusterApi;
use chrono::Utc;
use metrics::{counter, gauge, histogram};
use rustc_hash::FxHashMap;
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub mod bridge;
pub mod reducer;

pub use bridge::{AutoRefresh, EventBridge, Subscription};
pub use reducer::{CacheAction, CacheSlot, CacheState, InvalidateScope, Reduced};

type FlightResult = DashboardResult<Arc<CacheSlot>>;

struct Flight {
    seq: u64,
    rx: watch::Receiver<Option<FlightResult>>,
}

impl Flight {
    /// A leader that was dropped mid-fetch leaves its sender closed.
    fn is_live(&self) -> bool { self.rx.has_changed().is_ok() }
}

#[derive(Default)]
struct Inner {
    state: CacheState,
    flights: FxHashMap<QueryKey, Flight>,
    epoch: u64,
}

enum Begin {
    Lead(u64, watch::Sender<Option<FlightResult>>),
    Join(watch::Receiver<Option<FlightResult>>),
}

pub type Slots = FxHashMap<QueryKey, Arc<CacheSlot>>;

pub struct ResourceCache {
    cluster: Arc<dyn ClusterApi>,
    inner: Mutex<Inner>,
    published: ArcSwap<Slots>,
    epoch_tx: watch::Sender<u64>,
}

impl ResourceCache {
    pub fn new(cluster: Arc<dyn ClusterApi>) -> Self {
        let (epoch_tx, _) = watch::channel(0u64);
        Self { cluster, inner: Mutex::new(Inner::default()), published: ArcSwap::from_pointee(Slots::default()), epoch_tx }
    }

    pub fn cluster(&self) -> &Arc<dyn ClusterApi> { &self.cluster }

    fn lock(&self) -> MutexGuard<'_, Inner> { self.inner.lock().unwrap_or_else(|p| p.into_inner()) }

    /// Current snapshot of one slot.
    pub fn get(&self, query: &QueryKey) -> Option<Arc<CacheSlot>> { self.published.load().get(query).cloned() }

    /// Every slot, as of the last publish.
    pub fn snapshot(&self) -> Arc<Slots> { self.published.load_full() }

    /// Bumped on every publish.
    pub fn subscribe(&self) -> watch::Receiver<u64> { self.epoch_tx.subscribe() }

    pub fn has_pending(&self, key: &ResourceKey) -> bool { self.lock().state.has_pending(key) }

    pub fn in_flight(&self, query: &QueryKey) -> bool { self.lock().flights.get(query).map(|f| f.is_live()).unwrap_or(false) }

    fn publish(&self, inner: &mut Inner) {
        inner.epoch += 1;
        let slots: Slots = inner.state.slots().clone();
        gauge!("cache_slots", slots.len() as f64);
        self.published.store(Arc::new(slots));
        self.epoch_tx.send_replace(inner.epoch);
    }

    /// Run one action through the reducer and publish if anything changed.
    pub fn dispatch(&self, action: CacheAction) -> Reduced {
        let mut inner = self.lock();
        let out = inner.state.reduce(action);
        if matches!(out, Reduced::Slot(_)) || matches!(out, Reduced::Changed(n) if n > 0) {
            self.publish(&mut inner);
        }
        out
    }

    /// Drop matching slots and outdate any fetch already issued for them.
    pub fn invalidate(&self, scope: InvalidateScope) {
        let mut inner = self.lock();
        inner.state.reduce(CacheAction::Invalidate { scope: scope.clone() });
        inner.flights.retain(|q, _| !scope.covers(q));
        debug!(scope = ?scope, "cache invalidated");
        self.publish(&mut inner);
    }

    fn begin(&self, query: &QueryKey, join: bool) -> Option<Begin> {
        let mut inner = self.lock();
        if let Some(f) = inner.flights.get(query) {
            if f.is_live() {
                return if join { Some(Begin::Join(f.rx.clone())) } else { None };
            }
        }
        let Reduced::Issued(seq) = inner.state.reduce(CacheAction::FetchStarted { query: query.clone() }) else {
            return None;
        };
        let (tx, rx) = watch::channel(None);
        inner.flights.insert(query.clone(), Flight { seq, rx });
        Some(Begin::Lead(seq, tx))
    }

    async fn run_fetch(&self, query: &QueryKey, seq: u64, tx: watch::Sender<Option<FlightResult>>) -> FlightResult {
        let t0 = Instant::now();
        counter!("cache_fetch_total", 1);
        let res = self.cluster.list(query.kind, &query.to_list_query()).await;
        histogram!("cache_fetch_ms", t0.elapsed().as_secs_f64() * 1000.0);
        let outcome = {
            let mut inner = self.lock();
            if inner.flights.get(query).map(|f| f.seq == seq).unwrap_or(false) {
                inner.flights.remove(query);
            }
            let action = match &res {
                Ok(page) => CacheAction::FetchSucceeded { query: query.clone(), seq, page: page.clone(), at: Utc::now() },
                Err(_) => CacheAction::FetchFailed { query: query.clone(), seq },
            };
            match (inner.state.reduce(action), res) {
                (Reduced::Stale, _) => {
                    counter!("cache_stale_discard_total", 1);
                    Err(DashboardError::StaleResponse)
                }
                (Reduced::Slot(slot), _) => {
                    self.publish(&mut inner);
                    info!(query = %query, seq, items = slot.items.len(), total = slot.total_count, took_ms = %t0.elapsed().as_millis(), "cache: fetch ok");
                    Ok(slot)
                }
                (_, Err(e)) => {
                    counter!("cache_fetch_err_total", 1);
                    warn!(query = %query, seq, error = %e, "cache: fetch failed");
                    Err(e)
                }
                (_, Ok(_)) => Err(DashboardError::StaleResponse),
            }
        };
        tx.send_replace(Some(outcome.clone()));
        outcome
    }

    /// Fetch `query` and return the resulting slot. Joins a fetch already in flight; a
    /// result outdated by a newer request or an invalidation is retried, never returned.
    pub async fn refresh(&self, query: &QueryKey) -> DashboardResult<Arc<CacheSlot>> {
        loop {
            let Some(begin) = self.begin(query, true) else { continue };
            let outcome = match begin {
                Begin::Lead(seq, tx) => self.run_fetch(query, seq, tx).await,
                Begin::Join(rx) => match wait_flight(rx).await {
                    Some(r) => r,
                    None => continue,
                },
            };
            match outcome {
                Err(DashboardError::StaleResponse) => continue,
                other => return other,
            }
        }
    }

    /// Timer-driven refresh. A no-op while a fetch for the same query is in flight.
    pub async fn tick(&self, query: &QueryKey) -> DashboardResult<Option<Arc<CacheSlot>>> {
        let Some(Begin::Lead(seq, tx)) = self.begin(query, false) else {
            counter!("cache_tick_skipped_total", 1);
            debug!(query = %query, "tick skipped; fetch in flight");
            return Ok(None);
        };
        match self.run_fetch(query, seq, tx).await {
            Ok(slot) => Ok(Some(slot)),
            Err(DashboardError::StaleResponse) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Cached slot, or fetch it.
    pub async fn get_or_refresh(&self, query: &QueryKey) -> DashboardResult<Arc<CacheSlot>> {
        match self.get(query) {
            Some(slot) => Ok(slot),
            None => self.refresh(query).await,
        }
    }
}

/// `None` when the leader went away without publishing.
async fn wait_flight(mut rx: watch::Receiver<Option<FlightResult>>) -> Option<FlightResult> {
    loop {
        if let Some(r) = rx.borrow_and_update().clone() {
            return Some(r);
        }
        if rx.changed().await.is_err() {
            return rx.borrow().clone();
        }
    }
}
