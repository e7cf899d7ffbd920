//! Cache state and the reducer every transition goes through.
//!
//! Slots are never patched in place: each action builds a fresh `CacheSlot` and swaps the
//! `Arc`, so readers holding an older snapshot keep a consistent view.

use std::sync::Arc;

use caldera_core::prelude::*;
use caldera_kubehub::ListPage;
use chrono::{DateTime, Utc};
use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::Value as Json;
use tracing::{debug, warn};

/// One cached list result.
#[derive(Debug, Clone)]
pub struct CacheSlot {
    pub query: QueryKey,
    /// Server order.
    pub items: Vec<Resource>,
    /// Server count, adjusted for optimistic deletes still in flight.
    pub total_count: usize,
    pub fetched_at: DateTime<Utc>,
    /// Sequence number of the fetch that produced this slot.
    pub seq: u64,
    /// Keys with an optimistic mutation in flight.
    pub pending: FxHashSet<ResourceKey>,
}

impl CacheSlot {
    pub fn position(&self, key: &ResourceKey) -> Option<usize> { self.items.iter().position(|r| &r.key() == key) }

    pub fn is_pending(&self, key: &ResourceKey) -> bool { self.pending.contains(key) }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidateScope {
    All,
    Kind(ResourceKind),
    Query(QueryKey),
}

impl InvalidateScope {
    pub fn covers(&self, q: &QueryKey) -> bool {
        match self {
            InvalidateScope::All => true,
            InvalidateScope::Kind(k) => q.kind == *k,
            InvalidateScope::Query(key) => key == q,
        }
    }
}

#[derive(Debug, Clone)]
pub enum CacheAction {
    FetchStarted { query: QueryKey },
    FetchSucceeded { query: QueryKey, seq: u64, page: ListPage, at: DateTime<Utc> },
    FetchFailed { query: QueryKey, seq: u64 },
    DeleteOptimistic { key: ResourceKey },
    DeleteConfirmed { key: ResourceKey },
    DeleteRolledBack { key: ResourceKey },
    /// `patch` holds only display-safe fields.
    UpdateOptimistic { key: ResourceKey, patch: Option<Json> },
    UpdateConfirmed { key: ResourceKey, server: Resource },
    UpdateRolledBack { key: ResourceKey },
    Invalidate { scope: InvalidateScope },
}

#[derive(Debug, Clone)]
pub enum Reduced {
    /// A fetch was issued with this sequence number.
    Issued(u64),
    /// A fetch result was accepted into this slot.
    Slot(Arc<CacheSlot>),
    /// A fetch result lost to a newer request and was dropped.
    Stale,
    /// Number of slots rewritten.
    Changed(usize),
    /// A mutation is already in flight for the key.
    Busy,
}

/// Where a resource sat in a slot when an optimistic step touched it.
#[derive(Debug, Clone)]
struct Touched {
    query: QueryKey,
    seq: u64,
    index: usize,
    resource: Resource,
}

#[derive(Debug, Clone)]
enum PendingMutation {
    Delete { removed: Vec<Touched> },
    Update { previous: Vec<Touched> },
}

#[derive(Debug, Default)]
pub struct CacheState {
    slots: FxHashMap<QueryKey, Arc<CacheSlot>>,
    issued: FxHashMap<QueryKey, u64>,
    pending: FxHashMap<ResourceKey, PendingMutation>,
}

impl CacheState {
    pub fn new() -> Self { Self::default() }

    pub fn slots(&self) -> &FxHashMap<QueryKey, Arc<CacheSlot>> { &self.slots }

    pub fn latest_issued(&self, query: &QueryKey) -> u64 { self.issued.get(query).copied().unwrap_or(0) }

    pub fn has_pending(&self, key: &ResourceKey) -> bool { self.pending.contains_key(key) }

    pub fn reduce(&mut self, action: CacheAction) -> Reduced {
        match action {
            CacheAction::FetchStarted { query } => Reduced::Issued(self.bump(&query)),
            CacheAction::FetchSucceeded { query, seq, page, at } => {
                if self.latest_issued(&query) != seq {
                    debug!(query = %query, seq, latest = self.latest_issued(&query), "stale fetch discarded");
                    return Reduced::Stale;
                }
                let slot = Arc::new(self.shape_fetched(query.clone(), seq, page, at));
                self.slots.insert(query, slot.clone());
                Reduced::Slot(slot)
            }
            CacheAction::FetchFailed { query, seq } => {
                if self.latest_issued(&query) != seq { Reduced::Stale } else { Reduced::Changed(0) }
            }
            CacheAction::DeleteOptimistic { key } => self.delete_optimistic(key),
            CacheAction::DeleteConfirmed { key } => self.delete_confirmed(key),
            CacheAction::DeleteRolledBack { key } => self.delete_rolled_back(key),
            CacheAction::UpdateOptimistic { key, patch } => self.update_optimistic(key, patch),
            CacheAction::UpdateConfirmed { key, server } => self.update_confirmed(key, server),
            CacheAction::UpdateRolledBack { key } => self.update_rolled_back(key),
            CacheAction::Invalidate { scope } => {
                let before = self.slots.len();
                self.slots.retain(|q, _| !scope.covers(q));
                let keys: Vec<QueryKey> = self.issued.keys().filter(|q| scope.covers(q)).cloned().collect();
                for q in keys {
                    self.bump(&q);
                }
                Reduced::Changed(before - self.slots.len())
            }
        }
    }

    fn bump(&mut self, query: &QueryKey) -> u64 {
        let seq = self.issued.entry(query.clone()).or_insert(0);
        *seq += 1;
        *seq
    }

    /// Build a slot from a server page. Rows under a pending delete stay hidden and out of
    /// the count; each is recorded against the new slot so a rollback can put it back.
    fn shape_fetched(&mut self, query: QueryKey, seq: u64, page: ListPage, at: DateTime<Utc>) -> CacheSlot {
        let mut items = Vec::with_capacity(page.items.len());
        let mut total_count = page.total_count;
        let mut pending = FxHashSet::default();
        for r in page.items {
            let key = r.key();
            match self.pending.get_mut(&key) {
                Some(PendingMutation::Delete { removed }) => {
                    removed.retain(|t| t.query != query);
                    removed.push(Touched { query: query.clone(), seq, index: items.len(), resource: r });
                    total_count = total_count.saturating_sub(1);
                    pending.insert(key);
                }
                Some(PendingMutation::Update { .. }) => {
                    pending.insert(key);
                    items.push(r);
                }
                None => items.push(r),
            }
        }
        CacheSlot { query, items, total_count, fetched_at: at, seq, pending }
    }

    /// Rewrite every slot for which `f` returns a replacement.
    fn rewrite(&mut self, mut f: impl FnMut(&CacheSlot) -> Option<CacheSlot>) -> usize {
        let mut n = 0;
        for slot in self.slots.values_mut() {
            if let Some(next) = f(slot.as_ref()) {
                *slot = Arc::new(next);
                n += 1;
            }
        }
        n
    }

    fn delete_optimistic(&mut self, key: ResourceKey) -> Reduced {
        if self.pending.contains_key(&key) {
            return Reduced::Busy;
        }
        let mut removed = Vec::new();
        let n = self.rewrite(|slot| {
            let index = slot.position(&key)?;
            let mut next = slot.clone();
            let resource = next.items.remove(index);
            next.total_count = next.total_count.saturating_sub(1);
            next.pending.insert(key.clone());
            removed.push(Touched { query: slot.query.clone(), seq: slot.seq, index, resource });
            Some(next)
        });
        self.pending.insert(key, PendingMutation::Delete { removed });
        Reduced::Changed(n)
    }

    fn delete_confirmed(&mut self, key: ResourceKey) -> Reduced {
        self.pending.remove(&key);
        // Slots fetched while the delete was in flight may still list it.
        let n = self.rewrite(|slot| {
            let index = slot.position(&key);
            if index.is_none() && !slot.pending.contains(&key) {
                return None;
            }
            let mut next = slot.clone();
            next.pending.remove(&key);
            if let Some(i) = index {
                next.items.remove(i);
                next.total_count = next.total_count.saturating_sub(1);
            }
            Some(next)
        });
        Reduced::Changed(n)
    }

    fn delete_rolled_back(&mut self, key: ResourceKey) -> Reduced {
        let Some(PendingMutation::Delete { removed }) = self.pending.remove(&key) else {
            return Reduced::Changed(0);
        };
        let mut n = 0;
        for t in removed {
            let Some(slot) = self.slots.get_mut(&t.query) else { continue };
            if slot.seq != t.seq {
                debug!(key = %key, query = %t.query, "slot refetched since delete; rollback skipped");
                continue;
            }
            let mut next = CacheSlot::clone(slot);
            next.pending.remove(&key);
            if next.position(&key).is_none() {
                let at = t.index.min(next.items.len());
                next.items.insert(at, t.resource);
                next.total_count += 1;
            }
            *slot = Arc::new(next);
            n += 1;
        }
        n += self.clear_pending_marks(&key);
        warn!(key = %key, slots = n, "delete rolled back");
        Reduced::Changed(n)
    }

    fn update_optimistic(&mut self, key: ResourceKey, patch: Option<Json>) -> Reduced {
        if self.pending.contains_key(&key) {
            return Reduced::Busy;
        }
        let mut previous = Vec::new();
        let n = self.rewrite(|slot| {
            let index = slot.position(&key)?;
            let mut next = slot.clone();
            next.pending.insert(key.clone());
            if let Some(p) = &patch {
                match next.items[index].with_patch(p) {
                    Ok(patched) => next.items[index] = patched,
                    Err(e) => warn!(key = %key, error = %e, "optimistic patch not applicable"),
                }
            }
            previous.push(Touched { query: slot.query.clone(), seq: slot.seq, index, resource: slot.items[index].clone() });
            Some(next)
        });
        self.pending.insert(key, PendingMutation::Update { previous });
        Reduced::Changed(n)
    }

    fn update_confirmed(&mut self, key: ResourceKey, server: Resource) -> Reduced {
        self.pending.remove(&key);
        let n = self.rewrite(|slot| {
            let index = slot.position(&key);
            if index.is_none() && !slot.pending.contains(&key) {
                return None;
            }
            let mut next = slot.clone();
            next.pending.remove(&key);
            if let Some(i) = index {
                next.items[i] = server.clone();
            }
            Some(next)
        });
        Reduced::Changed(n)
    }

    fn update_rolled_back(&mut self, key: ResourceKey) -> Reduced {
        let Some(PendingMutation::Update { previous }) = self.pending.remove(&key) else {
            return Reduced::Changed(0);
        };
        let mut n = 0;
        for t in previous {
            let Some(slot) = self.slots.get_mut(&t.query) else { continue };
            if slot.seq != t.seq {
                continue;
            }
            let mut next = CacheSlot::clone(slot);
            next.pending.remove(&key);
            match next.position(&key) {
                Some(i) => next.items[i] = t.resource,
                None => {
                    let at = t.index.min(next.items.len());
                    next.items.insert(at, t.resource);
                }
            }
            *slot = Arc::new(next);
            n += 1;
        }
        n += self.clear_pending_marks(&key);
        warn!(key = %key, slots = n, "update rolled back");
        Reduced::Changed(n)
    }

    fn clear_pending_marks(&mut self, key: &ResourceKey) -> usize {
        self.rewrite(|slot| {
            if !slot.pending.contains(key) {
                return None;
            }
            let mut next = slot.clone();
            next.pending.remove(key);
            Some(next)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn job(name: &str) -> Resource {
        Resource::from_manifest(ResourceKind::Job, &json!({ "metadata": { "name": name, "namespace": "ns", "labels": { "v": "1" } } })).unwrap()
    }

    fn names(slot: &CacheSlot) -> Vec<&str> { slot.items.iter().map(|r| r.name.as_str()).collect() }

    fn seeded(q: &QueryKey) -> CacheState {
        let mut st = CacheState::new();
        let Reduced::Issued(seq) = st.reduce(CacheAction::FetchStarted { query: q.clone() }) else { panic!() };
        let page = ListPage { items: vec![job("a"), job("b"), job("c")], total_count: 3 };
        st.reduce(CacheAction::FetchSucceeded { query: q.clone(), seq, page, at: Utc::now() });
        st
    }

    #[test]
    fn only_latest_sequence_applies() {
        let q = QueryKey::new(ResourceKind::Job);
        let mut st = CacheState::new();
        let Reduced::Issued(first) = st.reduce(CacheAction::FetchStarted { query: q.clone() }) else { panic!() };
        let Reduced::Issued(second) = st.reduce(CacheAction::FetchStarted { query: q.clone() }) else { panic!() };
        let newer = ListPage { items: vec![job("new")], total_count: 1 };
        assert!(matches!(st.reduce(CacheAction::FetchSucceeded { query: q.clone(), seq: second, page: newer, at: Utc::now() }), Reduced::Slot(_)));
        let older = ListPage { items: vec![job("old")], total_count: 1 };
        assert!(matches!(st.reduce(CacheAction::FetchSucceeded { query: q.clone(), seq: first, page: older, at: Utc::now() }), Reduced::Stale));
        assert_eq!(names(&st.slots()[&q]), vec!["new"]);
    }

    #[test]
    fn invalidate_makes_in_flight_results_stale() {
        let q = QueryKey::new(ResourceKind::Job);
        let mut st = seeded(&q);
        let Reduced::Issued(seq) = st.reduce(CacheAction::FetchStarted { query: q.clone() }) else { panic!() };
        st.reduce(CacheAction::Invalidate { scope: InvalidateScope::Kind(ResourceKind::Job) });
        assert!(st.slots().is_empty());
        let page = ListPage { items: vec![], total_count: 0 };
        assert!(matches!(st.reduce(CacheAction::FetchSucceeded { query: q, seq, page, at: Utc::now() }), Reduced::Stale));
    }

    #[test]
    fn delete_rollback_restores_position_and_count() {
        let q = QueryKey::new(ResourceKind::Job);
        let mut st = seeded(&q);
        let key = job("b").key();
        st.reduce(CacheAction::DeleteOptimistic { key: key.clone() });
        assert_eq!(names(&st.slots()[&q]), vec!["a", "c"]);
        assert_eq!(st.slots()[&q].total_count, 2);
        assert!(st.slots()[&q].is_pending(&key));
        assert!(matches!(st.reduce(CacheAction::DeleteOptimistic { key: key.clone() }), Reduced::Busy));
        st.reduce(CacheAction::DeleteRolledBack { key: key.clone() });
        assert_eq!(names(&st.slots()[&q]), vec!["a", "b", "c"]);
        assert_eq!(st.slots()[&q].total_count, 3);
        assert!(!st.slots()[&q].is_pending(&key));
        assert!(!st.has_pending(&key));
    }

    #[test]
    fn rollback_skips_refetched_slot() {
        let q = QueryKey::new(ResourceKind::Job);
        let mut st = seeded(&q);
        let key = job("b").key();
        st.reduce(CacheAction::DeleteOptimistic { key: key.clone() });
        let Reduced::Issued(seq) = st.reduce(CacheAction::FetchStarted { query: q.clone() }) else { panic!() };
        let page = ListPage { items: vec![job("a"), job("c")], total_count: 2 };
        st.reduce(CacheAction::FetchSucceeded { query: q.clone(), seq, page, at: Utc::now() });
        st.reduce(CacheAction::DeleteRolledBack { key });
        assert_eq!(names(&st.slots()[&q]), vec!["a", "c"]);
        assert_eq!(st.slots()[&q].total_count, 2);
    }

    #[test]
    fn refetch_during_pending_delete_keeps_row_hidden() {
        let q = QueryKey::new(ResourceKind::Job);
        let mut st = seeded(&q);
        let key = job("b").key();
        st.reduce(CacheAction::DeleteOptimistic { key: key.clone() });
        let Reduced::Issued(seq) = st.reduce(CacheAction::FetchStarted { query: q.clone() }) else { panic!() };
        let page = ListPage { items: vec![job("a"), job("b"), job("c")], total_count: 3 };
        st.reduce(CacheAction::FetchSucceeded { query: q.clone(), seq, page, at: Utc::now() });
        assert_eq!(names(&st.slots()[&q]), vec!["a", "c"]);
        assert_eq!(st.slots()[&q].total_count, 2);
        assert!(st.slots()[&q].is_pending(&key));

        // rollback targets the refetched slot
        st.reduce(CacheAction::DeleteRolledBack { key: key.clone() });
        assert_eq!(names(&st.slots()[&q]), vec!["a", "b", "c"]);
        assert_eq!(st.slots()[&q].total_count, 3);
        assert!(st.slots()[&q].pending.is_empty());
    }

    #[test]
    fn confirmed_delete_strips_refetched_copy() {
        let q = QueryKey::new(ResourceKind::Job);
        let mut st = seeded(&q);
        let key = job("b").key();
        st.reduce(CacheAction::DeleteOptimistic { key: key.clone() });
        let Reduced::Issued(seq) = st.reduce(CacheAction::FetchStarted { query: q.clone() }) else { panic!() };
        let page = ListPage { items: vec![job("a"), job("b"), job("c")], total_count: 3 };
        st.reduce(CacheAction::FetchSucceeded { query: q.clone(), seq, page, at: Utc::now() });
        assert!(st.slots()[&q].is_pending(&key));
        st.reduce(CacheAction::DeleteConfirmed { key: key.clone() });
        assert_eq!(names(&st.slots()[&q]), vec!["a", "c"]);
        assert_eq!(st.slots()[&q].total_count, 2);
        assert!(st.slots()[&q].pending.is_empty());
    }

    #[test]
    fn update_applies_labels_then_rolls_back() {
        let q = QueryKey::new(ResourceKind::Job);
        let mut st = seeded(&q);
        let key = job("a").key();
        let before = Arc::clone(&st.slots()[&q]);
        st.reduce(CacheAction::UpdateOptimistic { key: key.clone(), patch: Some(json!({ "metadata": { "labels": { "v": "2" } } })) });
        assert_eq!(st.slots()[&q].items[0].label("v"), Some("2"));
        // copy-on-write: earlier snapshot untouched
        assert_eq!(before.items[0].label("v"), Some("1"));
        st.reduce(CacheAction::UpdateRolledBack { key });
        assert_eq!(st.slots()[&q].items[0].label("v"), Some("1"));
    }

    #[test]
    fn update_confirmed_takes_server_copy() {
        let q = QueryKey::new(ResourceKind::Job);
        let mut st = seeded(&q);
        let key = job("c").key();
        st.reduce(CacheAction::UpdateOptimistic { key: key.clone(), patch: None });
        let mut server = job("c");
        server.spec = json!({ "minAvailable": 4 });
        st.reduce(CacheAction::UpdateConfirmed { key: key.clone(), server });
        assert_eq!(st.slots()[&q].items[2].spec["minAvailable"], 4);
        assert!(!st.has_pending(&key));
    }
}
