//! Query identity, filter and sort state.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::columns::Column;
use crate::{Resource, ResourceKind};

/// Filter value meaning "no constraint". Compared case-insensitively; empty also counts.
pub const ALL_SENTINEL: &str = "All";

pub fn is_sentinel(value: &str) -> bool {
    let v = value.trim();
    v.is_empty() || v.eq_ignore_ascii_case(ALL_SENTINEL)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FilterDimension {
    Namespace,
    Queue,
    Status,
}

impl FilterDimension {
    pub const ALL: [FilterDimension; 3] = [FilterDimension::Namespace, FilterDimension::Queue, FilterDimension::Status];

    /// The resource field this dimension constrains.
    pub fn resolve(&self, r: &Resource) -> Option<String> {
        match self {
            FilterDimension::Namespace => Some(r.namespace.clone()).filter(|ns| !ns.is_empty()),
            FilterDimension::Queue => r.queue().map(|s| s.to_string()),
            FilterDimension::Status => Some(r.phase()),
        }
    }
}

/// Dimension → constraint. Sentinel values are never stored, so a predicate never sees them.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct FilterState {
    constraints: BTreeMap<FilterDimension, String>,
    search: Option<String>,
}

impl FilterState {
    pub fn new() -> Self { Self::default() }

    pub fn set(&mut self, dim: FilterDimension, value: impl Into<String>) {
        let value = value.into();
        if is_sentinel(&value) {
            self.constraints.remove(&dim);
        } else {
            self.constraints.insert(dim, value.trim().to_string());
        }
    }

    pub fn with(mut self, dim: FilterDimension, value: impl Into<String>) -> Self {
        self.set(dim, value);
        self
    }

    pub fn set_search(&mut self, needle: impl Into<String>) {
        let needle = needle.into();
        let needle = needle.trim();
        self.search = if needle.is_empty() { None } else { Some(needle.to_string()) };
    }

    pub fn constraint(&self, dim: FilterDimension) -> Option<&str> { self.constraints.get(&dim).map(|s| s.as_str()) }

    pub fn search(&self) -> Option<&str> { self.search.as_deref() }

    pub fn dimensions(&self) -> impl Iterator<Item = (FilterDimension, &str)> {
        self.constraints.iter().map(|(d, v)| (*d, v.as_str()))
    }

    pub fn matches(&self, r: &Resource) -> bool {
        if let Some(needle) = &self.search {
            if !name_contains(&r.name, needle) {
                return false;
            }
        }
        self.constraints.iter().all(|(dim, want)| dim_matches(*dim, want, r))
    }
}

fn name_contains(name: &str, needle: &str) -> bool { name.to_lowercase().contains(&needle.to_lowercase()) }

/// Exact match against the resolved field. A missing field never matches a real constraint.
pub fn dim_matches(dim: FilterDimension, want: &str, r: &Resource) -> bool {
    dim.resolve(r).map(|have| have == want).unwrap_or(false)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub enum SortDirection {
    Asc,
    #[default]
    Desc,
}

/// `field: None` keeps server order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct SortState {
    pub field: Option<Column>,
    pub direction: SortDirection,
}

impl Default for SortState {
    /// Newest first.
    fn default() -> Self { Self { field: Some(Column::Created), direction: SortDirection::Desc } }
}

impl SortState {
    pub fn server_order() -> Self { Self { field: None, direction: SortDirection::Asc } }

    pub fn by(field: Column, direction: SortDirection) -> Self { Self { field: Some(field), direction } }
}

/// 1-indexed page request sent to kinds that paginate on the server.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct PageRequest {
    page: usize,
    page_size: usize,
}

impl PageRequest {
    pub fn new(page: usize, page_size: usize) -> Self { Self { page: page.max(1), page_size: page_size.max(1) } }

    pub fn page(&self) -> usize { self.page.max(1) }

    pub fn page_size(&self) -> usize { self.page_size.max(1) }

    pub fn offset(&self) -> usize { (self.page() - 1) * self.page_size() }
}

/// Arguments to a list call. Same fields as [`QueryKey`] minus the kind.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ListQuery {
    pub namespace: Option<String>,
    pub search: Option<String>,
    pub queue: Option<String>,
    pub status: Option<String>,
    pub page: Option<PageRequest>,
}

impl ListQuery {
    /// Server-side filter semantics, shared by the in-memory and Kubernetes adapters.
    pub fn matches(&self, r: &Resource) -> bool {
        if let Some(needle) = &self.search {
            if !name_contains(&r.name, needle) {
                return false;
            }
        }
        [
            (FilterDimension::Namespace, &self.namespace),
            (FilterDimension::Queue, &self.queue),
            (FilterDimension::Status, &self.status),
        ]
        .into_iter()
        .all(|(dim, want)| want.as_deref().map(|w| dim_matches(dim, w, r)).unwrap_or(true))
    }
}

/// Cache slot identity. Built through the `with_*` methods so sentinels normalize to `None`
/// and two spellings of "no constraint" land in the same slot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct QueryKey {
    pub kind: ResourceKind,
    pub search: Option<String>,
    pub namespace: Option<String>,
    pub queue: Option<String>,
    pub status: Option<String>,
    pub page: Option<PageRequest>,
}

fn normalized(value: impl Into<String>) -> Option<String> {
    let value = value.into();
    if is_sentinel(&value) { None } else { Some(value.trim().to_string()) }
}

impl QueryKey {
    pub fn new(kind: ResourceKind) -> Self {
        Self { kind, search: None, namespace: None, queue: None, status: None, page: None }
    }

    pub fn with_search(mut self, search: impl Into<String>) -> Self {
        let s = search.into();
        let s = s.trim();
        self.search = if s.is_empty() { None } else { Some(s.to_string()) };
        self
    }

    /// Ignored for cluster-scoped kinds.
    pub fn with_namespace(mut self, ns: impl Into<String>) -> Self {
        self.namespace = if self.kind.namespaced() { normalized(ns) } else { None };
        self
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = normalized(queue);
        self
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = normalized(status);
        self
    }

    pub fn with_page(mut self, page: Option<PageRequest>) -> Self {
        self.page = page;
        self
    }

    pub fn from_filter(kind: ResourceKind, filter: &FilterState) -> Self {
        let mut key = QueryKey::new(kind).with_search(filter.search().unwrap_or(""));
        for (dim, value) in filter.dimensions() {
            key = match dim {
                FilterDimension::Namespace => key.with_namespace(value),
                FilterDimension::Queue => key.with_queue(value),
                FilterDimension::Status => key.with_status(value),
            };
        }
        key
    }

    pub fn to_list_query(&self) -> ListQuery {
        ListQuery {
            namespace: self.namespace.clone(),
            search: self.search.clone(),
            queue: self.queue.clone(),
            status: self.status.clone(),
            page: self.page,
        }
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        for (label, v) in [("ns", &self.namespace), ("q", &self.search), ("queue", &self.queue), ("status", &self.status)] {
            if let Some(v) = v {
                write!(f, " {}={}", label, v)?;
            }
        }
        if let Some(p) = self.page {
            write!(f, " page={}/{}", p.page, p.page_size)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn job(name: &str, ns: &str, queue: &str, phase: &str) -> Resource {
        Resource::from_manifest(
            ResourceKind::Job,
            &json!({
                "metadata": { "name": name, "namespace": ns },
                "spec": { "queue": queue },
                "status": { "state": { "phase": phase } }
            }),
        )
        .unwrap()
    }

    #[test]
    fn sentinel_is_never_stored() {
        let mut f = FilterState::new();
        f.set(FilterDimension::Queue, "All");
        f.set(FilterDimension::Namespace, "");
        f.set(FilterDimension::Status, "all");
        assert_eq!(f.dimensions().count(), 0);
        assert!(f.matches(&job("a", "ns", "q", "Running")));
    }

    #[test]
    fn dimensions_compose_by_and() {
        let f = FilterState::new().with(FilterDimension::Queue, "gpu").with(FilterDimension::Status, "Running");
        assert!(f.matches(&job("a", "ns", "gpu", "Running")));
        assert!(!f.matches(&job("b", "ns", "gpu", "Pending")));
        assert!(!f.matches(&job("c", "ns", "cpu", "Running")));
    }

    #[test]
    fn search_is_case_insensitive_substring() {
        let mut f = FilterState::new();
        f.set_search("TRAIN");
        assert!(f.matches(&job("resnet-training", "ns", "q", "Running")));
        assert!(!f.matches(&job("infer", "ns", "q", "Running")));
    }

    #[test]
    fn equal_filters_give_equal_keys() {
        let a = QueryKey::new(ResourceKind::Job).with_namespace("All").with_queue("gpu");
        let b = QueryKey::from_filter(ResourceKind::Job, &FilterState::new().with(FilterDimension::Queue, " gpu "));
        assert_eq!(a, b);
        let q = QueryKey::new(ResourceKind::Queue).with_namespace("ml");
        assert_eq!(q.namespace, None);
    }

    #[test]
    fn list_query_matches_like_filter() {
        let lq = QueryKey::new(ResourceKind::Job).with_status("Running").with_search("tr").to_list_query();
        assert!(lq.matches(&job("train", "ns", "q", "Running")));
        assert!(!lq.matches(&job("train", "ns", "q", "Failed")));
    }

    #[test]
    fn default_sort_is_newest_first() {
        let s = SortState::default();
        assert_eq!(s.field, Some(Column::Created));
        assert_eq!(s.direction, SortDirection::Desc);
        assert_eq!(PageRequest::new(0, 0), PageRequest { page: 1, page_size: 1 });
        assert_eq!(PageRequest::new(3, 10).offset(), 20);
    }

    #[test]
    fn deserialized_zero_page_reads_as_first() {
        let p: PageRequest = serde_json::from_value(serde_json::json!({ "page": 0, "page_size": 0 })).unwrap();
        assert_eq!(p.page(), 1);
        assert_eq!(p.offset(), 0);
        assert_eq!(p.page_size(), 1);
    }
}
