//! Caldera search: derive the rendered rows from a cached slot.
//!
//! Pure and synchronous. Filtering is an AND over independent dimension predicates, so the
//! order in which dimensions are applied never matters; sorting is stable, so rows that
//! compare equal keep server order.

#![forbid(unsafe_code)]

use std::borrow::Borrow;
use std::cmp::Ordering;

use caldera_core::columns::{self, ColumnValue};
use caldera_core::prelude::*;

pub mod window;

pub use window::{clamp_page, server_window, slice, total_pages, Window};

/// Filter then sort. Accepts owned or borrowed resources and returns the same.
pub fn apply<R: Borrow<Resource>>(items: impl IntoIterator<Item = R>, filter: &FilterState, sort: &SortState) -> Vec<R> {
    let matched: Vec<R> = items.into_iter().filter(|r| filter.matches(r.borrow())).collect();
    sort_rows(matched, sort)
}

/// Apply one dimension at a time in the given order; used to check that the order is irrelevant.
pub fn filter_in_order<'a>(items: &'a [Resource], filter: &FilterState, order: &[FilterDimension]) -> Vec<&'a Resource> {
    let mut rows: Vec<&Resource> = items.iter().collect();
    if let Some(needle) = filter.search() {
        let only_search = {
            let mut f = FilterState::new();
            f.set_search(needle);
            f
        };
        rows.retain(|r| only_search.matches(r));
    }
    for dim in order {
        if let Some(want) = filter.constraint(*dim) {
            rows.retain(|r| caldera_core::query::dim_matches(*dim, want, r));
        }
    }
    rows
}

/// Stable sort by the selected column. `field: None` keeps input order.
pub fn sort_rows<R: Borrow<Resource>>(rows: Vec<R>, sort: &SortState) -> Vec<R> {
    let Some(field) = sort.field else { return rows };
    let keys: Vec<ColumnValue> = rows.iter().map(|r| columns::value(r.borrow(), field)).collect();
    let mut order: Vec<usize> = (0..rows.len()).collect();
    order.sort_by(|&a, &b| {
        let o = keys[a].compare(&keys[b]);
        match sort.direction {
            SortDirection::Asc => o,
            SortDirection::Desc => o.reverse(),
        }
    });
    let mut slots: Vec<Option<R>> = rows.into_iter().map(Some).collect();
    order.into_iter().filter_map(|i| slots[i].take()).collect()
}

/// Compare two resources on one column, ascending.
pub fn compare_on(a: &Resource, b: &Resource, field: Column) -> Ordering {
    columns::value(a, field).compare(&columns::value(b, field))
}
