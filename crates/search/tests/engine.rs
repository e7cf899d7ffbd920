#![forbid(unsafe_code)]

use caldera_core::prelude::*;
use caldera_search::{apply, filter_in_order, slice, total_pages};
use serde_json::json;

fn corpus() -> Vec<Resource> {
    let phases = ["Running", "Pending", "Completed"];
    let queues = ["gpu", "cpu", "default"];
    let namespaces = ["ml", "etl"];
    (0..36)
        .map(|i| {
            Resource::from_manifest(
                ResourceKind::Job,
                &json!({
                    "metadata": {
                        "name": format!("job-{:02}", i),
                        "namespace": namespaces[i % 2],
                        "creationTimestamp": format!("2024-02-{:02}T00:00:00Z", 1 + (i * 7) % 28),
                    },
                    "spec": { "queue": queues[i % 3], "minAvailable": (i % 5) as u64 },
                    "status": { "state": { "phase": phases[(i / 3) % 3] }, "running": (i % 4) as u64 }
                }),
            )
            .unwrap()
        })
        .collect()
}

fn names(rows: &[impl std::borrow::Borrow<Resource>]) -> Vec<String> { rows.iter().map(|r| r.borrow().name.clone()).collect() }

#[test]
fn apply_is_idempotent() {
    let items = corpus();
    let filter = FilterState::new().with(FilterDimension::Queue, "gpu");
    for sort in [
        SortState::default(),
        SortState::server_order(),
        SortState::by(Column::Running, SortDirection::Asc),
        SortState::by(Column::Name, SortDirection::Desc),
        SortState::by(Column::MinAvailable, SortDirection::Desc),
    ] {
        let once: Vec<Resource> = apply(items.clone(), &filter, &sort);
        let twice: Vec<Resource> = apply(once.clone(), &filter, &sort);
        assert_eq!(names(&once), names(&twice), "sort={sort:?}");
    }
}

#[test]
fn filter_dimensions_commute() {
    let items = corpus();
    let mut filter = FilterState::new()
        .with(FilterDimension::Namespace, "ml")
        .with(FilterDimension::Queue, "cpu")
        .with(FilterDimension::Status, "Running");
    filter.set_search("job-");
    let orders = [
        [FilterDimension::Namespace, FilterDimension::Queue, FilterDimension::Status],
        [FilterDimension::Status, FilterDimension::Namespace, FilterDimension::Queue],
        [FilterDimension::Queue, FilterDimension::Status, FilterDimension::Namespace],
    ];
    let baseline = names(&filter_in_order(&items, &filter, &orders[0]));
    assert!(!baseline.is_empty());
    for o in orders.iter().skip(1) {
        assert_eq!(names(&filter_in_order(&items, &filter, o)), baseline);
    }
    assert_eq!(names(&apply(&items, &filter, &SortState::server_order())), baseline);
}

#[test]
fn sentinel_filter_keeps_everything() {
    let items = corpus();
    let filter = FilterState::new().with(FilterDimension::Queue, "All").with(FilterDimension::Status, "");
    assert_eq!(apply(&items, &filter, &SortState::server_order()).len(), items.len());
}

#[test]
fn windows_never_exceed_page_size() {
    let items = corpus();
    for page_size in [1usize, 3, 7, 10, 36, 50] {
        let pages = total_pages(items.len(), page_size);
        for page in 1..=pages + 2 {
            let (w, tp) = slice(&items, page, page_size);
            assert_eq!(tp, pages);
            assert!(w.len() <= page_size);
            assert_eq!(w.is_empty(), page > tp, "page={page} size={page_size}");
        }
    }
}
