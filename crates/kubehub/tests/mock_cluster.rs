use std::time::Duration;

use caldera_core::prelude::*;
use caldera_kubehub::{ChangeHint, ClusterApi, MockCluster};
use serde_json::json;

fn queue(name: &str) -> Resource {
    Resource::from_manifest(ResourceKind::Queue, &json!({ "metadata": { "name": name }, "spec": { "weight": 1 } })).unwrap()
}

#[tokio::test]
async fn list_keeps_insertion_order_and_filters() {
    let m = MockCluster::with_objects(["c", "a", "b"].into_iter().map(queue));
    let page = m.list(ResourceKind::Queue, &ListQuery::default()).await.unwrap();
    assert_eq!(page.items.iter().map(|r| r.name.as_str()).collect::<Vec<_>>(), vec!["c", "a", "b"]);
    let page = m
        .list(ResourceKind::Queue, &ListQuery { search: Some("A".into()), ..Default::default() })
        .await
        .unwrap();
    assert_eq!(page.total_count, 1);
    assert_eq!(m.list_calls(), 2);
}

#[tokio::test]
async fn scripted_failures_fire_once() {
    let m = MockCluster::with_objects([queue("q")]);
    let key = ResourceKey::new(ResourceKind::Queue, "", "q");
    m.fail_delete(key.clone(), DashboardError::rejection("quota exceeded"));
    let err = m.delete(&key).await.unwrap_err();
    assert_eq!(err.to_string(), "quota exceeded");
    m.delete(&key).await.unwrap();
    assert!(m.objects(ResourceKind::Queue).is_empty());
}

#[tokio::test]
async fn update_merges_and_bumps_version() {
    let m = MockCluster::with_objects([queue("q")]);
    let key = ResourceKey::new(ResourceKind::Queue, "", "q");
    let r = m.update(&key, &json!({ "spec": { "weight": 3 } })).await.unwrap();
    assert_eq!(r.spec["weight"], 3);
    assert!(r.resource_version.is_some());
}

#[tokio::test]
async fn create_assigns_identity_details() {
    let m = MockCluster::new();
    let r = m
        .create(ResourceKind::Job, &json!({ "apiVersion": "batch.volcano.sh/v1alpha1", "kind": "Job", "metadata": { "name": "j" } }))
        .await
        .unwrap();
    assert_eq!(r.namespace, "default");
    assert!(r.uid.is_some());
    let dup = m.create(ResourceKind::Job, &json!({ "metadata": { "name": "j" } })).await.unwrap_err();
    assert!(matches!(dup, DashboardError::ServerRejection { .. }));
}

#[tokio::test(start_paused = true)]
async fn list_delay_is_honored() {
    let m = MockCluster::with_objects([queue("q")]);
    m.push_list_delay(Duration::from_secs(3));
    let t0 = tokio::time::Instant::now();
    m.list(ResourceKind::Queue, &ListQuery::default()).await.unwrap();
    assert!(t0.elapsed() >= Duration::from_secs(3));
}

#[tokio::test]
async fn hints_reach_watchers_until_dropped() {
    let m = MockCluster::new();
    let mut stream = m.watch(None, 4).await.unwrap();
    m.emit(ChangeHint::for_kind(ResourceKind::Pod));
    assert_eq!(stream.rx.recv().await, Some(ChangeHint::for_kind(ResourceKind::Pod)));
    drop(stream);
    assert_eq!(m.watcher_count(), 0);
}
