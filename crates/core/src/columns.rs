//! Per-kind list columns and the typed values they project.
//!
//! This module provides:
//! - A stable column set per kind (labels, widths)
//! - A projector turning a `Resource` into a typed `ColumnValue`
//! - Ordering over values: numbers numerically, instants chronologically, text lexicographically

#![forbid(unsafe_code)]

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::quantity::{format_mebibytes, format_milli_cores, to_mebibytes, to_milli_cores};
use crate::{DashboardError, Resource, ResourceKind};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Column {
    Name,
    Namespace,
    Queue,
    Phase,
    Created,
    /// Allocated or requested CPU, in millicores.
    Cpu,
    /// Allocated or requested memory, in MiB.
    Memory,
    Running,
    Pending,
    MinAvailable,
    Weight,
}

impl Column {
    pub fn label(&self) -> &'static str {
        match self {
            Column::Name => "Name",
            Column::Namespace => "Namespace",
            Column::Queue => "Queue",
            Column::Phase => "Status",
            Column::Created => "Age",
            Column::Cpu => "CPU",
            Column::Memory => "Memory",
            Column::Running => "Running",
            Column::Pending => "Pending",
            Column::MinAvailable => "MinAvail",
            Column::Weight => "Weight",
        }
    }

    pub fn width(&self) -> usize {
        match self {
            Column::Name => 32,
            Column::Namespace | Column::Queue => 16,
            Column::Phase => 12,
            _ => 9,
        }
    }
}

impl FromStr for Column {
    type Err = DashboardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().to_ascii_lowercase().as_str() {
            "name" => Column::Name,
            "namespace" | "ns" => Column::Namespace,
            "queue" => Column::Queue,
            "status" | "phase" | "state" => Column::Phase,
            "age" | "created" | "creation" | "time" => Column::Created,
            "cpu" => Column::Cpu,
            "memory" | "mem" => Column::Memory,
            "running" => Column::Running,
            "pending" => Column::Pending,
            "minavailable" | "min-available" | "minmember" => Column::MinAvailable,
            "weight" => Column::Weight,
            other => return Err(DashboardError::Validation(format!("unknown sort field: {}", other))),
        })
    }
}

/// A projected cell. Comparison is only meaningful within one column.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum ColumnValue {
    Text(String),
    Number(f64),
    Time(DateTime<Utc>),
}

impl ColumnValue {
    pub fn compare(&self, other: &ColumnValue) -> Ordering {
        match (self, other) {
            (ColumnValue::Number(a), ColumnValue::Number(b)) => a.total_cmp(b),
            (ColumnValue::Time(a), ColumnValue::Time(b)) => a.cmp(b),
            (ColumnValue::Text(a), ColumnValue::Text(b)) => a.cmp(b),
            // mixed variants do not occur within one column; keep a fixed rank anyway
            (a, b) => a.rank().cmp(&b.rank()),
        }
    }

    fn rank(&self) -> u8 {
        match self {
            ColumnValue::Number(_) => 0,
            ColumnValue::Time(_) => 1,
            ColumnValue::Text(_) => 2,
        }
    }
}

impl fmt::Display for ColumnValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnValue::Text(s) => f.write_str(s),
            ColumnValue::Number(n) if n.fract() == 0.0 => write!(f, "{}", *n as i64),
            ColumnValue::Number(n) => write!(f, "{:.1}", n),
            ColumnValue::Time(t) => f.write_str(&t.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)),
        }
    }
}

/// Columns shown for a kind, in display order.
pub fn columns_for(kind: ResourceKind) -> Vec<Column> {
    let mut cols = vec![Column::Name];
    if kind.namespaced() {
        cols.push(Column::Namespace);
    }
    match kind {
        ResourceKind::Job => cols.extend([Column::Queue, Column::Phase, Column::MinAvailable, Column::Running, Column::Pending, Column::Cpu, Column::Memory]),
        ResourceKind::Queue => cols.extend([Column::Phase, Column::Weight, Column::Running, Column::Pending, Column::Cpu, Column::Memory]),
        ResourceKind::Pod => cols.extend([Column::Queue, Column::Phase, Column::Cpu, Column::Memory]),
        ResourceKind::PodGroup => cols.extend([Column::Queue, Column::Phase, Column::MinAvailable, Column::Running, Column::Cpu, Column::Memory]),
    }
    cols.push(Column::Created);
    cols
}

/// Project one column out of a resource.
pub fn value(r: &Resource, col: Column) -> ColumnValue {
    match col {
        Column::Name => ColumnValue::Text(r.name.clone()),
        Column::Namespace => ColumnValue::Text(r.namespace.clone()),
        Column::Queue => ColumnValue::Text(r.queue().unwrap_or("").to_string()),
        Column::Phase => ColumnValue::Text(r.phase()),
        Column::Created => ColumnValue::Time(r.creation_timestamp),
        Column::Cpu => ColumnValue::Number(resource_total(r, "cpu", |s| to_milli_cores(s) as f64)),
        Column::Memory => ColumnValue::Number(resource_total(r, "memory", to_mebibytes)),
        Column::Running => ColumnValue::Number(count(&r.status, "running")),
        Column::Pending => ColumnValue::Number(count(&r.status, "pending")),
        Column::MinAvailable => {
            let field = if r.kind == ResourceKind::PodGroup { "minMember" } else { "minAvailable" };
            ColumnValue::Number(count(&r.spec, field))
        }
        Column::Weight => ColumnValue::Number(count(&r.spec, "weight")),
    }
}

/// Human cell text; quantities get their unit back, creation time renders as an age.
pub fn render(r: &Resource, col: Column, now: DateTime<Utc>) -> String {
    match (col, value(r, col)) {
        (Column::Cpu, ColumnValue::Number(m)) => format_milli_cores(m as u64),
        (Column::Memory, ColumnValue::Number(mib)) => format_mebibytes(mib),
        (Column::Created, ColumnValue::Time(t)) => human_age(now.signed_duration_since(t)),
        (_, v) => v.to_string(),
    }
}

pub fn human_age(d: chrono::Duration) -> String {
    let secs = d.num_seconds().max(0);
    match secs {
        s if s < 60 => format!("{}s", s),
        s if s < 3600 => format!("{}m", s / 60),
        s if s < 86_400 => format!("{}h", s / 3600),
        s => format!("{}d", s / 86_400),
    }
}

fn count(map: &Json, field: &str) -> f64 {
    match map.get(field) {
        Some(Json::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(Json::String(s)) => s.trim().parse().unwrap_or(0.0),
        _ => 0.0,
    }
}

/// Sum of one resource dimension. Queues report `status.allocated`; jobs multiply each
/// task's container requests by its replicas; pods sum their container requests; pod groups
/// carry `spec.minResources`.
fn resource_total(r: &Resource, dim: &str, parse: impl Fn(&str) -> f64) -> f64 {
    let quantity = |v: Option<&Json>| -> f64 {
        match v {
            Some(Json::String(s)) => parse(s),
            Some(Json::Number(n)) => parse(&n.to_string()),
            _ => 0.0,
        }
    };
    let containers = |pod_spec: Option<&Json>| -> f64 {
        pod_spec
            .and_then(|s| s.get("containers"))
            .and_then(|c| c.as_array())
            .map(|cs| cs.iter().map(|c| quantity(c.pointer(&format!("/resources/requests/{}", dim)))).sum())
            .unwrap_or(0.0)
    };
    match r.kind {
        ResourceKind::Queue => quantity(r.status.get("allocated").and_then(|a| a.get(dim))),
        ResourceKind::PodGroup => quantity(r.spec.get("minResources").and_then(|a| a.get(dim))),
        ResourceKind::Pod => containers(Some(&r.spec)),
        ResourceKind::Job => r
            .spec
            .get("tasks")
            .and_then(|t| t.as_array())
            .map(|tasks| {
                tasks
                    .iter()
                    .map(|t| count(t, "replicas") * containers(t.pointer("/template/spec")))
                    .sum()
            })
            .unwrap_or(0.0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn shape(kind: ResourceKind, raw: Json) -> Resource { Resource::from_manifest(kind, &raw).unwrap() }

    #[test]
    fn job_cpu_multiplies_replicas() {
        let r = shape(
            ResourceKind::Job,
            json!({
                "metadata": { "name": "j", "namespace": "ns" },
                "spec": { "tasks": [
                    { "replicas": 2, "template": { "spec": { "containers": [
                        { "resources": { "requests": { "cpu": "500m", "memory": "1Gi" } } }
                    ] } } },
                    { "replicas": 1, "template": { "spec": { "containers": [
                        { "resources": { "requests": { "cpu": "2" } } }
                    ] } } }
                ] }
            }),
        );
        assert_eq!(value(&r, Column::Cpu), ColumnValue::Number(3000.0));
        assert_eq!(value(&r, Column::Memory), ColumnValue::Number(2048.0));
        assert_eq!(render(&r, Column::Cpu, Utc::now()), "3");
    }

    #[test]
    fn queue_uses_allocated_and_weight() {
        let r = shape(
            ResourceKind::Queue,
            json!({
                "metadata": { "name": "gpu" },
                "spec": { "weight": 4 },
                "status": { "state": "Open", "allocated": { "cpu": "750m", "memory": "512Mi" }, "running": 3 }
            }),
        );
        assert_eq!(value(&r, Column::Cpu), ColumnValue::Number(750.0));
        assert_eq!(value(&r, Column::Weight), ColumnValue::Number(4.0));
        assert_eq!(value(&r, Column::Running), ColumnValue::Number(3.0));
        assert!(!columns_for(ResourceKind::Queue).contains(&Column::Namespace));
    }

    #[test]
    fn podgroup_min_member() {
        let r = shape(ResourceKind::PodGroup, json!({ "metadata": { "name": "pg", "namespace": "ns" }, "spec": { "minMember": 5 } }));
        assert_eq!(value(&r, Column::MinAvailable), ColumnValue::Number(5.0));
    }

    #[test]
    fn numbers_compare_numerically() {
        let a = ColumnValue::Number(900.0);
        let b = ColumnValue::Number(1000.0);
        assert_eq!(a.compare(&b), Ordering::Less);
        let x = ColumnValue::Text("900".into());
        let y = ColumnValue::Text("1000".into());
        assert_eq!(x.compare(&y), Ordering::Greater);
    }

    #[test]
    fn sort_field_names_parse() {
        assert_eq!("age".parse::<Column>().unwrap(), Column::Created);
        assert_eq!("MEM".parse::<Column>().unwrap(), Column::Memory);
        assert!("color".parse::<Column>().is_err());
        assert_eq!(human_age(chrono::Duration::seconds(7200)), "2h");
    }
}
