//! Runtime configuration from `CALDERA_*` environment variables.

use std::time::Duration;

use caldera_apply::{KeyOrder, KeyOrderPolicy, YamlBudget};
use caldera_core::prelude::*;
use caldera_ops::{DEFAULT_CONFIRM_DELAY, MAX_CONFIRM_DELAY};
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DashboardConfig {
    pub page_size: usize,
    /// Auto-refresh period; `None` disables it.
    pub refresh: Option<Duration>,
    pub confirm_delay: Duration,
    /// Capacity of the change-hint channel.
    pub queue_cap: usize,
    /// Kinds whose list endpoint paginates on the server.
    pub server_paged: Vec<ResourceKind>,
    pub key_order: KeyOrderPolicy,
    pub yaml_budget: YamlBudget,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            page_size: 10,
            refresh: Some(Duration::from_secs(5)),
            confirm_delay: DEFAULT_CONFIRM_DELAY,
            queue_cap: 256,
            server_paged: Vec::new(),
            key_order: KeyOrderPolicy::default(),
            yaml_budget: YamlBudget::default(),
        }
    }
}

fn parsed<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(key = %key, value = %raw, "config: ignoring unparsable value");
            None
        }
    }
}

impl DashboardConfig {
    pub fn from_env() -> Self { Self::from_lookup(|k| std::env::var(k).ok()) }

    /// Unset or unparsable values keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();
        if let Some(n) = parsed::<usize>(&lookup, "CALDERA_PAGE_SIZE") {
            cfg.page_size = n.max(1);
        }
        if let Some(secs) = parsed::<u64>(&lookup, "CALDERA_REFRESH_SECS") {
            cfg.refresh = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(ms) = parsed::<u64>(&lookup, "CALDERA_CONFIRM_DELAY_MS") {
            cfg.confirm_delay = Duration::from_millis(ms).min(MAX_CONFIRM_DELAY);
        }
        if let Some(n) = parsed::<usize>(&lookup, "CALDERA_QUEUE_CAP") {
            cfg.queue_cap = n.max(1);
        }
        if let Some(n) = parsed::<usize>(&lookup, "CALDERA_MAX_YAML_BYTES") {
            cfg.yaml_budget.max_bytes = n.max(1);
        }
        if let Some(n) = parsed::<usize>(&lookup, "CALDERA_MAX_YAML_NODES") {
            cfg.yaml_budget.max_nodes = n.max(1);
        }
        if let Some(list) = lookup("CALDERA_SERVER_PAGED") {
            cfg.server_paged = list
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .filter_map(|s| match s.parse::<ResourceKind>() {
                    Ok(k) => Some(k),
                    Err(e) => {
                        warn!(kind = %s, error = %e, "config: unknown kind in CALDERA_SERVER_PAGED");
                        None
                    }
                })
                .collect();
        }
        for (key, kind) in [
            ("CALDERA_JOB_KEY_ORDER", ResourceKind::Job),
            ("CALDERA_QUEUE_KEY_ORDER", ResourceKind::Queue),
            ("CALDERA_POD_KEY_ORDER", ResourceKind::Pod),
            ("CALDERA_PODGROUP_KEY_ORDER", ResourceKind::PodGroup),
        ] {
            if let Some(order) = parsed::<KeyOrder>(&lookup, key) {
                cfg.key_order.set(kind, order);
            }
        }
        cfg
    }

    pub fn is_server_paged(&self, kind: ResourceKind) -> bool { self.server_paged.contains(&kind) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn cfg(pairs: &[(&str, &str)]) -> DashboardConfig {
        let env: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        DashboardConfig::from_lookup(|k| env.get(k).cloned())
    }

    #[test]
    fn defaults() {
        let c = cfg(&[]);
        assert_eq!(c, DashboardConfig::default());
        assert_eq!(c.page_size, 10);
        assert_eq!(c.confirm_delay, Duration::from_millis(2000));
        assert_eq!(c.key_order.for_kind(ResourceKind::Queue), KeyOrder::Sorted);
    }

    #[test]
    fn overrides_and_clamps() {
        let c = cfg(&[
            ("CALDERA_PAGE_SIZE", "25"),
            ("CALDERA_REFRESH_SECS", "0"),
            ("CALDERA_CONFIRM_DELAY_MS", "60000"),
            ("CALDERA_SERVER_PAGED", "Pod, podgroup,bogus"),
            ("CALDERA_QUEUE_KEY_ORDER", "declared"),
            ("CALDERA_QUEUE_CAP", "not-a-number"),
            ("CALDERA_MAX_YAML_BYTES", "4096"),
        ]);
        assert_eq!(c.page_size, 25);
        assert_eq!(c.refresh, None);
        assert_eq!(c.confirm_delay, MAX_CONFIRM_DELAY);
        assert!(c.is_server_paged(ResourceKind::Pod));
        assert!(c.is_server_paged(ResourceKind::PodGroup));
        assert!(!c.is_server_paged(ResourceKind::Job));
        assert_eq!(c.key_order.for_kind(ResourceKind::Queue), KeyOrder::Declared);
        assert_eq!(c.queue_cap, 256);
        assert_eq!(c.yaml_budget.max_bytes, 4096);
        assert_eq!(c.yaml_budget.max_nodes, YamlBudget::default().max_nodes);
    }
}
