//! Push hints and timer ticks feeding the cache.
//!
//! Both loops run as tokio tasks owned by a [`Subscription`]. Dropping or shutting down the
//! subscription cancels them; nothing touches the cache afterwards.

use std::sync::Arc;
use std::time::Duration;

use caldera_core::prelude::*;
use caldera_kubehub::{ChangeHint, HintStream};
use metrics::counter;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{InvalidateScope, ResourceCache};

/// Owns background tasks. Cancels and aborts them on drop.
#[derive(Default)]
pub struct Subscription {
    tokens: Vec<CancellationToken>,
    tasks: Vec<JoinHandle<()>>,
}

impl Subscription {
    fn new(token: CancellationToken, task: JoinHandle<()>) -> Self { Self { tokens: vec![token], tasks: vec![task] } }

    /// Fold `other` into this subscription; both stop together.
    pub fn and(mut self, mut other: Subscription) -> Self {
        self.tokens.append(&mut other.tokens);
        self.tasks.append(&mut other.tasks);
        self
    }

    pub fn is_active(&self) -> bool {
        self.tokens.iter().any(|t| !t.is_cancelled()) && self.tasks.iter().any(|t| !t.is_finished())
    }

    fn cancel_all(&self) {
        for t in self.tokens.iter() {
            t.cancel();
        }
    }

    /// Cancel and wait for every task to wind down.
    pub async fn shutdown(mut self) {
        self.cancel_all();
        for t in self.tasks.drain(..) {
            let _ = t.await;
        }
        debug!("subscription shut down");
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel_all();
        for t in self.tasks.drain(..) {
            t.abort();
        }
    }
}

fn scope_of(hint: &ChangeHint) -> InvalidateScope {
    match hint.kind {
        Some(k) => InvalidateScope::Kind(k),
        None => InvalidateScope::All,
    }
}

/// Turns push hints into invalidations plus a refetch of the active view.
pub struct EventBridge;

impl EventBridge {
    /// `active` names the query on screen; `None` means nothing to refetch.
    pub fn spawn(cache: Arc<ResourceCache>, stream: HintStream, active: watch::Receiver<Option<QueryKey>>) -> Subscription {
        let token = CancellationToken::new();
        let cancel = token.clone();
        let task = tokio::spawn(async move {
            let HintStream { mut rx, cancel: _producer } = stream;
            info!("event bridge started");
            loop {
                let first = tokio::select! {
                    _ = cancel.cancelled() => break,
                    h = rx.recv() => match h {
                        Some(h) => h,
                        None => { warn!("hint stream closed"); break; }
                    },
                };
                // Coalesce whatever else is already queued into one pass.
                let mut scopes = vec![scope_of(&first)];
                let mut n = 1u64;
                while let Ok(h) = rx.try_recv() {
                    n += 1;
                    let s = scope_of(&h);
                    if !scopes.contains(&s) {
                        scopes.push(s);
                    }
                }
                counter!("bridge_hints_total", n);
                if scopes.contains(&InvalidateScope::All) {
                    scopes = vec![InvalidateScope::All];
                }
                for s in scopes.iter() {
                    cache.invalidate(s.clone());
                }
                let current = active.borrow().clone();
                if let Some(q) = current.filter(|q| scopes.iter().any(|s| s.covers(q))) {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        r = cache.tick(&q) => if let Err(e) = r { warn!(query = %q, error = %e, "refetch after hint failed") },
                    }
                }
                debug!(hints = n, "hints applied");
            }
            info!("event bridge stopped");
        });
        Subscription::new(token, task)
    }
}

/// Periodic refetch of the active view. Ticks that land on an in-flight fetch are skipped.
pub struct AutoRefresh;

impl AutoRefresh {
    pub fn spawn(cache: Arc<ResourceCache>, period: Duration, active: watch::Receiver<Option<QueryKey>>) -> Subscription {
        let token = CancellationToken::new();
        let cancel = token.clone();
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // first tick completes immediately; the view was just loaded
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {}
                }
                let current = active.borrow().clone();
                let Some(q) = current else { continue };
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    r = cache.tick(&q) => if let Err(e) = r { warn!(query = %q, error = %e, "auto-refresh failed") },
                }
            }
            debug!("auto-refresh stopped");
        });
        Subscription::new(token, task)
    }
}
