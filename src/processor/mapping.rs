//! Discovery/REST-mapper cache: resolves `(apiGroup, resource)` (the
//! plural form audit entries carry) to `Kind`, with lazy refresh on miss
//! and singleflight coalescing.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use kube::{discovery::Discovery, Client};
use tokio::sync::Notify;
use tracing::{info, warn};

type Key = (String, String);

/// A miss does not fail the batch — it counts as "unpoliced" and the record
/// bypasses emit.
pub struct MappingCache {
    entries: DashMap<Key, String>,
    in_flight: DashMap<Key, Arc<Notify>>,
    client: Client,
}

impl MappingCache {
    pub fn new(client: Client) -> Self {
        Self {
            entries: DashMap::new(),
            in_flight: DashMap::new(),
            client,
        }
    }

    /// Resolve `(apiGroup, resource)` to `Kind`. Returns `None` on a miss
    /// that could not be resolved via discovery (unpoliced).
    pub async fn resolve(&self, api_group: &str, resource: &str) -> Option<String> {
        let key = (api_group.to_string(), resource.to_string());
        if let Some(kind) = self.entries.get(&key) {
            return Some(kind.clone());
        }

        // Singleflight: if a refresh for this key is already in flight,
        // wait on it instead of issuing a second discovery call.
        if let Some(notify) = self.in_flight.get(&key).map(|n| n.clone()) {
            notify.notified().await;
            return self.entries.get(&key).map(|k| k.clone());
        }

        let notify = Arc::new(Notify::new());
        self.in_flight.insert(key.clone(), notify.clone());
        let result = self.refresh_one(&key).await;
        self.in_flight.remove(&key);
        notify.notify_waiters();
        result
    }

    async fn refresh_one(&self, key: &Key) -> Option<String> {
        let discovery = Discovery::new(self.client.clone()).run().await.ok()?;
        for group in discovery.groups() {
            if group.name() != key.0 {
                continue;
            }
            for (ar, _caps) in group.recommended_resources() {
                if ar.plural == key.1 {
                    self.entries.insert(key.clone(), ar.kind.clone());
                    return Some(ar.kind);
                }
            }
        }
        warn!(api_group = %key.0, resource = %key.1, "discovery miss, record is unpoliced");
        None
    }

    /// Background invalidation on a fixed interval (>= 10m), so kinds added
    /// after the processor started eventually resolve.
    pub async fn run_background_refresh(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            info!(entries = self.entries.len(), "invalidating discovery cache");
            self.entries.clear();
        }
    }

    pub fn snapshot(&self) -> HashMap<Key, String> {
        self.entries
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }
}
