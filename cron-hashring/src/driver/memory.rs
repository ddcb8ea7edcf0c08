//! In-process lease store.
//!
//! Every [`MemoryDriver`] built from the same [`MemoryStore`] sees the same
//! leases, so a whole fleet can live inside one process. Keys use the
//! hierarchical form `/crond/<service>/<uuid>`.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use super::{new_node_key, renew_interval, MembershipDriver, NodeHandle, PREFIX_KEY};
use crate::Error;

const DEFAULT_TTL: Duration = Duration::from_secs(5);

#[derive(Debug)]
struct StoreState {
    leases: HashMap<String, Instant>,
    reachable: bool,
}

/// Shared lease table with fault injection.
#[derive(Clone, Debug)]
pub struct MemoryStore {
    state: Arc<Mutex<StoreState>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self {
            state: Arc::new(Mutex::new(StoreState {
                leases: HashMap::new(),
                reachable: true,
            })),
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a network partition from the store (or its recovery).
    pub fn set_reachable(&self, reachable: bool) {
        self.state.lock().reachable = reachable;
    }

    /// Drop a lease as if it had expired. Returns false if it was not held.
    pub fn revoke(&self, key: &str) -> bool {
        self.state.lock().leases.remove(key).is_some()
    }

    /// Unexpired keys, regardless of reachability.
    pub fn live_keys(&self) -> Vec<String> {
        let now = Instant::now();
        let state = self.state.lock();
        let mut keys: Vec<String> = state
            .leases
            .iter()
            .filter(|(_, deadline)| **deadline > now)
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }

    fn check_reachable(state: &StoreState) -> Result<(), Error> {
        if state.reachable {
            Ok(())
        } else {
            Err(Error::Store("memory store unreachable".into()))
        }
    }

    fn put(&self, key: &str, ttl: Duration) -> Result<(), Error> {
        let mut state = self.state.lock();
        Self::check_reachable(&state)?;
        state.leases.insert(key.to_string(), Instant::now() + ttl);
        Ok(())
    }

    /// Extend an existing lease. `Ok(false)` means the lease is gone.
    fn renew(&self, key: &str, ttl: Duration) -> Result<bool, Error> {
        let now = Instant::now();
        let mut state = self.state.lock();
        Self::check_reachable(&state)?;
        match state.leases.get_mut(key) {
            Some(deadline) if *deadline > now => {
                *deadline = now + ttl;
                Ok(true)
            }
            Some(_) => {
                state.leases.remove(key);
                Ok(false)
            }
            None => Ok(false),
        }
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, Error> {
        let now = Instant::now();
        let mut state = self.state.lock();
        Self::check_reachable(&state)?;
        state.leases.retain(|_, deadline| *deadline > now);
        Ok(state
            .leases
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect())
    }
}

/// [`MembershipDriver`] over a [`MemoryStore`].
pub struct MemoryDriver {
    store: MemoryStore,
    ttl: Arc<Mutex<Duration>>,
}

impl MemoryDriver {
    pub fn new(store: MemoryStore) -> Self {
        Self {
            store,
            ttl: Arc::new(Mutex::new(DEFAULT_TTL)),
        }
    }

    pub fn store(&self) -> &MemoryStore {
        &self.store
    }

    fn service_prefix(service_name: &str) -> String {
        format!("/{}/{}/", PREFIX_KEY, service_name)
    }
}

#[async_trait]
impl MembershipDriver for MemoryDriver {
    async fn ping(&self) -> Result<(), Error> {
        MemoryStore::check_reachable(&self.store.state.lock())
            .map_err(|e| Error::Unreachable(e.to_string()))
    }

    fn set_expiration(&self, ttl: Duration) {
        *self.ttl.lock() = ttl;
    }

    async fn register_service_node(&self, service_name: &str) -> Result<String, Error> {
        let node_id = new_node_key("/", "/", service_name);
        self.store.put(&node_id, *self.ttl.lock())?;
        tracing::info!(%node_id, "Registered node in memory store");
        Ok(node_id)
    }

    fn keepalive(&self, node: NodeHandle) {
        let store = self.store.clone();
        let ttl = self.ttl.clone();

        tokio::spawn(async move {
            loop {
                let lease = *ttl.lock();
                tokio::time::sleep(renew_interval(lease)).await;

                let node_id = node.id();
                match store.renew(&node_id, lease) {
                    Ok(true) => continue,
                    Ok(false) => {
                        tracing::warn!(node_id = %node_id, "Lease lost, re-registering");
                    }
                    Err(e) => {
                        tracing::warn!(node_id = %node_id, error = %e, "Lease renewal failed");
                    }
                }

                let fresh = new_node_key("/", "/", node.service_name());
                match store.put(&fresh, lease) {
                    Ok(()) => node.replace(fresh),
                    Err(e) => {
                        tracing::warn!(node_id = %node_id, error = %e, "Re-registration failed");
                    }
                }
            }
        });
    }

    async fn get_service_node_list(&self, service_name: &str) -> Result<Vec<String>, Error> {
        self.store.list(&Self::service_prefix(service_name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn driver(store: &MemoryStore, ttl: Duration) -> MemoryDriver {
        let driver = MemoryDriver::new(store.clone());
        driver.set_expiration(ttl);
        driver
    }

    #[tokio::test]
    async fn test_register_is_listed_per_service() {
        let store = MemoryStore::new();
        let d = driver(&store, Duration::from_secs(5));

        let a = d.register_service_node("billing").await.unwrap();
        let b = d.register_service_node("billing").await.unwrap();
        let other = d.register_service_node("mailer").await.unwrap();

        assert!(a.starts_with("/crond/billing/"));
        assert_ne!(a, b);

        let mut listed = d.get_service_node_list("billing").await.unwrap();
        listed.sort();
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(listed, expected);
        assert!(!listed.contains(&other));
    }

    #[tokio::test]
    async fn test_unreachable_store_fails_calls() {
        let store = MemoryStore::new();
        let d = driver(&store, Duration::from_secs(5));
        store.set_reachable(false);

        assert!(matches!(d.ping().await, Err(Error::Unreachable(_))));
        assert!(d.register_service_node("svc").await.is_err());
        assert!(d.get_service_node_list("svc").await.is_err());

        store.set_reachable(true);
        assert!(d.ping().await.is_ok());
    }

    #[tokio::test]
    async fn test_lease_expires_without_keepalive() {
        let store = MemoryStore::new();
        let d = driver(&store, Duration::from_millis(50));

        let id = d.register_service_node("svc").await.unwrap();
        assert_eq!(d.get_service_node_list("svc").await.unwrap(), vec![id]);

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(d.get_service_node_list("svc").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_keepalive_keeps_lease() {
        let store = MemoryStore::new();
        let d = driver(&store, Duration::from_millis(100));

        let id = d.register_service_node("svc").await.unwrap();
        let handle = NodeHandle::new("svc", id.clone());
        d.keepalive(handle.clone());

        tokio::time::sleep(Duration::from_millis(350)).await;
        assert_eq!(d.get_service_node_list("svc").await.unwrap(), vec![id.clone()]);
        assert_eq!(handle.id().as_str(), id);
    }

    #[tokio::test]
    async fn test_keepalive_reregisters_after_lease_loss() {
        let store = MemoryStore::new();
        let d = driver(&store, Duration::from_millis(100));

        let old = d.register_service_node("svc").await.unwrap();
        let handle = NodeHandle::new("svc", old.clone());
        d.keepalive(handle.clone());

        assert!(store.revoke(&old));
        tokio::time::sleep(Duration::from_millis(200)).await;

        let new = handle.id();
        assert_ne!(new.as_str(), old);
        let listed = d.get_service_node_list("svc").await.unwrap();
        assert_eq!(listed, vec![new.to_string()]);
    }

    #[tokio::test]
    async fn test_keepalive_heals_after_partition() {
        let store = MemoryStore::new();
        let d = driver(&store, Duration::from_millis(100));

        let old = d.register_service_node("svc").await.unwrap();
        let handle = NodeHandle::new("svc", old.clone());
        d.keepalive(handle.clone());

        store.set_reachable(false);
        tokio::time::sleep(Duration::from_millis(250)).await;
        store.set_reachable(true);
        tokio::time::sleep(Duration::from_millis(200)).await;

        let listed = d.get_service_node_list("svc").await.unwrap();
        assert_eq!(listed, vec![handle.id().to_string()]);
        assert!(!listed.contains(&old));
    }
}
