//! Membership store backends.
//!
//! The node pool only talks to a [`MembershipDriver`]. Liveness is entirely
//! lease driven: a node is live while its key exists in the store, and nothing
//! but that liveness marker is ever written there.

use arc_swap::ArcSwap;
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::Error;

pub mod memory;
#[cfg(feature = "driver-redis")]
pub mod redis;

pub use memory::{MemoryDriver, MemoryStore};
#[cfg(feature = "driver-redis")]
pub use self::redis::RedisDriver;

/// Leading segment of every membership key.
pub const PREFIX_KEY: &str = "crond";

#[async_trait]
pub trait MembershipDriver: Send + Sync + 'static {
    /// Check that the backend answers at all.
    async fn ping(&self) -> Result<(), Error>;

    /// Lease duration used by subsequent registrations and renewals.
    fn set_expiration(&self, ttl: Duration);

    /// Mint a fresh identity for `service_name` and write it with the
    /// configured TTL. Every call creates a new identity.
    async fn register_service_node(&self, service_name: &str) -> Result<String, Error>;

    /// Spawn a detached renewal loop for `node`. The loop renews before half
    /// the TTL has elapsed and, when a renewal fails or the lease is gone,
    /// registers a new identity and publishes it through `node`. It runs until
    /// the process exits.
    fn keepalive(&self, node: NodeHandle);

    /// Identities currently holding a lease for `service_name`.
    async fn get_service_node_list(&self, service_name: &str) -> Result<Vec<String>, Error>;
}

/// This process's identity within a service, shared by the node pool and the
/// keepalive loop. The keepalive loop swaps in a new id when it re-registers.
#[derive(Clone, Debug)]
pub struct NodeHandle {
    service_name: Arc<str>,
    current: Arc<ArcSwap<String>>,
}

impl NodeHandle {
    pub fn new(service_name: &str, node_id: String) -> Self {
        Self {
            service_name: Arc::from(service_name),
            current: Arc::new(ArcSwap::from_pointee(node_id)),
        }
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn id(&self) -> Arc<String> {
        self.current.load_full()
    }

    pub fn replace(&self, node_id: String) {
        let previous = self.current.swap(Arc::new(node_id));
        tracing::info!(
            previous = %previous,
            node_id = %self.current.load(),
            "Node re-registered under a new identity"
        );
    }
}

/// `<prefix><sep><service><sep><uuid>`, e.g. `crond:billing:3f2c..` for flat
/// key spaces or `/crond/billing/3f2c..` for tree-structured stores.
pub(crate) fn new_node_key(leading: &str, sep: &str, service_name: &str) -> String {
    format!(
        "{}{}{}{}{}{}",
        leading,
        PREFIX_KEY,
        sep,
        service_name,
        sep,
        Uuid::new_v4()
    )
}

/// Bound a single store round-trip; an elapsed deadline becomes [`Error::Timeout`].
pub(crate) async fn with_timeout<T, F>(limit: Duration, fut: F) -> Result<T, Error>
where
    F: Future<Output = Result<T, Error>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout(limit)),
    }
}

/// Renewal cadence for a lease of `ttl`.
pub(crate) fn renew_interval(ttl: Duration) -> Duration {
    (ttl / 2).max(Duration::from_millis(10))
}
