use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::driver::{MembershipDriver, NodeHandle};
use crate::{CrondConfig, Error, HashRing};

/// Membership change event.
#[derive(Debug, Clone, PartialEq)]
pub enum MembershipEvent {
    Joined(String),
    Left(String),
}

/// State shared with the refresh task.
struct Membership {
    service_name: String,
    driver: Arc<dyn MembershipDriver>,
    replicas: usize,
    ring: ArcSwap<HashRing>,
    refresh_lock: tokio::sync::Mutex<()>,
    event_tx: broadcast::Sender<MembershipEvent>,
}

impl Membership {
    /// One refresh cycle: list live nodes, build a new ring, swap it in.
    /// On failure the previous ring stays in place.
    async fn refresh(&self) -> Result<usize, Error> {
        let _guard = self.refresh_lock.lock().await;
        let nodes = self.driver.get_service_node_list(&self.service_name).await?;
        let next = HashRing::with_replicas(nodes, self.replicas);
        let previous = self.ring.swap(Arc::new(next));
        let current = self.ring.load();

        if previous.nodes() != current.nodes() {
            let before: HashSet<&String> = previous.nodes().iter().collect();
            let after: HashSet<&String> = current.nodes().iter().collect();
            for id in after.difference(&before) {
                tracing::debug!(id = %id, "Node joined");
                let _ = self.event_tx.send(MembershipEvent::Joined((*id).clone()));
            }
            for id in before.difference(&after) {
                tracing::debug!(id = %id, "Node left");
                let _ = self.event_tx.send(MembershipEvent::Left((*id).clone()));
            }
            tracing::debug!(count = current.len(), "Membership changed");
        }

        Ok(current.len())
    }
}

/// Owns this process's membership view and hash ring.
///
/// The ring is replaced wholesale on every refresh; lookups load the current
/// snapshot atomically and never observe a partially built ring.
pub struct NodePool {
    membership: Arc<Membership>,
    update_interval: Duration,
    lease_ttl: Duration,
    running: Arc<AtomicBool>,
    node: Mutex<Option<NodeHandle>>,
    register_lock: tokio::sync::Mutex<()>,
    refresh_handle: Mutex<Option<JoinHandle<()>>>,
}

impl NodePool {
    /// Ping the store and build an empty pool.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Unreachable`] if the store does not answer. Running
    /// without coordination is never attempted.
    pub async fn new(
        service_name: &str,
        driver: Arc<dyn MembershipDriver>,
        config: &CrondConfig,
        running: Arc<AtomicBool>,
    ) -> Result<Self, Error> {
        driver.ping().await?;

        let (event_tx, _) = broadcast::channel(16);

        Ok(Self {
            membership: Arc::new(Membership {
                service_name: service_name.to_string(),
                driver,
                replicas: config.replicas,
                ring: ArcSwap::from_pointee(HashRing::default()),
                refresh_lock: tokio::sync::Mutex::new(()),
                event_tx,
            }),
            update_interval: config.update_interval,
            lease_ttl: config.lease_ttl(),
            running,
            node: Mutex::new(None),
            register_lock: tokio::sync::Mutex::new(()),
            refresh_handle: Mutex::new(None),
        })
    }

    /// Register this process, start its keepalive loop, establish the first
    /// membership view synchronously, then start the periodic refresh loop.
    ///
    /// A pool that already registered keeps its identity (and keepalive loop)
    /// across restarts.
    ///
    /// # Errors
    ///
    /// Returns an error if registration or the first refresh fails.
    pub async fn start_watch(&self) -> Result<(), Error> {
        let node = self.register_once().await?;

        let count = self.membership.refresh().await?;
        tracing::info!(node_id = %node.id(), count, "Membership view established");

        let handle = self.spawn_refresh_task();
        if let Some(previous) = self.refresh_handle.lock().replace(handle) {
            previous.abort();
        }
        Ok(())
    }

    /// Existing identity, or a freshly registered one with its keepalive
    /// loop. Concurrent callers wait for each other and share one identity.
    async fn register_once(&self) -> Result<NodeHandle, Error> {
        let _guard = self.register_lock.lock().await;
        if let Some(node) = self.node.lock().clone() {
            return Ok(node);
        }

        let driver = &self.membership.driver;
        driver.set_expiration(self.lease_ttl);
        let node_id = driver
            .register_service_node(&self.membership.service_name)
            .await?;
        let node = NodeHandle::new(&self.membership.service_name, node_id);
        driver.keepalive(node.clone());
        *self.node.lock() = Some(node.clone());
        Ok(node)
    }

    fn spawn_refresh_task(&self) -> JoinHandle<()> {
        let membership = self.membership.clone();
        let running = self.running.clone();
        let period = self.update_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                if !running.load(Ordering::Acquire) {
                    tracing::debug!("Refresh loop stopping");
                    break;
                }
                if let Err(e) = membership.refresh().await {
                    tracing::warn!(error = %e, "Membership refresh failed, keeping previous view");
                }
            }
        })
    }

    /// Run one refresh cycle now. Returns the number of live nodes.
    pub async fn refresh(&self) -> Result<usize, Error> {
        self.membership.refresh().await
    }

    /// Owner of `job_name` in the current view, or `None` when the view is
    /// empty. `None` means no node runs the job this tick.
    pub fn pick_node_by_job_name(&self, job_name: &str) -> Option<String> {
        self.membership.ring.load().get(job_name).map(str::to_string)
    }

    /// Shared handle to this process's identity, once registered. It follows
    /// re-registrations made by the keepalive loop.
    pub fn node_handle(&self) -> Option<NodeHandle> {
        self.node.lock().clone()
    }

    /// This process's current identity, once registered.
    pub fn node_id(&self) -> Option<Arc<String>> {
        self.node.lock().as_ref().map(NodeHandle::id)
    }

    pub fn service_name(&self) -> &str {
        &self.membership.service_name
    }

    /// Snapshot of the current ring.
    pub fn ring(&self) -> Arc<HashRing> {
        self.membership.ring.load_full()
    }

    pub fn member_count(&self) -> usize {
        self.membership.ring.load().len()
    }

    /// Subscribe to membership change events.
    ///
    /// Events are broadcast AFTER the ring has been updated.
    pub fn subscribe(&self) -> broadcast::Receiver<MembershipEvent> {
        self.membership.event_tx.subscribe()
    }
}
