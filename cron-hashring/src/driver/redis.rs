use ::redis::aio::MultiplexedConnection;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

use super::{new_node_key, renew_interval, with_timeout, MembershipDriver, NodeHandle, PREFIX_KEY};
use crate::Error;

const CALL_TIMEOUT: Duration = Duration::from_secs(2);
const DEFAULT_TTL: Duration = Duration::from_secs(5);
const SCAN_BATCH: usize = 100;

/// Membership over plain Redis keys: `crond:<service>:<uuid>` holding `ok`
/// with a millisecond TTL.
pub struct RedisDriver {
    conn: MultiplexedConnection,
    ttl: Arc<Mutex<Duration>>,
}

impl RedisDriver {
    pub async fn connect(redis_url: &str) -> Result<Self, Error> {
        let client = ::redis::Client::open(redis_url)?;
        let conn = with_timeout(CALL_TIMEOUT, async {
            Ok(client.get_multiplexed_async_connection().await?)
        })
        .await?;
        Ok(Self::new(conn))
    }

    pub fn new(conn: MultiplexedConnection) -> Self {
        Self {
            conn,
            ttl: Arc::new(Mutex::new(DEFAULT_TTL)),
        }
    }

    fn service_pattern(service_name: &str) -> String {
        format!("{}:{}:*", PREFIX_KEY, service_name)
    }

    async fn put(mut conn: MultiplexedConnection, node_id: &str, ttl: Duration) -> Result<(), Error> {
        // SET crond:<service>:<uuid> ok PX <ttl>
        with_timeout(CALL_TIMEOUT, async {
            ::redis::cmd("SET")
                .arg(node_id)
                .arg("ok")
                .arg("PX")
                .arg(ttl.as_millis() as u64)
                .query_async::<()>(&mut conn)
                .await?;
            Ok(())
        })
        .await
    }

    /// `Ok(false)` when the key no longer exists.
    async fn renew(mut conn: MultiplexedConnection, node_id: &str, ttl: Duration) -> Result<bool, Error> {
        with_timeout(CALL_TIMEOUT, async {
            let renewed: bool = ::redis::cmd("PEXPIRE")
                .arg(node_id)
                .arg(ttl.as_millis() as u64)
                .query_async(&mut conn)
                .await?;
            Ok(renewed)
        })
        .await
    }
}

#[async_trait]
impl MembershipDriver for RedisDriver {
    async fn ping(&self) -> Result<(), Error> {
        let mut conn = self.conn.clone();
        with_timeout(CALL_TIMEOUT, async {
            ::redis::cmd("PING").query_async::<String>(&mut conn).await?;
            Ok(())
        })
        .await
        .map_err(|e| Error::Unreachable(e.to_string()))
    }

    fn set_expiration(&self, ttl: Duration) {
        *self.ttl.lock() = ttl;
    }

    async fn register_service_node(&self, service_name: &str) -> Result<String, Error> {
        let node_id = new_node_key("", ":", service_name);
        let ttl = *self.ttl.lock();
        Self::put(self.conn.clone(), &node_id, ttl).await?;

        tracing::info!(%node_id, "Registered node in Redis");
        Ok(node_id)
    }

    fn keepalive(&self, node: NodeHandle) {
        let conn = self.conn.clone();
        let ttl = self.ttl.clone();

        tokio::spawn(async move {
            loop {
                let lease = *ttl.lock();
                tokio::time::sleep(renew_interval(lease)).await;

                let node_id = node.id();
                match Self::renew(conn.clone(), &node_id, lease).await {
                    Ok(true) => continue,
                    Ok(false) => {
                        tracing::warn!(node_id = %node_id, "Lease expired in Redis, re-registering");
                    }
                    Err(e) => {
                        tracing::warn!(node_id = %node_id, error = %e, "Lease renewal failed");
                    }
                }

                let fresh = new_node_key("", ":", node.service_name());
                match Self::put(conn.clone(), &fresh, lease).await {
                    Ok(()) => node.replace(fresh),
                    Err(e) => {
                        tracing::warn!(node_id = %node_id, error = %e, "Re-registration failed");
                    }
                }
            }
        });
    }

    async fn get_service_node_list(&self, service_name: &str) -> Result<Vec<String>, Error> {
        let pattern = Self::service_pattern(service_name);
        let mut conn = self.conn.clone();

        // SCAN <cursor> MATCH crond:<service>:* COUNT 100
        with_timeout(CALL_TIMEOUT, async {
            let mut nodes = Vec::new();
            let mut cursor: u64 = 0;
            loop {
                let (next, batch): (u64, Vec<String>) = ::redis::cmd("SCAN")
                    .arg(cursor)
                    .arg("MATCH")
                    .arg(&pattern)
                    .arg("COUNT")
                    .arg(SCAN_BATCH)
                    .query_async(&mut conn)
                    .await?;
                nodes.extend(batch);
                if next == 0 {
                    break;
                }
                cursor = next;
            }
            nodes.sort();
            nodes.dedup();
            Ok(nodes)
        })
        .await
    }
}
