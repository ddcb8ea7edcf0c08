//! Distributed cron with consistent-hash job ownership.
//!
//! Every process that registers the same service name joins a lease-based
//! membership group. Each process keeps its own view of the live nodes and
//! builds a hash ring from it; when a [`JobType::Distributed`] job fires, the
//! process runs it only if it owns the job name on that ring.
//!
//! This crate provides:
//! - A consistent hash ring with virtual nodes (SipHash, 150 points per node)
//! - Pluggable membership drivers: Redis (`driver-redis`) and in-memory
//! - Lease keepalive that re-registers under a fresh identity after expiry
//! - A cron dispatcher built on the `cron` crate
//!
//! # Example
//!
//! ```rust,ignore
//! use cron_hashring::{CrondConfig, JobRegistry, JobType, RedisDriver};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let driver = Arc::new(RedisDriver::connect(&std::env::var("REDIS_URL")?).await?);
//!     let crond = JobRegistry::new("billing", driver, CrondConfig::default()).await?;
//!
//!     crond.add_func("rollup", JobType::Distributed, "*/5 * * * *", || async {
//!         // one live node per tick
//!     })?;
//!
//!     crond.run().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Failure Detection
//!
//! - **Crash/kill -9**: the node's lease expires after the TTL and it drops
//!   out of every view on the next refresh
//! - **Store outage**: refreshes fail and each node keeps its last view
//!
//! Views are refreshed independently, so while membership is changing two
//! nodes may briefly disagree on an owner. Delivery is at-least-once around
//! membership changes, exactly-once in steady state.

mod config;
pub mod driver;
mod error;
mod job;
mod node_pool;
mod registry;
mod ring;
pub mod scheduler;

pub use config::{Backend, CrondConfig, MAX_REPLICAS};
pub use driver::{MembershipDriver, MemoryDriver, MemoryStore, NodeHandle};
#[cfg(feature = "driver-redis")]
pub use driver::RedisDriver;
pub use error::Error;
pub use job::{FuncJob, Gate, GateTable, Job, JobType, JobWrapper};
pub use node_pool::{MembershipEvent, NodePool};
pub use registry::JobRegistry;
pub use ring::{HashRing, DEFAULT_REPLICAS};
pub use scheduler::{CronScheduler, EntryId, Scheduler};
