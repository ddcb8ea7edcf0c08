use std::env;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::driver::{MemoryDriver, MemoryStore, MembershipDriver};
use crate::job::{Gate, GateTable, JobType};
use crate::ring::DEFAULT_REPLICAS;
use crate::Error;

const DEFAULT_UPDATE_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(500);

/// Upper bound on virtual points per node; each refresh builds
/// `replicas * nodes` points.
pub const MAX_REPLICAS: usize = 10_000;

/// Tuning for a [`JobRegistry`](crate::JobRegistry).
#[derive(Debug, Clone)]
pub struct CrondConfig {
    /// Membership refresh period.
    pub update_interval: Duration,
    /// Lease TTL handed to the driver. Defaults to `update_interval`.
    pub lease_ttl: Option<Duration>,
    /// Refresh the membership view right before picking a job's owner.
    pub lazy_pick: bool,
    /// Virtual points per node on the hash ring.
    pub replicas: usize,
    /// Resolution of the built-in cron dispatcher.
    pub tick_interval: Duration,
    pub gates: GateTable,
}

impl Default for CrondConfig {
    fn default() -> Self {
        Self {
            update_interval: DEFAULT_UPDATE_INTERVAL,
            lease_ttl: None,
            lazy_pick: false,
            replicas: DEFAULT_REPLICAS,
            tick_interval: DEFAULT_TICK_INTERVAL,
            gates: GateTable::default(),
        }
    }
}

impl CrondConfig {
    /// Read overrides from `CROND_*` environment variables; unset variables
    /// keep their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for unparsable or out-of-range values.
    pub fn from_env() -> Result<Self, Error> {
        let mut config = Self::default();

        if let Some(ms) = env_u64("CROND_UPDATE_INTERVAL_MS")? {
            config.update_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = env_u64("CROND_LEASE_TTL_MS")? {
            config.lease_ttl = Some(Duration::from_millis(ms));
        }
        if let Some(ms) = env_u64("CROND_TICK_INTERVAL_MS")? {
            config.tick_interval = Duration::from_millis(ms);
        }
        if let Some(replicas) = env_u64("CROND_RING_REPLICAS")? {
            config.replicas = usize::try_from(replicas).map_err(|_| {
                Error::Config(format!("CROND_RING_REPLICAS={replicas} does not fit in usize"))
            })?;
        }
        if let Ok(value) = env::var("CROND_LAZY_PICK") {
            config.lazy_pick = parse_bool("CROND_LAZY_PICK", &value)?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.update_interval.is_zero() {
            return Err(Error::Config("update interval must be greater than zero".into()));
        }
        if self.lease_ttl.is_some_and(|ttl| ttl.is_zero()) {
            return Err(Error::Config("lease TTL must be greater than zero".into()));
        }
        if self.tick_interval.is_zero() {
            return Err(Error::Config("tick interval must be greater than zero".into()));
        }
        if self.replicas == 0 {
            return Err(Error::Config("ring replicas must be at least 1".into()));
        }
        if self.replicas > MAX_REPLICAS {
            return Err(Error::Config(format!(
                "ring replicas must be at most {MAX_REPLICAS}, got {}",
                self.replicas
            )));
        }
        Ok(())
    }

    pub fn lease_ttl(&self) -> Duration {
        self.lease_ttl.unwrap_or(self.update_interval)
    }

    pub fn with_update_interval(mut self, interval: Duration) -> Self {
        self.update_interval = interval;
        self
    }

    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = Some(ttl);
        self
    }

    pub fn with_lazy_pick(mut self, lazy_pick: bool) -> Self {
        self.lazy_pick = lazy_pick;
        self
    }

    pub fn with_replicas(mut self, replicas: usize) -> Self {
        self.replicas = replicas;
        self
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    /// Route jobs of `job_type` through `gate`.
    pub fn with_gate(mut self, job_type: JobType, gate: Gate) -> Self {
        self.gates.insert(job_type, gate);
        self
    }

    /// Gate for job types missing from the table.
    pub fn with_fallback_gate(mut self, gate: Gate) -> Self {
        self.gates.set_fallback(gate);
        self
    }
}

fn env_u64(name: &str) -> Result<Option<u64>, Error> {
    match env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| Error::Config(format!("{name}={value:?}: {e}"))),
        Err(_) => Ok(None),
    }
}

fn parse_bool(name: &str, value: &str) -> Result<bool, Error> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(Error::Config(format!("{name}={value:?}: expected a boolean"))),
    }
}

/// Which membership store to use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backend {
    /// In-process store; only coordinates registries inside this process.
    Memory,
    #[cfg(feature = "driver-redis")]
    Redis { url: String },
}

impl Backend {
    /// Parse `CROND_BACKEND` (`memory` or `redis`, default `redis` when the
    /// Redis driver is compiled in) and `REDIS_URL`.
    pub fn from_env() -> Result<Self, Error> {
        let name = env::var("CROND_BACKEND").ok();
        Self::parse(name.as_deref(), env::var("REDIS_URL").ok())
    }

    fn parse(name: Option<&str>, redis_url: Option<String>) -> Result<Self, Error> {
        match name {
            Some("memory") => Ok(Self::Memory),
            #[cfg(feature = "driver-redis")]
            Some("redis") | None => Ok(Self::Redis {
                url: redis_url.unwrap_or_else(|| "redis://127.0.0.1:6379".into()),
            }),
            #[cfg(not(feature = "driver-redis"))]
            None => {
                let _ = redis_url;
                Ok(Self::Memory)
            }
            Some(other) => Err(Error::Config(format!("unknown CROND_BACKEND {other:?}"))),
        }
    }

    /// Open the backend as a driver.
    pub async fn connect(&self) -> Result<Arc<dyn MembershipDriver>, Error> {
        match self {
            Self::Memory => Ok(Arc::new(MemoryDriver::new(MemoryStore::new()))),
            #[cfg(feature = "driver-redis")]
            Self::Redis { url } => Ok(Arc::new(crate::driver::RedisDriver::connect(url).await?)),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            #[cfg(feature = "driver-redis")]
            Self::Redis { .. } => "redis",
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
