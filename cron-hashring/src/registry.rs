use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::driver::MembershipDriver;
use crate::job::{FuncJob, Gate, GateTable, Job, JobType, JobWrapper};
use crate::scheduler::{CronScheduler, EntryId, Scheduler};
use crate::{CrondConfig, Error, NodePool};

struct RegisteredJob {
    wrapper: Arc<JobWrapper>,
    entry_id: EntryId,
}

/// Start/stop bookkeeping. `stops` counts `stop()` calls so a start that
/// was overtaken by a stop can tell, once its store round-trips are done.
#[derive(Default)]
struct Lifecycle {
    stops: u64,
    run_token: Option<CancellationToken>,
}

pub(crate) struct RegistryInner {
    jobs: Mutex<HashMap<String, RegisteredJob>>,
    lifecycle: Mutex<Lifecycle>,
    node_pool: NodePool,
    scheduler: Arc<dyn Scheduler>,
    running: Arc<AtomicBool>,
    gates: GateTable,
    lazy_pick: bool,
}

impl RegistryInner {
    /// Ownership gate, evaluated by a [`JobWrapper`] each time it fires.
    pub(crate) async fn should_run(&self, job_name: &str, job_type: &JobType) -> bool {
        match self.gates.gate_for(job_type) {
            Gate::Everywhere => true,
            Gate::OwnerOnly => self.this_node_runs(job_name).await,
        }
    }

    async fn this_node_runs(&self, job_name: &str) -> bool {
        if self.lazy_pick {
            if let Err(e) = self.node_pool.refresh().await {
                tracing::warn!(job = %job_name, error = %e, "Refresh before pick failed, using previous view");
            }
        }

        let Some(owner) = self.node_pool.pick_node_by_job_name(job_name) else {
            tracing::warn!(job = %job_name, "Membership view is empty, skipping tick");
            return false;
        };
        let Some(me) = self.node_pool.node_id() else {
            return false;
        };

        let mine = owner == *me;
        tracing::debug!(job = %job_name, owner = %owner, mine, "Picked job owner");
        mine
    }
}

/// Distributed cron front end.
///
/// Jobs are registered with the underlying [`Scheduler`] wrapped in a
/// [`JobWrapper`]; when a tick fires, the wrapper consults the node pool and
/// runs the job only where its gate allows. For [`JobType::Distributed`] jobs
/// that is the single node owning the job name on the hash ring.
///
/// # Example
///
/// ```rust,ignore
/// use cron_hashring::{CrondConfig, JobRegistry, JobType, RedisDriver};
/// use std::sync::Arc;
///
/// let driver = Arc::new(RedisDriver::connect("redis://127.0.0.1:6379").await?);
/// let crond = JobRegistry::new("billing", driver, CrondConfig::default()).await?;
///
/// crond.add_func("nightly-invoices", JobType::Distributed, "0 2 * * *", || async {
///     // runs on exactly one live node
/// })?;
///
/// crond.start().await?;
/// ```
#[derive(Clone)]
pub struct JobRegistry {
    inner: Arc<RegistryInner>,
}

impl JobRegistry {
    /// Create a registry backed by the built-in [`CronScheduler`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::Unreachable`] if the membership store does not answer,
    /// or [`Error::Config`] for an invalid configuration.
    pub async fn new(
        service_name: &str,
        driver: Arc<dyn MembershipDriver>,
        config: CrondConfig,
    ) -> Result<Self, Error> {
        let scheduler = Arc::new(CronScheduler::new(config.tick_interval));
        Self::with_scheduler(service_name, driver, scheduler, config).await
    }

    /// Create a registry that hands its jobs to `scheduler`.
    pub async fn with_scheduler(
        service_name: &str,
        driver: Arc<dyn MembershipDriver>,
        scheduler: Arc<dyn Scheduler>,
        config: CrondConfig,
    ) -> Result<Self, Error> {
        config.validate()?;

        let running = Arc::new(AtomicBool::new(false));
        let node_pool = NodePool::new(service_name, driver, &config, running.clone()).await?;

        Ok(Self {
            inner: Arc::new(RegistryInner {
                jobs: Mutex::new(HashMap::new()),
                lifecycle: Mutex::new(Lifecycle::default()),
                node_pool,
                scheduler,
                running,
                gates: config.gates,
                lazy_pick: config.lazy_pick,
            }),
        })
    }

    /// Register a job object.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateJob`] if `name` is taken, or the scheduler's
    /// error if `spec` is rejected. Nothing is stored on error.
    pub fn add_job<J: Job>(
        &self,
        name: &str,
        job_type: JobType,
        spec: &str,
        job: J,
    ) -> Result<(), Error> {
        self.register(name, job_type, spec, Arc::new(job))
    }

    /// Register an async closure.
    pub fn add_func<F, Fut>(
        &self,
        name: &str,
        job_type: JobType,
        spec: &str,
        func: F,
    ) -> Result<(), Error>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.register(name, job_type, spec, Arc::new(FuncJob::new(func)))
    }

    fn register(
        &self,
        name: &str,
        job_type: JobType,
        spec: &str,
        job: Arc<dyn Job>,
    ) -> Result<(), Error> {
        let mut jobs = self.inner.jobs.lock();
        if jobs.contains_key(name) {
            return Err(Error::DuplicateJob(name.to_string()));
        }

        let wrapper = Arc::new(JobWrapper::new(
            name,
            job_type,
            job,
            Arc::downgrade(&self.inner),
        ));
        let entry_id = self.inner.scheduler.add_job(spec, wrapper.clone())?;

        tracing::debug!(job = %name, job_type = %wrapper.job_type(), spec, "Job added");
        jobs.insert(name.to_string(), RegisteredJob { wrapper, entry_id });
        Ok(())
    }

    /// Unregister a job. Unknown names are ignored.
    pub fn remove(&self, name: &str) {
        let removed = self.inner.jobs.lock().remove(name);
        if let Some(job) = removed {
            self.inner.scheduler.remove(job.entry_id);
            tracing::info!(job = %job.wrapper.name(), "Job removed");
        }
    }

    /// Join the cluster and start dispatching in the background.
    ///
    /// A [`stop`](Self::stop) that lands while this is still talking to the
    /// store wins: the scheduler is not started and `Ok` is returned.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Startup`] if registration or the first membership
    /// refresh fails; the registry is then left stopped and no job runs.
    pub async fn start(&self) -> Result<(), Error> {
        let epoch = self.start_watch().await?;

        let lifecycle = self.inner.lifecycle.lock();
        if lifecycle.stops != epoch {
            tracing::info!("Crond stopped before start completed");
            return Ok(());
        }
        self.inner.scheduler.start();
        tracing::info!(node_id = ?self.node_id(), "Crond started");
        Ok(())
    }

    /// Like [`start`](Self::start), but dispatches on the current task and
    /// returns only after [`stop`](Self::stop).
    pub async fn run(&self) -> Result<(), Error> {
        let epoch = self.start_watch().await?;

        let token = {
            let mut lifecycle = self.inner.lifecycle.lock();
            if lifecycle.stops != epoch {
                tracing::info!("Crond stopped before run started");
                return Ok(());
            }
            let token = CancellationToken::new();
            lifecycle.run_token = Some(token.clone());
            token
        };

        tracing::info!(node_id = ?self.node_id(), "Crond running");
        tokio::select! {
            biased;
            _ = token.cancelled() => self.inner.scheduler.stop(),
            _ = self.inner.scheduler.run() => {}
        }
        Ok(())
    }

    /// Returns the stop generation observed when the start began.
    async fn start_watch(&self) -> Result<u64, Error> {
        let epoch = {
            let lifecycle = self.inner.lifecycle.lock();
            self.inner.running.store(true, Ordering::Release);
            lifecycle.stops
        };

        if let Err(e) = self.inner.node_pool.start_watch().await {
            let lifecycle = self.inner.lifecycle.lock();
            if lifecycle.stops == epoch {
                self.inner.running.store(false, Ordering::Release);
            }
            tracing::error!(error = %e, "Crond start watch failed");
            return Err(Error::Startup(Box::new(e)));
        }
        Ok(epoch)
    }

    /// Stop dispatching. The refresh loop ends on its next tick; the lease
    /// keepalive keeps running until the process exits.
    pub fn stop(&self) {
        let mut lifecycle = self.inner.lifecycle.lock();
        lifecycle.stops += 1;
        self.inner.running.store(false, Ordering::Release);
        self.inner.scheduler.stop();
        if let Some(token) = lifecycle.run_token.take() {
            token.cancel();
        }
        tracing::info!("Crond stopped");
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// This process's node identity, once started.
    pub fn node_id(&self) -> Option<String> {
        self.inner.node_pool.node_id().map(|id| id.to_string())
    }

    pub fn node_pool(&self) -> &NodePool {
        &self.inner.node_pool
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.jobs.lock().contains_key(name)
    }

    pub fn job_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.jobs.lock().keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{MemoryDriver, MemoryStore};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn config() -> CrondConfig {
        CrondConfig::default()
            .with_update_interval(Duration::from_millis(50))
            .with_lease_ttl(Duration::from_secs(2))
            .with_tick_interval(Duration::from_millis(50))
    }

    async fn registry(store: &MemoryStore) -> JobRegistry {
        JobRegistry::new("svc", Arc::new(MemoryDriver::new(store.clone())), config())
            .await
            .unwrap()
    }

    fn counter() -> (Arc<AtomicUsize>, impl Fn() -> std::future::Ready<()> + Send + Sync + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let func = move || {
            c.fetch_add(1, Ordering::SeqCst);
            std::future::ready(())
        };
        (count, func)
    }

    #[tokio::test]
    async fn test_new_fails_when_store_unreachable() {
        let store = MemoryStore::new();
        store.set_reachable(false);
        let result =
            JobRegistry::new("svc", Arc::new(MemoryDriver::new(store)), config()).await;
        assert!(matches!(result, Err(Error::Unreachable(_))));
    }

    #[tokio::test]
    async fn test_new_rejects_invalid_config() {
        let store = MemoryStore::new();
        let result = JobRegistry::new(
            "svc",
            Arc::new(MemoryDriver::new(store)),
            config().with_replicas(0),
        )
        .await;
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_duplicate_job_is_rejected() {
        let store = MemoryStore::new();
        let crond = registry(&store).await;
        let (_, first) = counter();
        let (_, second) = counter();

        crond
            .add_func("nightly", JobType::Distributed, "0 2 * * *", first)
            .unwrap();
        let err = crond
            .add_func("nightly", JobType::Local, "*/5 * * * *", second)
            .unwrap_err();

        assert!(matches!(err, Error::DuplicateJob(ref name) if name == "nightly"));
        assert_eq!(crond.job_names(), vec!["nightly".to_string()]);
    }

    #[tokio::test]
    async fn test_invalid_spec_stores_nothing() {
        let store = MemoryStore::new();
        let crond = registry(&store).await;
        let (_, func) = counter();

        let err = crond
            .add_func("broken", JobType::Distributed, "every tuesday", func)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidSchedule { .. }));
        assert!(!crond.contains("broken"));
    }

    #[tokio::test]
    async fn test_remove_unknown_is_noop() {
        let store = MemoryStore::new();
        let crond = registry(&store).await;
        let (_, func) = counter();
        crond
            .add_func("nightly", JobType::Distributed, "0 2 * * *", func)
            .unwrap();

        crond.remove("does-not-exist");
        assert!(crond.contains("nightly"));

        crond.remove("nightly");
        assert!(crond.job_names().is_empty());
    }

    #[tokio::test]
    async fn test_name_is_free_again_after_remove() {
        let store = MemoryStore::new();
        let crond = registry(&store).await;
        let (_, first) = counter();
        let (_, second) = counter();

        crond.add_func("job", JobType::Local, "* * * * *", first).unwrap();
        crond.remove("job");
        assert!(crond.add_func("job", JobType::Local, "* * * * *", second).is_ok());
    }

    #[tokio::test]
    async fn test_start_fails_when_store_goes_away() {
        let store = MemoryStore::new();
        let crond = registry(&store).await;
        store.set_reachable(false);

        let err = crond.start().await.unwrap_err();
        assert!(matches!(err, Error::Startup(_)));
        assert!(!crond.is_running());
        assert_eq!(crond.node_id(), None);
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let store = MemoryStore::new();
        let crond = registry(&store).await;

        crond.start().await.unwrap();
        assert!(crond.is_running());
        let me = crond.node_id().unwrap();
        assert!(me.starts_with("/crond/svc/"));
        assert_eq!(crond.node_pool().member_count(), 1);

        crond.stop();
        assert!(!crond.is_running());
    }

    #[tokio::test]
    async fn test_distributed_job_runs_on_solo_node() {
        let store = MemoryStore::new();
        let crond = registry(&store).await;
        let (count, func) = counter();

        crond
            .add_func("every-second", JobType::Distributed, "* * * * * *", func)
            .unwrap();
        crond.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(2300)).await;
        crond.stop();

        assert!(count.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn test_run_blocks_until_stop() {
        let store = MemoryStore::new();
        let crond = registry(&store).await;

        let runner = crond.clone();
        let handle = tokio::spawn(async move { runner.run().await });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!handle.is_finished());
        assert!(crond.is_running());

        crond.stop();
        let result = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("run() did not return after stop()")
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_empty_view_skips_distributed_but_not_local() {
        let store = MemoryStore::new();
        let crond = registry(&store).await;
        crond.start().await.unwrap();
        crond.stop();

        let me = crond.node_id().unwrap();
        store.revoke(&me);
        crond.node_pool().refresh().await.unwrap();

        assert!(!crond.inner.should_run("job1", &JobType::Distributed).await);
        assert!(crond.inner.should_run("job1", &JobType::Local).await);
    }
}
