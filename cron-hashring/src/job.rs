use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Weak};

use crate::registry::RegistryInner;

/// Anything the scheduler can run.
#[async_trait]
pub trait Job: Send + Sync + 'static {
    async fn run(&self);
}

/// Adapts an async closure to [`Job`].
pub struct FuncJob<F> {
    func: F,
}

impl<F> FuncJob<F> {
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

#[async_trait]
impl<F, Fut> Job for FuncJob<F>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn run(&self) {
        (self.func)().await
    }
}

/// How a job is meant to be executed across the fleet.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum JobType {
    /// One node per tick, elected by the hash ring.
    Distributed,
    /// Every node, every tick.
    Local,
    /// Application-defined kind; routed through the gate table.
    Named(String),
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Distributed => f.write_str("distributed"),
            Self::Local => f.write_str("local"),
            Self::Named(name) => f.write_str(name),
        }
    }
}

/// Check performed at trigger time before a job runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    /// Run only if this node owns the job name in the current membership view.
    OwnerOnly,
    /// Run unconditionally.
    Everywhere,
}

/// Job type to gate mapping.
#[derive(Debug, Clone)]
pub struct GateTable {
    gates: HashMap<JobType, Gate>,
    fallback: Gate,
}

impl Default for GateTable {
    fn default() -> Self {
        let mut gates = HashMap::new();
        gates.insert(JobType::Distributed, Gate::OwnerOnly);
        gates.insert(JobType::Local, Gate::Everywhere);
        Self {
            gates,
            fallback: Gate::Everywhere,
        }
    }
}

impl GateTable {
    pub fn insert(&mut self, job_type: JobType, gate: Gate) {
        self.gates.insert(job_type, gate);
    }

    pub fn set_fallback(&mut self, gate: Gate) {
        self.fallback = gate;
    }

    pub fn gate_for(&self, job_type: &JobType) -> Gate {
        self.gates.get(job_type).copied().unwrap_or(self.fallback)
    }
}

/// What the scheduler actually invokes: the user's job plus the metadata the
/// ownership gate needs.
pub struct JobWrapper {
    name: String,
    job_type: JobType,
    job: Arc<dyn Job>,
    registry: Weak<RegistryInner>,
}

impl JobWrapper {
    pub(crate) fn new(
        name: &str,
        job_type: JobType,
        job: Arc<dyn Job>,
        registry: Weak<RegistryInner>,
    ) -> Self {
        Self {
            name: name.to_string(),
            job_type,
            job,
            registry,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn job_type(&self) -> &JobType {
        &self.job_type
    }
}

#[async_trait]
impl Job for JobWrapper {
    async fn run(&self) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        if registry.should_run(&self.name, &self.job_type).await {
            self.job.run().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_default_gates() {
        let table = GateTable::default();
        assert_eq!(table.gate_for(&JobType::Distributed), Gate::OwnerOnly);
        assert_eq!(table.gate_for(&JobType::Local), Gate::Everywhere);
        assert_eq!(
            table.gate_for(&JobType::Named("reports".into())),
            Gate::Everywhere
        );
    }

    #[test]
    fn test_named_type_and_fallback_override() {
        let mut table = GateTable::default();
        table.insert(JobType::Named("billing".into()), Gate::OwnerOnly);
        table.set_fallback(Gate::OwnerOnly);

        assert_eq!(
            table.gate_for(&JobType::Named("billing".into())),
            Gate::OwnerOnly
        );
        assert_eq!(table.gate_for(&JobType::Named("other".into())), Gate::OwnerOnly);
        assert_eq!(table.gate_for(&JobType::Local), Gate::Everywhere);
    }

    #[test]
    fn test_job_type_display() {
        assert_eq!(JobType::Distributed.to_string(), "distributed");
        assert_eq!(JobType::Named("reports".into()).to_string(), "reports");
    }

    #[tokio::test]
    async fn test_func_job_runs_closure() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let job = FuncJob::new(move || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
            }
        });

        job.run().await;
        job.run().await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_wrapper_without_registry_does_nothing() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let job: Arc<dyn Job> = Arc::new(FuncJob::new(move || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
            }
        }));

        let wrapper = JobWrapper::new("orphan", JobType::Local, job, Weak::new());
        wrapper.run().await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(wrapper.name(), "orphan");
    }
}
