//! Trigger engine boundary.
//!
//! A [`Scheduler`] decides *when* a job fires; the registry decides *where*.
//! [`CronScheduler`] is the default engine, built on the `cron` crate.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::{Error, Job};

/// Handle returned by [`Scheduler::add_job`].
pub type EntryId = u64;

#[async_trait]
pub trait Scheduler: Send + Sync + 'static {
    /// Register `job` under the schedule expression `spec`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidSchedule`] if `spec` cannot be parsed.
    fn add_job(&self, spec: &str, job: Arc<dyn Job>) -> Result<EntryId, Error>;

    /// Unregister an entry. Unknown ids are ignored.
    fn remove(&self, id: EntryId);

    /// Start dispatching in the background and return immediately.
    fn start(&self);

    /// Dispatch on the current task until [`stop`](Self::stop) is called.
    async fn run(&self);

    fn stop(&self);
}

/// Parse a cron expression.
///
/// Accepts the conventional 5-field form (`min hour dom month dow`), the
/// 6/7-field form with seconds (and year), and `@hourly`-style descriptors.
pub fn parse_schedule(spec: &str) -> Result<cron::Schedule, Error> {
    let trimmed = spec.trim();
    let expr = if !trimmed.starts_with('@') && trimmed.split_whitespace().count() == 5 {
        format!("0 {}", trimmed)
    } else {
        trimmed.to_string()
    };

    cron::Schedule::from_str(&expr).map_err(|e| Error::InvalidSchedule {
        spec: spec.to_string(),
        reason: e.to_string(),
    })
}

struct Entry {
    schedule: cron::Schedule,
    job: Arc<dyn Job>,
    next_fire: Option<DateTime<Utc>>,
}

struct Shared {
    entries: Mutex<HashMap<EntryId, Entry>>,
    next_id: AtomicU64,
    tick_interval: Duration,
    cancel: Mutex<Option<CancellationToken>>,
}

impl Shared {
    /// Jobs due at `now`; advances each due entry to its next fire time
    /// after `now`, so ticks missed while stopped are not replayed.
    fn take_due(&self, now: DateTime<Utc>) -> Vec<Arc<dyn Job>> {
        let mut entries = self.entries.lock();
        let mut due = Vec::new();
        for entry in entries.values_mut() {
            if entry.next_fire.is_some_and(|t| now >= t) {
                due.push(entry.job.clone());
                entry.next_fire = entry.schedule.after(&now).next();
            }
        }
        due
    }

    /// Re-base every entry on `now` (used when dispatching (re)starts).
    fn reschedule(&self, now: DateTime<Utc>) {
        for entry in self.entries.lock().values_mut() {
            entry.next_fire = entry.schedule.after(&now).next();
        }
    }

    async fn dispatch(self: Arc<Self>, token: CancellationToken) {
        self.reschedule(Utc::now());

        let mut tick = tokio::time::interval(self.tick_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        tracing::debug!("Cron dispatch loop started");
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    tracing::debug!("Cron dispatch loop stopped");
                    break;
                }

                _ = tick.tick() => {
                    for job in self.take_due(Utc::now()) {
                        tokio::spawn(async move { job.run().await });
                    }
                }
            }
        }
    }

    /// Install a fresh token unless a dispatch loop is already live.
    fn arm(&self) -> Option<CancellationToken> {
        let mut slot = self.cancel.lock();
        if slot.as_ref().is_some_and(|t| !t.is_cancelled()) {
            return None;
        }
        let token = CancellationToken::new();
        *slot = Some(token.clone());
        Some(token)
    }
}

/// Default [`Scheduler`]: polls its entries every `tick_interval` and spawns
/// each due job on its own task.
#[derive(Clone)]
pub struct CronScheduler {
    shared: Arc<Shared>,
}

impl CronScheduler {
    pub fn new(tick_interval: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                entries: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                tick_interval,
                cancel: Mutex::new(None),
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.shared.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Next fire time of an entry, if it has one.
    pub fn next_fire(&self, id: EntryId) -> Option<DateTime<Utc>> {
        self.shared.entries.lock().get(&id).and_then(|e| e.next_fire)
    }

    pub fn is_running(&self) -> bool {
        self.shared
            .cancel
            .lock()
            .as_ref()
            .is_some_and(|t| !t.is_cancelled())
    }
}

impl Default for CronScheduler {
    fn default() -> Self {
        Self::new(Duration::from_millis(500))
    }
}

#[async_trait]
impl Scheduler for CronScheduler {
    fn add_job(&self, spec: &str, job: Arc<dyn Job>) -> Result<EntryId, Error> {
        let schedule = parse_schedule(spec)?;
        let next_fire = schedule.after(&Utc::now()).next();
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);

        self.shared.entries.lock().insert(
            id,
            Entry {
                schedule,
                job,
                next_fire,
            },
        );
        Ok(id)
    }

    fn remove(&self, id: EntryId) {
        self.shared.entries.lock().remove(&id);
    }

    fn start(&self) {
        let Some(token) = self.shared.arm() else {
            return;
        };
        tokio::spawn(self.shared.clone().dispatch(token));
    }

    async fn run(&self) {
        let Some(token) = self.shared.arm() else {
            return;
        };
        self.shared.clone().dispatch(token).await;
    }

    fn stop(&self) {
        if let Some(token) = self.shared.cancel.lock().take() {
            token.cancel();
        }
    }
}
