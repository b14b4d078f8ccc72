//! Saga timeouts.
//!
//! [`SchedulerState`] is the persistent set of pending timeouts keyed by job
//! id. It is a value: `add` and `remove` return a new state and leave the old
//! one untouched, so a saga can keep it in its own state and snapshot it.
//!
//! [`TimeoutScheduler`] is the live side: a task that owns a
//! `SchedulerState`, sleeps until the earliest entry is due and hands each due
//! entry to its sink exactly once, removing it before delivery.

use crate::errors::SchedulerError;
use crate::types::{Identity, JobId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// One pending timeout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule<J> {
    /// Identity of this timeout
    pub job_id: JobId,
    /// The saga the timeout fires into
    pub saga_id: Identity,
    /// When the timeout is due
    pub fire_at: DateTime<Utc>,
    /// Payload delivered to the saga
    pub job: J,
}

impl<J> Schedule<J> {
    /// Schedules `job` for `saga_id` at `fire_at` under a fresh job id.
    pub fn new(saga_id: Identity, fire_at: DateTime<Utc>, job: J) -> Self {
        Self {
            job_id: JobId::new(),
            saga_id,
            fire_at,
            job,
        }
    }

    /// Schedules `job` for `saga_id` after `delay`.
    pub fn after(saga_id: Identity, delay: Duration, job: J) -> Self {
        let delay = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);
        let fire_at = Utc::now()
            .checked_add_signed(delay)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Self::new(saga_id, fire_at, job)
    }

    /// Replaces the job id, for rescheduling a known job.
    #[must_use]
    pub fn with_job_id(mut self, job_id: JobId) -> Self {
        self.job_id = job_id;
        self
    }

    /// Whether the entry is due at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.fire_at <= now
    }
}

/// Persistent map of pending timeouts keyed by job id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(bound(
    serialize = "J: Serialize",
    deserialize = "J: Deserialize<'de> + Clone"
))]
pub struct SchedulerState<J: Clone> {
    entries: Arc<BTreeMap<JobId, Schedule<J>>>,
}

impl<J: Clone> SchedulerState<J> {
    /// An empty state.
    pub fn new() -> Self {
        Self {
            entries: Arc::new(BTreeMap::new()),
        }
    }

    /// Returns a state with `entry` added; an existing entry with the same job
    /// id is replaced.
    #[must_use]
    pub fn add(&self, entry: Schedule<J>) -> Self {
        let mut entries = Arc::clone(&self.entries);
        Arc::make_mut(&mut entries).insert(entry.job_id.clone(), entry);
        Self { entries }
    }

    /// Returns a state without `job_id`. Removing an unknown id is a no-op.
    #[must_use]
    pub fn remove(&self, job_id: &JobId) -> Self {
        if !self.entries.contains_key(job_id) {
            return self.clone();
        }
        let mut entries = Arc::clone(&self.entries);
        Arc::make_mut(&mut entries).remove(job_id);
        Self { entries }
    }

    /// Looks up an entry.
    pub fn get(&self, job_id: &JobId) -> Option<&Schedule<J>> {
        self.entries.get(job_id)
    }

    /// Whether `job_id` is pending.
    pub fn contains(&self, job_id: &JobId) -> bool {
        self.entries.contains_key(job_id)
    }

    /// Number of pending entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Pending entries in job id order.
    pub fn entries(&self) -> impl Iterator<Item = &Schedule<J>> {
        self.entries.values()
    }

    /// Entries due at `now`, earliest first.
    pub fn due(&self, now: DateTime<Utc>) -> Vec<Schedule<J>> {
        let mut due: Vec<_> = self
            .entries
            .values()
            .filter(|entry| entry.is_due(now))
            .cloned()
            .collect();
        due.sort_by(|a, b| a.fire_at.cmp(&b.fire_at));
        due
    }

    /// The earliest `fire_at`.
    pub fn next_fire_at(&self) -> Option<DateTime<Utc>> {
        self.entries.values().map(|entry| entry.fire_at).min()
    }
}

impl<J: Clone> Default for SchedulerState<J> {
    fn default() -> Self {
        Self::new()
    }
}

enum SchedulerCommand<J: Clone> {
    Schedule(Schedule<J>),
    Cancel(JobId),
    Pending(oneshot::Sender<SchedulerState<J>>),
}

/// Handle to a running timeout scheduler task.
///
/// Dropping the handle stops the task.
pub struct TimeoutScheduler<J: Clone> {
    sender: mpsc::Sender<SchedulerCommand<J>>,
    task: JoinHandle<()>,
}

impl<J> TimeoutScheduler<J>
where
    J: Clone + Send + Sync + 'static,
{
    /// Starts the task. Due entries are delivered to `sink`; the task stops
    /// when `sink` is closed or the handle is dropped.
    pub fn spawn(sink: mpsc::Sender<Schedule<J>>) -> Self {
        let (sender, receiver) = mpsc::channel(64);
        let task = tokio::spawn(run(receiver, sink));
        Self { sender, task }
    }

    /// Adds or replaces a pending timeout.
    pub async fn schedule(&self, entry: Schedule<J>) -> Result<(), SchedulerError> {
        let job_id = entry.job_id.clone();
        self.sender
            .send(SchedulerCommand::Schedule(entry))
            .await
            .map_err(|_| SchedulerError::Stopped(job_id))
    }

    /// Removes a pending timeout.
    pub async fn cancel(&self, job_id: JobId) -> Result<(), SchedulerError> {
        self.sender
            .send(SchedulerCommand::Cancel(job_id.clone()))
            .await
            .map_err(|_| SchedulerError::Stopped(job_id))
    }

    /// A copy of the pending set.
    pub async fn pending(&self) -> Result<SchedulerState<J>, SchedulerError> {
        let (reply, receiver) = oneshot::channel();
        self.sender
            .send(SchedulerCommand::Pending(reply))
            .await
            .map_err(|_| SchedulerError::Unavailable)?;
        receiver.await.map_err(|_| SchedulerError::Unavailable)
    }

    /// Whether the task is still running.
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

impl<J: Clone> Drop for TimeoutScheduler<J> {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run<J>(mut receiver: mpsc::Receiver<SchedulerCommand<J>>, sink: mpsc::Sender<Schedule<J>>)
where
    J: Clone + Send + Sync + 'static,
{
    let mut state = SchedulerState::new();
    loop {
        for entry in state.due(Utc::now()) {
            state = state.remove(&entry.job_id);
            trace!(job_id = %entry.job_id, saga_id = %entry.saga_id, "timeout fired");
            if sink.send(entry).await.is_err() {
                debug!("timeout sink closed; scheduler stopping");
                return;
            }
        }

        let wait = state
            .next_fire_at()
            .map(|at| (at - Utc::now()).to_std().unwrap_or(Duration::ZERO));

        tokio::select! {
            command = receiver.recv() => match command {
                Some(SchedulerCommand::Schedule(entry)) => state = state.add(entry),
                Some(SchedulerCommand::Cancel(job_id)) => state = state.remove(&job_id),
                Some(SchedulerCommand::Pending(reply)) => {
                    let _ = reply.send(state.clone());
                }
                None => return,
            },
            () = tokio::time::sleep(wait.unwrap_or_default()), if wait.is_some() => {}
        }
    }
}
