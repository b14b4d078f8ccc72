//! Long-running sagas.
//!
//! A saga is an entity whose commands are the domain events it observes and
//! the timeouts it scheduled. It records what it decided as its own events;
//! [`Saga::react`] turns each committed saga event into outbound actions.
//!
//! [`SagaManager`] wires one saga type into the runtime:
//!
//! - an intake task reads an event feed, locates the saga for each event and
//!   delivers it as [`SagaInput::Event`],
//! - a reaction task reads the saga host's own feed and performs the actions
//!   [`Saga::react`] returns,
//! - a timeout task forwards fired timeouts as [`SagaInput::Timeout`].
//!
//! Both feeds are [`EventFeed`]s, so a burst of commits larger than the
//! broadcast buffer delays sagas but never skips an event.
//!
//! A saga keeps its pending timeouts in its state and drops an entry while
//! handling the fired timeout. Handling a timeout whose entry is already gone
//! must emit nothing; that is what makes delivery at-most-once.

use crate::command::CommandEnvelope;
use crate::entity::Entity;
use crate::errors::{CommandError, StoreError};
use crate::event::{CommittedEvent, DomainEvent, TypeTag};
use crate::feed::EventFeed;
use crate::host::EntityHost;
use crate::scheduler::{Schedule, TimeoutScheduler};
use crate::sharding::SagaLocator;
use crate::types::{CorrelationId, Identity, JobId};
use async_trait::async_trait;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

// Pause before re-reading a feed whose log read failed.
const FEED_RETRY_DELAY: Duration = Duration::from_millis(100);

/// What a saga handles: an observed event or one of its fired timeouts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SagaInput<E, J> {
    /// A committed event located to this saga.
    Event(CommittedEvent<E>),
    /// A timeout this saga scheduled.
    Timeout(Schedule<J>),
}

impl<E, J> SagaInput<E, J> {
    /// The observed event, if this is one.
    pub const fn as_event(&self) -> Option<&CommittedEvent<E>> {
        match self {
            Self::Event(event) => Some(event),
            Self::Timeout(_) => None,
        }
    }

    /// The fired timeout, if this is one.
    pub const fn as_timeout(&self) -> Option<&Schedule<J>> {
        match self {
            Self::Timeout(entry) => Some(entry),
            Self::Event(_) => None,
        }
    }
}

impl<E: TypeTag, J: TypeTag> TypeTag for SagaInput<E, J> {
    fn type_tag(&self) -> &'static str {
        match self {
            Self::Event(event) => event.event().type_tag(),
            Self::Timeout(entry) => entry.job.type_tag(),
        }
    }
}

/// Something a saga asks the runtime to do after a commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SagaAction<C, J> {
    /// Send a command through the saga's dispatcher.
    Dispatch(CommandEnvelope<C>),
    /// Arm a timeout.
    ScheduleTimeout(Schedule<J>),
    /// Disarm a timeout.
    CancelTimeout(JobId),
}

/// A saga entity type.
///
/// The entity's `Command` type is `SagaInput<ObservedEvent, Self::Job>`;
/// [`SagaManager::start`] enforces that.
pub trait Saga: Entity {
    /// Timeout payload.
    type Job: TypeTag + Clone + Debug + Send + Sync + 'static;

    /// Commands the saga sends out.
    type Outbound: Send + Sync + 'static;

    /// Actions to take after `event` was committed by this saga.
    fn react(event: &CommittedEvent<Self::Event>) -> Vec<SagaAction<Self::Outbound, Self::Job>>;

    /// Timeouts still pending in `state`, re-armed after a restart.
    fn pending_timeouts(state: &Self::State) -> Vec<Schedule<Self::Job>> {
        let _ = state;
        Vec::new()
    }
}

/// Target for saga-issued commands.
#[async_trait]
pub trait CommandDispatcher<C>: Send + Sync {
    /// Delivers `envelope` and waits for it to commit or fail.
    async fn dispatch(&self, envelope: CommandEnvelope<C>) -> Result<(), CommandError>;
}

#[async_trait]
impl<T: Entity> CommandDispatcher<T::Command> for EntityHost<T> {
    async fn dispatch(&self, envelope: CommandEnvelope<T::Command>) -> Result<(), CommandError> {
        self.execute(envelope).await.map(|_| ())
    }
}

/// Runs one saga type against an event feed.
///
/// Dropping the manager stops its tasks and its timeout scheduler.
pub struct SagaManager<S: Saga> {
    saga_host: EntityHost<S>,
    scheduler: Option<Arc<TimeoutScheduler<S::Job>>>,
    tasks: Vec<JoinHandle<()>>,
}

impl<S: Saga> SagaManager<S> {
    /// Starts the manager.
    ///
    /// `feed` delivers the events sagas observe, usually an aggregate host's
    /// [`EntityHost::feed`]. Timeouts are only armed when the saga host's
    /// configuration has `use_saga_timeouts` set. Fails if the saga log's
    /// position cannot be read.
    pub async fn start<E, L, D>(
        feed: EventFeed<E>,
        saga_host: EntityHost<S>,
        locator: L,
        dispatcher: D,
    ) -> Result<Self, StoreError>
    where
        E: DomainEvent,
        S: Entity<Command = SagaInput<E, S::Job>>,
        L: SagaLocator<E> + 'static,
        D: CommandDispatcher<S::Outbound> + 'static,
    {
        let reactions = saga_host.feed().await?;
        let mut tasks = Vec::with_capacity(3);

        let scheduler = if saga_host.config().use_saga_timeouts {
            let (sink, fired) = mpsc::channel(64);
            tasks.push(tokio::spawn(forward_timeouts::<S, E>(saga_host.clone(), fired)));
            Some(Arc::new(TimeoutScheduler::spawn(sink)))
        } else {
            None
        };

        tasks.push(tokio::spawn(intake(feed, saga_host.clone(), locator)));
        tasks.push(tokio::spawn(react::<S, D>(
            reactions,
            dispatcher,
            scheduler.clone(),
        )));

        Ok(Self {
            saga_host,
            scheduler,
            tasks,
        })
    }

    /// The host running the saga instances.
    pub const fn saga_host(&self) -> &EntityHost<S> {
        &self.saga_host
    }

    /// Whether fired timeouts are delivered.
    pub const fn timeouts_enabled(&self) -> bool {
        self.scheduler.is_some()
    }

    /// Re-arms the pending timeouts recorded in `saga_id`'s state, returning
    /// how many were armed.
    pub async fn rearm(&self, saga_id: &Identity) -> Result<usize, CommandError> {
        let Some(scheduler) = &self.scheduler else {
            return Ok(0);
        };
        let state = self.saga_host.state(saga_id).await?;
        let mut armed = 0;
        for entry in S::pending_timeouts(&state) {
            match scheduler.schedule(entry).await {
                Ok(()) => armed += 1,
                Err(error) => warn!(saga = S::NAME, %error, "could not re-arm timeout"),
            }
        }
        Ok(armed)
    }
}

impl<S: Saga> Drop for SagaManager<S> {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

fn correlation_of<E>(event: &CommittedEvent<E>) -> Option<CorrelationId> {
    event
        .metadata()
        .correlation_id()
        .and_then(|value| CorrelationId::try_new(value).ok())
}

async fn intake<S, E, L>(mut feed: EventFeed<E>, saga_host: EntityHost<S>, locator: L)
where
    S: Saga + Entity<Command = SagaInput<E, <S as Saga>::Job>>,
    E: DomainEvent,
    L: SagaLocator<E>,
{
    while let Some(next) = feed.recv().await {
        let event = match next {
            Ok(event) => event,
            Err(error) => {
                warn!(saga = S::NAME, %error, "saga intake could not read the event log");
                tokio::time::sleep(FEED_RETRY_DELAY).await;
                continue;
            }
        };
        let Some(saga_id) = locator.locate_saga(&event) else {
            continue;
        };

        let mut envelope = CommandEnvelope::new(saga_id, SagaInput::Event(event.clone()))
            .with_causation_id(event.event_id().to_string());
        if let Some(correlation_id) = correlation_of(&event) {
            envelope = envelope.with_correlation_id(correlation_id);
        }
        if let Err(error) = saga_host.execute(envelope).await {
            warn!(saga = S::NAME, event = %event, %error, "saga did not accept event");
        }
    }
}

async fn react<S, D>(
    mut feed: EventFeed<S::Event>,
    dispatcher: D,
    scheduler: Option<Arc<TimeoutScheduler<S::Job>>>,
) where
    S: Saga,
    D: CommandDispatcher<S::Outbound>,
{
    while let Some(next) = feed.recv().await {
        let event = match next {
            Ok(event) => event,
            Err(error) => {
                warn!(saga = S::NAME, %error, "saga reactions could not read the saga log");
                tokio::time::sleep(FEED_RETRY_DELAY).await;
                continue;
            }
        };

        for action in S::react(&event) {
            match action {
                SagaAction::Dispatch(mut envelope) => {
                    if envelope.correlation_id.is_none() {
                        envelope.correlation_id = correlation_of(&event);
                    }
                    if envelope.causation_id.is_none() {
                        envelope.causation_id = Some(event.event_id().to_string());
                    }
                    let target = envelope.target.clone();
                    if let Err(error) = dispatcher.dispatch(envelope).await {
                        warn!(saga = S::NAME, target = %target, %error, "saga command failed");
                    }
                }
                SagaAction::ScheduleTimeout(entry) => match &scheduler {
                    Some(scheduler) => {
                        debug!(saga = S::NAME, job_id = %entry.job_id, fire_at = %entry.fire_at, "arming timeout");
                        if let Err(error) = scheduler.schedule(entry).await {
                            warn!(saga = S::NAME, %error, "could not arm timeout");
                        }
                    }
                    None => {
                        warn!(saga = S::NAME, job_id = %entry.job_id, "saga timeouts disabled; timeout dropped");
                    }
                },
                SagaAction::CancelTimeout(job_id) => {
                    if let Some(scheduler) = &scheduler {
                        if let Err(error) = scheduler.cancel(job_id).await {
                            warn!(saga = S::NAME, %error, "could not cancel timeout");
                        }
                    }
                }
            }
        }
    }
}

async fn forward_timeouts<S, E>(saga_host: EntityHost<S>, mut fired: mpsc::Receiver<Schedule<S::Job>>)
where
    S: Saga + Entity<Command = SagaInput<E, <S as Saga>::Job>>,
    E: DomainEvent,
{
    while let Some(entry) = fired.recv().await {
        let saga_id = entry.saga_id.clone();
        let job_id = entry.job_id.clone();
        let envelope = CommandEnvelope::new(saga_id, SagaInput::Timeout(entry))
            .with_causation_id(job_id.to_string());
        if let Err(error) = saga_host.execute(envelope).await {
            warn!(saga = S::NAME, job_id = %job_id, %error, "saga did not accept timeout");
        }
    }
}
