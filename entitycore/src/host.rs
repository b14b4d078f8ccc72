//! Per-identity execution contexts.
//!
//! [`EntityHost`] keeps at most one live task per entity identity. Each task
//! owns an [`EntityStateMachine`] and processes messages from a bounded
//! queue one at a time, so commands for one identity are strictly serialized
//! while different identities run in parallel.
//!
//! Tasks are spawned on first use. With an idle timeout configured, a task
//! that receives nothing for that long passivates: it stops accepting
//! messages, finishes what is already queued and exits, dropping its state.
//! The next message for the identity spawns a fresh task that recovers from
//! the log, but only once the previous task has exited, so an identity never
//! has two writers.

use crate::command::{CommandEnvelope, CommandOutcome, CommandResult};
use crate::config::RuntimeConfig;
use crate::entity::{Entity, Lifecycle};
use crate::errors::{CommandError, RecoveryError, RegistryError, StoreError};
use crate::event::CommittedEvent;
use crate::feed::EventFeed;
use crate::registry::{registry_for, DispatchRegistry};
use crate::state_machine::EntityStateMachine;
use crate::store::{EventLog, SnapshotStore};
use crate::types::Identity;
use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, info, warn};

type ExecuteReply<T> = oneshot::Sender<Result<CommandOutcome<<T as Entity>::Event>, CommandError>>;

/// Messages sent from the host to an entity task.
enum EntityMessage<T: Entity> {
    Execute {
        envelope: CommandEnvelope<T::Command>,
        reply: ExecuteReply<T>,
    },
    Status {
        reply: oneshot::Sender<Result<EntityStatus<T::State>, CommandError>>,
    },
    Shutdown,
}

/// Point-in-time view of one entity instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityStatus<S> {
    /// The folded state
    pub state: S,
    /// Last applied sequence number
    pub current_sequence_number: u64,
    /// Lifecycle phase when the status was taken
    pub lifecycle: Lifecycle,
}

/// Handle to an entity task.
///
/// A handle outlives its task: once the task stops accepting messages the
/// handle is no longer alive, and once the task has exited it has stopped.
pub struct EntityHandle<T: Entity> {
    sender: mpsc::Sender<EntityMessage<T>>,
    // Never written; the task drops the sender when it exits.
    running: watch::Receiver<()>,
}

impl<T: Entity> EntityHandle<T> {
    /// Whether the task still accepts messages.
    pub fn is_alive(&self) -> bool {
        !self.sender.is_closed()
    }

    /// Whether the task has exited.
    pub fn has_stopped(&self) -> bool {
        self.running.has_changed().is_err()
    }

    /// Waits until the task has exited.
    pub async fn stopped(&self) {
        let mut running = self.running.clone();
        while running.changed().await.is_ok() {}
    }

    fn same_task(&self, other: &Self) -> bool {
        self.sender.same_channel(&other.sender)
    }
}

impl<T: Entity> Clone for EntityHandle<T> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            running: self.running.clone(),
        }
    }
}

struct HostInner<T: Entity> {
    registry: Arc<DispatchRegistry<T>>,
    log: Arc<dyn EventLog<T::Event>>,
    snapshots: Arc<dyn SnapshotStore>,
    config: RuntimeConfig,
    handles: Mutex<HashMap<Identity, EntityHandle<T>>>,
    events: broadcast::Sender<CommittedEvent<T::Event>>,
}

/// Routes commands to one task per entity identity.
///
/// Cloning is cheap; clones share the same tasks.
pub struct EntityHost<T: Entity> {
    inner: Arc<HostInner<T>>,
}

impl<T: Entity> Clone for EntityHost<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Entity> EntityHost<T> {
    /// Creates a host, building (or fetching) the entity type's registry.
    pub fn new(
        log: Arc<dyn EventLog<T::Event>>,
        snapshots: Arc<dyn SnapshotStore>,
        config: RuntimeConfig,
    ) -> Result<Self, RegistryError> {
        let registry = registry_for::<T>()?;
        let (events, _) = broadcast::channel(config.event_buffer_capacity.into());
        Ok(Self {
            inner: Arc::new(HostInner {
                registry,
                log,
                snapshots,
                config,
                handles: Mutex::new(HashMap::new()),
                events,
            }),
        })
    }

    /// The host's configuration.
    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    /// Subscribes to every event committed through this host, in commit order
    /// per identity.
    pub fn subscribe(&self) -> broadcast::Receiver<CommittedEvent<T::Event>> {
        self.inner.events.subscribe()
    }

    /// A lossless feed of every event committed through this host from now
    /// on, read back from the host's log.
    pub async fn feed(&self) -> Result<EventFeed<T::Event>, StoreError> {
        let signal = self.subscribe();
        let offset = self.inner.log.head().await?;
        Ok(EventFeed::new(
            Arc::clone(&self.inner.log),
            T::NAME,
            signal,
            offset,
        ))
    }

    /// Handles `envelope` in the target identity's task.
    pub async fn execute(
        &self,
        envelope: CommandEnvelope<T::Command>,
    ) -> Result<CommandOutcome<T::Event>, CommandError> {
        let identity = envelope.target.clone();
        let (reply, response) = oneshot::channel();
        self.send(&identity, EntityMessage::Execute { envelope, reply })
            .await?;
        response
            .await
            .map_err(|_| CommandError::ExecutionContextGone { identity })?
    }

    /// Handles `envelope` and reduces the answer to a [`CommandResult`].
    pub async fn ask(&self, envelope: CommandEnvelope<T::Command>) -> CommandResult {
        let command_id = envelope.command_id.clone();
        let outcome = self.execute(envelope).await;
        CommandResult::from_outcome(command_id, &outcome)
    }

    /// Current status of `identity`, recovering it if needed.
    pub async fn status(&self, identity: &Identity) -> Result<EntityStatus<T::State>, CommandError> {
        let (reply, response) = oneshot::channel();
        self.send(identity, EntityMessage::Status { reply }).await?;
        response
            .await
            .map_err(|_| CommandError::ExecutionContextGone {
                identity: identity.clone(),
            })?
    }

    /// Current state of `identity`, recovering it if needed.
    pub async fn state(&self, identity: &Identity) -> Result<T::State, CommandError> {
        self.status(identity).await.map(|status| status.state)
    }

    /// Stops the task for `identity`, if any, and waits for it to exit.
    /// Messages accepted before the task stopped are still processed.
    pub async fn passivate(&self, identity: &Identity) {
        let handle = self
            .inner
            .handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(identity)
            .cloned();
        let Some(handle) = handle else {
            return;
        };
        // A closed mailbox means the task is already stopping on its own.
        let _ = handle.sender.send(EntityMessage::Shutdown).await;
        handle.stopped().await;

        let mut handles = self
            .inner
            .handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if handles
            .get(identity)
            .is_some_and(|current| current.same_task(&handle))
        {
            handles.remove(identity);
        }
        debug!(entity = T::NAME, identity = %identity, "passivated");
    }

    /// Stops every task whose identity matches `predicate`.
    pub async fn passivate_where<P>(&self, predicate: P)
    where
        P: Fn(&Identity) -> bool,
    {
        let identities: Vec<Identity> = self
            .inner
            .handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .filter(|identity| predicate(identity))
            .cloned()
            .collect();
        for identity in identities {
            self.passivate(&identity).await;
        }
    }

    /// Number of identities with a live task.
    pub fn active_count(&self) -> usize {
        self.inner
            .handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|handle| handle.is_alive())
            .count()
    }

    /// Whether `identity` currently has a live task.
    pub fn is_active(&self, identity: &Identity) -> bool {
        self.inner
            .handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(identity)
            .is_some_and(EntityHandle::is_alive)
    }

    // A task that started stopping between lookup and send hands the message
    // back; it is resent to the task that replaces it.
    async fn send(
        &self,
        identity: &Identity,
        message: EntityMessage<T>,
    ) -> Result<(), CommandError> {
        let mut message = message;
        for _ in 0..SEND_ATTEMPTS {
            let handle = self.handle_for(identity).await;
            match handle.sender.send(message).await {
                Ok(()) => return Ok(()),
                Err(mpsc::error::SendError(returned)) => message = returned,
            }
        }
        Err(CommandError::ExecutionContextGone {
            identity: identity.clone(),
        })
    }

    // Returns the live task for `identity`. A stopping task is waited for
    // before its replacement is spawned.
    async fn handle_for(&self, identity: &Identity) -> EntityHandle<T> {
        loop {
            let stopping = {
                let mut handles = self
                    .inner
                    .handles
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                match handles.get(identity).cloned() {
                    Some(handle) if handle.is_alive() => return handle,
                    Some(handle) if !handle.has_stopped() => handle,
                    _ => {
                        handles.retain(|_, handle| !handle.has_stopped());
                        let handle = self.spawn(identity);
                        handles.insert(identity.clone(), handle.clone());
                        return handle;
                    }
                }
            };
            debug!(
                entity = T::NAME,
                identity = %identity,
                "waiting for the previous entity task to stop"
            );
            stopping.stopped().await;
        }
    }

    fn spawn(&self, identity: &Identity) -> EntityHandle<T> {
        let (sender, receiver) = mpsc::channel(self.inner.config.mailbox_capacity.into());
        let (running_tx, running) = watch::channel(());
        let machine = EntityStateMachine::new(
            identity.clone(),
            Arc::clone(&self.inner.registry),
            Arc::clone(&self.inner.log),
            Arc::clone(&self.inner.snapshots),
            self.inner.config.snapshot_every,
        );
        tokio::spawn(run_entity(
            machine,
            receiver,
            self.inner.events.clone(),
            self.inner.config.idle_timeout,
            running_tx,
        ));
        debug!(entity = T::NAME, identity = %identity, "spawned entity task");

        EntityHandle { sender, running }
    }
}

const SEND_ATTEMPTS: usize = 3;

// `running` is dropped on exit, which is what `EntityHandle::stopped` waits
// for.
async fn run_entity<T: Entity>(
    mut machine: EntityStateMachine<T>,
    mut receiver: mpsc::Receiver<EntityMessage<T>>,
    events: broadcast::Sender<CommittedEvent<T::Event>>,
    idle_timeout: Option<Duration>,
    running: watch::Sender<()>,
) {
    loop {
        let message = match idle_timeout {
            Some(idle) => match tokio::time::timeout(idle, receiver.recv()).await {
                Ok(message) => message,
                Err(_elapsed) => {
                    info!(
                        entity = T::NAME,
                        identity = %machine.identity(),
                        "entity idle, passivating"
                    );
                    break;
                }
            },
            None => receiver.recv().await,
        };

        let Some(message) = message else {
            drop(running);
            return;
        };
        if handle_message(&mut machine, message, &events)
            .await
            .is_break()
        {
            break;
        }
    }

    // Refuse new messages but answer every one already accepted.
    receiver.close();
    while let Some(message) = receiver.recv().await {
        let _ = handle_message(&mut machine, message, &events).await;
    }
    debug!(entity = T::NAME, identity = %machine.identity(), "entity task stopped");
    drop(running);
}

async fn handle_message<T: Entity>(
    machine: &mut EntityStateMachine<T>,
    message: EntityMessage<T>,
    events: &broadcast::Sender<CommittedEvent<T::Event>>,
) -> ControlFlow<()> {
    match message {
        EntityMessage::Execute { envelope, reply } => {
            let result = machine.handle(envelope).await;
            if let Ok(outcome) = &result {
                for event in &outcome.events {
                    // No subscribers is fine.
                    let _ = events.send(event.clone());
                }
            }
            let fatal = is_fatal(&result);
            let _ = reply.send(result);
            fatal
        }
        EntityMessage::Status { reply } => {
            let result = match machine.ensure_recovered().await {
                Ok(()) => Ok(EntityStatus {
                    state: machine.state().clone(),
                    current_sequence_number: machine.current_sequence_number(),
                    lifecycle: machine.lifecycle(),
                }),
                Err(error) => Err(CommandError::from(error)),
            };
            let fatal = is_fatal(&result);
            let _ = reply.send(result);
            fatal
        }
        EntityMessage::Shutdown => ControlFlow::Break(()),
    }
}

// The entity cannot interpret its own history; keeping the task would only
// fail every later message the same way.
fn is_fatal<V>(result: &Result<V, CommandError>) -> ControlFlow<()> {
    match result {
        Err(CommandError::Recovery(RecoveryError::Configuration(error))) => {
            warn!(%error, "stopping entity after configuration error");
            ControlFlow::Break(())
        }
        _ => ControlFlow::Continue(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Rejection;
    use crate::entity::NoSnapshot;
    use crate::event::{DomainEvent, TypeTag};
    use crate::memory::{InMemoryEventLog, InMemorySnapshotStore};
    use crate::registry::RegistryBuilder;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Cmd {
        Add(u32),
        Fail,
    }

    impl TypeTag for Cmd {
        fn type_tag(&self) -> &'static str {
            match self {
                Self::Add(_) => "Add",
                Self::Fail => "Fail",
            }
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Ev {
        Added(u32),
    }

    impl TypeTag for Ev {
        fn type_tag(&self) -> &'static str {
            "Added"
        }
    }

    impl DomainEvent for Ev {}

    struct Tally;

    impl Entity for Tally {
        const NAME: &'static str = "Tally";
        type State = u32;
        type Command = Cmd;
        type Event = Ev;
        type Snapshot = NoSnapshot;

        fn register(
            registry: RegistryBuilder<Self>,
        ) -> Result<RegistryBuilder<Self>, RegistryError> {
            registry
                .command(
                    "Add",
                    |c| match c {
                        Cmd::Add(n) => Some(n),
                        Cmd::Fail => None,
                    },
                    |_, n| Ok(vec![Ev::Added(*n)]),
                )?
                .command(
                    "Fail",
                    |c| match c {
                        Cmd::Fail => Some(&()),
                        Cmd::Add(_) => None,
                    },
                    |_, ()| Err(Rejection::new("always fails")),
                )?
                .event(
                    "Added",
                    |e| match e {
                        Ev::Added(n) => Some(n),
                    },
                    |state, n| *state += n,
                )
        }
    }

    fn host(config: RuntimeConfig) -> EntityHost<Tally> {
        EntityHost::new(
            Arc::new(InMemoryEventLog::<Ev>::new()),
            Arc::new(InMemorySnapshotStore::new()),
            config,
        )
        .unwrap()
    }

    fn id(value: &str) -> Identity {
        Identity::try_new(value).unwrap()
    }

    #[tokio::test]
    async fn commands_for_one_identity_are_serialized() {
        let host = host(RuntimeConfig::default());
        let target = id("tally-1");

        let tasks: Vec<_> = (0..20)
            .map(|_| {
                let host = host.clone();
                let target = target.clone();
                tokio::spawn(async move {
                    host.execute(CommandEnvelope::new(target, Cmd::Add(1))).await
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let status = host.status(&target).await.unwrap();
        assert_eq!(status.state, 20);
        assert_eq!(status.current_sequence_number, 20);
        assert_eq!(status.lifecycle, Lifecycle::Ready);
        assert_eq!(host.active_count(), 1);
    }

    #[tokio::test]
    async fn identities_get_separate_tasks() {
        let host = host(RuntimeConfig::default());
        host.execute(CommandEnvelope::new(id("tally-a"), Cmd::Add(1)))
            .await
            .unwrap();
        host.execute(CommandEnvelope::new(id("tally-b"), Cmd::Add(2)))
            .await
            .unwrap();

        assert_eq!(host.state(&id("tally-a")).await.unwrap(), 1);
        assert_eq!(host.state(&id("tally-b")).await.unwrap(), 2);
        assert_eq!(host.active_count(), 2);
    }

    #[tokio::test]
    async fn ask_reports_typed_results() {
        let host = host(RuntimeConfig::default());
        let ok = host
            .ask(CommandEnvelope::new(id("tally-1"), Cmd::Add(1)))
            .await;
        assert!(ok.is_success());

        let failed = host
            .ask(CommandEnvelope::new(id("tally-1"), Cmd::Fail))
            .await;
        assert_eq!(failed.reasons(), ["always fails".to_string()]);
    }

    #[tokio::test]
    async fn committed_events_are_published() {
        let host = host(RuntimeConfig::default());
        let mut feed = host.subscribe();

        host.execute(CommandEnvelope::new(id("tally-1"), Cmd::Add(3)))
            .await
            .unwrap();

        let event = feed.recv().await.unwrap();
        assert_eq!(event.event(), &Ev::Added(3));
        assert_eq!(event.sequence_number().value(), 1);
    }

    #[tokio::test]
    async fn idle_entities_passivate_and_recover() {
        let config = RuntimeConfig::default().with_idle_timeout(Duration::from_millis(20));
        let host = host(config);
        let target = id("tally-1");

        host.execute(CommandEnvelope::new(target.clone(), Cmd::Add(4)))
            .await
            .unwrap();
        assert!(host.is_active(&target));

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(!host.is_active(&target));

        let outcome = host
            .execute(CommandEnvelope::new(target.clone(), Cmd::Add(1)))
            .await
            .unwrap();
        assert_eq!(outcome.events[0].sequence_number().value(), 2);
        assert_eq!(host.state(&target).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn explicit_passivation_keeps_history() {
        let host = host(RuntimeConfig::default());
        let target = id("tally-1");
        host.execute(CommandEnvelope::new(target.clone(), Cmd::Add(2)))
            .await
            .unwrap();

        host.passivate(&target).await;
        assert!(!host.is_active(&target));
        assert_eq!(host.state(&target).await.unwrap(), 2);
    }
}
