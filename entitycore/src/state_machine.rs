//! The per-identity entity state machine.
//!
//! [`EntityStateMachine`] owns one entity instance: its folded state, its
//! position in the history and its lifecycle. It rebuilds itself from the
//! latest snapshot plus later events, and turns commands into committed
//! batches:
//!
//! 1. resolve the command's handler (a miss is an unsupported command),
//! 2. run it against the current state (a rejection mutates nothing),
//! 3. number, stamp and apply each event to a staged copy of the state,
//! 4. append the batch; only once the log confirms does the staged state
//!    replace the current one.
//!
//! A failed append therefore leaves nothing of the batch behind. A sequence
//! conflict also reloads the state from the log so the next command sees
//! what the log holds.

use crate::command::{CommandEnvelope, CommandOutcome};
use crate::config::SnapshotInterval;
use crate::entity::{Entity, Lifecycle};
use crate::errors::{CommandError, RecoveryError, StoreError};
use crate::event::{CommittedEvent, DomainEvent, TypeTag};
use crate::metadata::{format_timestamp, keys, Metadata};
use crate::registry::DispatchRegistry;
use crate::store::{EventLog, SnapshotStore};
use crate::types::{CorrelationId, EventId, Identity, SequenceNumber};
use crate::upcast::UpcastChain;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

/// One live entity instance.
pub struct EntityStateMachine<T: Entity> {
    identity: Identity,
    state: T::State,
    current_sequence_number: u64,
    lifecycle: Lifecycle,
    events_since_snapshot: u64,
    registry: Arc<DispatchRegistry<T>>,
    log: Arc<dyn EventLog<T::Event>>,
    snapshots: Arc<dyn SnapshotStore>,
    snapshot_every: Option<SnapshotInterval>,
}

impl<T: Entity> EntityStateMachine<T> {
    /// Creates an uninitialized instance for `identity`.
    pub fn new(
        identity: Identity,
        registry: Arc<DispatchRegistry<T>>,
        log: Arc<dyn EventLog<T::Event>>,
        snapshots: Arc<dyn SnapshotStore>,
        snapshot_every: Option<SnapshotInterval>,
    ) -> Self {
        Self {
            identity,
            state: T::State::default(),
            current_sequence_number: 0,
            lifecycle: Lifecycle::Uninitialized,
            events_since_snapshot: 0,
            registry,
            log,
            snapshots,
            snapshot_every,
        }
    }

    /// The identity this instance serves.
    pub const fn identity(&self) -> &Identity {
        &self.identity
    }

    /// The folded state.
    pub const fn state(&self) -> &T::State {
        &self.state
    }

    /// Last applied sequence number; 0 for an empty history.
    pub const fn current_sequence_number(&self) -> u64 {
        self.current_sequence_number
    }

    /// Where the instance is in its lifecycle.
    pub const fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    /// Rebuilds the state from the latest snapshot and the events after it.
    ///
    /// Replayed events pass through the upcast chain before being applied.
    /// On failure the instance is left uninitialized with a default state.
    #[instrument(skip(self), fields(entity = T::NAME, identity = %self.identity))]
    pub async fn recover(&mut self) -> Result<(), RecoveryError> {
        self.lifecycle = Lifecycle::Recovering;
        self.state = T::State::default();
        self.current_sequence_number = 0;
        self.events_since_snapshot = 0;

        match self.replay().await {
            Ok(replayed) => {
                self.lifecycle = Lifecycle::Ready;
                debug!(
                    replayed,
                    sequence_number = self.current_sequence_number,
                    "recovered"
                );
                Ok(())
            }
            Err(error) => {
                self.state = T::State::default();
                self.current_sequence_number = 0;
                self.lifecycle = Lifecycle::Uninitialized;
                warn!(%error, "recovery failed");
                Err(error)
            }
        }
    }

    async fn replay(&mut self) -> Result<u64, RecoveryError> {
        if let Some(record) = self.snapshots.load_latest_snapshot(&self.identity).await? {
            let snapshot: T::Snapshot = serde_json::from_slice(&record.blob)
                .map_err(|e| StoreError::Serialization(e.to_string()))?;
            self.state = self.registry.hydrate(snapshot)?;
            self.current_sequence_number = record.sequence_number.value();
        }

        let log = Arc::clone(&self.log);
        let registry = Arc::clone(&self.registry);
        let chain = UpcastChain::new(&registry);
        let identity = self.identity.clone();
        let Ok(from) = SequenceNumber::after(self.current_sequence_number) else {
            // Nothing can follow the largest sequence number.
            return Ok(0);
        };
        let mut events = log.read(&identity, from);
        let mut replayed = 0;

        while let Some(event) = events.next().await {
            let event = chain.upcast(event?)?;
            let expected = self.current_sequence_number.checked_add(1);
            let found = event.sequence_number().value();
            if expected != Some(found) {
                return Err(RecoveryError::SequenceGap {
                    identity: self.identity.clone(),
                    expected: expected.unwrap_or(u64::MAX),
                    found,
                });
            }
            registry.apply(&mut self.state, event.event())?;
            self.current_sequence_number = found;
            replayed += 1;
        }
        Ok(replayed)
    }

    /// Recovers if the instance has not been recovered yet.
    pub async fn ensure_recovered(&mut self) -> Result<(), RecoveryError> {
        if self.lifecycle == Lifecycle::Uninitialized {
            self.recover().await?;
        }
        Ok(())
    }

    /// Handles one command, returning the committed batch.
    #[instrument(
        skip(self, envelope),
        fields(
            entity = T::NAME,
            identity = %self.identity,
            command = envelope.payload.type_tag(),
            command_id = %envelope.command_id
        )
    )]
    pub async fn handle(
        &mut self,
        envelope: CommandEnvelope<T::Command>,
    ) -> Result<CommandOutcome<T::Event>, CommandError> {
        self.ensure_recovered().await?;
        self.lifecycle = Lifecycle::Processing;
        let result = self.process(envelope).await;
        if self.lifecycle == Lifecycle::Processing {
            self.lifecycle = Lifecycle::Ready;
        }
        if let Err(error) = &result {
            debug!(%error, "command did not commit");
        }
        result
    }

    async fn process(
        &mut self,
        envelope: CommandEnvelope<T::Command>,
    ) -> Result<CommandOutcome<T::Event>, CommandError> {
        let registry = Arc::clone(&self.registry);
        let handler = registry.resolve_command(&envelope.payload)?;
        let events = handler(&self.state, &envelope.payload)?;

        let correlation_id = envelope.correlation_id.clone().unwrap_or_default();
        let committed_at = Utc::now();
        let mut staged = self.state.clone();
        let mut sequence_number = self.current_sequence_number;
        let mut batch = Vec::with_capacity(events.len());

        for event in events {
            let sequence = SequenceNumber::after(sequence_number)?;
            sequence_number = sequence.value();
            let metadata = self.stamp(&envelope, &correlation_id, &event, sequence, committed_at)?;
            registry.apply(&mut staged, &event)?;
            batch.push(CommittedEvent::try_new(
                self.identity.clone(),
                event,
                metadata,
                committed_at,
                sequence_number,
            )?);
        }

        let outcome = |events| CommandOutcome {
            command_id: envelope.command_id.clone(),
            correlation_id: correlation_id.clone(),
            events,
        };

        if batch.is_empty() {
            return Ok(outcome(batch));
        }

        if let Err(error) = self.log.append(&self.identity, &batch).await {
            let error = CommandError::from(error);
            if matches!(error, CommandError::ConcurrencyConflict { .. }) {
                warn!(%error, "append conflicted; reloading state");
                if self.recover().await.is_err() {
                    debug!("reload failed; next command retries recovery");
                }
            }
            return Err(error);
        }

        self.state = staged;
        self.current_sequence_number = sequence_number;
        self.events_since_snapshot = self
            .events_since_snapshot
            .saturating_add(u64::try_from(batch.len()).unwrap_or(u64::MAX));
        debug!(
            committed = batch.len(),
            sequence_number, "committed events"
        );
        self.maybe_snapshot().await;

        Ok(outcome(batch))
    }

    fn stamp(
        &self,
        envelope: &CommandEnvelope<T::Command>,
        correlation_id: &CorrelationId,
        event: &T::Event,
        sequence: SequenceNumber,
        now: DateTime<Utc>,
    ) -> Result<Metadata, CommandError> {
        let causation_id = envelope
            .causation_id
            .clone()
            .unwrap_or_else(|| envelope.command_id.to_string());

        Ok(envelope.metadata.clone_with([
            (keys::EVENT_NAME, event.type_tag().to_string()),
            (keys::EVENT_VERSION, event.event_version().to_string()),
            (keys::TIMESTAMP, format_timestamp(&now)),
            (keys::TIMESTAMP_EPOCH, now.timestamp().to_string()),
            (keys::AGGREGATE_SEQUENCE_NUMBER, sequence.to_string()),
            (keys::AGGREGATE_ID, self.identity.to_string()),
            (keys::AGGREGATE_NAME, T::NAME.to_string()),
            (
                keys::EVENT_ID,
                EventId::deterministic(&self.identity, sequence).to_string(),
            ),
            (keys::SOURCE_ID, envelope.command_id.to_string()),
            (keys::CORRELATION_ID, correlation_id.to_string()),
            (keys::CAUSATION_ID, causation_id),
        ])?)
    }

    async fn maybe_snapshot(&mut self) {
        let Some(every) = self.snapshot_every else {
            return;
        };
        if self.events_since_snapshot < u64::from(every) {
            return;
        }
        let Some(snapshot) = T::snapshot(&self.state) else {
            return;
        };
        let Ok(sequence_number) = SequenceNumber::try_new(self.current_sequence_number) else {
            return;
        };

        let saved = match serde_json::to_vec(&snapshot) {
            Ok(blob) => {
                self.snapshots
                    .save_snapshot(&self.identity, sequence_number, blob)
                    .await
            }
            Err(e) => Err(StoreError::Serialization(e.to_string())),
        };
        match saved {
            Ok(()) => {
                self.events_since_snapshot = 0;
                debug!(%sequence_number, "saved snapshot");
            }
            Err(error) => warn!(%error, "snapshot failed; continuing without it"),
        }
    }
}

impl<T: Entity> std::fmt::Debug for EntityStateMachine<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityStateMachine")
            .field("entity", &T::NAME)
            .field("identity", &self.identity)
            .field("current_sequence_number", &self.current_sequence_number)
            .field("lifecycle", &self.lifecycle)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Rejection;
    use crate::errors::RegistryError;
    use crate::memory::{InMemoryEventLog, InMemorySnapshotStore};
    use crate::registry::RegistryBuilder;
    use crate::specification::{Created, EntityIsNew, Specification};
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Cmd {
        Create,
        Add(u32),
        Nothing,
        Unknown,
    }

    impl TypeTag for Cmd {
        fn type_tag(&self) -> &'static str {
            match self {
                Self::Create => "Create",
                Self::Add(_) => "Add",
                Self::Nothing => "Nothing",
                Self::Unknown => "Unknown",
            }
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Ev {
        Created,
        Added(u32),
        AddedV1(u16),
    }

    impl TypeTag for Ev {
        fn type_tag(&self) -> &'static str {
            match self {
                Self::Created => "Created",
                Self::Added(_) => "Added",
                Self::AddedV1(_) => "AddedV1",
            }
        }
    }

    impl DomainEvent for Ev {
        fn event_version(&self) -> u32 {
            match self {
                Self::AddedV1(_) => 1,
                _ => 2,
            }
        }
    }

    #[derive(Debug, Clone, Default, PartialEq, Eq)]
    struct Total {
        created: bool,
        total: u32,
    }

    impl Created for Total {
        fn is_created(&self) -> bool {
            self.created
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    enum Snap {
        Total(u32),
    }

    impl TypeTag for Snap {
        fn type_tag(&self) -> &'static str {
            "Total"
        }
    }

    struct Counter;

    impl Entity for Counter {
        const NAME: &'static str = "Counter";
        type State = Total;
        type Command = Cmd;
        type Event = Ev;
        type Snapshot = Snap;

        fn register(
            registry: RegistryBuilder<Self>,
        ) -> Result<RegistryBuilder<Self>, RegistryError> {
            registry
                .command(
                    "Create",
                    |c| match c {
                        Cmd::Create => Some(&()),
                        _ => None,
                    },
                    |state, ()| {
                        EntityIsNew.check(state)?;
                        Ok(vec![Ev::Created])
                    },
                )?
                .command(
                    "Add",
                    |c| match c {
                        Cmd::Add(n) => Some(n),
                        _ => None,
                    },
                    |state: &Total, n: &u32| {
                        if !state.created {
                            return Err(Rejection::new("not created"));
                        }
                        Ok(vec![Ev::Added(*n), Ev::Added(*n)])
                    },
                )?
                .command(
                    "Nothing",
                    |c| match c {
                        Cmd::Nothing => Some(&()),
                        _ => None,
                    },
                    |_, ()| Ok(Vec::new()),
                )?
                .event(
                    "Created",
                    |e| match e {
                        Ev::Created => Some(&()),
                        _ => None,
                    },
                    |state, ()| state.created = true,
                )?
                .event(
                    "Added",
                    |e| match e {
                        Ev::Added(n) => Some(n),
                        _ => None,
                    },
                    |state, n| state.total += n,
                )?
                .upcast("AddedV1", |e| match e {
                    Ev::AddedV1(n) => Ev::Added(u32::from(n)),
                    other => other,
                })?
                .snapshot("Total", |Snap::Total(total)| Total {
                    created: true,
                    total,
                })
        }

        fn snapshot(state: &Total) -> Option<Snap> {
            Some(Snap::Total(state.total))
        }
    }

    struct Fixture {
        log: Arc<InMemoryEventLog<Ev>>,
        snapshots: Arc<InMemorySnapshotStore>,
        identity: Identity,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                log: Arc::new(InMemoryEventLog::new()),
                snapshots: Arc::new(InMemorySnapshotStore::new()),
                identity: Identity::try_new("counter-1").unwrap(),
            }
        }

        fn machine(&self, snapshot_every: Option<u64>) -> EntityStateMachine<Counter> {
            EntityStateMachine::new(
                self.identity.clone(),
                Arc::new(DispatchRegistry::build().unwrap()),
                self.log.clone(),
                self.snapshots.clone(),
                snapshot_every.map(|n| SnapshotInterval::try_new(n).unwrap()),
            )
        }

        fn envelope(&self, command: Cmd) -> CommandEnvelope<Cmd> {
            CommandEnvelope::new(self.identity.clone(), command)
        }
    }

    #[tokio::test]
    async fn commands_produce_gap_free_sequence_numbers() {
        let fixture = Fixture::new();
        let mut machine = fixture.machine(None);

        machine.handle(fixture.envelope(Cmd::Create)).await.unwrap();
        let outcome = machine.handle(fixture.envelope(Cmd::Add(2))).await.unwrap();

        let sequence: Vec<u64> = outcome
            .events
            .iter()
            .map(|e| e.sequence_number().value())
            .collect();
        assert_eq!(sequence, vec![2, 3]);
        assert_eq!(machine.current_sequence_number(), 3);
        assert_eq!(machine.state().total, 4);
        assert_eq!(machine.lifecycle(), Lifecycle::Ready);
    }

    #[tokio::test]
    async fn stamped_metadata_carries_reserved_keys() {
        let fixture = Fixture::new();
        let mut machine = fixture.machine(None);
        let correlation_id = CorrelationId::new();

        let envelope = fixture
            .envelope(Cmd::Create)
            .with_correlation_id(correlation_id.clone());
        let command_id = envelope.command_id.clone();
        let outcome = machine.handle(envelope).await.unwrap();
        let metadata = outcome.events[0].metadata();

        assert_eq!(metadata.event_name().unwrap(), "Created");
        assert_eq!(metadata.event_version().unwrap(), 2);
        assert_eq!(metadata.aggregate_name().unwrap(), "Counter");
        assert_eq!(metadata.aggregate_id().unwrap(), "counter-1");
        assert_eq!(metadata.aggregate_sequence_number().unwrap().value(), 1);
        assert_eq!(
            metadata.correlation_id(),
            Some(correlation_id.to_string().as_str())
        );
        assert_eq!(metadata.source_id(), Some(command_id.to_string().as_str()));
        assert_eq!(metadata.event_id().unwrap(), outcome.events[0].event_id());
        assert_eq!(outcome.correlation_id, correlation_id);
    }

    #[tokio::test]
    async fn reserved_keys_in_extra_metadata_are_rejected() {
        let fixture = Fixture::new();
        let mut machine = fixture.machine(None);
        let envelope = fixture.envelope(Cmd::Create).with_metadata(
            Metadata::try_from_pairs([(keys::AGGREGATE_ID, "spoofed")]).unwrap(),
        );

        let error = machine.handle(envelope).await.unwrap_err();
        assert!(matches!(error, CommandError::Validation(_)));
        assert_eq!(fixture.log.stream_len(&fixture.identity), 0);
    }

    #[tokio::test]
    async fn rejections_and_unsupported_commands_change_nothing() {
        let fixture = Fixture::new();
        let mut machine = fixture.machine(None);
        machine.handle(fixture.envelope(Cmd::Create)).await.unwrap();

        let duplicate = machine.handle(fixture.envelope(Cmd::Create)).await.unwrap_err();
        assert_eq!(duplicate.reasons(), vec!["Aggregate already exists.".to_string()]);

        let unsupported = machine.handle(fixture.envelope(Cmd::Unknown)).await.unwrap_err();
        assert!(matches!(unsupported, CommandError::Unsupported { .. }));

        assert_eq!(machine.current_sequence_number(), 1);
        assert_eq!(machine.lifecycle(), Lifecycle::Ready);
    }

    #[tokio::test]
    async fn empty_batches_succeed_without_appending() {
        let fixture = Fixture::new();
        let mut machine = fixture.machine(None);
        let outcome = machine.handle(fixture.envelope(Cmd::Nothing)).await.unwrap();
        assert!(outcome.events.is_empty());
        assert_eq!(machine.current_sequence_number(), 0);
    }

    #[tokio::test]
    async fn failed_append_discards_the_whole_batch() {
        let fixture = Fixture::new();
        let mut machine = fixture.machine(None);
        machine.handle(fixture.envelope(Cmd::Create)).await.unwrap();

        fixture.log.fail_next_appends(1);
        let error = machine.handle(fixture.envelope(Cmd::Add(5))).await.unwrap_err();
        assert!(matches!(error, CommandError::Store(_)));
        assert_eq!(machine.state().total, 0);
        assert_eq!(machine.current_sequence_number(), 1);

        let outcome = machine.handle(fixture.envelope(Cmd::Add(1))).await.unwrap();
        assert_eq!(outcome.events[0].sequence_number().value(), 2);
        assert_eq!(machine.state().total, 2);
    }

    #[tokio::test]
    async fn conflicting_writer_triggers_reload() {
        let fixture = Fixture::new();
        let mut first = fixture.machine(None);
        let mut second = fixture.machine(None);

        first.handle(fixture.envelope(Cmd::Create)).await.unwrap();
        second.ensure_recovered().await.unwrap();
        first.handle(fixture.envelope(Cmd::Add(1))).await.unwrap();

        let error = second.handle(fixture.envelope(Cmd::Add(1))).await.unwrap_err();
        assert!(error.is_retryable());
        assert_eq!(second.current_sequence_number(), 3);
        assert_eq!(second.state().total, 2);

        second.handle(fixture.envelope(Cmd::Add(1))).await.unwrap();
        assert_eq!(second.current_sequence_number(), 5);
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn conflict_is_logged_with_the_entity_span() {
        let fixture = Fixture::new();
        let mut first = fixture.machine(None);
        let mut second = fixture.machine(None);

        second.ensure_recovered().await.unwrap();
        first.handle(fixture.envelope(Cmd::Create)).await.unwrap();
        let _ = second.handle(fixture.envelope(Cmd::Create)).await;

        assert!(logs_contain("append conflicted; reloading state"));
        assert!(logs_contain("counter-1"));
    }

    #[tokio::test]
    async fn recovery_replays_history_through_upcasters() {
        let fixture = Fixture::new();
        let metadata = Metadata::try_from_pairs([(keys::AGGREGATE_NAME, "Counter")]).unwrap();
        let history = [Ev::Created, Ev::AddedV1(3), Ev::Added(4)];
        let batch: Vec<_> = history
            .into_iter()
            .zip(1..)
            .map(|(event, seq)| {
                CommittedEvent::try_new(
                    fixture.identity.clone(),
                    event,
                    metadata.clone(),
                    Utc::now(),
                    seq,
                )
                .unwrap()
            })
            .collect();
        fixture.log.append(&fixture.identity, &batch).await.unwrap();

        let mut machine = fixture.machine(None);
        machine.recover().await.unwrap();
        assert_eq!(machine.state().total, 7);
        assert_eq!(machine.current_sequence_number(), 3);
        assert_eq!(machine.lifecycle(), Lifecycle::Ready);
    }

    #[tokio::test]
    async fn snapshots_shorten_recovery() {
        let fixture = Fixture::new();
        let mut machine = fixture.machine(Some(3));
        machine.handle(fixture.envelope(Cmd::Create)).await.unwrap();
        machine.handle(fixture.envelope(Cmd::Add(2))).await.unwrap();

        let snapshot = fixture
            .snapshots
            .load_latest_snapshot(&fixture.identity)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(snapshot.sequence_number.value(), 3);

        machine.handle(fixture.envelope(Cmd::Add(1))).await.unwrap();

        let mut recovered = fixture.machine(Some(3));
        recovered.recover().await.unwrap();
        assert_eq!(recovered.state(), machine.state());
        assert_eq!(recovered.current_sequence_number(), 5);
    }
}
