//! The transfer saga.
//!
//! Started by a `TestSent` event: it records the transfer, arms two
//! timeouts and asks the receiving aggregate to take the test. When the
//! receiver's `TestReceived` arrives the saga completes. The two timeouts
//! fire independently of completion, each at most once.

use crate::test_aggregate::{ReceiveTest, Test, TestCommand, TestEvent};
use entitycore::registry::RegistryBuilder;
use entitycore::{
    CommandEnvelope, CommittedEvent, DomainEvent, Entity, Identity, JobId, RegistryError,
    Rejection, Saga, SagaAction, SagaInput, Schedule, SchedulerState, TypeTag,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Delay of the first timeout.
pub const FIRST_TIMEOUT: Duration = Duration::from_millis(200);

/// Delay of the second timeout.
pub const SECOND_TIMEOUT: Duration = Duration::from_millis(400);

/// Prefix of every saga identity.
pub const IDENTITY_PREFIX: &str = "testsaga";

/// Timeout jobs armed by the saga.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TestSagaTimeout {
    /// The first timeout.
    First(String),
    /// The second timeout.
    Second(String),
}

impl TestSagaTimeout {
    /// The message carried by the timeout.
    pub fn message(&self) -> &str {
        match self {
            Self::First(message) | Self::Second(message) => message,
        }
    }
}

impl TypeTag for TestSagaTimeout {
    fn type_tag(&self) -> &'static str {
        match self {
            Self::First(_) => "TestSagaTimeout",
            Self::Second(_) => "TestSagaTimeout2",
        }
    }
}

/// Payload of [`TestSagaEvent::Started`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestSagaStarted {
    /// Aggregate giving the test
    pub sender: Identity,
    /// Aggregate receiving the test
    pub receiver: Identity,
    /// The test being transferred
    pub sent_test: Test,
}

/// Payload of [`TestSagaEvent::TimeoutOccurred`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestSagaTimeoutOccurred {
    /// The fired job
    pub job_id: JobId,
    /// The job's message
    pub timeout_message: String,
}

/// Events committed by [`TestSaga`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TestSagaEvent {
    /// A transfer started.
    Started(TestSagaStarted),
    /// A timeout was armed.
    TimeoutScheduled(Schedule<TestSagaTimeout>),
    /// The receiver took the test.
    TransactionCompleted,
    /// The saga finished.
    Completed,
    /// A timeout fired.
    TimeoutOccurred(TestSagaTimeoutOccurred),
}

impl TestSagaEvent {
    const fn as_started(&self) -> Option<&TestSagaStarted> {
        if let Self::Started(started) = self {
            Some(started)
        } else {
            None
        }
    }

    const fn as_timeout_scheduled(&self) -> Option<&Schedule<TestSagaTimeout>> {
        if let Self::TimeoutScheduled(entry) = self {
            Some(entry)
        } else {
            None
        }
    }

    const fn as_transaction_completed(&self) -> Option<&()> {
        if matches!(self, Self::TransactionCompleted) {
            Some(&())
        } else {
            None
        }
    }

    const fn as_completed(&self) -> Option<&()> {
        if matches!(self, Self::Completed) {
            Some(&())
        } else {
            None
        }
    }

    const fn as_timeout_occurred(&self) -> Option<&TestSagaTimeoutOccurred> {
        if let Self::TimeoutOccurred(occurred) = self {
            Some(occurred)
        } else {
            None
        }
    }
}

impl TypeTag for TestSagaEvent {
    fn type_tag(&self) -> &'static str {
        match self {
            Self::Started(_) => "TestSagaStarted",
            Self::TimeoutScheduled(_) => "TestSagaTimeoutScheduled",
            Self::TransactionCompleted => "TestSagaTransactionCompleted",
            Self::Completed => "TestSagaCompleted",
            Self::TimeoutOccurred(_) => "TestSagaTimeoutOccurred",
        }
    }
}

impl DomainEvent for TestSagaEvent {}

/// Progress of a transfer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferStatus {
    /// Nothing observed yet.
    #[default]
    NotStarted,
    /// Waiting for the receiver.
    Running,
    /// The receiver took the test.
    Completed,
}

/// Folded state of a transfer saga.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestSagaState {
    /// Progress
    pub status: TransferStatus,
    /// The transfer, once started
    pub transfer: Option<TestSagaStarted>,
    /// Whether the receiver confirmed
    pub transaction_completed: bool,
    /// Timeouts armed and not yet fired
    pub timeouts: SchedulerState<TestSagaTimeout>,
    /// Messages of fired timeouts, in firing order
    pub fired: Vec<String>,
}

/// Snapshot shapes of the transfer saga.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TestSagaSnapshot {
    /// The whole state.
    V1(TestSagaState),
}

impl TypeTag for TestSagaSnapshot {
    fn type_tag(&self) -> &'static str {
        "TestSagaSnapshot"
    }
}

/// The transfer saga entity type.
pub struct TestSaga;

impl TestSaga {
    /// The saga identity for transfers started by `sender`.
    ///
    /// A sender has one transfer saga. Later `TestSent` events from the same
    /// sender reach that saga again and are ignored once it has started.
    pub fn id_for(sender: &Identity) -> Option<Identity> {
        Identity::try_new(format!("{IDENTITY_PREFIX}-{sender}")).ok()
    }

    /// Locates the saga an aggregate event belongs to.
    pub fn locate(event: &CommittedEvent<TestEvent>) -> Option<Identity> {
        match event.event() {
            TestEvent::TestSent(_) => Self::id_for(event.identity()),
            TestEvent::TestReceived(received) => Self::id_for(&received.sender),
            TestEvent::TestCreated | TestEvent::TestAddedV1 { .. } | TestEvent::TestAdded(_) => {
                None
            }
        }
    }
}

fn start(
    state: &TestSagaState,
    event: &CommittedEvent<TestEvent>,
) -> Result<Vec<TestSagaEvent>, Rejection> {
    let TestEvent::TestSent(sent) = event.event() else {
        return Err(Rejection::new("saga is started by TestSent only"));
    };
    if state.status != TransferStatus::NotStarted {
        debug!(
            sender = %event.identity(),
            status = ?state.status,
            "transfer saga already started, ignoring TestSent"
        );
        return Ok(Vec::new());
    }
    let sender = event.identity().clone();
    let saga_id = TestSaga::id_for(&sender)
        .ok_or_else(|| Rejection::new("sender identity is too long to derive a saga id"))?;

    let second = format!("Second timeout test for {saga_id}");
    Ok(vec![
        TestSagaEvent::Started(TestSagaStarted {
            sender,
            receiver: sent.receiver.clone(),
            sent_test: sent.test.clone(),
        }),
        TestSagaEvent::TimeoutScheduled(Schedule::after(
            saga_id.clone(),
            FIRST_TIMEOUT,
            TestSagaTimeout::First("First timeout test".to_string()),
        )),
        TestSagaEvent::TimeoutScheduled(Schedule::after(
            saga_id,
            SECOND_TIMEOUT,
            TestSagaTimeout::Second(second),
        )),
    ])
}

fn complete(
    state: &TestSagaState,
    event: &CommittedEvent<TestEvent>,
) -> Result<Vec<TestSagaEvent>, Rejection> {
    let TestEvent::TestReceived(received) = event.event() else {
        return Err(Rejection::new("saga is completed by TestReceived only"));
    };
    let expected = state
        .transfer
        .as_ref()
        .is_some_and(|transfer| transfer.sent_test == received.test);
    if state.status == TransferStatus::Running && expected {
        Ok(vec![
            TestSagaEvent::TransactionCompleted,
            TestSagaEvent::Completed,
        ])
    } else {
        Ok(Vec::new())
    }
}

// An entry that is no longer pending was already handled.
fn timeout_fired(state: &TestSagaState, entry: &Schedule<TestSagaTimeout>) -> Vec<TestSagaEvent> {
    if !state.timeouts.contains(&entry.job_id) {
        return Vec::new();
    }
    vec![TestSagaEvent::TimeoutOccurred(TestSagaTimeoutOccurred {
        job_id: entry.job_id.clone(),
        timeout_message: entry.job.message().to_string(),
    })]
}

impl Entity for TestSaga {
    const NAME: &'static str = "TestSaga";
    type State = TestSagaState;
    type Command = SagaInput<TestEvent, TestSagaTimeout>;
    type Event = TestSagaEvent;
    type Snapshot = TestSagaSnapshot;

    fn register(registry: RegistryBuilder<Self>) -> Result<RegistryBuilder<Self>, RegistryError> {
        registry
            .command("TestSent", SagaInput::as_event, start)?
            .command("TestReceived", SagaInput::as_event, complete)?
            .command("TestSagaTimeout", SagaInput::as_timeout, |state, entry| {
                Ok(timeout_fired(state, entry))
            })?
            .command("TestSagaTimeout2", SagaInput::as_timeout, |state, entry| {
                Ok(timeout_fired(state, entry))
            })?
            .event("TestSagaStarted", TestSagaEvent::as_started, |state, started| {
                state.status = TransferStatus::Running;
                state.transfer = Some(started.clone());
            })?
            .event(
                "TestSagaTimeoutScheduled",
                TestSagaEvent::as_timeout_scheduled,
                |state, entry| {
                    state.timeouts = state.timeouts.add(entry.clone());
                },
            )?
            .event(
                "TestSagaTransactionCompleted",
                TestSagaEvent::as_transaction_completed,
                |state, ()| state.transaction_completed = true,
            )?
            .event("TestSagaCompleted", TestSagaEvent::as_completed, |state, ()| {
                state.status = TransferStatus::Completed;
            })?
            .event(
                "TestSagaTimeoutOccurred",
                TestSagaEvent::as_timeout_occurred,
                |state, occurred| {
                    state.timeouts = state.timeouts.remove(&occurred.job_id);
                    state.fired.push(occurred.timeout_message.clone());
                },
            )?
            .snapshot("TestSagaSnapshot", |TestSagaSnapshot::V1(state)| state)
    }

    fn snapshot(state: &Self::State) -> Option<Self::Snapshot> {
        Some(TestSagaSnapshot::V1(state.clone()))
    }
}

impl Saga for TestSaga {
    type Job = TestSagaTimeout;
    type Outbound = TestCommand;

    fn react(event: &CommittedEvent<TestSagaEvent>) -> Vec<SagaAction<TestCommand, TestSagaTimeout>> {
        match event.event() {
            TestSagaEvent::Started(started) => vec![SagaAction::Dispatch(CommandEnvelope::new(
                started.receiver.clone(),
                TestCommand::ReceiveTest(ReceiveTest {
                    sender: started.sender.clone(),
                    test: started.sent_test.clone(),
                }),
            ))],
            TestSagaEvent::TimeoutScheduled(entry) => {
                vec![SagaAction::ScheduleTimeout(entry.clone())]
            }
            TestSagaEvent::TransactionCompleted
            | TestSagaEvent::Completed
            | TestSagaEvent::TimeoutOccurred(_) => Vec::new(),
        }
    }

    fn pending_timeouts(state: &Self::State) -> Vec<Schedule<TestSagaTimeout>> {
        state.timeouts.entries().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_aggregate::{TestAggregate, TestSent};
    use chrono::Utc;
    use entitycore::{DispatchRegistry, Metadata};

    fn sent_event(sender: &Identity, receiver: &Identity, test: &Test) -> CommittedEvent<TestEvent> {
        CommittedEvent::try_new(
            sender.clone(),
            TestEvent::TestSent(TestSent {
                receiver: receiver.clone(),
                test: test.clone(),
            }),
            Metadata::new(),
            Utc::now(),
            3,
        )
        .unwrap()
    }

    #[test]
    fn locator_keys_both_sides_by_sender() {
        let sender = TestAggregate::new_id();
        let receiver = TestAggregate::new_id();
        let test = Test::new();

        let sent = sent_event(&sender, &receiver, &test);
        let received = CommittedEvent::try_new(
            receiver,
            TestEvent::TestReceived(crate::test_aggregate::TestReceived {
                sender: sender.clone(),
                test,
            }),
            Metadata::new(),
            Utc::now(),
            2,
        )
        .unwrap();

        let saga_id = TestSaga::locate(&sent).unwrap();
        assert_eq!(TestSaga::locate(&received), Some(saga_id.clone()));
        assert!(saga_id.value().starts_with("testsaga-testaggregate-"));
    }

    #[test]
    fn starting_arms_two_timeouts() {
        let sender = TestAggregate::new_id();
        let events = start(
            &TestSagaState::default(),
            &sent_event(&sender, &TestAggregate::new_id(), &Test::new()),
        )
        .unwrap();

        let messages: Vec<&str> = events
            .iter()
            .filter_map(TestSagaEvent::as_timeout_scheduled)
            .map(|entry| entry.job.message())
            .collect();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0], "First timeout test");
        assert!(messages[1].starts_with("Second timeout test"));
    }

    #[test]
    fn repeated_send_from_a_started_sender_is_ignored() {
        let registry = DispatchRegistry::<TestSaga>::build().unwrap();
        let sender = TestAggregate::new_id();
        let sent = sent_event(&sender, &TestAggregate::new_id(), &Test::new());

        let mut state = TestSagaState::default();
        for event in start(&state, &sent).unwrap() {
            registry.apply(&mut state, &event).unwrap();
        }
        assert_eq!(state.status, TransferStatus::Running);

        let again = sent_event(&sender, &TestAggregate::new_id(), &Test::new());
        assert!(start(&state, &again).unwrap().is_empty());
    }

    #[test]
    fn fired_timeouts_are_handled_once() {
        let registry = DispatchRegistry::<TestSaga>::build().unwrap();
        let saga_id = TestSaga::id_for(&TestAggregate::new_id()).unwrap();
        let entry = Schedule::after(
            saga_id,
            Duration::ZERO,
            TestSagaTimeout::First("First timeout test".to_string()),
        );

        let mut state = TestSagaState::default();
        registry
            .apply(&mut state, &TestSagaEvent::TimeoutScheduled(entry.clone()))
            .unwrap();

        let first = timeout_fired(&state, &entry);
        assert_eq!(first.len(), 1);
        registry.apply(&mut state, &first[0]).unwrap();

        assert!(timeout_fired(&state, &entry).is_empty());
        assert_eq!(state.fired, vec!["First timeout test".to_string()]);
    }

    #[test]
    fn started_saga_asks_the_receiver_to_take_the_test() {
        let sender = TestAggregate::new_id();
        let receiver = TestAggregate::new_id();
        let started = CommittedEvent::try_new(
            TestSaga::id_for(&sender).unwrap(),
            TestSagaEvent::Started(TestSagaStarted {
                sender,
                receiver: receiver.clone(),
                sent_test: Test::new(),
            }),
            Metadata::new(),
            Utc::now(),
            1,
        )
        .unwrap();

        let actions = TestSaga::react(&started);
        assert!(matches!(
            actions.as_slice(),
            [SagaAction::Dispatch(envelope)] if envelope.target == receiver
        ));
    }
}
