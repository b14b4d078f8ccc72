//! The test aggregate: an entity that holds tests and hands them to others.
//!
//! Lifecycle: `CreateTest` once, then any number of `AddTest`/`AddTests`;
//! `GiveTest` moves a held test to another aggregate (which receives it
//! through `ReceiveTest`, usually sent by the transfer saga).
//!
//! `TestAdded` went through a schema change: version 1 stored only the test
//! id as `TestAddedV1`. Old history is upcast on replay.

use entitycore::registry::RegistryBuilder;
use entitycore::specification::{Created, Predicate};
use entitycore::{
    DomainEvent, Entity, EntityIsNew, Identity, RegistryError, Specification, TypeTag,
};
use nutype::nutype;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Prefix of every test aggregate identity.
pub const IDENTITY_PREFIX: &str = "testaggregate";

/// Identity of one test.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 255),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        AsRef,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct TestId(String);

impl TestId {
    /// A fresh random test id.
    pub fn new() -> Self {
        Self::try_new(Uuid::now_v7().to_string()).expect("uuid strings are never empty")
    }
}

impl Default for TestId {
    fn default() -> Self {
        Self::new()
    }
}

/// A test, the thing aggregates hold and exchange.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Test {
    /// The test's identity
    pub id: TestId,
}

impl Test {
    /// A test with a fresh id.
    pub fn new() -> Self {
        Self { id: TestId::new() }
    }
}

impl Default for Test {
    fn default() -> Self {
        Self::new()
    }
}

/// Payload of [`TestCommand::GiveTest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GiveTest {
    /// Aggregate receiving the test
    pub receiver: Identity,
    /// The test to give away
    pub test: Test,
}

/// Payload of [`TestCommand::ReceiveTest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiveTest {
    /// Aggregate that gave the test
    pub sender: Identity,
    /// The test received
    pub test: Test,
}

/// Commands accepted by [`TestAggregate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TestCommand {
    /// Creates the aggregate. Fails if it already exists.
    CreateTest,
    /// Adds one test.
    AddTest(Test),
    /// Adds several tests in one batch.
    AddTests(Vec<Test>),
    /// Gives a held test to another aggregate.
    GiveTest(GiveTest),
    /// Receives a test from another aggregate.
    ReceiveTest(ReceiveTest),
}

impl TestCommand {
    const fn as_create(&self) -> Option<&()> {
        if matches!(self, Self::CreateTest) {
            Some(&())
        } else {
            None
        }
    }

    const fn as_add_test(&self) -> Option<&Test> {
        if let Self::AddTest(test) = self {
            Some(test)
        } else {
            None
        }
    }

    const fn as_add_tests(&self) -> Option<&Vec<Test>> {
        if let Self::AddTests(tests) = self {
            Some(tests)
        } else {
            None
        }
    }

    const fn as_give_test(&self) -> Option<&GiveTest> {
        if let Self::GiveTest(give) = self {
            Some(give)
        } else {
            None
        }
    }

    const fn as_receive_test(&self) -> Option<&ReceiveTest> {
        if let Self::ReceiveTest(receive) = self {
            Some(receive)
        } else {
            None
        }
    }
}

impl TypeTag for TestCommand {
    fn type_tag(&self) -> &'static str {
        match self {
            Self::CreateTest => "CreateTest",
            Self::AddTest(_) => "AddTest",
            Self::AddTests(_) => "AddTests",
            Self::GiveTest(_) => "GiveTest",
            Self::ReceiveTest(_) => "ReceiveTest",
        }
    }
}

/// Payload of [`TestEvent::TestSent`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestSent {
    /// Aggregate the test was sent to
    pub receiver: Identity,
    /// The test sent
    pub test: Test,
}

/// Payload of [`TestEvent::TestReceived`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestReceived {
    /// Aggregate the test came from
    pub sender: Identity,
    /// The test received
    pub test: Test,
}

/// Events committed by [`TestAggregate`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TestEvent {
    /// The aggregate was created.
    TestCreated,
    /// Version 1 of `TestAdded`; only found in old history.
    TestAddedV1 {
        /// Id of the added test
        test_id: TestId,
    },
    /// A test was added.
    TestAdded(Test),
    /// A held test was sent away.
    TestSent(TestSent),
    /// A test arrived from another aggregate.
    TestReceived(TestReceived),
}

impl TestEvent {
    const fn as_created(&self) -> Option<&()> {
        if matches!(self, Self::TestCreated) {
            Some(&())
        } else {
            None
        }
    }

    const fn as_added(&self) -> Option<&Test> {
        if let Self::TestAdded(test) = self {
            Some(test)
        } else {
            None
        }
    }

    const fn as_sent(&self) -> Option<&TestSent> {
        if let Self::TestSent(sent) = self {
            Some(sent)
        } else {
            None
        }
    }

    const fn as_received(&self) -> Option<&TestReceived> {
        if let Self::TestReceived(received) = self {
            Some(received)
        } else {
            None
        }
    }
}

impl TypeTag for TestEvent {
    fn type_tag(&self) -> &'static str {
        match self {
            Self::TestCreated => "TestCreated",
            Self::TestAddedV1 { .. } => "TestAddedV1",
            Self::TestAdded(_) => "TestAdded",
            Self::TestSent(_) => "TestSent",
            Self::TestReceived(_) => "TestReceived",
        }
    }
}

impl DomainEvent for TestEvent {
    fn event_version(&self) -> u32 {
        match self {
            Self::TestAdded(_) => 2,
            Self::TestCreated
            | Self::TestAddedV1 { .. }
            | Self::TestSent(_)
            | Self::TestReceived(_) => 1,
        }
    }
}

/// Folded state of a test aggregate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestAggregateState {
    /// Whether `TestCreated` has been applied
    pub created: bool,
    /// Tests currently held
    pub tests: Vec<Test>,
    /// Tests given away
    pub sent: Vec<Test>,
    /// Tests received from others
    pub received: Vec<Test>,
}

impl TestAggregateState {
    /// Whether `test` is currently held.
    pub fn holds(&self, test: &Test) -> bool {
        self.tests.contains(test)
    }
}

impl Created for TestAggregateState {
    fn is_created(&self) -> bool {
        self.created
    }
}

/// Snapshot shapes of the test aggregate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TestAggregateSnapshot {
    /// The whole state.
    V1(TestAggregateState),
}

impl TypeTag for TestAggregateSnapshot {
    fn type_tag(&self) -> &'static str {
        "TestAggregateSnapshot"
    }
}

/// The test aggregate entity type.
pub struct TestAggregate;

impl TestAggregate {
    /// A fresh test aggregate identity.
    pub fn new_id() -> Identity {
        Identity::with_prefix(IDENTITY_PREFIX)
    }
}

fn aggregate_exists() -> Predicate<impl Fn(&TestAggregateState) -> bool, TestAggregateState> {
    Predicate::new("Aggregate does not exist.", |state: &TestAggregateState| {
        state.created
    })
}

impl Entity for TestAggregate {
    const NAME: &'static str = "TestAggregate";
    type State = TestAggregateState;
    type Command = TestCommand;
    type Event = TestEvent;
    type Snapshot = TestAggregateSnapshot;

    fn register(registry: RegistryBuilder<Self>) -> Result<RegistryBuilder<Self>, RegistryError> {
        registry
            .command("CreateTest", TestCommand::as_create, |state, ()| {
                EntityIsNew.check(state)?;
                Ok(vec![TestEvent::TestCreated])
            })?
            .command("AddTest", TestCommand::as_add_test, |state, test| {
                aggregate_exists().check(state)?;
                Ok(vec![TestEvent::TestAdded(test.clone())])
            })?
            .command("AddTests", TestCommand::as_add_tests, |state, tests| {
                aggregate_exists().check(state)?;
                Ok(tests.iter().cloned().map(TestEvent::TestAdded).collect())
            })?
            .command("GiveTest", TestCommand::as_give_test, |state, give| {
                let holds = Predicate::new(
                    format!("Test {} is not held by this aggregate.", give.test.id),
                    |s: &TestAggregateState| s.holds(&give.test),
                );
                aggregate_exists().and(holds).check(state)?;
                Ok(vec![TestEvent::TestSent(TestSent {
                    receiver: give.receiver.clone(),
                    test: give.test.clone(),
                })])
            })?
            .command("ReceiveTest", TestCommand::as_receive_test, |state, receive| {
                aggregate_exists().check(state)?;
                Ok(vec![TestEvent::TestReceived(TestReceived {
                    sender: receive.sender.clone(),
                    test: receive.test.clone(),
                })])
            })?
            .event("TestCreated", TestEvent::as_created, |state, ()| {
                state.created = true;
            })?
            .event("TestAdded", TestEvent::as_added, |state, test| {
                state.tests.push(test.clone());
            })?
            .event("TestSent", TestEvent::as_sent, |state, sent| {
                state.tests.retain(|held| held != &sent.test);
                state.sent.push(sent.test.clone());
            })?
            .event("TestReceived", TestEvent::as_received, |state, received| {
                state.tests.push(received.test.clone());
                state.received.push(received.test.clone());
            })?
            .upcast("TestAddedV1", |event| match event {
                TestEvent::TestAddedV1 { test_id } => TestEvent::TestAdded(Test { id: test_id }),
                current => current,
            })?
            .snapshot("TestAggregateSnapshot", |TestAggregateSnapshot::V1(state)| {
                state
            })
    }

    fn snapshot(state: &Self::State) -> Option<Self::Snapshot> {
        Some(TestAggregateSnapshot::V1(state.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use entitycore::DispatchRegistry;

    #[test]
    fn registry_builds_without_ambiguity() {
        let registry = DispatchRegistry::<TestAggregate>::build().unwrap();
        assert_eq!(registry.upcaster_count(), 1);
        assert!(registry.is_upcastable(&TestEvent::TestAddedV1 {
            test_id: TestId::new()
        }));
        assert!(!registry.is_upcastable(&TestEvent::TestCreated));
    }

    #[test]
    fn create_is_rejected_once_created() {
        let registry = DispatchRegistry::<TestAggregate>::build().unwrap();
        let handler = registry.resolve_command(&TestCommand::CreateTest).unwrap();

        let created = TestAggregateState {
            created: true,
            ..TestAggregateState::default()
        };
        let rejection = handler(&created, &TestCommand::CreateTest).unwrap_err();
        assert_eq!(rejection.reasons(), ["Aggregate already exists.".to_string()]);
    }

    #[test]
    fn giving_an_unknown_test_reports_both_reasons() {
        let registry = DispatchRegistry::<TestAggregate>::build().unwrap();
        let command = TestCommand::GiveTest(GiveTest {
            receiver: TestAggregate::new_id(),
            test: Test::new(),
        });
        let handler = registry.resolve_command(&command).unwrap();

        let rejection = handler(&TestAggregateState::default(), &command).unwrap_err();
        assert_eq!(rejection.reasons().len(), 2);
        assert_eq!(rejection.reasons()[0], "Aggregate does not exist.");
    }

    #[test]
    fn upcasting_preserves_the_test_id() {
        let registry = DispatchRegistry::<TestAggregate>::build().unwrap();
        let id = TestId::new();
        let old = TestEvent::TestAddedV1 { test_id: id.clone() };
        let upcaster = registry.resolve_upcaster(&old).unwrap();
        let upcast = upcaster(old);
        assert_eq!(upcast, TestEvent::TestAdded(Test { id }));
        assert_eq!(upcast.event_version(), 2);
    }
}
