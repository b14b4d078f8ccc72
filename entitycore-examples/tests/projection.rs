//! A read model of every test ever added, built from the `TestAdded` tag.

use async_trait::async_trait;
use entitycore::memory::{InMemoryEventLog, InMemorySnapshotStore};
use entitycore::projection::{Projection, ProjectionRunner};
use entitycore::{CommandEnvelope, EntityHost, Identity, ProjectionEnvelope, RuntimeConfig};
use entitycore_examples::test_aggregate::{Test, TestAggregate, TestCommand, TestEvent};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

#[derive(Default)]
struct TestsByOwner {
    owners: HashMap<Identity, Vec<Test>>,
}

#[async_trait]
impl Projection<TestEvent> for TestsByOwner {
    fn tag(&self) -> &str {
        "TestAdded"
    }

    async fn project(&mut self, envelope: &ProjectionEnvelope<TestEvent>) {
        if let TestEvent::TestAdded(test) = envelope.event.event() {
            self.owners
                .entry(envelope.event.identity().clone())
                .or_default()
                .push(test.clone());
        }
    }
}

async fn add(host: &EntityHost<TestAggregate>, id: &Identity, tests: Vec<Test>) {
    host.execute(CommandEnvelope::new(id.clone(), TestCommand::AddTests(tests)))
        .await
        .unwrap();
}

#[tokio::test]
async fn added_tests_are_projected_per_owner_and_incrementally() {
    let log = Arc::new(InMemoryEventLog::<TestEvent>::new());
    let host = EntityHost::<TestAggregate>::new(
        log.clone(),
        Arc::new(InMemorySnapshotStore::new()),
        RuntimeConfig::default(),
    )
    .unwrap();
    let alice = TestAggregate::new_id();
    let bob = TestAggregate::new_id();
    for id in [&alice, &bob] {
        host.execute(CommandEnvelope::new(id.clone(), TestCommand::CreateTest))
            .await
            .unwrap();
    }

    let alice_tests = vec![Test::new(), Test::new()];
    add(&host, &alice, alice_tests.clone()).await;

    let mut runner = ProjectionRunner::<TestEvent, _>::new(log.clone(), TestsByOwner::default());
    assert_eq!(runner.run_once().await.unwrap(), 2);

    let bob_tests = vec![Test::new()];
    add(&host, &bob, bob_tests.clone()).await;
    assert_eq!(runner.run_once().await.unwrap(), 1);

    let view = runner.into_projection();
    assert_eq!(view.owners[&alice], alice_tests);
    assert_eq!(view.owners[&bob], bob_tests);
}

#[tokio::test]
async fn background_runner_stops_on_shutdown() {
    let log = Arc::new(InMemoryEventLog::<TestEvent>::new());
    let host = EntityHost::<TestAggregate>::new(
        log.clone(),
        Arc::new(InMemorySnapshotStore::new()),
        RuntimeConfig::default(),
    )
    .unwrap();
    let id = TestAggregate::new_id();
    host.execute(CommandEnvelope::new(id.clone(), TestCommand::CreateTest))
        .await
        .unwrap();
    add(&host, &id, vec![Test::new()]).await;

    let (stop, shutdown) = watch::channel(false);
    let task = tokio::spawn(async move {
        let mut runner = ProjectionRunner::<TestEvent, _>::new(log, TestsByOwner::default());
        runner.run(Duration::from_millis(10), shutdown).await;
        runner
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    stop.send(true).unwrap();
    let runner = tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(runner.projection().owners[&id].len(), 1);
}
