use crate::test_aggregate::{TestAggregate, TestEvent};
use crate::test_saga::{TestSaga, TestSagaEvent};
use entitycore::memory::{InMemoryEventLog, InMemorySnapshotStore};
use entitycore::{CommandError, EntityHost, RuntimeConfig, SagaManager};
use std::sync::Arc;
use tracing::info;

/// Aggregates and sagas running against in-memory storage.
///
/// Must be started inside a tokio runtime.
pub struct TestSystem {
    /// Log of aggregate events
    pub aggregate_log: Arc<InMemoryEventLog<TestEvent>>,
    /// Log of saga events
    pub saga_log: Arc<InMemoryEventLog<TestSagaEvent>>,
    /// Host of the test aggregates
    pub aggregates: EntityHost<TestAggregate>,
    /// Transfer saga manager
    pub sagas: SagaManager<TestSaga>,
}

impl TestSystem {
    /// Starts hosts and the saga manager with `config`.
    ///
    /// Fails with [`CommandError::Configuration`] if an entity type is
    /// misconfigured, or [`CommandError::Store`] if a log cannot be read.
    pub async fn start(config: RuntimeConfig) -> Result<Self, CommandError> {
        let aggregate_log = Arc::new(InMemoryEventLog::<TestEvent>::new());
        let saga_log = Arc::new(InMemoryEventLog::<TestSagaEvent>::new());

        let aggregates = EntityHost::<TestAggregate>::new(
            aggregate_log.clone(),
            Arc::new(InMemorySnapshotStore::new()),
            config.clone(),
        )?;
        let saga_host = EntityHost::<TestSaga>::new(
            saga_log.clone(),
            Arc::new(InMemorySnapshotStore::new()),
            config,
        )?;
        let sagas = SagaManager::start(
            aggregates.feed().await?,
            saga_host,
            TestSaga::locate,
            aggregates.clone(),
        )
        .await?;
        info!(
            timeouts = sagas.timeouts_enabled(),
            "test system started"
        );

        Ok(Self {
            aggregate_log,
            saga_log,
            aggregates,
            sagas,
        })
    }

    /// The host running transfer sagas.
    pub const fn saga_host(&self) -> &EntityHost<TestSaga> {
        self.sagas.saga_host()
    }
}
