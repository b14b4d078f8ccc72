//! Transfer example application
//!
//! Creates two test aggregates, gives a test from one to the other and lets
//! the transfer saga finish, then waits for both saga timeouts.

use anyhow::Result;
use entitycore::{CommandEnvelope, RuntimeConfig};
use entitycore_examples::system::TestSystem;
use entitycore_examples::test_aggregate::{GiveTest, Test, TestAggregate, TestCommand};
use entitycore_examples::test_saga::{TestSaga, TestSagaEvent, SECOND_TIMEOUT};
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let system = TestSystem::start(RuntimeConfig::default()).await?;
    let mut saga_events = system.saga_host().subscribe();

    let sender = TestAggregate::new_id();
    let receiver = TestAggregate::new_id();
    let test = Test::new();

    for id in [&sender, &receiver] {
        system
            .aggregates
            .execute(CommandEnvelope::new(id.clone(), TestCommand::CreateTest))
            .await?;
    }
    system
        .aggregates
        .execute(CommandEnvelope::new(
            sender.clone(),
            TestCommand::AddTest(test.clone()),
        ))
        .await?;

    info!(%sender, %receiver, test = %test.id, "giving test");
    system
        .aggregates
        .execute(CommandEnvelope::new(
            sender.clone(),
            TestCommand::GiveTest(GiveTest {
                receiver: receiver.clone(),
                test,
            }),
        ))
        .await?;

    let deadline = SECOND_TIMEOUT + Duration::from_secs(1);
    let mut fired = 0;
    let watched = tokio::time::timeout(deadline, async {
        while fired < 2 {
            let event = saga_events.recv().await?;
            info!(event = %event, "saga event");
            if matches!(event.event(), TestSagaEvent::TimeoutOccurred(_)) {
                fired += 1;
            }
        }
        Ok::<_, anyhow::Error>(())
    })
    .await;
    watched??;

    let saga_id = TestSaga::id_for(&sender).ok_or_else(|| anyhow::anyhow!("no saga id"))?;
    let saga = system.saga_host().state(&saga_id).await?;
    let received = system.aggregates.state(&receiver).await?;
    info!(
        status = ?saga.status,
        timeouts_fired = saga.fired.len(),
        received = received.received.len(),
        "transfer finished"
    );

    Ok(())
}
