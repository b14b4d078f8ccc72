//! Read-side consumers.
//!
//! A [`Projection`] folds the events of one tag into a read model. The
//! [`ProjectionRunner`] feeds it from [`EventLog::events_by_tag`] and keeps
//! the offset of the last event it handed over, so every catch-up resumes
//! where the previous one stopped.

use crate::errors::StoreError;
use crate::store::{EventLog, ProjectionEnvelope};
use async_trait::async_trait;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, instrument, warn};

/// A read model built from one tag's events.
#[async_trait]
pub trait Projection<E>: Send + Sync {
    /// The tag to consume: an entity type name or an event name.
    fn tag(&self) -> &str;

    /// Folds one event in. Called in log order.
    async fn project(&mut self, envelope: &ProjectionEnvelope<E>);
}

/// Drives a [`Projection`] from an event log.
pub struct ProjectionRunner<E, P> {
    log: Arc<dyn EventLog<E>>,
    projection: P,
    offset: u64,
}

impl<E, P> ProjectionRunner<E, P>
where
    E: Send + Sync + 'static,
    P: Projection<E>,
{
    /// A runner that starts at the beginning of the log.
    pub fn new(log: Arc<dyn EventLog<E>>, projection: P) -> Self {
        Self::starting_at(log, projection, 0)
    }

    /// A runner that resumes after `offset`.
    pub fn starting_at(log: Arc<dyn EventLog<E>>, projection: P, offset: u64) -> Self {
        Self {
            log,
            projection,
            offset,
        }
    }

    /// Log position of the last projected event; 0 before the first.
    pub const fn offset(&self) -> u64 {
        self.offset
    }

    /// The projection.
    pub const fn projection(&self) -> &P {
        &self.projection
    }

    /// Consumes the runner, returning the projection.
    pub fn into_projection(self) -> P {
        self.projection
    }

    /// Projects every event past the current offset, returning how many were
    /// projected. On a read error the offset stays at the last projected
    /// event.
    #[instrument(skip(self), fields(tag = self.projection.tag(), offset = self.offset))]
    pub async fn run_once(&mut self) -> Result<usize, StoreError> {
        let tag = self.projection.tag().to_owned();
        let mut feed = self.log.events_by_tag(&tag, self.offset);
        let mut projected = 0;
        while let Some(envelope) = feed.next().await {
            let envelope = envelope?;
            self.projection.project(&envelope).await;
            self.offset = envelope.log_position;
            projected += 1;
        }
        if projected > 0 {
            debug!(projected, offset = self.offset, "projection caught up");
        }
        Ok(projected)
    }

    /// Catches up every `interval` until `shutdown` flips to `true`.
    pub async fn run(&mut self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        loop {
            if let Err(error) = self.run_once().await {
                warn!(%error, offset = self.offset, "projection catch-up failed");
            }
            tokio::select! {
                () = tokio::time::sleep(interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }
}
