//! In-process storage.
//!
//! [`InMemoryEventLog`] and [`InMemorySnapshotStore`] implement the storage
//! ports with `std::sync::Mutex`-guarded maps. They enforce the same
//! sequencing rules as a durable backend and are intended for tests and
//! development; nothing survives the process.

use crate::errors::StoreError;
use crate::event::CommittedEvent;
use crate::metadata::keys;
use crate::store::{EventLog, ProjectionEnvelope, SnapshotRecord, SnapshotStore};
use crate::types::{Identity, SequenceNumber};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

struct LogState<E> {
    streams: HashMap<Identity, Vec<CommittedEvent<E>>>,
    // Global append order; log position is index + 1.
    journal: Vec<CommittedEvent<E>>,
}

/// Event log held in memory.
pub struct InMemoryEventLog<E> {
    state: Mutex<LogState<E>>,
    failing_appends: AtomicUsize,
}

impl<E> InMemoryEventLog<E> {
    /// Creates an empty log.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LogState {
                streams: HashMap::new(),
                journal: Vec::new(),
            }),
            failing_appends: AtomicUsize::new(0),
        }
    }

    /// Makes the next `count` appends fail with an I/O error without writing.
    pub fn fail_next_appends(&self, count: usize) {
        self.failing_appends.store(count, Ordering::SeqCst);
    }

    /// Number of events stored for `identity`.
    pub fn stream_len(&self, identity: &Identity) -> usize {
        self.lock("stream_len")
            .map(|state| state.streams.get(identity).map_or(0, Vec::len))
            .unwrap_or(0)
    }

    fn lock(&self, operation: &str) -> Result<MutexGuard<'_, LogState<E>>, StoreError> {
        self.state
            .lock()
            .map_err(|_| StoreError::Io(format!("event log lock poisoned during {operation}")))
    }

    fn take_injected_failure(&self) -> bool {
        self.failing_appends
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl<E> Default for InMemoryEventLog<E> {
    fn default() -> Self {
        Self::new()
    }
}

fn check_contiguous<E>(
    identity: &Identity,
    last: u64,
    events: &[CommittedEvent<E>],
) -> Result<(), StoreError> {
    let mut expected = last + 1;
    for event in events {
        let actual = event.sequence_number().value();
        if actual != expected || event.identity() != identity {
            return Err(StoreError::SequenceConflict {
                identity: identity.clone(),
                expected,
                actual,
            });
        }
        expected += 1;
    }
    Ok(())
}

fn is_tagged<E>(event: &CommittedEvent<E>, tag: &str) -> bool {
    let metadata = event.metadata();
    metadata.get(keys::AGGREGATE_NAME) == Some(tag) || metadata.get(keys::EVENT_NAME) == Some(tag)
}

#[async_trait]
impl<E> EventLog<E> for InMemoryEventLog<E>
where
    E: Clone + Send + Sync + 'static,
{
    async fn append(
        &self,
        identity: &Identity,
        events: &[CommittedEvent<E>],
    ) -> Result<(), StoreError> {
        if events.is_empty() {
            return Ok(());
        }
        if self.take_injected_failure() {
            return Err(StoreError::Io("injected append failure".to_string()));
        }

        let mut state = self.lock("append")?;
        let last = state
            .streams
            .get(identity)
            .and_then(|stream| stream.last())
            .map_or(0, |event| event.sequence_number().value());
        check_contiguous(identity, last, events)?;

        state
            .streams
            .entry(identity.clone())
            .or_default()
            .extend(events.iter().cloned());
        state.journal.extend(events.iter().cloned());
        drop(state);

        tracing::trace!(identity = %identity, count = events.len(), "appended events");
        Ok(())
    }

    fn read<'a>(
        &'a self,
        identity: &'a Identity,
        from: SequenceNumber,
    ) -> BoxStream<'a, Result<CommittedEvent<E>, StoreError>> {
        let events: Result<Vec<_>, _> = self.lock("read").map(|state| {
            state
                .streams
                .get(identity)
                .map(|stream| {
                    stream
                        .iter()
                        .filter(|event| event.sequence_number() >= from)
                        .cloned()
                        .collect()
                })
                .unwrap_or_default()
        });
        match events {
            Ok(events) => stream::iter(events.into_iter().map(Ok)).boxed(),
            Err(error) => stream::once(async move { Err(error) }).boxed(),
        }
    }

    fn events_by_tag<'a>(
        &'a self,
        tag: &'a str,
        offset: u64,
    ) -> BoxStream<'a, Result<ProjectionEnvelope<E>, StoreError>> {
        let envelopes: Result<Vec<_>, _> = self.lock("events_by_tag").map(|state| {
            state
                .journal
                .iter()
                .zip(1_u64..)
                .filter(|(event, position)| *position > offset && is_tagged(event, tag))
                .map(|(event, position)| ProjectionEnvelope::new(event.clone(), position))
                .collect()
        });
        match envelopes {
            Ok(envelopes) => stream::iter(envelopes.into_iter().map(Ok)).boxed(),
            Err(error) => stream::once(async move { Err(error) }).boxed(),
        }
    }

    async fn head(&self) -> Result<u64, StoreError> {
        let length = self.lock("head")?.journal.len();
        Ok(u64::try_from(length).unwrap_or(u64::MAX))
    }
}

/// Snapshot store held in memory. Keeps only the latest snapshot per identity.
#[derive(Default)]
pub struct InMemorySnapshotStore {
    snapshots: Mutex<HashMap<Identity, SnapshotRecord>>,
}

impl InMemorySnapshotStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SnapshotStore for InMemorySnapshotStore {
    async fn save_snapshot(
        &self,
        identity: &Identity,
        sequence_number: SequenceNumber,
        blob: Vec<u8>,
    ) -> Result<(), StoreError> {
        let mut snapshots = self
            .snapshots
            .lock()
            .map_err(|_| StoreError::Io("snapshot store lock poisoned".to_string()))?;
        let newer_exists = snapshots
            .get(identity)
            .is_some_and(|existing| existing.sequence_number > sequence_number);
        if !newer_exists {
            snapshots.insert(
                identity.clone(),
                SnapshotRecord {
                    sequence_number,
                    blob,
                },
            );
        }
        Ok(())
    }

    async fn load_latest_snapshot(
        &self,
        identity: &Identity,
    ) -> Result<Option<SnapshotRecord>, StoreError> {
        let snapshots = self
            .snapshots
            .lock()
            .map_err(|_| StoreError::Io("snapshot store lock poisoned".to_string()))?;
        Ok(snapshots.get(identity).cloned())
    }
}
