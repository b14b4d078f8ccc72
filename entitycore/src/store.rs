//! Storage ports.
//!
//! The runtime persists through two traits: [`EventLog`], an append-only log
//! of committed events per identity, and [`SnapshotStore`], which keeps the
//! latest serialized state per identity. Both are consumed as trait objects so
//! that backends can be swapped without touching entity code; the [`memory`]
//! module ships in-process implementations.
//!
//! [`memory`]: crate::memory

use crate::errors::StoreError;
use crate::event::CommittedEvent;
use crate::types::{Identity, SequenceNumber};
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

/// Append-only event log keyed by entity identity.
#[async_trait]
pub trait EventLog<E>: Send + Sync
where
    E: Send + Sync + 'static,
{
    /// Appends a batch to `identity`'s history.
    ///
    /// The batch must be non-empty, contiguous, and start at the log's last
    /// sequence number for `identity` plus one; otherwise nothing is written
    /// and [`StoreError::SequenceConflict`] is returned. On success the whole
    /// batch is durable; on any error none of it is.
    async fn append(
        &self,
        identity: &Identity,
        events: &[CommittedEvent<E>],
    ) -> Result<(), StoreError>;

    /// Reads `identity`'s history starting at `from`, in sequence order.
    ///
    /// The stream is finite and can be re-requested at any time.
    fn read<'a>(
        &'a self,
        identity: &'a Identity,
        from: SequenceNumber,
    ) -> BoxStream<'a, Result<CommittedEvent<E>, StoreError>>;

    /// Reads every event tagged `tag` whose log position is greater than
    /// `offset`, in log order.
    ///
    /// Events are tagged with their entity type name and their event name.
    fn events_by_tag<'a>(
        &'a self,
        tag: &'a str,
        offset: u64,
    ) -> BoxStream<'a, Result<ProjectionEnvelope<E>, StoreError>>;

    /// Log position of the newest event, 0 for an empty log.
    async fn head(&self) -> Result<u64, StoreError>;
}

/// Latest-snapshot store keyed by entity identity.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Stores `blob` as `identity`'s state after `sequence_number`.
    async fn save_snapshot(
        &self,
        identity: &Identity,
        sequence_number: SequenceNumber,
        blob: Vec<u8>,
    ) -> Result<(), StoreError>;

    /// Loads `identity`'s most recent snapshot.
    async fn load_latest_snapshot(
        &self,
        identity: &Identity,
    ) -> Result<Option<SnapshotRecord>, StoreError>;
}

/// A stored snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    /// Last sequence number folded into the snapshot
    pub sequence_number: SequenceNumber,
    /// Serialized snapshot
    pub blob: Vec<u8>,
}

/// One entry of a projection feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectionEnvelope<E> {
    /// The committed event
    pub event: CommittedEvent<E>,
    /// Position in the whole log; strictly increasing, starts at 1
    pub log_position: u64,
    /// Commit time in milliseconds since the Unix epoch
    pub logical_timestamp: i64,
}

impl<E> ProjectionEnvelope<E> {
    /// Wraps `event` found at `log_position`.
    pub fn new(event: CommittedEvent<E>, log_position: u64) -> Self {
        let logical_timestamp = event.timestamp().as_datetime().timestamp_millis();
        Self {
            event,
            log_position,
            logical_timestamp,
        }
    }
}
