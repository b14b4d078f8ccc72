//! Committed events.
//!
//! A [`CommittedEvent`] is the immutable record of one accepted state change:
//! the event payload together with the identity of the entity that produced
//! it, its stamped metadata, commit time and position in the entity's history.
//! Committed events are never mutated; upcasting produces a new value that
//! keeps everything except the payload.

use crate::errors::ValidationError;
use crate::metadata::Metadata;
use crate::types::{EventId, Identity, SequenceNumber, Timestamp};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Debug};

/// Names the concrete type behind a value of a sum type.
///
/// Commands, events and snapshots are usually enums; the tag identifies the
/// variant and is the key the dispatch registry resolves handlers by. Tags must
/// be unique per variant within one entity type.
pub trait TypeTag {
    /// Stable name of the concrete type of this value.
    fn type_tag(&self) -> &'static str;
}

/// Payload type of an entity's events.
pub trait DomainEvent: TypeTag + Clone + Debug + Send + Sync + 'static {
    /// Schema version of this value's shape, stamped as `event-version`.
    fn event_version(&self) -> u32 {
        1
    }
}

/// An event accepted into an entity's history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommittedEvent<E> {
    identity: Identity,
    event: E,
    metadata: Metadata,
    timestamp: Timestamp,
    sequence_number: SequenceNumber,
}

impl<E> CommittedEvent<E> {
    /// Validates and builds a committed event.
    pub fn try_new(
        identity: Identity,
        event: E,
        metadata: Metadata,
        timestamp: DateTime<Utc>,
        sequence_number: u64,
    ) -> Result<Self, ValidationError> {
        let timestamp = Timestamp::try_new(timestamp)?;
        let sequence_number = SequenceNumber::try_new(sequence_number).map_err(|_| {
            ValidationError::SequenceNumberOutOfRange(
                i64::try_from(sequence_number).unwrap_or(i64::MAX),
            )
        })?;
        Ok(Self {
            identity,
            event,
            metadata,
            timestamp,
            sequence_number,
        })
    }

    /// The entity that committed the event.
    pub const fn identity(&self) -> &Identity {
        &self.identity
    }

    /// The payload.
    pub const fn event(&self) -> &E {
        &self.event
    }

    /// Consumes the committed event, returning the payload.
    pub fn into_event(self) -> E {
        self.event
    }

    /// Stamped metadata.
    pub const fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Commit time.
    pub const fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    /// Position in the entity's history.
    pub const fn sequence_number(&self) -> SequenceNumber {
        self.sequence_number
    }

    /// Deterministic id of this event.
    pub fn event_id(&self) -> EventId {
        EventId::deterministic(&self.identity, self.sequence_number)
    }

    /// Replaces the payload, keeping identity, metadata, timestamp and
    /// sequence number.
    #[must_use]
    pub fn with_event(self, event: E) -> Self {
        Self { event, ..self }
    }
}

impl<E: TypeTag> fmt::Display for CommittedEvent<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} v{}/{}:{}",
            self.metadata.aggregate_name().unwrap_or("unknown"),
            self.sequence_number,
            self.event.type_tag(),
            self.identity
        )
    }
}

/// Unvalidated parts of a committed event, for instance decoded from storage.
///
/// Converting into [`CommittedEvent`] reports each missing or invalid part as
/// its own [`ValidationError`].
#[derive(Debug, Clone)]
pub struct CommittedEventParts<E> {
    /// Raw identity value
    pub identity: Option<String>,
    /// Payload
    pub event: Option<E>,
    /// Metadata envelope
    pub metadata: Option<Metadata>,
    /// Commit time
    pub timestamp: DateTime<Utc>,
    /// Raw sequence number
    pub sequence_number: i64,
}

impl<E> TryFrom<CommittedEventParts<E>> for CommittedEvent<E> {
    type Error = ValidationError;

    fn try_from(parts: CommittedEventParts<E>) -> Result<Self, Self::Error> {
        let event = parts.event.ok_or(ValidationError::MissingEvent)?;
        let metadata = parts.metadata.ok_or(ValidationError::MissingMetadata)?;
        let timestamp = Timestamp::try_new(parts.timestamp)?;
        let identity = parts
            .identity
            .and_then(|raw| Identity::try_new(raw).ok())
            .ok_or(ValidationError::EmptyIdentity)?;
        let sequence_number = u64::try_from(parts.sequence_number)
            .ok()
            .and_then(|raw| SequenceNumber::try_new(raw).ok())
            .ok_or(ValidationError::SequenceNumberOutOfRange(parts.sequence_number))?;

        Ok(Self {
            identity,
            event,
            metadata,
            timestamp,
            sequence_number,
        })
    }
}

impl<E> From<CommittedEvent<E>> for CommittedEventParts<E> {
    fn from(committed: CommittedEvent<E>) -> Self {
        Self {
            identity: Some(committed.identity.into_inner()),
            event: Some(committed.event),
            metadata: Some(committed.metadata),
            timestamp: committed.timestamp.into_datetime(),
            sequence_number: i64::try_from(committed.sequence_number.value())
                .unwrap_or(i64::MAX),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::keys;
    use proptest::prelude::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct TestAdded {
        test_id: String,
    }

    impl TypeTag for TestAdded {
        fn type_tag(&self) -> &'static str {
            "TestAdded"
        }
    }

    fn parts() -> CommittedEventParts<TestAdded> {
        CommittedEventParts {
            identity: Some("testaggregate-1".to_string()),
            event: Some(TestAdded {
                test_id: "test-1".to_string(),
            }),
            metadata: Some(Metadata::new()),
            timestamp: Utc::now(),
            sequence_number: 1,
        }
    }

    proptest! {
        #[test]
        fn construction_round_trips_every_field(
            id in "[a-z0-9-]{1,32}",
            test_id in "[a-z0-9]{1,16}",
            seq in 1u64..1_000_000,
            secs in 1i64..4_000_000_000,
        ) {
            let identity = Identity::try_new(id).unwrap();
            let at = DateTime::<Utc>::from_timestamp(secs, 0).unwrap();
            let metadata = Metadata::try_from_pairs([(keys::AGGREGATE_NAME, "TestAggregate")]).unwrap();
            let event = TestAdded { test_id };

            let committed = CommittedEvent::try_new(
                identity.clone(), event.clone(), metadata.clone(), at, seq,
            ).unwrap();

            prop_assert_eq!(committed.identity(), &identity);
            prop_assert_eq!(committed.event(), &event);
            prop_assert_eq!(committed.metadata(), &metadata);
            prop_assert_eq!(committed.timestamp().into_datetime(), at);
            prop_assert_eq!(committed.sequence_number().value(), seq);
        }
    }

    #[test]
    fn missing_event_is_rejected() {
        let result = CommittedEvent::try_from(CommittedEventParts {
            event: None,
            ..parts()
        });
        assert_eq!(result.unwrap_err(), ValidationError::MissingEvent);
    }

    #[test]
    fn missing_metadata_is_rejected() {
        let result = CommittedEvent::try_from(CommittedEventParts {
            metadata: None,
            ..parts()
        });
        assert_eq!(result.unwrap_err(), ValidationError::MissingMetadata);
    }

    #[test]
    fn epoch_timestamp_is_rejected() {
        let result = CommittedEvent::try_from(CommittedEventParts {
            timestamp: DateTime::<Utc>::default(),
            ..parts()
        });
        assert_eq!(result.unwrap_err(), ValidationError::EpochTimestamp);
    }

    #[test]
    fn missing_or_empty_identity_is_rejected() {
        for identity in [None, Some(String::new())] {
            let result = CommittedEvent::try_from(CommittedEventParts {
                identity,
                ..parts()
            });
            assert_eq!(result.unwrap_err(), ValidationError::EmptyIdentity);
        }
    }

    #[test]
    fn non_positive_sequence_numbers_are_rejected() {
        for seq in [0, -1, i64::MIN] {
            let result = CommittedEvent::try_from(CommittedEventParts {
                sequence_number: seq,
                ..parts()
            });
            assert_eq!(
                result.unwrap_err(),
                ValidationError::SequenceNumberOutOfRange(seq)
            );
        }
    }

    #[test]
    fn upcast_replacement_preserves_envelope() {
        let committed = CommittedEvent::try_from(parts()).unwrap();
        let replaced = committed.clone().with_event(TestAdded {
            test_id: "test-2".to_string(),
        });

        assert_eq!(replaced.identity(), committed.identity());
        assert_eq!(replaced.metadata(), committed.metadata());
        assert_eq!(replaced.timestamp(), committed.timestamp());
        assert_eq!(replaced.sequence_number(), committed.sequence_number());
        assert_eq!(replaced.event().test_id, "test-2");
    }

    #[test]
    fn display_names_entity_sequence_event_and_identity() {
        let metadata = Metadata::try_from_pairs([(keys::AGGREGATE_NAME, "TestAggregate")]).unwrap();
        let committed = CommittedEvent::try_from(CommittedEventParts {
            metadata: Some(metadata),
            sequence_number: 7,
            ..parts()
        })
        .unwrap();

        assert_eq!(
            committed.to_string(),
            "TestAggregate v7/TestAdded:testaggregate-1"
        );
    }
}
