//! Core value types for the `EntityCore` runtime.
//!
//! All types use smart constructors so that a value, once built, is valid:
//! identities are never empty, sequence numbers start at 1 and timestamps are
//! never the epoch sentinel.

use crate::errors::ValidationError;
use chrono::{DateTime, Utc};
use nutype::nutype;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

/// Namespace for deterministic event ids (`"{identity}-v{sequence}"` hashed into UUIDv5).
const EVENT_ID_NAMESPACE: Uuid = Uuid::from_u128(0x387f_5b61_9e98_439a_bff1_15ad_0ea9_1ea0);

// 255 minus the separator and a 36 character uuid.
const MAX_PREFIX_CHARS: usize = 218;

/// Identity of one entity instance.
///
/// Opaque and string backed. Two identities are equal iff their strings are
/// equal. Never empty.
#[nutype(
    validate(not_empty, len_char_max = 255),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct Identity(String);

impl Identity {
    /// Creates a fresh identity of the form `{prefix}-{uuid}`.
    ///
    /// Prefixes longer than 218 characters are truncated so the identity
    /// stays within 255 characters.
    pub fn with_prefix(prefix: &str) -> Self {
        let prefix: String = prefix.chars().take(MAX_PREFIX_CHARS).collect();
        Self::try_new(format!("{prefix}-{}", Uuid::now_v7()))
            .expect("non-empty and at most 255 characters by construction")
    }

    /// Returns the underlying string value.
    pub fn value(&self) -> &str {
        self.as_ref()
    }
}

/// Position of an event within one entity's history.
///
/// Sequence numbers start at 1 and increase by exactly one per event.
#[nutype(
    validate(greater_or_equal = 1),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        Display,
        Into,
        Serialize,
        Deserialize
    )
)]
pub struct SequenceNumber(u64);

impl SequenceNumber {
    /// The sequence number of the first event in any history.
    pub fn first() -> Self {
        Self::try_new(1).expect("1 is always a valid sequence number")
    }

    /// Returns the sequence number that follows `current`, where `current` is
    /// the last applied sequence number (0 for an empty history).
    pub fn after(current: u64) -> Result<Self, ValidationError> {
        let next = current
            .checked_add(1)
            .ok_or(ValidationError::SequenceNumberExhausted(current))?;
        Ok(Self::try_new(next).expect("current + 1 is always >= 1"))
    }

    /// Returns the next sequence number.
    pub fn next(self) -> Result<Self, ValidationError> {
        Self::after(self.value())
    }

    /// Returns the raw value.
    pub fn value(self) -> u64 {
        self.into_inner()
    }
}

/// A UTC instant that is never the epoch sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "DateTime<Utc>", into = "DateTime<Utc>")]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Wraps a `DateTime`, rejecting the default (epoch) value.
    pub fn try_new(datetime: DateTime<Utc>) -> Result<Self, ValidationError> {
        if datetime == DateTime::<Utc>::default() {
            return Err(ValidationError::EpochTimestamp);
        }
        Ok(Self(datetime))
    }

    /// Creates a timestamp representing the current moment.
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Returns the underlying `DateTime`.
    pub const fn as_datetime(&self) -> &DateTime<Utc> {
        &self.0
    }

    /// Converts the timestamp into the underlying `DateTime`.
    pub const fn into_datetime(self) -> DateTime<Utc> {
        self.0
    }
}

impl TryFrom<DateTime<Utc>> for Timestamp {
    type Error = ValidationError;

    fn try_from(datetime: DateTime<Utc>) -> Result<Self, Self::Error> {
        Self::try_new(datetime)
    }
}

impl From<Timestamp> for DateTime<Utc> {
    fn from(timestamp: Timestamp) -> Self {
        timestamp.into_datetime()
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Identifier of a committed event.
///
/// Derived deterministically from the entity identity and sequence number so
/// that re-stamping the same event always yields the same id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(Uuid);

impl EventId {
    /// Derives the id of the event at `sequence_number` in `identity`'s history.
    pub fn deterministic(identity: &Identity, sequence_number: SequenceNumber) -> Self {
        let name = format!("{}-v{}", identity.value(), sequence_number);
        Self(Uuid::new_v5(&EVENT_ID_NAMESPACE, name.as_bytes()))
    }

    /// Returns the underlying uuid.
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for EventId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Identifier of a command, recorded as the `source-id` of the events it produced.
#[nutype(
    validate(not_empty, len_char_max = 255),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct CommandId(String);

impl CommandId {
    /// Creates a new time-ordered command id.
    pub fn new() -> Self {
        Self::try_new(Uuid::now_v7().to_string()).expect("uuid strings are never empty")
    }
}

impl Default for CommandId {
    fn default() -> Self {
        Self::new()
    }
}

/// Links every event produced while handling one logical request.
#[nutype(
    validate(not_empty, len_char_max = 255),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Creates a new time-ordered correlation id.
    pub fn new() -> Self {
        Self::try_new(Uuid::now_v7().to_string()).expect("uuid strings are never empty")
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

/// Identity of a scheduled saga timeout.
#[nutype(
    validate(not_empty, len_char_max = 255),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct JobId(String);

impl JobId {
    /// Creates a new random job id.
    pub fn new() -> Self {
        Self::try_new(Uuid::now_v7().to_string()).expect("uuid strings are never empty")
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

/// Partition an identity is assigned to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShardId(u32);

impl ShardId {
    /// Wraps a raw shard number.
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    /// Returns the raw shard number.
    pub const fn value(self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for ShardId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn identity_accepts_non_empty_strings(s in "[a-zA-Z0-9_-]{1,255}") {
            let identity = Identity::try_new(s.clone()).unwrap();
            prop_assert_eq!(identity.value(), s.as_str());
        }

        #[test]
        fn identity_equality_follows_string_equality(a in "[a-z]{1,8}", b in "[a-z]{1,8}") {
            let left = Identity::try_new(a.clone()).unwrap();
            let right = Identity::try_new(b.clone()).unwrap();
            prop_assert_eq!(left == right, a == b);
        }

        #[test]
        fn sequence_number_after_increments_by_one(current in 0u64..u64::MAX) {
            prop_assert_eq!(SequenceNumber::after(current).unwrap().value(), current + 1);
        }

        #[test]
        fn event_id_is_deterministic(id in "[a-z0-9-]{1,40}", seq in 1u64..10_000) {
            let identity = Identity::try_new(id).unwrap();
            let sequence_number = SequenceNumber::try_new(seq).unwrap();
            prop_assert_eq!(
                EventId::deterministic(&identity, sequence_number),
                EventId::deterministic(&identity, sequence_number)
            );
        }
    }

    #[test]
    fn identity_rejects_empty_string() {
        assert!(Identity::try_new("").is_err());
    }

    #[test]
    fn identity_with_prefix_keeps_prefix() {
        let identity = Identity::with_prefix("testaggregate");
        assert!(identity.value().starts_with("testaggregate-"));

        let long = Identity::with_prefix(&"x".repeat(400));
        assert_eq!(long.value().chars().count(), 255);
    }

    #[test]
    fn sequence_number_rejects_zero() {
        assert!(SequenceNumber::try_new(0).is_err());
        assert_eq!(SequenceNumber::first().value(), 1);
        assert_eq!(SequenceNumber::first().next().unwrap().value(), 2);
    }

    #[test]
    fn sequence_number_has_no_successor_at_the_maximum() {
        assert_eq!(
            SequenceNumber::after(u64::MAX),
            Err(ValidationError::SequenceNumberExhausted(u64::MAX))
        );
        let last = SequenceNumber::try_new(u64::MAX).unwrap();
        assert!(last.next().is_err());
    }

    #[test]
    fn timestamp_rejects_epoch_sentinel() {
        assert_eq!(
            Timestamp::try_new(DateTime::<Utc>::default()),
            Err(ValidationError::EpochTimestamp)
        );
        assert!(Timestamp::try_new(Utc::now()).is_ok());
    }

    #[test]
    fn timestamp_deserialization_rejects_epoch() {
        let json = serde_json::to_string(&DateTime::<Utc>::default()).unwrap();
        assert!(serde_json::from_str::<Timestamp>(&json).is_err());
    }

    #[test]
    fn event_ids_differ_across_sequence_numbers() {
        let identity = Identity::try_new("testaggregate-1").unwrap();
        let first = EventId::deterministic(&identity, SequenceNumber::first());
        let second = EventId::deterministic(&identity, SequenceNumber::first().next().unwrap());
        assert_ne!(first, second);
        assert_eq!(first.to_string().parse::<EventId>().unwrap(), first);
    }

    #[test]
    fn generated_ids_are_unique() {
        assert_ne!(CommandId::new(), CommandId::new());
        assert_ne!(CorrelationId::new(), CorrelationId::new());
        assert_ne!(JobId::new(), JobId::new());
    }
}
