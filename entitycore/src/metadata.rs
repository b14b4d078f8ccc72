//! Event metadata for the `EntityCore` runtime.
//!
//! Every committed event carries a [`Metadata`] envelope: an ordered
//! string-to-string mapping. A fixed set of reserved keys (see [`keys`]) is
//! stamped by the runtime; callers may add their own keys through command
//! envelopes. Metadata is immutable once stamped: [`Metadata::clone_with`]
//! returns a new value and refuses to overwrite existing keys.

use crate::errors::ValidationError;
use crate::types::{EventId, SequenceNumber};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Reserved metadata keys stamped by the runtime.
pub mod keys {
    /// Type tag of the event payload.
    pub const EVENT_NAME: &str = "event-name";
    /// Schema version of the event payload.
    pub const EVENT_VERSION: &str = "event-version";
    /// RFC 3339 commit time.
    pub const TIMESTAMP: &str = "timestamp";
    /// Commit time as Unix seconds.
    pub const TIMESTAMP_EPOCH: &str = "timestamp-epoch";
    /// Sequence number of the event in its entity's history.
    pub const AGGREGATE_SEQUENCE_NUMBER: &str = "aggregate-sequence-number";
    /// Identity of the entity that committed the event.
    pub const AGGREGATE_ID: &str = "aggregate-id";
    /// Entity type name.
    pub const AGGREGATE_NAME: &str = "aggregate-name";
    /// Id linking all events of one logical request.
    pub const CORRELATION_ID: &str = "correlation-id";
    /// Id of the command or event that caused this event.
    pub const CAUSATION_ID: &str = "causation-id";
    /// Deterministic id of the event.
    pub const EVENT_ID: &str = "event-id";
    /// Id of the command that produced the event.
    pub const SOURCE_ID: &str = "source-id";

    /// All reserved keys.
    pub const RESERVED: [&str; 11] = [
        EVENT_NAME,
        EVENT_VERSION,
        TIMESTAMP,
        TIMESTAMP_EPOCH,
        AGGREGATE_SEQUENCE_NUMBER,
        AGGREGATE_ID,
        AGGREGATE_NAME,
        CORRELATION_ID,
        CAUSATION_ID,
        EVENT_ID,
        SOURCE_ID,
    ];
}

/// Ordered, immutable key/value envelope carried with every event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metadata(BTreeMap<String, String>);

impl Metadata {
    /// Creates empty metadata.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds metadata from pairs, failing on the first duplicated key.
    pub fn try_from_pairs<I, K, V>(pairs: I) -> Result<Self, ValidationError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self::new().clone_with(pairs)
    }

    /// Returns a copy of this metadata with `pairs` added.
    ///
    /// Fails with [`ValidationError::DuplicateMetadataKey`] if any key is
    /// already present, either in `self` or earlier in `pairs`. The original
    /// value is untouched in every case.
    pub fn clone_with<I, K, V>(&self, pairs: I) -> Result<Self, ValidationError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut entries = self.0.clone();
        for (key, value) in pairs {
            let key = key.into();
            if entries.contains_key(&key) {
                return Err(ValidationError::DuplicateMetadataKey { key });
            }
            entries.insert(key, value.into());
        }
        Ok(Self(entries))
    }

    /// Looks up a raw value.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Whether `key` is present.
    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether there are no entries.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    fn require(&self, key: &'static str) -> Result<&str, ValidationError> {
        self.get(key)
            .ok_or(ValidationError::MissingMetadataKey { key })
    }

    fn parse<T: std::str::FromStr>(&self, key: &'static str) -> Result<T, ValidationError> {
        let raw = self.require(key)?;
        raw.parse().map_err(|_| ValidationError::MalformedMetadata {
            key,
            value: raw.to_string(),
        })
    }

    /// Type tag of the event payload.
    pub fn event_name(&self) -> Result<&str, ValidationError> {
        self.require(keys::EVENT_NAME)
    }

    /// Schema version of the event payload.
    pub fn event_version(&self) -> Result<u32, ValidationError> {
        self.parse(keys::EVENT_VERSION)
    }

    /// Commit time.
    pub fn timestamp(&self) -> Result<DateTime<Utc>, ValidationError> {
        let raw = self.require(keys::TIMESTAMP)?;
        DateTime::parse_from_rfc3339(raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|_| ValidationError::MalformedMetadata {
                key: keys::TIMESTAMP,
                value: raw.to_string(),
            })
    }

    /// Commit time as Unix seconds, derived from `timestamp` when the epoch
    /// key itself is absent.
    pub fn timestamp_epoch(&self) -> Result<i64, ValidationError> {
        if self.contains_key(keys::TIMESTAMP_EPOCH) {
            return self.parse(keys::TIMESTAMP_EPOCH);
        }
        self.timestamp().map(|dt| dt.timestamp())
    }

    /// Sequence number of the event in its entity's history.
    pub fn aggregate_sequence_number(&self) -> Result<SequenceNumber, ValidationError> {
        let raw: u64 = self.parse(keys::AGGREGATE_SEQUENCE_NUMBER)?;
        SequenceNumber::try_new(raw).map_err(|_| ValidationError::MalformedMetadata {
            key: keys::AGGREGATE_SEQUENCE_NUMBER,
            value: raw.to_string(),
        })
    }

    /// Identity of the committing entity.
    pub fn aggregate_id(&self) -> Result<&str, ValidationError> {
        self.require(keys::AGGREGATE_ID)
    }

    /// Entity type name.
    pub fn aggregate_name(&self) -> Result<&str, ValidationError> {
        self.require(keys::AGGREGATE_NAME)
    }

    /// Correlation id, if one was propagated.
    pub fn correlation_id(&self) -> Option<&str> {
        self.get(keys::CORRELATION_ID)
    }

    /// Causation id, if one was propagated.
    pub fn causation_id(&self) -> Option<&str> {
        self.get(keys::CAUSATION_ID)
    }

    /// Deterministic event id.
    pub fn event_id(&self) -> Result<EventId, ValidationError> {
        self.parse(keys::EVENT_ID)
    }

    /// Id of the command that produced the event.
    pub fn source_id(&self) -> Option<&str> {
        self.get(keys::SOURCE_ID)
    }
}

/// Formats a commit time the way it is stored under [`keys::TIMESTAMP`].
pub fn format_timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

impl<'a> IntoIterator for &'a Metadata {
    type Item = (&'a String, &'a String);
    type IntoIter = std::collections::btree_map::Iter<'a, String, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}
