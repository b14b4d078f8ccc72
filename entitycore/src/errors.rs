//! Error types for `EntityCore`.
//!
//! Errors are split by how the caller is expected to react:
//!
//! - **ValidationError**: a core value was built from invalid parts. This is a
//!   programming error in the caller and is reported at construction time.
//! - **RegistryError**: an entity type is misconfigured (missing or ambiguous
//!   handlers). Fatal: registration or recovery is aborted.
//! - **StoreError**: the event log or snapshot store failed or rejected an
//!   append because of a sequence conflict.
//! - **RecoveryError**: rebuilding an entity from snapshot and log failed.
//! - **CommandError**: everything a command caller can observe, including
//!   business-rule rejections.
//! - **ShardError** / **SchedulerError**: routing and timeout plumbing.

use crate::types::{Identity, JobId};
use thiserror::Error;

/// Invalid input while constructing a core value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// The identity was missing or its value was empty.
    #[error("entity identity must be present and non-empty")]
    EmptyIdentity,

    /// The event payload was missing.
    #[error("committed event requires an event payload")]
    MissingEvent,

    /// The metadata envelope was missing.
    #[error("committed event requires metadata")]
    MissingMetadata,

    /// The timestamp was the default (epoch) value.
    #[error("timestamp must not be the epoch sentinel")]
    EpochTimestamp,

    /// The sequence number was zero or negative.
    #[error("sequence number must be >= 1, got {0}")]
    SequenceNumberOutOfRange(i64),

    /// A history already holds the largest possible sequence number.
    #[error("sequence number {0} has no successor")]
    SequenceNumberExhausted(u64),

    /// A metadata key was added twice.
    #[error("metadata key '{key}' is already present")]
    DuplicateMetadataKey {
        /// The key that already existed
        key: String,
    },

    /// A reserved metadata key was requested but absent.
    #[error("metadata key '{key}' is missing")]
    MissingMetadataKey {
        /// The absent key
        key: &'static str,
    },

    /// A reserved metadata key held a value that could not be parsed.
    #[error("metadata key '{key}' has malformed value '{value}'")]
    MalformedMetadata {
        /// The offending key
        key: &'static str,
        /// The raw value
        value: String,
    },
}

/// The kind of handler a registry entry maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    /// Command handler
    Command,
    /// Event applier
    Event,
    /// Snapshot hydrator
    Snapshot,
    /// Event upcaster
    Upcast,
}

impl std::fmt::Display for HandlerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Command => "command",
            Self::Event => "event",
            Self::Snapshot => "snapshot",
            Self::Upcast => "upcast",
        };
        f.write_str(name)
    }
}

/// Misconfiguration of an entity type's dispatch table.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// Two handlers were registered for the same concrete type.
    #[error("{entity}: ambiguous {kind} dispatch, '{type_tag}' registered twice")]
    AmbiguousHandler {
        /// Entity type name
        entity: &'static str,
        /// Which mapping the duplicate was found in
        kind: HandlerKind,
        /// The duplicated type tag
        type_tag: &'static str,
    },

    /// No apply function exists for an event type found in the history.
    #[error("{entity}: no apply function registered for event '{type_tag}'")]
    MissingEventApplier {
        /// Entity type name
        entity: &'static str,
        /// The unknown event type
        type_tag: &'static str,
    },

    /// No hydrate function exists for a stored snapshot type.
    #[error("{entity}: no hydrate function registered for snapshot '{type_tag}'")]
    MissingHydrator {
        /// Entity type name
        entity: &'static str,
        /// The unknown snapshot type
        type_tag: &'static str,
    },

    /// An upcast was requested for a type with no upcast function.
    #[error("{entity}: no upcast function registered for event '{type_tag}'")]
    MissingUpcaster {
        /// Entity type name
        entity: &'static str,
        /// The event type that could not be upcast
        type_tag: &'static str,
    },

    /// Upcasting did not converge to a current shape.
    #[error("{entity}: upcasting '{type_tag}' did not converge after {passes} passes")]
    UpcastCycle {
        /// Entity type name
        entity: &'static str,
        /// The event type that was still upcastable
        type_tag: &'static str,
        /// Number of passes performed
        passes: usize,
    },
}

/// Failures reported by the event log or snapshot store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// An append did not continue the stored history.
    #[error("sequence conflict on '{identity}': expected next {expected}, append started at {actual}")]
    SequenceConflict {
        /// The entity whose history conflicted
        identity: Identity,
        /// The sequence number the log expected next
        expected: u64,
        /// The first sequence number of the rejected batch
        actual: u64,
    },

    /// The store could not be reached or failed mid-operation.
    #[error("I/O error: {0}")]
    Io(String),

    /// A snapshot or event could not be (de)serialized.
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Rebuilding an entity from its snapshot and log failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecoveryError {
    /// The entity type cannot interpret its own history.
    #[error("configuration error: {0}")]
    Configuration(#[from] RegistryError),

    /// The store failed while loading history.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// The stored history skips or repeats a sequence number.
    #[error("history of '{identity}' is not contiguous: expected {expected}, found {found}")]
    SequenceGap {
        /// The entity being recovered
        identity: Identity,
        /// The sequence number expected next
        expected: u64,
        /// The sequence number actually read
        found: u64,
    },
}

/// Everything a command caller can observe when a command does not commit.
///
/// # Handling strategy
///
/// - **Unsupported** / **Rejected**: report to the user, nothing to retry.
/// - **ConcurrencyConflict**: state has been reloaded; retry the command.
/// - **Store**: transient infrastructure failure; retry later.
/// - **Recovery** / **Configuration** / **Validation**: a bug; investigate.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    /// The entity type has no handler for this command type.
    #[error("{entity} does not support command '{command}'")]
    Unsupported {
        /// Entity type name
        entity: &'static str,
        /// The command's type tag
        command: &'static str,
    },

    /// A business rule rejected the command.
    #[error("command rejected: {}", .reasons.join("; "))]
    Rejected {
        /// Human readable reasons
        reasons: Vec<String>,
    },

    /// The log already held events past the entity's in-memory position.
    #[error("concurrency conflict on '{identity}': expected {expected}, got {actual}")]
    ConcurrencyConflict {
        /// The entity whose append conflicted
        identity: Identity,
        /// Sequence number the log expected
        expected: u64,
        /// Sequence number the entity tried to write
        actual: u64,
    },

    /// The log failed while persisting events.
    #[error("store error: {0}")]
    Store(StoreError),

    /// The entity could not be recovered.
    #[error("recovery failed: {0}")]
    Recovery(#[from] RecoveryError),

    /// An event produced by a handler has no apply function.
    #[error("configuration error: {0}")]
    Configuration(#[from] RegistryError),

    /// Stamping or constructing a committed event failed.
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    /// The execution context for the identity stopped before replying.
    #[error("execution context for '{identity}' is gone")]
    ExecutionContextGone {
        /// The entity whose context stopped
        identity: Identity,
    },
}

impl CommandError {
    /// Human readable reasons suitable for a failed command result.
    pub fn reasons(&self) -> Vec<String> {
        match self {
            Self::Rejected { reasons } => reasons.clone(),
            other => vec![other.to_string()],
        }
    }

    /// Whether retrying the same command may succeed.
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::ConcurrencyConflict { .. })
    }
}

impl From<StoreError> for CommandError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::SequenceConflict {
                identity,
                expected,
                actual,
            } => Self::ConcurrencyConflict {
                identity,
                expected,
                actual,
            },
            other => Self::Store(other),
        }
    }
}

/// Routing failures at the partition boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ShardError {
    /// This process does not own the target shard.
    #[error("shard {shard_id} is not owned by this worker")]
    NotOwned {
        /// The shard the message belongs to
        shard_id: u32,
    },

    /// The envelope's shard id does not match the identity's shard.
    #[error("envelope for '{identity}' carried shard {carried}, expected {expected}")]
    Misrouted {
        /// The target identity
        identity: Identity,
        /// Shard id found on the envelope
        carried: u32,
        /// Shard id computed from the identity
        expected: u32,
    },

    /// The command itself failed.
    #[error(transparent)]
    Command(#[from] CommandError),
}

/// Failures talking to the timeout scheduler task.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulerError {
    /// The scheduler task has stopped.
    #[error("timeout scheduler has stopped; job {0} was not accepted")]
    Stopped(JobId),

    /// The scheduler task stopped before answering a query.
    #[error("timeout scheduler has stopped")]
    Unavailable,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_conflicts_become_concurrency_conflicts() {
        let identity = Identity::try_new("account-1").unwrap();
        let error = CommandError::from(StoreError::SequenceConflict {
            identity: identity.clone(),
            expected: 4,
            actual: 3,
        });
        assert_eq!(
            error,
            CommandError::ConcurrencyConflict {
                identity,
                expected: 4,
                actual: 3
            }
        );
        assert!(error.is_retryable());
    }

    #[test]
    fn io_errors_stay_store_errors() {
        let error = CommandError::from(StoreError::Io("disk full".to_string()));
        assert!(matches!(error, CommandError::Store(StoreError::Io(_))));
        assert!(!error.is_retryable());
    }

    #[test]
    fn rejected_reasons_are_passed_through() {
        let error = CommandError::Rejected {
            reasons: vec!["Aggregate already exists.".to_string()],
        };
        assert_eq!(error.reasons(), vec!["Aggregate already exists.".to_string()]);
    }

    #[test]
    fn other_errors_produce_a_single_reason() {
        let error = CommandError::Unsupported {
            entity: "TestAggregate",
            command: "Frobnicate",
        };
        assert_eq!(
            error.reasons(),
            vec!["TestAggregate does not support command 'Frobnicate'".to_string()]
        );
    }
}
