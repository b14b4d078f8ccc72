//! Runtime configuration with validated parameters.
//!
//! Every tunable is a `nutype` newtype validated at construction, so an
//! invalid configuration cannot be built or deserialized.

use crate::retry::RetryConfig;
use crate::sharding::NumberOfShards;
use nutype::nutype;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Number of applied events between two snapshots.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 1_000_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Into,
        Serialize,
        Deserialize
    )
)]
pub struct SnapshotInterval(u64);

/// Capacity of an entity's command queue.
///
/// Senders wait when the queue is full.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 65_536),
    default = 32,
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Into,
        Default,
        Serialize,
        Deserialize
    )
)]
pub struct MailboxCapacity(usize);

/// Capacity of the committed-event broadcast buffer.
///
/// Subscribers that fall further behind than this miss events and are told
/// how many.
#[nutype(
    validate(greater_or_equal = 16, less_or_equal = 1_048_576),
    default = 1024,
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Into,
        Default,
        Serialize,
        Deserialize
    )
)]
pub struct EventBufferCapacity(usize);

/// Maximum number of attempts for a retried command, first attempt included.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 10),
    default = 3,
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Into,
        Default,
        Serialize,
        Deserialize
    )
)]
pub struct MaxRetryAttempts(u32);

/// Exponential backoff multiplier for retry delays.
#[nutype(
    validate(greater_or_equal = 1.1, less_or_equal = 3.0),
    default = 2.0,
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        PartialOrd,
        Into,
        Default,
        Serialize,
        Deserialize
    )
)]
pub struct BackoffMultiplier(f64);

/// Configuration shared by hosts, sagas and routers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Snapshot after this many applied events; never when `None`
    pub snapshot_every: Option<SnapshotInterval>,
    /// Per-identity command queue capacity
    pub mailbox_capacity: MailboxCapacity,
    /// Passivate an identity after this long without commands; never when `None`
    pub idle_timeout: Option<Duration>,
    /// Number of shards identities are hashed into
    pub number_of_shards: NumberOfShards,
    /// Committed-event broadcast buffer capacity
    pub event_buffer_capacity: EventBufferCapacity,
    /// Whether sagas may schedule timeouts
    pub use_saga_timeouts: bool,
    /// Caller-side retry behaviour
    pub retry: RetryConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            snapshot_every: None,
            mailbox_capacity: MailboxCapacity::default(),
            idle_timeout: None,
            number_of_shards: NumberOfShards::default(),
            event_buffer_capacity: EventBufferCapacity::default(),
            use_saga_timeouts: true,
            retry: RetryConfig::default(),
        }
    }
}

impl RuntimeConfig {
    /// Sets the snapshot interval.
    #[must_use]
    pub const fn with_snapshot_every(mut self, every: SnapshotInterval) -> Self {
        self.snapshot_every = Some(every);
        self
    }

    /// Sets the mailbox capacity.
    #[must_use]
    pub const fn with_mailbox_capacity(mut self, capacity: MailboxCapacity) -> Self {
        self.mailbox_capacity = capacity;
        self
    }

    /// Sets the idle passivation timeout.
    #[must_use]
    pub const fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    /// Sets the number of shards.
    #[must_use]
    pub const fn with_number_of_shards(mut self, shards: NumberOfShards) -> Self {
        self.number_of_shards = shards;
        self
    }

    /// Sets the committed-event buffer capacity.
    #[must_use]
    pub const fn with_event_buffer_capacity(mut self, capacity: EventBufferCapacity) -> Self {
        self.event_buffer_capacity = capacity;
        self
    }

    /// Enables or disables saga timeouts.
    #[must_use]
    pub const fn with_saga_timeouts(mut self, enabled: bool) -> Self {
        self.use_saga_timeouts = enabled;
        self
    }

    /// Sets the retry configuration.
    #[must_use]
    pub const fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}
