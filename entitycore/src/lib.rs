//! `EntityCore` - event-sourced entities with sagas and shard routing
//!
//! Every entity (an aggregate or a saga) owns a strictly ordered event
//! history. Its state is rebuilt by replaying that history, commands for one
//! identity are handled by exactly one live instance at a time, and old event
//! shapes are upcast on replay so schemas can evolve.
//!
//! The main pieces, leaves first:
//!
//! - [`types`] and [`metadata`]: identities, sequence numbers, ids and the
//!   metadata envelope stamped on every event.
//! - [`registry`]: the per-entity-type dispatch table from type tag to
//!   handler.
//! - [`upcast`]: the replay-time chain that lifts old event shapes.
//! - [`state_machine`]: command handling, sequencing, snapshots and recovery
//!   for one instance.
//! - [`host`]: one task per live identity.
//! - [`scheduler`] and [`saga`]: timeouts and long-running processes.
//! - [`sharding`]: stable identity-to-partition routing.
//!
//! Storage is reached through the [`store`] traits; [`memory`] provides
//! in-process implementations.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod command;
pub mod config;
pub mod entity;
pub mod errors;
pub mod event;
pub mod feed;
pub mod host;
pub mod memory;
pub mod metadata;
pub mod projection;
pub mod registry;
pub mod retry;
pub mod saga;
pub mod scheduler;
pub mod sharding;
pub mod specification;
pub mod state_machine;
pub mod store;
pub mod types;
pub mod upcast;

pub use command::{CommandEnvelope, CommandOutcome, CommandResult, Rejection};
pub use config::RuntimeConfig;
pub use entity::{Entity, Lifecycle, NoSnapshot};
pub use errors::{
    CommandError, RecoveryError, RegistryError, SchedulerError, ShardError, StoreError,
    ValidationError,
};
pub use event::{CommittedEvent, DomainEvent, TypeTag};
pub use feed::EventFeed;
pub use host::{EntityHost, EntityStatus};
pub use metadata::Metadata;
pub use registry::{registry_for, DispatchRegistry, RegistryBuilder};
pub use retry::{execute_with_retry, RetryConfig};
pub use saga::{CommandDispatcher, Saga, SagaAction, SagaInput, SagaManager};
pub use scheduler::{Schedule, SchedulerState, TimeoutScheduler};
pub use sharding::{
    MessageExtractor, NumberOfShards, SagaLocator, ShardEnvelope, ShardOwnership, ShardRouter,
    ShardedHost,
};
pub use specification::{Created, EntityIsNew, Predicate, Specification};
pub use state_machine::EntityStateMachine;
pub use store::{EventLog, ProjectionEnvelope, SnapshotStore};
pub use types::{CommandId, CorrelationId, EventId, Identity, JobId, SequenceNumber, ShardId};
