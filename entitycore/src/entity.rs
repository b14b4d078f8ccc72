//! The entity model.
//!
//! An entity type (an aggregate or a saga) names its state, command, event
//! and snapshot types and registers one handler per concrete variant. Every
//! other piece of the runtime is generic over [`Entity`].

use crate::errors::RegistryError;
use crate::event::{DomainEvent, TypeTag};
use crate::registry::RegistryBuilder;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// An event-sourced entity type.
pub trait Entity: Send + Sync + Sized + 'static {
    /// Entity type name, stamped as `aggregate-name`.
    const NAME: &'static str;

    /// In-memory state folded from the entity's history.
    type State: Default + Clone + Send + Sync + 'static;

    /// Sum type of the commands this entity accepts.
    type Command: TypeTag + Send + Sync + 'static;

    /// Sum type of the events this entity commits, including old shapes that
    /// are only ever upcast.
    type Event: DomainEvent;

    /// Sum type of the snapshot shapes this entity can be rebuilt from.
    type Snapshot: TypeTag + Serialize + DeserializeOwned + Send + Sync + 'static;

    /// Declares the entity's handlers.
    fn register(registry: RegistryBuilder<Self>) -> Result<RegistryBuilder<Self>, RegistryError>;

    /// Captures `state` as a snapshot. Entities that never snapshot keep the
    /// default.
    fn snapshot(state: &Self::State) -> Option<Self::Snapshot> {
        let _ = state;
        None
    }
}

/// Snapshot type for entities that never snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NoSnapshot {}

impl TypeTag for NoSnapshot {
    fn type_tag(&self) -> &'static str {
        match *self {}
    }
}

/// Where an entity instance is in its life.
///
/// `Uninitialized -> Recovering -> Ready <-> Processing`. An instance is never
/// left in `Processing` once a command has been answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lifecycle {
    /// Created, history not yet loaded.
    Uninitialized,
    /// Loading snapshot and replaying events.
    Recovering,
    /// Waiting for the next command.
    Ready,
    /// Handling a command.
    Processing,
}

impl Lifecycle {
    /// Whether the instance can accept a command.
    pub const fn is_ready(self) -> bool {
        matches!(self, Self::Ready)
    }
}
