//! Type-indexed dispatch for entity types.
//!
//! Each entity type declares, once, which handler serves which concrete
//! command, event, snapshot and old-event type. The table is keyed by
//! [`TypeTag`] and built through [`RegistryBuilder`]; registering the same tag
//! twice in one mapping is an ambiguous dispatch and fails the build.
//!
//! Registries are built lazily on first use and cached for the process
//! lifetime, one per entity type (see [`registry_for`]).

use crate::command::Rejection;
use crate::entity::Entity;
use crate::errors::{CommandError, HandlerKind, RegistryError};
use crate::event::TypeTag;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock, PoisonError, RwLock};

/// Runs one command against the current state.
pub type CommandHandler<T> = Arc<
    dyn Fn(
            &<T as Entity>::State,
            &<T as Entity>::Command,
        ) -> Result<Vec<<T as Entity>::Event>, Rejection>
        + Send
        + Sync,
>;

/// Folds one event into the state.
pub type EventApplier<T> = Arc<
    dyn Fn(&mut <T as Entity>::State, &<T as Entity>::Event) -> Result<(), RegistryError>
        + Send
        + Sync,
>;

/// Rebuilds the state from a snapshot.
pub type SnapshotHydrator<T> =
    Arc<dyn Fn(<T as Entity>::Snapshot) -> <T as Entity>::State + Send + Sync>;

/// Moves an old-shape event one version forward.
pub type EventUpcaster<T> =
    Arc<dyn Fn(<T as Entity>::Event) -> <T as Entity>::Event + Send + Sync>;

/// Collects the handler mappings for one entity type.
pub struct RegistryBuilder<T: Entity> {
    commands: HashMap<&'static str, CommandHandler<T>>,
    events: HashMap<&'static str, EventApplier<T>>,
    snapshots: HashMap<&'static str, SnapshotHydrator<T>>,
    upcasters: HashMap<&'static str, EventUpcaster<T>>,
}

impl<T: Entity> RegistryBuilder<T> {
    /// Starts an empty table.
    pub fn new() -> Self {
        Self {
            commands: HashMap::new(),
            events: HashMap::new(),
            snapshots: HashMap::new(),
            upcasters: HashMap::new(),
        }
    }

    fn ambiguous(kind: HandlerKind, type_tag: &'static str) -> RegistryError {
        RegistryError::AmbiguousHandler {
            entity: T::NAME,
            kind,
            type_tag,
        }
    }

    /// Registers the handler for the command variant tagged `tag`.
    ///
    /// `project` picks the variant's payload out of the command sum type; a
    /// command whose tag matches but whose shape does not is rejected.
    pub fn command<C, H>(
        mut self,
        tag: &'static str,
        project: fn(&T::Command) -> Option<&C>,
        handler: H,
    ) -> Result<Self, RegistryError>
    where
        C: 'static,
        H: Fn(&T::State, &C) -> Result<Vec<T::Event>, Rejection> + Send + Sync + 'static,
    {
        if self.commands.contains_key(tag) {
            return Err(Self::ambiguous(HandlerKind::Command, tag));
        }
        let erased: CommandHandler<T> =
            Arc::new(move |state, command| match project(command) {
                Some(payload) => handler(state, payload),
                None => Err(Rejection::new(format!(
                    "command tagged '{tag}' does not carry the registered payload"
                ))),
            });
        self.commands.insert(tag, erased);
        Ok(self)
    }

    /// Registers the apply function for the event variant tagged `tag`.
    pub fn event<V, A>(
        mut self,
        tag: &'static str,
        project: fn(&T::Event) -> Option<&V>,
        apply: A,
    ) -> Result<Self, RegistryError>
    where
        V: 'static,
        A: Fn(&mut T::State, &V) + Send + Sync + 'static,
    {
        if self.events.contains_key(tag) {
            return Err(Self::ambiguous(HandlerKind::Event, tag));
        }
        let erased: EventApplier<T> = Arc::new(move |state, event| {
            let payload = project(event).ok_or(RegistryError::MissingEventApplier {
                entity: T::NAME,
                type_tag: event.type_tag(),
            })?;
            apply(state, payload);
            Ok(())
        });
        self.events.insert(tag, erased);
        Ok(self)
    }

    /// Registers the hydrate function for the snapshot type tagged `tag`.
    pub fn snapshot<F>(mut self, tag: &'static str, hydrate: F) -> Result<Self, RegistryError>
    where
        F: Fn(T::Snapshot) -> T::State + Send + Sync + 'static,
    {
        if self.snapshots.contains_key(tag) {
            return Err(Self::ambiguous(HandlerKind::Snapshot, tag));
        }
        self.snapshots.insert(tag, Arc::new(hydrate));
        Ok(self)
    }

    /// Registers the upcast function for the old event shape tagged `tag`.
    ///
    /// Registering an upcaster marks `tag` as upcastable: replayed events with
    /// this tag never reach an apply function directly.
    pub fn upcast<F>(mut self, tag: &'static str, upcast: F) -> Result<Self, RegistryError>
    where
        F: Fn(T::Event) -> T::Event + Send + Sync + 'static,
    {
        if self.upcasters.contains_key(tag) {
            return Err(Self::ambiguous(HandlerKind::Upcast, tag));
        }
        self.upcasters.insert(tag, Arc::new(upcast));
        Ok(self)
    }

    /// Freezes the table.
    pub fn build(self) -> DispatchRegistry<T> {
        DispatchRegistry {
            commands: self.commands,
            events: self.events,
            snapshots: self.snapshots,
            upcasters: self.upcasters,
        }
    }
}

impl<T: Entity> Default for RegistryBuilder<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Frozen dispatch table for one entity type.
pub struct DispatchRegistry<T: Entity> {
    commands: HashMap<&'static str, CommandHandler<T>>,
    events: HashMap<&'static str, EventApplier<T>>,
    snapshots: HashMap<&'static str, SnapshotHydrator<T>>,
    upcasters: HashMap<&'static str, EventUpcaster<T>>,
}

impl<T: Entity> DispatchRegistry<T> {
    /// Builds the table by running the entity's registration.
    pub fn build() -> Result<Self, RegistryError> {
        Ok(T::register(RegistryBuilder::new())?.build())
    }

    /// Resolves the handler for `command`.
    ///
    /// A miss is recoverable: the caller reports an unsupported command.
    pub fn resolve_command(
        &self,
        command: &T::Command,
    ) -> Result<&CommandHandler<T>, CommandError> {
        let tag = command.type_tag();
        self.commands.get(tag).ok_or(CommandError::Unsupported {
            entity: T::NAME,
            command: tag,
        })
    }

    /// Resolves the apply function for `event`.
    pub fn resolve_applier(&self, event: &T::Event) -> Result<&EventApplier<T>, RegistryError> {
        let tag = event.type_tag();
        self.events
            .get(tag)
            .ok_or(RegistryError::MissingEventApplier {
                entity: T::NAME,
                type_tag: tag,
            })
    }

    /// Applies `event` to `state`.
    pub fn apply(&self, state: &mut T::State, event: &T::Event) -> Result<(), RegistryError> {
        let apply = self.resolve_applier(event)?;
        apply(state, event)
    }

    /// Rebuilds a state from `snapshot`.
    pub fn hydrate(&self, snapshot: T::Snapshot) -> Result<T::State, RegistryError> {
        let tag = snapshot.type_tag();
        let hydrator = self
            .snapshots
            .get(tag)
            .ok_or(RegistryError::MissingHydrator {
                entity: T::NAME,
                type_tag: tag,
            })?;
        Ok(hydrator(snapshot))
    }

    /// Whether `event` has a registered upcast function.
    pub fn is_upcastable(&self, event: &T::Event) -> bool {
        self.upcasters.contains_key(event.type_tag())
    }

    /// Resolves the upcast function for `event`.
    pub fn resolve_upcaster(&self, event: &T::Event) -> Result<&EventUpcaster<T>, RegistryError> {
        let tag = event.type_tag();
        self.upcasters
            .get(tag)
            .ok_or(RegistryError::MissingUpcaster {
                entity: T::NAME,
                type_tag: tag,
            })
    }

    /// Number of registered upcast functions.
    pub fn upcaster_count(&self) -> usize {
        self.upcasters.len()
    }
}

impl<T: Entity> fmt::Debug for DispatchRegistry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut commands: Vec<_> = self.commands.keys().collect();
        let mut events: Vec<_> = self.events.keys().collect();
        let mut upcasters: Vec<_> = self.upcasters.keys().collect();
        commands.sort_unstable();
        events.sort_unstable();
        upcasters.sort_unstable();
        f.debug_struct("DispatchRegistry")
            .field("entity", &T::NAME)
            .field("commands", &commands)
            .field("events", &events)
            .field("snapshots", &self.snapshots.len())
            .field("upcasters", &upcasters)
            .finish()
    }
}

type RegistryCache = RwLock<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>;

fn cache() -> &'static RegistryCache {
    static CACHE: OnceLock<RegistryCache> = OnceLock::new();
    CACHE.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Returns the process-wide registry for `T`, building it on first use.
///
/// A failed build is not cached; every later call reports the same
/// configuration error.
pub fn registry_for<T: Entity>() -> Result<Arc<DispatchRegistry<T>>, RegistryError> {
    let key = TypeId::of::<T>();

    let cached = cache()
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .get(&key)
        .cloned();
    if let Some(registry) = cached.and_then(|any| any.downcast::<DispatchRegistry<T>>().ok()) {
        return Ok(registry);
    }

    let built = Arc::new(DispatchRegistry::<T>::build()?);
    let mut guard = cache().write().unwrap_or_else(PoisonError::into_inner);
    let entry = guard
        .entry(key)
        .or_insert_with(|| Arc::clone(&built) as Arc<dyn Any + Send + Sync>);
    tracing::debug!(entity = T::NAME, "built dispatch registry");
    Ok(Arc::clone(entry)
        .downcast::<DispatchRegistry<T>>()
        .unwrap_or(built))
}
