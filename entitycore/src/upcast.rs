//! Schema evolution for replayed events.
//!
//! Before a replayed event reaches an apply function it is passed through the
//! entity's upcast functions: while the payload's type is upcastable, the
//! registered function moves it one version forward. An event written N
//! versions ago therefore takes N passes. Only the payload changes; identity,
//! metadata, timestamp and sequence number are kept.

use crate::entity::Entity;
use crate::errors::RegistryError;
use crate::event::{CommittedEvent, TypeTag};
use crate::registry::DispatchRegistry;

/// Upcasting view over an entity's dispatch registry.
pub struct UpcastChain<'a, T: Entity> {
    registry: &'a DispatchRegistry<T>,
}

impl<'a, T: Entity> UpcastChain<'a, T> {
    /// Creates the chain for `registry`.
    pub const fn new(registry: &'a DispatchRegistry<T>) -> Self {
        Self { registry }
    }

    /// Whether `event` still needs upcasting.
    pub fn should_upcast(&self, event: &CommittedEvent<T::Event>) -> bool {
        self.registry.is_upcastable(event.event())
    }

    /// Moves `event` exactly one version forward.
    ///
    /// Fails with [`RegistryError::MissingUpcaster`] if the payload type has no
    /// upcast function.
    pub fn upcast_once(
        &self,
        event: CommittedEvent<T::Event>,
    ) -> Result<CommittedEvent<T::Event>, RegistryError> {
        let upcaster = self.registry.resolve_upcaster(event.event())?;
        let payload = upcaster(event.event().clone());
        Ok(event.with_event(payload))
    }

    /// Upcasts `event` until its payload is a current shape.
    ///
    /// Each registered upcaster can fire at most once per event in a
    /// well-formed chain; exceeding that bound means two upcasters feed each
    /// other and is reported as [`RegistryError::UpcastCycle`].
    pub fn upcast(
        &self,
        mut event: CommittedEvent<T::Event>,
    ) -> Result<CommittedEvent<T::Event>, RegistryError> {
        let limit = self.registry.upcaster_count();
        let mut passes = 0;
        while self.should_upcast(&event) {
            if passes == limit {
                return Err(RegistryError::UpcastCycle {
                    entity: T::NAME,
                    type_tag: event.event().type_tag(),
                    passes,
                });
            }
            event = self.upcast_once(event)?;
            passes += 1;
        }
        if passes > 0 {
            tracing::trace!(
                entity = T::NAME,
                sequence_number = %event.sequence_number(),
                passes,
                "upcast replayed event"
            );
        }
        Ok(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::NoSnapshot;
    use crate::event::DomainEvent;
    use crate::metadata::{keys, Metadata};
    use crate::registry::RegistryBuilder;
    use crate::types::Identity;
    use chrono::Utc;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Ev {
        V1(u32),
        V2(u32),
        V3(u32),
        Ping,
        Pong,
    }

    impl TypeTag for Ev {
        fn type_tag(&self) -> &'static str {
            match self {
                Self::V1(_) => "V1",
                Self::V2(_) => "V2",
                Self::V3(_) => "V3",
                Self::Ping => "Ping",
                Self::Pong => "Pong",
            }
        }
    }

    impl DomainEvent for Ev {}

    fn v3_payload(e: &Ev) -> Option<&u32> {
        match e {
            Ev::V3(n) => Some(n),
            _ => None,
        }
    }

    struct Versioned;

    impl Entity for Versioned {
        const NAME: &'static str = "Versioned";
        type State = u32;
        type Command = Ev;
        type Event = Ev;
        type Snapshot = NoSnapshot;

        fn register(
            registry: RegistryBuilder<Self>,
        ) -> Result<RegistryBuilder<Self>, RegistryError> {
            registry
                .event("V3", v3_payload, |state, n| *state += n)?
                .upcast("V1", |e| match e {
                    Ev::V1(n) => Ev::V2(n * 10),
                    other => other,
                })?
                .upcast("V2", |e| match e {
                    Ev::V2(n) => Ev::V3(n + 1),
                    other => other,
                })
        }
    }

    struct Cyclic;

    impl Entity for Cyclic {
        const NAME: &'static str = "Cyclic";
        type State = u32;
        type Command = Ev;
        type Event = Ev;
        type Snapshot = NoSnapshot;

        fn register(
            registry: RegistryBuilder<Self>,
        ) -> Result<RegistryBuilder<Self>, RegistryError> {
            registry
                .upcast("Ping", |_| Ev::Pong)?
                .upcast("Pong", |_| Ev::Ping)
        }
    }

    fn committed(event: Ev) -> CommittedEvent<Ev> {
        let metadata = Metadata::try_from_pairs([(keys::EVENT_NAME, event.type_tag())]).unwrap();
        CommittedEvent::try_new(
            Identity::try_new("versioned-1").unwrap(),
            event,
            metadata,
            Utc::now(),
            5,
        )
        .unwrap()
    }

    #[test]
    fn old_events_take_one_pass_per_version() {
        let registry = DispatchRegistry::<Versioned>::build().unwrap();
        let chain = UpcastChain::new(&registry);

        let original = committed(Ev::V1(4));
        let once = chain.upcast_once(original.clone()).unwrap();
        assert_eq!(once.event(), &Ev::V2(40));

        let upcast = chain.upcast(original.clone()).unwrap();
        assert_eq!(upcast.event(), &Ev::V3(41));
        assert_eq!(upcast.identity(), original.identity());
        assert_eq!(upcast.metadata(), original.metadata());
        assert_eq!(upcast.timestamp(), original.timestamp());
        assert_eq!(upcast.sequence_number(), original.sequence_number());
    }

    #[test]
    fn current_events_pass_through_unchanged() {
        let registry = DispatchRegistry::<Versioned>::build().unwrap();
        let chain = UpcastChain::new(&registry);
        let current = committed(Ev::V3(1));
        assert!(!chain.should_upcast(&current));
        assert_eq!(chain.upcast(current.clone()).unwrap(), current);
    }

    #[test]
    fn upcast_once_without_function_is_a_configuration_error() {
        let registry = DispatchRegistry::<Versioned>::build().unwrap();
        let chain = UpcastChain::new(&registry);
        assert!(matches!(
            chain.upcast_once(committed(Ev::V3(1))),
            Err(RegistryError::MissingUpcaster { .. })
        ));
    }

    #[test]
    fn cycles_are_reported() {
        let registry = DispatchRegistry::<Cyclic>::build().unwrap();
        let chain = UpcastChain::new(&registry);
        assert_eq!(
            chain.upcast(committed(Ev::Ping)),
            Err(RegistryError::UpcastCycle {
                entity: "Cyclic",
                type_tag: "Ping",
                passes: 2
            })
        );
    }
}
