//! Identity-to-partition routing.
//!
//! Every identity hashes to one of `number_of_shards` partitions with a hash
//! that is stable across processes and restarts, so any worker computes the
//! same shard for the same identity. Which worker owns which shard is decided
//! elsewhere; this module only hashes, wraps and unwraps.

use crate::command::{CommandEnvelope, CommandOutcome};
use crate::entity::Entity;
use crate::errors::ShardError;
use crate::event::CommittedEvent;
use crate::host::EntityHost;
use crate::types::{Identity, ShardId};
use nutype::nutype;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{instrument, warn};
use xxhash_rust::xxh3::xxh3_64;

/// Number of partitions identities are hashed into.
///
/// Changing it re-shuffles every identity; it is a deployment decision, never
/// adjusted at runtime.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 65_536),
    default = 12,
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        Into,
        Default,
        Serialize,
        Deserialize
    )
)]
pub struct NumberOfShards(u32);

/// Hash used for shard assignment. Stable across processes and releases.
pub fn stable_hash(value: &str) -> u64 {
    xxh3_64(value.as_bytes())
}

/// A payload addressed to one identity on one shard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardEnvelope<M> {
    /// Shard the target identity hashes to
    pub shard_id: ShardId,
    /// The target identity
    pub target: Identity,
    /// The wrapped message
    pub payload: M,
}

impl<M> ShardEnvelope<M> {
    /// Splits the envelope into shard, identity and payload.
    pub fn into_parts(self) -> (ShardId, Identity, M) {
        (self.shard_id, self.target, self.payload)
    }
}

/// Pulls routing information out of an inbound message.
pub trait MessageExtractor<M> {
    /// What the entity receives once routing information is stripped.
    type Payload;

    /// The identity the message is for.
    fn entity_id(&self, message: &M) -> Identity;

    /// The shard the message belongs to.
    fn shard_id(&self, message: &M) -> ShardId;

    /// Strips routing information.
    fn entity_message(&self, message: M) -> Self::Payload;
}

/// Maps a domain event to the identity of the saga that reacts to it.
pub trait SagaLocator<E>: Send + Sync {
    /// The saga identity for `event`, or `None` if no saga cares.
    fn locate_saga(&self, event: &CommittedEvent<E>) -> Option<Identity>;
}

impl<E, F> SagaLocator<E> for F
where
    F: Fn(&CommittedEvent<E>) -> Option<Identity> + Send + Sync,
{
    fn locate_saga(&self, event: &CommittedEvent<E>) -> Option<Identity> {
        self(event)
    }
}

/// Computes shard ids and wraps messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ShardRouter {
    number_of_shards: NumberOfShards,
}

impl ShardRouter {
    /// Creates a router over `number_of_shards` partitions.
    pub const fn new(number_of_shards: NumberOfShards) -> Self {
        Self { number_of_shards }
    }

    /// The partition count.
    pub const fn number_of_shards(&self) -> NumberOfShards {
        self.number_of_shards
    }

    /// The shard `identity` belongs to.
    pub fn shard_id(&self, identity: &Identity) -> ShardId {
        let shards = u64::from(u32::from(self.number_of_shards));
        let slot = stable_hash(identity.value()) % shards;
        // slot < shards <= u32::MAX
        ShardId::new(u32::try_from(slot).unwrap_or_default())
    }

    /// Wraps `payload` for `target`.
    pub fn wrap<M>(&self, target: Identity, payload: M) -> ShardEnvelope<M> {
        ShardEnvelope {
            shard_id: self.shard_id(&target),
            target,
            payload,
        }
    }

    /// Routes a domain event to its saga, keyed by the saga identity.
    #[instrument(skip(self, locator, event), fields(event = %event.event_id()))]
    pub fn route_saga_event<E: Clone>(
        &self,
        locator: &dyn SagaLocator<E>,
        event: &CommittedEvent<E>,
    ) -> Option<ShardEnvelope<CommittedEvent<E>>> {
        let saga_id = locator.locate_saga(event)?;
        Some(self.wrap(saga_id, event.clone()))
    }
}

impl<C> MessageExtractor<CommandEnvelope<C>> for ShardRouter {
    type Payload = CommandEnvelope<C>;

    fn entity_id(&self, message: &CommandEnvelope<C>) -> Identity {
        message.target.clone()
    }

    fn shard_id(&self, message: &CommandEnvelope<C>) -> ShardId {
        Self::shard_id(self, &message.target)
    }

    fn entity_message(&self, message: CommandEnvelope<C>) -> Self::Payload {
        message
    }
}

impl<M> MessageExtractor<ShardEnvelope<M>> for ShardRouter {
    type Payload = M;

    fn entity_id(&self, message: &ShardEnvelope<M>) -> Identity {
        message.target.clone()
    }

    fn shard_id(&self, message: &ShardEnvelope<M>) -> ShardId {
        message.shard_id
    }

    fn entity_message(&self, message: ShardEnvelope<M>) -> Self::Payload {
        message.payload
    }
}

/// Shards this process currently owns, as granted by the coordinator.
#[derive(Debug, Default)]
pub struct ShardOwnership {
    owned: RwLock<HashSet<ShardId>>,
}

impl ShardOwnership {
    /// An empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that this process owns `shard`.
    pub fn grant(&self, shard: ShardId) {
        self.owned
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(shard);
    }

    /// Records that this process no longer owns `shard`.
    pub fn revoke(&self, shard: ShardId) -> bool {
        self.owned
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&shard)
    }

    /// Whether this process owns `shard`.
    pub fn owns(&self, shard: ShardId) -> bool {
        self.owned
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&shard)
    }

    /// Owned shards in ascending order.
    pub fn owned(&self) -> Vec<ShardId> {
        let mut shards: Vec<ShardId> = self
            .owned
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .copied()
            .collect();
        shards.sort_unstable();
        shards
    }
}

/// An [`EntityHost`] that only serves the shards this process owns.
pub struct ShardedHost<T: Entity> {
    router: ShardRouter,
    ownership: Arc<ShardOwnership>,
    host: EntityHost<T>,
}

impl<T: Entity> Clone for ShardedHost<T> {
    fn clone(&self) -> Self {
        Self {
            router: self.router,
            ownership: Arc::clone(&self.ownership),
            host: self.host.clone(),
        }
    }
}

impl<T: Entity> ShardedHost<T> {
    /// Wraps `host`, sharding by the host's configured number of shards.
    pub fn new(host: EntityHost<T>, ownership: Arc<ShardOwnership>) -> Self {
        Self {
            router: ShardRouter::new(host.config().number_of_shards),
            ownership,
            host,
        }
    }

    /// The router used for shard computation.
    pub const fn router(&self) -> &ShardRouter {
        &self.router
    }

    /// The underlying host.
    pub const fn host(&self) -> &EntityHost<T> {
        &self.host
    }

    /// The ownership table.
    pub fn ownership(&self) -> &ShardOwnership {
        &self.ownership
    }

    /// Handles a command that arrived already wrapped in a shard envelope.
    #[instrument(skip(self, envelope), fields(entity = T::NAME, shard_id = %envelope.shard_id, identity = %envelope.target))]
    pub async fn deliver(
        &self,
        envelope: ShardEnvelope<CommandEnvelope<T::Command>>,
    ) -> Result<CommandOutcome<T::Event>, ShardError> {
        let expected = self.router.shard_id(&envelope.target);
        if envelope.shard_id != expected {
            warn!(expected = %expected, "envelope carried the wrong shard id");
            return Err(ShardError::Misrouted {
                identity: envelope.target,
                carried: envelope.shard_id.value(),
                expected: expected.value(),
            });
        }
        self.dispatch(expected, self.router.entity_message(envelope))
            .await
    }

    /// Routes a bare command by its target identity.
    pub async fn route(
        &self,
        envelope: CommandEnvelope<T::Command>,
    ) -> Result<CommandOutcome<T::Event>, ShardError> {
        let shard = MessageExtractor::shard_id(&self.router, &envelope);
        self.dispatch(shard, envelope).await
    }

    /// Starts serving `shard`.
    pub fn grant(&self, shard: ShardId) {
        self.ownership.grant(shard);
    }

    /// Stops serving `shard`, passivating every live identity in it.
    pub async fn revoke(&self, shard: ShardId) {
        self.ownership.revoke(shard);
        let router = self.router;
        self.host
            .passivate_where(|identity| router.shard_id(identity) == shard)
            .await;
    }

    async fn dispatch(
        &self,
        shard: ShardId,
        envelope: CommandEnvelope<T::Command>,
    ) -> Result<CommandOutcome<T::Event>, ShardError> {
        if !self.ownership.owns(shard) {
            return Err(ShardError::NotOwned {
                shard_id: shard.value(),
            });
        }
        Ok(self.host.execute(envelope).await?)
    }
}
