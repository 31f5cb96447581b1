//! Write groups let another system take over the computation of a component on specific entities.
//!
//! A component type implementing [`WriteGroupProducer`] declares that, when present on an entity,
//! the entity's [`WriteGroupProducer::Target`] is written by someone else. The default producer
//! must then leave that value alone and treat it as authoritative input. For [`LocalToWorld`] this
//! means the propagation systems skip the write, but still feed the externally supplied matrix to
//! the entity's children.
//!
//! The declarations are collected into [`WriteGroups`] once at setup, where conflicts are rejected.
//! [`WriteGroupMask`] compiles the table into a per-archetype flag so the check at runtime is a
//! single lookup per entity. An archetype carrying more than one producer of the same target has
//! no well defined owner; the mask reports it with `error!` as soon as it appears.
//!
//! ```ignore
//! #[derive(Component)]
//! struct Ragdoll;
//!
//! impl WriteGroupProducer for Ragdoll {
//!     type Target = LocalToWorld;
//! }
//!
//! app.add_plugins(TransformHierarchyPlugin::default())
//!     .register_write_group::<Ragdoll>();
//! ```
//!
//! [`LocalToWorld`]: crate::components::LocalToWorld

use core::{
    any::{type_name, TypeId},
    marker::PhantomData,
};

use bevy_app::App;
use bevy_ecs::{archetype::Archetypes, component::ComponentId, entity::Entities, prelude::*};
use bevy_log::prelude::*;
use bevy_platform::collections::HashMap;

use crate::error::WriteGroupError;

/// A component that, when present, makes its entity's [`Self::Target`] externally authoritative.
pub trait WriteGroupProducer: Component {
    /// The component whose default computation this producer replaces.
    type Target: Component;
}

#[derive(Debug)]
struct WriteGroup {
    target: &'static str,
    inputs: Vec<(ComponentId, &'static str)>,
    producers: Vec<(ComponentId, &'static str)>,
}

impl WriteGroup {
    fn new(target: &'static str) -> Self {
        Self {
            target,
            inputs: Vec::new(),
            producers: Vec::new(),
        }
    }

    fn has_input(&self, id: ComponentId) -> bool {
        self.inputs.iter().any(|&(input, _)| input == id)
    }

    fn has_producer(&self, id: ComponentId) -> bool {
        self.producers.iter().any(|&(producer, _)| producer == id)
    }
}

/// The table of write group declarations, keyed by target component type.
#[derive(Resource, Debug, Default)]
pub struct WriteGroups {
    groups: HashMap<TypeId, WriteGroup>,
}

impl WriteGroups {
    /// Declare `input` as a component read by the default computation of `T`. Inputs can never be
    /// registered as alternate producers of `T`.
    pub fn reserve_input<T: Component>(
        &mut self,
        input: ComponentId,
        input_name: &'static str,
    ) -> Result<(), WriteGroupError> {
        let group = self.group_mut::<T>();
        if group.has_producer(input) {
            return Err(WriteGroupError::ReservedInput {
                target: group.target,
                producer: input_name,
            });
        }
        if !group.has_input(input) {
            group.inputs.push((input, input_name));
        }
        Ok(())
    }

    /// Declare `producer` as an alternate producer of `T`.
    pub fn insert_producer<T: Component>(
        &mut self,
        producer: ComponentId,
        producer_name: &'static str,
    ) -> Result<(), WriteGroupError> {
        let group = self.group_mut::<T>();
        if group.has_input(producer) {
            return Err(WriteGroupError::ReservedInput {
                target: group.target,
                producer: producer_name,
            });
        }
        if group.has_producer(producer) {
            return Err(WriteGroupError::DuplicateProducer {
                target: group.target,
                producer: producer_name,
            });
        }
        debug!("{producer_name} now claims {} when present", group.target);
        group.producers.push((producer, producer_name));
        Ok(())
    }

    /// The alternate producers registered for `T`.
    pub fn producers_of<T: Component>(&self) -> impl Iterator<Item = ComponentId> + '_ {
        self.named_producers_of::<T>().map(|(id, _)| id)
    }

    fn named_producers_of<T: Component>(
        &self,
    ) -> impl Iterator<Item = (ComponentId, &'static str)> + '_ {
        self.groups
            .get(&TypeId::of::<T>())
            .into_iter()
            .flat_map(|group| group.producers.iter().copied())
    }

    fn group_mut<T: Component>(&mut self) -> &mut WriteGroup {
        self.groups
            .entry(TypeId::of::<T>())
            .or_insert_with(|| WriteGroup::new(type_name::<T>()))
    }
}

/// Registration of write groups on an [`App`].
pub trait WriteGroupAppExt {
    /// Register `P` as an alternate producer of `P::Target`.
    ///
    /// # Panics
    ///
    /// If the registration conflicts with an earlier one, see [`WriteGroupError`].
    fn register_write_group<P: WriteGroupProducer>(&mut self) -> &mut Self;

    /// Register `P` as an alternate producer of `P::Target`, reporting conflicts.
    fn try_register_write_group<P: WriteGroupProducer>(
        &mut self,
    ) -> Result<&mut Self, WriteGroupError>;

    /// Declare `I` as an input of the default computation of `T`.
    fn reserve_write_group_input<T: Component, I: Component>(
        &mut self,
    ) -> Result<&mut Self, WriteGroupError>;
}

impl WriteGroupAppExt for App {
    fn register_write_group<P: WriteGroupProducer>(&mut self) -> &mut Self {
        if let Err(error) = self.try_register_write_group::<P>() {
            panic!("Invalid write group registration: {error}");
        }
        self
    }

    fn try_register_write_group<P: WriteGroupProducer>(
        &mut self,
    ) -> Result<&mut Self, WriteGroupError> {
        let world = self.world_mut();
        let id = world.register_component::<P>();
        world
            .get_resource_or_init::<WriteGroups>()
            .insert_producer::<P::Target>(id, type_name::<P>())?;
        Ok(self)
    }

    fn reserve_write_group_input<T: Component, I: Component>(
        &mut self,
    ) -> Result<&mut Self, WriteGroupError> {
        let world = self.world_mut();
        let id = world.register_component::<I>();
        world
            .get_resource_or_init::<WriteGroups>()
            .reserve_input::<T>(id, type_name::<I>())?;
        Ok(self)
    }
}

/// [`WriteGroups`] compiled for one target: which archetypes contain an alternate producer of `T`.
///
/// Archetypes are only ever appended, so the mask is extended incrementally and only rebuilt when
/// the table itself changes.
#[derive(Resource)]
pub struct WriteGroupMask<T: Component> {
    producers: Vec<(ComponentId, &'static str)>,
    claimed: Vec<bool>,
    /// Number of archetypes containing more than one producer of `T`.
    contested: usize,
    /// Entities found claimed during the previous tick, sorted.
    previously_claimed: Vec<Entity>,
    /// Entities found claimed during this tick.
    currently_claimed: Vec<Entity>,
    _target: PhantomData<fn() -> T>,
}

impl<T: Component> Default for WriteGroupMask<T> {
    fn default() -> Self {
        Self {
            producers: Vec::new(),
            claimed: Vec::new(),
            contested: 0,
            previously_claimed: Vec::new(),
            currently_claimed: Vec::new(),
            _target: PhantomData,
        }
    }
}

impl<T: Component> WriteGroupMask<T> {
    /// Bring the mask up to date with the archetypes that exist now, and start a new tick of claim
    /// tracking.
    ///
    /// Every new archetype that holds two or more producers of `T` is logged as an error and
    /// counted in [`Self::contested_archetypes`]. Its entities stay claimed, so the default
    /// producer still leaves them alone.
    pub fn update(archetypes: &Archetypes, groups: Res<WriteGroups>, mut mask: ResMut<Self>) {
        let mask = &mut *mask;
        if groups.is_changed() {
            mask.producers = groups.named_producers_of::<T>().collect();
            mask.claimed.clear();
            mask.contested = 0;
        }
        for archetype in archetypes.iter().skip(mask.claimed.len()) {
            debug_assert_eq!(archetype.id().index(), mask.claimed.len());
            let present: Vec<&str> = mask
                .producers
                .iter()
                .filter(|&&(id, _)| archetype.contains(id))
                .map(|&(_, name)| name)
                .collect();
            if present.len() > 1 {
                error!(
                    "Archetype {:?} contains more than one producer of {}: {}",
                    archetype.id(),
                    type_name::<T>(),
                    present.join(", ")
                );
                mask.contested += 1;
            }
            mask.claimed.push(!present.is_empty());
        }

        mask.previously_claimed.clear();
        core::mem::swap(&mut mask.previously_claimed, &mut mask.currently_claimed);
        mask.previously_claimed.sort_unstable();
    }

    /// Does `entity` currently carry an alternate producer of `T`?
    #[inline]
    pub fn is_claimed(&self, entities: &Entities, entity: Entity) -> bool {
        if self.producers.is_empty() {
            return false;
        }
        entities
            .get(entity)
            .and_then(|location| self.claimed.get(location.archetype_id.index()).copied())
            .unwrap_or(false)
    }

    /// Was `entity` claimed during the previous tick? An entity that was claimed and no longer is
    /// must be recomputed by the default producer even if none of its inputs changed.
    #[inline]
    pub fn was_claimed(&self, entity: Entity) -> bool {
        self.previously_claimed.binary_search(&entity).is_ok()
    }

    /// Remember entities that were found claimed this tick.
    pub fn record_claimed(&mut self, entities: impl IntoIterator<Item = Entity>) {
        self.currently_claimed.extend(entities);
    }

    /// How many archetypes seen so far contain more than one producer of `T`. Entities in them
    /// have no single owner of their `T`, which is a configuration error.
    #[inline]
    pub fn contested_archetypes(&self) -> usize {
        self.contested
    }

    /// Are any alternate producers registered for `T`?
    #[inline]
    pub fn has_producers(&self) -> bool {
        !self.producers.is_empty()
    }
}
