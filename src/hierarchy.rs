//! Keeps [`Parent`], [`PreviousParent`] and [`Child`] consistent with each other.
//!
//! Application code only ever touches [`Parent`]. Once per tick, the systems in this module bring
//! the rest of the relationship in line, in four strictly ordered passes:
//!
//! 1. [`cleanup_deleted_parents`]: parents that were despawned, or lost their [`LocalToWorld`],
//!    release the children that still point at them.
//! 2. [`cleanup_removed_parents`]: children whose [`Parent`] was removed leave their previous
//!    parent's [`Child`] list.
//! 3. [`stamp_new_parents`]: children that just gained a [`Parent`] get a [`PreviousParent`] that
//!    cannot match it, so the next pass treats them as reparented.
//! 4. [`reconcile_changed_parents`]: every child whose [`Parent`] differs from its
//!    [`PreviousParent`] moves between child lists, or is orphaned if the new parent is gone.
//!
//! Each pass applies its structural changes before the next one starts.

use bevy_ecs::{
    component::HookContext,
    entity::{Entities, EntityHashMap},
    prelude::*,
    world::DeferredWorld,
};
use bevy_log::prelude::*;
use bevy_platform::time::Instant;
use bevy_utils::Parallel;
use smallvec::SmallVec;

use crate::{
    components::{Child, LocalToWorld, Parent, PreviousParent},
    plugin::HierarchyConfig,
    timing::HierarchyStats,
};

/// Relationship data captured from entities as they are despawned, consumed by the next
/// maintenance pass. A despawned entity loses all of its components at once, so this is the only
/// record of which lists it was part of.
#[derive(Resource, Debug, Default)]
pub struct DespawnedRelations {
    /// Despawned parents and the children listed in their [`Child`] component.
    parents: Vec<(Entity, Vec<Entity>)>,
    /// Despawned children and their [`PreviousParent`].
    children: Vec<(Entity, Entity)>,
}

impl DespawnedRelations {
    /// `true` if no despawn is waiting to be processed.
    pub fn is_empty(&self) -> bool {
        self.parents.is_empty() && self.children.is_empty()
    }
}

/// `on_despawn` hook for [`Child`].
pub(crate) fn record_despawned_parent(
    mut world: DeferredWorld,
    HookContext { entity, .. }: HookContext,
) {
    let Some(children) = world.get::<Child>(entity).map(|children| children.0.clone()) else {
        return;
    };
    if let Some(mut despawned) = world.get_resource_mut::<DespawnedRelations>() {
        despawned.parents.push((entity, children));
    }
}

/// `on_despawn` hook for [`PreviousParent`].
pub(crate) fn record_despawned_child(
    mut world: DeferredWorld,
    HookContext { entity, .. }: HookContext,
) {
    let Some(previous) = world.get::<PreviousParent>(entity).map(PreviousParent::get) else {
        return;
    };
    if let Some(mut despawned) = world.get_resource_mut::<DespawnedRelations>() {
        despawned.children.push((entity, previous));
    }
}

/// Pass 1: release the children of parents that no longer carry a [`LocalToWorld`], either
/// because it was removed or because the parent was despawned.
///
/// Only children whose [`Parent`] still points at the dead parent are released. A child that was
/// repointed in the meantime is left for [`reconcile_changed_parents`].
pub fn cleanup_deleted_parents(
    mut commands: Commands,
    mut stats: ResMut<HierarchyStats>,
    mut despawned: ResMut<DespawnedRelations>,
    detached: Query<(Entity, &Child), Without<LocalToWorld>>,
    parents: Query<&Parent>,
) {
    let start = Instant::now();
    let mut release = |commands: &mut Commands, parent: Entity, children: &[Entity]| {
        for &child in children {
            if parents.get(child).is_ok_and(|p| p.get() == parent) {
                debug!("Orphaning {child}: its parent {parent} was deleted");
                commands
                    .entity(child)
                    .try_remove::<(Parent, PreviousParent)>();
                stats.orphaned += 1;
            }
        }
    };

    for (parent, children) in &detached {
        release(&mut commands, parent, children.as_slice());
        commands.entity(parent).try_remove::<Child>();
    }

    for (parent, children) in despawned.parents.drain(..) {
        release(&mut commands, parent, &children);
    }

    stats.maintenance += start.elapsed();
}

/// Pass 2: remove children whose [`Parent`] is gone from their previous parent's [`Child`] list,
/// then drop their [`PreviousParent`].
///
/// Despawned children are handled the same way, from the record left by their despawn hook.
///
/// # Panics
///
/// If a child is missing from the list of its previous parent. The hierarchy was already broken
/// before this tick.
pub fn cleanup_removed_parents(
    mut commands: Commands,
    mut stats: ResMut<HierarchyStats>,
    mut despawned: ResMut<DespawnedRelations>,
    removed: Query<(Entity, &PreviousParent), Without<Parent>>,
    mut child_lists: Query<&mut Child>,
) {
    let start = Instant::now();
    for (child, previous) in &removed {
        detach_child(&mut commands, &mut child_lists, previous.get(), child);
        commands.entity(child).try_remove::<PreviousParent>();
    }

    for (child, previous) in despawned.children.drain(..) {
        detach_child(&mut commands, &mut child_lists, previous, child);
    }
    stats.maintenance += start.elapsed();
}

fn detach_child(
    commands: &mut Commands,
    child_lists: &mut Query<&mut Child>,
    parent: Entity,
    child: Entity,
) {
    // The parent was deleted and its list already dropped by pass 1.
    let Ok(mut children) = child_lists.get_mut(parent) else {
        return;
    };
    assert!(
        children.remove(child),
        "Malformed hierarchy: {child} is missing from the child list \
        of its previous parent {parent}"
    );
    if children.is_empty() {
        commands.entity(parent).try_remove::<Child>();
    }
}

/// Walk up from `new_parent` and panic if `child` is on the way, since adopting it there would
/// close a cycle that no root can reach.
fn assert_not_own_ancestor(
    ancestors: &Query<&Parent>,
    child: Entity,
    new_parent: Entity,
    max_depth: usize,
) {
    let mut ancestor = new_parent;
    for _ in 0..=max_depth {
        assert_ne!(
            ancestor, child,
            "Malformed hierarchy: reparenting {child} under {new_parent} would create a cycle"
        );
        let Ok(parent) = ancestors.get(ancestor) else {
            return;
        };
        ancestor = parent.get();
    }
    panic!(
        "Malformed hierarchy: the ancestors of {new_parent} are deeper than {max_depth}, \
        the hierarchy probably contains a cycle"
    );
}

/// Pass 3: give newly parented entities a [`PreviousParent`] placeholder.
pub fn stamp_new_parents(
    mut commands: Commands,
    new: Query<Entity, (With<Parent>, Without<PreviousParent>)>,
) {
    for entity in &new {
        commands.entity(entity).try_insert(PreviousParent::default());
    }
}

/// One half of a reparenting, found during the parallel gather of [`reconcile_changed_parents`].
#[derive(Debug, Clone, Copy)]
enum ParentEdge {
    Adopt { parent: Entity, child: Entity },
    Release { parent: Entity, child: Entity },
}

/// All list edits for one parent.
#[derive(Debug)]
struct ParentEdits {
    parent: Entity,
    adopted: SmallVec<[Entity; 4]>,
    released: SmallVec<[Entity; 4]>,
}

/// Groups edges by parent, so each affected [`Child`] list is touched exactly once.
#[derive(Default)]
struct ParentEditArena {
    index: EntityHashMap<usize>,
    edits: Vec<ParentEdits>,
}

impl ParentEditArena {
    fn edits_for(&mut self, parent: Entity) -> &mut ParentEdits {
        let edits = &mut self.edits;
        let slot = *self.index.entry(parent).or_insert_with(|| {
            edits.push(ParentEdits {
                parent,
                adopted: SmallVec::new(),
                released: SmallVec::new(),
            });
            edits.len() - 1
        });
        &mut self.edits[slot]
    }

    fn drain(&mut self) -> impl Iterator<Item = ParentEdits> + '_ {
        self.index.clear();
        self.edits.drain(..)
    }
}

/// Per-tick scratch storage of [`reconcile_changed_parents`]. Emptied at the end of every run;
/// only the allocations are kept.
#[derive(Default)]
pub struct ReparentScratch {
    edges: Parallel<Vec<ParentEdge>>,
    orphans: Parallel<Vec<(Entity, Option<Entity>)>>,
    arena: ParentEditArena,
}

/// Pass 4: move every child whose [`Parent`] changed into the [`Child`] list of its new parent.
///
/// The gather runs in parallel and only records edges; adding, editing and removing [`Child`]
/// lists happens afterwards, once per affected parent. A child leaving one parent and joining
/// another is released and adopted from the same snapshot, so it is never listed twice or
/// missing.
///
/// If the new parent does not exist, the child is orphaned instead: it loses [`Parent`] and
/// [`PreviousParent`], and leaves its old parent's list.
///
/// # Panics
///
/// If a released child is missing from its old parent's list, or an adopted child is already in
/// its new parent's list. Also if the new parent is the child itself or one of its descendants,
/// or its ancestor chain is longer than [`HierarchyConfig::max_depth`].
pub fn reconcile_changed_parents(
    mut commands: Commands,
    mut stats: ResMut<HierarchyStats>,
    config: Res<HierarchyConfig>,
    entities: &Entities,
    mut changed: Query<
        (Entity, &Parent, &mut PreviousParent),
        Or<(Changed<Parent>, Added<PreviousParent>)>,
    >,
    ancestors: Query<&Parent>,
    mut child_lists: Query<&mut Child>,
    mut scratch: Local<ReparentScratch>,
) {
    let start = Instant::now();
    let ReparentScratch {
        edges,
        orphans,
        arena,
    } = &mut *scratch;

    {
        let (edges, orphans, ancestors, child_lists) =
            (&*edges, &*orphans, &ancestors, &child_lists);
        let max_depth = config.max_depth;
        changed
            .par_iter_mut()
            .for_each(|(child, parent, mut previous)| {
                let (new_parent, old_parent) = (parent.get(), previous.get());
                if new_parent == old_parent {
                    return;
                }
                let old_list = child_lists.contains(old_parent).then_some(old_parent);
                if !entities.contains(new_parent) {
                    orphans.scope(|orphans| orphans.push((child, old_list)));
                    return;
                }
                assert_not_own_ancestor(ancestors, child, new_parent, max_depth);
                edges.scope(|edges| {
                    edges.push(ParentEdge::Adopt {
                        parent: new_parent,
                        child,
                    });
                    if let Some(old_parent) = old_list {
                        edges.push(ParentEdge::Release {
                            parent: old_parent,
                            child,
                        });
                    }
                });
                previous.0 = new_parent;
            });
    }

    for (child, old_parent) in orphans.drain() {
        debug!("Orphaning {child}: its new parent does not exist");
        commands
            .entity(child)
            .try_remove::<(Parent, PreviousParent)>();
        if let Some(old_parent) = old_parent {
            arena.edits_for(old_parent).released.push(child);
        }
        stats.orphaned += 1;
    }

    for edge in edges.drain() {
        match edge {
            ParentEdge::Adopt { parent, child } => {
                arena.edits_for(parent).adopted.push(child);
                stats.reparented += 1;
            }
            ParentEdge::Release { parent, child } => {
                arena.edits_for(parent).released.push(child);
            }
        }
    }

    for edits in arena.drain() {
        let ParentEdits {
            parent,
            adopted,
            released,
        } = edits;
        match child_lists.get_mut(parent) {
            Ok(mut children) => {
                for child in released {
                    assert!(
                        children.remove(child),
                        "Malformed hierarchy: {child} is missing from the child list \
                        of its previous parent {parent}"
                    );
                }
                for child in adopted {
                    children.insert(child);
                }
                if children.is_empty() {
                    commands.entity(parent).try_remove::<Child>();
                }
            }
            Err(_) => {
                debug_assert!(released.is_empty());
                if !adopted.is_empty() {
                    commands
                        .entity(parent)
                        .try_insert(Child::from_iter(adopted));
                }
            }
        }
    }

    trace!(
        "Hierarchy maintenance: {} reparented, {} orphaned",
        stats.reparented,
        stats.orphaned
    );
    stats.maintenance += start.elapsed();
}

/// Depth-first, pre-order iterator over the descendants of an entity.
pub struct DescendantIter<'a, 'w, 's> {
    child_lists: &'a Query<'w, 's, &'static Child>,
    stack: SmallVec<[Entity; 16]>,
}

impl Iterator for DescendantIter<'_, '_, '_> {
    type Item = Entity;

    fn next(&mut self) -> Option<Self::Item> {
        let entity = self.stack.pop()?;
        if let Ok(children) = self.child_lists.get(entity) {
            self.stack.extend(children.iter().rev().copied());
        }
        Some(entity)
    }
}

/// Iterate over every descendant of `root`, not including `root` itself, parents before children.
pub fn iter_descendants<'a, 'w, 's>(
    child_lists: &'a Query<'w, 's, &'static Child>,
    root: Entity,
) -> DescendantIter<'a, 'w, 's> {
    let mut stack = SmallVec::new();
    if let Ok(children) = child_lists.get(root) {
        stack.extend(children.iter().rev().copied());
    }
    DescendantIter { child_lists, stack }
}
