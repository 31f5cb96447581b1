//! Tools for validating transform hierarchies.

use core::fmt;

use bevy_ecs::{
    entity::{EntityHashMap, EntityHashSet},
    prelude::*,
};
use bevy_log::prelude::*;

use crate::components::{Child, Parent, PreviousParent};

/// A broken hierarchy invariant, found by [`hierarchy_violations`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HierarchyViolation {
    /// `child` has a [`Parent`] pointing at an entity that does not exist.
    DanglingParent {
        /// The entity holding the [`Parent`].
        child: Entity,
        /// The missing parent.
        parent: Entity,
    },
    /// `child` points at `parent`, but is not in its [`Child`] list.
    MissingFromChildList {
        /// The entity holding the [`Parent`].
        child: Entity,
        /// The parent whose list lacks it.
        parent: Entity,
    },
    /// `parent`'s [`Child`] list contains `child`, but `child` does not point back at `parent`.
    StaleChildEntry {
        /// The entity owning the list.
        parent: Entity,
        /// The listed entity.
        child: Entity,
    },
    /// `child` appears more than once in `parent`'s [`Child`] list.
    DuplicateChildEntry {
        /// The entity owning the list.
        parent: Entity,
        /// The repeated entity.
        child: Entity,
    },
    /// `parent` owns a [`Child`] list with no entries.
    EmptyChildList {
        /// The entity owning the list.
        parent: Entity,
    },
    /// The [`PreviousParent`] of `entity` does not match its [`Parent`], or exists without one.
    PreviousParentMismatch {
        /// The entity with the mismatch.
        entity: Entity,
        /// Its [`Parent`], if any.
        parent: Option<Entity>,
        /// Its [`PreviousParent`], if any.
        previous: Option<Entity>,
    },
    /// `entity` is consistently linked to its parent, but cannot be reached from any root. Its
    /// ancestors form a cycle.
    Cycle {
        /// An entity on, or below, the cycle.
        entity: Entity,
    },
}

impl fmt::Display for HierarchyViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DanglingParent { child, parent } => {
                write!(f, "{child} has a Parent pointing at {parent}, which does not exist")
            }
            Self::MissingFromChildList { child, parent } => {
                write!(f, "{child} has a Parent pointing at {parent}, but is not in its Child list")
            }
            Self::StaleChildEntry { parent, child } => write!(
                f,
                "the Child list of {parent} contains {child}, which does not point back at it"
            ),
            Self::DuplicateChildEntry { parent, child } => {
                write!(f, "the Child list of {parent} contains {child} more than once")
            }
            Self::EmptyChildList { parent } => write!(f, "{parent} has an empty Child list"),
            Self::PreviousParentMismatch {
                entity,
                parent,
                previous,
            } => write!(
                f,
                "{entity} has Parent {parent:?} but PreviousParent {previous:?}"
            ),
            Self::Cycle { entity } => write!(
                f,
                "{entity} cannot be reached from any root, its ancestors form a cycle"
            ),
        }
    }
}

/// Check every hierarchy invariant that should hold after maintenance has run, and return all
/// violations found. An empty result means the hierarchy is well formed.
pub fn hierarchy_violations(world: &mut World) -> Vec<HierarchyViolation> {
    let mut violations = Vec::new();

    let nodes: Vec<(Entity, Option<Entity>, Option<Entity>)> = world
        .query::<(Entity, Option<&Parent>, Option<&PreviousParent>)>()
        .iter(world)
        .map(|(entity, parent, previous)| {
            (entity, parent.map(Parent::get), previous.map(PreviousParent::get))
        })
        .collect();
    let child_lists: EntityHashMap<Vec<Entity>> = world
        .query::<(Entity, &Child)>()
        .iter(world)
        .map(|(parent, children)| (parent, children.to_vec()))
        .collect();

    let parent_of = |entity: Entity| world.get::<Parent>(entity).map(Parent::get);

    for &(entity, parent, previous) in &nodes {
        if parent != previous {
            violations.push(HierarchyViolation::PreviousParentMismatch {
                entity,
                parent,
                previous,
            });
        }
        let Some(parent) = parent else {
            continue;
        };
        if !world.entities().contains(parent) {
            violations.push(HierarchyViolation::DanglingParent {
                child: entity,
                parent,
            });
        } else if !child_lists
            .get(&parent)
            .is_some_and(|children| children.contains(&entity))
        {
            violations.push(HierarchyViolation::MissingFromChildList {
                child: entity,
                parent,
            });
        }
    }

    for (&parent, children) in &child_lists {
        if children.is_empty() {
            violations.push(HierarchyViolation::EmptyChildList { parent });
        }
        let mut sorted = children.clone();
        sorted.sort_unstable();
        for pair in sorted.windows(2) {
            if pair[0] == pair[1] {
                violations.push(HierarchyViolation::DuplicateChildEntry {
                    parent,
                    child: pair[0],
                });
            }
        }
        for &child in children {
            if parent_of(child) != Some(parent) {
                violations.push(HierarchyViolation::StaleChildEntry { parent, child });
            }
        }
    }

    // Anything linked consistently with its parent must be reachable by walking down from a root.
    let mut reached = EntityHashSet::default();
    let mut stack: Vec<Entity> = child_lists
        .keys()
        .copied()
        .filter(|&entity| parent_of(entity).is_none())
        .collect();
    while let Some(parent) = stack.pop() {
        let Some(children) = child_lists.get(&parent) else {
            continue;
        };
        for &child in children {
            if parent_of(child) == Some(parent) && reached.insert(child) {
                stack.push(child);
            }
        }
    }
    for &(entity, parent, _) in &nodes {
        let Some(parent) = parent else {
            continue;
        };
        let linked = child_lists
            .get(&parent)
            .is_some_and(|children| children.contains(&entity));
        if linked && !reached.contains(&entity) {
            violations.push(HierarchyViolation::Cycle { entity });
        }
    }

    violations
}

/// Validate the entity hierarchy and report errors.
pub fn validate_hierarchy(world: &mut World) {
    for violation in hierarchy_violations(world) {
        error!(
            "Transform hierarchy validation error:\n\t{violation}\n\tSee {} for details.",
            file!()
        );
    }
}
