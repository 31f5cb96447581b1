//! Adds hierarchy-building commands to bevy's `Commands`.

use bevy_ecs::prelude::*;

use crate::components::Parent;

/// Adds hierarchy commands to bevy's `Commands`.
pub trait HierarchyCommands {
    /// Spawn a root entity with `bundle`, and build its subtree with `build`. Returns the root.
    fn spawn_root(
        &mut self,
        bundle: impl Bundle,
        build: impl FnOnce(&mut NodeCommands),
    ) -> Entity;
}

impl HierarchyCommands for Commands<'_, '_> {
    fn spawn_root(
        &mut self,
        bundle: impl Bundle,
        build: impl FnOnce(&mut NodeCommands),
    ) -> Entity {
        let entity = self.spawn(bundle).id();
        build(&mut NodeCommands {
            entity,
            commands: self.reborrow(),
        });
        entity
    }
}

/// Build hierarchies more easily, one node at a time.
pub struct NodeCommands<'a> {
    entity: Entity,
    commands: Commands<'a, 'a>,
}

impl<'a> NodeCommands<'a> {
    /// Returns the [`Entity`] id of this node.
    pub fn id(&self) -> Entity {
        self.entity
    }

    /// Insert a component on this node.
    pub fn insert(&mut self, bundle: impl Bundle) -> &mut Self {
        self.commands.entity(self.entity).insert(bundle);
        self
    }

    /// Spawn a child of this node with the provided bundle, and return its commands.
    pub fn spawn_child(&mut self, bundle: impl Bundle) -> NodeCommands<'_> {
        let parent = self.entity;
        let entity = self.commands.spawn(bundle).insert(Parent(parent)).id();
        NodeCommands {
            entity,
            commands: self.commands.reborrow(),
        }
    }

    /// Spawn a child of this node with the provided bundle, and build its subtree with `build`.
    pub fn with_child(
        &mut self,
        bundle: impl Bundle,
        build: impl FnOnce(&mut NodeCommands),
    ) -> &mut Self {
        build(&mut self.spawn_child(bundle));
        self
    }

    /// Access the underlying commands.
    pub fn commands(&mut self) -> &mut Commands<'a, 'a> {
        &mut self.commands
    }
}

/// Changes the [`Parent`] of an entity. The rest of the hierarchy catches up during the next
/// maintenance pass.
pub trait ParentCommandsExt {
    /// Make `parent` the parent of this entity, replacing any previous parent.
    fn reparent_to(&mut self, parent: Entity) -> &mut Self;

    /// Make this entity a root.
    fn detach_from_parent(&mut self) -> &mut Self;
}

impl ParentCommandsExt for EntityCommands<'_> {
    fn reparent_to(&mut self, parent: Entity) -> &mut Self {
        self.insert(Parent(parent))
    }

    fn detach_from_parent(&mut self) -> &mut Self {
        self.try_remove::<Parent>()
    }
}
