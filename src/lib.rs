//! Incremental transform hierarchies for [`bevy_ecs`].
//!
//! Entities are arranged into trees by giving children a [`Parent`](components::Parent). Every
//! entity with a [`LocalTransform`](components::LocalTransform) gets a
//! [`LocalToWorld`](components::LocalToWorld) matrix, computed each tick by composing its local
//! transform with those of all its ancestors.
//!
//! ### Problem
//!
//! Recomputing every world matrix every tick is wasteful when most of a scene is static, and
//! keeping both directions of a parent/child relationship up to date by hand is error-prone,
//! especially when entities are despawned without detaching them first.
//!
//! ### Solution
//!
//! Application code only ever writes [`Parent`](components::Parent). The
//! [`TransformHierarchyPlugin`](plugin::TransformHierarchyPlugin) maintains the reverse
//! [`Child`](components::Child) lists, cleans up after despawned parents and children, and then
//! propagates transforms from every root down, skipping any subtree whose inputs have not changed
//! since the last tick.
//!
//! Other systems can take over the world matrix of specific entities with a
//! [write group](write_group). Propagation leaves those matrices alone, but still passes them on
//! to the entity's children.
//!
//! # Getting Started
//!
//! 1. Add the [`TransformHierarchyPlugin`](plugin::TransformHierarchyPlugin) to your `App`.
//! 2. Spawn entities with a [`LocalTransform`](components::LocalTransform).
//! 3. Give children a [`Parent`](components::Parent), or build trees with
//!    [`HierarchyCommands::spawn_root`](commands::HierarchyCommands::spawn_root).
//! 4. Read [`LocalToWorld`](components::LocalToWorld) after `PostUpdate`, or use
//!    [`compute_world_matrix`](compute::compute_world_matrix) when you need an up-to-date value
//!    in the middle of a tick.
//!
//! ```ignore
//! app.add_plugins(TransformHierarchyPlugin::default());
//!
//! fn setup(mut commands: Commands) {
//!     commands.spawn_root(LocalTransform::from_xyz(1.0, 0.0, 0.0), |root| {
//!         root.spawn_child(LocalTransform::from_xyz(0.0, 1.0, 0.0));
//!     });
//! }
//! ```

#![allow(clippy::type_complexity)]

pub mod commands;
pub mod components;
pub mod compute;
pub mod error;
pub mod hierarchy;
pub mod plugin;
pub mod propagation;
pub mod timing;
pub mod validation;
pub mod write_group;

#[cfg(test)]
mod tests;

/// Common exports.
pub mod prelude {
    pub use crate::commands::{HierarchyCommands, NodeCommands, ParentCommandsExt};
    pub use crate::components::{
        local_matrix, Child, LocalToWorld, LocalTransform, Parent, PostTransformMatrix,
        PreviousParent,
    };
    pub use crate::compute::{compute_world_matrix, WorldMatrixHelper};
    pub use crate::error::{ComputeWorldMatrixError, WriteGroupError};
    pub use crate::hierarchy::{iter_descendants, DespawnedRelations};
    pub use crate::plugin::{
        HierarchyConfig, HierarchySystems, TransformHierarchyPlugin, DEFAULT_MAX_DEPTH,
    };
    pub use crate::timing::{HierarchyStats, SmoothedStat, DEFAULT_SMOOTHING_WINDOW};
    pub use crate::validation::{hierarchy_violations, HierarchyViolation};
    pub use crate::write_group::{
        WriteGroupAppExt, WriteGroupMask, WriteGroupProducer, WriteGroups,
    };
}
