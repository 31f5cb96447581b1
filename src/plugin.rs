//! The bevy plugin for transform hierarchies.

use bevy_app::prelude::*;
use bevy_ecs::prelude::*;
use bevy_reflect::prelude::*;

use crate::{
    components::{
        Child, LocalToWorld, LocalTransform, Parent, PostTransformMatrix, PreviousParent,
    },
    hierarchy::{self, DespawnedRelations},
    propagation,
    timing::{HierarchyStatsPlugin, DEFAULT_SMOOTHING_WINDOW},
    write_group::{WriteGroupAppExt, WriteGroupMask, WriteGroups},
};

/// The deepest a hierarchy may be before it is considered malformed, unless configured otherwise
/// with [`TransformHierarchyPlugin::with_max_depth`].
pub const DEFAULT_MAX_DEPTH: usize = 1024;

/// Add this plugin to your [`App`] to maintain [`Parent`]/[`Child`] relationships and compute
/// [`LocalToWorld`] matrices every tick.
pub struct TransformHierarchyPlugin {
    validate_hierarchy: bool,
    max_depth: usize,
    smoothing_window: usize,
}

impl TransformHierarchyPlugin {
    /// Create the plugin, and specify whether hierarchy validation should run after propagation.
    pub fn new(validate_hierarchy: bool) -> Self {
        Self {
            validate_hierarchy,
            max_depth: DEFAULT_MAX_DEPTH,
            smoothing_window: DEFAULT_SMOOTHING_WINDOW,
        }
    }

    /// Set the maximum hierarchy depth. Deeper hierarchies are treated as cyclic.
    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// Set how many ticks [`SmoothedStat<HierarchyStats>`](crate::timing::SmoothedStat) averages.
    pub fn with_smoothing_window(mut self, window: usize) -> Self {
        self.smoothing_window = window;
        self
    }
}

impl Default for TransformHierarchyPlugin {
    fn default() -> Self {
        Self::new(cfg!(debug_assertions))
    }
}

/// Runtime configuration of the hierarchy systems, inserted by [`TransformHierarchyPlugin`].
#[derive(Resource, Debug, Clone, Reflect)]
#[reflect(Resource)]
pub struct HierarchyConfig {
    /// The deepest a hierarchy may be. Walking past this depth is treated as a cycle.
    pub max_depth: usize,
}

impl Default for HierarchyConfig {
    fn default() -> Self {
        Self {
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }
}

#[allow(missing_docs)]
#[derive(Debug, Hash, PartialEq, Eq, Clone, SystemSet)]
pub enum HierarchySystems {
    Init,
    Maintain,
    Propagate,
}

impl Plugin for TransformHierarchyPlugin {
    fn build(&self, app: &mut App) {
        app.add_plugins(HierarchyStatsPlugin {
            smoothing_window: self.smoothing_window,
        });

        app.register_type::<Parent>()
            .register_type::<PreviousParent>()
            .register_type::<Child>()
            .register_type::<LocalTransform>()
            .register_type::<PostTransformMatrix>()
            .register_type::<LocalToWorld>()
            .register_type::<HierarchyConfig>()
            .insert_resource(HierarchyConfig {
                max_depth: self.max_depth,
            })
            .init_resource::<WriteGroups>()
            .init_resource::<WriteGroupMask<LocalToWorld>>()
            .init_resource::<DespawnedRelations>();

        // The default computation of `LocalToWorld` reads these, so they can never claim it.
        let reserved = app
            .reserve_write_group_input::<LocalToWorld, LocalTransform>()
            .and_then(|app| app.reserve_write_group_input::<LocalToWorld, PostTransformMatrix>())
            .and_then(|app| app.reserve_write_group_input::<LocalToWorld, Parent>());
        if let Err(error) = reserved {
            panic!("Invalid write group registration: {error}");
        }

        // Despawning strips every component at once, so the relationships have to be captured
        // before they are gone.
        let world = app.world_mut();
        world
            .register_component_hooks::<Child>()
            .on_despawn(hierarchy::record_despawned_parent);
        world
            .register_component_hooks::<PreviousParent>()
            .on_despawn(hierarchy::record_despawned_child);

        app.configure_sets(
            PostUpdate,
            (
                HierarchySystems::Init,
                HierarchySystems::Maintain,
                HierarchySystems::Propagate,
            )
                .chain(),
        )
        .add_systems(
            PostUpdate,
            (
                (
                    hierarchy::cleanup_deleted_parents,
                    hierarchy::cleanup_removed_parents,
                    hierarchy::stamp_new_parents,
                    hierarchy::reconcile_changed_parents,
                )
                    .chain()
                    .in_set(HierarchySystems::Maintain),
                (
                    WriteGroupMask::<LocalToWorld>::update,
                    propagation::propagate_roots,
                    propagation::propagate_descendants,
                )
                    .chain()
                    .in_set(HierarchySystems::Propagate),
            ),
        )
        .add_systems(
            PostUpdate,
            crate::validation::validate_hierarchy
                .after(HierarchySystems::Propagate)
                .run_if({
                    let run = self.validate_hierarchy;
                    move || run
                }),
        );
    }
}
