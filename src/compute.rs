//! On-demand world matrix computation, independent of the propagation systems.
//!
//! Cached [`LocalToWorld`] values are only as fresh as the last propagation run. These functions
//! walk from an entity up to its root and compose the chain directly, using the exact same
//! composition order as propagation, so the result is bit-identical to what propagation would
//! store for the same inputs.

use bevy_ecs::{prelude::*, system::SystemParam};
use bevy_math::Mat4;
use smallvec::SmallVec;

use crate::{
    components::{local_matrix, LocalToWorld, LocalTransform, Parent, PostTransformMatrix},
    error::ComputeWorldMatrixError,
    plugin::{HierarchyConfig, DEFAULT_MAX_DEPTH},
};

/// Walk from `entity` to its root, collecting each local matrix, then compose them root first.
///
/// Fails with [`ComputeWorldMatrixError::MissingLocalTransform`] naming the first entity in the
/// chain that does not exist or has no [`LocalTransform`], including a despawned ancestor.
fn compose_chain<'a>(
    entity: Entity,
    max_depth: usize,
    mut lookup: impl FnMut(
        Entity,
    ) -> Option<(
        Option<&'a LocalTransform>,
        Option<&'a PostTransformMatrix>,
        Option<&'a Parent>,
    )>,
) -> Result<Mat4, ComputeWorldMatrixError> {
    let mut chain = SmallVec::<[Mat4; 16]>::new();
    let mut next = Some(entity);
    while let Some(current) = next {
        let Some((Some(local), post, parent)) = lookup(current) else {
            return Err(ComputeWorldMatrixError::MissingLocalTransform { entity: current });
        };
        if chain.len() > max_depth {
            return Err(ComputeWorldMatrixError::DepthExceeded { entity, max_depth });
        }
        chain.push(local_matrix(local, post));
        next = parent.map(Parent::get);
    }

    let mut chain = chain.into_iter().rev();
    let root = chain.next().unwrap_or(Mat4::IDENTITY);
    Ok(chain.fold(root, |parent, local| parent * local))
}

/// Compute the world matrix of `entity` from the current [`LocalTransform`]s of it and its
/// ancestors, without reading or writing any [`LocalToWorld`].
///
/// Uses [`DEFAULT_MAX_DEPTH`] as the bound on chain length, or the configured
/// [`HierarchyConfig::max_depth`] when the hierarchy plugin is installed.
pub fn compute_world_matrix(
    world: &World,
    entity: Entity,
) -> Result<Mat4, ComputeWorldMatrixError> {
    let max_depth = world
        .get_resource::<HierarchyConfig>()
        .map_or(DEFAULT_MAX_DEPTH, |config| config.max_depth);
    compose_chain(entity, max_depth, |current| {
        let entity = world.get_entity(current).ok()?;
        Some((
            entity.get::<LocalTransform>(),
            entity.get::<PostTransformMatrix>(),
            entity.get::<Parent>(),
        ))
    })
}

/// A system param for computing up-to-date world matrices from inside a system.
#[derive(SystemParam)]
pub struct WorldMatrixHelper<'w, 's> {
    config: Res<'w, HierarchyConfig>,
    nodes: Query<
        'w,
        's,
        (
            Option<&'static LocalTransform>,
            Option<&'static PostTransformMatrix>,
            Option<&'static Parent>,
        ),
    >,
}

impl WorldMatrixHelper<'_, '_> {
    /// See [`compute_world_matrix`].
    pub fn compute_world_matrix(&self, entity: Entity) -> Result<Mat4, ComputeWorldMatrixError> {
        compose_chain(entity, self.config.max_depth, |current| {
            self.nodes.get(current).ok()
        })
    }

    /// Like [`Self::compute_world_matrix`], but returns a [`LocalToWorld`].
    pub fn compute_local_to_world(
        &self,
        entity: Entity,
    ) -> Result<LocalToWorld, ComputeWorldMatrixError> {
        self.compute_world_matrix(entity).map(LocalToWorld)
    }
}
