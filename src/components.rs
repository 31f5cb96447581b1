//! The component set of the transform hierarchy.
//!
//! Application code owns [`Parent`], [`LocalTransform`], and [`PostTransformMatrix`]. The
//! hierarchy maintenance systems own [`PreviousParent`] and [`Child`], and the propagation systems
//! own [`LocalToWorld`], except on entities claimed by a write group (see
//! [`crate::write_group`]).

use bevy_ecs::prelude::*;
use bevy_math::{Mat4, Quat, Vec3};
use bevy_reflect::prelude::*;

/// Points at the parent of this entity. The [`LocalTransform`] of this entity is then interpreted
/// relative to the [`LocalToWorld`] of the parent.
///
/// Add, remove, or repoint this component freely. The parent's [`Child`] list is updated the next
/// time [`HierarchySystems::Maintain`](crate::plugin::HierarchySystems::Maintain) runs. If the
/// parent entity no longer exists at that point, this component is removed again.
#[derive(Component, Debug, Clone, Copy, PartialEq, Eq, Reflect)]
#[reflect(Component, Debug, PartialEq)]
pub struct Parent(pub Entity);

impl Parent {
    /// The parent entity.
    #[inline]
    pub fn get(&self) -> Entity {
        self.0
    }
}

/// The value of [`Parent`] as of the last hierarchy maintenance pass, used to detect
/// reparenting. Present exactly when [`Parent`] is present, once maintenance has run.
#[derive(Component, Debug, Clone, Copy, PartialEq, Eq, Reflect)]
#[reflect(Component, Debug, PartialEq)]
pub struct PreviousParent(pub(crate) Entity);

impl PreviousParent {
    /// The parent this entity was attached to after the last maintenance pass.
    #[inline]
    pub fn get(&self) -> Entity {
        self.0
    }
}

impl Default for PreviousParent {
    fn default() -> Self {
        Self(Entity::PLACEHOLDER)
    }
}

/// The list of entities whose [`Parent`] points at this entity, ordered by entity id.
///
/// Created when the first child is adopted and removed when the last child leaves. Never empty,
/// never contains duplicates.
#[derive(Component, Debug, Clone, Default, PartialEq, Eq, Reflect)]
#[reflect(Component, Debug, PartialEq)]
pub struct Child(pub(crate) Vec<Entity>);

impl Child {
    /// The children, ordered by entity id.
    #[inline]
    pub fn as_slice(&self) -> &[Entity] {
        &self.0
    }

    /// Iterate over the children.
    #[inline]
    pub fn iter(&self) -> core::slice::Iter<'_, Entity> {
        self.0.iter()
    }

    /// Number of children.
    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// `true` if the list holds no children. Only observable between maintenance passes.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Does this list contain `entity`?
    #[inline]
    pub fn contains(&self, entity: Entity) -> bool {
        self.0.binary_search(&entity).is_ok()
    }

    /// Adds `entity`, keeping the list ordered by entity id so the result does not depend on the
    /// order in which parallel workers discovered the adoption.
    pub(crate) fn insert(&mut self, entity: Entity) {
        match self.0.binary_search(&entity) {
            Ok(_) => panic!("Malformed hierarchy: {entity} adopted twice by the same parent"),
            Err(index) => self.0.insert(index, entity),
        }
    }

    /// Removes `entity`, preserving the order of the remaining children. Returns `false` if the
    /// entity was not in the list.
    pub(crate) fn remove(&mut self, entity: Entity) -> bool {
        match self.0.binary_search(&entity) {
            Ok(index) => {
                self.0.remove(index);
                true
            }
            Err(_) => false,
        }
    }
}

impl FromIterator<Entity> for Child {
    fn from_iter<I: IntoIterator<Item = Entity>>(iter: I) -> Self {
        let mut children: Vec<Entity> = iter.into_iter().collect();
        children.sort_unstable();
        children.dedup();
        Self(children)
    }
}

impl<'a> IntoIterator for &'a Child {
    type Item = &'a Entity;
    type IntoIter = core::slice::Iter<'a, Entity>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl core::ops::Deref for Child {
    type Target = [Entity];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Position, rotation and uniform scale of an entity, relative to its [`Parent`] if it has one,
/// otherwise relative to world space.
#[derive(Component, Debug, Clone, Copy, PartialEq, Reflect)]
#[reflect(Component, Default, Debug, PartialEq)]
#[require(LocalToWorld)]
pub struct LocalTransform {
    /// Translation.
    pub translation: Vec3,
    /// Rotation.
    pub rotation: Quat,
    /// Uniform scale. Use a [`PostTransformMatrix`] for non-uniform scale or shear.
    pub scale: f32,
}

impl Default for LocalTransform {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl LocalTransform {
    /// No translation, no rotation, unit scale.
    pub const IDENTITY: Self = Self {
        translation: Vec3::ZERO,
        rotation: Quat::IDENTITY,
        scale: 1.0,
    };

    /// A pure translation.
    #[inline]
    pub const fn from_xyz(x: f32, y: f32, z: f32) -> Self {
        Self::from_translation(Vec3::new(x, y, z))
    }

    /// A pure translation.
    #[inline]
    pub const fn from_translation(translation: Vec3) -> Self {
        Self {
            translation,
            ..Self::IDENTITY
        }
    }

    /// A pure rotation.
    #[inline]
    pub const fn from_rotation(rotation: Quat) -> Self {
        Self {
            rotation,
            ..Self::IDENTITY
        }
    }

    /// A pure uniform scale.
    #[inline]
    pub const fn from_scale(scale: f32) -> Self {
        Self {
            scale,
            ..Self::IDENTITY
        }
    }

    /// Replace the translation.
    #[inline]
    #[must_use]
    pub const fn with_translation(mut self, translation: Vec3) -> Self {
        self.translation = translation;
        self
    }

    /// Replace the rotation.
    #[inline]
    #[must_use]
    pub const fn with_rotation(mut self, rotation: Quat) -> Self {
        self.rotation = rotation;
        self
    }

    /// Replace the scale.
    #[inline]
    #[must_use]
    pub const fn with_scale(mut self, scale: f32) -> Self {
        self.scale = scale;
        self
    }

    /// The affine matrix applying scale, then rotation, then translation.
    #[inline]
    pub fn to_matrix(&self) -> Mat4 {
        Mat4::from_scale_rotation_translation(
            Vec3::splat(self.scale),
            self.rotation,
            self.translation,
        )
    }

    /// Transform a point from this local space into the parent space.
    #[inline]
    pub fn transform_point(&self, point: Vec3) -> Vec3 {
        self.rotation * (point * self.scale) + self.translation
    }

    /// Combine with a transform expressed in the local space of `self`. Equivalent to multiplying
    /// the matrices `self.to_matrix() * child.to_matrix()`, without leaving the TRS form.
    #[inline]
    #[must_use]
    pub fn mul_transform(&self, child: &Self) -> Self {
        Self {
            translation: self.transform_point(child.translation),
            rotation: self.rotation * child.rotation,
            scale: self.scale * child.scale,
        }
    }
}

/// An extra matrix applied after the [`LocalTransform`], e.g. for non-uniform scale or shear.
/// Written by application code, only read by the engine.
#[derive(Component, Debug, Clone, Copy, PartialEq, Reflect)]
#[reflect(Component, Default, Debug, PartialEq)]
pub struct PostTransformMatrix(pub Mat4);

impl Default for PostTransformMatrix {
    fn default() -> Self {
        Self(Mat4::IDENTITY)
    }
}

/// The cached world-space matrix of an entity.
///
/// Only valid after [`HierarchySystems::Propagate`](crate::plugin::HierarchySystems::Propagate)
/// has run for the current tick. Use [`compute_world_matrix`](crate::compute::compute_world_matrix)
/// when an up-to-the-moment value is needed.
#[derive(Component, Debug, Clone, Copy, PartialEq, Reflect)]
#[reflect(Component, Default, Debug, PartialEq)]
pub struct LocalToWorld(pub Mat4);

impl Default for LocalToWorld {
    fn default() -> Self {
        Self(Mat4::IDENTITY)
    }
}

impl LocalToWorld {
    /// The world matrix.
    #[inline]
    pub fn matrix(&self) -> Mat4 {
        self.0
    }

    /// World-space position.
    #[inline]
    pub fn translation(&self) -> Vec3 {
        self.0.w_axis.truncate()
    }

    /// World-space rotation, extracted from the matrix.
    #[inline]
    pub fn rotation(&self) -> Quat {
        self.0.to_scale_rotation_translation().1
    }

    /// World-space scale along each axis, extracted from the matrix.
    #[inline]
    pub fn scale(&self) -> Vec3 {
        self.0.to_scale_rotation_translation().0
    }

    /// Local +X in world space, normalized.
    #[inline]
    pub fn right(&self) -> Vec3 {
        self.0.x_axis.truncate().normalize()
    }

    /// Local +Y in world space, normalized.
    #[inline]
    pub fn up(&self) -> Vec3 {
        self.0.y_axis.truncate().normalize()
    }

    /// Local -Z in world space, normalized.
    #[inline]
    pub fn forward(&self) -> Vec3 {
        -self.0.z_axis.truncate().normalize()
    }

    /// Transform a point from the entity's local space into world space.
    #[inline]
    pub fn transform_point(&self, point: Vec3) -> Vec3 {
        self.0.transform_point3(point)
    }
}

/// The matrix an entity contributes to its own world matrix: the local transform followed by the
/// optional post-transform matrix.
///
/// Every world matrix in this crate is built as `parent_world * local_matrix(..)`, in this exact
/// association, so cached and on-demand results agree bit for bit.
#[inline]
pub fn local_matrix(local: &LocalTransform, post: Option<&PostTransformMatrix>) -> Mat4 {
    match post {
        Some(post) => local.to_matrix() * post.0,
        None => local.to_matrix(),
    }
}
