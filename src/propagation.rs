//! Propagates [`LocalTransform`]s through the hierarchy into [`LocalToWorld`] matrices.
//!
//! Runs in two phases, after hierarchy maintenance has made [`Parent`] and [`Child`] consistent:
//!
//! - [`propagate_roots`] recomputes the world matrix of every root whose inputs changed.
//! - [`propagate_descendants`] walks each root's subtree depth-first, carrying the parent matrix
//!   and a dirty flag, and only writes where something upstream, or the entity itself, changed.
//!
//! Entities claimed by a write group (see [`crate::write_group`]) are never written. Their
//! existing matrix is used as the parent matrix for their children, and the children are marked
//! dirty whenever the external producer changed it.

use core::sync::atomic::{AtomicUsize, Ordering};

use bevy_ecs::{entity::Entities, prelude::*};
use bevy_math::Mat4;
use bevy_platform::time::Instant;

use crate::{
    components::{local_matrix, Child, LocalToWorld, LocalTransform, Parent, PostTransformMatrix},
    plugin::HierarchyConfig,
    timing::HierarchyStats,
    write_group::WriteGroupMask,
};

/// Recompute [`LocalToWorld`] for hierarchy roots whose [`LocalTransform`] or
/// [`PostTransformMatrix`] changed, that just became roots, or that were just released from a
/// write group. Unchanged roots are skipped entirely.
pub fn propagate_roots(
    mut stats: ResMut<HierarchyStats>,
    mut mask: ResMut<WriteGroupMask<LocalToWorld>>,
    entities: &Entities,
    mut roots: Query<
        (
            Entity,
            Ref<LocalTransform>,
            Option<Ref<PostTransformMatrix>>,
            &mut LocalToWorld,
        ),
        Without<Parent>,
    >,
    mut orphaned: RemovedComponents<Parent>,
    mut unposted: RemovedComponents<PostTransformMatrix>,
    mut forced: Local<Vec<Entity>>,
    mut claimed: Local<bevy_utils::Parallel<Vec<Entity>>>,
) {
    let start = Instant::now();
    forced.clear();
    forced.extend(orphaned.read());
    forced.extend(unposted.read());
    forced.sort_unstable();

    let writes = AtomicUsize::new(0);
    {
        let (mask, forced, claimed) = (&*mask, &*forced, &*claimed);
        roots
            .par_iter_mut()
            .for_each(|(entity, local, post, mut world)| {
                if mask.is_claimed(entities, entity) {
                    claimed.scope(|claimed| claimed.push(entity));
                    return;
                }
                let changed = local.is_changed()
                    || post.as_ref().is_some_and(DetectChanges::is_changed)
                    || world.is_added()
                    || forced.binary_search(&entity).is_ok()
                    || mask.was_claimed(entity);
                if changed {
                    world.0 = local_matrix(&local, post.as_deref());
                    writes.fetch_add(1, Ordering::Relaxed);
                }
            });
    }
    mask.record_claimed(claimed.drain());

    stats.world_matrix_writes += writes.into_inner();
    stats.propagation += start.elapsed();
}

/// A node waiting on the explicit traversal stack of [`propagate_descendants`].
#[derive(Clone, Copy)]
struct PendingNode {
    entity: Entity,
    parent: Entity,
    parent_matrix: Mat4,
    dirty: bool,
    depth: usize,
}

/// Recompute [`LocalToWorld`] for every descendant of a root whose inputs, or whose ancestors'
/// world matrices, changed.
///
/// Each root's subtree is walked end-to-end by a single worker with an explicit stack; different
/// roots run in parallel. No entity is reachable from two roots, because every child is checked
/// against its [`Parent`] before it is touched.
///
/// # Panics
///
/// If a child listed in a [`Child`] component does not point back at the parent it was reached
/// from, or if the hierarchy is deeper than [`HierarchyConfig::max_depth`]. Both mean the
/// hierarchy is malformed, most likely because it contains a cycle.
pub fn propagate_descendants(
    mut stats: ResMut<HierarchyStats>,
    mut mask: ResMut<WriteGroupMask<LocalToWorld>>,
    config: Res<HierarchyConfig>,
    entities: &Entities,
    roots: Query<(Entity, Ref<LocalToWorld>, &Child), (With<LocalTransform>, Without<Parent>)>,
    parents: Query<&Parent>,
    nodes: Query<(
        Ref<LocalTransform>,
        Option<Ref<PostTransformMatrix>>,
        Ref<Parent>,
        &mut LocalToWorld,
        Option<&Child>,
    )>,
    mut unposted: RemovedComponents<PostTransformMatrix>,
    mut unposted_entities: Local<Vec<Entity>>,
    mut claimed: Local<bevy_utils::Parallel<Vec<Entity>>>,
) {
    let start = Instant::now();
    unposted_entities.clear();
    unposted_entities.extend(unposted.read());
    unposted_entities.sort_unstable();

    let writes = AtomicUsize::new(0);
    {
        let (mask, unposted, claimed, parents, nodes, writes) =
            (&*mask, &*unposted_entities, &*claimed, &parents, &nodes, &writes);
        let max_depth = config.max_depth;
        roots.par_iter().for_each_init(
            Vec::<PendingNode>::new,
            |stack, (root, root_world, children)| {
                let dirty = root_world.is_changed();
                stack.extend(children.iter().rev().map(|&child| PendingNode {
                    entity: child,
                    parent: root,
                    parent_matrix: root_world.0,
                    dirty,
                    depth: 1,
                }));

                while let Some(node) = stack.pop() {
                    assert!(
                        node.depth <= max_depth,
                        "Malformed hierarchy: {} is deeper than {max_depth}, \
                        the hierarchy probably contains a cycle",
                        node.entity
                    );

                    let Ok(parent) = parents.get(node.entity) else {
                        continue;
                    };
                    assert_eq!(
                        parent.get(),
                        node.parent,
                        "Malformed hierarchy. This probably means that your hierarchy has been \
                        improperly maintained, or contains a cycle"
                    );

                    // SAFETY: Each root is visited by exactly one worker, and the assertion above
                    // ensures a node is only fetched through the parent its `Parent` points at, so
                    // the subtrees of different roots are disjoint and no node is fetched twice.
                    // This is the only place `nodes` is fetched mutably.
                    #[expect(
                        unsafe_code,
                        reason = "Mutable access to disjoint subtrees from parallel workers \
                        requires `Query::get_unchecked()`."
                    )]
                    let Ok((local, post, parent, mut world, children)) =
                        (unsafe { nodes.get_unchecked(node.entity) })
                    else {
                        continue;
                    };

                    let entity = node.entity;
                    let (matrix, dirty) = if mask.is_claimed(entities, entity) {
                        claimed.scope(|claimed| claimed.push(entity));
                        (world.0, world.is_changed())
                    } else {
                        let dirty = node.dirty
                            || local.is_changed()
                            || post.as_ref().is_some_and(DetectChanges::is_changed)
                            || parent.is_changed()
                            || world.is_added()
                            || unposted.binary_search(&entity).is_ok()
                            || mask.was_claimed(entity);
                        if dirty {
                            world.0 = node.parent_matrix * local_matrix(&local, post.as_deref());
                            writes.fetch_add(1, Ordering::Relaxed);
                        }
                        (world.0, dirty)
                    };

                    let Some(children) = children else {
                        continue;
                    };
                    stack.extend(children.iter().rev().map(|&child| PendingNode {
                        entity: child,
                        parent: entity,
                        parent_matrix: matrix,
                        dirty,
                        depth: node.depth + 1,
                    }));
                }
            },
        );
    }
    mask.record_claimed(claimed.drain());

    stats.world_matrix_writes += writes.into_inner();
    stats.propagation += start.elapsed();
}

#[cfg(test)]
mod tests {
    use bevy_app::prelude::*;
    use bevy_ecs::prelude::*;
    use bevy_math::{Mat4, Quat, Vec3};

    use crate::prelude::*;

    fn app() -> App {
        let mut app = App::new();
        app.add_plugins(TransformHierarchyPlugin::new(false));
        app
    }

    fn world_matrix(app: &App, entity: Entity) -> Mat4 {
        app.world().get::<LocalToWorld>(entity).unwrap().0
    }

    fn writes(app: &App) -> usize {
        app.world().resource::<HierarchyStats>().world_matrix_writes()
    }

    #[test]
    fn unchanged_hierarchy_performs_no_writes() {
        let mut app = app();
        let root = app
            .world_mut()
            .spawn(LocalTransform::from_xyz(1.0, 0.0, 0.0))
            .id();
        let child = app
            .world_mut()
            .spawn((LocalTransform::from_xyz(0.0, 1.0, 0.0), Parent(root)))
            .id();
        app.world_mut()
            .spawn((LocalTransform::from_xyz(0.0, 0.0, 1.0), Parent(child)));

        app.update();
        assert_eq!(writes(&app), 3);
        let before: Vec<Mat4> = [root, child].map(|e| world_matrix(&app, e)).to_vec();

        app.update();
        assert_eq!(writes(&app), 0);
        let after: Vec<Mat4> = [root, child].map(|e| world_matrix(&app, e)).to_vec();
        assert_eq!(before, after);
    }

    #[test]
    fn only_changed_subtree_is_recomputed() {
        let mut app = app();
        let root = app.world_mut().spawn(LocalTransform::IDENTITY).id();
        let left = app
            .world_mut()
            .spawn((LocalTransform::from_xyz(-1.0, 0.0, 0.0), Parent(root)))
            .id();
        let left_leaf = app
            .world_mut()
            .spawn((LocalTransform::from_xyz(0.0, -1.0, 0.0), Parent(left)))
            .id();
        let right = app
            .world_mut()
            .spawn((LocalTransform::from_xyz(1.0, 0.0, 0.0), Parent(root)))
            .id();
        app.update();

        app.world_mut()
            .get_mut::<LocalTransform>(left)
            .unwrap()
            .translation = Vec3::new(-2.0, 0.0, 0.0);
        app.update();

        assert_eq!(writes(&app), 2);
        assert_eq!(
            world_matrix(&app, left_leaf),
            Mat4::from_translation(Vec3::new(-2.0, -1.0, 0.0))
        );
        assert_eq!(
            world_matrix(&app, right),
            Mat4::from_translation(Vec3::new(1.0, 0.0, 0.0))
        );
    }

    #[test]
    fn root_change_reaches_every_descendant() {
        let mut app = app();
        let root = app.world_mut().spawn(LocalTransform::IDENTITY).id();
        let mut parent = root;
        let mut chain = Vec::new();
        for _ in 0..8 {
            parent = app
                .world_mut()
                .spawn((LocalTransform::from_xyz(0.0, 1.0, 0.0), Parent(parent)))
                .id();
            chain.push(parent);
        }
        app.update();

        app.world_mut()
            .get_mut::<LocalTransform>(root)
            .unwrap()
            .rotation = Quat::from_rotation_z(core::f32::consts::FRAC_PI_2);
        app.update();

        assert_eq!(writes(&app), 9);
        let tip = app.world().get::<LocalToWorld>(*chain.last().unwrap()).unwrap();
        assert!(tip
            .translation()
            .abs_diff_eq(Vec3::new(-8.0, 0.0, 0.0), 1e-4));
    }

    #[test]
    fn post_transform_matrix_is_composed() {
        let mut app = app();
        let root = app
            .world_mut()
            .spawn((
                LocalTransform::from_xyz(1.0, 0.0, 0.0),
                PostTransformMatrix(Mat4::from_scale(Vec3::new(2.0, 1.0, 1.0))),
            ))
            .id();
        let child = app
            .world_mut()
            .spawn((LocalTransform::from_xyz(1.0, 0.0, 0.0), Parent(root)))
            .id();
        app.update();

        assert_eq!(
            app.world().get::<LocalToWorld>(child).unwrap().translation(),
            Vec3::new(3.0, 0.0, 0.0)
        );

        app.world_mut()
            .entity_mut(root)
            .remove::<PostTransformMatrix>();
        app.update();

        assert_eq!(
            app.world().get::<LocalToWorld>(child).unwrap().translation(),
            Vec3::new(2.0, 0.0, 0.0)
        );
    }

    #[test]
    fn detached_child_becomes_root() {
        let mut app = app();
        let root = app
            .world_mut()
            .spawn(LocalTransform::from_xyz(1.0, 0.0, 0.0))
            .id();
        let child = app
            .world_mut()
            .spawn((LocalTransform::from_xyz(0.0, 1.0, 0.0), Parent(root)))
            .id();
        app.update();
        assert_eq!(
            world_matrix(&app, child),
            Mat4::from_translation(Vec3::new(1.0, 1.0, 0.0))
        );

        app.world_mut().entity_mut(child).remove::<Parent>();
        app.update();
        assert_eq!(
            world_matrix(&app, child),
            Mat4::from_translation(Vec3::new(0.0, 1.0, 0.0))
        );
    }

    #[test]
    fn reparented_child_follows_new_parent() {
        let mut app = app();
        let a = app
            .world_mut()
            .spawn(LocalTransform::from_xyz(10.0, 0.0, 0.0))
            .id();
        let b = app
            .world_mut()
            .spawn(LocalTransform::from_xyz(0.0, 10.0, 0.0))
            .id();
        let child = app
            .world_mut()
            .spawn((LocalTransform::from_xyz(0.0, 0.0, 1.0), Parent(a)))
            .id();
        app.update();

        app.world_mut().entity_mut(child).insert(Parent(b));
        app.update();
        assert_eq!(
            world_matrix(&app, child),
            Mat4::from_translation(Vec3::new(0.0, 10.0, 1.0))
        );
    }

    #[test]
    #[should_panic(expected = "Malformed hierarchy")]
    fn child_listed_under_wrong_parent_is_fatal() {
        let mut app = app();
        let a = app.world_mut().spawn(LocalTransform::IDENTITY).id();
        let b = app.world_mut().spawn(LocalTransform::IDENTITY).id();
        let child = app
            .world_mut()
            .spawn((LocalTransform::IDENTITY, Parent(a)))
            .id();
        app.update();

        // `b` lists the child, but the child points at `a`.
        app.world_mut()
            .entity_mut(b)
            .insert(Child::from_iter([child]));
        app.update();
    }
}
