use bevy_app::prelude::*;
use bevy_ecs::prelude::*;
use bevy_math::{Mat4, Quat, Vec3};
use turborand::prelude::*;

use crate::prelude::*;

#[derive(Component)]
struct Animated;

impl WriteGroupProducer for Animated {
    type Target = LocalToWorld;
}

fn app() -> App {
    let mut app = App::new();
    app.add_plugins(TransformHierarchyPlugin::new(false))
        .register_write_group::<Animated>();
    app
}

fn world_matrix(app: &App, entity: Entity) -> Mat4 {
    app.world().get::<LocalToWorld>(entity).unwrap().0
}

#[test]
fn child_composes_with_root() {
    let mut app = app();
    let a = app
        .world_mut()
        .spawn(LocalTransform::from_xyz(1.0, 0.0, 0.0))
        .id();
    let b = app
        .world_mut()
        .spawn((LocalTransform::from_xyz(0.0, 1.0, 0.0), Parent(a)))
        .id();
    app.update();

    assert_eq!(
        world_matrix(&app, a),
        Mat4::from_translation(Vec3::new(1.0, 0.0, 0.0))
    );
    assert_eq!(
        world_matrix(&app, b),
        Mat4::from_translation(Vec3::new(1.0, 1.0, 0.0))
    );
}

#[test]
fn removing_parent_turns_child_into_root() {
    let mut app = app();
    let a = app
        .world_mut()
        .spawn(LocalTransform::from_xyz(1.0, 0.0, 0.0))
        .id();
    let b = app
        .world_mut()
        .spawn((LocalTransform::from_xyz(0.0, 1.0, 0.0), Parent(a)))
        .id();
    app.update();

    app.world_mut().entity_mut(b).remove::<Parent>();
    app.update();

    let world = app.world();
    assert!(world
        .get::<Child>(a)
        .is_none_or(|children| !children.contains(b)));
    assert!(world.get::<PreviousParent>(b).is_none());
    assert_eq!(
        world_matrix(&app, b),
        Mat4::from_translation(Vec3::new(0.0, 1.0, 0.0))
    );
}

#[test]
fn despawning_parent_orphans_children() {
    let mut app = app();
    let a = app
        .world_mut()
        .spawn(LocalTransform::from_xyz(1.0, 0.0, 0.0))
        .id();
    let c = app
        .world_mut()
        .spawn((LocalTransform::from_xyz(0.0, 0.0, 1.0), Parent(a)))
        .id();
    app.update();

    app.world_mut().despawn(a);
    app.update();

    let world = app.world();
    assert!(world.get::<Parent>(c).is_none());
    assert!(world.get::<PreviousParent>(c).is_none());
    assert!(world.get_entity(a).is_err());
    assert!(world.resource::<DespawnedRelations>().is_empty());
    assert_eq!(
        world_matrix(&app, c),
        Mat4::from_translation(Vec3::new(0.0, 0.0, 1.0))
    );
}

#[test]
fn claimed_matrix_feeds_children() {
    let mut app = app();
    let m = Mat4::from_scale_rotation_translation(
        Vec3::splat(2.0),
        Quat::from_rotation_z(0.5),
        Vec3::new(7.0, -3.0, 1.0),
    );
    let a = app
        .world_mut()
        .spawn(LocalTransform::from_xyz(1.0, 0.0, 0.0))
        .id();
    let d = app
        .world_mut()
        .spawn((
            LocalTransform::from_xyz(0.0, 5.0, 0.0),
            LocalToWorld(m),
            Animated,
            Parent(a),
        ))
        .id();
    let e_local =
        LocalTransform::from_xyz(0.0, 0.0, 2.0).with_rotation(Quat::from_rotation_x(0.3));
    let e = app.world_mut().spawn((e_local, Parent(d))).id();
    app.update();

    assert!(app.world().get::<Child>(a).unwrap().contains(d));
    assert_eq!(world_matrix(&app, d), m);
    assert_eq!(world_matrix(&app, e), m * e_local.to_matrix());

    // Moving the parent must not touch the claimed matrix.
    app.world_mut()
        .get_mut::<LocalTransform>(a)
        .unwrap()
        .translation = Vec3::new(100.0, 0.0, 0.0);
    app.update();
    assert_eq!(world_matrix(&app, d), m);
    assert_eq!(world_matrix(&app, e), m * e_local.to_matrix());

    // The external producer moves the claimed entity, and its children follow.
    let moved = Mat4::from_translation(Vec3::new(-1.0, -1.0, -1.0));
    app.world_mut().get_mut::<LocalToWorld>(d).unwrap().0 = moved;
    app.update();
    assert_eq!(world_matrix(&app, d), moved);
    assert_eq!(world_matrix(&app, e), moved * e_local.to_matrix());
}

#[test]
fn claimed_root_feeds_children() {
    let mut app = app();
    let m = Mat4::from_translation(Vec3::new(0.0, 0.0, 9.0));
    let root = app
        .world_mut()
        .spawn((LocalTransform::IDENTITY, LocalToWorld(m), Animated))
        .id();
    let child = app
        .world_mut()
        .spawn((LocalTransform::from_xyz(1.0, 0.0, 0.0), Parent(root)))
        .id();
    app.update();

    assert_eq!(world_matrix(&app, root), m);
    assert_eq!(
        world_matrix(&app, child),
        Mat4::from_translation(Vec3::new(1.0, 0.0, 9.0))
    );
}

#[test]
fn releasing_claim_restores_default_propagation() {
    let mut app = app();
    let a = app
        .world_mut()
        .spawn(LocalTransform::from_xyz(1.0, 0.0, 0.0))
        .id();
    let d = app
        .world_mut()
        .spawn((
            LocalTransform::from_xyz(0.0, 1.0, 0.0),
            LocalToWorld(Mat4::from_translation(Vec3::splat(50.0))),
            Animated,
            Parent(a),
        ))
        .id();
    let e = app
        .world_mut()
        .spawn((LocalTransform::from_xyz(0.0, 0.0, 1.0), Parent(d)))
        .id();
    app.update();
    assert_eq!(
        world_matrix(&app, e),
        Mat4::from_translation(Vec3::new(50.0, 50.0, 51.0))
    );

    // None of the inputs change, only the claim goes away.
    app.world_mut().entity_mut(d).remove::<Animated>();
    app.update();

    assert_eq!(
        world_matrix(&app, d),
        Mat4::from_translation(Vec3::new(1.0, 1.0, 0.0))
    );
    assert_eq!(
        world_matrix(&app, e),
        Mat4::from_translation(Vec3::new(1.0, 1.0, 1.0))
    );
}

#[test]
fn second_update_is_idempotent() {
    let mut app = app();
    let entities = spawn_random_forest(&mut app, &Rng::with_seed(3), 200);
    app.update();
    let first: Vec<Mat4> = entities.iter().map(|&e| world_matrix(&app, e)).collect();

    app.update();
    let second: Vec<Mat4> = entities.iter().map(|&e| world_matrix(&app, e)).collect();

    let stats = app.world().resource::<HierarchyStats>();
    assert_eq!(stats.world_matrix_writes(), 0);
    assert_eq!(stats.reparented(), 0);
    assert_eq!(first, second);
}

#[test]
fn cached_matrices_match_recomputation_under_churn() {
    let mut app = app();
    let rng = Rng::with_seed(11);
    let mut entities = spawn_random_forest(&mut app, &rng, 300);
    app.update();

    for _ in 0..20 {
        for _ in 0..15 {
            let index = rng.usize(0..entities.len());
            let entity = entities[index];
            let mut entity_mut = app.world_mut().entity_mut(entity);
            match rng.usize(0..5) {
                0 => {
                    entity_mut.get_mut::<LocalTransform>().unwrap().translation +=
                        Vec3::new(rng.f32(), rng.f32(), rng.f32());
                }
                1 => {
                    entity_mut.remove::<Parent>();
                }
                2 if index > 0 => {
                    // Only point at lower indices, so no cycles are introduced.
                    let parent = entities[rng.usize(0..index)];
                    entity_mut.insert(Parent(parent));
                }
                3 => {
                    entity_mut.insert(PostTransformMatrix(Mat4::from_scale(Vec3::new(
                        1.0,
                        1.0 + rng.f32(),
                        1.0,
                    ))));
                }
                4 if entities.len() > 10 => {
                    entity_mut.despawn();
                    entities.remove(index);
                }
                _ => {}
            }
        }
        app.update();

        assert_eq!(hierarchy_violations(app.world_mut()), Vec::new());
        for &entity in &entities {
            let expected = compute_world_matrix(app.world(), entity).unwrap();
            assert_eq!(world_matrix(&app, entity), expected, "{entity}");
        }
    }
}

#[test]
fn reparenting_round_trip_restores_child_lists() {
    let mut app = app();
    let rng = Rng::with_seed(5);
    let entities = spawn_random_forest(&mut app, &rng, 100);
    app.update();

    let snapshot = |app: &mut App| -> Vec<(Entity, Vec<Entity>)> {
        let mut lists: Vec<_> = app
            .world_mut()
            .query::<(Entity, &Child)>()
            .iter(app.world())
            .map(|(entity, children)| (entity, children.to_vec()))
            .collect();
        lists.sort_unstable_by_key(|(entity, _)| *entity);
        lists
    };
    let before = snapshot(&mut app);

    let moved: Vec<(Entity, Option<Entity>)> = entities
        .iter()
        .skip(1)
        .step_by(7)
        .map(|&entity| (entity, app.world().get::<Parent>(entity).map(Parent::get)))
        .collect();
    for &(entity, _) in &moved {
        app.world_mut().entity_mut(entity).insert(Parent(entities[0]));
    }
    app.update();
    for &(entity, original) in &moved {
        let mut entity_mut = app.world_mut().entity_mut(entity);
        match original {
            Some(parent) => entity_mut.insert(Parent(parent)),
            None => entity_mut.remove::<Parent>(),
        };
    }
    app.update();

    assert_eq!(snapshot(&mut app), before);
}

#[test]
#[should_panic(expected = "Malformed hierarchy")]
fn hierarchy_deeper_than_limit_is_fatal() {
    let mut app = App::new();
    app.add_plugins(TransformHierarchyPlugin::new(false).with_max_depth(4));
    let mut parent = app.world_mut().spawn(LocalTransform::IDENTITY).id();
    for _ in 0..5 {
        parent = app
            .world_mut()
            .spawn((LocalTransform::IDENTITY, Parent(parent)))
            .id();
    }
    app.update();
}

/// Spawn `count` entities with random local transforms. Each one picks a random earlier entity as
/// its parent, or stays a root.
fn spawn_random_forest(app: &mut App, rng: &Rng, count: usize) -> Vec<Entity> {
    let mut entities = Vec::with_capacity(count);
    for index in 0..count {
        let local =
            LocalTransform::from_xyz(rng.f32() * 10.0, rng.f32() * 10.0, rng.f32() * 10.0)
                .with_rotation(Quat::from_rotation_y(rng.f32()))
                .with_scale(0.5 + rng.f32());
        let mut entity = app.world_mut().spawn(local);
        if index > 0 && rng.usize(0..4) != 0 {
            entity.insert(Parent(entities[rng.usize(0..index)]));
        }
        entities.push(entity.id());
    }
    entities
}
