use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use entity_store::{Bundle, World};

const ENTITIES: usize = 10_000;

#[derive(Default, Clone, Copy)]
struct Position {
    x: f32,
    y: f32,
    z: f32,
}

#[derive(Default, Clone, Copy)]
struct Velocity {
    x: f32,
    y: f32,
    z: f32,
}

#[derive(Default, Clone, Copy)]
struct Frozen;

#[derive(Bundle)]
struct Body {
    position: Position,
    velocity: Velocity,
}

fn populated() -> World {
    let mut world = World::new();
    for _ in 0..ENTITIES {
        world.spawn(Body {
            position: Position::default(),
            velocity: Velocity {
                x: 1.0,
                y: 0.5,
                z: 0.25,
            },
        });
    }
    world
}

fn spawn_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("spawn");

    group.bench_function("bundle", |b| {
        b.iter(|| black_box(populated()));
    });

    group.bench_function("add_component", |b| {
        b.iter(|| {
            let mut world = World::new();
            for _ in 0..ENTITIES {
                let e = world.create_entity();
                world.add_component::<Position>(e);
                world.add_component::<Velocity>(e);
            }
            black_box(world)
        });
    });

    group.finish();
}

fn migrate_benchmark(c: &mut Criterion) {
    c.bench_function("migrate_add_remove", |b| {
        b.iter_batched(
            || {
                let world = populated();
                let entities: Vec<_> = world.entities().collect();
                (world, entities)
            },
            |(mut world, entities)| {
                for &e in &entities {
                    world.insert_component(e, Frozen);
                }
                for &e in &entities {
                    black_box(world.remove_component::<Frozen>(e));
                }
                world
            },
            BatchSize::LargeInput,
        );
    });
}

fn iterate_benchmark(c: &mut Criterion) {
    let mut world = populated();
    let ids = [
        world.component_id::<Position>().unwrap(),
        world.component_id::<Velocity>().unwrap(),
    ];

    c.bench_function("iterate_chunks", |b| {
        b.iter(|| {
            for mut chunk in world.query_chunks_mut(&ids) {
                if let Some((positions, velocities)) = chunk.column_pair_mut::<Position, Velocity>() {
                    for (p, v) in positions.iter_mut().zip(velocities.iter()) {
                        p.x += v.x;
                        p.y += v.y;
                        p.z += v.z;
                    }
                }
            }
        });
    });

    c.bench_function("for_each_mut", |b| {
        b.iter(|| world.for_each_mut::<Position>(|_, p| p.x *= 0.5));
    });
}

criterion_group!(benches, spawn_benchmark, migrate_benchmark, iterate_benchmark);
criterion_main!(benches);
