//! Dispatch benchmarks for lockstep_core.
//!
//! Run with: `cargo bench -p lockstep_core`

// Benchmark binaries don't need docs on macro-generated functions
#![allow(missing_docs)]

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use lockstep_core::dispatcher::assign_ring_cells;
use lockstep_core::prelude::*;
use lockstep_test_utils::fixtures::{skirmish_context, unit_ids};

fn crowded_world() -> World {
    let mut world = World::new(MapGrid::new(128, 128), 1);
    for y in 0..8 {
        for x in 0..8 {
            world.spawn_movable(0, MovableType::Swordsman, GridPos::new(x, y));
        }
    }
    world
}

/// Ring assignment for a 64-unit selection.
pub fn ring_assignment_benchmark(c: &mut Criterion) {
    let world = crowded_world();
    let ids = unit_ids(&world, 0);
    c.bench_function("assign_ring_cells_64", |b| {
        b.iter(|| assign_ring_cells(black_box(&world), GridPos::new(64, 64), black_box(&ids)));
    });
}

/// Full boundaries with a move order per tick.
pub fn boundary_benchmark(c: &mut Criterion) {
    c.bench_function("boundary_with_move", |b| {
        b.iter_batched(
            || skirmish_context(1, 0, 1),
            |mut ctx| {
                let ids = unit_ids(ctx.world(), 0);
                for tick in 0..20 {
                    ctx.submit(Command::MoveTo {
                        target: GridPos::new(10 + tick, 20),
                        selection: ids.clone(),
                    });
                    black_box(ctx.on_boundary().ok());
                }
                ctx.state_hash()
            },
            BatchSize::SmallInput,
        );
    });
}

criterion_group!(benches, ring_assignment_benchmark, boundary_benchmark);
criterion_main!(benches);
