//! Test fixtures and helpers.
//!
//! Pre-built worlds, configurations and contexts for consistent testing.

use lockstep_core::prelude::*;
use lockstep_core::persistence::NullSaveSink;

/// Map size used by the fixtures.
pub const FIXTURE_MAP_SIZE: u32 = 48;

/// Create a fixed-point number from an integer.
#[must_use]
pub fn fixed(n: i32) -> Fixed {
    Fixed::from_num(n)
}

/// Configuration for a fixture run.
#[must_use]
pub fn test_config(player_count: u8, local_player: PlayerId, seed: u64) -> LockstepConfig {
    LockstepConfig {
        seed,
        player_count,
        local_player,
        lockstep_delay: 1,
        map_width: FIXTURE_MAP_SIZE,
        map_height: FIXTURE_MAP_SIZE,
        ..Default::default()
    }
}

/// A world with a river, a second partition and a few units per player.
///
/// Column 24 is blocked except for row 0, and the bottom-right corner is
/// its own partition. Every player gets two bearers, a pioneer and two
/// swordsmen in its own row on the west bank.
#[must_use]
pub fn skirmish_world(player_count: u8) -> World {
    let mut grid = MapGrid::new(FIXTURE_MAP_SIZE, FIXTURE_MAP_SIZE);
    for y in 1..FIXTURE_MAP_SIZE as i32 {
        grid.set_blocked(GridPos::new(24, y));
    }
    for x in 40..FIXTURE_MAP_SIZE as i32 {
        for y in 40..FIXTURE_MAP_SIZE as i32 {
            grid.set_partition(GridPos::new(x, y), 2);
        }
    }

    let mut world = World::new(grid, player_count);
    for player in 0..player_count {
        let base = GridPos::new(4, 4 + i32::from(player) * 5);
        let kinds = [
            MovableType::Bearer,
            MovableType::Bearer,
            MovableType::Pioneer,
            MovableType::Swordsman,
            MovableType::Swordsman,
        ];
        for (i, kind) in kinds.into_iter().enumerate() {
            world.spawn_movable(player, kind, base.offset(i as i32, 0));
        }
    }
    world
}

/// A headless context on [`skirmish_world`].
///
/// # Panics
///
/// Panics if the fixture configuration is invalid.
#[must_use]
pub fn skirmish_context(player_count: u8, local_player: PlayerId, seed: u64) -> SimulationContext {
    SimulationContext::new(
        &test_config(player_count, local_player, seed),
        skirmish_world(player_count),
        Box::new(HeadlessUi),
        Box::new(NullSaveSink),
    )
    .expect("fixture configuration is valid")
}

/// Ids of a player's units in id order.
#[must_use]
pub fn unit_ids(world: &World, player: PlayerId) -> Vec<MovableId> {
    world
        .movables()
        .filter(|m| m.player == player)
        .map(|m| m.id)
        .collect()
}
