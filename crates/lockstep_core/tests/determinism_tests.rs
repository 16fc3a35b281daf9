//! Determinism tests across independent contexts.
//!
//! Two peers that see the same batches must end every tick with the same
//! world, whatever order the batches arrived in.

use lockstep_core::prelude::*;
use lockstep_test_utils::determinism::strategies::arb_command_script;
use lockstep_test_utils::determinism::{find_first_divergence, run_script};
use lockstep_test_utils::fixtures::{skirmish_context, unit_ids};
use proptest::prelude::*;

// =============================================================================
// Two peers exchanging batches
// =============================================================================

/// Run two peers in one thread, delivering each outbound batch to the other
/// peer. `reverse` flips delivery order within a boundary.
fn run_peers(script: &[(Tick, PlayerId, Command)], ticks: u64, reverse: bool) -> (u64, u64) {
    let mut peers = [skirmish_context(2, 0, 21), skirmish_context(2, 1, 21)];
    for _ in 0..ticks {
        let now = peers[0].tick();
        assert_eq!(now, peers[1].tick());
        for (at, player, command) in script {
            if *at == now {
                peers[*player as usize].submit(command.clone());
            }
        }

        let mut outbound = Vec::new();
        for peer in &mut peers {
            outbound.extend(peer.flush_local());
        }
        if reverse {
            outbound.reverse();
        }
        for batch in outbound {
            let receiver = 1 - batch.player as usize;
            peers[receiver].accept_remote(batch).unwrap();
        }
        for peer in &mut peers {
            assert!(matches!(peer.step().unwrap(), StepOutcome::Advanced(_)));
        }
        assert_eq!(peers[0].state_hash(), peers[1].state_hash(), "diverged at tick {now}");
    }
    (peers[0].state_hash(), peers[1].state_hash())
}

#[test]
fn test_two_peers_stay_in_sync() {
    let world = skirmish_context(2, 0, 21).world().clone();
    let p0 = unit_ids(&world, 0);
    let p1 = unit_ids(&world, 1);
    let script = vec![
        (
            0,
            0,
            Command::MoveTo {
                target: GridPos::new(10, 30),
                selection: p0.clone(),
            },
        ),
        (
            0,
            1,
            Command::MoveTo {
                target: GridPos::new(10, 30),
                selection: p1.clone(),
            },
        ),
        (
            2,
            1,
            Command::Build {
                pos: GridPos::new(20, 20),
                building: BuildingType::GuardHouse,
            },
        ),
        (
            4,
            0,
            Command::DestroyMovables {
                selection: vec![p0[0]],
            },
        ),
        (
            4,
            0,
            Command::StopWorking {
                selection: vec![p0[0], p0[1]],
            },
        ),
    ];

    let (a, b) = run_peers(&script, 40, false);
    assert_eq!(a, b);
    let (c, _) = run_peers(&script, 40, true);
    assert_eq!(a, c);
}

#[test]
fn test_same_tick_commands_merge_by_player() {
    // player 1 submits first and its batch is delivered first
    let world = skirmish_context(2, 0, 21).world().clone();
    let script = vec![
        (
            0,
            1,
            Command::MoveTo {
                target: GridPos::new(15, 15),
                selection: unit_ids(&world, 1),
            },
        ),
        (
            0,
            0,
            Command::MoveTo {
                target: GridPos::new(15, 15),
                selection: unit_ids(&world, 0),
            },
        ),
    ];
    let (a, b) = run_peers(&script, 5, true);
    assert_eq!(a, b);
}

// =============================================================================
// Single-player scripts
// =============================================================================

#[test]
fn test_stale_reference_batch_does_not_abort() {
    let mut ctx = skirmish_context(1, 0, 4);
    let ids = unit_ids(ctx.world(), 0);
    let script = vec![
        (
            0,
            Command::DestroyMovables {
                selection: vec![ids[0]],
            },
        ),
        (
            0,
            Command::MoveTo {
                target: GridPos::new(9, 9),
                selection: vec![ids[0]],
            },
        ),
        (
            0,
            Command::StopWorking {
                selection: vec![ids[1]],
            },
        ),
    ];
    run_script(&mut ctx, &script, 4);
    let stats = ctx.stats();
    assert_eq!(stats.applied, 2);
    assert_eq!(stats.stale, 1);
    assert!(ctx.world().movable(ids[0]).is_none());
    assert!(!ctx.world().movable(ids[1]).unwrap().working);
}

#[test]
fn test_same_seed_same_rng_continuation() {
    let script = vec![(
        0,
        Command::Build {
            pos: GridPos::new(12, 12),
            building: BuildingType::Tower,
        },
    )];
    let mut a = skirmish_context(1, 0, 1);
    let mut b = skirmish_context(1, 0, 1);
    run_script(&mut a, &script, 60);
    run_script(&mut b, &script, 60);
    assert_eq!(a.rng().snapshot(), b.rng().snapshot());
    assert!(a.rng().draws() > 1);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_command_scripts_replay_identically(script in arb_command_script(12, 20, 24)) {
        let divergence = find_first_divergence(|| skirmish_context(1, 0, 77), &script, 30);
        prop_assert_eq!(divergence, None);
    }
}
