//! Determinism testing utilities.
//!
//! Provides a harness for verifying that the lock-step core produces
//! identical results given identical inputs.
//!
//! # Testing Strategy
//!
//! Every peer must end every tick with the same world. Sources of
//! non-determinism include:
//!
//! - **Floating-point math**: the only non-integer value, the clock speed,
//!   is fixed-point via [`lockstep_core::math::Fixed`].
//!
//! - **Map iteration order**: the world keeps ordered maps only.
//!
//! - **System randomness**: all "random" behavior draws from the seeded
//!   [`lockstep_core::rng::DeterministicRng`].
//!
//! - **Arrival order**: remote batches are released in player order, never
//!   in the order they arrived.
//!
//! # Test Levels
//!
//! 1. **Unit tests**: each module next to its code
//! 2. **Property tests**: random command scripts replay identically
//! 3. **Integration tests**: full runs, save/restore and replays
//! 4. **Parallel tests**: N contexts on N threads all match

use std::thread;

use lockstep_core::prelude::*;

/// Result of a determinism test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeterminismResult {
    /// Whether all runs produced identical results.
    pub is_deterministic: bool,
    /// Hashes from each run.
    pub hashes: Vec<u64>,
    /// Number of ticks simulated.
    pub ticks: u64,
}

impl DeterminismResult {
    /// Get all unique hashes (should be 1 for a deterministic run).
    #[must_use]
    pub fn unique_hashes(&self) -> Vec<u64> {
        let mut unique: Vec<u64> = self.hashes.clone();
        unique.sort_unstable();
        unique.dedup();
        unique
    }

    /// Assert that the runs were deterministic, with a detailed error message.
    ///
    /// # Panics
    ///
    /// Panics if the runs produced different hashes.
    pub fn assert_deterministic(&self) {
        if !self.is_deterministic {
            let unique = self.unique_hashes();
            panic!(
                "Simulation is non-deterministic!\n\
                 Runs: {}\n\
                 Ticks: {}\n\
                 Unique hashes: {} (expected 1)\n\
                 All hashes: {:?}",
                self.hashes.len(),
                self.ticks,
                unique.len(),
                self.hashes
            );
        }
    }
}

/// Run a state machine multiple times and verify determinism.
///
/// # Arguments
///
/// * `runs` - Number of times to run
/// * `ticks` - Number of steps per run
/// * `setup` - Function to create the initial state
/// * `step` - Function to advance the state by one tick
/// * `hash` - Function to compute the state hash
pub fn verify_determinism<S, Setup, Step, HashFn>(
    runs: usize,
    ticks: u64,
    setup: Setup,
    step: Step,
    hash: HashFn,
) -> DeterminismResult
where
    Setup: Fn() -> S,
    Step: Fn(&mut S),
    HashFn: Fn(&S) -> u64,
{
    let mut hashes = Vec::with_capacity(runs);

    for _ in 0..runs {
        let mut state = setup();

        for _ in 0..ticks {
            step(&mut state);
        }

        hashes.push(hash(&state));
    }

    let is_deterministic = hashes.windows(2).all(|w| w[0] == w[1]);

    DeterminismResult {
        is_deterministic,
        hashes,
        ticks,
    }
}

/// Commands to submit locally, keyed by the tick at which they are submitted.
pub type CommandScript = Vec<(Tick, Command)>;

/// Drive a single-player context for `ticks` boundaries, submitting the
/// script's commands at their ticks. Returns the hash after every boundary.
///
/// # Panics
///
/// Panics if a boundary fails.
pub fn run_script(ctx: &mut SimulationContext, script: &[(Tick, Command)], ticks: u64) -> Vec<u64> {
    let mut hashes = Vec::with_capacity(ticks as usize);
    for _ in 0..ticks {
        let now = ctx.tick();
        for (_, command) in script.iter().filter(|(at, _)| *at == now) {
            ctx.submit(command.clone());
        }
        let report = ctx.on_boundary().expect("boundary failed");
        assert!(!report.stalled, "single-player run stalled at tick {now}");
        hashes.push(ctx.state_hash());
    }
    hashes
}

/// Run the same script on two contexts built by `setup`, returning the
/// first tick (1-based) whose hashes differ.
///
/// Returns `Some(0)` if the initial states already differ.
pub fn find_first_divergence<F>(setup: F, script: &[(Tick, Command)], ticks: u64) -> Option<u64>
where
    F: Fn() -> SimulationContext,
{
    let mut a = setup();
    let mut b = setup();
    if a.state_hash() != b.state_hash() {
        return Some(0);
    }
    let hashes_a = run_script(&mut a, script, ticks);
    let hashes_b = run_script(&mut b, script, ticks);
    let divergence = hashes_a
        .iter()
        .zip(&hashes_b)
        .position(|(x, y)| x != y)
        .map(|i| i as u64 + 1);
    if let Some(tick) = divergence {
        tracing::warn!(tick, "Runs diverged");
    }
    divergence
}

/// Result of parallel simulation runs.
#[derive(Debug, Clone)]
pub struct ParallelSimResult {
    /// Final state hash from each run.
    pub hashes: Vec<u64>,
    /// Number of ticks each run simulated.
    pub ticks: u64,
    /// Number of runs.
    pub num_sims: usize,
}

impl ParallelSimResult {
    /// Check if all runs produced identical results.
    #[must_use]
    pub fn is_deterministic(&self) -> bool {
        self.hashes.windows(2).all(|w| w[0] == w[1])
    }

    /// Assert all runs matched.
    ///
    /// # Panics
    ///
    /// Panics if runs produced different hashes.
    pub fn assert_deterministic(&self) {
        if !self.is_deterministic() {
            panic!(
                "Parallel simulations diverged!\n\
                 Simulations: {}\n\
                 Ticks: {}\n\
                 All hashes: {:?}",
                self.num_sims, self.ticks, self.hashes
            );
        }
    }
}

/// Run the same script on `num_sims` contexts, each on its own thread.
///
/// # Panics
///
/// Panics if a worker thread panics.
pub fn run_parallel_simulations<F>(
    setup: F,
    script: &[(Tick, Command)],
    num_sims: usize,
    ticks: u64,
) -> ParallelSimResult
where
    F: Fn() -> SimulationContext + Sync,
{
    let hashes = thread::scope(|s| {
        let handles: Vec<_> = (0..num_sims)
            .map(|_| {
                s.spawn(|| {
                    let mut ctx = setup();
                    run_script(&mut ctx, script, ticks);
                    ctx.state_hash()
                })
            })
            .collect();

        handles
            .into_iter()
            .map(|h| h.join().expect("simulation thread panicked"))
            .collect()
    });

    ParallelSimResult {
        hashes,
        ticks,
        num_sims,
    }
}

/// Proptest strategies for determinism testing.
pub mod strategies {
    use proptest::prelude::*;

    use lockstep_core::prelude::*;

    use crate::fixtures::FIXTURE_MAP_SIZE;

    /// A cell on the fixture map, occasionally just outside it.
    pub fn arb_grid_pos() -> impl Strategy<Value = GridPos> {
        let max = FIXTURE_MAP_SIZE as i32 + 2;
        (-2..max, -2..max).prop_map(|(x, y)| GridPos::new(x, y))
    }

    /// A unit selection; ids may refer to units that do not exist.
    pub fn arb_selection(max_id: MovableId) -> impl Strategy<Value = Vec<MovableId>> {
        proptest::collection::vec(1..=max_id, 0..6)
    }

    /// Any building type.
    pub fn arb_building_type() -> impl Strategy<Value = BuildingType> {
        prop_oneof![
            Just(BuildingType::Lumberjack),
            Just(BuildingType::Stonecutter),
            Just(BuildingType::Sawmill),
            Just(BuildingType::Farm),
            Just(BuildingType::GuardHouse),
            Just(BuildingType::Tower),
            Just(BuildingType::Castle),
        ]
    }

    /// Any unit type.
    pub fn arb_movable_type() -> impl Strategy<Value = MovableType> {
        prop_oneof![
            Just(MovableType::Bearer),
            Just(MovableType::Pioneer),
            Just(MovableType::Geologist),
            Just(MovableType::Thief),
            Just(MovableType::Swordsman),
            Just(MovableType::Bowman),
        ]
    }

    /// Any material.
    pub fn arb_material() -> impl Strategy<Value = MaterialType> {
        prop_oneof![
            Just(MaterialType::Plank),
            Just(MaterialType::Stone),
            Just(MaterialType::Coal),
            Just(MaterialType::IronOre),
            Just(MaterialType::Bread),
        ]
    }

    /// Any command except quick saves, referencing ids up to `max_id`.
    pub fn arb_command(max_id: MovableId) -> impl Strategy<Value = Command> {
        prop_oneof![
            (arb_grid_pos(), arb_building_type())
                .prop_map(|(pos, building)| Command::Build { pos, building }),
            arb_grid_pos().prop_map(|pos| Command::DestroyBuilding { pos }),
            (arb_grid_pos(), arb_selection(max_id))
                .prop_map(|(target, selection)| Command::MoveTo { target, selection }),
            (arb_grid_pos(), arb_grid_pos()).prop_map(|(building_pos, center)| {
                Command::SetWorkArea {
                    building_pos,
                    center,
                }
            }),
            (arb_grid_pos(), arb_material(), proptest::collection::vec(0u16..10, 0..4))
                .prop_map(|(manager_pos, material, weights)| {
                    Command::SetMaterialDistribution {
                        manager_pos,
                        material,
                        weights,
                    }
                }),
            arb_selection(max_id).prop_map(|selection| Command::DestroyMovables { selection }),
            arb_selection(max_id).prop_map(|selection| Command::StopWorking { selection }),
            arb_selection(max_id).prop_map(|selection| Command::StartWorking { selection }),
            (arb_selection(max_id), arb_movable_type())
                .prop_map(|(selection, target)| Command::Convert { selection, target }),
        ]
    }

    /// A command script spread over the first `max_tick` ticks.
    pub fn arb_command_script(
        max_id: MovableId,
        max_tick: Tick,
        max_len: usize,
    ) -> impl Strategy<Value = Vec<(Tick, Command)>> {
        proptest::collection::vec((0..max_tick, arb_command(max_id)), 0..max_len).prop_map(
            |mut script| {
                script.sort_by_key(|(tick, _)| *tick);
                script
            },
        )
    }
}
