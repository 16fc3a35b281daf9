//! Command dispatcher.
//!
//! Applies each [`IssuedCommand`] to the world exactly once, in the order
//! the clock releases them. A command whose target no longer exists (or
//! belongs to another player) is a logged no-op: peers cannot know in
//! advance whether an earlier command in the same stream removed it.
//!
//! The dispatcher also runs the clock's building scans, since those mutate
//! the world and must interleave with commands in schedule order.

use tracing::{debug, error, info, warn};

use crate::clock::{ClockCursor, ScheduledWork, SchedulingClock};
use crate::command::{
    BuildingPriority, BuildingType, Command, IssuedCommand, MaterialType, MovableId,
    MovableType, PlayerId, Tick,
};
use crate::grid::{GridPos, HexRing};
use crate::persistence::{PlayerSnapshot, SaveGame, SaveSink, UiState};
use crate::rng::{DeterministicRng, RngState};
use crate::world::{ScanOutcome, World};

/// Consecutive exhausted rings after which a multi-unit move gives up.
pub const MAX_RINGS_WITHOUT_SUCCESS: u16 = 5;

/// Result of dispatching one command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The command changed the world.
    Applied,
    /// The command referenced something that no longer exists.
    StaleReference,
    /// The save could not be stored.
    SaveFailed,
}

/// Phase of the current dispatch cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DispatchPhase {
    /// Waiting for the next command.
    #[default]
    Idle,
    /// Checking that referenced entities exist.
    Validating,
    /// Mutating the world.
    Applying,
}

/// Counters for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    /// Commands that changed the world.
    pub applied: u64,
    /// Commands skipped because of stale references.
    pub stale: u64,
    /// Saves that could not be stored.
    pub save_failures: u64,
    /// Building scans run.
    pub scans: u64,
}

/// Access to the local user interface.
pub trait UiBridge: Send {
    /// Live camera state, captured into quick saves.
    fn ui_state(&self) -> UiState;

    /// Called after units changed type so the UI can refresh its selection.
    fn refresh_selection(&mut self) {}
}

/// UI bridge for runs without a user interface.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeadlessUi;

impl UiBridge for HeadlessUi {
    fn ui_state(&self) -> UiState {
        UiState::default()
    }
}

/// Simulation state a dispatch may touch.
pub struct DispatchEnv<'a> {
    /// Tick being executed.
    pub tick: Tick,
    /// The world.
    pub world: &'a mut World,
    /// Shared random generator.
    pub rng: &'a mut DeterministicRng,
    /// Clock, for scheduling follow-up work.
    pub clock: &'a mut SchedulingClock,
}

/// Applies commands and scheduled work to the world.
pub struct CommandDispatcher {
    local_player: PlayerId,
    ui: Box<dyn UiBridge>,
    sink: Box<dyn SaveSink>,
    pending_save: Option<(Tick, Vec<PlayerSnapshot>)>,
    phase: DispatchPhase,
    stats: DispatchStats,
}

impl std::fmt::Debug for CommandDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandDispatcher")
            .field("local_player", &self.local_player)
            .field("phase", &self.phase)
            .field("stats", &self.stats)
            .field("pending_save", &self.pending_save.is_some())
            .finish_non_exhaustive()
    }
}

impl CommandDispatcher {
    /// Create a dispatcher for the given local player.
    pub fn new(local_player: PlayerId, ui: Box<dyn UiBridge>, sink: Box<dyn SaveSink>) -> Self {
        Self {
            local_player,
            ui,
            sink,
            pending_save: None,
            phase: DispatchPhase::Idle,
            stats: DispatchStats::default(),
        }
    }

    /// Current phase. Always `Idle` between calls.
    #[must_use]
    pub const fn phase(&self) -> DispatchPhase {
        self.phase
    }

    /// Counters since creation.
    #[must_use]
    pub const fn stats(&self) -> DispatchStats {
        self.stats
    }

    /// Whether a quick save is waiting for [`Self::flush_save`].
    #[must_use]
    pub const fn has_pending_save(&self) -> bool {
        self.pending_save.is_some()
    }

    /// Run one piece of work released by the clock.
    pub fn dispatch_work(
        &mut self,
        work: ScheduledWork,
        env: &mut DispatchEnv<'_>,
    ) -> Vec<DispatchOutcome> {
        match work {
            ScheduledWork::Commands(batch) => {
                debug!(
                    tick = env.tick,
                    player = batch.player,
                    commands = batch.commands.len(),
                    "Dispatching batch"
                );
                batch
                    .issued()
                    .map(|issued| self.dispatch(&issued, env))
                    .collect()
            }
            ScheduledWork::BuildingScan(pos) => {
                self.run_scan(pos, env);
                Vec::new()
            }
        }
    }

    /// Apply every command of a sequence in order.
    ///
    /// A stale command never aborts the rest of the sequence.
    pub fn dispatch_batch<'c>(
        &mut self,
        commands: impl IntoIterator<Item = &'c IssuedCommand>,
        env: &mut DispatchEnv<'_>,
    ) -> Vec<DispatchOutcome> {
        commands
            .into_iter()
            .map(|issued| self.dispatch(issued, env))
            .collect()
    }

    /// Apply one command.
    pub fn dispatch(
        &mut self,
        issued: &IssuedCommand,
        env: &mut DispatchEnv<'_>,
    ) -> DispatchOutcome {
        self.phase = DispatchPhase::Validating;
        let player = issued.player;
        let outcome = match &issued.command {
            Command::Build { pos, building } => self.build(player, *pos, *building, env),
            Command::DestroyBuilding { pos } => self.destroy_building(player, *pos, env),
            Command::MoveTo { target, selection } => {
                self.move_selection_to(player, *target, selection, env)
            }
            Command::SetWorkArea {
                building_pos,
                center,
            } => self.set_work_area(player, *building_pos, *center, env),
            Command::SetBuildingPriority {
                building_pos,
                priority,
            } => self.set_building_priority(player, *building_pos, *priority, env),
            Command::SetMaterialDistribution {
                manager_pos,
                material,
                weights,
            } => self.set_material_distribution(*manager_pos, *material, weights, env),
            Command::SetMaterialPriorities { manager_pos, order } => {
                self.set_material_priorities(*manager_pos, order, env)
            }
            Command::DestroyMovables { selection } => self.destroy_movables(player, selection, env),
            Command::StartWorking { selection } => self.set_working(player, selection, true, env),
            Command::StopWorking { selection } => self.set_working(player, selection, false, env),
            Command::Convert { selection, target } => {
                self.convert(player, selection, *target, env)
            }
            Command::QuickSave => self.quick_save(player, env),
        };

        match outcome {
            DispatchOutcome::Applied => self.stats.applied += 1,
            DispatchOutcome::StaleReference => {
                self.stats.stale += 1;
                warn!(
                    tick = env.tick,
                    player,
                    command = issued.command.name(),
                    "Stale reference, command skipped"
                );
            }
            DispatchOutcome::SaveFailed => self.stats.save_failures += 1,
        }
        self.phase = DispatchPhase::Idle;
        outcome
    }

    /// Store the quick save requested during this boundary.
    ///
    /// Called once the boundary has finished so that world, clock and RNG
    /// describe the same instant. Returns `None` if no save was requested.
    pub fn flush_save(
        &mut self,
        world: &World,
        clock: ClockCursor,
        rng: RngState,
    ) -> Option<DispatchOutcome> {
        let (tick, players) = self.pending_save.take()?;
        let result = SaveGame::new(players, world.clone(), clock, rng)
            .encode()
            .and_then(|data| self.sink.store(tick, &data));
        match result {
            Ok(()) => {
                info!(tick, "Quick save stored");
                Some(DispatchOutcome::Applied)
            }
            Err(e) => {
                self.stats.save_failures += 1;
                error!(tick, error = %e, "Quick save failed");
                Some(DispatchOutcome::SaveFailed)
            }
        }
    }

    // ------------------------------------------------------------------
    // Buildings
    // ------------------------------------------------------------------

    fn build(
        &mut self,
        player: PlayerId,
        pos: GridPos,
        building: BuildingType,
        env: &mut DispatchEnv<'_>,
    ) -> DispatchOutcome {
        if env.world.grid().is_blocked(pos) || env.world.building_at(pos).is_some() {
            return DispatchOutcome::StaleReference;
        }
        self.phase = DispatchPhase::Applying;
        if env.world.place_building(player, building, pos).is_err() {
            return DispatchOutcome::StaleReference;
        }
        if building.is_fortified() {
            let deadline = env.tick + World::next_scan_delay(env.rng);
            if let Err(e) = env
                .clock
                .schedule(deadline, player, ScheduledWork::BuildingScan(pos))
            {
                error!(error = %e, "Failed to schedule building scan");
            }
        }
        DispatchOutcome::Applied
    }

    fn destroy_building(
        &mut self,
        player: PlayerId,
        pos: GridPos,
        env: &mut DispatchEnv<'_>,
    ) -> DispatchOutcome {
        if !owns_building(env.world, player, pos) {
            return DispatchOutcome::StaleReference;
        }
        self.phase = DispatchPhase::Applying;
        env.world.remove_building(pos);
        DispatchOutcome::Applied
    }

    fn set_work_area(
        &mut self,
        player: PlayerId,
        building_pos: GridPos,
        center: GridPos,
        env: &mut DispatchEnv<'_>,
    ) -> DispatchOutcome {
        if !owns_building(env.world, player, building_pos) {
            return DispatchOutcome::StaleReference;
        }
        match env.world.building_at_mut(building_pos) {
            Some(building) if building.kind.has_work_area() => {
                self.phase = DispatchPhase::Applying;
                building.work_area = Some(center);
                DispatchOutcome::Applied
            }
            _ => DispatchOutcome::StaleReference,
        }
    }

    fn set_building_priority(
        &mut self,
        player: PlayerId,
        building_pos: GridPos,
        priority: BuildingPriority,
        env: &mut DispatchEnv<'_>,
    ) -> DispatchOutcome {
        if !owns_building(env.world, player, building_pos) {
            return DispatchOutcome::StaleReference;
        }
        match env.world.building_at_mut(building_pos) {
            Some(building) => {
                self.phase = DispatchPhase::Applying;
                building.priority = priority;
                DispatchOutcome::Applied
            }
            None => DispatchOutcome::StaleReference,
        }
    }

    fn run_scan(&mut self, pos: GridPos, env: &mut DispatchEnv<'_>) {
        self.stats.scans += 1;
        let outcome = env.world.scan_for_soldier(pos);
        if outcome == ScanOutcome::Gone {
            debug!(tick = env.tick, x = pos.x, y = pos.y, "Building gone, scan stopped");
            return;
        }
        if let ScanOutcome::Occupied(soldier) = outcome {
            debug!(tick = env.tick, soldier, x = pos.x, y = pos.y, "Soldier entered building");
        }
        let player = env.world.building_at(pos).map_or(0, |b| b.player);
        let deadline = env.tick + World::next_scan_delay(env.rng);
        if let Err(e) = env
            .clock
            .schedule(deadline, player, ScheduledWork::BuildingScan(pos))
        {
            error!(error = %e, "Failed to reschedule building scan");
        }
    }

    // ------------------------------------------------------------------
    // Materials
    // ------------------------------------------------------------------

    fn set_material_distribution(
        &mut self,
        manager_pos: GridPos,
        material: MaterialType,
        weights: &[u16],
        env: &mut DispatchEnv<'_>,
    ) -> DispatchOutcome {
        match env.world.material_settings_mut(manager_pos) {
            Some(settings) => {
                self.phase = DispatchPhase::Applying;
                settings.distribution.insert(material, weights.to_vec());
                DispatchOutcome::Applied
            }
            None => DispatchOutcome::StaleReference,
        }
    }

    fn set_material_priorities(
        &mut self,
        manager_pos: GridPos,
        order: &[MaterialType],
        env: &mut DispatchEnv<'_>,
    ) -> DispatchOutcome {
        match env.world.material_settings_mut(manager_pos) {
            Some(settings) => {
                self.phase = DispatchPhase::Applying;
                settings.priorities = order.to_vec();
                DispatchOutcome::Applied
            }
            None => DispatchOutcome::StaleReference,
        }
    }

    // ------------------------------------------------------------------
    // Movables
    // ------------------------------------------------------------------

    fn move_selection_to(
        &mut self,
        player: PlayerId,
        target: GridPos,
        selection: &[MovableId],
        env: &mut DispatchEnv<'_>,
    ) -> DispatchOutcome {
        if !env.world.grid().in_bounds(target) {
            return DispatchOutcome::StaleReference;
        }
        let units = owned_units(env.world, player, selection);
        if units.is_empty() {
            return DispatchOutcome::StaleReference;
        }
        self.phase = DispatchPhase::Applying;

        if selection.len() == 1 {
            if let Some(movable) = env.world.movable_mut(units[0]) {
                movable.destination = Some(target);
            }
            return DispatchOutcome::Applied;
        }

        let assignments = assign_ring_cells(env.world, target, &units);
        if assignments.len() < units.len() {
            debug!(
                tick = env.tick,
                assigned = assignments.len(),
                requested = units.len(),
                "Not every unit found a free cell"
            );
        }
        for (id, cell) in assignments {
            if let Some(movable) = env.world.movable_mut(id) {
                movable.destination = Some(cell);
            }
        }
        DispatchOutcome::Applied
    }

    fn destroy_movables(
        &mut self,
        player: PlayerId,
        selection: &[MovableId],
        env: &mut DispatchEnv<'_>,
    ) -> DispatchOutcome {
        let units = owned_units(env.world, player, selection);
        if units.is_empty() {
            return DispatchOutcome::StaleReference;
        }
        self.phase = DispatchPhase::Applying;
        for id in units {
            env.world.remove_movable(id);
        }
        DispatchOutcome::Applied
    }

    fn set_working(
        &mut self,
        player: PlayerId,
        selection: &[MovableId],
        working: bool,
        env: &mut DispatchEnv<'_>,
    ) -> DispatchOutcome {
        let units = owned_units(env.world, player, selection);
        if units.is_empty() {
            return DispatchOutcome::StaleReference;
        }
        self.phase = DispatchPhase::Applying;
        for id in units {
            if let Some(movable) = env.world.movable_mut(id) {
                movable.working = working;
            }
        }
        DispatchOutcome::Applied
    }

    fn convert(
        &mut self,
        player: PlayerId,
        selection: &[MovableId],
        target: MovableType,
        env: &mut DispatchEnv<'_>,
    ) -> DispatchOutcome {
        let units = owned_units(env.world, player, selection);
        if units.is_empty() {
            return DispatchOutcome::StaleReference;
        }
        self.phase = DispatchPhase::Applying;
        for id in units {
            if let Some(movable) = env.world.movable_mut(id) {
                // units that cannot take the new job keep their type
                if movable.kind.can_convert_to(target) {
                    movable.kind = target;
                }
            }
        }
        if player == self.local_player {
            self.ui.refresh_selection();
        }
        DispatchOutcome::Applied
    }

    // ------------------------------------------------------------------
    // Saving
    // ------------------------------------------------------------------

    fn quick_save(&mut self, issuer: PlayerId, env: &mut DispatchEnv<'_>) -> DispatchOutcome {
        self.phase = DispatchPhase::Applying;
        let players = (0..env.world.player_count())
            .map(|player| {
                let is_local_issuer = player == issuer && issuer == self.local_player;
                PlayerSnapshot {
                    player,
                    fortified_building: env
                        .world
                        .first_fortified_building(player)
                        .map(|b| b.pos),
                    ui_state: is_local_issuer.then(|| self.ui.ui_state()),
                    fog: if is_local_issuer {
                        env.world.fog_of_war(player).cloned()
                    } else {
                        None
                    },
                }
            })
            .collect();
        self.pending_save = Some((env.tick, players));
        info!(tick = env.tick, issuer, "Quick save requested");
        DispatchOutcome::Applied
    }
}

fn owns_building(world: &World, player: PlayerId, pos: GridPos) -> bool {
    world.building_at(pos).is_some_and(|b| b.player == player)
}

/// Units of `selection` that still exist and belong to `player`, in listed order.
fn owned_units(world: &World, player: PlayerId, selection: &[MovableId]) -> Vec<MovableId> {
    selection
        .iter()
        .copied()
        .filter(|id| world.movable(*id).is_some_and(|m| m.player == player))
        .collect()
}

/// Spread units over the hex rings around `target`.
///
/// Units take cells in listed order from one shared walk over rings of
/// growing radius. A cell is usable when it is walkable, free (or held by
/// the unit itself) and in the unit's partition. The walk stops once
/// [`MAX_RINGS_WITHOUT_SUCCESS`] further rings have been exhausted after the
/// last successful assignment; later units get nothing.
pub fn assign_ring_cells(
    world: &World,
    target: GridPos,
    units: &[MovableId],
) -> Vec<(MovableId, GridPos)> {
    let grid = world.grid();
    let mut assignments = Vec::with_capacity(units.len());
    let mut radius: u16 = 1;
    let mut rings_without_success: u16 = 0;
    let mut ring = HexRing::new(target, radius);

    for &id in units {
        let Some(movable) = world.movable(id) else {
            continue;
        };
        let partition = grid.partition(movable.pos);

        loop {
            let Some(cell) = ring.next() else {
                rings_without_success += 1;
                if rings_without_success > MAX_RINGS_WITHOUT_SUCCESS {
                    return assignments;
                }
                radius += 1;
                ring = HexRing::new(target, radius);
                continue;
            };

            let free = world.movable_at(cell).map_or(true, |other| other == id);
            if !grid.is_blocked(cell) && free && grid.partition(cell) == partition {
                rings_without_success = 0;
                assignments.push((id, cell));
                break;
            }
        }
    }
    assignments
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::MapGrid;
    use crate::math::Fixed;
    use crate::persistence::MemorySaveSink;

    struct Harness {
        world: World,
        rng: DeterministicRng,
        clock: SchedulingClock,
        dispatcher: CommandDispatcher,
        sink: MemorySaveSink,
    }

    impl Harness {
        fn new() -> Self {
            let sink = MemorySaveSink::new();
            Self {
                world: World::new(MapGrid::new(40, 40), 2),
                rng: DeterministicRng::new(1),
                clock: SchedulingClock::new(50, Fixed::ONE).unwrap(),
                dispatcher: CommandDispatcher::new(0, Box::new(HeadlessUi), Box::new(sink.clone())),
                sink,
            }
        }

        fn run(&mut self, player: PlayerId, command: Command) -> DispatchOutcome {
            let mut env = DispatchEnv {
                tick: self.clock.tick(),
                world: &mut self.world,
                rng: &mut self.rng,
                clock: &mut self.clock,
            };
            self.dispatcher
                .dispatch(&IssuedCommand::new(player, command), &mut env)
        }

        fn spawn(&mut self, player: PlayerId, kind: MovableType, x: i32, y: i32) -> MovableId {
            self.world
                .spawn_movable(player, kind, GridPos::new(x, y))
                .unwrap()
        }
    }

    #[test]
    fn test_single_unit_moves_to_target() {
        let mut h = Harness::new();
        let id = h.spawn(0, MovableType::Bearer, 1, 1);
        let target = GridPos::new(10, 10);
        let outcome = h.run(0, Command::MoveTo { target, selection: vec![id] });
        assert_eq!(outcome, DispatchOutcome::Applied);
        assert_eq!(h.world.movable(id).unwrap().destination, Some(target));
    }

    #[test]
    fn test_off_map_move_target_is_stale() {
        let mut h = Harness::new();
        let a = h.spawn(0, MovableType::Bearer, 1, 1);
        let b = h.spawn(0, MovableType::Bearer, 2, 1);

        let target = GridPos::new(i32::MAX, 0);
        let outcome = h.run(0, Command::MoveTo { target, selection: vec![a, b] });
        assert_eq!(outcome, DispatchOutcome::StaleReference);

        let target = GridPos::new(40, 3);
        let outcome = h.run(0, Command::MoveTo { target, selection: vec![a] });
        assert_eq!(outcome, DispatchOutcome::StaleReference);
        assert_eq!(h.world.movable(a).unwrap().destination, None);
        assert_eq!(h.world.movable(b).unwrap().destination, None);
    }

    #[test]
    fn test_three_units_take_ring_one_cells_in_order() {
        let mut h = Harness::new();
        let target = GridPos::new(20, 20);
        h.spawn(1, MovableType::Bearer, 20, 20);
        let a = h.spawn(0, MovableType::Bearer, 1, 1);
        let b = h.spawn(0, MovableType::Bearer, 2, 1);
        let c = h.spawn(0, MovableType::Bearer, 3, 1);

        h.run(0, Command::MoveTo { target, selection: vec![c, a, b] });

        assert_eq!(h.world.movable(c).unwrap().destination, Some(GridPos::new(21, 20)));
        assert_eq!(h.world.movable(a).unwrap().destination, Some(GridPos::new(21, 21)));
        assert_eq!(h.world.movable(b).unwrap().destination, Some(GridPos::new(20, 21)));
    }

    #[test]
    fn test_ring_skips_blocked_and_occupied_cells() {
        let mut h = Harness::new();
        let target = GridPos::new(20, 20);
        h.world.grid_mut().set_blocked(GridPos::new(21, 20));
        h.spawn(1, MovableType::Bearer, 21, 21);
        let a = h.spawn(0, MovableType::Bearer, 1, 1);
        let b = h.spawn(0, MovableType::Bearer, 2, 1);

        h.run(0, Command::MoveTo { target, selection: vec![a, b] });

        assert_eq!(h.world.movable(a).unwrap().destination, Some(GridPos::new(20, 21)));
        assert_eq!(h.world.movable(b).unwrap().destination, Some(GridPos::new(19, 20)));
    }

    #[test]
    fn test_all_rings_blocked_leaves_units_unassigned() {
        let mut h = Harness::new();
        let target = GridPos::new(20, 20);
        for radius in 1..=6 {
            for cell in HexRing::new(target, radius) {
                h.world.grid_mut().set_blocked(cell);
            }
        }
        let a = h.spawn(0, MovableType::Bearer, 1, 1);
        let b = h.spawn(0, MovableType::Bearer, 2, 1);
        let before = h.world.clone();

        let outcome = h.run(0, Command::MoveTo { target, selection: vec![a, b] });

        assert_eq!(outcome, DispatchOutcome::Applied);
        assert_eq!(h.world, before);
        assert_eq!(h.dispatcher.phase(), DispatchPhase::Idle);
    }

    #[test]
    fn test_ring_seven_is_never_tried() {
        let mut h = Harness::new();
        let target = GridPos::new(20, 20);
        for radius in 1..=6 {
            for cell in HexRing::new(target, radius) {
                h.world.grid_mut().set_blocked(cell);
            }
        }
        let a = h.spawn(0, MovableType::Bearer, 1, 1);
        let b = h.spawn(0, MovableType::Bearer, 2, 1);
        assert!(assign_ring_cells(&h.world, target, &[a, b]).is_empty());
    }

    #[test]
    fn test_other_partition_cells_are_skipped() {
        let mut h = Harness::new();
        let target = GridPos::new(20, 20);
        for cell in HexRing::new(target, 1) {
            h.world.grid_mut().set_partition(cell, 9);
        }
        let a = h.spawn(0, MovableType::Bearer, 1, 1);
        let b = h.spawn(0, MovableType::Bearer, 2, 1);

        let cells = assign_ring_cells(&h.world, target, &[a, b]);
        assert!(cells.iter().all(|(_, cell)| target.hex_distance(*cell) == 2));
    }

    #[test]
    fn test_destroyed_unit_later_in_batch_is_noop() {
        let mut h = Harness::new();
        let id = h.spawn(0, MovableType::Bearer, 5, 5);
        let commands = [
            IssuedCommand::new(0, Command::DestroyMovables { selection: vec![id] }),
            IssuedCommand::new(
                0,
                Command::MoveTo {
                    target: GridPos::new(9, 9),
                    selection: vec![id],
                },
            ),
            IssuedCommand::new(0, Command::StopWorking { selection: vec![id] }),
        ];
        let mut env = DispatchEnv {
            tick: 0,
            world: &mut h.world,
            rng: &mut h.rng,
            clock: &mut h.clock,
        };
        let outcomes = h.dispatcher.dispatch_batch(&commands, &mut env);
        assert_eq!(
            outcomes,
            vec![
                DispatchOutcome::Applied,
                DispatchOutcome::StaleReference,
                DispatchOutcome::StaleReference
            ]
        );
        assert_eq!(h.dispatcher.stats().stale, 2);
        assert_eq!(h.dispatcher.phase(), DispatchPhase::Idle);
    }

    #[test]
    fn test_foreign_units_are_ignored() {
        let mut h = Harness::new();
        let id = h.spawn(1, MovableType::Bearer, 5, 5);
        let outcome = h.run(0, Command::DestroyMovables { selection: vec![id] });
        assert_eq!(outcome, DispatchOutcome::StaleReference);
        assert!(h.world.movable(id).is_some());
    }

    #[test]
    fn test_build_fortified_schedules_scan() {
        let mut h = Harness::new();
        let pos = GridPos::new(8, 8);
        let outcome = h.run(
            0,
            Command::Build {
                pos,
                building: BuildingType::Tower,
            },
        );
        assert_eq!(outcome, DispatchOutcome::Applied);
        assert_eq!(h.clock.pending_len(), 1);
        assert_eq!(h.rng.draws(), 1);

        let again = h.run(
            0,
            Command::Build {
                pos,
                building: BuildingType::Farm,
            },
        );
        assert_eq!(again, DispatchOutcome::StaleReference);
    }

    #[test]
    fn test_building_settings() {
        let mut h = Harness::new();
        let pos = GridPos::new(8, 8);
        h.world.place_building(0, BuildingType::Lumberjack, pos).unwrap();

        let center = GridPos::new(12, 12);
        assert_eq!(
            h.run(0, Command::SetWorkArea { building_pos: pos, center }),
            DispatchOutcome::Applied
        );
        assert_eq!(
            h.run(
                0,
                Command::SetBuildingPriority {
                    building_pos: pos,
                    priority: BuildingPriority::High
                }
            ),
            DispatchOutcome::Applied
        );
        let building = h.world.building_at(pos).unwrap();
        assert_eq!(building.work_area, Some(center));
        assert_eq!(building.priority, BuildingPriority::High);

        assert_eq!(
            h.run(1, Command::DestroyBuilding { pos }),
            DispatchOutcome::StaleReference
        );
        assert_eq!(h.run(0, Command::DestroyBuilding { pos }), DispatchOutcome::Applied);
        assert!(h.world.building_at(pos).is_none());
    }

    #[test]
    fn test_material_settings_per_partition() {
        let mut h = Harness::new();
        let pos = GridPos::new(3, 3);
        h.run(
            0,
            Command::SetMaterialDistribution {
                manager_pos: pos,
                material: MaterialType::Coal,
                weights: vec![1, 2, 3],
            },
        );
        h.run(
            0,
            Command::SetMaterialPriorities {
                manager_pos: pos,
                order: vec![MaterialType::Bread, MaterialType::Plank],
            },
        );
        let settings = h.world.material_settings(1).unwrap();
        assert_eq!(settings.distribution[&MaterialType::Coal], vec![1, 2, 3]);
        assert_eq!(settings.priorities, vec![MaterialType::Bread, MaterialType::Plank]);

        h.world.grid_mut().set_blocked(GridPos::new(4, 4));
        let outcome = h.run(
            0,
            Command::SetMaterialPriorities {
                manager_pos: GridPos::new(4, 4),
                order: Vec::new(),
            },
        );
        assert_eq!(outcome, DispatchOutcome::StaleReference);
    }

    #[test]
    fn test_convert_and_working_flags() {
        let mut h = Harness::new();
        let bearer = h.spawn(0, MovableType::Bearer, 1, 1);
        let soldier = h.spawn(0, MovableType::Swordsman, 2, 2);

        h.run(
            0,
            Command::Convert {
                selection: vec![bearer, soldier],
                target: MovableType::Geologist,
            },
        );
        assert_eq!(h.world.movable(bearer).unwrap().kind, MovableType::Geologist);
        assert_eq!(h.world.movable(soldier).unwrap().kind, MovableType::Swordsman);

        h.run(0, Command::StopWorking { selection: vec![bearer] });
        assert!(!h.world.movable(bearer).unwrap().working);
        h.run(0, Command::StartWorking { selection: vec![bearer] });
        assert!(h.world.movable(bearer).unwrap().working);
    }

    #[test]
    fn test_quick_save_captures_local_issuer_state_only() {
        let mut h = Harness::new();
        h.world
            .place_building(1, BuildingType::GuardHouse, GridPos::new(6, 6))
            .unwrap();
        h.run(0, Command::QuickSave);
        assert!(h.dispatcher.has_pending_save());

        let outcome = h
            .dispatcher
            .flush_save(&h.world, h.clock.cursor(), h.rng.snapshot());
        assert_eq!(outcome, Some(DispatchOutcome::Applied));

        let saves = h.sink.saves();
        assert_eq!(saves.len(), 1);
        let save = SaveGame::decode(&saves[0].1).unwrap();
        assert_eq!(save.players.len(), 2);
        assert!(save.players[0].ui_state.is_some());
        assert!(save.players[0].fog.is_some());
        assert_eq!(save.players[0].fortified_building, None);
        assert!(save.players[1].ui_state.is_none());
        assert_eq!(save.players[1].fortified_building, Some(GridPos::new(6, 6)));
    }

    #[test]
    fn test_remote_quick_save_has_no_ui_state() {
        let mut h = Harness::new();
        h.run(1, Command::QuickSave);
        h.dispatcher
            .flush_save(&h.world, h.clock.cursor(), h.rng.snapshot());
        let save = SaveGame::decode(&h.sink.saves()[0].1).unwrap();
        assert!(save.players.iter().all(|p| p.ui_state.is_none()));
    }

    struct FailingSink;

    impl SaveSink for FailingSink {
        fn store(&mut self, _tick: Tick, _data: &[u8]) -> crate::error::Result<()> {
            Err(crate::error::CoreError::Persistence("disk full".into()))
        }
    }

    #[test]
    fn test_failed_save_is_reported() {
        let mut h = Harness::new();
        h.dispatcher = CommandDispatcher::new(0, Box::new(HeadlessUi), Box::new(FailingSink));
        h.run(0, Command::QuickSave);
        let outcome = h
            .dispatcher
            .flush_save(&h.world, h.clock.cursor(), h.rng.snapshot());
        assert_eq!(outcome, Some(DispatchOutcome::SaveFailed));
        assert_eq!(h.dispatcher.stats().save_failures, 1);
        assert!(h
            .dispatcher
            .flush_save(&h.world, h.clock.cursor(), h.rng.snapshot())
            .is_none());
    }
}
