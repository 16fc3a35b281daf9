//! Simulation context.
//!
//! One [`SimulationContext`] owns everything a run mutates: clock, RNG,
//! world, dispatcher and intake. It is created explicitly for a run and
//! passed to whoever drives it; nothing here is global.
//!
//! A boundary goes through these steps:
//! 1. release the batches for the next tick from the intake (ascending
//!    player id) into the clock's schedule,
//! 2. fire the clock, which runs periodic tasks and returns due work,
//! 3. dispatch the due work in schedule order,
//! 4. store a quick save if one was requested.

use tracing::{debug, info};

use crate::clock::{Boundary, PeriodicTask, ScheduledWork, SchedulingClock};
use crate::command::{Command, CommandBatch, PlayerId, Tick};
use crate::config::LockstepConfig;
use crate::dispatcher::{CommandDispatcher, DispatchEnv, DispatchOutcome, DispatchStats, UiBridge};
use crate::error::{CoreError, Result};
use crate::intake::CommandIntake;
use crate::persistence::{SaveGame, SaveSink};
use crate::replay::Replay;
use crate::rng::DeterministicRng;
use crate::world::World;

/// What one executed boundary did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepReport {
    /// The boundary.
    pub boundary: Boundary,
    /// Outcome per dispatched command, in dispatch order.
    pub outcomes: Vec<DispatchOutcome>,
    /// Outcome of the quick save stored at this boundary, if any.
    pub save: Option<DispatchOutcome>,
    /// World hash after the boundary.
    pub state_hash: u64,
}

/// Result of trying to run one boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// The boundary ran.
    Advanced(StepReport),
    /// Some player's batch for the next tick is missing.
    Stalled,
    /// The clock is paused.
    Paused,
}

/// Everything a driver-initiated boundary produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BoundaryReport {
    /// Local batches that must be sent to every peer.
    pub outbound: Vec<CommandBatch>,
    /// Boundaries that ran.
    pub steps: Vec<StepReport>,
    /// Whether the simulation had to wait for a peer.
    pub stalled: bool,
}

/// State of one simulation run.
pub struct SimulationContext {
    clock: SchedulingClock,
    rng: DeterministicRng,
    world: World,
    dispatcher: CommandDispatcher,
    intake: CommandIntake,
    lockstep_delay: u64,
    recording: Option<Replay>,
}

impl std::fmt::Debug for SimulationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulationContext")
            .field("tick", &self.clock.tick())
            .field("clock", &self.clock)
            .field("rng_draws", &self.rng.draws())
            .field("dispatcher", &self.dispatcher)
            .field("recording", &self.recording.is_some())
            .finish_non_exhaustive()
    }
}

impl SimulationContext {
    /// Create a context for a new run on `world`.
    pub fn new(
        config: &LockstepConfig,
        world: World,
        ui: Box<dyn UiBridge>,
        sink: Box<dyn SaveSink>,
    ) -> Result<Self> {
        config.validate()?;
        if world.player_count() != config.player_count {
            return Err(CoreError::Config(format!(
                "world has {} players, configuration {}",
                world.player_count(),
                config.player_count
            )));
        }
        let clock = SchedulingClock::new(config.tick_period_ms, config.speed()?)?;
        let intake = CommandIntake::new(
            config.local_player,
            config.player_count,
            config.lockstep_delay,
            0,
        )?;
        info!(
            seed = config.seed,
            players = config.player_count,
            local_player = config.local_player,
            "Simulation context created"
        );
        Ok(Self {
            clock,
            rng: DeterministicRng::new(config.seed),
            world,
            dispatcher: CommandDispatcher::new(config.local_player, ui, sink),
            intake,
            lockstep_delay: config.lockstep_delay,
            recording: None,
        })
    }

    /// Rebuild a context from a save.
    ///
    /// Clock and RNG are restored before anything else runs. The intake
    /// starts empty at the saved tick.
    pub fn restore(
        save: SaveGame,
        local_player: PlayerId,
        lockstep_delay: u64,
        ui: Box<dyn UiBridge>,
        sink: Box<dyn SaveSink>,
    ) -> Result<Self> {
        let clock = SchedulingClock::from_cursor(save.clock)?;
        let rng = DeterministicRng::restore(save.rng);
        let intake = CommandIntake::new(
            local_player,
            save.world.player_count(),
            lockstep_delay,
            clock.tick(),
        )?;
        info!(tick = clock.tick(), rng_draws = rng.draws(), "Simulation context restored");
        Ok(Self {
            clock,
            rng,
            world: save.world,
            dispatcher: CommandDispatcher::new(local_player, ui, sink),
            intake,
            lockstep_delay,
            recording: None,
        })
    }

    /// Current tick.
    #[must_use]
    pub const fn tick(&self) -> Tick {
        self.clock.tick()
    }

    /// The world.
    #[must_use]
    pub const fn world(&self) -> &World {
        &self.world
    }

    /// Mutable world access for scenario setup before the run starts.
    pub fn world_mut(&mut self) -> &mut World {
        &mut self.world
    }

    /// The clock.
    #[must_use]
    pub const fn clock(&self) -> &SchedulingClock {
        &self.clock
    }

    /// Mutable clock access for speed and pause control.
    pub fn clock_mut(&mut self) -> &mut SchedulingClock {
        &mut self.clock
    }

    /// The random generator.
    #[must_use]
    pub const fn rng(&self) -> &DeterministicRng {
        &self.rng
    }

    /// Dispatcher counters.
    #[must_use]
    pub const fn stats(&self) -> DispatchStats {
        self.dispatcher.stats()
    }

    /// World hash for desync checks.
    #[must_use]
    pub fn state_hash(&self) -> u64 {
        self.world.state_hash()
    }

    /// Register a task run at every boundary.
    pub fn register_periodic(&mut self, task: Box<dyn PeriodicTask>) {
        self.clock.register(task);
    }

    /// Queue a local command. It executes `lockstep_delay + 1` ticks after
    /// the next flush.
    pub fn submit(&mut self, command: Command) {
        debug!(command = command.name(), "Command submitted");
        self.intake.submit(command);
    }

    /// Record a batch received from a peer.
    pub fn accept_remote(&mut self, batch: CommandBatch) -> Result<()> {
        self.intake.accept_remote(batch)
    }

    /// Produce the next local batch, if one is due.
    pub fn flush_local(&mut self) -> Option<CommandBatch> {
        self.intake.flush_local(self.clock.tick())
    }

    /// Run the next boundary if every player's batch is present.
    pub fn step(&mut self) -> Result<StepOutcome> {
        if self.clock.is_paused() {
            return Ok(StepOutcome::Paused);
        }
        let next = self.clock.tick() + 1;
        if !self.intake.is_ready(next) {
            debug!(tick = next, "Waiting for peer batches");
            return Ok(StepOutcome::Stalled);
        }
        let batches = self.intake.release(next);
        self.apply_boundary(batches).map(StepOutcome::Advanced)
    }

    /// Run the next boundary with the given batches, bypassing the intake.
    ///
    /// Used by replay playback. Batches run in the order given.
    pub fn apply_boundary(&mut self, batches: Vec<CommandBatch>) -> Result<StepReport> {
        let next = self.clock.tick() + 1;
        for batch in batches {
            if let Some(replay) = &mut self.recording {
                replay.record_batch(&batch);
            }
            self.clock
                .schedule(next, batch.player, ScheduledWork::Commands(batch))?;
        }

        let work = self.clock.advance().ok_or_else(|| {
            CoreError::InvalidState("cannot run a boundary while paused".into())
        })?;

        let mut outcomes = Vec::new();
        let mut env = DispatchEnv {
            tick: work.boundary.tick,
            world: &mut self.world,
            rng: &mut self.rng,
            clock: &mut self.clock,
        };
        for item in work.due {
            outcomes.extend(self.dispatcher.dispatch_work(item, &mut env));
        }

        let save = self
            .dispatcher
            .flush_save(&self.world, self.clock.cursor(), self.rng.snapshot());

        let state_hash = self.world.state_hash();
        debug!(
            tick = work.boundary.tick,
            state_hash,
            commands = outcomes.len(),
            "Boundary executed"
        );
        Ok(StepReport {
            boundary: work.boundary,
            outcomes,
            save,
            state_hash,
        })
    }

    /// Run the boundary the driver's timer asked for.
    ///
    /// Flushes the local batch first. A stalled boundary is recorded as
    /// missed; once the simulation can move again the backlog is worked off
    /// immediately.
    pub fn on_boundary(&mut self) -> Result<BoundaryReport> {
        let mut report = BoundaryReport::default();
        report.outbound.extend(self.flush_local());
        match self.step()? {
            StepOutcome::Advanced(step) => {
                report.steps.push(step);
                let caught_up = self.fast_forward()?;
                report.outbound.extend(caught_up.outbound);
                report.steps.extend(caught_up.steps);
                report.stalled = caught_up.stalled;
            }
            StepOutcome::Stalled => {
                self.clock.record_missed();
                report.stalled = true;
            }
            StepOutcome::Paused => {}
        }
        Ok(report)
    }

    /// Run missed boundaries back to back until the backlog is empty or a
    /// peer's batch is missing.
    pub fn fast_forward(&mut self) -> Result<BoundaryReport> {
        let mut report = BoundaryReport::default();
        while self.clock.backlog() > 0 {
            report.outbound.extend(self.flush_local());
            if self.clock.is_paused() {
                break;
            }
            if !self.intake.is_ready(self.clock.tick() + 1) {
                report.stalled = true;
                break;
            }
            self.clock.take_missed();
            if let StepOutcome::Advanced(step) = self.step()? {
                report.steps.push(step);
            }
        }
        Ok(report)
    }

    /// Snapshot the run for persistence.
    #[must_use]
    pub fn snapshot(&self) -> SaveGame {
        SaveGame::new(
            Vec::new(),
            self.world.clone(),
            self.clock.cursor(),
            self.rng.snapshot(),
        )
    }

    /// Start recording executed batches into a replay.
    pub fn start_recording(&mut self) {
        self.recording = Some(Replay::new(self.snapshot(), self.lockstep_delay));
    }

    /// Stop recording and return the finalized replay.
    pub fn finish_recording(&mut self) -> Option<Replay> {
        let mut replay = self.recording.take()?;
        replay.finalize(self.clock.tick(), self.world.state_hash());
        Some(replay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::MovableType;
    use crate::dispatcher::HeadlessUi;
    use crate::grid::{GridPos, MapGrid};
    use crate::persistence::{MemorySaveSink, NullSaveSink};

    fn config(player_count: u8, local_player: PlayerId) -> LockstepConfig {
        LockstepConfig {
            player_count,
            local_player,
            lockstep_delay: 1,
            seed: 11,
            map_width: 24,
            map_height: 24,
            ..Default::default()
        }
    }

    fn context(player_count: u8, local_player: PlayerId) -> SimulationContext {
        let config = config(player_count, local_player);
        let world = World::new(MapGrid::new(24, 24), player_count);
        SimulationContext::new(&config, world, Box::new(HeadlessUi), Box::new(NullSaveSink))
            .unwrap()
    }

    #[test]
    fn test_player_count_mismatch() {
        let world = World::new(MapGrid::new(8, 8), 3);
        let result = SimulationContext::new(
            &config(2, 0),
            world,
            Box::new(HeadlessUi),
            Box::new(NullSaveSink),
        );
        assert!(matches!(result, Err(CoreError::Config(_))));
    }

    #[test]
    fn test_single_player_runs_submitted_commands() {
        let mut ctx = context(1, 0);
        let id = ctx
            .world_mut()
            .spawn_movable(0, MovableType::Bearer, GridPos::new(2, 2))
            .unwrap();

        ctx.submit(Command::StopWorking { selection: vec![id] });
        for _ in 0..3 {
            ctx.on_boundary().unwrap();
        }
        assert_eq!(ctx.tick(), 3);
        assert!(!ctx.world().movable(id).unwrap().working);
        assert_eq!(ctx.stats().applied, 1);
    }

    #[test]
    fn test_missing_peer_batch_stalls_and_catches_up() {
        let mut ctx = context(2, 0);
        // tick 1 lies inside the delay window
        let first = ctx.on_boundary().unwrap();
        assert_eq!(first.outbound, vec![CommandBatch::empty(2, 0)]);
        assert_eq!(ctx.tick(), 1);

        let stalled = ctx.on_boundary().unwrap();
        assert!(stalled.stalled);
        assert_eq!(stalled.outbound, vec![CommandBatch::empty(3, 0)]);
        assert_eq!(ctx.tick(), 1);
        assert_eq!(ctx.clock().backlog(), 1);

        ctx.accept_remote(CommandBatch::empty(2, 1)).unwrap();
        ctx.accept_remote(CommandBatch::empty(3, 1)).unwrap();
        let report = ctx.on_boundary().unwrap();
        assert_eq!(report.steps.len(), 2);
        assert_eq!(report.outbound, vec![CommandBatch::empty(4, 0)]);
        assert_eq!(ctx.tick(), 3);
        assert_eq!(ctx.clock().backlog(), 0);
    }

    #[test]
    fn test_paused_context_does_not_advance() {
        let mut ctx = context(1, 0);
        ctx.clock_mut().pause();
        assert_eq!(ctx.step().unwrap(), StepOutcome::Paused);
        let report = ctx.on_boundary().unwrap();
        assert!(report.steps.is_empty());
        assert_eq!(ctx.clock().backlog(), 0);
        assert!(ctx.apply_boundary(Vec::new()).is_err());
    }

    #[test]
    fn test_quick_save_restores_to_same_future() {
        let sink = MemorySaveSink::new();
        let mut ctx = SimulationContext::new(
            &config(1, 0),
            World::new(MapGrid::new(24, 24), 1),
            Box::new(HeadlessUi),
            Box::new(sink.clone()),
        )
        .unwrap();
        ctx.world_mut()
            .spawn_movable(0, MovableType::Swordsman, GridPos::new(3, 3));
        ctx.submit(Command::Build {
            pos: GridPos::new(10, 10),
            building: crate::command::BuildingType::Tower,
        });
        ctx.submit(Command::QuickSave);
        // both commands execute at tick 2
        ctx.on_boundary().unwrap();
        ctx.on_boundary().unwrap();

        let saves = sink.saves();
        assert_eq!(saves.len(), 1);
        let save = SaveGame::decode(&saves[0].1).unwrap();
        let mut restored =
            SimulationContext::restore(save, 0, 1, Box::new(HeadlessUi), Box::new(NullSaveSink))
                .unwrap();
        assert_eq!(restored.tick(), ctx.tick());
        assert_eq!(restored.state_hash(), ctx.state_hash());

        for _ in 0..30 {
            let a = ctx.apply_boundary(Vec::new()).unwrap();
            let b = restored.apply_boundary(Vec::new()).unwrap();
            assert_eq!(a.state_hash, b.state_hash);
        }
        assert_eq!(restored.rng().snapshot(), ctx.rng().snapshot());
        assert!(ctx.stats().scans > 0);
    }

    #[test]
    fn test_recording_captures_batches() {
        let mut ctx = context(1, 0);
        ctx.start_recording();
        ctx.submit(Command::QuickSave);
        for _ in 0..4 {
            ctx.on_boundary().unwrap();
        }
        let replay = ctx.finish_recording().unwrap();
        assert_eq!(replay.command_count(), 1);
        assert_eq!(replay.final_tick, 4);
        assert!(ctx.finish_recording().is_none());
    }
}
