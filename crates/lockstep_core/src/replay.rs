//! Replay system for recording and playing back runs.
//!
//! A replay stores the state a run started from and every command batch it
//! executed. Because the core is deterministic, feeding the same batches
//! into a context restored from the same start state reproduces the run
//! exactly, which the recorded final hash verifies.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::command::{CommandBatch, Tick};
use crate::context::SimulationContext;
use crate::dispatcher::HeadlessUi;
use crate::error::{CoreError, Result};
use crate::persistence::{NullSaveSink, SaveGame};

/// Replay file format version for compatibility.
pub const REPLAY_VERSION: u32 = 1;

/// Complete replay data structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Replay {
    /// Replay format version.
    pub version: u32,
    /// Ticks between issuing and executing a command in the recorded run.
    pub lockstep_delay: u64,
    /// State the run started from.
    pub initial: SaveGame,
    /// Executed batches in execution order.
    pub batches: Vec<CommandBatch>,
    /// Tick the recording ended at.
    pub final_tick: Tick,
    /// World hash at the final tick.
    pub final_hash: u64,
}

impl Replay {
    /// Start a replay from a snapshot of the initial state.
    #[must_use]
    pub fn new(initial: SaveGame, lockstep_delay: u64) -> Self {
        let final_tick = initial.tick();
        let final_hash = initial.world.state_hash();
        Self {
            version: REPLAY_VERSION,
            lockstep_delay,
            initial,
            batches: Vec::new(),
            final_tick,
            final_hash,
        }
    }

    /// Record an executed batch. Empty batches are not stored.
    pub fn record_batch(&mut self, batch: &CommandBatch) {
        if !batch.is_empty() {
            self.batches.push(batch.clone());
        }
    }

    /// Finalize the replay with end state.
    pub fn finalize(&mut self, final_tick: Tick, final_hash: u64) {
        self.final_tick = final_tick;
        self.final_hash = final_hash;
    }

    /// Tick the recording started at.
    #[must_use]
    pub const fn start_tick(&self) -> Tick {
        self.initial.clock.tick
    }

    /// Recorded batches executed at `tick`.
    #[must_use]
    pub fn batches_at_tick(&self, tick: Tick) -> Vec<CommandBatch> {
        self.batches
            .iter()
            .filter(|batch| batch.tick == tick)
            .cloned()
            .collect()
    }

    /// Total number of recorded commands.
    #[must_use]
    pub fn command_count(&self) -> usize {
        self.batches.iter().map(|batch| batch.commands.len()).sum()
    }

    /// Encode the replay.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serialize(self)
            .map_err(|e| CoreError::Persistence(format!("Failed to serialize replay: {e}")))
    }

    /// Decode a replay, checking the version and the starting world.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let replay: Self = bincode::deserialize(bytes)
            .map_err(|e| CoreError::Persistence(format!("Failed to deserialize replay: {e}")))?;
        if replay.version != REPLAY_VERSION {
            return Err(CoreError::Persistence(format!(
                "Replay version mismatch: expected {REPLAY_VERSION}, got {}",
                replay.version
            )));
        }
        replay.initial.world.validate()?;
        Ok(replay)
    }

    /// Save the replay to a file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let bytes = self.to_bytes()?;
        std::fs::write(path.as_ref(), bytes)
            .map_err(|e| CoreError::Persistence(format!("Failed to write replay file: {e}")))
    }

    /// Load a replay from a file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let bytes = std::fs::read(path.as_ref())
            .map_err(|e| CoreError::Persistence(format!("Failed to read replay file: {e}")))?;
        Self::from_bytes(&bytes)
    }
}

/// Replay playback controller.
#[derive(Debug)]
pub struct ReplayPlayer {
    replay: Replay,
    context: SimulationContext,
}

impl ReplayPlayer {
    /// Create a player positioned at the start of the replay.
    pub fn new(replay: Replay) -> Result<Self> {
        let context = Self::fresh_context(&replay)?;
        Ok(Self { replay, context })
    }

    fn fresh_context(replay: &Replay) -> Result<SimulationContext> {
        SimulationContext::restore(
            replay.initial.clone(),
            0,
            replay.lockstep_delay,
            Box::new(HeadlessUi),
            Box::new(NullSaveSink),
        )
    }

    /// Current playback tick.
    #[must_use]
    pub const fn current_tick(&self) -> Tick {
        self.context.tick()
    }

    /// The context being driven.
    #[must_use]
    pub const fn context(&self) -> &SimulationContext {
        &self.context
    }

    /// Advance playback by one tick.
    ///
    /// Returns true if there are more ticks to play.
    pub fn advance(&mut self) -> Result<bool> {
        if self.current_tick() < self.replay.final_tick {
            let tick = self.current_tick() + 1;
            self.context
                .apply_boundary(self.replay.batches_at_tick(tick))?;
        }
        Ok(self.current_tick() < self.replay.final_tick)
    }

    /// Seek to a tick by replaying from the start.
    pub fn seek(&mut self, target_tick: Tick) -> Result<()> {
        self.context = Self::fresh_context(&self.replay)?;
        while self.current_tick() < target_tick.min(self.replay.final_tick) {
            self.advance()?;
        }
        Ok(())
    }

    /// Play to the end and compare the final hash.
    pub fn verify(mut self) -> Result<u64> {
        while self.advance()? {}
        let hash = self.context.state_hash();
        if hash != self.replay.final_hash {
            return Err(CoreError::DesyncDetected {
                tick: self.current_tick(),
                local_hash: hash,
                remote_hash: self.replay.final_hash,
            });
        }
        Ok(hash)
    }
}
