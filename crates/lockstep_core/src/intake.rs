//! Ordered command intake.
//!
//! Local commands and remote batches meet here before they reach the clock.
//! Commands submitted locally during tick `t` are flushed into one batch
//! that executes at `t + lockstep_delay + 1`; every peer sends exactly one
//! batch per tick, empty or not, so a tick is ready once a batch from every
//! player is present. Ticks within the delay window after the intake was
//! created have no batches and are always ready.
//!
//! At a ready tick, batches are released in ascending player id. That merge
//! order depends only on batch contents, never on arrival order.

use std::collections::BTreeMap;

use tracing::debug;

use crate::command::{Command, CommandBatch, PlayerId, Tick};
use crate::error::{CoreError, Result};

/// Buffer of local commands and received batches.
#[derive(Debug, Clone)]
pub struct CommandIntake {
    local_player: PlayerId,
    player_count: u8,
    lockstep_delay: u64,
    origin: Tick,
    next_local_tick: Tick,
    last_released: Tick,
    local: Vec<Command>,
    batches: BTreeMap<(Tick, PlayerId), CommandBatch>,
}

impl CommandIntake {
    /// Create an intake for a run starting at `origin`.
    pub fn new(
        local_player: PlayerId,
        player_count: u8,
        lockstep_delay: u64,
        origin: Tick,
    ) -> Result<Self> {
        if player_count == 0 || local_player >= player_count {
            return Err(CoreError::Config(format!(
                "local player {local_player} out of range for {player_count} players"
            )));
        }
        Ok(Self {
            local_player,
            player_count,
            lockstep_delay,
            origin,
            next_local_tick: origin + lockstep_delay + 1,
            last_released: origin,
            local: Vec::new(),
            batches: BTreeMap::new(),
        })
    }

    /// The local player id.
    #[must_use]
    pub const fn local_player(&self) -> PlayerId {
        self.local_player
    }

    /// Buffer a local command for the next flush.
    pub fn submit(&mut self, command: Command) {
        self.local.push(command);
    }

    /// Number of buffered local commands.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.local.len()
    }

    /// Turn buffered local commands into the batch for `current + delay + 1`.
    ///
    /// Returns `None` once the local batch for that tick has already been
    /// produced; the buffer is then kept for a later flush. The returned
    /// batch is also stored, and must be sent to every peer.
    pub fn flush_local(&mut self, current: Tick) -> Option<CommandBatch> {
        let target = current + self.lockstep_delay + 1;
        if self.next_local_tick > target {
            return None;
        }
        let tick = self.next_local_tick;
        self.next_local_tick += 1;
        let batch = CommandBatch::new(tick, self.local_player, std::mem::take(&mut self.local));
        debug!(tick, commands = batch.commands.len(), "Local batch flushed");
        self.batches.insert((tick, self.local_player), batch.clone());
        Some(batch)
    }

    /// Record a batch received from a peer.
    pub fn accept_remote(&mut self, batch: CommandBatch) -> Result<()> {
        if batch.player == self.local_player || batch.player >= self.player_count {
            return Err(CoreError::InvalidState(format!(
                "batch from unexpected player {}",
                batch.player
            )));
        }
        if batch.tick <= self.last_released.max(self.origin + self.lockstep_delay) {
            return Err(CoreError::InvalidState(format!(
                "batch for tick {} from player {} arrived after the tick was released",
                batch.tick, batch.player
            )));
        }
        let key = (batch.tick, batch.player);
        if self.batches.contains_key(&key) {
            return Err(CoreError::InvalidState(format!(
                "duplicate batch for tick {} from player {}",
                batch.tick, batch.player
            )));
        }
        self.batches.insert(key, batch);
        Ok(())
    }

    /// Whether every player's batch for `tick` is present.
    #[must_use]
    pub fn is_ready(&self, tick: Tick) -> bool {
        if tick <= self.origin + self.lockstep_delay {
            return true;
        }
        (0..self.player_count).all(|player| self.batches.contains_key(&(tick, player)))
    }

    /// Remove and return the batches for `tick` in ascending player order.
    ///
    /// Callers check [`Self::is_ready`] first; an implicitly ready tick
    /// yields no batches.
    pub fn release(&mut self, tick: Tick) -> Vec<CommandBatch> {
        self.last_released = self.last_released.max(tick);
        (0..self.player_count)
            .filter_map(|player| self.batches.remove(&(tick, player)))
            .collect()
    }
}
