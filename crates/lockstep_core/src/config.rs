//! Run configuration.
//!
//! Loaded from a RON file by the node binary; tests build it in code.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::command::PlayerId;
use crate::error::{CoreError, Result};
use crate::math::Fixed;

/// Default frame length limit: 1 MiB.
pub const DEFAULT_MAX_PACKET_LEN: u32 = 1 << 20;

/// Settings for one lock-step run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockstepConfig {
    /// Base period of one tick in milliseconds.
    pub tick_period_ms: u32,
    /// Initial speed multiplier.
    pub initial_speed: f64,
    /// Ticks between issuing a command and executing it.
    pub lockstep_delay: u64,
    /// Seed shared by every peer.
    pub seed: u64,
    /// Number of players in the run.
    pub player_count: u8,
    /// Player controlled by this process.
    pub local_player: PlayerId,
    /// Map width in cells.
    pub map_width: u32,
    /// Map height in cells.
    pub map_height: u32,
    /// Largest accepted wire frame in bytes.
    pub max_packet_len: u32,
    /// Directory quick saves are written to.
    pub save_dir: PathBuf,
}

impl Default for LockstepConfig {
    fn default() -> Self {
        Self {
            tick_period_ms: 50,
            initial_speed: 1.0,
            lockstep_delay: 2,
            seed: 0,
            player_count: 2,
            local_player: 0,
            map_width: 64,
            map_height: 64,
            max_packet_len: DEFAULT_MAX_PACKET_LEN,
            save_dir: PathBuf::from("saves"),
        }
    }
}

impl LockstepConfig {
    /// Load a configuration from a RON file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let load_error = |message: String| CoreError::ConfigLoad {
            path: path.display().to_string(),
            message,
        };
        let contents = std::fs::read_to_string(path).map_err(|e| load_error(e.to_string()))?;
        let config: Self = ron::from_str(&contents).map_err(|e| load_error(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges.
    pub fn validate(&self) -> Result<()> {
        if self.tick_period_ms == 0 {
            return Err(CoreError::Config("tick_period_ms must be positive".into()));
        }
        self.speed()?;
        if self.player_count == 0 {
            return Err(CoreError::Config("player_count must be positive".into()));
        }
        if self.local_player >= self.player_count {
            return Err(CoreError::Config(format!(
                "local_player {} out of range for {} players",
                self.local_player, self.player_count
            )));
        }
        if self.map_width == 0 || self.map_height == 0 {
            return Err(CoreError::Config("map size must be positive".into()));
        }
        if self.max_packet_len == 0 {
            return Err(CoreError::Config("max_packet_len must be positive".into()));
        }
        Ok(())
    }

    /// Initial speed as a fixed-point multiplier.
    pub fn speed(&self) -> Result<Fixed> {
        match Fixed::checked_from_num(self.initial_speed) {
            Some(speed) if speed > Fixed::ZERO => Ok(speed),
            _ => Err(CoreError::Config(format!(
                "initial_speed must be positive, got {}",
                self.initial_speed
            ))),
        }
    }
}
