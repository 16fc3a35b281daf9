//! Save and restore.
//!
//! A save is one bincode stream holding, in order: the per-player
//! snapshots, the world, the clock cursor and the RNG state. Restoring
//! rebuilds clock and RNG from the last two records before any simulation
//! logic runs, so a resumed run continues at the same tick with the same
//! random sequence.
//!
//! Disk access goes through [`SaveSink`]; the core itself never decides
//! where bytes end up.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::clock::ClockCursor;
use crate::command::{PlayerId, Tick};
use crate::error::{CoreError, Result};
use crate::grid::GridPos;
use crate::rng::RngState;
use crate::world::{FogOfWar, World};

/// Save format version.
pub const SAVE_VERSION: u32 = 1;

/// Camera and selection state of the local user interface.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UiState {
    /// Cell the camera is centered on.
    pub camera_center: GridPos,
    /// Zoom level.
    pub zoom: u8,
}

/// Per-player record written at the start of a save.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PlayerSnapshot {
    /// Player id.
    pub player: PlayerId,
    /// Position of one of the player's fortified buildings, if any.
    pub fortified_building: Option<GridPos>,
    /// Live UI state, only for the player who requested the save.
    pub ui_state: Option<UiState>,
    /// Fog of war, only for the player who requested the save.
    pub fog: Option<FogOfWar>,
}

/// A complete save.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaveGame {
    /// Format version.
    pub version: u32,
    /// Player snapshots.
    pub players: Vec<PlayerSnapshot>,
    /// Simulation state.
    pub world: World,
    /// Clock cursor.
    pub clock: ClockCursor,
    /// Random generator state.
    pub rng: RngState,
}

impl SaveGame {
    /// Assemble a save from its parts.
    #[must_use]
    pub const fn new(
        players: Vec<PlayerSnapshot>,
        world: World,
        clock: ClockCursor,
        rng: RngState,
    ) -> Self {
        Self {
            version: SAVE_VERSION,
            players,
            world,
            clock,
            rng,
        }
    }

    /// Tick the save was taken at.
    #[must_use]
    pub const fn tick(&self) -> Tick {
        self.clock.tick
    }

    /// Encode to the save byte stream.
    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self)
            .map_err(|e| CoreError::Persistence(format!("Failed to serialize save: {e}")))
    }

    /// Decode a save byte stream, checking the version and the world.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let save: Self = bincode::deserialize(data)
            .map_err(|e| CoreError::Persistence(format!("Failed to deserialize save: {e}")))?;
        if save.version != SAVE_VERSION {
            return Err(CoreError::Persistence(format!(
                "Save version mismatch: expected {SAVE_VERSION}, got {}",
                save.version
            )));
        }
        save.world.validate()?;
        for fog in save.players.iter().filter_map(|p| p.fog.as_ref()) {
            fog.validate()?;
        }
        Ok(save)
    }

    /// Load and decode a save file.
    pub fn load_file(path: &Path) -> Result<Self> {
        let data = fs::read(path)
            .map_err(|e| CoreError::Persistence(format!("{}: {e}", path.display())))?;
        Self::decode(&data)
    }
}

/// Destination for encoded saves.
pub trait SaveSink: Send {
    /// Store one save. Errors are reported to the caller and not retried.
    fn store(&mut self, tick: Tick, data: &[u8]) -> Result<()>;
}

/// Writes `quicksave-<tick>.sav` files into a directory.
#[derive(Debug, Clone)]
pub struct FileSaveSink {
    dir: PathBuf,
}

impl FileSaveSink {
    /// Create a sink writing into `dir`. The directory is created on first save.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Path of the file a save at `tick` is written to.
    #[must_use]
    pub fn path_for(&self, tick: Tick) -> PathBuf {
        self.dir.join(format!("quicksave-{tick}.sav"))
    }
}

impl SaveSink for FileSaveSink {
    fn store(&mut self, tick: Tick, data: &[u8]) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        let path = self.path_for(tick);
        fs::write(&path, data)
            .map_err(|e| CoreError::Persistence(format!("{}: {e}", path.display())))?;
        info!(tick, path = %path.display(), bytes = data.len(), "Quick save written");
        Ok(())
    }
}

/// Keeps saves in memory. Clones share the same storage.
#[derive(Debug, Clone, Default)]
pub struct MemorySaveSink {
    saves: Arc<Mutex<Vec<(Tick, Vec<u8>)>>>,
}

impl MemorySaveSink {
    /// Create an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All stored saves in store order.
    #[must_use]
    pub fn saves(&self) -> Vec<(Tick, Vec<u8>)> {
        self.saves
            .lock()
            .map(|saves| saves.clone())
            .unwrap_or_default()
    }
}

impl SaveSink for MemorySaveSink {
    fn store(&mut self, tick: Tick, data: &[u8]) -> Result<()> {
        let mut saves = self
            .saves
            .lock()
            .map_err(|_| CoreError::Persistence("save storage poisoned".into()))?;
        saves.push((tick, data.to_vec()));
        Ok(())
    }
}

/// Sink that drops every save, for runs without persistence.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSaveSink;

impl SaveSink for NullSaveSink {
    fn store(&mut self, _tick: Tick, _data: &[u8]) -> Result<()> {
        Ok(())
    }
}
