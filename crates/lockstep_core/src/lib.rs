//! # Lockstep Core
//!
//! Deterministic command-synchronisation core for a lock-step RTS.
//!
//! This crate contains **only** deterministic logic:
//! - No network IO
//! - No system randomness
//! - No wall clock
//! - No floating-point math in the simulation (the speed multiplier is fixed-point)
//!
//! Every peer runs the full simulation locally and only exchanges command
//! batches. Given the same seed and the same batches, two contexts produce
//! bit-identical worlds.
//!
//! ## Crate Structure
//!
//! - [`command`] - Command variants and per-tick batches
//! - [`intake`] - Merging local and remote batches into one order
//! - [`clock`] - Scheduling clock with a persisted cursor
//! - [`dispatcher`] - Applies commands and scheduled work to the world
//! - [`rng`] - Seeded random generator
//! - [`world`] / [`grid`] - Simulation state and map queries
//! - [`context`] - One run's clock, RNG, world, dispatcher and intake
//! - [`persistence`] / [`replay`] - Saves and replays

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]

pub mod clock;
pub mod command;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod error;
pub mod grid;
pub mod intake;
pub mod math;
pub mod persistence;
pub mod replay;
pub mod rng;
pub mod world;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::clock::{Boundary, ClockCursor, PeriodicTask, ScheduledWork, SchedulingClock};
    pub use crate::command::{
        BuildingPriority, BuildingType, Command, CommandBatch, IssuedCommand, MaterialType,
        MovableId, MovableType, PlayerId, Tick,
    };
    pub use crate::config::LockstepConfig;
    pub use crate::context::{BoundaryReport, SimulationContext, StepOutcome, StepReport};
    pub use crate::dispatcher::{
        CommandDispatcher, DispatchOutcome, DispatchPhase, HeadlessUi, UiBridge,
    };
    pub use crate::error::{CoreError, Result};
    pub use crate::grid::{GridPos, HexRing, MapGrid};
    pub use crate::math::Fixed;
    pub use crate::persistence::{FileSaveSink, PlayerSnapshot, SaveGame, SaveSink, UiState};
    pub use crate::replay::{Replay, ReplayPlayer};
    pub use crate::rng::DeterministicRng;
    pub use crate::world::World;
}
