//! Scheduling clock.
//!
//! The clock is the single source of simulation time. Each boundary
//! advances the tick by one, releases every piece of scheduled work whose
//! deadline has been reached and runs each registered periodic task once.
//!
//! Scheduled work lives in a min-heap keyed by `(deadline, player,
//! sequence)`. The sequence number is assigned on insertion and persisted
//! with the cursor, so two clocks holding the same cursor release work in
//! the same order.
//!
//! The clock never reads the wall clock. The driver (the session runtime)
//! asks for [`SchedulingClock::boundary_interval`] and waits itself, and
//! reports boundaries it could not run on time through
//! [`SchedulingClock::record_missed`].

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::command::{CommandBatch, PlayerId, Tick};
use crate::error::{CoreError, Result};
use crate::grid::GridPos;
use crate::math::{fixed_serde, scaled_period_micros, Fixed};

/// Work released by the clock when its deadline tick is reached.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScheduledWork {
    /// One player's command batch.
    Commands(CommandBatch),
    /// Soldier scan of the fortified building at a position.
    BuildingScan(GridPos),
}

/// One entry of the pending schedule.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PendingWork {
    /// Tick at which the work is released.
    pub deadline: Tick,
    /// Player the work belongs to.
    pub player: PlayerId,
    /// Insertion order, breaks ties.
    pub sequence: u64,
    /// The work itself.
    pub work: ScheduledWork,
}

impl PendingWork {
    const fn key(&self) -> (Tick, PlayerId, u64) {
        (self.deadline, self.player, self.sequence)
    }
}

impl Ord for PendingWork {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

impl PartialOrd for PendingWork {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A boundary that has fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Boundary {
    /// Tick reached at this boundary.
    pub tick: Tick,
    /// Logical game time in milliseconds at this boundary.
    pub game_time_ms: u64,
}

/// Everything a boundary released.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundaryWork {
    /// The boundary.
    pub boundary: Boundary,
    /// Work due at this tick, in schedule order.
    pub due: Vec<ScheduledWork>,
}

/// Background work run once per boundary.
///
/// Tasks run on the clock's owner, one after another. An error is logged
/// and the task runs again at the next boundary.
pub trait PeriodicTask: Send {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Run the task for one boundary.
    fn run(&mut self, boundary: &Boundary) -> Result<()>;
}

/// Serializable clock state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClockCursor {
    /// Base period of one tick in milliseconds.
    pub period_ms: u32,
    /// Speed multiplier.
    #[serde(with = "fixed_serde")]
    pub speed: Fixed,
    /// Current tick.
    pub tick: Tick,
    /// Logical game time in milliseconds.
    pub game_time_ms: u64,
    /// Boundaries missed and not yet fast-forwarded.
    pub backlog: u64,
    /// Next insertion sequence number.
    pub next_sequence: u64,
    /// Pending schedule in release order.
    pub pending: Vec<PendingWork>,
}

/// The scheduling clock.
pub struct SchedulingClock {
    period_ms: u32,
    speed: Fixed,
    paused: bool,
    tick: Tick,
    game_time_ms: u64,
    backlog: u64,
    next_sequence: u64,
    pending: BinaryHeap<Reverse<PendingWork>>,
    tasks: Vec<Box<dyn PeriodicTask>>,
}

impl std::fmt::Debug for SchedulingClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulingClock")
            .field("period_ms", &self.period_ms)
            .field("speed", &self.speed)
            .field("paused", &self.paused)
            .field("tick", &self.tick)
            .field("backlog", &self.backlog)
            .field("pending", &self.pending.len())
            .field("tasks", &self.tasks.len())
            .finish()
    }
}

impl SchedulingClock {
    /// Create a clock at tick 0.
    pub fn new(period_ms: u32, speed: Fixed) -> Result<Self> {
        if period_ms == 0 {
            return Err(CoreError::Config("tick period must be positive".into()));
        }
        validate_speed(speed)?;
        Ok(Self {
            period_ms,
            speed,
            paused: false,
            tick: 0,
            game_time_ms: 0,
            backlog: 0,
            next_sequence: 0,
            pending: BinaryHeap::new(),
            tasks: Vec::new(),
        })
    }

    /// Rebuild a clock from a saved cursor.
    ///
    /// Periodic tasks are not part of the cursor and must be registered again.
    pub fn from_cursor(cursor: ClockCursor) -> Result<Self> {
        let mut clock = Self::new(cursor.period_ms, cursor.speed)?;
        clock.tick = cursor.tick;
        clock.game_time_ms = cursor.game_time_ms;
        clock.backlog = cursor.backlog;
        clock.next_sequence = cursor.next_sequence;
        clock.pending = cursor.pending.into_iter().map(Reverse).collect();
        Ok(clock)
    }

    /// Capture the clock state.
    #[must_use]
    pub fn cursor(&self) -> ClockCursor {
        let mut pending: Vec<PendingWork> = self.pending.iter().map(|r| r.0.clone()).collect();
        pending.sort();
        ClockCursor {
            period_ms: self.period_ms,
            speed: self.speed,
            tick: self.tick,
            game_time_ms: self.game_time_ms,
            backlog: self.backlog,
            next_sequence: self.next_sequence,
            pending,
        }
    }

    /// Current tick.
    #[must_use]
    pub const fn tick(&self) -> Tick {
        self.tick
    }

    /// Logical game time in milliseconds.
    #[must_use]
    pub const fn game_time_ms(&self) -> u64 {
        self.game_time_ms
    }

    /// Current speed multiplier.
    #[must_use]
    pub const fn speed(&self) -> Fixed {
        self.speed
    }

    /// Whether the clock is paused.
    #[must_use]
    pub const fn is_paused(&self) -> bool {
        self.paused
    }

    /// Missed boundaries waiting for [`Self::fast_forward`].
    #[must_use]
    pub const fn backlog(&self) -> u64 {
        self.backlog
    }

    /// Number of pending schedule entries.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Wall-clock time between two boundaries at the current speed.
    #[must_use]
    pub fn boundary_interval(&self) -> Duration {
        Duration::from_micros(scaled_period_micros(self.period_ms, self.speed))
    }

    /// Change the speed for subsequent boundaries.
    pub fn set_speed(&mut self, speed: Fixed) -> Result<()> {
        validate_speed(speed)?;
        info!(tick = self.tick, speed = %speed, "Clock speed changed");
        self.speed = speed;
        Ok(())
    }

    /// Stop firing boundaries.
    pub fn pause(&mut self) {
        if !self.paused {
            info!(tick = self.tick, "Clock paused");
            self.paused = true;
        }
    }

    /// Resume firing boundaries.
    pub fn resume(&mut self) {
        if self.paused {
            info!(tick = self.tick, "Clock resumed");
            self.paused = false;
        }
    }

    /// Register a task to run at every boundary.
    pub fn register(&mut self, task: Box<dyn PeriodicTask>) {
        debug!(task = task.name(), "Periodic task registered");
        self.tasks.push(task);
    }

    /// Schedule work for a future tick.
    ///
    /// Deadlines at or before the current tick would never be released and
    /// are rejected.
    pub fn schedule(
        &mut self,
        deadline: Tick,
        player: PlayerId,
        work: ScheduledWork,
    ) -> Result<()> {
        if deadline <= self.tick {
            return Err(CoreError::InvalidState(format!(
                "deadline {deadline} is not after current tick {}",
                self.tick
            )));
        }
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.pending.push(Reverse(PendingWork {
            deadline,
            player,
            sequence,
            work,
        }));
        Ok(())
    }

    /// Report a boundary the driver could not run on time.
    ///
    /// Ignored while paused.
    pub fn record_missed(&mut self) {
        if !self.paused {
            self.backlog += 1;
        }
    }

    /// Consume one missed boundary. Returns `false` when the backlog is empty.
    pub fn take_missed(&mut self) -> bool {
        if self.backlog == 0 {
            return false;
        }
        self.backlog -= 1;
        true
    }

    /// Fire the next boundary unless paused.
    pub fn advance(&mut self) -> Option<BoundaryWork> {
        if self.paused {
            return None;
        }
        Some(self.fire())
    }

    /// Fire every missed boundary back to back.
    pub fn fast_forward(&mut self) -> Vec<BoundaryWork> {
        let mut fired = Vec::with_capacity(self.backlog as usize);
        while self.take_missed() {
            fired.push(self.fire());
        }
        if !fired.is_empty() {
            info!(boundaries = fired.len(), tick = self.tick, "Clock fast-forwarded");
        }
        fired
    }

    fn fire(&mut self) -> BoundaryWork {
        self.tick += 1;
        self.game_time_ms += u64::from(self.period_ms);
        let boundary = Boundary {
            tick: self.tick,
            game_time_ms: self.game_time_ms,
        };

        let mut due = Vec::new();
        while self
            .pending
            .peek()
            .is_some_and(|entry| entry.0.deadline <= self.tick)
        {
            if let Some(Reverse(entry)) = self.pending.pop() {
                due.push(entry.work);
            }
        }

        for task in &mut self.tasks {
            if let Err(e) = task.run(&boundary) {
                error!(
                    task = task.name(),
                    tick = boundary.tick,
                    error = %e,
                    "Periodic task failed"
                );
            }
        }

        debug!(tick = boundary.tick, due = due.len(), "Clock boundary");
        BoundaryWork { boundary, due }
    }
}

fn validate_speed(speed: Fixed) -> Result<()> {
    if speed <= Fixed::ZERO {
        return Err(CoreError::Config(format!(
            "speed multiplier must be positive, got {speed}"
        )));
    }
    Ok(())
}
