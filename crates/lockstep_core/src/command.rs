//! Command model.
//!
//! A [`Command`] is a self-contained description of one state-changing
//! action. Commands carry everything needed to replay the action on any
//! peer: positions, entity ids and enumerated sub-types. They never refer
//! to local UI state.

use serde::{Deserialize, Serialize};

use crate::grid::GridPos;

/// Player identifier.
pub type PlayerId = u8;

/// Identifier of a movable unit.
pub type MovableId = u32;

/// Lock-step tick number.
pub type Tick = u64;

/// Building types known to the command layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BuildingType {
    /// Fells trees.
    Lumberjack,
    /// Cuts stone.
    Stonecutter,
    /// Turns logs into planks.
    Sawmill,
    /// Grows wheat.
    Farm,
    /// Small military building.
    GuardHouse,
    /// Medium military building.
    Tower,
    /// Large military building.
    Castle,
}

impl BuildingType {
    /// Whether soldiers can occupy this building.
    #[must_use]
    pub const fn is_fortified(self) -> bool {
        matches!(self, Self::GuardHouse | Self::Tower | Self::Castle)
    }

    /// Whether the building has a work area that can be moved.
    #[must_use]
    pub const fn has_work_area(self) -> bool {
        matches!(self, Self::Lumberjack | Self::Stonecutter | Self::Farm)
    }
}

/// Movable unit types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MovableType {
    /// Carries materials; the base type for conversions.
    Bearer,
    /// Claims land.
    Pioneer,
    /// Searches for resources.
    Geologist,
    /// Steals from other players.
    Thief,
    /// Melee soldier.
    Swordsman,
    /// Ranged soldier.
    Bowman,
}

impl MovableType {
    /// Whether this type can be converted into `target`.
    ///
    /// Only bearers convert into specialists, and specialists convert back.
    #[must_use]
    pub const fn can_convert_to(self, target: Self) -> bool {
        match (self, target) {
            (Self::Bearer, Self::Pioneer | Self::Geologist | Self::Thief) => true,
            (Self::Pioneer | Self::Geologist | Self::Thief, Self::Bearer) => true,
            _ => false,
        }
    }

    /// Whether this type is a soldier.
    #[must_use]
    pub const fn is_soldier(self) -> bool {
        matches!(self, Self::Swordsman | Self::Bowman)
    }
}

/// Materials distributed by material managers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MaterialType {
    /// Planks.
    Plank,
    /// Stone.
    Stone,
    /// Coal.
    Coal,
    /// Iron ore.
    IronOre,
    /// Bread.
    Bread,
}

/// Number of material types.
pub const MATERIAL_TYPE_COUNT: usize = 5;

/// Work priority of a building.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum BuildingPriority {
    /// Building receives no materials.
    Stopped,
    /// Normal priority.
    #[default]
    Normal,
    /// Served before normal buildings.
    High,
}

/// One user or network action.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Command {
    /// Place a construction site.
    Build {
        /// Building position.
        pos: GridPos,
        /// Building type.
        building: BuildingType,
    },
    /// Destroy the building at a position.
    DestroyBuilding {
        /// Building position.
        pos: GridPos,
    },
    /// Move the selected units to a target.
    MoveTo {
        /// Destination cell.
        target: GridPos,
        /// Selected unit ids, in selection order.
        selection: Vec<MovableId>,
    },
    /// Move the work area of a building.
    SetWorkArea {
        /// Building position.
        building_pos: GridPos,
        /// New work-area center.
        center: GridPos,
    },
    /// Change the material priority of a building.
    SetBuildingPriority {
        /// Building position.
        building_pos: GridPos,
        /// New priority.
        priority: BuildingPriority,
    },
    /// Set how a material is distributed between consumer building types.
    SetMaterialDistribution {
        /// Position inside the managed partition.
        manager_pos: GridPos,
        /// Material being distributed.
        material: MaterialType,
        /// Integer weights per consumer slot.
        weights: Vec<u16>,
    },
    /// Set the order in which materials are transported.
    SetMaterialPriorities {
        /// Position inside the managed partition.
        manager_pos: GridPos,
        /// Materials, highest priority first.
        order: Vec<MaterialType>,
    },
    /// Kill the selected units.
    DestroyMovables {
        /// Selected unit ids.
        selection: Vec<MovableId>,
    },
    /// Let the selected units resume their work.
    StartWorking {
        /// Selected unit ids.
        selection: Vec<MovableId>,
    },
    /// Stop the selected units from working.
    StopWorking {
        /// Selected unit ids.
        selection: Vec<MovableId>,
    },
    /// Convert the selected units to another type.
    Convert {
        /// Selected unit ids.
        selection: Vec<MovableId>,
        /// Target type.
        target: MovableType,
    },
    /// Snapshot the game for the persistence boundary.
    QuickSave,
}

impl Command {
    /// Short name for logs.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Build { .. } => "build",
            Self::DestroyBuilding { .. } => "destroy_building",
            Self::MoveTo { .. } => "move_to",
            Self::SetWorkArea { .. } => "set_work_area",
            Self::SetBuildingPriority { .. } => "set_building_priority",
            Self::SetMaterialDistribution { .. } => "set_material_distribution",
            Self::SetMaterialPriorities { .. } => "set_material_priorities",
            Self::DestroyMovables { .. } => "destroy_movables",
            Self::StartWorking { .. } => "start_working",
            Self::StopWorking { .. } => "stop_working",
            Self::Convert { .. } => "convert",
            Self::QuickSave => "quick_save",
        }
    }
}

/// A command together with the player who issued it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IssuedCommand {
    /// Originating player.
    pub player: PlayerId,
    /// The action.
    pub command: Command,
}

impl IssuedCommand {
    /// Create a new issued command.
    #[must_use]
    pub const fn new(player: PlayerId, command: Command) -> Self {
        Self { player, command }
    }
}

/// All commands one player issued for one lock-step tick.
///
/// Every player sends exactly one batch per tick, empty or not, so that
/// peers know when a tick is complete.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CommandBatch {
    /// Tick at which the batch executes.
    pub tick: Tick,
    /// Issuing player.
    pub player: PlayerId,
    /// Commands in issue order.
    pub commands: Vec<Command>,
}

impl CommandBatch {
    /// Create a new batch.
    #[must_use]
    pub const fn new(tick: Tick, player: PlayerId, commands: Vec<Command>) -> Self {
        Self {
            tick,
            player,
            commands,
        }
    }

    /// Create an empty batch.
    #[must_use]
    pub const fn empty(tick: Tick, player: PlayerId) -> Self {
        Self::new(tick, player, Vec::new())
    }

    /// Whether the batch carries no commands.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Iterate the commands paired with the issuing player.
    pub fn issued(&self) -> impl Iterator<Item = IssuedCommand> + '_ {
        self.commands
            .iter()
            .map(move |command| IssuedCommand::new(self.player, command.clone()))
    }
}
