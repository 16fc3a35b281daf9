//! Simulation state mutated by the command dispatcher.
//!
//! This is the minimal slice of the game world the lock-step core needs:
//! units, buildings, per-partition material settings and each player's
//! fog of war. All collections are ordered maps so that iteration order,
//! and therefore every derived value, is the same on every peer.

use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::command::{
    BuildingPriority, BuildingType, MaterialType, MovableId, MovableType, PlayerId, Tick,
};
use crate::error::{CoreError, Result};
use crate::grid::{check_cell_count, GridPos, HexRing, MapGrid};
use crate::rng::DeterministicRng;

/// Base delay between two soldier scans of a fortified building.
pub const SCAN_PERIOD_TICKS: u64 = 10;

/// Upper bound (exclusive) of the random jitter added to each scan delay.
///
/// The jitter keeps buildings placed at the same time from scanning in the
/// same tick forever.
pub const SCAN_JITTER_TICKS: i32 = 4;

/// Radius revealed around a newly placed building.
pub const BUILDING_VISION_RADIUS: u16 = 4;

/// A unit on the map.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Movable {
    /// Unique id.
    pub id: MovableId,
    /// Owning player.
    pub player: PlayerId,
    /// Unit type.
    pub kind: MovableType,
    /// Current cell.
    pub pos: GridPos,
    /// Cell the unit was ordered to walk to.
    pub destination: Option<GridPos>,
    /// Whether the unit takes jobs.
    pub working: bool,
}

/// A building on the map.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Building {
    /// Cell the building stands on.
    pub pos: GridPos,
    /// Owning player.
    pub player: PlayerId,
    /// Building type.
    pub kind: BuildingType,
    /// Material priority.
    pub priority: BuildingPriority,
    /// Work-area center, for buildings that have one.
    pub work_area: Option<GridPos>,
    /// Soldiers inside a fortified building.
    pub occupants: u8,
}

impl Building {
    /// Number of soldiers a fortified building can hold.
    #[must_use]
    pub const fn capacity(&self) -> u8 {
        match self.kind {
            BuildingType::GuardHouse => 1,
            BuildingType::Tower => 3,
            BuildingType::Castle => 5,
            _ => 0,
        }
    }
}

/// Material settings of one partition's material manager.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MaterialSettings {
    /// Distribution weights per material.
    pub distribution: BTreeMap<MaterialType, Vec<u16>>,
    /// Transport order, highest priority first.
    pub priorities: Vec<MaterialType>,
}

/// Cells a player has seen.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FogOfWar {
    width: u32,
    height: u32,
    revealed: Vec<bool>,
}

impl FogOfWar {
    /// Create a fully hidden map.
    #[must_use]
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            revealed: vec![false; (width as usize) * (height as usize)],
        }
    }

    fn index(&self, pos: GridPos) -> Option<usize> {
        if pos.x >= 0 && pos.y >= 0 && (pos.x as u32) < self.width && (pos.y as u32) < self.height
        {
            Some((pos.y as usize) * (self.width as usize) + (pos.x as usize))
        } else {
            None
        }
    }

    /// Reveal every cell within `radius` of `center`.
    pub fn reveal(&mut self, center: GridPos, radius: u16) {
        for r in 0..=radius {
            for pos in HexRing::new(center, r) {
                if let Some(i) = self.index(pos) {
                    self.revealed[i] = true;
                }
            }
        }
    }

    /// Whether a cell has been seen.
    #[must_use]
    pub fn is_revealed(&self, pos: GridPos) -> bool {
        self.index(pos).is_some_and(|i| self.revealed[i])
    }

    /// Number of revealed cells.
    #[must_use]
    pub fn revealed_count(&self) -> usize {
        self.revealed.iter().filter(|r| **r).count()
    }

    /// Check that the stored cells match the stated dimensions.
    pub(crate) fn validate(&self) -> Result<()> {
        check_cell_count("fog of war", self.width, self.height, self.revealed.len())
    }
}

/// Result of a fortified building's soldier scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanOutcome {
    /// A soldier entered the building.
    Occupied(MovableId),
    /// No free soldier was available, or the building is full.
    Idle,
    /// The building no longer exists; stop rescheduling.
    Gone,
}

/// The mutable simulation state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct World {
    grid: MapGrid,
    player_count: u8,
    movables: BTreeMap<MovableId, Movable>,
    occupancy: BTreeMap<GridPos, MovableId>,
    buildings: BTreeMap<GridPos, Building>,
    materials: BTreeMap<u16, MaterialSettings>,
    fog: Vec<FogOfWar>,
    next_movable_id: MovableId,
}

impl World {
    /// Create an empty world on a grid.
    #[must_use]
    pub fn new(grid: MapGrid, player_count: u8) -> Self {
        let fog = (0..player_count)
            .map(|_| FogOfWar::new(grid.width(), grid.height()))
            .collect();
        Self {
            grid,
            player_count,
            movables: BTreeMap::new(),
            occupancy: BTreeMap::new(),
            buildings: BTreeMap::new(),
            materials: BTreeMap::new(),
            fog,
            next_movable_id: 1,
        }
    }

    /// The map grid.
    #[must_use]
    pub const fn grid(&self) -> &MapGrid {
        &self.grid
    }

    /// Mutable access to the map grid, for scenario setup.
    pub fn grid_mut(&mut self) -> &mut MapGrid {
        &mut self.grid
    }

    /// Number of players.
    #[must_use]
    pub const fn player_count(&self) -> u8 {
        self.player_count
    }

    // ------------------------------------------------------------------
    // Movables
    // ------------------------------------------------------------------

    /// Place a new unit. Returns `None` if the cell is blocked or taken.
    pub fn spawn_movable(
        &mut self,
        player: PlayerId,
        kind: MovableType,
        pos: GridPos,
    ) -> Option<MovableId> {
        if self.grid.is_blocked(pos) || self.occupancy.contains_key(&pos) {
            return None;
        }
        let id = self.next_movable_id;
        self.next_movable_id += 1;
        self.movables.insert(
            id,
            Movable {
                id,
                player,
                kind,
                pos,
                destination: None,
                working: true,
            },
        );
        self.occupancy.insert(pos, id);
        Some(id)
    }

    /// Look up a unit.
    #[must_use]
    pub fn movable(&self, id: MovableId) -> Option<&Movable> {
        self.movables.get(&id)
    }

    /// Look up a unit mutably.
    pub fn movable_mut(&mut self, id: MovableId) -> Option<&mut Movable> {
        self.movables.get_mut(&id)
    }

    /// Remove a unit from the map.
    pub fn remove_movable(&mut self, id: MovableId) -> Option<Movable> {
        let movable = self.movables.remove(&id)?;
        self.occupancy.remove(&movable.pos);
        Some(movable)
    }

    /// Unit standing on a cell.
    #[must_use]
    pub fn movable_at(&self, pos: GridPos) -> Option<MovableId> {
        self.occupancy.get(&pos).copied()
    }

    /// Number of units.
    #[must_use]
    pub fn movable_count(&self) -> usize {
        self.movables.len()
    }

    /// Iterate units in id order.
    pub fn movables(&self) -> impl Iterator<Item = &Movable> {
        self.movables.values()
    }

    // ------------------------------------------------------------------
    // Buildings
    // ------------------------------------------------------------------

    /// Place a building. Fails if the cell is blocked or already built on.
    pub fn place_building(
        &mut self,
        player: PlayerId,
        kind: BuildingType,
        pos: GridPos,
    ) -> Result<()> {
        if self.grid.is_blocked(pos) {
            return Err(CoreError::InvalidState(format!(
                "cannot build on blocked cell ({}, {})",
                pos.x, pos.y
            )));
        }
        if self.buildings.contains_key(&pos) {
            return Err(CoreError::InvalidState(format!(
                "cell ({}, {}) already has a building",
                pos.x, pos.y
            )));
        }
        self.buildings.insert(
            pos,
            Building {
                pos,
                player,
                kind,
                priority: BuildingPriority::default(),
                work_area: kind.has_work_area().then_some(pos),
                occupants: 0,
            },
        );
        if let Some(fog) = self.fog.get_mut(player as usize) {
            fog.reveal(pos, BUILDING_VISION_RADIUS);
        }
        Ok(())
    }

    /// Look up a building.
    #[must_use]
    pub fn building_at(&self, pos: GridPos) -> Option<&Building> {
        self.buildings.get(&pos)
    }

    /// Look up a building mutably.
    pub fn building_at_mut(&mut self, pos: GridPos) -> Option<&mut Building> {
        self.buildings.get_mut(&pos)
    }

    /// Remove a building.
    pub fn remove_building(&mut self, pos: GridPos) -> Option<Building> {
        self.buildings.remove(&pos)
    }

    /// Iterate buildings in position order.
    pub fn buildings(&self) -> impl Iterator<Item = &Building> {
        self.buildings.values()
    }

    /// First fortified building of a player, in position order.
    #[must_use]
    pub fn first_fortified_building(&self, player: PlayerId) -> Option<&Building> {
        self.buildings
            .values()
            .find(|b| b.player == player && b.kind.is_fortified())
    }

    /// Let a fortified building pull in the closest free soldier of its player.
    ///
    /// Candidates are working soldiers without a destination in the same
    /// partition; ties on distance go to the lower id.
    pub fn scan_for_soldier(&mut self, pos: GridPos) -> ScanOutcome {
        let Some(building) = self.buildings.get(&pos) else {
            return ScanOutcome::Gone;
        };
        if !building.kind.is_fortified() || building.occupants >= building.capacity() {
            return ScanOutcome::Idle;
        }
        let player = building.player;
        let partition = self.grid.partition(pos);

        let candidate = self
            .movables
            .values()
            .filter(|m| {
                m.player == player
                    && m.kind.is_soldier()
                    && m.working
                    && m.destination.is_none()
                    && self.grid.partition(m.pos) == partition
            })
            .min_by_key(|m| (m.pos.hex_distance(pos), m.id))
            .map(|m| m.id);

        match candidate {
            Some(id) => {
                self.remove_movable(id);
                if let Some(building) = self.buildings.get_mut(&pos) {
                    building.occupants += 1;
                }
                ScanOutcome::Occupied(id)
            }
            None => ScanOutcome::Idle,
        }
    }

    /// Delay until the next scan, drawn from the shared generator.
    pub fn next_scan_delay(rng: &mut DeterministicRng) -> Tick {
        SCAN_PERIOD_TICKS + rng.next_int(0, SCAN_JITTER_TICKS) as u64
    }

    // ------------------------------------------------------------------
    // Materials and visibility
    // ------------------------------------------------------------------

    /// Material settings of the partition containing `pos`, created on demand.
    ///
    /// Returns `None` for blocked or out-of-bounds positions.
    pub fn material_settings_mut(&mut self, pos: GridPos) -> Option<&mut MaterialSettings> {
        if self.grid.is_blocked(pos) {
            return None;
        }
        let partition = self.grid.partition(pos)?;
        Some(self.materials.entry(partition).or_default())
    }

    /// Material settings of a partition, if any were set.
    #[must_use]
    pub fn material_settings(&self, partition: u16) -> Option<&MaterialSettings> {
        self.materials.get(&partition)
    }

    /// A player's fog of war.
    #[must_use]
    pub fn fog_of_war(&self, player: PlayerId) -> Option<&FogOfWar> {
        self.fog.get(player as usize)
    }

    /// Hash of the complete world state, for desync detection.
    #[must_use]
    pub fn state_hash(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.hash(&mut hasher);
        hasher.finish()
    }

    /// Serialize the world for saves and replays.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serialize(self)
            .map_err(|e| CoreError::Persistence(format!("Failed to serialize world: {e}")))
    }

    /// Deserialize a world and check it with [`Self::validate`].
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let world: Self = bincode::deserialize(data)
            .map_err(|e| CoreError::Persistence(format!("Failed to deserialize world: {e}")))?;
        world.validate()?;
        Ok(world)
    }

    /// Check that a decoded world is internally consistent.
    ///
    /// Sizes stored in the grid and fog layers must agree with their cell
    /// vectors and with each other, every player needs a fog layer, and the
    /// occupancy index must point at live units standing on their cell.
    pub fn validate(&self) -> Result<()> {
        self.grid.validate()?;
        if self.fog.len() != usize::from(self.player_count) {
            return Err(CoreError::Persistence(format!(
                "Corrupt world: {} players but {} fog layers",
                self.player_count,
                self.fog.len()
            )));
        }
        for fog in &self.fog {
            fog.validate()?;
            if (fog.width, fog.height) != (self.grid.width(), self.grid.height()) {
                return Err(CoreError::Persistence(
                    "Corrupt world: fog of war does not match the map size".to_string(),
                ));
            }
        }
        let occupancy_ok = self.occupancy.len() == self.movables.len()
            && self
                .occupancy
                .iter()
                .all(|(pos, id)| self.movables.get(id).is_some_and(|m| m.pos == *pos));
        if !occupancy_ok {
            return Err(CoreError::Persistence(
                "Corrupt world: occupancy does not match units".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn world() -> World {
        World::new(MapGrid::new(32, 32), 2)
    }

    #[test]
    fn test_spawn_and_occupancy() {
        let mut w = world();
        let id = w
            .spawn_movable(0, MovableType::Bearer, GridPos::new(3, 3))
            .unwrap();
        assert_eq!(w.movable_at(GridPos::new(3, 3)), Some(id));
        assert!(w
            .spawn_movable(1, MovableType::Bearer, GridPos::new(3, 3))
            .is_none());

        w.remove_movable(id);
        assert!(w.movable_at(GridPos::new(3, 3)).is_none());
    }

    #[test]
    fn test_ids_are_not_reused() {
        let mut w = world();
        let a = w
            .spawn_movable(0, MovableType::Bearer, GridPos::new(1, 1))
            .unwrap();
        w.remove_movable(a);
        let b = w
            .spawn_movable(0, MovableType::Bearer, GridPos::new(1, 1))
            .unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_place_building_reveals_fog() {
        let mut w = world();
        w.place_building(1, BuildingType::Tower, GridPos::new(10, 10))
            .unwrap();
        let fog = w.fog_of_war(1).unwrap();
        assert!(fog.is_revealed(GridPos::new(10, 10)));
        assert!(fog.is_revealed(GridPos::new(14, 10)));
        assert!(!fog.is_revealed(GridPos::new(20, 20)));
        assert_eq!(w.fog_of_war(0).unwrap().revealed_count(), 0);
    }

    #[test]
    fn test_place_building_twice_fails() {
        let mut w = world();
        let pos = GridPos::new(5, 5);
        w.place_building(0, BuildingType::Farm, pos).unwrap();
        assert!(w.place_building(0, BuildingType::Farm, pos).is_err());
        assert_eq!(w.building_at(pos).unwrap().work_area, Some(pos));
    }

    #[test]
    fn test_scan_pulls_closest_soldier() {
        let mut w = world();
        let tower = GridPos::new(10, 10);
        w.place_building(0, BuildingType::Tower, tower).unwrap();
        let far = w
            .spawn_movable(0, MovableType::Swordsman, GridPos::new(20, 10))
            .unwrap();
        let near = w
            .spawn_movable(0, MovableType::Bowman, GridPos::new(12, 10))
            .unwrap();
        w.spawn_movable(1, MovableType::Swordsman, GridPos::new(11, 10));

        assert_eq!(w.scan_for_soldier(tower), ScanOutcome::Occupied(near));
        assert_eq!(w.scan_for_soldier(tower), ScanOutcome::Occupied(far));
        assert_eq!(w.scan_for_soldier(tower), ScanOutcome::Idle);
        assert_eq!(w.building_at(tower).unwrap().occupants, 2);
    }

    #[test]
    fn test_scan_on_missing_building_is_gone() {
        let mut w = world();
        assert_eq!(w.scan_for_soldier(GridPos::new(1, 1)), ScanOutcome::Gone);
    }

    #[test]
    fn test_state_hash_tracks_changes() {
        let mut a = world();
        let b = world();
        assert_eq!(a.state_hash(), b.state_hash());
        a.spawn_movable(0, MovableType::Bearer, GridPos::new(0, 0));
        assert_ne!(a.state_hash(), b.state_hash());
    }

    #[test]
    fn test_validate_rejects_missing_fog_layer() {
        let mut w = world();
        assert!(w.validate().is_ok());
        w.fog.pop();
        assert!(matches!(
            World::from_bytes(&w.to_bytes().unwrap()),
            Err(CoreError::Persistence(_))
        ));
    }

    #[test]
    fn test_validate_rejects_fog_of_other_size() {
        let mut w = world();
        w.fog[1] = FogOfWar::new(8, 8);
        assert!(matches!(w.validate(), Err(CoreError::Persistence(_))));
    }

    #[test]
    fn test_bytes_roundtrip_preserves_hash() {
        let mut w = world();
        w.spawn_movable(0, MovableType::Pioneer, GridPos::new(4, 4));
        w.place_building(1, BuildingType::Castle, GridPos::new(8, 8))
            .unwrap();
        let restored = World::from_bytes(&w.to_bytes().unwrap()).unwrap();
        assert_eq!(restored.state_hash(), w.state_hash());
    }
}
