//! Map grid queries used by command validation.
//!
//! The grid uses the hex layout of the original map format: every cell
//! `(x, y)` has the six neighbours `(x+1, y)`, `(x+1, y+1)`, `(x, y+1)`,
//! `(x-1, y)`, `(x-1, y-1)` and `(x, y-1)`. Partitions are opaque ids of
//! connected walkable regions; cells in different partitions can never
//! reach each other.

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// A cell position on the map.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct GridPos {
    /// Column.
    pub x: i32,
    /// Row.
    pub y: i32,
}

impl GridPos {
    /// Create a new position.
    #[must_use]
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    /// Offset this position by a delta, saturating at the `i32` range.
    #[must_use]
    pub const fn offset(self, dx: i32, dy: i32) -> Self {
        Self {
            x: self.x.saturating_add(dx),
            y: self.y.saturating_add(dy),
        }
    }

    /// Hex distance between two cells.
    #[must_use]
    pub fn hex_distance(self, other: Self) -> u32 {
        let dx = i64::from(other.x) - i64::from(self.x);
        let dy = i64::from(other.y) - i64::from(self.y);
        let distance = if (dx >= 0) == (dy >= 0) {
            dx.unsigned_abs().max(dy.unsigned_abs())
        } else {
            dx.unsigned_abs() + dy.unsigned_abs()
        };
        u32::try_from(distance).unwrap_or(u32::MAX)
    }
}

/// Neighbour offsets in ring traversal order.
const HEX_DIRECTIONS: [(i32, i32); 6] = [(1, 0), (1, 1), (0, 1), (-1, 0), (-1, -1), (0, -1)];

/// Iterator over the border cells of a hexagon with a given radius.
///
/// A ring of radius `r >= 1` yields exactly `6 * r` cells, starting at
/// `center + (r, 0)` and walking counter-clockwise. Radius 0 yields the
/// center only. The order is fixed so that every peer assigns the same
/// ring cells to the same units.
#[derive(Debug, Clone)]
pub struct HexRing {
    center: GridPos,
    radius: i32,
    side: usize,
    step: i32,
    done: bool,
}

impl HexRing {
    /// Create a ring iterator around `center`.
    #[must_use]
    pub fn new(center: GridPos, radius: u16) -> Self {
        Self {
            center,
            radius: i32::from(radius),
            side: 0,
            step: 0,
            done: false,
        }
    }
}

impl Iterator for HexRing {
    type Item = GridPos;

    fn next(&mut self) -> Option<GridPos> {
        if self.done {
            return None;
        }
        if self.radius == 0 {
            self.done = true;
            return Some(self.center);
        }

        let (cx, cy) = HEX_DIRECTIONS[self.side];
        let (wx, wy) = HEX_DIRECTIONS[(self.side + 2) % 6];
        let pos = self
            .center
            .offset(cx * self.radius + wx * self.step, cy * self.radius + wy * self.step);

        self.step += 1;
        if self.step == self.radius {
            self.step = 0;
            self.side += 1;
            if self.side == HEX_DIRECTIONS.len() {
                self.done = true;
            }
        }
        Some(pos)
    }
}

/// Partition id of a blocked cell.
pub const BLOCKED_PARTITION: u16 = 0;

/// Static map data: bounds, blocked cells and partitions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MapGrid {
    width: u32,
    height: u32,
    /// Partition id per cell in row-major order; [`BLOCKED_PARTITION`] marks blocked cells.
    partitions: Vec<u16>,
}

impl MapGrid {
    /// Create a grid where every cell is walkable and in partition 1.
    #[must_use]
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            partitions: vec![1; (width as usize) * (height as usize)],
        }
    }

    /// Grid width in cells.
    #[must_use]
    pub const fn width(&self) -> u32 {
        self.width
    }

    /// Grid height in cells.
    #[must_use]
    pub const fn height(&self) -> u32 {
        self.height
    }

    fn index(&self, pos: GridPos) -> Option<usize> {
        if self.in_bounds(pos) {
            Some((pos.y as usize) * (self.width as usize) + (pos.x as usize))
        } else {
            None
        }
    }

    /// Check if a position lies on the map.
    #[must_use]
    pub fn in_bounds(&self, pos: GridPos) -> bool {
        pos.x >= 0 && pos.y >= 0 && (pos.x as u32) < self.width && (pos.y as u32) < self.height
    }

    /// Check if a cell is blocked. Out-of-bounds cells count as blocked.
    #[must_use]
    pub fn is_blocked(&self, pos: GridPos) -> bool {
        self.partition(pos).map_or(true, |p| p == BLOCKED_PARTITION)
    }

    /// Partition id of a cell, `None` when out of bounds.
    #[must_use]
    pub fn partition(&self, pos: GridPos) -> Option<u16> {
        self.index(pos).map(|i| self.partitions[i])
    }

    /// Check that the stored cells match the stated dimensions.
    ///
    /// A grid read from untrusted bytes must pass this before any query.
    pub fn validate(&self) -> Result<()> {
        check_cell_count("map grid", self.width, self.height, self.partitions.len())
    }

    /// Block a cell. Returns `false` if out of bounds.
    pub fn set_blocked(&mut self, pos: GridPos) -> bool {
        self.set_partition(pos, BLOCKED_PARTITION)
    }

    /// Assign a partition id to a cell. Returns `false` if out of bounds.
    pub fn set_partition(&mut self, pos: GridPos, partition: u16) -> bool {
        match self.index(pos) {
            Some(i) => {
                self.partitions[i] = partition;
                true
            }
            None => false,
        }
    }
}

/// Fail unless `len` equals `width * height`.
pub(crate) fn check_cell_count(what: &str, width: u32, height: u32, len: usize) -> Result<()> {
    let expected = u64::from(width) * u64::from(height);
    if u64::try_from(len).map_or(true, |len| len != expected) {
        return Err(CoreError::Persistence(format!(
            "Corrupt {what}: {width}x{height} needs {expected} cells, found {len}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_ring_sizes() {
        let center = GridPos::new(10, 10);
        assert_eq!(HexRing::new(center, 0).count(), 1);
        for radius in 1..=6u16 {
            assert_eq!(HexRing::new(center, radius).count(), 6 * radius as usize);
        }
    }

    #[test]
    fn test_ring_cells_are_at_radius_and_unique() {
        let center = GridPos::new(20, 20);
        for radius in 1..=4u16 {
            let cells: Vec<GridPos> = HexRing::new(center, radius).collect();
            let unique: HashSet<GridPos> = cells.iter().copied().collect();
            assert_eq!(unique.len(), cells.len());
            for cell in cells {
                assert_eq!(center.hex_distance(cell), u32::from(radius));
            }
        }
    }

    #[test]
    fn test_ring_one_order_is_fixed() {
        let cells: Vec<GridPos> = HexRing::new(GridPos::new(0, 0), 1).collect();
        assert_eq!(
            cells,
            vec![
                GridPos::new(1, 0),
                GridPos::new(1, 1),
                GridPos::new(0, 1),
                GridPos::new(-1, 0),
                GridPos::new(-1, -1),
                GridPos::new(0, -1),
            ]
        );
    }

    #[test]
    fn test_ring_at_coordinate_limit_saturates() {
        let center = GridPos::new(i32::MAX, i32::MIN);
        let cells: Vec<GridPos> = HexRing::new(center, 6).collect();
        assert_eq!(cells.len(), 36);
        assert_eq!(cells[0], center);
        assert_eq!(center.hex_distance(GridPos::new(0, 0)), u32::MAX);
    }

    #[test]
    fn test_validate_rejects_mismatched_cells() {
        let mut grid = MapGrid::new(4, 3);
        assert!(grid.validate().is_ok());
        grid.width = 100;
        assert!(matches!(grid.validate(), Err(CoreError::Persistence(_))));
    }

    #[test]
    fn test_grid_bounds_and_blocking() {
        let mut grid = MapGrid::new(4, 3);
        assert!(grid.in_bounds(GridPos::new(3, 2)));
        assert!(!grid.in_bounds(GridPos::new(4, 0)));
        assert!(!grid.in_bounds(GridPos::new(-1, 0)));
        assert!(grid.is_blocked(GridPos::new(-1, 0)));

        assert!(grid.set_blocked(GridPos::new(1, 1)));
        assert!(grid.is_blocked(GridPos::new(1, 1)));
        assert_eq!(grid.partition(GridPos::new(1, 1)), Some(BLOCKED_PARTITION));
        assert!(!grid.set_blocked(GridPos::new(9, 9)));
    }

    #[test]
    fn test_partitions() {
        let mut grid = MapGrid::new(4, 4);
        grid.set_partition(GridPos::new(3, 3), 7);
        assert_eq!(grid.partition(GridPos::new(3, 3)), Some(7));
        assert_eq!(grid.partition(GridPos::new(0, 0)), Some(1));
        assert_eq!(grid.partition(GridPos::new(5, 0)), None);
    }
}
