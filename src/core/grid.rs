//! Canonical arena grid: one `CellType` per cell plus the grid to world mapping.
//!
//! Mutators are crate-private. The host reaches them through the
//! `RoundController`; mirrors only ever rebuild a grid from a snapshot.
use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::core::error::{ArenaError, ArenaResult};

/// Largest supported arena side. Bounds the allocation a snapshot can ask for.
pub const MAX_GRID_SIZE: i32 = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CellType {
    Empty,
    Wall,
    IndestructibleWall,
    PlayerSpawn,
    Bomb,
    PowerUp,
}

/// Per-variant behaviour, looked up instead of branching on names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellTraits {
    /// Stops a blast before reaching the cell.
    pub blocks_blast: bool,
    /// Destroyed by a blast, which then stops in that direction.
    pub destructible: bool,
    /// A bomb may be placed here.
    pub accepts_bomb: bool,
}

impl CellType {
    pub const fn traits(self) -> CellTraits {
        match self {
            CellType::Empty | CellType::PlayerSpawn => CellTraits {
                blocks_blast: false,
                destructible: false,
                accepts_bomb: true,
            },
            CellType::Wall => CellTraits {
                blocks_blast: false,
                destructible: true,
                accepts_bomb: false,
            },
            CellType::IndestructibleWall => CellTraits {
                blocks_blast: true,
                destructible: false,
                accepts_bomb: false,
            },
            CellType::Bomb | CellType::PowerUp => CellTraits {
                blocks_blast: false,
                destructible: false,
                accepts_bomb: false,
            },
        }
    }

    fn glyph(self) -> char {
        match self {
            CellType::Empty => '.',
            CellType::Wall => '+',
            CellType::IndestructibleWall => '#',
            CellType::PlayerSpawn => 'S',
            CellType::Bomb => 'B',
            CellType::PowerUp => 'P',
        }
    }
}

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct GridPos {
    pub x: i32,
    pub y: i32,
}

impl GridPos {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    pub const fn offset(self, dx: i32, dy: i32) -> Self {
        Self {
            x: self.x + dx,
            y: self.y + dy,
        }
    }
}

impl fmt::Display for GridPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WorldPos {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl WorldPos {
    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }
}

/// Placement of cell (0, 0) and the spacing between neighbouring cells.
///
/// Grid x runs along +world x, grid y along -world y.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GridGeometry {
    pub origin_x: f32,
    pub origin_y: f32,
    pub pitch: f32,
    pub elevation: f32,
}

impl Default for GridGeometry {
    fn default() -> Self {
        Self {
            origin_x: -352.0,
            origin_y: 352.0,
            pitch: 352.0 * 0.1825,
            elevation: 25.0,
        }
    }
}

impl GridGeometry {
    pub fn grid_to_world(&self, pos: GridPos) -> WorldPos {
        WorldPos {
            x: self.origin_x + pos.x as f32 * self.pitch,
            y: self.origin_y - pos.y as f32 * self.pitch,
            z: self.elevation,
        }
    }

    /// Nearest cell to a world position. Non-finite coordinates have no
    /// nearest cell and are rejected.
    pub fn world_to_grid(&self, world: WorldPos) -> ArenaResult<GridPos> {
        let x = (world.x - self.origin_x) / self.pitch;
        let y = (self.origin_y - world.y) / self.pitch;
        if !(x.is_finite() && y.is_finite()) {
            return Err(ArenaError::InvalidWorldPosition(world));
        }
        Ok(GridPos {
            x: x.round() as i32,
            y: y.round() as i32,
        })
    }

    pub fn validate(&self) -> ArenaResult<()> {
        if !(self.pitch.is_finite() && self.pitch > 0.0) {
            return Err(ArenaError::InvalidConfig(format!(
                "geometry pitch must be positive and finite, got {}",
                self.pitch
            )));
        }
        if ![self.origin_x, self.origin_y, self.elevation]
            .iter()
            .all(|v| v.is_finite())
        {
            return Err(ArenaError::InvalidConfig(
                "geometry origin and elevation must be finite".into(),
            ));
        }
        Ok(())
    }
}

/// Cell count of a `size` x `size` arena, or an error for unsupported sizes.
pub fn cell_count(size: i32) -> ArenaResult<usize> {
    if !(5..=MAX_GRID_SIZE).contains(&size) || size % 2 == 0 {
        return Err(ArenaError::InvalidConfig(format!(
            "grid size must be odd and within 5..={MAX_GRID_SIZE}, got {size}"
        )));
    }
    let side = size as usize;
    side.checked_mul(side)
        .ok_or_else(|| ArenaError::InvalidConfig(format!("grid size {size} overflows")))
}

#[derive(Debug, Clone, PartialEq)]
pub struct GridModel {
    size: i32,
    geometry: GridGeometry,
    cells: Vec<CellType>,
    world_positions: BTreeMap<GridPos, WorldPos>,
}

impl GridModel {
    /// Creates an all-`Empty` grid. The size must be odd and at least 5 so the
    /// corner, breathing-room and pillar layouts stay consistent.
    pub fn new(size: i32, geometry: GridGeometry) -> ArenaResult<Self> {
        let count = cell_count(size)?;
        Ok(Self {
            size,
            geometry,
            cells: vec![CellType::Empty; count],
            world_positions: BTreeMap::new(),
        })
    }

    pub fn size(&self) -> i32 {
        self.size
    }

    pub fn geometry(&self) -> &GridGeometry {
        &self.geometry
    }

    pub fn is_valid(&self, pos: GridPos) -> bool {
        (0..self.size).contains(&pos.x) && (0..self.size).contains(&pos.y)
    }

    pub fn index(&self, pos: GridPos) -> ArenaResult<usize> {
        if !self.is_valid(pos) {
            return Err(ArenaError::OutOfBounds {
                pos,
                size: self.size,
            });
        }
        Ok((pos.x + pos.y * self.size) as usize)
    }

    pub fn cell_type(&self, pos: GridPos) -> ArenaResult<CellType> {
        let idx = self.index(pos)?;
        Ok(self.cells[idx])
    }

    /// Writes a cell. Indestructible walls are immutable once set: the call is
    /// rejected with `Ok(false)`.
    pub(crate) fn set_cell_type(&mut self, pos: GridPos, value: CellType) -> ArenaResult<bool> {
        let idx = self.index(pos)?;
        let current = self.cells[idx];
        if current == CellType::IndestructibleWall {
            if value != CellType::IndestructibleWall {
                warn!(%pos, ?value, "refusing to overwrite indestructible wall");
            }
            return Ok(false);
        }
        self.cells[idx] = value;
        Ok(current != value)
    }

    /// Clears a cell to `Empty` unless it is an indestructible wall. Returns
    /// whether anything changed, so repeated clears are no-ops.
    pub(crate) fn clear_cell(&mut self, pos: GridPos) -> ArenaResult<bool> {
        let idx = self.index(pos)?;
        match self.cells[idx] {
            CellType::IndestructibleWall | CellType::Empty => Ok(false),
            _ => {
                self.cells[idx] = CellType::Empty;
                Ok(true)
            }
        }
    }

    pub fn grid_to_world(&self, pos: GridPos) -> WorldPos {
        self.geometry.grid_to_world(pos)
    }

    pub fn world_to_grid(&self, world: WorldPos) -> ArenaResult<GridPos> {
        self.geometry.world_to_grid(world)
    }

    /// Looks up the recorded placement of a cell. A missing entry means the
    /// caller queried a cell the generator never visited.
    pub fn world_position(&self, pos: GridPos) -> ArenaResult<WorldPos> {
        self.index(pos)?;
        self.world_positions
            .get(&pos)
            .copied()
            .ok_or(ArenaError::MissingWorldPosition(pos))
    }

    pub(crate) fn record_world_position(&mut self, pos: GridPos) -> ArenaResult<WorldPos> {
        self.index(pos)?;
        let world = self.geometry.grid_to_world(pos);
        self.world_positions.insert(pos, world);
        Ok(world)
    }

    pub fn world_positions(&self) -> &BTreeMap<GridPos, WorldPos> {
        &self.world_positions
    }

    pub fn cells(&self) -> &[CellType] {
        &self.cells
    }

    pub fn positions(&self) -> impl Iterator<Item = GridPos> + '_ {
        (0..self.size).flat_map(move |y| (0..self.size).map(move |x| GridPos::new(x, y)))
    }

    pub fn positions_of(&self, value: CellType) -> Vec<GridPos> {
        self.positions()
            .filter(|&pos| self.cells[(pos.x + pos.y * self.size) as usize] == value)
            .collect()
    }

    pub fn count(&self, value: CellType) -> usize {
        self.cells.iter().filter(|&&c| c == value).count()
    }

    /// Rebuilds a grid from raw snapshot parts. Fails without producing a
    /// partial grid if the parts disagree.
    pub(crate) fn from_parts(
        size: i32,
        geometry: GridGeometry,
        cells: Vec<CellType>,
        world_positions: impl IntoIterator<Item = (GridPos, WorldPos)>,
    ) -> ArenaResult<Self> {
        let expected = cell_count(size).map_err(|e| ArenaError::MalformedSnapshot(e.to_string()))?;
        if cells.len() != expected {
            return Err(ArenaError::MalformedSnapshot(format!(
                "expected {expected} cells, got {}",
                cells.len()
            )));
        }
        geometry
            .validate()
            .map_err(|e| ArenaError::MalformedSnapshot(e.to_string()))?;
        let mut grid = Self {
            size,
            geometry,
            cells,
            world_positions: BTreeMap::new(),
        };
        for (pos, world) in world_positions {
            if !grid.is_valid(pos) {
                return Err(ArenaError::MalformedSnapshot(format!(
                    "world position for out-of-bounds cell {pos}"
                )));
            }
            grid.world_positions.insert(pos, world);
        }
        Ok(grid)
    }
}

impl fmt::Display for GridModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for row in self.cells.chunks(self.size as usize) {
            let line: String = row.iter().map(|c| c.glyph()).collect();
            writeln!(f, "{line}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid() -> GridModel {
        GridModel::new(13, GridGeometry::default()).unwrap()
    }

    #[test]
    fn rejects_even_or_tiny_sizes() {
        assert!(GridModel::new(12, GridGeometry::default()).is_err());
        assert!(GridModel::new(3, GridGeometry::default()).is_err());
        assert!(GridModel::new(5, GridGeometry::default()).is_ok());
        assert!(GridModel::new(MAX_GRID_SIZE, GridGeometry::default()).is_ok());
        assert!(GridModel::new(MAX_GRID_SIZE + 2, GridGeometry::default()).is_err());
        assert!(GridModel::new(46341, GridGeometry::default()).is_err());
        assert!(GridModel::new(i32::MAX, GridGeometry::default()).is_err());
    }

    #[test]
    fn non_finite_world_positions_have_no_cell() {
        let grid = grid();
        for world in [
            WorldPos::new(f32::NAN, 0.0, 0.0),
            WorldPos::new(0.0, f32::NAN, 0.0),
            WorldPos::new(f32::INFINITY, 0.0, 0.0),
        ] {
            assert!(matches!(
                grid.world_to_grid(world),
                Err(ArenaError::InvalidWorldPosition(_))
            ));
        }
    }

    #[test]
    fn degenerate_geometry_is_invalid() {
        let zero = GridGeometry {
            pitch: 0.0,
            ..GridGeometry::default()
        };
        assert!(zero.validate().is_err());
        let nan_origin = GridGeometry {
            origin_x: f32::NAN,
            ..GridGeometry::default()
        };
        assert!(nan_origin.validate().is_err());
        GridGeometry::default().validate().unwrap();
    }

    #[test]
    fn world_round_trip_for_every_cell() {
        let grid = grid();
        for pos in grid.positions() {
            assert_eq!(grid.world_to_grid(grid.grid_to_world(pos)).unwrap(), pos);
        }
    }

    #[test]
    fn reference_corner_placement() {
        let grid = grid();
        let first = grid.grid_to_world(GridPos::new(0, 0));
        assert_eq!((first.x, first.y), (-352.0, 352.0));
        let last = grid.grid_to_world(GridPos::new(12, 12));
        assert!((last.x - 418.88).abs() < 1e-3);
        assert!((last.y + 418.88).abs() < 1e-3);
    }

    #[test]
    fn out_of_bounds_is_an_error() {
        let grid = grid();
        let err = grid.cell_type(GridPos::new(13, 0)).unwrap_err();
        assert_eq!(
            err,
            ArenaError::OutOfBounds {
                pos: GridPos::new(13, 0),
                size: 13
            }
        );
        assert!(grid.cell_type(GridPos::new(-1, 4)).is_err());
        assert!(!grid.is_valid(GridPos::new(0, -1)));
    }

    #[test]
    fn indestructible_walls_are_immutable() {
        let mut grid = grid();
        let pos = GridPos::new(1, 1);
        assert!(grid.set_cell_type(pos, CellType::IndestructibleWall).unwrap());
        assert!(!grid.set_cell_type(pos, CellType::Empty).unwrap());
        assert!(!grid.clear_cell(pos).unwrap());
        assert_eq!(grid.cell_type(pos).unwrap(), CellType::IndestructibleWall);
    }

    #[test]
    fn clear_is_idempotent() {
        let mut grid = grid();
        let pos = GridPos::new(2, 0);
        grid.set_cell_type(pos, CellType::Wall).unwrap();
        assert!(grid.clear_cell(pos).unwrap());
        assert!(!grid.clear_cell(pos).unwrap());
        assert_eq!(grid.cell_type(pos).unwrap(), CellType::Empty);
    }

    #[test]
    fn missing_world_position_is_reported() {
        let mut grid = grid();
        let pos = GridPos::new(4, 4);
        assert_eq!(
            grid.world_position(pos),
            Err(ArenaError::MissingWorldPosition(pos))
        );
        let recorded = grid.record_world_position(pos).unwrap();
        assert_eq!(grid.world_position(pos).unwrap(), recorded);
    }

    #[test]
    fn from_parts_rejects_wrong_cell_count() {
        let err = GridModel::from_parts(5, GridGeometry::default(), vec![CellType::Empty; 24], [])
            .unwrap_err();
        assert!(matches!(err, ArenaError::MalformedSnapshot(_)));
    }

    #[test]
    fn from_parts_rejects_oversized_arena_without_allocating() {
        let err = GridModel::from_parts(46341, GridGeometry::default(), Vec::new(), [])
            .unwrap_err();
        assert!(matches!(err, ArenaError::MalformedSnapshot(_)));
    }

    #[test]
    fn display_dumps_rows() {
        let mut grid = GridModel::new(5, GridGeometry::default()).unwrap();
        grid.set_cell_type(GridPos::new(1, 1), CellType::IndestructibleWall)
            .unwrap();
        let dump = grid.to_string();
        assert_eq!(dump.lines().nth(1), Some(".#..."));
    }
}
