//! Axis-limited flood fill for bomb blasts.
use crate::core::error::ArenaResult;
use crate::core::grid::{CellType, GridModel, GridPos};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    North,
    South,
    East,
    West,
}

impl Direction {
    pub const ALL: [Direction; 4] = [
        Direction::South,
        Direction::North,
        Direction::East,
        Direction::West,
    ];

    pub const fn delta(self) -> (i32, i32) {
        match self {
            Direction::North => (0, -1),
            Direction::South => (0, 1),
            Direction::East => (1, 0),
            Direction::West => (-1, 0),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlastOutcome {
    pub origin: GridPos,
    /// Every cell the blast reached, origin first. Drives per-cell effects.
    pub affected: Vec<GridPos>,
    pub destroyed_walls: Vec<GridPos>,
    pub destroyed_power_ups: Vec<GridPos>,
    /// Cells that held a bomb when the blast reached them.
    pub chained_bombs: Vec<GridPos>,
}

impl BlastOutcome {
    /// Affected cells that may be cleared, i.e. everything except
    /// indestructible walls. This is the replicated clear batch.
    pub fn clear_batch(&self, grid: &GridModel) -> Vec<GridPos> {
        self.affected
            .iter()
            .copied()
            .filter(|&pos| grid.cell_type(pos).is_ok_and(|c| c != CellType::IndestructibleWall))
            .collect()
    }
}

/// Resolves a blast of `radius` cells around `origin` and applies it to the
/// grid: destructible walls and power-ups in range are removed, every affected
/// cell ends up `Empty`.
///
/// Each direction stops before the first indestructible wall or the arena
/// edge, and right after the first destructible wall it destroys.
pub fn propagate(grid: &mut GridModel, origin: GridPos, radius: u32) -> ArenaResult<BlastOutcome> {
    let origin_cell = grid.cell_type(origin)?;
    let mut outcome = BlastOutcome {
        origin,
        affected: vec![origin],
        ..BlastOutcome::default()
    };
    if origin_cell == CellType::PowerUp {
        outcome.destroyed_power_ups.push(origin);
    }

    for direction in Direction::ALL {
        let (dx, dy) = direction.delta();
        for step in 1..=radius as i32 {
            let pos = origin.offset(dx * step, dy * step);
            if !grid.is_valid(pos) {
                break;
            }
            let cell = grid.cell_type(pos)?;
            if cell.traits().blocks_blast {
                break;
            }
            outcome.affected.push(pos);
            match cell {
                CellType::Wall => {
                    outcome.destroyed_walls.push(pos);
                    break;
                }
                CellType::PowerUp => outcome.destroyed_power_ups.push(pos),
                CellType::Bomb => outcome.chained_bombs.push(pos),
                CellType::Empty | CellType::PlayerSpawn | CellType::IndestructibleWall => {}
            }
        }
    }

    for pos in outcome.clear_batch(grid) {
        grid.clear_cell(pos)?;
    }

    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::grid::GridGeometry;
    use std::collections::BTreeSet;

    fn open_grid() -> GridModel {
        GridModel::new(13, GridGeometry::default()).unwrap()
    }

    fn set(grid: &mut GridModel, x: i32, y: i32, cell: CellType) {
        grid.set_cell_type(GridPos::new(x, y), cell).unwrap();
    }

    fn cells(list: &[GridPos]) -> BTreeSet<(i32, i32)> {
        list.iter().map(|p| (p.x, p.y)).collect()
    }

    #[test]
    fn radius_one_on_open_ground() {
        let mut grid = open_grid();
        let outcome = propagate(&mut grid, GridPos::new(6, 6), 1).unwrap();
        assert_eq!(
            cells(&outcome.affected),
            BTreeSet::from([(6, 6), (6, 7), (6, 5), (7, 6), (5, 6)])
        );
        assert_eq!(outcome.affected[0], GridPos::new(6, 6));
    }

    #[test]
    fn indestructible_neighbour_stops_that_direction() {
        let mut grid = open_grid();
        set(&mut grid, 7, 6, CellType::IndestructibleWall);
        let outcome = propagate(&mut grid, GridPos::new(6, 6), 3).unwrap();
        let hit = cells(&outcome.affected);
        assert!(!hit.contains(&(7, 6)));
        assert!(!hit.contains(&(8, 6)));
        assert!(hit.contains(&(3, 6)));
        assert_eq!(hit.len(), 1 + 3 + 3 + 3);
        assert_eq!(
            grid.cell_type(GridPos::new(7, 6)).unwrap(),
            CellType::IndestructibleWall
        );
    }

    #[test]
    fn wall_in_range_is_destroyed_and_blocks() {
        let mut grid = open_grid();
        set(&mut grid, 6, 8, CellType::Wall);
        set(&mut grid, 6, 9, CellType::Wall);
        let outcome = propagate(&mut grid, GridPos::new(6, 6), 4).unwrap();
        assert_eq!(outcome.destroyed_walls, vec![GridPos::new(6, 8)]);
        assert_eq!(grid.cell_type(GridPos::new(6, 8)).unwrap(), CellType::Empty);
        assert_eq!(grid.cell_type(GridPos::new(6, 9)).unwrap(), CellType::Wall);
        assert!(!cells(&outcome.affected).contains(&(6, 9)));
    }

    #[test]
    fn wall_beyond_radius_is_untouched() {
        let mut grid = open_grid();
        set(&mut grid, 9, 6, CellType::Wall);
        let outcome = propagate(&mut grid, GridPos::new(6, 6), 2).unwrap();
        assert!(outcome.destroyed_walls.is_empty());
        assert_eq!(grid.cell_type(GridPos::new(9, 6)).unwrap(), CellType::Wall);
    }

    #[test]
    fn edge_of_arena_stops_walk() {
        let mut grid = open_grid();
        let outcome = propagate(&mut grid, GridPos::new(0, 0), 2).unwrap();
        assert_eq!(
            cells(&outcome.affected),
            BTreeSet::from([(0, 0), (1, 0), (2, 0), (0, 1), (0, 2)])
        );
    }

    #[test]
    fn power_ups_burn_and_blast_continues() {
        let mut grid = open_grid();
        set(&mut grid, 4, 6, CellType::PowerUp);
        let outcome = propagate(&mut grid, GridPos::new(6, 6), 3).unwrap();
        assert_eq!(outcome.destroyed_power_ups, vec![GridPos::new(4, 6)]);
        assert!(cells(&outcome.affected).contains(&(3, 6)));
        assert_eq!(grid.cell_type(GridPos::new(4, 6)).unwrap(), CellType::Empty);
    }

    #[test]
    fn bombs_in_path_are_reported_for_chaining() {
        let mut grid = open_grid();
        set(&mut grid, 6, 6, CellType::Bomb);
        set(&mut grid, 6, 4, CellType::Bomb);
        let outcome = propagate(&mut grid, GridPos::new(6, 6), 2).unwrap();
        assert_eq!(outcome.chained_bombs, vec![GridPos::new(6, 4)]);
        assert_eq!(grid.cell_type(GridPos::new(6, 6)).unwrap(), CellType::Empty);
        assert_eq!(grid.cell_type(GridPos::new(6, 4)).unwrap(), CellType::Empty);
    }

    #[test]
    fn clear_batch_never_contains_indestructible_cells() {
        let mut grid = open_grid();
        for pos in grid.positions().collect::<Vec<_>>() {
            if pos.x % 2 == 1 && pos.y % 2 == 1 {
                grid.set_cell_type(pos, CellType::IndestructibleWall).unwrap();
            }
        }
        let outcome = propagate(&mut grid, GridPos::new(2, 2), 5).unwrap();
        let batch = outcome.clear_batch(&grid);
        assert!(batch
            .iter()
            .all(|&p| grid.cell_type(p).unwrap() != CellType::IndestructibleWall));
        assert_eq!(grid.count(CellType::IndestructibleWall), 36);
    }

    #[test]
    fn pillars_survive_any_sequence_of_blasts() {
        let mut grid = open_grid();
        let pillars: Vec<GridPos> = grid
            .positions()
            .filter(|p| p.x % 2 == 1 && p.y % 2 == 1)
            .collect();
        for &pos in &pillars {
            grid.set_cell_type(pos, CellType::IndestructibleWall).unwrap();
        }
        for origin in grid.positions().collect::<Vec<_>>() {
            if grid.cell_type(origin).unwrap() != CellType::IndestructibleWall {
                propagate(&mut grid, origin, 4).unwrap();
            }
        }
        for pos in pillars {
            assert_eq!(grid.cell_type(pos).unwrap(), CellType::IndestructibleWall);
        }
    }
}
