//! One-shot procedural population of a fresh `GridModel`.
use std::collections::BTreeSet;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::config::ArenaConfig;
use crate::core::error::{ArenaError, ArenaResult};
use crate::core::grid::{CellType, GridModel, GridPos};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PowerUpKind {
    BlastRadius,
    ExtraBomb,
    Speed,
}

impl PowerUpKind {
    pub const ALL: [PowerUpKind; 3] = [
        PowerUpKind::BlastRadius,
        PowerUpKind::ExtraBomb,
        PowerUpKind::Speed,
    ];

    pub fn random<R: Rng + ?Sized>(rng: &mut R) -> Self {
        Self::ALL[rng.random_range(0..Self::ALL.len())]
    }
}

/// What the visual layer should spawn on a cell after generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Placement {
    PlayerSpawn { pos: GridPos, index: usize },
    Wall { pos: GridPos },
    Pillar { pos: GridPos },
    /// Decorative pillar variant; behaves exactly like `Pillar`.
    Lamp { pos: GridPos },
    PowerUp { pos: GridPos, kind: PowerUpKind },
}

/// Cells eligible for power-up placement.
///
/// Membership is necessary but not sufficient: a draw only accepts cells that
/// are still `Empty` on the grid at that moment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EmptyCellPool {
    cells: BTreeSet<GridPos>,
}

impl EmptyCellPool {
    pub fn insert(&mut self, pos: GridPos) -> bool {
        self.cells.insert(pos)
    }

    pub fn remove(&mut self, pos: GridPos) -> bool {
        self.cells.remove(&pos)
    }

    pub fn contains(&self, pos: GridPos) -> bool {
        self.cells.contains(&pos)
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = GridPos> + '_ {
        self.cells.iter().copied()
    }

    /// Number of pool cells that are currently free on `grid`.
    pub fn available(&self, grid: &GridModel) -> usize {
        self.free_cells(grid).count()
    }

    /// Draws a free cell uniformly and removes it from the pool.
    pub fn draw<R: Rng + ?Sized>(&mut self, grid: &GridModel, rng: &mut R) -> Option<GridPos> {
        let free: Vec<GridPos> = self.free_cells(grid).collect();
        if free.is_empty() {
            return None;
        }
        let pos = free[rng.random_range(0..free.len())];
        self.cells.remove(&pos);
        Some(pos)
    }

    fn free_cells<'a>(&'a self, grid: &'a GridModel) -> impl Iterator<Item = GridPos> + 'a {
        self.cells
            .iter()
            .copied()
            .filter(|&pos| grid.cell_type(pos) == Ok(CellType::Empty))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedMap {
    pub layout: Vec<Placement>,
    pub pool: EmptyCellPool,
    pub power_ups: Vec<(GridPos, PowerUpKind)>,
}

pub fn spawn_positions(size: i32) -> [GridPos; 4] {
    let n = size - 1;
    [
        GridPos::new(0, 0),
        GridPos::new(0, n),
        GridPos::new(n, 0),
        GridPos::new(n, n),
    ]
}

/// The eight cells orthogonally next to the corners, kept free so every
/// spawn has room to place a first bomb and step away.
pub fn breathing_room(size: i32) -> [GridPos; 8] {
    let n = size - 1;
    [
        GridPos::new(1, 0),
        GridPos::new(0, 1),
        GridPos::new(n - 1, 0),
        GridPos::new(n, 1),
        GridPos::new(0, n - 1),
        GridPos::new(1, n),
        GridPos::new(n - 1, n),
        GridPos::new(n, n - 1),
    ]
}

pub fn is_pillar(pos: GridPos) -> bool {
    pos.x % 2 == 1 && pos.y % 2 == 1
}

/// Symmetric set of decorated pillars: two next to each corner plus the four
/// pillars around the centre. Twelve cells on the reference 13x13 arena.
pub fn lamp_positions(size: i32) -> BTreeSet<GridPos> {
    let n = size - 1;
    let c = size / 2;
    [
        (3, 1),
        (1, 3),
        (3, n - 1),
        (1, n - 3),
        (n - 1, 3),
        (n - 3, 1),
        (n - 1, n - 3),
        (n - 3, n - 1),
        (c - 1, c - 1),
        (c - 1, c + 1),
        (c + 1, c - 1),
        (c + 1, c + 1),
    ]
    .into_iter()
    .map(|(x, y)| GridPos::new(x, y))
    .filter(|&p| is_pillar(p) && (0..size).contains(&p.x) && (0..size).contains(&p.y))
    .collect()
}

/// Upper bound on pool size for an arena: every cell that is neither a spawn
/// nor a pillar could end up empty.
pub fn pool_ceiling(size: i32) -> usize {
    if size < 1 {
        return 0;
    }
    let size = i64::from(size);
    let half = (size - 1) / 2;
    (size * size - 4 - half * half).max(0) as usize
}

/// Populates `grid` in a single row-major pass. Expects a freshly created grid.
pub fn generate<R: Rng + ?Sized>(
    grid: &mut GridModel,
    config: &ArenaConfig,
    rng: &mut R,
) -> ArenaResult<GeneratedMap> {
    let size = grid.size();
    let spawns = spawn_positions(size);
    let breathing = breathing_room(size);
    let lamps = lamp_positions(size);

    let mut layout = Vec::new();
    let mut pool = EmptyCellPool::default();
    let mut spawn_index = 0;

    for y in 0..size {
        for x in 0..size {
            let pos = GridPos::new(x, y);
            grid.record_world_position(pos)?;

            let cell = if spawns.contains(&pos) {
                layout.push(Placement::PlayerSpawn {
                    pos,
                    index: spawn_index,
                });
                spawn_index += 1;
                CellType::PlayerSpawn
            } else if breathing.contains(&pos) {
                pool.insert(pos);
                CellType::Empty
            } else if is_pillar(pos) {
                layout.push(if lamps.contains(&pos) {
                    Placement::Lamp { pos }
                } else {
                    Placement::Pillar { pos }
                });
                CellType::IndestructibleWall
            } else if rng.random::<f32>() < config.empty_chance {
                pool.insert(pos);
                CellType::Empty
            } else {
                layout.push(Placement::Wall { pos });
                CellType::Wall
            };
            grid.set_cell_type(pos, cell)?;
        }
    }

    if pool.len() < config.max_power_ups {
        return Err(ArenaError::GenerationInfeasible {
            available: pool.len(),
            required: config.max_power_ups,
        });
    }

    let mut power_ups = Vec::with_capacity(config.max_power_ups);
    for _ in 0..config.max_power_ups {
        let Some(pos) = pool.draw(grid, rng) else {
            return Err(ArenaError::GenerationInfeasible {
                available: power_ups.len(),
                required: config.max_power_ups,
            });
        };
        let kind = PowerUpKind::random(rng);
        grid.set_cell_type(pos, CellType::PowerUp)?;
        layout.push(Placement::PowerUp { pos, kind });
        power_ups.push((pos, kind));
    }

    debug!(
        walls = grid.count(CellType::Wall),
        pool = pool.len(),
        power_ups = power_ups.len(),
        "map generated"
    );

    Ok(GeneratedMap {
        layout,
        pool,
        power_ups,
    })
}
