use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::core::error::{ArenaError, ArenaResult};
use crate::core::grid::{self, GridGeometry};
use crate::core::mapgen;

/// Arena tuning. Grid size and power-up count are validated as a pair rather
/// than assumed compatible.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArenaConfig {
    pub grid_size: i32,
    pub max_power_ups: usize,
    /// Chance that a free cell is left empty instead of holding a wall.
    pub empty_chance: f32,
    pub respawn_min_secs: u64,
    pub respawn_max_secs: u64,
    pub bomb_fuse_secs: f32,
    pub starting_blast_radius: u32,
    pub starting_bomb_capacity: u32,
    /// Fixed seed for reproducible maps. A fresh one is drawn when absent.
    pub seed: Option<u64>,
    pub geometry: GridGeometry,
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self {
            grid_size: 13,
            max_power_ups: 2,
            empty_chance: 0.4,
            respawn_min_secs: 5,
            respawn_max_secs: 10,
            bomb_fuse_secs: 4.0,
            starting_blast_radius: 1,
            starting_bomb_capacity: 1,
            seed: None,
            geometry: GridGeometry::default(),
        }
    }
}

impl ArenaConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ArenaResult<()> {
        let invalid = |msg: String| Err(ArenaError::InvalidConfig(msg));

        grid::cell_count(self.grid_size)?;
        self.geometry.validate()?;
        if !(0.0..=1.0).contains(&self.empty_chance) {
            return invalid(format!(
                "empty_chance must be within [0, 1], got {}",
                self.empty_chance
            ));
        }
        if self.respawn_min_secs > self.respawn_max_secs {
            return invalid(format!(
                "respawn range {}..={} is empty",
                self.respawn_min_secs, self.respawn_max_secs
            ));
        }
        if !(self.bomb_fuse_secs.is_finite() && self.bomb_fuse_secs > 0.0) {
            return invalid(format!(
                "bomb_fuse_secs must be positive, got {}",
                self.bomb_fuse_secs
            ));
        }
        if self.starting_bomb_capacity == 0 {
            return invalid("starting_bomb_capacity must be at least 1".into());
        }
        let ceiling = mapgen::pool_ceiling(self.grid_size);
        if self.max_power_ups > ceiling {
            return invalid(format!(
                "a {0}x{0} arena has at most {1} pool cells, cannot hold {2} power-ups",
                self.grid_size, ceiling, self.max_power_ups
            ));
        }
        Ok(())
    }
}
