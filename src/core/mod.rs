pub mod config;
pub mod error;
pub mod explosion;
pub mod grid;
pub mod mapgen;
pub mod replication;
pub mod round;

pub use config::ArenaConfig;
pub use error::{ArenaError, ArenaResult};
pub use grid::{CellType, GridModel, GridPos, WorldPos};
