use thiserror::Error;

use crate::core::grid::{CellType, GridPos, WorldPos};
use crate::core::round::{BombId, RoundPhase};

/// Failures surfaced by the simulation core.
///
/// Bounds and authorization errors are local: the caller gets the error and no
/// state changes. Generation infeasibility is fatal to the round start.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ArenaError {
    #[error("grid position {pos} is outside the {size}x{size} arena")]
    OutOfBounds { pos: GridPos, size: i32 },

    #[error("empty-cell pool holds {available} cells but {required} power-ups are required")]
    GenerationInfeasible { available: usize, required: usize },

    #[error("{operation} requires host authority")]
    UnauthorizedMutation { operation: &'static str },

    #[error("world position {0:?} does not map to any cell")]
    InvalidWorldPosition(WorldPos),

    #[error("invalid arena configuration: {0}")]
    InvalidConfig(String),

    #[error("no world position recorded for {0}")]
    MissingWorldPosition(GridPos),

    #[error("{operation} is not allowed while the round is {phase:?}")]
    InvalidPhase {
        operation: &'static str,
        phase: RoundPhase,
    },

    #[error("cell type {0:?} is managed by the round controller")]
    ReservedCellType(CellType),

    #[error("bomb {0:?} is not active")]
    UnknownBomb(BombId),

    #[error("malformed snapshot: {0}")]
    MalformedSnapshot(String),

    #[error("mirror has not received a snapshot yet")]
    NotSynced,
}

pub type ArenaResult<T> = Result<T, ArenaError>;
