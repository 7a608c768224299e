pub mod cli;
pub mod core;
pub mod engine;

// Re-export for convenience
pub use crate::core::round::RoundController;
