//! Core engine: scan -> score -> enter, then monitor -> exit.

pub mod scanner;
pub mod executor;
pub mod monitor;
pub mod state;
pub mod orchestrator;
