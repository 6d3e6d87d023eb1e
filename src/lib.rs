//! POLYARB: near-resolution maker sniping agent for binary prediction
//! markets.
//!
//! Library crate exposing all modules for use by integration tests
//! and the binary entry point.

pub mod config;
pub mod types;
pub mod platforms;
pub mod strategy;
pub mod engine;
pub mod storage;
