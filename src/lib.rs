//! XARB: cost-aware cross-exchange arbitrage engine.
//!
//! Library crate exposing all modules for use by integration tests
//! and the binary entry point.

pub mod api;
pub mod config;
pub mod engine;
pub mod exchange;
pub mod feed;
pub mod storage;
pub mod strategy;
pub mod types;
