//! KEEPER: round keeper and batch betting agent for an on-chain UP/DOWN
//! prediction market.
//!
//! Library crate exposing all modules for use by integration tests
//! and the binary entry point.

pub mod config;
pub mod types;
pub mod ledger;
pub mod feeds;
pub mod strategy;
pub mod engine;
pub mod storage;
pub mod dashboard;
