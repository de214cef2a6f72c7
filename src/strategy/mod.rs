//! Wager sizing.

pub mod sizing;

pub use sizing::{ConfidenceAdjustment, SizingConfig, WagerSizer};
