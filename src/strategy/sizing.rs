//! Time-decayed confidence tiers for automatic wager sizing.
//!
//! The later in a round a wager is placed, the less the forecast is trusted
//! and the smaller the wager: confidence is discounted by up to half and the
//! tiered fraction of the participant's ceiling is scaled down to 40%.

use rust_decimal::prelude::*;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::config::BatchConfig;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SizingConfig {
    /// Remaining time at which the time factor saturates at 1.0.
    pub reference_window_secs: u64,
    /// Adjusted confidence at or above which the full ceiling is used.
    pub full_tier: f64,
    /// Adjusted confidence at or above which half the ceiling is used.
    pub half_tier: f64,
    /// Smallest wager ever submitted.
    pub min_wager: Decimal,
}

impl Default for SizingConfig {
    fn default() -> Self {
        Self {
            reference_window_secs: 300,
            full_tier: 75.0,
            half_tier: 60.0,
            min_wager: dec!(0.001),
        }
    }
}

impl From<&BatchConfig> for SizingConfig {
    fn from(cfg: &BatchConfig) -> Self {
        Self {
            reference_window_secs: cfg.reference_window_secs,
            min_wager: cfg.min_wager,
            ..Self::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Sizer
// ---------------------------------------------------------------------------

/// Sizing inputs shared by every participant in one batch pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConfidenceAdjustment {
    pub time_factor: f64,
    /// Raw confidence discounted by time, 0–100.
    pub adjusted_confidence: f64,
}

pub struct WagerSizer {
    config: SizingConfig,
}

impl WagerSizer {
    pub fn new(config: SizingConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SizingConfig {
        &self.config
    }

    /// `min(1, remaining / reference_window)`.
    pub fn time_factor(&self, remaining_secs: u64) -> f64 {
        if self.config.reference_window_secs == 0 {
            return 1.0;
        }
        (remaining_secs as f64 / self.config.reference_window_secs as f64).min(1.0)
    }

    /// `confidence * (0.5 + 0.5 * time_factor)`.
    pub fn adjust(&self, raw_confidence: f64, remaining_secs: u64) -> ConfidenceAdjustment {
        let time_factor = self.time_factor(remaining_secs);
        ConfidenceAdjustment {
            time_factor,
            adjusted_confidence: raw_confidence * (0.5 + 0.5 * time_factor),
        }
    }

    /// Fraction of the ceiling before time scaling.
    pub fn tier_fraction(&self, adjusted_confidence: f64) -> Decimal {
        if adjusted_confidence >= self.config.full_tier {
            Decimal::ONE
        } else if adjusted_confidence >= self.config.half_tier {
            dec!(0.5)
        } else {
            dec!(0.25)
        }
    }

    /// Wager for one participant with the given ceiling.
    ///
    /// `ceiling * tier * (0.4 + 0.6 * time_factor)`, floored at the minimum
    /// wager. The time factor is recomputed in decimal arithmetic so the
    /// result is exact.
    pub fn wager_amount(
        &self,
        adjustment: &ConfidenceAdjustment,
        remaining_secs: u64,
        ceiling: Decimal,
    ) -> Decimal {
        let time_factor = self.decimal_time_factor(remaining_secs);
        let scale = dec!(0.4) + dec!(0.6) * time_factor;
        let amount = (ceiling * self.tier_fraction(adjustment.adjusted_confidence) * scale)
            .round_dp_with_strategy(18, RoundingStrategy::ToZero)
            .normalize();
        amount.max(self.config.min_wager)
    }

    fn decimal_time_factor(&self, remaining_secs: u64) -> Decimal {
        if self.config.reference_window_secs == 0 {
            return Decimal::ONE;
        }
        let ratio = Decimal::from(remaining_secs)
            .checked_div(Decimal::from(self.config.reference_window_secs))
            .unwrap_or(Decimal::ONE);
        ratio.min(Decimal::ONE)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
