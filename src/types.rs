//! Shared types for the KEEPER agent.
//!
//! These types form the data model used across all modules: rounds as the
//! ledger reports them, forecasts, per-participant bot state and the domain
//! error taxonomy. Engine, ledger and dashboard modules depend on them
//! without depending on each other.

use chrono::{DateTime, Utc};
use rust_decimal::prelude::*;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;

/// Base units per whole coin on the ledger (18 decimals).
pub const BASE_UNITS_PER_COIN: u128 = 1_000_000_000_000_000_000;

/// Capacity of a participant's event log.
pub const EVENT_LOG_CAPACITY: usize = 50;

// ---------------------------------------------------------------------------
// Direction
// ---------------------------------------------------------------------------

/// Which side of the strike a wager (or forecast) is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Up,
    Down,
}

impl Direction {
    pub fn is_up(&self) -> bool {
        matches!(self, Direction::Up)
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Up => write!(f, "UP"),
            Direction::Down => write!(f, "DOWN"),
        }
    }
}

impl std::str::FromStr for Direction {
    type Err = KeeperError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "UP" => Ok(Direction::Up),
            "DOWN" => Ok(Direction::Down),
            other => Err(KeeperError::ForecastUnavailable(format!(
                "unknown direction: {other}"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Forecast
// ---------------------------------------------------------------------------

/// Directional call for an asset, as produced by the forecast provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Forecast {
    pub direction: Direction,
    /// Provider certainty, 0–100.
    pub confidence: f64,
    /// Signed predicted return over the model horizon.
    pub predicted_return: f64,
    pub timestamp: DateTime<Utc>,
}

impl fmt::Display for Forecast {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} conf={:.1}% ret={:+.4}",
            self.direction, self.confidence, self.predicted_return,
        )
    }
}

impl Forecast {
    /// Age of the forecast relative to `now`.
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.timestamp
    }
}

// ---------------------------------------------------------------------------
// Rounds
// ---------------------------------------------------------------------------

/// One round as reported by `getRoundInfo`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundInfo {
    pub start_time: u64,
    pub end_time: u64,
    /// Strike price in fixed-point cents.
    pub strike_cents: u64,
    /// Closing price in fixed-point cents (0 until resolved).
    pub closing_cents: u64,
    pub up_pool: u128,
    pub down_pool: u128,
    pub total_bets: u64,
    pub resolved: bool,
    pub up_won: bool,
}

impl RoundInfo {
    pub fn outcome(&self) -> Option<Direction> {
        if !self.resolved {
            return None;
        }
        Some(if self.up_won { Direction::Up } else { Direction::Down })
    }
}

/// Local mirror of the active round (see `engine::cache`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoundSnapshot {
    pub round_id: u64,
    pub end_time: u64,
    /// Strike in quote currency (cents / 100).
    pub strike_price: f64,
    pub up_pool: Decimal,
    pub down_pool: Decimal,
}

impl RoundSnapshot {
    /// Whole seconds left in the round, saturating at zero.
    pub fn remaining_secs(&self, now: i64) -> u64 {
        let now = now.max(0) as u64;
        self.end_time.saturating_sub(now)
    }
}

impl fmt::Display for RoundSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Round #{} strike=${:.2} ends={} up={} down={}",
            self.round_id, self.strike_price, self.end_time, self.up_pool, self.down_pool,
        )
    }
}

/// Protocol-fee accrual state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeState {
    pub seconds_until_due: u64,
    pub accrued: u128,
}

impl FeeState {
    pub fn is_due(&self) -> bool {
        self.seconds_until_due == 0 && self.accrued > 0
    }
}

// ---------------------------------------------------------------------------
// Unit conversion
// ---------------------------------------------------------------------------

/// Convert a price to fixed-point cents.
pub fn price_to_cents(price: f64) -> u64 {
    if !price.is_finite() || price <= 0.0 {
        return 0;
    }
    (price * 100.0).round() as u64
}

pub fn cents_to_price(cents: u64) -> f64 {
    cents as f64 / 100.0
}

/// Convert a coin amount to ledger base units. `None` for negative or
/// out-of-range amounts.
pub fn to_base_units(amount: Decimal) -> Option<u128> {
    if amount.is_sign_negative() {
        return None;
    }
    let scaled = amount.checked_mul(Decimal::from(BASE_UNITS_PER_COIN as u64))?;
    scaled.trunc().to_u128()
}

/// Convert ledger base units to a coin amount.
pub fn from_base_units(units: u128) -> Decimal {
    i128::try_from(units)
        .ok()
        .and_then(|u| Decimal::try_from_i128_with_scale(u, 18).ok())
        .map(|d| d.normalize())
        .unwrap_or(Decimal::MAX)
}

// ---------------------------------------------------------------------------
// Participant state
// ---------------------------------------------------------------------------

/// One line in a participant's event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub at: DateTime<Utc>,
    pub message: String,
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.at.format("%H:%M:%S"), self.message)
    }
}

/// Fixed-capacity event log. Pushing onto a full log evicts the oldest entry.
#[derive(Debug, Clone, PartialEq)]
pub struct EventLog {
    entries: VecDeque<LogEntry>,
    capacity: usize,
}

impl EventLog {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, message: impl Into<String>) {
        self.push_entry(LogEntry {
            at: Utc::now(),
            message: message.into(),
        });
    }

    fn push_entry(&mut self, entry: LogEntry) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The `n` most recent entries, oldest first.
    pub fn recent(&self, n: usize) -> Vec<LogEntry> {
        let skip = self.entries.len().saturating_sub(n);
        self.entries.iter().skip(skip).cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter()
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::with_capacity(EVENT_LOG_CAPACITY)
    }
}

impl Serialize for EventLog {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.entries.iter())
    }
}

impl<'de> Deserialize<'de> for EventLog {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let entries = Vec::<LogEntry>::deserialize(deserializer)?;
        let mut log = EventLog::default();
        for entry in entries {
            log.push_entry(entry);
        }
        Ok(log)
    }
}

/// What the engine placed for a participant the last time it wagered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WagerSnapshot {
    pub round_id: u64,
    pub direction: Direction,
    /// Time-adjusted confidence on a 0–1 scale.
    pub adjusted_confidence: f64,
    pub predicted_return: f64,
    pub amount: Decimal,
    pub tx_hash: String,
    pub placed_at: DateTime<Utc>,
    /// Set once the round's outcome has been counted as a win or loss.
    #[serde(default)]
    pub settled: bool,
}

/// A confirmed wager whose round has not been counted yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenWager {
    pub round_id: u64,
    pub direction: Direction,
}

/// Persistent auto-betting state for one participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantBot {
    pub active: bool,
    /// Upper bound for a single automatic wager, in coin.
    pub max_wager: Decimal,
    pub last_wagered_round: u64,
    pub total_bets: u64,
    pub wins: u64,
    pub losses: u64,
    #[serde(default)]
    pub recent_log: EventLog,
    #[serde(default)]
    pub last_wager: Option<WagerSnapshot>,
    #[serde(default)]
    pub open_wagers: Vec<OpenWager>,
}

impl ParticipantBot {
    pub fn new(max_wager: Decimal) -> Self {
        Self {
            active: false,
            max_wager,
            last_wagered_round: 0,
            total_bets: 0,
            wins: 0,
            losses: 0,
            recent_log: EventLog::default(),
            last_wager: None,
            open_wagers: Vec::new(),
        }
    }

    /// Whether the participant already has a wager in `round_id`.
    pub fn has_wagered_in(&self, round_id: u64) -> bool {
        self.last_wagered_round >= round_id
    }

    pub fn win_rate(&self) -> f64 {
        let settled = self.wins + self.losses;
        if settled == 0 {
            0.0
        } else {
            self.wins as f64 / settled as f64 * 100.0
        }
    }
}

impl fmt::Display for ParticipantBot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} | ceiling={} | last_round={} | bets={} (W{}/L{})",
            if self.active { "ACTIVE" } else { "STOPPED" },
            self.max_wager,
            self.last_wagered_round,
            self.total_bets,
            self.wins,
            self.losses,
        )
    }
}

/// Lowercase, `0x`-prefixed form used as the registry key.
pub fn normalize_address(address: &str) -> String {
    let trimmed = address.trim();
    let body = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    format!("0x{}", body.to_ascii_lowercase())
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Domain-specific error types for KEEPER.
#[derive(Debug, thiserror::Error)]
pub enum KeeperError {
    #[error("Read failed ({source_name}): {message}")]
    TransientRead { source_name: String, message: String },

    #[error("Transaction {tx_hash} reverted: {reason}")]
    TransactionReverted { tx_hash: String, reason: String },

    #[error("Transaction {tx_hash} not confirmed within {timeout_secs}s")]
    TransactionTimeout { tx_hash: String, timeout_secs: u64 },

    /// The node refused the signed transaction (nonce, funds, pricing).
    #[error("{call} rejected by node: {reason}")]
    TransactionRejected { call: String, reason: String },

    #[error("Forecast unavailable: {0}")]
    ForecastUnavailable(String),

    #[error("Insufficient balance for {participant}: need {needed}, have {available}")]
    InsufficientBalance {
        participant: String,
        needed: Decimal,
        available: Decimal,
    },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl KeeperError {
    pub fn read(source_name: &str, message: impl fmt::Display) -> Self {
        KeeperError::TransientRead {
            source_name: source_name.to_string(),
            message: message.to_string(),
        }
    }

    /// Whether this error came from a submitted transaction (and so counts
    /// toward a retry budget).
    pub fn is_transaction_failure(&self) -> bool {
        matches!(
            self,
            KeeperError::TransactionReverted { .. }
                | KeeperError::TransactionTimeout { .. }
                | KeeperError::TransactionRejected { .. }
        )
    }
}

pub type KeeperResult<T> = Result<T, KeeperError>;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
