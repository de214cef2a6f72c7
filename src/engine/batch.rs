//! Batch betting engine.
//!
//! One pass takes a single forecast, sizes a wager for every eligible
//! participant, submits all of them as one combined vault transaction and
//! records the result for every included participant together. Passes are
//! serialised behind an async mutex so automatic and manual requests never
//! interleave between the balance check and the bookkeeping. A manual
//! request waits only a bounded time for a pass already in progress.

use chrono::Utc;
use rust_decimal::Decimal;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{BatchConfig, GasConfig};
use crate::feeds::ForecastProvider;
use crate::ledger::{submit_and_confirm, ContractCall, Ledger, TxRequest};
use crate::strategy::{SizingConfig, WagerSizer};
use crate::types::{
    from_base_units, normalize_address, to_base_units, Direction, KeeperError, KeeperResult,
    WagerSnapshot,
};

use super::registry::ParticipantRegistry;

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// What started a pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchTrigger {
    /// All active participants, once per round.
    Automatic,
    /// One participant on request; may wager again in the same round.
    Manual(String),
}

/// Why a pass ended before sizing anything.
#[derive(Debug, Clone, PartialEq)]
pub enum SkipReason {
    NoParticipants,
    NotOptedIn(String),
    NoRound,
    NotEnoughTime { remaining_secs: u64 },
    /// A manual request gave up waiting for the pass in progress.
    Busy,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::NoParticipants => write!(f, "no active participants"),
            SkipReason::NotOptedIn(p) => write!(f, "{p} has no active bot"),
            SkipReason::NoRound => write!(f, "no round is open"),
            SkipReason::NotEnoughTime { remaining_secs } => {
                write!(f, "only {remaining_secs}s left in the round")
            }
            SkipReason::Busy => write!(f, "another wager is in progress"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IncludedWager {
    pub participant: String,
    pub amount: Decimal,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExcludedParticipant {
    pub participant: String,
    pub reason: String,
}

/// A confirmed combined wager.
#[derive(Debug, Clone)]
pub struct BatchReport {
    pub batch_id: Uuid,
    pub round_id: u64,
    pub direction: Direction,
    pub adjusted_confidence: f64,
    pub tx_hash: String,
    pub included: Vec<IncludedWager>,
    pub excluded: Vec<ExcludedParticipant>,
}

impl BatchReport {
    pub fn total(&self) -> Decimal {
        self.included.iter().map(|w| w.amount).sum()
    }
}

#[derive(Debug, Clone)]
pub enum BatchOutcome {
    Skipped(SkipReason),
    /// Sized, but nobody qualified; nothing was submitted.
    NoneQualified {
        round_id: u64,
        excluded: Vec<ExcludedParticipant>,
    },
    Placed(BatchReport),
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct BatchEngine {
    ledger: Arc<dyn Ledger>,
    forecasts: Arc<dyn ForecastProvider>,
    registry: Arc<ParticipantRegistry>,
    sizer: WagerSizer,
    config: BatchConfig,
    gas: GasConfig,
    asset: String,
    pass_lock: Mutex<()>,
}

impl BatchEngine {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        forecasts: Arc<dyn ForecastProvider>,
        registry: Arc<ParticipantRegistry>,
        config: BatchConfig,
        gas: GasConfig,
        asset: &str,
    ) -> Self {
        Self {
            ledger,
            forecasts,
            registry,
            sizer: WagerSizer::new(SizingConfig::from(&config)),
            config,
            gas,
            asset: asset.to_string(),
            pass_lock: Mutex::new(()),
        }
    }

    /// Run one pass. Transaction failures are returned as errors and leave
    /// participant bookkeeping untouched.
    pub async fn run(&self, trigger: BatchTrigger) -> KeeperResult<BatchOutcome> {
        let batch_id = Uuid::new_v4();
        let _pass = match &trigger {
            BatchTrigger::Automatic => self.pass_lock.lock().await,
            BatchTrigger::Manual(_) => {
                let wait = Duration::from_secs(self.config.manual_wait_secs);
                match tokio::time::timeout(wait, self.pass_lock.lock()).await {
                    Ok(guard) => guard,
                    Err(_) => {
                        info!(%batch_id, "Manual bet refused: another pass is in progress");
                        return Ok(BatchOutcome::Skipped(SkipReason::Busy));
                    }
                }
            }
        };

        // 1. Target set
        let targets = match &trigger {
            BatchTrigger::Automatic => self.registry.active_participants().await,
            BatchTrigger::Manual(address) => {
                let key = normalize_address(address);
                match self.registry.get(&key).await {
                    Some(bot) if bot.active => vec![(key, bot)],
                    _ => return Ok(BatchOutcome::Skipped(SkipReason::NotOptedIn(key))),
                }
            }
        };
        if targets.is_empty() {
            debug!(%batch_id, "Batch skipped: no active participants");
            return Ok(BatchOutcome::Skipped(SkipReason::NoParticipants));
        }

        // 2. Round and remaining time, straight from the ledger
        let (round_id, end_time) = futures::try_join!(
            self.ledger.current_round_id(),
            self.ledger.round_end_time()
        )?;
        if round_id == 0 {
            return Ok(BatchOutcome::Skipped(SkipReason::NoRound));
        }
        let now = Utc::now().timestamp().max(0) as u64;
        let remaining_secs = end_time.saturating_sub(now);
        if remaining_secs < self.config.min_remaining_secs {
            info!(%batch_id, round_id, remaining_secs, "Batch skipped: not enough time left");
            return Ok(BatchOutcome::Skipped(SkipReason::NotEnoughTime { remaining_secs }));
        }

        // 3. One forecast for the whole batch
        let forecast = self.forecasts.forecast(&self.asset).await?;
        let adjustment = self.sizer.adjust(forecast.confidence, remaining_secs);
        info!(
            %batch_id,
            round_id,
            remaining_secs,
            forecast = %forecast,
            time_factor = format!("{:.2}", adjustment.time_factor),
            adjusted_confidence = format!("{:.1}", adjustment.adjusted_confidence),
            participants = targets.len(),
            "Batch pass started"
        );

        // 4. Size and check every participant
        let mut included: Vec<(IncludedWager, u128)> = Vec::new();
        let mut excluded: Vec<ExcludedParticipant> = Vec::new();

        for (participant, bot) in targets {
            if trigger == BatchTrigger::Automatic && bot.has_wagered_in(round_id) {
                debug!(%participant, round_id, "Already wagered this round");
                continue;
            }

            let amount = self
                .sizer
                .wager_amount(&adjustment, remaining_secs, bot.max_wager);

            match self.check_balance(&participant, amount).await {
                Ok(units) => {
                    debug!(%participant, %amount, "Participant included");
                    included.push((IncludedWager { participant, amount }, units));
                }
                Err(e) => {
                    info!(%participant, %amount, reason = %e, "Participant skipped");
                    excluded.push(ExcludedParticipant {
                        participant,
                        reason: e.to_string(),
                    });
                }
            }
        }

        self.registry
            .append_logs(
                excluded
                    .iter()
                    .map(|x| (x.participant.clone(), format!("Skipped round #{round_id}: {}", x.reason)))
                    .collect(),
            )
            .await;

        if included.is_empty() {
            info!(%batch_id, round_id, excluded = excluded.len(), "No participant qualified");
            return Ok(BatchOutcome::NoneQualified { round_id, excluded });
        }

        // 5. One combined transaction
        let is_up = forecast.direction.is_up();
        let call = ContractCall::PlaceBetBatch {
            participants: included.iter().map(|(w, _)| w.participant.clone()).collect(),
            amounts: included.iter().map(|(_, units)| *units).collect(),
            is_up,
        };
        let submitted = {
            let _writes = self.ledger.write_lock().lock().await;
            let (nonce, gas_price) =
                futures::try_join!(self.ledger.pending_nonce(), self.ledger.gas_price())?;
            let request = TxRequest {
                call,
                nonce,
                gas_limit: self.gas.batch_base + self.gas.batch_per_participant * included.len() as u64,
                gas_price,
            };
            submit_and_confirm(
                self.ledger.as_ref(),
                &request,
                Duration::from_secs(self.config.confirmation_timeout_secs),
            )
            .await
        };

        let tx_hash = match submitted {
            Ok(hash) => hash,
            Err(e) => {
                warn!(%batch_id, round_id, participants = included.len(), error = %e, "Batch wager failed");
                return Err(e);
            }
        };

        let confirmed_at = Utc::now();
        if confirmed_at.timestamp() >= end_time as i64 {
            warn!(%batch_id, round_id, tx_hash = %tx_hash, "Batch wager confirmed after round end");
        }

        // 6. Bookkeeping for every included participant at once
        let included: Vec<IncludedWager> = included.into_iter().map(|(w, _)| w).collect();
        let wagers = included
            .iter()
            .map(|w| {
                (
                    w.participant.clone(),
                    WagerSnapshot {
                        round_id,
                        direction: forecast.direction,
                        adjusted_confidence: adjustment.adjusted_confidence / 100.0,
                        predicted_return: forecast.predicted_return,
                        amount: w.amount,
                        tx_hash: tx_hash.clone(),
                        placed_at: confirmed_at,
                        settled: false,
                    },
                )
            })
            .collect();
        self.registry.record_wagers(round_id, wagers).await;

        let report = BatchReport {
            batch_id,
            round_id,
            direction: forecast.direction,
            adjusted_confidence: adjustment.adjusted_confidence,
            tx_hash,
            included,
            excluded,
        };
        info!(
            %batch_id,
            round_id,
            direction = %report.direction,
            participants = report.included.len(),
            total = %report.total(),
            tx_hash = %report.tx_hash,
            "Batch wager placed"
        );
        Ok(BatchOutcome::Placed(report))
    }

    /// Live custodial balance must cover the wager plus the gas reserve.
    /// Returns the wager in base units.
    async fn check_balance(&self, participant: &str, amount: Decimal) -> KeeperResult<u128> {
        let units = to_base_units(amount).ok_or_else(|| {
            KeeperError::Configuration(format!("wager {amount} cannot be expressed in base units"))
        })?;
        let available = from_base_units(self.ledger.vault_balance(participant).await?);
        let needed = amount + self.config.gas_reserve;
        if available < needed {
            return Err(KeeperError::InsufficientBalance {
                participant: participant.to_string(),
                needed,
                available,
            });
        }
        Ok(units)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
