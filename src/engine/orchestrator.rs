//! Round lifecycle orchestrator.
//!
//! A single scheduled task keeps exactly one round open on the ledger. Each
//! pass ([`RoundOrchestrator::tick`]) reads the ledger, derives the round
//! phase, performs at most one transition and returns how long to wait
//! before the next pass. Only the runner sleeps.
//!
//! Transitions:
//! - `NoRound` → start the first round at the current reference price.
//! - `ExpiredUnresolved` → resolve at the closing price, then start the next
//!   round at that same price.
//! - `ResolvedAwaitingNext` → start the next round at a fresh price.
//!
//! Failed transition transactions draw on a per-round retry budget with
//! linear backoff; read failures just wait for the next pass.

use chrono::Utc;
use rand::Rng;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::{GasConfig, RoundConfig};
use crate::feeds::PriceFeed;
use crate::ledger::{submit_and_confirm, ContractCall, Ledger, TxRequest};
use crate::types::{price_to_cents, KeeperError, KeeperResult};

use super::batch::{BatchEngine, BatchOutcome, BatchTrigger};
use super::cache::RoundStateCache;
use super::registry::ParticipantRegistry;

// ---------------------------------------------------------------------------
// Phases
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundPhase {
    NoRound,
    Open,
    ExpiredUnresolved,
    /// Resolve submitted and not yet followed by a new round.
    Resolving,
    ResolvedAwaitingNext,
}

impl fmt::Display for RoundPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RoundPhase::NoRound => "NO_ROUND",
            RoundPhase::Open => "OPEN",
            RoundPhase::ExpiredUnresolved => "EXPIRED_UNRESOLVED",
            RoundPhase::Resolving => "RESOLVING",
            RoundPhase::ResolvedAwaitingNext => "RESOLVED_AWAITING_NEXT",
        };
        write!(f, "{s}")
    }
}

/// Phase as observable from the ledger alone.
pub fn derive_phase(round_id: u64, end_time: u64, resolved: bool, now: u64, grace_secs: u64) -> RoundPhase {
    if round_id == 0 {
        RoundPhase::NoRound
    } else if resolved {
        RoundPhase::ResolvedAwaitingNext
    } else if now >= end_time.saturating_add(grace_secs) {
        RoundPhase::ExpiredUnresolved
    } else {
        RoundPhase::Open
    }
}

// ---------------------------------------------------------------------------
// Retry budget
// ---------------------------------------------------------------------------

/// Per-round count of failed transition attempts.
#[derive(Debug, Clone)]
pub struct RetryBudget {
    round_id: u64,
    attempts: u32,
    max_attempts: u32,
    backoff_base: Duration,
    jitter_ms: u64,
    cooldown: Duration,
}

impl RetryBudget {
    pub fn from_config(cfg: &RoundConfig) -> Self {
        Self {
            round_id: 0,
            attempts: 0,
            max_attempts: cfg.max_attempts.max(1),
            backoff_base: Duration::from_secs(cfg.backoff_base_secs),
            jitter_ms: cfg.backoff_jitter_ms,
            cooldown: Duration::from_secs(cfg.cooldown_secs),
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Record a failure for `round_id` and return the delay before the next
    /// attempt. `delay` overrides the linear backoff. Exhausting the budget
    /// returns the cooldown and resets the counter.
    pub fn record_failure(&mut self, round_id: u64, delay: Option<Duration>) -> Duration {
        if round_id != self.round_id {
            self.round_id = round_id;
            self.attempts = 0;
        }
        self.attempts += 1;

        if self.attempts >= self.max_attempts {
            warn!(
                round_id,
                attempts = self.attempts,
                cooldown_secs = self.cooldown.as_secs(),
                "Retry budget exhausted, cooling down"
            );
            self.attempts = 0;
            return self.cooldown;
        }

        let base = delay
            .unwrap_or_else(|| self.backoff_base + Duration::from_secs(self.attempts as u64));
        base + self.jitter()
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    fn jitter(&self) -> Duration {
        if self.jitter_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=self.jitter_ms))
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct PrefetchedPrice {
    round_id: u64,
    price: f64,
    fetched_at: i64,
}

pub struct RoundOrchestrator {
    ledger: Arc<dyn Ledger>,
    prices: Arc<dyn PriceFeed>,
    cache: Arc<RoundStateCache>,
    registry: Arc<ParticipantRegistry>,
    batch: Option<Arc<BatchEngine>>,
    config: RoundConfig,
    gas: GasConfig,
    asset: String,

    phase: RoundPhase,
    retry: RetryBudget,
    prefetched: Option<PrefetchedPrice>,
    last_resolved_round: u64,
    last_fee_check: Option<i64>,
}

impl RoundOrchestrator {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        prices: Arc<dyn PriceFeed>,
        cache: Arc<RoundStateCache>,
        registry: Arc<ParticipantRegistry>,
        config: RoundConfig,
        gas: GasConfig,
        asset: &str,
    ) -> Self {
        Self {
            ledger,
            prices,
            cache,
            registry,
            batch: None,
            retry: RetryBudget::from_config(&config),
            config,
            gas,
            asset: asset.to_string(),
            phase: RoundPhase::NoRound,
            prefetched: None,
            last_resolved_round: 0,
            last_fee_check: None,
        }
    }

    /// Trigger an automatic batch pass after every new round.
    pub fn with_batch_engine(mut self, engine: Arc<BatchEngine>) -> Self {
        self.batch = Some(engine);
        self
    }

    pub fn phase(&self) -> RoundPhase {
        self.phase
    }

    pub fn retry_attempts(&self) -> u32 {
        self.retry.attempts()
    }

    pub fn last_resolved_round(&self) -> u64 {
        self.last_resolved_round
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.config.poll_interval_ms)
    }

    /// Run forever, sleeping whatever each pass asks for.
    pub async fn run(mut self) {
        info!(asset = %self.asset, "Round orchestrator started");
        loop {
            let delay = self.tick(Utc::now().timestamp()).await;
            tokio::time::sleep(delay).await;
        }
    }

    /// One pass at wall-clock second `now`. Returns the delay until the next.
    pub async fn tick(&mut self, now: i64) -> Duration {
        self.check_fees(now).await;

        let round_id = match self.ledger.current_round_id().await {
            Ok(id) => id,
            Err(e) => {
                warn!(error = %e, "Round id read failed");
                return self.poll_interval();
            }
        };

        if round_id == 0 {
            self.phase = RoundPhase::NoRound;
            return self.start_first_round().await;
        }

        let (end_time, info) = match futures::try_join!(
            self.ledger.round_end_time(),
            self.ledger.round_info(round_id)
        ) {
            Ok(v) => v,
            Err(e) => {
                warn!(round_id, error = %e, "Round state read failed");
                return self.poll_interval();
            }
        };

        let now_secs = now.max(0) as u64;
        self.phase = derive_phase(round_id, end_time, info.resolved, now_secs, self.config.grace_secs);

        match self.phase {
            RoundPhase::Open => {
                self.maybe_prefetch(round_id, end_time, now).await;
                self.poll_interval()
            }
            RoundPhase::ExpiredUnresolved if round_id <= self.last_resolved_round => {
                debug!(round_id, "Resolved here but ledger still reports open, waiting");
                self.poll_interval()
            }
            RoundPhase::ExpiredUnresolved => self.resolve_and_advance(round_id, now).await,
            RoundPhase::ResolvedAwaitingNext => self.start_after_external_resolve(round_id).await,
            RoundPhase::NoRound | RoundPhase::Resolving => self.poll_interval(),
        }
    }

    // -----------------------------------------------------------------------
    // Transitions
    // -----------------------------------------------------------------------

    async fn start_first_round(&mut self) -> Duration {
        let price = match self.fetch_price().await {
            Some(p) => p,
            None => return self.price_unavailable(0),
        };
        let strike_cents = price_to_cents(price);
        info!(price, strike_cents, "Starting first round");

        let result = self
            .submit(ContractCall::StartFirstRound { strike_cents }, self.gas.start_round, 1.0)
            .await;
        match result {
            Ok(Some(_)) => {
                self.retry.reset();
                self.after_round_started().await;
                self.poll_interval()
            }
            Ok(None) => self.poll_interval(),
            Err(e) => {
                error!(error = %e, "First round start failed");
                self.transition_failed(0, &e)
            }
        }
    }

    async fn resolve_and_advance(&mut self, round_id: u64, now: i64) -> Duration {
        self.phase = RoundPhase::Resolving;

        let price = match self.resolution_price(round_id, now).await {
            Some(p) => p,
            None => return self.price_unavailable(round_id),
        };
        let closing_cents = price_to_cents(price);
        let proof = format!("{}-{}", self.prices.source_name(), now);

        // Both transactions go out under one hold of the write lock
        let ledger = self.ledger.clone();
        let writes = ledger.write_lock().lock().await;

        let (gas_price, first_nonce) =
            match futures::try_join!(self.ledger.gas_price(), self.ledger.pending_nonce()) {
                Ok(v) => v,
                Err(e) => {
                    warn!(round_id, error = %e, "Gas price / nonce read failed");
                    return self.poll_interval();
                }
            };
        let boosted = boost_gas_price(gas_price, self.gas.resolve_price_multiplier);

        info!(round_id, price, closing_cents, proof = %proof, "Resolving round");
        let resolve = TxRequest {
            call: ContractCall::ResolveRound {
                closing_cents,
                proof,
            },
            nonce: first_nonce,
            gas_limit: self.gas.resolve_round,
            gas_price: boosted,
        };
        if let Err(e) = submit_and_confirm(self.ledger.as_ref(), &resolve, self.confirmation_timeout()).await {
            error!(round_id, attempt = self.retry.attempts() + 1, error = %e, "Resolve failed");
            return self.transition_failed(round_id, &e);
        }
        self.last_resolved_round = round_id;
        self.prefetched = None;
        info!(round_id, "Round resolved");

        let nonce = self.next_nonce_after(first_nonce).await;
        let start = TxRequest {
            call: ContractCall::StartNewRound {
                strike_cents: closing_cents,
            },
            nonce,
            gas_limit: self.gas.start_after_resolve,
            gas_price: boosted,
        };
        let started = submit_and_confirm(self.ledger.as_ref(), &start, self.confirmation_timeout()).await;
        drop(writes);

        self.settle(round_id).await;

        match started {
            Ok(_) => {
                info!(previous_round = round_id, strike_cents = closing_cents, "New round started");
                self.retry.reset();
                self.after_round_started().await;
                self.poll_interval()
            }
            Err(e) => {
                self.phase = RoundPhase::ResolvedAwaitingNext;
                error!(round_id, error = %e, "Start after resolve failed");
                self.transition_failed(round_id, &e)
            }
        }
    }

    async fn start_after_external_resolve(&mut self, round_id: u64) -> Duration {
        if round_id > self.last_resolved_round {
            info!(round_id, "Round already resolved on the ledger, starting next");
        }
        self.settle(round_id).await;

        let price = match self.fetch_price().await {
            Some(p) => p,
            None => return self.price_unavailable(round_id),
        };
        let strike_cents = price_to_cents(price);

        let result = self
            .submit(ContractCall::StartNewRound { strike_cents }, self.gas.start_round, 1.0)
            .await;
        match result {
            Ok(Some(_)) => {
                info!(previous_round = round_id, strike_cents, "New round started");
                self.last_resolved_round = self.last_resolved_round.max(round_id);
                self.retry.reset();
                self.after_round_started().await;
                self.poll_interval()
            }
            Ok(None) => self.poll_interval(),
            Err(e) => {
                error!(round_id, error = %e, "Start new round failed");
                self.transition_failed(round_id, &e)
            }
        }
    }

    /// Sync the cache and schedule the automatic batch pass.
    async fn after_round_started(&mut self) {
        self.phase = RoundPhase::Open;
        match self.cache.sync_from_ledger(self.ledger.as_ref()).await {
            Ok(snapshot) => info!(%snapshot, "Round cache synced"),
            Err(e) => warn!(error = %e, "Round cache sync failed"),
        }

        let Some(engine) = self.batch.clone() else {
            return;
        };
        let settle = Duration::from_secs(self.config.batch_settle_delay_secs);
        tokio::spawn(async move {
            tokio::time::sleep(settle).await;
            match engine.run(BatchTrigger::Automatic).await {
                Ok(BatchOutcome::Placed(report)) => {
                    debug!(batch_id = %report.batch_id, "Automatic batch complete")
                }
                Ok(BatchOutcome::Skipped(reason)) => info!(%reason, "Automatic batch skipped"),
                Ok(BatchOutcome::NoneQualified { round_id, .. }) => {
                    info!(round_id, "Automatic batch: no participant qualified")
                }
                Err(e) => warn!(error = %e, "Automatic batch failed"),
            }
        });
    }

    /// Count wins and losses for a resolved round. Best-effort.
    async fn settle(&self, round_id: u64) {
        match self.ledger.round_info(round_id).await {
            Ok(info) => match info.outcome() {
                Some(winner) => {
                    self.registry.record_outcome(round_id, winner.is_up()).await;
                }
                None => debug!(round_id, "Outcome not yet visible"),
            },
            Err(e) => warn!(round_id, error = %e, "Outcome read failed"),
        }
    }

    // -----------------------------------------------------------------------
    // Protocol fees
    // -----------------------------------------------------------------------

    async fn check_fees(&mut self, now: i64) {
        let due_for_check = match self.last_fee_check {
            None => true,
            Some(last) => now - last >= self.config.fee_check_interval_secs as i64,
        };
        if !due_for_check {
            return;
        }
        self.last_fee_check = Some(now);

        let state = match self.ledger.fee_state().await {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "Fee state read failed");
                return;
            }
        };
        if !state.is_due() {
            debug!(seconds_until_due = state.seconds_until_due, "Fee distribution not due");
            return;
        }

        info!(accrued = state.accrued, "Distributing protocol fees");
        match self
            .submit(ContractCall::DistributeFee, self.gas.distribute_fee, 1.0)
            .await
        {
            Ok(Some(tx_hash)) => info!(tx_hash = %tx_hash, "Protocol fees distributed"),
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Fee distribution failed"),
        }
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn confirmation_timeout(&self) -> Duration {
        Duration::from_secs(self.config.confirmation_timeout_secs)
    }

    /// Submit with the ledger's current nonce and gas price.
    /// `Ok(None)` means the pre-submission reads failed and nothing was sent.
    async fn submit(
        &self,
        call: ContractCall,
        gas_limit: u64,
        price_multiplier: f64,
    ) -> KeeperResult<Option<String>> {
        let _writes = self.ledger.write_lock().lock().await;
        let (gas_price, nonce) =
            match futures::try_join!(self.ledger.gas_price(), self.ledger.pending_nonce()) {
                Ok(v) => v,
                Err(e) => {
                    warn!(call = call.name(), error = %e, "Gas price / nonce read failed");
                    return Ok(None);
                }
            };
        let request = TxRequest {
            call,
            nonce,
            gas_limit,
            gas_price: boost_gas_price(gas_price, price_multiplier),
        };
        submit_and_confirm(self.ledger.as_ref(), &request, self.confirmation_timeout())
            .await
            .map(Some)
    }

    /// Ordering number for the transaction that follows a confirmed one:
    /// the ledger's pending count, never below `first + 1`.
    async fn next_nonce_after(&self, first: u64) -> u64 {
        let floor = first + 1;
        match self.ledger.pending_nonce().await {
            Ok(pending) if pending == floor => pending,
            Ok(pending) => {
                warn!(expected = floor, ledger = pending, "Nonce diverged from expectation");
                pending.max(floor)
            }
            Err(e) => {
                warn!(error = %e, fallback = floor, "Nonce read failed");
                floor
            }
        }
    }

    async fn fetch_price(&self) -> Option<f64> {
        match self.prices.price(&self.asset).await {
            Ok(p) if p > 0.0 => Some(p),
            Ok(p) => {
                warn!(price = p, "Price feed returned a non-positive price");
                None
            }
            Err(e) => {
                warn!(error = %e, "Price fetch failed");
                None
            }
        }
    }

    /// Writes that were refused, reverted or never confirmed spend the retry
    /// budget. A transport failure before the node saw the write is treated
    /// like a read failure.
    fn transition_failed(&mut self, round_id: u64, error: &KeeperError) -> Duration {
        if error.is_transaction_failure() {
            self.retry.record_failure(round_id, None)
        } else {
            self.poll_interval()
        }
    }

    fn price_unavailable(&mut self, round_id: u64) -> Duration {
        let delay = Duration::from_secs(self.config.price_retry_secs);
        self.retry.record_failure(round_id, Some(delay))
    }

    /// Cache the price once per round in the last seconds before expiry.
    async fn maybe_prefetch(&mut self, round_id: u64, end_time: u64, now: i64) {
        let left = end_time as i64 - now;
        if left <= 0 || left > self.config.prefetch_window_secs as i64 {
            return;
        }
        if matches!(self.prefetched, Some(p) if p.round_id == round_id) {
            return;
        }
        if let Some(price) = self.fetch_price().await {
            debug!(round_id, price, seconds_left = left, "Closing price prefetched");
            self.prefetched = Some(PrefetchedPrice {
                round_id,
                price,
                fetched_at: now,
            });
        }
    }

    /// Prefetched price if recent enough, otherwise a fresh fetch.
    async fn resolution_price(&self, round_id: u64, now: i64) -> Option<f64> {
        if let Some(p) = self.prefetched {
            if p.round_id == round_id && now - p.fetched_at < self.config.prefetch_max_age_secs as i64 {
                debug!(round_id, price = p.price, age_secs = now - p.fetched_at, "Using prefetched price");
                return Some(p.price);
            }
        }
        self.fetch_price().await
    }
}

fn boost_gas_price(gas_price: u64, multiplier: f64) -> u64 {
    if multiplier <= 1.0 || !multiplier.is_finite() {
        return gas_price;
    }
    (gas_price as f64 * multiplier).ceil() as u64
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
