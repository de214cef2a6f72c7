//! End-to-end scenarios: the round orchestrator and the batch engine
//! driven against the in-memory contract.

use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;

use keeper::config::{BatchConfig, GasConfig, RoundConfig};
use keeper::engine::{
    BatchEngine, BatchOutcome, BatchTrigger, ParticipantRegistry, RoundOrchestrator, RoundPhase,
    RoundStateCache, SkipReason,
};
use keeper::feeds::{ForecastProvider, PriceFeed};
use keeper::ledger::{ContractCall, Ledger};
use keeper::types::{from_base_units, to_base_units, Direction, FeeState, KeeperError};

use crate::mock_ledger::*;

const ROUND_SECS: u64 = 300;
const POLL: Duration = Duration::from_millis(1_000);

fn round_config() -> RoundConfig {
    RoundConfig {
        backoff_jitter_ms: 0,
        batch_settle_delay_secs: 0,
        ..RoundConfig::default()
    }
}

struct Harness {
    ledger: Arc<MockLedger>,
    prices: Arc<StaticPriceFeed>,
    cache: Arc<RoundStateCache>,
    registry: Arc<ParticipantRegistry>,
}

impl Harness {
    fn new(clock: u64, price: f64) -> Self {
        Self {
            ledger: Arc::new(MockLedger::new(clock, ROUND_SECS)),
            prices: Arc::new(StaticPriceFeed::new(price)),
            cache: Arc::new(RoundStateCache::new()),
            registry: Arc::new(ParticipantRegistry::in_memory(dec!(0.01))),
        }
    }

    fn orchestrator(&self) -> RoundOrchestrator {
        let ledger: Arc<dyn Ledger> = self.ledger.clone();
        let prices: Arc<dyn PriceFeed> = self.prices.clone();
        RoundOrchestrator::new(
            ledger,
            prices,
            self.cache.clone(),
            self.registry.clone(),
            round_config(),
            GasConfig::default(),
            "btc",
        )
    }

    fn batch_engine(&self, forecasts: StaticForecast) -> Arc<BatchEngine> {
        self.batch_engine_with(forecasts, BatchConfig::default())
    }

    fn batch_engine_with(&self, forecasts: StaticForecast, config: BatchConfig) -> Arc<BatchEngine> {
        let ledger: Arc<dyn Ledger> = self.ledger.clone();
        let forecasts: Arc<dyn ForecastProvider> = Arc::new(forecasts);
        Arc::new(BatchEngine::new(
            ledger,
            forecasts,
            self.registry.clone(),
            config,
            GasConfig::default(),
            "btc",
        ))
    }

    /// Clock at wall time with round #1 open for a full window.
    fn with_open_round_now() -> Self {
        let h = Harness::new(Utc::now().timestamp() as u64, 65_000.0);
        h.ledger.open_round(6_500_000);
        h
    }

    /// Move both the contract clock and the keeper's view of time.
    async fn tick_at(&self, orchestrator: &mut RoundOrchestrator, now: u64) -> Duration {
        self.ledger.set_clock(now);
        orchestrator.tick(now as i64).await
    }
}

fn batch_calls(ledger: &MockLedger) -> Vec<ContractCall> {
    ledger
        .sent()
        .into_iter()
        .map(|r| r.call)
        .filter(|c| matches!(c, ContractCall::PlaceBetBatch { .. }))
        .collect()
}

// ---------------------------------------------------------------------------
// Round lifecycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_first_round_starts_at_current_price() {
    let h = Harness::new(1_000, 65_000.257);
    let mut orch = h.orchestrator();

    let delay = h.tick_at(&mut orch, 1_000).await;

    assert_eq!(delay, POLL);
    assert_eq!(h.ledger.sent_names(), vec!["startFirstRound"]);
    let round = h.ledger.round(1).unwrap();
    assert_eq!(round.strike_cents, 6_500_026);
    assert_eq!(orch.phase(), RoundPhase::Open);

    let snapshot = h.cache.snapshot().await;
    assert_eq!(snapshot.round_id, 1);
    assert_eq!(snapshot.end_time, 1_300);
    assert!((snapshot.strike_price - 65_000.26).abs() < 1e-9);
}

#[tokio::test]
async fn test_open_round_is_left_alone() {
    let h = Harness::new(1_000, 65_000.0);
    h.ledger.open_round(6_500_000);
    let mut orch = h.orchestrator();

    let delay = h.tick_at(&mut orch, 1_100).await;

    assert_eq!(delay, POLL);
    assert_eq!(orch.phase(), RoundPhase::Open);
    assert!(h.ledger.sent_names().is_empty());
}

#[tokio::test]
async fn test_expired_round_resolves_and_next_starts_at_closing_price() {
    let h = Harness::new(1_000, 65_000.0);
    h.ledger.open_round(6_500_000);
    let mut orch = h.orchestrator();
    h.prices.set(Some(65_100.0));

    h.tick_at(&mut orch, 1_301).await;

    assert_eq!(h.ledger.sent_names(), vec!["resolveRound", "startNewRound"]);
    let resolved = h.ledger.round(1).unwrap();
    assert!(resolved.resolved);
    assert!(resolved.up_won);
    assert_eq!(resolved.closing_cents, 6_510_000);
    assert_eq!(h.ledger.round(2).unwrap().strike_cents, 6_510_000);
    assert_eq!(orch.last_resolved_round(), 1);
    assert_eq!(orch.phase(), RoundPhase::Open);
    assert_eq!(h.cache.round_id().await, 2);

    // Consecutive ordering numbers, boosted gas price on both
    let sent = h.ledger.sent();
    assert_eq!(sent[0].nonce, 0);
    assert_eq!(sent[1].nonce, 1);
    assert_eq!(sent[0].gas_price, 1_200_000_000);
    assert_eq!(sent[1].gas_price, 1_200_000_000);
    match &sent[0].call {
        ContractCall::ResolveRound { proof, .. } => assert_eq!(proof, "static-1301"),
        other => panic!("unexpected call {other:?}"),
    }
}

#[tokio::test]
async fn test_grace_period_delays_resolution() {
    let h = Harness::new(1_000, 65_000.0);
    h.ledger.open_round(6_500_000);
    let mut orch = h.orchestrator();

    h.tick_at(&mut orch, 1_300).await;
    assert!(h.ledger.sent_names().is_empty());

    h.tick_at(&mut orch, 1_301).await;
    assert_eq!(h.ledger.sent_names()[0], "resolveRound");
}

#[tokio::test]
async fn test_start_nonce_never_reuses_resolve_nonce() {
    let h = Harness::new(1_000, 65_000.0);
    h.ledger.open_round(6_500_000);
    // Node keeps reporting the pre-resolve count
    h.ledger.set_pending_override(Some(0));
    let mut orch = h.orchestrator();

    h.tick_at(&mut orch, 1_301).await;

    let sent = h.ledger.sent();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].nonce, 0);
    assert_eq!(sent[1].nonce, 1);
    assert_eq!(h.ledger.current_round(), 2);
}

#[tokio::test]
async fn test_failed_start_after_resolve_never_resolves_twice() {
    let h = Harness::new(1_000, 65_000.0);
    h.ledger.open_round(6_500_000);
    h.ledger.fail_next("startNewRound", 1);
    let mut orch = h.orchestrator();

    let delay = h.tick_at(&mut orch, 1_301).await;
    assert_eq!(delay, Duration::from_secs(4));
    assert_eq!(orch.phase(), RoundPhase::ResolvedAwaitingNext);
    assert_eq!(orch.retry_attempts(), 1);
    assert!(h.ledger.round(1).unwrap().resolved);

    h.prices.set(Some(64_900.0));
    h.tick_at(&mut orch, 1_306).await;

    assert_eq!(
        h.ledger.sent_names(),
        vec!["resolveRound", "startNewRound", "startNewRound"]
    );
    // Fresh price for the externally-visible resolved round
    assert_eq!(h.ledger.round(2).unwrap().strike_cents, 6_490_000);
    assert_eq!(orch.retry_attempts(), 0);
}

#[tokio::test]
async fn test_externally_resolved_round_is_followed_by_new_round() {
    let h = Harness::new(1_000, 65_000.0);
    h.ledger.open_round(6_500_000);
    h.ledger.set_clock(1_301);
    h.ledger.resolve_externally(6_400_000);
    let mut orch = h.orchestrator();

    h.tick_at(&mut orch, 1_302).await;

    assert_eq!(h.ledger.sent_names(), vec!["startNewRound"]);
    assert_eq!(h.ledger.current_round(), 2);
    assert_eq!(h.ledger.round(2).unwrap().strike_cents, 6_500_000);
}

#[tokio::test]
async fn test_tenth_resolve_failure_cools_down() {
    let h = Harness::new(1_000, 65_000.0);
    h.ledger.open_round(6_500_000);
    h.ledger.fail_next("resolveRound", 10);
    let mut orch = h.orchestrator();

    let mut now = 1_301;
    for attempt in 1..=9u32 {
        let delay = h.tick_at(&mut orch, now).await;
        assert_eq!(delay, Duration::from_secs(3 + attempt as u64));
        assert_eq!(orch.retry_attempts(), attempt);
        now += delay.as_secs();
    }

    let delay = h.tick_at(&mut orch, now).await;
    assert_eq!(delay, Duration::from_secs(30));
    assert_eq!(orch.retry_attempts(), 0);
    assert!(!h.ledger.round(1).unwrap().resolved);

    // Budget restored: the next pass goes through
    h.tick_at(&mut orch, now + 30).await;
    assert!(h.ledger.round(1).unwrap().resolved);
    assert_eq!(h.ledger.current_round(), 2);
}

#[tokio::test]
async fn test_node_rejected_resolve_spends_budget() {
    let h = Harness::new(1_000, 65_000.0);
    h.ledger.open_round(6_500_000);
    h.ledger.reject_next("resolveRound", 10);
    let mut orch = h.orchestrator();

    let mut now = 1_301;
    for attempt in 1..=9u32 {
        let delay = h.tick_at(&mut orch, now).await;
        assert_eq!(delay, Duration::from_secs(3 + attempt as u64));
        assert_eq!(orch.retry_attempts(), attempt);
        now += delay.as_secs();
    }
    assert_eq!(h.tick_at(&mut orch, now).await, Duration::from_secs(30));
    assert_eq!(orch.retry_attempts(), 0);
    // Refused writes never reach the chain or use an ordering number
    assert!(h.ledger.sent_names().is_empty());

    h.tick_at(&mut orch, now + 30).await;
    let sent = h.ledger.sent();
    assert_eq!(h.ledger.sent_names(), vec!["resolveRound", "startNewRound"]);
    assert_eq!(sent[0].nonce, 0);
    assert_eq!(h.ledger.current_round(), 2);
}

#[tokio::test]
async fn test_unconfirmed_resolve_is_not_sent_again() {
    let h = Harness::new(1_000, 65_000.0);
    h.ledger.open_round(6_500_000);
    // The resolve lands but its receipt never shows up
    h.ledger.lose_receipt_next("resolveRound", 1);
    let mut orch = h.orchestrator();

    let delay = h.tick_at(&mut orch, 1_301).await;
    assert_eq!(delay, Duration::from_secs(4));
    assert_eq!(orch.retry_attempts(), 1);
    assert_eq!(h.ledger.sent_names(), vec!["resolveRound"]);
    assert!(h.ledger.round(1).unwrap().resolved);
    assert_eq!(h.ledger.current_round(), 1);

    h.tick_at(&mut orch, 1_305).await;

    assert_eq!(h.ledger.sent_names(), vec!["resolveRound", "startNewRound"]);
    assert_eq!(h.ledger.current_round(), 2);
    assert_eq!(orch.phase(), RoundPhase::Open);
    assert_eq!(orch.retry_attempts(), 0);
}

#[tokio::test]
async fn test_read_failure_waits_without_spending_budget() {
    let h = Harness::new(1_000, 65_000.0);
    h.ledger.open_round(6_500_000);
    h.ledger.set_reads_fail(true);
    let mut orch = h.orchestrator();

    let delay = h.tick_at(&mut orch, 1_301).await;

    assert_eq!(delay, POLL);
    assert_eq!(orch.retry_attempts(), 0);
    assert!(h.ledger.sent_names().is_empty());
}

#[tokio::test]
async fn test_missing_price_retries_shortly() {
    let h = Harness::new(1_000, 65_000.0);
    h.prices.set(None);
    let mut orch = h.orchestrator();

    let delay = h.tick_at(&mut orch, 1_000).await;

    assert_eq!(delay, Duration::from_secs(2));
    assert!(h.ledger.sent_names().is_empty());
    assert_eq!(h.ledger.current_round(), 0);
}

#[tokio::test]
async fn test_prefetched_price_settles_round() {
    let h = Harness::new(1_000, 65_000.0);
    h.ledger.open_round(6_500_000);
    let mut orch = h.orchestrator();

    h.prices.set(Some(64_000.0));
    h.tick_at(&mut orch, 1_295).await;
    let calls_after_prefetch = h.prices.calls();
    assert_eq!(calls_after_prefetch, 1);

    // A later quote is ignored while the prefetched one is fresh
    h.prices.set(Some(66_000.0));
    h.tick_at(&mut orch, 1_301).await;

    assert_eq!(h.prices.calls(), calls_after_prefetch);
    let resolved = h.ledger.round(1).unwrap();
    assert_eq!(resolved.closing_cents, 6_400_000);
    assert!(!resolved.up_won);
}

#[tokio::test]
async fn test_fee_distribution_when_due() {
    let h = Harness::new(1_000, 65_000.0);
    h.ledger.open_round(6_500_000);
    h.ledger.set_fee_state(FeeState {
        seconds_until_due: 0,
        accrued: 5_000,
    });
    let mut orch = h.orchestrator();

    h.tick_at(&mut orch, 1_010).await;
    assert_eq!(h.ledger.sent_names(), vec!["distributeDevFee"]);

    // Not checked again inside the interval
    h.ledger.set_fee_state(FeeState {
        seconds_until_due: 0,
        accrued: 5_000,
    });
    h.tick_at(&mut orch, 1_020).await;
    assert_eq!(h.ledger.sent_names().len(), 1);
}

// ---------------------------------------------------------------------------
// Batch betting
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_batch_places_one_combined_wager() {
    let h = Harness::with_open_round_now();
    h.registry.activate(ALICE, None).await;
    h.registry.activate(BOB, Some(dec!(0.02))).await;
    h.ledger.set_balance(ALICE, milli(1_000));
    h.ledger.set_balance(BOB, milli(1_000));
    let engine = h.batch_engine(StaticForecast::new(Direction::Up, 80.0));

    let outcome = engine.run(BatchTrigger::Automatic).await.unwrap();

    let report = match outcome {
        BatchOutcome::Placed(report) => report,
        other => panic!("expected a placed batch, got {other:?}"),
    };
    assert_eq!(report.round_id, 1);
    assert_eq!(report.direction, Direction::Up);
    assert_eq!(report.included.len(), 2);
    assert!(report.excluded.is_empty());

    let calls = batch_calls(&h.ledger);
    assert_eq!(calls.len(), 1);
    match &calls[0] {
        ContractCall::PlaceBetBatch {
            participants,
            amounts,
            is_up,
        } => {
            assert_eq!(participants.len(), 2);
            assert_eq!(amounts.len(), 2);
            assert!(*is_up);
        }
        other => panic!("unexpected call {other:?}"),
    }

    let round = h.ledger.round(1).unwrap();
    assert_eq!(from_base_units(round.up_pool), report.total());
    assert_eq!(round.total_bets, 2);

    for w in &report.included {
        assert!(w.amount > Decimal::ZERO);
        let bot = h.registry.get(&w.participant).await.unwrap();
        assert!(w.amount <= bot.max_wager);
        assert_eq!(bot.total_bets, 1);
        assert_eq!(bot.last_wagered_round, 1);
        let last = bot.last_wager.unwrap();
        assert_eq!(last.tx_hash, report.tx_hash);
        assert_eq!(last.amount, w.amount);
    }
    let alice = report
        .included
        .iter()
        .find(|w| w.participant == ALICE)
        .unwrap();
    assert_eq!(
        h.ledger.balance(ALICE),
        milli(1_000) - to_base_units(alice.amount).unwrap()
    );
}

#[tokio::test]
async fn test_underfunded_participant_is_excluded() {
    let h = Harness::with_open_round_now();
    h.registry.activate(ALICE, None).await;
    h.registry.activate(CAROL, None).await;
    h.ledger.set_balance(ALICE, milli(1_000));
    // Covers a wager but not the gas reserve on top
    h.ledger.set_balance(CAROL, milli(10));
    let engine = h.batch_engine(StaticForecast::new(Direction::Down, 90.0));

    let outcome = engine.run(BatchTrigger::Automatic).await.unwrap();

    let report = match outcome {
        BatchOutcome::Placed(report) => report,
        other => panic!("expected a placed batch, got {other:?}"),
    };
    assert_eq!(report.included.len(), 1);
    assert_eq!(report.included[0].participant, ALICE);
    assert_eq!(report.excluded.len(), 1);
    assert_eq!(report.excluded[0].participant, CAROL);
    assert!(report.excluded[0].reason.contains("Insufficient balance"));

    let carol = h.registry.get(CAROL).await.unwrap();
    assert_eq!(carol.total_bets, 0);
    assert_eq!(carol.last_wagered_round, 0);
    assert!(carol
        .recent_log
        .iter()
        .any(|e| e.message.starts_with("Skipped round #1")));
    assert_eq!(h.ledger.balance(CAROL), milli(10));
    assert_eq!(
        from_base_units(h.ledger.round(1).unwrap().down_pool),
        report.included[0].amount
    );
}

#[tokio::test]
async fn test_nobody_funded_submits_nothing() {
    let h = Harness::with_open_round_now();
    h.registry.activate(ALICE, None).await;
    let engine = h.batch_engine(StaticForecast::new(Direction::Up, 80.0));

    let outcome = engine.run(BatchTrigger::Automatic).await.unwrap();

    match outcome {
        BatchOutcome::NoneQualified { round_id, excluded } => {
            assert_eq!(round_id, 1);
            assert_eq!(excluded.len(), 1);
        }
        other => panic!("expected no qualifying participant, got {other:?}"),
    }
    assert!(h.ledger.sent_names().is_empty());
}

#[tokio::test]
async fn test_batch_skipped_near_round_end() {
    let now = Utc::now().timestamp() as u64;
    // Round opened 260s ago: about 40s remain
    let h = Harness::new(now - 260, 65_000.0);
    h.ledger.open_round(6_500_000);
    h.ledger.set_clock(now);
    h.registry.activate(ALICE, None).await;
    h.ledger.set_balance(ALICE, milli(1_000));
    let engine = h.batch_engine(StaticForecast::new(Direction::Up, 80.0));

    let outcome = engine.run(BatchTrigger::Automatic).await.unwrap();

    match outcome {
        BatchOutcome::Skipped(SkipReason::NotEnoughTime { remaining_secs }) => {
            assert!(remaining_secs < 45)
        }
        other => panic!("expected a time skip, got {other:?}"),
    }
    assert!(h.ledger.sent_names().is_empty());
    let alice = h.registry.get(ALICE).await.unwrap();
    assert_eq!(alice.total_bets, 0);
    assert_eq!(alice.recent_log.len(), 1);
}

#[tokio::test]
async fn test_automatic_wager_once_per_round() {
    let h = Harness::with_open_round_now();
    h.registry.activate(ALICE, None).await;
    h.ledger.set_balance(ALICE, milli(1_000));
    let engine = h.batch_engine(StaticForecast::new(Direction::Up, 80.0));

    assert!(matches!(
        engine.run(BatchTrigger::Automatic).await.unwrap(),
        BatchOutcome::Placed(_)
    ));
    assert!(matches!(
        engine.run(BatchTrigger::Automatic).await.unwrap(),
        BatchOutcome::NoneQualified { .. }
    ));
    assert_eq!(batch_calls(&h.ledger).len(), 1);
    assert_eq!(h.registry.get(ALICE).await.unwrap().total_bets, 1);

    // A manual request may add a second wager in the same round
    assert!(matches!(
        engine.run(BatchTrigger::Manual(ALICE.to_string())).await.unwrap(),
        BatchOutcome::Placed(_)
    ));
    assert_eq!(batch_calls(&h.ledger).len(), 2);
    assert_eq!(h.registry.get(ALICE).await.unwrap().total_bets, 2);
}

#[tokio::test]
async fn test_concurrent_automatic_passes_wager_once() {
    let h = Harness::with_open_round_now();
    h.registry.activate(ALICE, None).await;
    h.ledger.set_balance(ALICE, milli(1_000));
    let engine = h.batch_engine(StaticForecast::new(Direction::Up, 80.0));

    let (a, b) = tokio::join!(
        engine.run(BatchTrigger::Automatic),
        engine.run(BatchTrigger::Automatic)
    );

    let placed = [a.unwrap(), b.unwrap()]
        .iter()
        .filter(|o| matches!(o, BatchOutcome::Placed(_)))
        .count();
    assert_eq!(placed, 1);
    assert_eq!(batch_calls(&h.ledger).len(), 1);
    let alice = h.registry.get(ALICE).await.unwrap();
    assert_eq!(alice.total_bets, 1);
    assert_eq!(
        milli(1_000) - h.ledger.balance(ALICE),
        to_base_units(alice.last_wager.unwrap().amount).unwrap()
    );
}

#[tokio::test]
async fn test_concurrent_automatic_and_manual_passes_serialise() {
    let h = Harness::with_open_round_now();
    h.registry.activate(ALICE, None).await;
    h.ledger.set_balance(ALICE, milli(1_000));
    let engine = h.batch_engine(StaticForecast::new(Direction::Up, 80.0));

    let (auto, manual) = tokio::join!(
        engine.run(BatchTrigger::Automatic),
        engine.run(BatchTrigger::Manual(ALICE.to_string()))
    );

    assert!(matches!(auto.unwrap(), BatchOutcome::Placed(_)));
    assert!(matches!(manual.unwrap(), BatchOutcome::Placed(_)));
    let nonces: Vec<u64> = h.ledger.sent().iter().map(|r| r.nonce).collect();
    assert_eq!(nonces, vec![0, 1]);
    assert_eq!(h.registry.get(ALICE).await.unwrap().total_bets, 2);
    assert_eq!(h.ledger.round(1).unwrap().total_bets, 2);
}

#[tokio::test]
async fn test_manual_bet_gives_up_while_pass_in_progress() {
    let h = Harness::with_open_round_now();
    h.registry.activate(ALICE, None).await;
    h.ledger.set_balance(ALICE, milli(1_000));
    h.ledger.set_receipt_delay(Duration::from_millis(300));
    let engine = h.batch_engine_with(
        StaticForecast::new(Direction::Up, 80.0),
        BatchConfig {
            manual_wait_secs: 0,
            ..BatchConfig::default()
        },
    );

    let (auto, manual) = tokio::join!(
        engine.run(BatchTrigger::Automatic),
        engine.run(BatchTrigger::Manual(ALICE.to_string()))
    );

    assert!(matches!(auto.unwrap(), BatchOutcome::Placed(_)));
    assert!(matches!(
        manual.unwrap(),
        BatchOutcome::Skipped(SkipReason::Busy)
    ));
    assert_eq!(batch_calls(&h.ledger).len(), 1);
    assert_eq!(h.registry.get(ALICE).await.unwrap().total_bets, 1);
}

#[tokio::test]
async fn test_fee_distribution_and_manual_bet_take_distinct_nonces() {
    let h = Harness::with_open_round_now();
    let start = h.ledger.round(1).unwrap().start_time;
    h.ledger.set_fee_state(FeeState {
        seconds_until_due: 0,
        accrued: 5_000,
    });
    h.registry.activate(ALICE, None).await;
    h.ledger.set_balance(ALICE, milli(1_000));
    let engine = h.batch_engine(StaticForecast::new(Direction::Up, 80.0));
    let mut orch = h.orchestrator();

    let (_, manual) = tokio::join!(
        h.tick_at(&mut orch, start),
        engine.run(BatchTrigger::Manual(ALICE.to_string()))
    );

    assert!(matches!(manual.unwrap(), BatchOutcome::Placed(_)));
    let mut sent: Vec<(u64, &str)> = h
        .ledger
        .sent()
        .iter()
        .map(|r| (r.nonce, r.call.name()))
        .collect();
    sent.sort();
    assert_eq!(sent, vec![(0, "distributeDevFee"), (1, "placeBetBatch")]);
    assert_eq!(h.registry.get(ALICE).await.unwrap().total_bets, 1);
}

#[tokio::test]
async fn test_reverted_batch_records_nothing() {
    let h = Harness::with_open_round_now();
    h.registry.activate(ALICE, None).await;
    h.registry.activate(BOB, None).await;
    h.ledger.set_balance(ALICE, milli(1_000));
    h.ledger.set_balance(BOB, milli(1_000));
    h.ledger.fail_next("placeBetBatch", 1);
    let engine = h.batch_engine(StaticForecast::new(Direction::Up, 80.0));

    let err = engine.run(BatchTrigger::Automatic).await.unwrap_err();

    assert!(matches!(err, KeeperError::TransactionReverted { .. }));
    for p in [ALICE, BOB] {
        let bot = h.registry.get(p).await.unwrap();
        assert_eq!(bot.total_bets, 0);
        assert_eq!(bot.last_wagered_round, 0);
        assert!(bot.last_wager.is_none());
        assert_eq!(h.ledger.balance(p), milli(1_000));
    }

    // The round is still eligible on the next pass
    assert!(matches!(
        engine.run(BatchTrigger::Automatic).await.unwrap(),
        BatchOutcome::Placed(_)
    ));
}

#[tokio::test]
async fn test_forecast_outage_fails_the_pass() {
    let h = Harness::with_open_round_now();
    h.registry.activate(ALICE, None).await;
    h.ledger.set_balance(ALICE, milli(1_000));
    let engine = h.batch_engine(StaticForecast::unavailable());

    let err = engine.run(BatchTrigger::Automatic).await.unwrap_err();

    assert!(matches!(err, KeeperError::ForecastUnavailable(_)));
    assert!(h.ledger.sent_names().is_empty());
}

#[tokio::test]
async fn test_manual_bet_requires_active_bot() {
    let h = Harness::with_open_round_now();
    h.registry.activate(ALICE, None).await;
    h.registry.deactivate(ALICE).await;
    h.ledger.set_balance(ALICE, milli(1_000));
    let engine = h.batch_engine(StaticForecast::new(Direction::Up, 80.0));

    for who in [ALICE, BOB] {
        let outcome = engine.run(BatchTrigger::Manual(who.to_string())).await.unwrap();
        assert!(matches!(
            outcome,
            BatchOutcome::Skipped(SkipReason::NotOptedIn(_))
        ));
    }
    assert!(h.ledger.sent_names().is_empty());
}

#[tokio::test]
async fn test_no_participants_skips() {
    let h = Harness::with_open_round_now();
    let engine = h.batch_engine(StaticForecast::new(Direction::Up, 80.0));

    let outcome = engine.run(BatchTrigger::Automatic).await.unwrap();

    assert!(matches!(
        outcome,
        BatchOutcome::Skipped(SkipReason::NoParticipants)
    ));
}

// ---------------------------------------------------------------------------
// Full cycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_resolution_settles_wins_and_losses() {
    let h = Harness::with_open_round_now();
    h.registry.activate(ALICE, None).await;
    h.ledger.set_balance(ALICE, milli(1_000));
    let engine = h.batch_engine(StaticForecast::new(Direction::Up, 80.0));
    engine.run(BatchTrigger::Automatic).await.unwrap();

    let end = h.ledger.round(1).unwrap().end_time;
    let mut orch = h.orchestrator();
    h.prices.set(Some(65_500.0));
    h.tick_at(&mut orch, end + 1).await;

    let alice = h.registry.get(ALICE).await.unwrap();
    assert_eq!(alice.wins, 1);
    assert_eq!(alice.losses, 0);
    assert!(alice.last_wager.unwrap().settled);
    assert!(alice.recent_log.iter().any(|e| e.message == "Round #1 won"));
}

#[tokio::test]
async fn test_two_wagers_in_one_round_both_settle() {
    let h = Harness::with_open_round_now();
    h.registry.activate(ALICE, None).await;
    h.ledger.set_balance(ALICE, milli(1_000));
    let engine = h.batch_engine(StaticForecast::new(Direction::Up, 80.0));
    engine.run(BatchTrigger::Automatic).await.unwrap();
    engine
        .run(BatchTrigger::Manual(ALICE.to_string()))
        .await
        .unwrap();

    let end = h.ledger.round(1).unwrap().end_time;
    let mut orch = h.orchestrator();
    h.prices.set(Some(64_000.0));
    h.tick_at(&mut orch, end + 1).await;

    let alice = h.registry.get(ALICE).await.unwrap();
    assert_eq!(alice.total_bets, 2);
    assert_eq!((alice.wins, alice.losses), (0, 2));
    assert!(alice.open_wagers.is_empty());
}

#[tokio::test]
async fn test_new_round_triggers_automatic_batch() {
    let now = Utc::now().timestamp() as u64;
    let h = Harness::new(now, 65_000.0);
    h.registry.activate(ALICE, None).await;
    h.ledger.set_balance(ALICE, milli(1_000));
    let engine = h.batch_engine(StaticForecast::new(Direction::Down, 70.0));
    let mut orch = h.orchestrator().with_batch_engine(engine);

    h.tick_at(&mut orch, now).await;
    assert_eq!(h.ledger.current_round(), 1);

    // The pass runs on its own task after the (zero) settle delay
    for _ in 0..50 {
        if !batch_calls(&h.ledger).is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert_eq!(batch_calls(&h.ledger).len(), 1);
    let alice = h.registry.get(ALICE).await.unwrap();
    assert_eq!(alice.last_wagered_round, 1);
    assert_eq!(alice.last_wager.unwrap().direction, Direction::Down);
}
