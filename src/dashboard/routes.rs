//! API route handlers.
//!
//! All endpoints return JSON. State is shared via `Arc<DashboardState>`.
//! Failures carry a status code and a short message; internal error detail
//! only goes to the log.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::engine::{
    BatchEngine, BatchOutcome, BatchTrigger, ParticipantRegistry, RoundStateCache, SkipReason,
};
use crate::feeds::{CachedForecastProvider, PriceFeed};
use crate::ledger::{abi, Ledger};
use crate::types::{normalize_address, Direction, KeeperError, LogEntry, ParticipantBot, WagerSnapshot};

/// Log entries returned by a status query.
pub const STATUS_LOG_ENTRIES: usize = 20;

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

/// Shared state accessible by all route handlers.
pub struct DashboardState {
    pub agent_name: String,
    pub asset: String,
    pub started_at: DateTime<Utc>,
    pub cache: Arc<RoundStateCache>,
    pub registry: Arc<ParticipantRegistry>,
    /// Absent when no ledger is configured; the status view then serves
    /// whatever the cache holds.
    pub ledger: Option<Arc<dyn Ledger>>,
    pub forecasts: Option<Arc<CachedForecastProvider>>,
    pub prices: Option<Arc<dyn PriceFeed>>,
    pub batch: Option<Arc<BatchEngine>>,
}

impl DashboardState {
    pub fn new(
        agent_name: &str,
        asset: &str,
        cache: Arc<RoundStateCache>,
        registry: Arc<ParticipantRegistry>,
    ) -> Self {
        Self {
            agent_name: agent_name.to_string(),
            asset: asset.to_string(),
            started_at: Utc::now(),
            cache,
            registry,
            ledger: None,
            forecasts: None,
            prices: None,
            batch: None,
        }
    }

    pub fn with_ledger(mut self, ledger: Arc<dyn Ledger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn with_forecasts(mut self, forecasts: Arc<CachedForecastProvider>) -> Self {
        self.forecasts = Some(forecasts);
        self
    }

    pub fn with_prices(mut self, prices: Arc<dyn PriceFeed>) -> Self {
        self.prices = Some(prices);
        self
    }

    pub fn with_batch_engine(mut self, batch: Arc<BatchEngine>) -> Self {
        self.batch = Some(batch);
        self
    }
}

pub type AppState = Arc<DashboardState>;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(serde_json::json!({ "error": self.message })),
        )
            .into_response()
    }
}

impl From<KeeperError> for ApiError {
    fn from(e: KeeperError) -> Self {
        warn!(error = %e, "Request failed");
        match e {
            KeeperError::ForecastUnavailable(_) => {
                ApiError::new(StatusCode::SERVICE_UNAVAILABLE, "Forecast unavailable")
            }
            KeeperError::TransactionReverted { .. } => {
                ApiError::new(StatusCode::BAD_GATEWAY, "Wager transaction reverted")
            }
            KeeperError::TransactionRejected { .. } => {
                ApiError::new(StatusCode::BAD_GATEWAY, "Wager transaction rejected")
            }
            KeeperError::TransactionTimeout { .. } => {
                ApiError::new(StatusCode::GATEWAY_TIMEOUT, "Wager transaction not confirmed in time")
            }
            KeeperError::InsufficientBalance { .. } => {
                ApiError::new(StatusCode::CONFLICT, "Insufficient balance")
            }
            _ => ApiError::new(StatusCode::SERVICE_UNAVAILABLE, "Ledger unavailable"),
        }
    }
}

fn validated_player(player: &str) -> Result<String, ApiError> {
    abi::parse_address(player.trim())
        .map_err(|_| ApiError::new(StatusCode::BAD_REQUEST, "Invalid player address"))?;
    Ok(normalize_address(player))
}

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct StartBotRequest {
    pub player: String,
    #[serde(default)]
    pub max_bet_eth: Option<Decimal>,
}

#[derive(Debug, Deserialize)]
pub struct PlayerRequest {
    pub player: String,
}

#[derive(Debug, Deserialize)]
pub struct StatusQuery {
    #[serde(default)]
    pub player: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ForecastView {
    pub direction: Direction,
    pub confidence: f64,
    pub predicted_return: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MarketStatusResponse {
    pub agent: String,
    pub asset: String,
    pub round_id: u64,
    pub end_time: u64,
    pub remaining_secs: u64,
    pub strike_price: f64,
    /// Live reference price; absent when the feed is unreachable.
    pub current_price: Option<f64>,
    pub up_pool: Decimal,
    pub down_pool: Decimal,
    pub forecast: Option<ForecastView>,
    pub active_bots: usize,
    pub uptime_secs: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BotStatusResponse {
    pub player: String,
    pub active: bool,
    pub max_bet: Decimal,
    pub last_wagered_round: u64,
    pub total_bets: u64,
    pub wins: u64,
    pub losses: u64,
    pub win_rate: f64,
    pub last_wager: Option<WagerSnapshot>,
    pub recent_log: Vec<LogEntry>,
}

impl BotStatusResponse {
    fn from_bot(player: &str, bot: &ParticipantBot) -> Self {
        Self {
            player: player.to_string(),
            active: bot.active,
            max_bet: bot.max_wager,
            last_wagered_round: bot.last_wagered_round,
            total_bets: bot.total_bets,
            wins: bot.wins,
            losses: bot.losses,
            win_rate: bot.win_rate(),
            last_wager: bot.last_wager.clone(),
            recent_log: bot.recent_log.recent(STATUS_LOG_ENTRIES),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BotSummaryResponse {
    pub known_bots: usize,
    pub active_bots: usize,
    pub active_players: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ManualBetResponse {
    pub round_id: u64,
    pub direction: Direction,
    pub amount: Decimal,
    pub tx_hash: String,
}

// ---------------------------------------------------------------------------
// Route handlers
// ---------------------------------------------------------------------------

/// GET /api/market/status
pub async fn market_status(State(state): State<AppState>) -> Json<MarketStatusResponse> {
    if let Some(ledger) = &state.ledger {
        match state.cache.refresh_if_stale(ledger.as_ref()).await {
            Ok(true) => debug!("Round cache refreshed from status request"),
            Ok(false) => {}
            Err(e) => debug!(error = %e, "Opportunistic cache refresh failed"),
        }
    }

    let snapshot = state.cache.snapshot().await;
    let forecast = match &state.forecasts {
        Some(f) => f.latest().await.map(|f| ForecastView {
            direction: f.direction,
            confidence: f.confidence,
            predicted_return: f.predicted_return,
            timestamp: f.timestamp,
        }),
        None => None,
    };
    let current_price = match &state.prices {
        Some(prices) => match prices.price(&state.asset).await {
            Ok(p) => Some(p),
            Err(e) => {
                debug!(error = %e, "Price fetch for status failed");
                None
            }
        },
        None => None,
    };
    let now = Utc::now();

    Json(MarketStatusResponse {
        agent: state.agent_name.clone(),
        asset: state.asset.clone(),
        round_id: snapshot.round_id,
        end_time: snapshot.end_time,
        remaining_secs: snapshot.remaining_secs(now.timestamp()),
        strike_price: snapshot.strike_price,
        current_price,
        up_pool: snapshot.up_pool,
        down_pool: snapshot.down_pool,
        forecast,
        active_bots: state.registry.summary().await.active.len(),
        uptime_secs: (now - state.started_at).num_seconds(),
    })
}

/// POST /api/bot/start
pub async fn start_bot(
    State(state): State<AppState>,
    Json(req): Json<StartBotRequest>,
) -> Result<Json<BotStatusResponse>, ApiError> {
    let player = validated_player(&req.player)?;
    if let Some(ceiling) = req.max_bet_eth {
        if ceiling <= Decimal::ZERO {
            return Err(ApiError::new(StatusCode::BAD_REQUEST, "max_bet_eth must be positive"));
        }
    }
    let bot = state.registry.activate(&player, req.max_bet_eth).await;
    Ok(Json(BotStatusResponse::from_bot(&player, &bot)))
}

/// POST /api/bot/stop
pub async fn stop_bot(
    State(state): State<AppState>,
    Json(req): Json<PlayerRequest>,
) -> Result<Json<BotStatusResponse>, ApiError> {
    let player = validated_player(&req.player)?;
    let bot = state
        .registry
        .deactivate(&player)
        .await
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, "No bot for this player"))?;
    Ok(Json(BotStatusResponse::from_bot(&player, &bot)))
}

/// POST /api/bot/bet
pub async fn manual_bet(
    State(state): State<AppState>,
    Json(req): Json<PlayerRequest>,
) -> Result<Json<ManualBetResponse>, ApiError> {
    let player = validated_player(&req.player)?;
    let engine = state
        .batch
        .as_ref()
        .ok_or_else(|| ApiError::new(StatusCode::SERVICE_UNAVAILABLE, "Betting is not enabled"))?;

    info!(player = %player, "Manual bet requested");
    match engine.run(BatchTrigger::Manual(player.clone())).await? {
        BatchOutcome::Placed(report) => {
            let amount = report
                .included
                .iter()
                .find(|w| w.participant == player)
                .map(|w| w.amount)
                .unwrap_or_default();
            Ok(Json(ManualBetResponse {
                round_id: report.round_id,
                direction: report.direction,
                amount,
                tx_hash: report.tx_hash,
            }))
        }
        BatchOutcome::Skipped(SkipReason::NotOptedIn(_)) => Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            "Bot is not active for this player",
        )),
        BatchOutcome::Skipped(reason) => Err(ApiError::new(StatusCode::CONFLICT, reason.to_string())),
        BatchOutcome::NoneQualified { .. } => Err(ApiError::new(
            StatusCode::CONFLICT,
            "Insufficient balance for this wager",
        )),
    }
}

/// GET /api/bot/status
pub async fn bot_status(
    State(state): State<AppState>,
    Query(query): Query<StatusQuery>,
) -> Result<Response, ApiError> {
    match query.player.as_deref().filter(|p| !p.trim().is_empty()) {
        Some(player) => {
            let player = validated_player(player)?;
            let bot = state
                .registry
                .get(&player)
                .await
                .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, "No bot for this player"))?;
            Ok(Json(BotStatusResponse::from_bot(&player, &bot)).into_response())
        }
        None => {
            let summary = state.registry.summary().await;
            Ok(Json(BotSummaryResponse {
                known_bots: summary.known,
                active_bots: summary.active.len(),
                active_players: summary.active,
            })
            .into_response())
        }
    }
}

/// GET /health
pub async fn health() -> StatusCode {
    StatusCode::OK
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
