//! Participant registry: opt-in flags, wager ceilings, counters and event
//! logs for every participant that has ever started a bot.
//!
//! The table lives behind one `RwLock` owned by the registry. Every mutating
//! method applies its whole change under the write lock and persists the
//! table once before releasing it. A failed write is logged and the
//! in-memory table stays authoritative until the next successful write.

use rust_decimal::Decimal;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::storage::{self, ParticipantTable};
use crate::types::{
    normalize_address, KeeperError, KeeperResult, OpenWager, ParticipantBot, WagerSnapshot,
};

pub struct ParticipantRegistry {
    table: RwLock<ParticipantTable>,
    path: Option<String>,
    default_max_wager: Decimal,
}

/// Aggregate view for status queries without a specific participant.
#[derive(Debug, Clone, PartialEq)]
pub struct RegistrySummary {
    pub known: usize,
    pub active: Vec<String>,
}

impl ParticipantRegistry {
    /// Load from `path`, starting empty if the file does not exist.
    pub fn load(path: &str, default_max_wager: Decimal) -> anyhow::Result<Self> {
        let table = storage::load_participants(path)?.unwrap_or_default();
        Ok(Self {
            table: RwLock::new(table),
            path: Some(path.to_string()),
            default_max_wager,
        })
    }

    /// A registry that never touches disk.
    pub fn in_memory(default_max_wager: Decimal) -> Self {
        Self {
            table: RwLock::new(ParticipantTable::new()),
            path: None,
            default_max_wager,
        }
    }

    fn persist_locked(&self, table: &ParticipantTable) {
        if let Some(path) = &self.path {
            if let Err(e) = storage::save_participants(table, path) {
                warn!(path = %path, error = %e, "Participant table write failed");
            }
        }
    }

    /// Write the table now. Used at shutdown.
    pub async fn persist(&self) -> KeeperResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let table = self.table.read().await;
        storage::save_participants(&table, path).map_err(|e| KeeperError::Storage(e.to_string()))
    }

    // -----------------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------------

    /// Opt a participant in, creating its record on first use. The ceiling
    /// is set on every start; without one it falls back to the default.
    pub async fn activate(&self, address: &str, max_wager: Option<Decimal>) -> ParticipantBot {
        let key = normalize_address(address);
        let mut table = self.table.write().await;
        let bot = table
            .entry(key.clone())
            .or_insert_with(|| ParticipantBot::new(self.default_max_wager));
        bot.active = true;
        bot.max_wager = max_wager.unwrap_or(self.default_max_wager);
        bot.recent_log
            .push(format!("Bot started with max bet {}", bot.max_wager));
        let snapshot = bot.clone();
        self.persist_locked(&table);

        info!(participant = %key, max_wager = %snapshot.max_wager, "Bot started");
        snapshot
    }

    /// Soft-deactivate. Returns `None` for an unknown participant.
    pub async fn deactivate(&self, address: &str) -> Option<ParticipantBot> {
        let key = normalize_address(address);
        let mut table = self.table.write().await;
        let bot = table.get_mut(&key)?;
        bot.active = false;
        bot.recent_log.push("Bot stopped");
        let snapshot = bot.clone();
        self.persist_locked(&table);

        info!(participant = %key, "Bot stopped");
        Some(snapshot)
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub async fn get(&self, address: &str) -> Option<ParticipantBot> {
        self.table.read().await.get(&normalize_address(address)).cloned()
    }

    /// Active participants in address order.
    pub async fn active_participants(&self) -> Vec<(String, ParticipantBot)> {
        self.table
            .read()
            .await
            .iter()
            .filter(|(_, bot)| bot.active)
            .map(|(addr, bot)| (addr.clone(), bot.clone()))
            .collect()
    }

    pub async fn summary(&self) -> RegistrySummary {
        let table = self.table.read().await;
        RegistrySummary {
            known: table.len(),
            active: table
                .iter()
                .filter(|(_, bot)| bot.active)
                .map(|(addr, _)| addr.clone())
                .collect(),
        }
    }

    // -----------------------------------------------------------------------
    // Bookkeeping
    // -----------------------------------------------------------------------

    /// Append event-log lines for several participants with a single write.
    /// Unknown participants are ignored.
    pub async fn append_logs(&self, entries: Vec<(String, String)>) {
        if entries.is_empty() {
            return;
        }
        let mut table = self.table.write().await;
        for (address, message) in entries {
            if let Some(bot) = table.get_mut(&normalize_address(&address)) {
                bot.recent_log.push(message);
            }
        }
        self.persist_locked(&table);
    }

    /// Record a confirmed batch: every included participant gets its bet
    /// counter incremented, `last_wagered_round` set and the wager snapshot
    /// stored, all under one lock and one write.
    pub async fn record_wagers(&self, round_id: u64, wagers: Vec<(String, WagerSnapshot)>) {
        let mut table = self.table.write().await;
        for (address, wager) in wagers {
            let key = normalize_address(&address);
            let Some(bot) = table.get_mut(&key) else {
                warn!(participant = %key, round_id, "Wager confirmed for unknown participant");
                continue;
            };
            bot.total_bets += 1;
            bot.last_wagered_round = round_id;
            bot.open_wagers.push(OpenWager {
                round_id,
                direction: wager.direction,
            });
            bot.recent_log.push(format!(
                "Bet {} {} on round #{} (confidence {:.0}%) tx {}",
                wager.direction,
                wager.amount,
                round_id,
                wager.adjusted_confidence * 100.0,
                wager.tx_hash,
            ));
            bot.last_wager = Some(wager);
        }
        self.persist_locked(&table);
    }

    /// Count every open wager on `round_id` as a win or loss.
    /// Returns how many participants had wagers settled.
    pub async fn record_outcome(&self, round_id: u64, up_won: bool) -> usize {
        let mut table = self.table.write().await;
        let mut settled = 0;
        for bot in table.values_mut() {
            let (due, open): (Vec<OpenWager>, Vec<OpenWager>) = bot
                .open_wagers
                .iter()
                .copied()
                .partition(|w| w.round_id == round_id);
            if due.is_empty() {
                continue;
            }
            bot.open_wagers = open;

            let won = due.iter().filter(|w| w.direction.is_up() == up_won).count() as u64;
            let lost = due.len() as u64 - won;
            bot.wins += won;
            bot.losses += lost;
            if let Some(last) = bot.last_wager.as_mut().filter(|w| w.round_id == round_id) {
                last.settled = true;
            }
            bot.recent_log.push(match (won, lost) {
                (1, 0) => format!("Round #{round_id} won"),
                (0, 1) => format!("Round #{round_id} lost"),
                _ => format!("Round #{round_id}: {won} won, {lost} lost"),
            });
            settled += 1;
        }
        if settled > 0 {
            self.persist_locked(&table);
            info!(round_id, up_won, settled, "Wagers settled");
        }
        settled
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
