//! In-memory mirror of the active round.
//!
//! Eventually consistent with the ledger: written by the orchestrator after
//! each transition and by the status endpoint when it notices a newer round
//! id. Never treated as authoritative for transition decisions.

use tokio::sync::RwLock;
use tracing::debug;

use crate::ledger::Ledger;
use crate::types::{cents_to_price, from_base_units, KeeperResult, RoundSnapshot};

#[derive(Default)]
pub struct RoundStateCache {
    inner: RwLock<RoundSnapshot>,
}

impl RoundStateCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn snapshot(&self) -> RoundSnapshot {
        self.inner.read().await.clone()
    }

    pub async fn round_id(&self) -> u64 {
        self.inner.read().await.round_id
    }

    pub async fn replace(&self, snapshot: RoundSnapshot) {
        *self.inner.write().await = snapshot;
    }

    /// Re-read round id, end time, strike and pools from the ledger.
    ///
    /// On failure the cache keeps its previous contents.
    pub async fn sync_from_ledger(&self, ledger: &dyn Ledger) -> KeeperResult<RoundSnapshot> {
        let (round_id, end_time, strike_cents, (up, down)) = futures::try_join!(
            ledger.current_round_id(),
            ledger.round_end_time(),
            ledger.strike_cents(),
            ledger.pools(),
        )?;

        let snapshot = RoundSnapshot {
            round_id,
            end_time,
            strike_price: cents_to_price(strike_cents),
            up_pool: from_base_units(up),
            down_pool: from_base_units(down),
        };
        debug!(%snapshot, "Round cache synced");
        self.replace(snapshot.clone()).await;
        Ok(snapshot)
    }

    /// Sync only when the ledger reports a different round than the cache.
    /// Returns whether a sync happened.
    pub async fn refresh_if_stale(&self, ledger: &dyn Ledger) -> KeeperResult<bool> {
        let on_chain = ledger.current_round_id().await?;
        if on_chain == self.round_id().await {
            return Ok(false);
        }
        self.sync_from_ledger(ledger).await?;
        Ok(true)
    }
}
