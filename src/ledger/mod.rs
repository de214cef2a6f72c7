//! Ledger abstraction.
//!
//! Every on-chain read and write the keeper performs goes through the
//! [`Ledger`] trait. The production implementation speaks JSON-RPC to an
//! EVM node ([`rpc::JsonRpcLedger`]); tests substitute an in-memory
//! contract simulation.

pub mod abi;
pub mod rpc;
pub mod tx;

use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::types::{FeeState, KeeperError, KeeperResult, RoundInfo};

pub use abi::{Contract, ContractCall};

/// A state-changing call with its explicit ordering number and gas terms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxRequest {
    pub call: ContractCall,
    pub nonce: u64,
    pub gas_limit: u64,
    pub gas_price: u64,
}

/// Reads and writes against the round contract and its custody vault.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Address that signs keeper transactions.
    fn operator_address(&self) -> &str;

    /// Held from the nonce read until the write is confirmed, so every
    /// caller sharing this handle gets its own ordering number.
    fn write_lock(&self) -> &Mutex<()>;

    async fn current_round_id(&self) -> KeeperResult<u64>;

    async fn round_end_time(&self) -> KeeperResult<u64>;

    /// Strike of the current round in fixed-point cents.
    async fn strike_cents(&self) -> KeeperResult<u64>;

    /// `(up_pool, down_pool)` in base units.
    async fn pools(&self) -> KeeperResult<(u128, u128)>;

    async fn round_info(&self, round_id: u64) -> KeeperResult<RoundInfo>;

    /// Custodial balance of `participant` in base units.
    async fn vault_balance(&self, participant: &str) -> KeeperResult<u128>;

    async fn fee_state(&self) -> KeeperResult<FeeState>;

    /// Next ordering number for the operator, counting pending transactions.
    async fn pending_nonce(&self) -> KeeperResult<u64>;

    async fn gas_price(&self) -> KeeperResult<u64>;

    /// Sign and broadcast; returns the transaction hash.
    async fn send_transaction(&self, request: &TxRequest) -> KeeperResult<String>;

    /// Wait for the receipt. `Ok(true)` on success status, `Ok(false)` on
    /// revert, `TransactionTimeout` if no receipt arrives in time.
    async fn wait_for_receipt(&self, tx_hash: &str, timeout: Duration) -> KeeperResult<bool>;

    /// Replay `call` as a static call to recover a revert reason.
    async fn revert_reason(&self, call: &ContractCall) -> KeeperResult<Option<String>>;
}

/// Submit `request` and wait for confirmation.
///
/// A reverted receipt becomes `TransactionReverted`, with the cause looked
/// up by static-call replay when the node provides one.
pub async fn submit_and_confirm(
    ledger: &dyn Ledger,
    request: &TxRequest,
    timeout: Duration,
) -> KeeperResult<String> {
    let name = request.call.name();
    let tx_hash = ledger.send_transaction(request).await?;
    info!(
        call = name,
        nonce = request.nonce,
        gas_limit = request.gas_limit,
        tx_hash = %tx_hash,
        "Transaction submitted"
    );

    if ledger.wait_for_receipt(&tx_hash, timeout).await? {
        info!(call = name, tx_hash = %tx_hash, "Transaction confirmed");
        return Ok(tx_hash);
    }

    let reason = match ledger.revert_reason(&request.call).await {
        Ok(Some(reason)) => reason,
        Ok(None) => "no reason given".to_string(),
        Err(e) => {
            warn!(call = name, error = %e, "Revert reason lookup failed");
            "unknown".to_string()
        }
    };
    Err(KeeperError::TransactionReverted { tx_hash, reason })
}
