//! JSON-RPC implementation of [`Ledger`] against an EVM node.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::debug;

use super::abi::{self, views, Contract, ContractCall};
use super::tx::{LegacyTx, Wallet};
use super::{Ledger, TxRequest};
use crate::config::LedgerConfig;
use crate::types::{FeeState, KeeperError, KeeperResult, RoundInfo};

const SOURCE: &str = "ledger";

pub struct JsonRpcLedger {
    http: Client,
    rpc_url: String,
    wallet: Wallet,
    rounds: [u8; 20],
    rounds_hex: String,
    vault: [u8; 20],
    vault_hex: String,
    receipt_poll: Duration,
    writes: Mutex<()>,
}

impl JsonRpcLedger {
    pub fn new(
        config: &LedgerConfig,
        wallet: Wallet,
        rounds_address: &str,
        vault_address: &str,
    ) -> KeeperResult<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| KeeperError::Configuration(format!("HTTP client: {e}")))?;

        let rounds = abi::parse_address(rounds_address)?;
        let vault = abi::parse_address(vault_address)?;

        Ok(Self {
            http,
            rpc_url: config.rpc_url.clone(),
            wallet,
            rounds,
            rounds_hex: format!("0x{}", hex::encode(rounds)),
            vault,
            vault_hex: format!("0x{}", hex::encode(vault)),
            receipt_poll: Duration::from_millis(config.receipt_poll_ms.max(100)),
            writes: Mutex::new(()),
        })
    }

    fn address_of(&self, contract: Contract) -> (&[u8; 20], &str) {
        match contract {
            Contract::Rounds => (&self.rounds, &self.rounds_hex),
            Contract::Vault => (&self.vault, &self.vault_hex),
        }
    }

    /// Raw JSON-RPC exchange. The outer error is a transport failure; the
    /// inner one is the node's own error message.
    async fn exchange(&self, method: &str, params: Value) -> KeeperResult<Result<Value, String>> {
        let body = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": 1
        });

        let resp: Value = self
            .http
            .post(&self.rpc_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| KeeperError::read(SOURCE, format!("{method}: {e}")))?
            .json()
            .await
            .map_err(|e| KeeperError::read(SOURCE, format!("{method}: invalid response: {e}")))?;

        Ok(rpc_result(&resp))
    }

    /// Returns the `result` member; node errors are treated as failed reads.
    async fn request(&self, method: &str, params: Value) -> KeeperResult<Value> {
        self.exchange(method, params)
            .await?
            .map_err(|msg| KeeperError::read(SOURCE, format!("{method}: {msg}")))
    }

    async fn call_view(&self, contract: Contract, data: Vec<u8>) -> KeeperResult<Vec<u8>> {
        let (_, to) = self.address_of(contract);
        let result = self
            .request(
                "eth_call",
                json!([{ "to": to, "data": format!("0x{}", hex::encode(data)) }, "latest"]),
            )
            .await?;
        let hex_str = result
            .as_str()
            .ok_or_else(|| KeeperError::read(SOURCE, "eth_call result is not a string"))?;
        decode_hex_bytes(hex_str)
    }

    async fn view_uint(&self, data: Vec<u8>) -> KeeperResult<u128> {
        let out = self.call_view(Contract::Rounds, data).await?;
        abi::decode_uint(&out, 0)
    }

    async fn view_u64(&self, data: Vec<u8>) -> KeeperResult<u64> {
        let out = self.call_view(Contract::Rounds, data).await?;
        abi::decode_u64(&out, 0)
    }
}

#[async_trait]
impl Ledger for JsonRpcLedger {
    fn operator_address(&self) -> &str {
        self.wallet.address()
    }

    fn write_lock(&self) -> &Mutex<()> {
        &self.writes
    }

    async fn current_round_id(&self) -> KeeperResult<u64> {
        self.view_u64(views::current_round_id()).await
    }

    async fn round_end_time(&self) -> KeeperResult<u64> {
        self.view_u64(views::round_end_time()).await
    }

    async fn strike_cents(&self) -> KeeperResult<u64> {
        self.view_u64(views::strike_price()).await
    }

    async fn pools(&self) -> KeeperResult<(u128, u128)> {
        futures::try_join!(
            self.view_uint(views::up_pool()),
            self.view_uint(views::down_pool())
        )
    }

    async fn round_info(&self, round_id: u64) -> KeeperResult<RoundInfo> {
        let out = self
            .call_view(Contract::Rounds, views::round_info(round_id))
            .await?;
        abi::decode_round_info(&out)
    }

    async fn vault_balance(&self, participant: &str) -> KeeperResult<u128> {
        let out = self
            .call_view(Contract::Vault, views::vault_balance(participant)?)
            .await?;
        abi::decode_uint(&out, 0)
    }

    async fn fee_state(&self) -> KeeperResult<FeeState> {
        let (seconds_until_due, accrued) = futures::try_join!(
            self.view_u64(views::time_until_next_fee()),
            self.view_uint(views::accrued_fees())
        )?;
        Ok(FeeState {
            seconds_until_due,
            accrued,
        })
    }

    async fn pending_nonce(&self) -> KeeperResult<u64> {
        let result = self
            .request(
                "eth_getTransactionCount",
                json!([self.wallet.address(), "pending"]),
            )
            .await?;
        parse_hex_u64(&result)
    }

    async fn gas_price(&self) -> KeeperResult<u64> {
        let result = self.request("eth_gasPrice", json!([])).await?;
        parse_hex_u64(&result)
    }

    async fn send_transaction(&self, request: &TxRequest) -> KeeperResult<String> {
        let (to, _) = self.address_of(request.call.target());
        let tx = LegacyTx {
            nonce: request.nonce,
            gas_price: request.gas_price,
            gas_limit: request.gas_limit,
            to: *to,
            data: request.call.encode()?,
        };
        let raw = self.wallet.sign(&tx)?;

        let result = self
            .exchange(
                "eth_sendRawTransaction",
                json!([format!("0x{}", hex::encode(raw))]),
            )
            .await?
            .map_err(|reason| KeeperError::TransactionRejected {
                call: request.call.name().to_string(),
                reason,
            })?;
        result
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| KeeperError::read(SOURCE, "no transaction hash in response"))
    }

    async fn wait_for_receipt(&self, tx_hash: &str, timeout: Duration) -> KeeperResult<bool> {
        let start = Instant::now();
        loop {
            if start.elapsed() > timeout {
                return Err(KeeperError::TransactionTimeout {
                    tx_hash: tx_hash.to_string(),
                    timeout_secs: timeout.as_secs(),
                });
            }

            match self.request("eth_getTransactionReceipt", json!([tx_hash])).await {
                Ok(receipt) if !receipt.is_null() => {
                    let status = receipt
                        .get("status")
                        .and_then(|s| s.as_str())
                        .unwrap_or("0x0");
                    return Ok(status == "0x1");
                }
                Ok(_) => {}
                // A dropped poll is not a verdict on the transaction
                Err(e) => debug!(tx_hash, error = %e, "Receipt poll failed"),
            }

            tokio::time::sleep(self.receipt_poll).await;
        }
    }

    async fn revert_reason(&self, call: &ContractCall) -> KeeperResult<Option<String>> {
        let (_, to) = self.address_of(call.target());
        let params = json!([{
            "from": self.wallet.address(),
            "to": to,
            "data": format!("0x{}", hex::encode(call.encode()?)),
        }, "latest"]);
        match self.request("eth_call", params).await {
            Ok(_) => Ok(None),
            Err(KeeperError::TransientRead { message, .. }) => Ok(Some(message)),
            Err(e) => Err(e),
        }
    }
}

/// Split a JSON-RPC response into its result or the node's error message.
fn rpc_result(resp: &Value) -> Result<Value, String> {
    if let Some(error) = resp.get("error") {
        let msg = error
            .get("message")
            .and_then(|m| m.as_str())
            .unwrap_or("unknown error");
        return Err(msg.to_string());
    }
    resp.get("result")
        .cloned()
        .ok_or_else(|| "no result in response".to_string())
}

fn decode_hex_bytes(hex_str: &str) -> KeeperResult<Vec<u8>> {
    let stripped = hex_str.strip_prefix("0x").unwrap_or(hex_str);
    hex::decode(stripped).map_err(|e| KeeperError::read(SOURCE, format!("invalid hex: {e}")))
}

fn parse_hex_u64(value: &Value) -> KeeperResult<u64> {
    let hex_str = value
        .as_str()
        .ok_or_else(|| KeeperError::read(SOURCE, "expected hex string result"))?;
    let stripped = hex_str.strip_prefix("0x").unwrap_or(hex_str);
    u64::from_str_radix(stripped, 16)
        .map_err(|e| KeeperError::read(SOURCE, format!("failed to parse hex '{hex_str}': {e}")))
}
