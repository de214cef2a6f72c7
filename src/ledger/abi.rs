//! Calldata encoding and return-data decoding for the round and vault
//! contracts.
//!
//! Only the handful of ABI shapes the contracts use are supported: static
//! `uint256`/`address`/`bool` words, a trailing `string`, and dynamic
//! `address[]`/`uint256[]` arrays.

use sha3::{Digest, Keccak256};

use crate::types::{KeeperError, KeeperResult, RoundInfo};

const WORD: usize = 32;

/// Which deployed contract a call targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Contract {
    Rounds,
    Vault,
}

/// A state-changing call the keeper may submit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContractCall {
    StartFirstRound { strike_cents: u64 },
    StartNewRound { strike_cents: u64 },
    ResolveRound { closing_cents: u64, proof: String },
    DistributeFee,
    PlaceBetBatch {
        participants: Vec<String>,
        amounts: Vec<u128>,
        is_up: bool,
    },
}

impl ContractCall {
    pub fn name(&self) -> &'static str {
        match self {
            ContractCall::StartFirstRound { .. } => "startFirstRound",
            ContractCall::StartNewRound { .. } => "startNewRound",
            ContractCall::ResolveRound { .. } => "resolveRound",
            ContractCall::DistributeFee => "distributeDevFee",
            ContractCall::PlaceBetBatch { .. } => "placeBetBatch",
        }
    }

    pub fn target(&self) -> Contract {
        match self {
            ContractCall::PlaceBetBatch { .. } => Contract::Vault,
            _ => Contract::Rounds,
        }
    }

    /// ABI-encode the call (selector + arguments).
    pub fn encode(&self) -> KeeperResult<Vec<u8>> {
        let data = match self {
            ContractCall::StartFirstRound { strike_cents } => {
                let mut data = selector("startFirstRound(uint256)").to_vec();
                data.extend_from_slice(&uint_word(*strike_cents as u128));
                data
            }
            ContractCall::StartNewRound { strike_cents } => {
                let mut data = selector("startNewRound(uint256)").to_vec();
                data.extend_from_slice(&uint_word(*strike_cents as u128));
                data
            }
            ContractCall::ResolveRound {
                closing_cents,
                proof,
            } => {
                let mut data = selector("resolveRound(uint256,string)").to_vec();
                data.extend_from_slice(&uint_word(*closing_cents as u128));
                // offset of the string tail: two head words
                data.extend_from_slice(&uint_word((2 * WORD) as u128));
                data.extend_from_slice(&encode_bytes_tail(proof.as_bytes()));
                data
            }
            ContractCall::DistributeFee => selector("distributeDevFee()").to_vec(),
            ContractCall::PlaceBetBatch {
                participants,
                amounts,
                is_up,
            } => {
                if participants.len() != amounts.len() {
                    return Err(KeeperError::Configuration(format!(
                        "batch arrays differ in length: {} addresses, {} amounts",
                        participants.len(),
                        amounts.len()
                    )));
                }
                let addresses = participants
                    .iter()
                    .map(|a| parse_address(a))
                    .collect::<KeeperResult<Vec<_>>>()?;

                let mut data = selector("placeBetBatch(address[],uint256[],bool)").to_vec();
                let head_len = 3 * WORD;
                let first_tail_len = WORD * (1 + addresses.len());
                data.extend_from_slice(&uint_word(head_len as u128));
                data.extend_from_slice(&uint_word((head_len + first_tail_len) as u128));
                data.extend_from_slice(&bool_word(*is_up));

                data.extend_from_slice(&uint_word(addresses.len() as u128));
                for address in &addresses {
                    data.extend_from_slice(&address_word(address));
                }
                data.extend_from_slice(&uint_word(amounts.len() as u128));
                for amount in amounts {
                    data.extend_from_slice(&uint_word(*amount));
                }
                data
            }
        };
        Ok(data)
    }
}

/// Read-only calls.
pub mod views {
    use super::*;

    pub fn current_round_id() -> Vec<u8> {
        selector("currentRoundId()").to_vec()
    }

    pub fn round_end_time() -> Vec<u8> {
        selector("roundEndTime()").to_vec()
    }

    pub fn strike_price() -> Vec<u8> {
        selector("getStrikePrice()").to_vec()
    }

    pub fn up_pool() -> Vec<u8> {
        selector("getUpPool()").to_vec()
    }

    pub fn down_pool() -> Vec<u8> {
        selector("getDownPool()").to_vec()
    }

    pub fn accrued_fees() -> Vec<u8> {
        selector("accruedFees()").to_vec()
    }

    pub fn time_until_next_fee() -> Vec<u8> {
        selector("timeUntilNextDevFee()").to_vec()
    }

    pub fn round_info(round_id: u64) -> Vec<u8> {
        let mut data = selector("getRoundInfo(uint256)").to_vec();
        data.extend_from_slice(&uint_word(round_id as u128));
        data
    }

    pub fn vault_balance(participant: &str) -> KeeperResult<Vec<u8>> {
        let mut data = selector("getBalance(address)").to_vec();
        data.extend_from_slice(&address_word(&parse_address(participant)?));
        Ok(data)
    }
}

// ---------------------------------------------------------------------------
// Encoding helpers
// ---------------------------------------------------------------------------

/// First four bytes of keccak256 of the canonical signature.
pub fn selector(signature: &str) -> [u8; 4] {
    let hash = Keccak256::digest(signature.as_bytes());
    [hash[0], hash[1], hash[2], hash[3]]
}

fn uint_word(value: u128) -> [u8; WORD] {
    let mut word = [0u8; WORD];
    word[16..].copy_from_slice(&value.to_be_bytes());
    word
}

fn bool_word(value: bool) -> [u8; WORD] {
    uint_word(value as u128)
}

fn address_word(address: &[u8; 20]) -> [u8; WORD] {
    let mut word = [0u8; WORD];
    word[12..].copy_from_slice(address);
    word
}

/// Length word followed by the bytes, right-padded to a word boundary.
fn encode_bytes_tail(bytes: &[u8]) -> Vec<u8> {
    let padded = bytes.len().div_ceil(WORD) * WORD;
    let mut out = Vec::with_capacity(WORD + padded);
    out.extend_from_slice(&uint_word(bytes.len() as u128));
    out.extend_from_slice(bytes);
    out.resize(WORD + padded, 0);
    out
}

/// Parses a hex address string to 20 bytes.
pub fn parse_address(address: &str) -> KeeperResult<[u8; 20]> {
    let stripped = address.strip_prefix("0x").unwrap_or(address);
    let bytes = hex::decode(stripped)
        .map_err(|e| KeeperError::Configuration(format!("invalid address '{address}': {e}")))?;
    if bytes.len() != 20 {
        return Err(KeeperError::Configuration(format!(
            "address '{address}' is {} bytes, expected 20",
            bytes.len()
        )));
    }
    let mut out = [0u8; 20];
    out.copy_from_slice(&bytes);
    Ok(out)
}

// ---------------------------------------------------------------------------
// Decoding helpers
// ---------------------------------------------------------------------------

fn word_at(data: &[u8], index: usize) -> KeeperResult<&[u8]> {
    let start = index * WORD;
    data.get(start..start + WORD).ok_or_else(|| {
        KeeperError::read(
            "abi",
            format!("return data too short: {} bytes, need word {index}", data.len()),
        )
    })
}

fn word_to_u128(word: &[u8]) -> KeeperResult<u128> {
    if word[..16].iter().any(|&b| b != 0) {
        return Err(KeeperError::read("abi", "uint256 value overflows u128"));
    }
    let mut buf = [0u8; 16];
    buf.copy_from_slice(&word[16..]);
    Ok(u128::from_be_bytes(buf))
}

/// Decode word `index` as an unsigned integer.
pub fn decode_uint(data: &[u8], index: usize) -> KeeperResult<u128> {
    word_to_u128(word_at(data, index)?)
}

pub fn decode_u64(data: &[u8], index: usize) -> KeeperResult<u64> {
    u64::try_from(decode_uint(data, index)?)
        .map_err(|_| KeeperError::read("abi", "value overflows u64"))
}

pub fn decode_bool(data: &[u8], index: usize) -> KeeperResult<bool> {
    Ok(decode_uint(data, index)? != 0)
}

/// Decode the `getRoundInfo` return value.
///
/// The tuple contains a trailing `string`, so it is returned behind an
/// offset word; the static fields follow that offset in declaration order.
pub fn decode_round_info(data: &[u8]) -> KeeperResult<RoundInfo> {
    let offset = decode_uint(data, 0)? as usize;
    if offset % WORD != 0 {
        return Err(KeeperError::read("abi", "misaligned tuple offset"));
    }
    let tuple = data
        .get(offset..)
        .ok_or_else(|| KeeperError::read("abi", "tuple offset out of range"))?;

    Ok(RoundInfo {
        start_time: decode_u64(tuple, 0)?,
        end_time: decode_u64(tuple, 1)?,
        strike_cents: decode_u64(tuple, 2)?,
        closing_cents: decode_u64(tuple, 3)?,
        up_pool: decode_uint(tuple, 4)?,
        down_pool: decode_uint(tuple, 5)?,
        // 6 totalPool, 7 upShares, 8 downShares
        total_bets: decode_u64(tuple, 9)?,
        resolved: decode_bool(tuple, 10)?,
        up_won: decode_bool(tuple, 11)?,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
