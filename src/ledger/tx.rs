//! Operator wallet and legacy (type 0) transaction signing with EIP-155
//! replay protection.

use k256::ecdsa::SigningKey;
use secrecy::{ExposeSecret, SecretString};
use sha3::{Digest, Keccak256};

use crate::types::{KeeperError, KeeperResult};

const PRIVATE_KEY_HEX_LEN: usize = 64;

// ---------------------------------------------------------------------------
// RLP encoding
// ---------------------------------------------------------------------------

fn rlp_bytes(data: &[u8]) -> Vec<u8> {
    if data.len() == 1 && data[0] < 0x80 {
        vec![data[0]]
    } else if data.len() <= 55 {
        let mut out = Vec::with_capacity(1 + data.len());
        out.push(0x80 + data.len() as u8);
        out.extend_from_slice(data);
        out
    } else {
        let len_bytes = minimal_be(data.len() as u128);
        let mut out = Vec::with_capacity(1 + len_bytes.len() + data.len());
        out.push(0xb7 + len_bytes.len() as u8);
        out.extend_from_slice(&len_bytes);
        out.extend_from_slice(data);
        out
    }
}

fn rlp_uint(value: u128) -> Vec<u8> {
    rlp_bytes(&minimal_be(value))
}

fn rlp_list(items: &[Vec<u8>]) -> Vec<u8> {
    let payload: Vec<u8> = items.iter().flatten().copied().collect();
    let mut out = Vec::with_capacity(payload.len() + 9);
    if payload.len() <= 55 {
        out.push(0xc0 + payload.len() as u8);
    } else {
        let len_bytes = minimal_be(payload.len() as u128);
        out.push(0xf7 + len_bytes.len() as u8);
        out.extend_from_slice(&len_bytes);
    }
    out.extend_from_slice(&payload);
    out
}

/// Big-endian bytes without leading zeros (empty for zero).
fn minimal_be(value: u128) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let start = bytes.iter().position(|&b| b != 0).unwrap_or(bytes.len());
    bytes[start..].to_vec()
}

fn strip_leading_zeros(data: &[u8]) -> &[u8] {
    let start = data.iter().position(|&b| b != 0).unwrap_or(data.len());
    &data[start..]
}

// ---------------------------------------------------------------------------
// Transactions
// ---------------------------------------------------------------------------

/// An unsigned legacy transaction with no value transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyTx {
    pub nonce: u64,
    pub gas_price: u64,
    pub gas_limit: u64,
    pub to: [u8; 20],
    pub data: Vec<u8>,
}

impl LegacyTx {
    fn fields(&self) -> Vec<Vec<u8>> {
        vec![
            rlp_uint(self.nonce as u128),
            rlp_uint(self.gas_price as u128),
            rlp_uint(self.gas_limit as u128),
            rlp_bytes(&self.to),
            rlp_uint(0),
            rlp_bytes(&self.data),
        ]
    }

    /// Keccak hash of the EIP-155 signing payload.
    pub fn signing_hash(&self, chain_id: u64) -> [u8; 32] {
        let mut items = self.fields();
        items.push(rlp_uint(chain_id as u128));
        items.push(rlp_uint(0));
        items.push(rlp_uint(0));
        let digest = Keccak256::digest(rlp_list(&items));
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&digest);
        hash
    }
}

// ---------------------------------------------------------------------------
// Wallet
// ---------------------------------------------------------------------------

/// The operator's signing identity. The key never appears in `Debug` output.
pub struct Wallet {
    private_key: SecretString,
    address: String,
    chain_id: u64,
}

impl Wallet {
    /// Load the key from `env_var`.
    pub fn from_env(env_var: &str, chain_id: u64) -> KeeperResult<Self> {
        let raw = std::env::var(env_var)
            .map_err(|_| KeeperError::Configuration(format!("{env_var} is not set")))?;
        Self::from_private_key(raw.trim(), chain_id)
    }

    pub fn from_private_key(private_key: &str, chain_id: u64) -> KeeperResult<Self> {
        let key_hex = private_key.strip_prefix("0x").unwrap_or(private_key);
        if key_hex.len() != PRIVATE_KEY_HEX_LEN || !key_hex.chars().all(|c| c.is_ascii_hexdigit())
        {
            return Err(KeeperError::Configuration(format!(
                "signing key must be {PRIVATE_KEY_HEX_LEN} hex characters"
            )));
        }
        let signing_key = parse_key(key_hex)?;
        let address = derive_address(&signing_key);
        Ok(Self {
            private_key: SecretString::new(key_hex.to_string()),
            address,
            chain_id,
        })
    }

    /// EIP-55 checksummed address.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Sign `tx` and return the raw RLP bytes ready for broadcast.
    pub fn sign(&self, tx: &LegacyTx) -> KeeperResult<Vec<u8>> {
        let signing_key = parse_key(self.private_key.expose_secret())?;
        let hash = tx.signing_hash(self.chain_id);
        let (signature, recovery_id) = signing_key
            .sign_prehash_recoverable(&hash)
            .map_err(|e| KeeperError::Configuration(format!("signing failed: {e}")))?;

        let v = self.chain_id as u128 * 2 + 35 + recovery_id.to_byte() as u128;
        let r = signature.r().to_bytes();
        let s = signature.s().to_bytes();

        let mut items = tx.fields();
        items.push(rlp_uint(v));
        items.push(rlp_bytes(strip_leading_zeros(r.as_slice())));
        items.push(rlp_bytes(strip_leading_zeros(s.as_slice())));
        Ok(rlp_list(&items))
    }
}

impl std::fmt::Debug for Wallet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wallet")
            .field("address", &self.address)
            .field("chain_id", &self.chain_id)
            .field("private_key", &"[REDACTED]")
            .finish()
    }
}

fn parse_key(key_hex: &str) -> KeeperResult<SigningKey> {
    let bytes = hex::decode(key_hex)
        .map_err(|e| KeeperError::Configuration(format!("invalid signing key: {e}")))?;
    SigningKey::from_slice(&bytes)
        .map_err(|e| KeeperError::Configuration(format!("invalid signing key: {e}")))
}

fn derive_address(signing_key: &SigningKey) -> String {
    let point = signing_key.verifying_key().to_encoded_point(false);
    let hash = Keccak256::digest(&point.as_bytes()[1..]);
    let mut address = [0u8; 20];
    address.copy_from_slice(&hash[12..]);
    eip55_checksum(&address)
}

/// Mixed-case checksum encoding of a 20-byte address.
pub fn eip55_checksum(address: &[u8; 20]) -> String {
    let lower = hex::encode(address);
    let hash = Keccak256::digest(lower.as_bytes());

    let mut out = String::with_capacity(42);
    out.push_str("0x");
    for (i, c) in lower.chars().enumerate() {
        let nibble = if i % 2 == 0 {
            hash[i / 2] >> 4
        } else {
            hash[i / 2] & 0x0f
        };
        out.push(if nibble >= 8 { c.to_ascii_uppercase() } else { c });
    }
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
