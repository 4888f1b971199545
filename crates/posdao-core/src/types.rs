// PRIMITIVE LEDGER TYPES
// Addresses, block hashes and the per-block context handed in by the consensus driver.
//
// SAFETY INVARIANTS:
// 1. Addresses are fixed 20-byte identifiers; the zero address is never a valid actor
// 2. Block hashes are fixed 32-byte digests compared byte-for-byte
// 3. Time only enters the engine through a BlockContext (no wall clock reads)

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Native coin amount in the smallest unit.
pub type Amount = u128;

/// Unix timestamp in seconds.
pub type Timestamp = u64;

/// Staking epoch counter.
pub type EpochNumber = u64;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TypeParseError {
    #[error("invalid hex: {0}")]
    InvalidHex(String),
    #[error("expected {expected} bytes, got {got}")]
    InvalidLength { expected: usize, got: usize },
}

/// 20-byte account identifier used for staking, mining and system addresses.
/// Human-readable formats (JSON config) carry it as a `0x` hex string.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address(pub [u8; 20]);

impl Address {
    pub const ZERO: Address = Address([0u8; 20]);

    /// Build an address whose low 8 bytes hold `value` (big-endian).
    /// Handy for genesis fixtures and tests.
    pub fn from_low_u64(value: u64) -> Self {
        let mut bytes = [0u8; 20];
        bytes[12..].copy_from_slice(&value.to_be_bytes());
        Address(bytes)
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 20]
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl FromStr for Address {
    type Err = TypeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(raw).map_err(|e| TypeParseError::InvalidHex(e.to_string()))?;
        if bytes.len() != 20 {
            return Err(TypeParseError::InvalidLength { expected: 20, got: bytes.len() });
        }
        let mut out = [0u8; 20];
        out.copy_from_slice(&bytes);
        Ok(Address(out))
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.serialize_str(&self.to_string())
        } else {
            self.0.serialize(serializer)
        }
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        if deserializer.is_human_readable() {
            let text = String::deserialize(deserializer)?;
            text.parse().map_err(serde::de::Error::custom)
        } else {
            <[u8; 20]>::deserialize(deserializer).map(Address)
        }
    }
}

/// Fixed address the consensus driver signs system calls with.
pub const SYSTEM_ADDRESS: Address = Address([
    0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
    0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xfe,
]);

/// Component identities. Cross-component calls are authorized against these,
/// the same way one system contract checks `msg.sender` of another.
pub mod component {
    use super::Address;

    const fn system_component(tag: u8) -> Address {
        let mut bytes = [0u8; 20];
        bytes[0] = 0x10;
        bytes[19] = tag;
        Address(bytes)
    }

    pub const STAKING: Address = system_component(0x01);
    pub const VALIDATOR_SET: Address = system_component(0x02);
    pub const BLOCK_REWARD: Address = system_component(0x03);
    pub const CONNECTIVITY_TRACKER: Address = system_component(0x04);
    pub const BONUS_SCORE: Address = system_component(0x05);
}

/// 32-byte block hash.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockHash(pub [u8; 32]);

impl BlockHash {
    /// SHA-256 of arbitrary bytes. Used for fixtures and seed derivation.
    pub fn digest(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        BlockHash(hasher.finalize().into())
    }

    /// Deterministic fake hash for a block number (test chains, genesis).
    pub fn for_number(number: u64) -> Self {
        Self::digest(&number.to_be_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// What the consensus driver knows about the block being produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockContext {
    pub number: u64,
    pub timestamp: Timestamp,
    pub hash: BlockHash,
}

impl BlockContext {
    pub fn new(number: u64, timestamp: Timestamp, hash: BlockHash) -> Self {
        BlockContext { number, timestamp, hash }
    }

    /// Context with a deterministic hash derived from the block number.
    pub fn synthetic(number: u64, timestamp: Timestamp) -> Self {
        BlockContext { number, timestamp, hash: BlockHash::for_number(number) }
    }
}
