use alloy_primitives::{B256, U256};
use hex::FromHex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign, Mul};
use std::str::FromStr;

pub type BlockNumber = u64;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Bytes32(pub B256);

impl Bytes32 {
    pub const ZERO: Self = Self(B256::ZERO);

    pub fn is_zero(&self) -> bool {
        self.0 == B256::ZERO
    }

    pub fn as_slice(&self) -> &[u8] {
        self.0.as_slice()
    }
}

impl From<[u8; 32]> for Bytes32 {
    fn from(bytes: [u8; 32]) -> Self {
        Bytes32(B256::from(bytes))
    }
}

impl FromStr for Bytes32 {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.strip_prefix("0x").unwrap_or(s);
        let bytes: [u8; 32] = <[u8; 32]>::from_hex(s)?;
        Ok(Bytes32::from(bytes))
    }
}

impl fmt::Display for Bytes32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0.as_slice()))
    }
}

/// Block difficulty and total (cumulative) difficulty.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlockDifficulty(pub U256);

impl BlockDifficulty {
    pub const ZERO: Self = Self(U256::ZERO);

    pub fn checked_sub(self, rhs: Self) -> Option<Self> {
        self.0.checked_sub(rhs.0).map(BlockDifficulty)
    }

    pub fn to_be_bytes(&self) -> [u8; 32] {
        self.0.to_be_bytes::<32>()
    }
}

impl From<u64> for BlockDifficulty {
    fn from(value: u64) -> Self {
        BlockDifficulty(U256::from(value))
    }
}

impl Add for BlockDifficulty {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        BlockDifficulty(self.0.saturating_add(rhs.0))
    }
}

impl AddAssign for BlockDifficulty {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl Mul<u64> for BlockDifficulty {
    type Output = Self;

    fn mul(self, rhs: u64) -> Self {
        BlockDifficulty(self.0.saturating_mul(U256::from(rhs)))
    }
}

impl Sum for BlockDifficulty {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(BlockDifficulty::ZERO, Add::add)
    }
}

impl fmt::Display for BlockDifficulty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
