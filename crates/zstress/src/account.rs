use std::fmt;

use anyhow::{Context, Result, ensure};

/// Raw 32-byte secp256k1 secret key
#[derive(Clone, PartialEq, Eq)]
pub struct PrivateKey([u8; 32]);

impl PrivateKey {
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Parses a private key from hex string (with or without 0x prefix)
    pub fn from_hex(hex_key: &str) -> Result<Self> {
        let key = hex_key.trim();
        let key = key.strip_prefix("0x").unwrap_or(key);
        let bytes = hex::decode(key).context("private key is not valid hex")?;
        ensure!(bytes.len() == 32, "private key must be 32 bytes, got {}", bytes.len());
        let mut out = [0u8; 32];
        out.copy_from_slice(&bytes);
        Ok(Self(out))
    }

    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PrivateKey(<redacted>)")
    }
}

/// A funded identity that signs transfers during a run.
#[derive(Debug, Clone)]
pub struct Account {
    pub address: String,
    pub key: PrivateKey,
}

impl Account {
    pub const fn new(address: String, key: PrivateKey) -> Self {
        Self { address, key }
    }
}

/// Chain-side numbers of an account, fetched once before preparation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccountState {
    /// Never changes once the account exists on chain
    pub account_number: u64,
    /// Sequence the chain expects for the account's next transaction
    pub initial_sequence: u64,
}

/// Account `i` pays account `(i + 1) % count`, so every account both sends and receives.
pub const fn receiver_index(sender: usize, count: usize) -> usize {
    (sender + 1) % count
}
