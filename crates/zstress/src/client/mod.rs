//! Chain client seam.
//!
//! The stress pipeline only needs three capabilities from a node: reading an
//! account's number and sequence, signing a bank transfer, and broadcasting
//! signed bytes. [`ChainClient`] captures exactly that, so the pipeline can be
//! driven by the REST client in [`crate::cosmos`] or by a scripted mock.

#[cfg(test)]
pub(crate) mod mock;

use async_trait::async_trait;
use thiserror::Error;

use crate::account::Account;

/// A token amount in a single denomination
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Coin {
    pub denom: String,
    pub amount: u128,
}

impl Coin {
    pub fn new(denom: impl Into<String>, amount: u128) -> Self {
        Self { denom: denom.into(), amount }
    }
}

/// Everything needed to sign one bank transfer
#[derive(Debug, Clone)]
pub struct BankSendInput {
    pub sender: Account,
    pub account_number: u64,
    pub sequence: u64,
    pub receiver: String,
    pub amount: Coin,
    pub gas_limit: u64,
    pub fee: Coin,
    pub memo: String,
}

/// Outcome of an accepted broadcast
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastResult {
    pub tx_hash: String,
    pub gas_used: i64,
}

/// Why a broadcast did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BroadcastError {
    /// The chain expects a different sequence for the sender
    #[error("account sequence mismatch, expected {expected}")]
    SequenceMismatch { expected: u64 },
    /// Worth retrying with the same payload
    #[error("transient broadcast failure: {0}")]
    Transient(String),
    /// Retrying cannot help
    #[error("broadcast rejected: {0}")]
    Fatal(String),
}

/// Errors from account queries and signing.
#[derive(Debug, Error)]
pub enum ChainError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("signing failed: {0}")]
    Signing(String),
}

impl ChainError {
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

/// Minimal node surface used by the stress pipeline.
///
/// Implementations must be cancel-safe: callers drop in-flight futures when
/// the run is cancelled.
#[async_trait]
pub trait ChainClient: Send + Sync + 'static {
    /// Returns `(account_number, sequence)` for `address`.
    async fn get_number_sequence(&self, address: &str) -> Result<(u64, u64), ChainError>;

    /// Signs a transfer and returns the encoded transaction bytes.
    async fn prepare_tx_bank_send(&self, input: BankSendInput) -> Result<Vec<u8>, ChainError>;

    async fn broadcast(&self, tx_bytes: &[u8]) -> Result<BroadcastResult, BroadcastError>;
}
