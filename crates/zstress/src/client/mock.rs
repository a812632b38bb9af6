//! Scriptable in-memory chain used by the pipeline tests.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;

use crate::{
    account::{Account, PrivateKey},
    client::{BankSendInput, BroadcastError, BroadcastResult, ChainClient, ChainError},
};

pub(crate) const BASE_GAS: i64 = 50_000;

/// Builds `count` accounts named `acc0`, `acc1`, ...
pub(crate) fn test_accounts(count: usize) -> Vec<Account> {
    (0..count)
        .map(|i| Account::new(format!("acc{i}"), PrivateKey::new([i as u8 + 1; 32])))
        .collect()
}

#[derive(Default)]
struct ChainState {
    /// address -> (account_number, next expected sequence)
    accounts: HashMap<String, (u64, u64)>,
    /// Every broadcast attempt in arrival order: (sender, signed sequence)
    broadcasts: Vec<(String, u64)>,
    /// Accepted transfers: (sender, receiver, sequence)
    accepted: Vec<(String, String, u64)>,
    /// (address, 1-based attempt) -> forced response
    scripted: HashMap<(String, usize), BroadcastError>,
    attempts: HashMap<String, usize>,
    blocked: HashSet<String>,
    signing_failures: HashSet<(String, u64)>,
    signing_blocked: bool,
    panicking: HashSet<String>,
    query_failures: usize,
}

/// Simulated chain that enforces per-account sequences like a real node.
#[derive(Default)]
pub(crate) struct MockChainClient {
    state: Mutex<ChainState>,
    pub(crate) sign_calls: AtomicUsize,
}

impl MockChainClient {
    pub(crate) fn with_accounts(accounts: &[Account], initial_sequences: &[u64]) -> Self {
        let client = Self::default();
        {
            let mut state = client.state.lock().unwrap();
            for (i, (account, seq)) in accounts.iter().zip(initial_sequences).enumerate() {
                state.accounts.insert(account.address.clone(), (100 + i as u64, *seq));
            }
        }
        client
    }

    /// Forces the `attempt`-th broadcast (1-based) from `address` to fail.
    /// A scripted mismatch also moves the simulated chain to the expected sequence.
    pub(crate) fn script(&self, address: &str, attempt: usize, error: BroadcastError) {
        self.state.lock().unwrap().scripted.insert((address.to_string(), attempt), error);
    }

    /// Broadcasts from `address` never complete.
    pub(crate) fn block(&self, address: &str) {
        self.state.lock().unwrap().blocked.insert(address.to_string());
    }

    pub(crate) fn fail_signing(&self, address: &str, sequence: u64) {
        self.state.lock().unwrap().signing_failures.insert((address.to_string(), sequence));
    }

    /// Signing calls never complete.
    pub(crate) fn block_signing(&self) {
        self.state.lock().unwrap().signing_blocked = true;
    }

    /// Queries and broadcasts for `address` panic.
    pub(crate) fn panic_on(&self, address: &str) {
        self.state.lock().unwrap().panicking.insert(address.to_string());
    }

    /// The next `count` sequence queries fail with a transport error.
    pub(crate) fn fail_queries(&self, count: usize) {
        self.state.lock().unwrap().query_failures = count;
    }

    /// Sequences of every broadcast attempt from `address`, in order.
    pub(crate) fn broadcasts_for(&self, address: &str) -> Vec<u64> {
        let state = self.state.lock().unwrap();
        state.broadcasts.iter().filter(|(a, _)| a == address).map(|(_, seq)| *seq).collect()
    }

    pub(crate) fn accepted(&self) -> Vec<(String, String, u64)> {
        self.state.lock().unwrap().accepted.clone()
    }

    pub(crate) fn chain_sequence(&self, address: &str) -> u64 {
        self.state.lock().unwrap().accounts[address].1
    }
}

fn encode(sender: &str, receiver: &str, sequence: u64) -> Vec<u8> {
    format!("{sender}|{receiver}|{sequence}").into_bytes()
}

pub(crate) fn decode(bytes: &[u8]) -> (String, String, u64) {
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    let mut parts = text.split('|');
    let sender = parts.next().unwrap().to_string();
    let receiver = parts.next().unwrap().to_string();
    let sequence = parts.next().unwrap().parse().unwrap();
    (sender, receiver, sequence)
}

#[async_trait]
impl ChainClient for MockChainClient {
    async fn get_number_sequence(&self, address: &str) -> Result<(u64, u64), ChainError> {
        let mut state = self.state.lock().unwrap();
        if state.panicking.contains(address) {
            drop(state);
            panic!("query for {address} panicked");
        }
        if state.query_failures > 0 {
            state.query_failures -= 1;
            return Err(ChainError::Transport("connection refused".into()));
        }
        state
            .accounts
            .get(address)
            .copied()
            .ok_or_else(|| ChainError::InvalidResponse(format!("unknown account {address}")))
    }

    async fn prepare_tx_bank_send(&self, input: BankSendInput) -> Result<Vec<u8>, ChainError> {
        self.sign_calls.fetch_add(1, Ordering::SeqCst);
        let (rejected, blocked) = {
            let state = self.state.lock().unwrap();
            let key = (input.sender.address.clone(), input.sequence);
            (state.signing_failures.contains(&key), state.signing_blocked)
        };
        if blocked {
            std::future::pending::<()>().await;
        }
        if rejected {
            return Err(ChainError::Signing("key rejected".into()));
        }
        Ok(encode(&input.sender.address, &input.receiver, input.sequence))
    }

    async fn broadcast(&self, tx_bytes: &[u8]) -> Result<BroadcastResult, BroadcastError> {
        let (sender, receiver, sequence) = decode(tx_bytes);

        let (blocked, panicking) = {
            let mut state = self.state.lock().unwrap();
            state.broadcasts.push((sender.clone(), sequence));
            (state.blocked.contains(&sender), state.panicking.contains(&sender))
        };
        if panicking {
            panic!("broadcast from {sender} panicked");
        }
        if blocked {
            std::future::pending::<()>().await;
        }

        let mut state = self.state.lock().unwrap();
        let attempt = {
            let counter = state.attempts.entry(sender.clone()).or_default();
            *counter += 1;
            *counter
        };

        if let Some(error) = state.scripted.remove(&(sender.clone(), attempt)) {
            if let BroadcastError::SequenceMismatch { expected } = error {
                if let Some(entry) = state.accounts.get_mut(&sender) {
                    entry.1 = expected;
                }
            }
            return Err(error);
        }

        let Some(entry) = state.accounts.get_mut(&sender) else {
            return Err(BroadcastError::Fatal(format!("unknown sender {sender}")));
        };
        if entry.1 != sequence {
            return Err(BroadcastError::SequenceMismatch { expected: entry.1 });
        }
        entry.1 += 1;
        state.accepted.push((sender.clone(), receiver, sequence));

        Ok(BroadcastResult {
            tx_hash: format!("{sender}-{sequence}"),
            gas_used: BASE_GAS + sequence as i64,
        })
    }
}
