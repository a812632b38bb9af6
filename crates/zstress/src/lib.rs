//! zstress: load generator for cored networks.
//!
//! A run signs `accounts x transactions` bank transfers up front on a worker
//! pool, then broadcasts each account's batch in sequence order while a
//! reporter logs throughput and gas usage.

mod account;
mod cli;
mod client;
mod config;
mod cosmos;
mod preparer;
mod runner;
mod scheduler;
mod stats;

pub use account::{Account, AccountState, PrivateKey, receiver_index};
pub use cli::Args;
pub use client::{BankSendInput, BroadcastError, BroadcastResult, ChainClient, ChainError, Coin};
pub use config::{BroadcastConfig, NetworkConfig, StressConfig};
pub use cosmos::{CosmosClient, derive_account};
pub use preparer::{
    PrepareError, PreparedBatch, PreparerConfig, TransactionRequest, prepare_transactions,
};
pub use runner::{RunSettings, run_stress, run_stress_from_args, run_stress_with_config};
pub use scheduler::{ScheduleError, broadcast_batch, run_broadcasters};
pub use stats::{PeriodSnapshot, RunStatistics, RunTotals, run_stats_reporter};
