use std::{num::NonZeroUsize, time::Duration};

use anyhow::{Context, Result, bail, ensure};
use serde::{Deserialize, Serialize};

use crate::account::{Account, PrivateKey};

fn default_address_prefix() -> String {
    "devcore".to_string()
}

fn default_denom() -> String {
    "udevcore".to_string()
}

const fn default_transfer_amount() -> u128 {
    10
}

/// Deterministic gas charged by cored for a single-coin bank send
const fn default_gas_limit() -> u64 {
    80_000
}

fn default_gas_price() -> String {
    "0.0625".to_string()
}

fn default_report_interval() -> String {
    "10s".to_string()
}

fn default_retry_interval() -> String {
    "1s".to_string()
}

const fn default_await_inclusion() -> bool {
    true
}

fn default_inclusion_timeout() -> String {
    "60s".to_string()
}

fn default_inclusion_poll_interval() -> String {
    "500ms".to_string()
}

fn default_request_timeout() -> String {
    "30s".to_string()
}

/// Chain-level parameters used to build every transfer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_address_prefix")]
    pub address_prefix: String,
    #[serde(default = "default_denom")]
    pub denom: String,
    #[serde(default = "default_transfer_amount")]
    pub transfer_amount: u128,
    #[serde(default = "default_gas_limit")]
    pub gas_limit: u64,
    /// Decimal price per unit of gas, in `denom`
    #[serde(default = "default_gas_price")]
    pub gas_price: String,
    #[serde(default)]
    pub memo: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            address_prefix: default_address_prefix(),
            denom: default_denom(),
            transfer_amount: default_transfer_amount(),
            gas_limit: default_gas_limit(),
            gas_price: default_gas_price(),
            memo: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastConfig {
    /// Wait for each transaction to land in a block before reporting success
    #[serde(default = "default_await_inclusion")]
    pub await_inclusion: bool,
    #[serde(default = "default_inclusion_timeout")]
    pub inclusion_timeout: String,
    #[serde(default = "default_inclusion_poll_interval")]
    pub inclusion_poll_interval: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout: String,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            await_inclusion: default_await_inclusion(),
            inclusion_timeout: default_inclusion_timeout(),
            inclusion_poll_interval: default_inclusion_poll_interval(),
            request_timeout: default_request_timeout(),
        }
    }
}

/// Configuration of a single stress run, loaded from YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StressConfig {
    pub chain_id: String,
    /// REST (LCD) endpoint of the node, e.g. `http://localhost:1317`
    pub node_address: String,
    /// Hex-encoded secp256k1 private keys of funded accounts
    pub accounts: Vec<String>,
    pub transactions_per_account: usize,
    /// Size of the signing pool; defaults to the number of available cores
    pub workers: Option<usize>,
    #[serde(default = "default_report_interval")]
    pub report_interval: String,
    #[serde(default = "default_retry_interval")]
    pub retry_interval: String,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub broadcast: BroadcastConfig,
}

impl StressConfig {
    pub fn load(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {path}"))?;
        serde_yaml::from_str(&contents).context("failed to parse config YAML")
    }

    /// Rejects configurations a run cannot start with.
    pub fn validate(&self) -> Result<()> {
        ensure!(!self.chain_id.trim().is_empty(), "chain_id must not be empty");
        ensure!(!self.node_address.trim().is_empty(), "node_address must not be empty");
        self.node_address
            .parse::<url::Url>()
            .with_context(|| format!("invalid node_address: {}", self.node_address))?;
        ensure!(!self.accounts.is_empty(), "at least one account is required");
        ensure!(self.transactions_per_account > 0, "transactions_per_account must be > 0");
        if self.workers == Some(0) {
            bail!("workers must be > 0");
        }
        ensure!(self.network.gas_limit > 0, "gas_limit must be > 0");
        ensure!(self.network.transfer_amount > 0, "transfer_amount must be > 0");
        let price = self.gas_price()?;
        ensure!(price.is_finite() && price > 0.0, "gas_price must be positive");

        self.report_interval()?;
        self.retry_interval()?;
        self.inclusion_timeout()?;
        self.inclusion_poll_interval()?;
        self.request_timeout()?;
        Ok(())
    }

    pub fn worker_count(&self) -> usize {
        self.workers.unwrap_or_else(|| {
            std::thread::available_parallelism().map(NonZeroUsize::get).unwrap_or(1)
        })
    }

    pub fn gas_price(&self) -> Result<f64> {
        self.network
            .gas_price
            .trim()
            .parse::<f64>()
            .with_context(|| format!("invalid gas_price: {}", self.network.gas_price))
    }

    /// Fee paid by every transfer: `ceil(gas_limit * gas_price)`
    pub fn fee_amount(&self) -> Result<u128> {
        let price = self.gas_price()?;
        Ok((self.network.gas_limit as f64 * price).ceil() as u128)
    }

    pub fn report_interval(&self) -> Result<Duration> {
        parse_duration(&self.report_interval)
    }

    pub fn retry_interval(&self) -> Result<Duration> {
        parse_duration(&self.retry_interval)
    }

    pub fn inclusion_timeout(&self) -> Result<Duration> {
        parse_duration(&self.broadcast.inclusion_timeout)
    }

    pub fn inclusion_poll_interval(&self) -> Result<Duration> {
        parse_duration(&self.broadcast.inclusion_poll_interval)
    }

    pub fn request_timeout(&self) -> Result<Duration> {
        parse_duration(&self.broadcast.request_timeout)
    }

    pub fn private_keys(&self) -> Result<Vec<PrivateKey>> {
        self.accounts
            .iter()
            .enumerate()
            .map(|(i, key)| {
                PrivateKey::from_hex(key).with_context(|| format!("invalid private key #{i}"))
            })
            .collect()
    }

    /// Derives the bech32 account for every configured key.
    pub fn signing_accounts(&self) -> Result<Vec<Account>> {
        self.private_keys()?
            .into_iter()
            .map(|key| crate::cosmos::derive_account(key, &self.network.address_prefix))
            .collect()
    }
}

fn parse_duration(value: &str) -> Result<Duration> {
    humantime::parse_duration(value.trim()).with_context(|| format!("invalid duration: {value}"))
}
