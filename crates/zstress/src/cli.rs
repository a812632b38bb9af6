use anyhow::Result;
use clap::Parser;

use crate::config::StressConfig;

#[derive(Debug, Parser)]
#[command(name = "zstress")]
#[command(
    about = "cored load tester - signs transfers for every funded account up front, \
             then broadcasts them in parallel"
)]
pub struct Args {
    /// Path to the YAML run configuration
    #[arg(long, env = "ZSTRESS_CONFIG")]
    pub config: String,

    // ========== Overrides ==========

    /// Chain ID (overrides config)
    #[arg(long)]
    pub chain_id: Option<String>,

    /// Node REST endpoint (overrides config)
    #[arg(long)]
    pub node_address: Option<String>,

    /// Transactions per account (overrides config)
    #[arg(long)]
    pub transactions: Option<usize>,

    /// Signing workers; defaults to the number of cores
    #[arg(long)]
    pub workers: Option<usize>,

    /// Statistics reporting interval, e.g. "10s" (overrides config)
    #[arg(long)]
    pub report_interval: Option<String>,
}

impl Args {
    /// Loads the config file, applies command line overrides and validates the result.
    pub fn into_config(self) -> Result<StressConfig> {
        let mut config = StressConfig::load(&self.config)?;
        self.apply_overrides(&mut config);
        config.validate()?;
        Ok(config)
    }

    fn apply_overrides(self, config: &mut StressConfig) {
        if let Some(chain_id) = self.chain_id {
            config.chain_id = chain_id;
        }
        if let Some(node_address) = self.node_address {
            config.node_address = node_address;
        }
        if let Some(transactions) = self.transactions {
            config.transactions_per_account = transactions;
        }
        if self.workers.is_some() {
            config.workers = self.workers;
        }
        if let Some(interval) = self.report_interval {
            config.report_interval = interval;
        }
    }
}
