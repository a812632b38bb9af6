use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    account::Account,
    cli::Args,
    client::ChainClient,
    config::StressConfig,
    cosmos::CosmosClient,
    preparer::{PreparerConfig, prepare_transactions},
    scheduler::run_broadcasters,
    stats::{RunStatistics, log_final_report, run_stats_reporter},
};

/// Timing knobs of a run that are not part of transaction building
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub preparer: PreparerConfig,
    pub report_interval: Duration,
    pub retry_interval: Duration,
}

impl RunSettings {
    pub fn from_config(config: &StressConfig) -> Result<Self> {
        Ok(Self {
            preparer: PreparerConfig::from_config(config)?,
            report_interval: config.report_interval()?,
            retry_interval: config.retry_interval()?,
        })
    }
}

/// Signs every transaction up front, then broadcasts all accounts in parallel.
///
/// Returns once every account's batch is on chain, any account fails, or
/// `cancel` fires.
pub async fn run_stress<C: ChainClient>(
    client: Arc<C>,
    accounts: &[Account],
    settings: &RunSettings,
    cancel: &CancellationToken,
) -> Result<()> {
    info!(
        accounts = accounts.len(),
        transactions_per_account = settings.preparer.transactions_per_account,
        "Preparing transactions"
    );
    let batches = prepare_transactions(Arc::clone(&client), accounts, &settings.preparer, cancel)
        .await
        .context("transaction preparation failed")?;

    let stats = RunStatistics::new();
    let reporter_cancel = cancel.child_token();
    let reporter = tokio::spawn(run_stats_reporter(
        Arc::clone(&stats),
        settings.report_interval,
        reporter_cancel.clone(),
    ));

    let started = Instant::now();
    let result =
        run_broadcasters(client, batches, Arc::clone(&stats), settings.retry_interval, cancel)
            .await;

    reporter_cancel.cancel();
    if let Err(e) = reporter.await {
        warn!(error = %e, "Stats reporter panicked");
    }
    log_final_report(&stats.totals(), started.elapsed());

    result.context("broadcasting failed")
}

/// Runs a stress test against the node described by `config`.
pub async fn run_stress_with_config(
    config: StressConfig,
    cancel: &CancellationToken,
) -> Result<()> {
    config.validate()?;
    let accounts = config.signing_accounts()?;
    let client = Arc::new(CosmosClient::new(&config)?);
    let settings = RunSettings::from_config(&config)?;

    info!(
        chain_id = %config.chain_id,
        node = %config.node_address,
        accounts = accounts.len(),
        workers = settings.preparer.workers,
        "Configuration loaded"
    );

    run_stress(client, &accounts, &settings, cancel).await
}

/// Main entry point: loads configuration and stops the run on Ctrl+C.
pub async fn run_stress_from_args(args: Args) -> Result<()> {
    let config = args.into_config()?;
    let cancel = CancellationToken::new();

    let ctrl_c_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl+C received, stopping");
            ctrl_c_cancel.cancel();
        }
    });

    run_stress_with_config(config, &cancel).await
}
