//! Broadcast scheduling.
//!
//! Every account gets its own task that walks its [`PreparedBatch`] in index
//! order. Accounts never share sequence state, so the tasks only meet at the
//! shared [`RunStatistics`] counters.
//!
//! Transactions are signed up front, so a sequence mismatch cannot be fixed
//! by re-signing. Instead the cursor moves to the prepared transaction whose
//! sequence matches what the chain expects.

use std::{sync::Arc, time::Duration};

use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    client::{BroadcastError, ChainClient},
    preparer::PreparedBatch,
    stats::RunStatistics,
};

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("broadcast cancelled")]
    Cancelled,
    #[error(
        "account {account}: chain expects sequence {expected}, \
         prepared sequences start at {initial_sequence} ({prepared} transactions)"
    )]
    SequenceOutOfRange { account: usize, expected: u64, initial_sequence: u64, prepared: usize },
    #[error("account {account}: transaction {tx_index} rejected: {reason}")]
    Rejected { account: usize, tx_index: usize, reason: String },
    #[error("broadcast task failed: {0}")]
    TaskFailed(String),
}

/// Index of the prepared transaction signed with `expected`.
///
/// `Some(len)` means every prepared transaction is already on chain.
fn resync_index(initial_sequence: u64, len: usize, expected: u64) -> Option<usize> {
    let offset = usize::try_from(expected.checked_sub(initial_sequence)?).ok()?;
    (offset <= len).then_some(offset)
}

/// Broadcasts one account's batch in order until it is exhausted.
///
/// Transient failures are retried forever; only cancellation, a fatal
/// rejection or an out-of-range sequence end the loop early.
pub async fn broadcast_batch<C: ChainClient + ?Sized>(
    client: &C,
    batch: &PreparedBatch,
    stats: &RunStatistics,
    retry_interval: Duration,
    cancel: &CancellationToken,
) -> Result<(), ScheduleError> {
    let account = batch.account_index;
    let mut tx_index = 0;

    while tx_index < batch.len() {
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ScheduleError::Cancelled),
            result = client.broadcast(&batch.transactions[tx_index]) => result,
        };

        match result {
            Ok(broadcast) => {
                stats.record_success(broadcast.gas_used);
                debug!(
                    account,
                    tx_index,
                    tx_hash = %broadcast.tx_hash,
                    gas_used = broadcast.gas_used,
                    "Transaction broadcast"
                );
                tx_index += 1;
            }
            Err(BroadcastError::SequenceMismatch { expected }) => {
                let next = resync_index(batch.initial_sequence, batch.len(), expected).ok_or(
                    ScheduleError::SequenceOutOfRange {
                        account,
                        expected,
                        initial_sequence: batch.initial_sequence,
                        prepared: batch.len(),
                    },
                )?;
                stats.record_resync();
                warn!(account, tx_index, expected, next, "Account sequence mismatch, resyncing");

                if next == tx_index {
                    // chain wants the payload it just refused; back off instead of spinning
                    sleep_or_cancel(retry_interval, cancel).await?;
                }
                tx_index = next;
            }
            Err(BroadcastError::Transient(reason)) => {
                stats.record_retry();
                warn!(account, tx_index, reason = %reason, "Broadcast failed, retrying");
                sleep_or_cancel(retry_interval, cancel).await?;
            }
            Err(BroadcastError::Fatal(reason)) => {
                return Err(ScheduleError::Rejected { account, tx_index, reason });
            }
        }
    }

    debug!(account, transactions = batch.len(), "Account batch complete");
    Ok(())
}

async fn sleep_or_cancel(
    duration: Duration,
    cancel: &CancellationToken,
) -> Result<(), ScheduleError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ScheduleError::Cancelled),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}

/// Runs one broadcasting task per batch.
///
/// The first failing account cancels all others and its error is returned.
pub async fn run_broadcasters<C: ChainClient>(
    client: Arc<C>,
    batches: Vec<PreparedBatch>,
    stats: Arc<RunStatistics>,
    retry_interval: Duration,
    cancel: &CancellationToken,
) -> Result<(), ScheduleError> {
    let cancel = cancel.child_token();
    let mut tasks = JoinSet::new();

    info!(accounts = batches.len(), "Broadcasting transactions");
    for batch in batches {
        let client = Arc::clone(&client);
        let stats = Arc::clone(&stats);
        let cancel = cancel.clone();
        tasks.spawn(async move {
            broadcast_batch(&*client, &batch, &stats, retry_interval, &cancel).await
        });
    }

    let mut first_error = None;
    while let Some(joined) = tasks.join_next().await {
        let result = joined.unwrap_or_else(|e| {
            error!(error = %e, "Broadcast task panicked");
            Err(ScheduleError::TaskFailed(e.to_string()))
        });
        if let Err(e) = result {
            if first_error.is_none() {
                if !matches!(e, ScheduleError::Cancelled) {
                    error!(error = %e, "Account broadcast failed, stopping all accounts");
                }
                cancel.cancel();
                first_error = Some(e);
            }
        }
    }

    first_error.map_or(Ok(()), Err)
}
