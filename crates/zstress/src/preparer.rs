//! Transaction preparation: fetches each account's chain state, then signs
//! `accounts x transactions` transfers on a pool of workers.

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use thiserror::Error;
use tokio::{
    sync::{Mutex, mpsc},
    task::JoinSet,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    account::{Account, AccountState, receiver_index},
    client::{BankSendInput, ChainClient, ChainError, Coin},
    config::StressConfig,
};

#[derive(Debug, Error)]
pub enum PrepareError {
    #[error("preparation cancelled")]
    Cancelled,
    #[error("failed to query account {account}: {source}")]
    Query {
        account: usize,
        #[source]
        source: ChainError,
    },
    #[error("failed to sign transaction {tx_index} of account {account}: {source}")]
    Signing {
        account: usize,
        tx_index: usize,
        #[source]
        source: ChainError,
    },
    #[error("signing workers stopped with {missing} transactions unsigned")]
    Incomplete { missing: usize },
    #[error("preparation task failed: {0}")]
    TaskFailed(String),
}

/// Parameters shared by every transfer of a run
#[derive(Debug, Clone)]
pub struct PreparerConfig {
    pub transactions_per_account: usize,
    pub workers: usize,
    pub retry_interval: Duration,
    pub amount: Coin,
    pub fee: Coin,
    pub gas_limit: u64,
    pub memo: String,
}

impl PreparerConfig {
    pub fn from_config(config: &StressConfig) -> Result<Self> {
        let network = &config.network;
        Ok(Self {
            transactions_per_account: config.transactions_per_account,
            workers: config.worker_count(),
            retry_interval: config.retry_interval()?,
            amount: Coin::new(&network.denom, network.transfer_amount),
            fee: Coin::new(&network.denom, config.fee_amount()?),
            gas_limit: network.gas_limit,
            memo: network.memo.clone(),
        })
    }

    /// Work queue capacity; keeps every worker busy without buffering the whole run
    fn queue_capacity(&self) -> usize {
        self.workers.max(1) * 4
    }
}

/// One transfer to sign, keyed by its position in the run
#[derive(Debug)]
pub struct TransactionRequest {
    pub account_index: usize,
    pub tx_index: usize,
    pub input: BankSendInput,
}

#[derive(Debug)]
struct SignedTransaction {
    account_index: usize,
    tx_index: usize,
    bytes: Vec<u8>,
}

/// Signed transfers of one account, ordered by transaction index.
///
/// Transaction `i` carries sequence `initial_sequence + i`, so it can only be
/// accepted after every earlier transaction of the batch.
#[derive(Debug, Clone)]
pub struct PreparedBatch {
    pub account_index: usize,
    pub initial_sequence: u64,
    pub transactions: Vec<Vec<u8>>,
}

impl PreparedBatch {
    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }
}

/// Fetches account state and signs every transfer of the run.
///
/// Returns one [`PreparedBatch`] per account, in account order.
pub async fn prepare_transactions<C: ChainClient>(
    client: Arc<C>,
    accounts: &[Account],
    config: &PreparerConfig,
    cancel: &CancellationToken,
) -> Result<Vec<PreparedBatch>, PrepareError> {
    let states = fetch_account_states(&client, accounts, config.retry_interval, cancel).await?;

    // stops the producer and workers on any early return
    let cancel = cancel.child_token();
    let _guard = cancel.clone().drop_guard();

    let requests = build_requests(accounts, &states, config);
    let total = requests.len();
    info!(
        accounts = accounts.len(),
        transactions = total,
        workers = config.workers,
        "Signing transactions"
    );

    let (work_tx, work_rx) = mpsc::channel::<TransactionRequest>(config.queue_capacity());
    let (result_tx, mut result_rx) =
        mpsc::channel::<Result<SignedTransaction, PrepareError>>(config.queue_capacity());

    let mut tasks = JoinSet::new();
    tasks.spawn(produce_requests(requests, work_tx, cancel.clone()));

    let work_rx = Arc::new(Mutex::new(work_rx));
    for worker in 0..config.workers.max(1) {
        tasks.spawn(sign_worker(
            worker,
            Arc::clone(&client),
            Arc::clone(&work_rx),
            result_tx.clone(),
            cancel.clone(),
        ));
    }
    drop(result_tx);

    let n = config.transactions_per_account;
    let mut matrix: Vec<Vec<Option<Vec<u8>>>> = vec![vec![None; n]; accounts.len()];
    let mut remaining = total;

    while remaining > 0 {
        let received = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(PrepareError::Cancelled),
            received = result_rx.recv() => received,
        };
        match received {
            Some(Ok(signed)) => {
                matrix[signed.account_index][signed.tx_index] = Some(signed.bytes);
                remaining -= 1;
            }
            Some(Err(e)) => return Err(e),
            None => break,
        }
    }

    if remaining > 0 {
        return Err(if cancel.is_cancelled() {
            PrepareError::Cancelled
        } else {
            PrepareError::Incomplete { missing: remaining }
        });
    }

    while tasks.join_next().await.is_some() {}

    let batches = matrix
        .into_iter()
        .zip(&states)
        .enumerate()
        .map(|(account_index, (row, state))| PreparedBatch {
            account_index,
            initial_sequence: state.initial_sequence,
            transactions: row.into_iter().flatten().collect(),
        })
        .collect();

    info!(transactions = total, "All transactions signed");
    Ok(batches)
}

/// Queries every account concurrently, retrying transport failures.
async fn fetch_account_states<C: ChainClient>(
    client: &Arc<C>,
    accounts: &[Account],
    retry_interval: Duration,
    cancel: &CancellationToken,
) -> Result<Vec<AccountState>, PrepareError> {
    let mut tasks = JoinSet::new();
    for (index, account) in accounts.iter().enumerate() {
        let client = Arc::clone(client);
        let address = account.address.clone();
        let cancel = cancel.clone();
        tasks.spawn(async move {
            let state =
                fetch_account_state(&*client, index, &address, retry_interval, &cancel).await;
            (index, state)
        });
    }

    let mut states = vec![None; accounts.len()];
    while let Some(joined) = tasks.join_next().await {
        let (index, state) = joined.map_err(|e| {
            error!(error = %e, "Account query task panicked");
            PrepareError::TaskFailed(e.to_string())
        })?;
        states[index] = Some(state?);
    }

    Ok(states.into_iter().flatten().collect())
}

async fn fetch_account_state<C: ChainClient>(
    client: &C,
    index: usize,
    address: &str,
    retry_interval: Duration,
    cancel: &CancellationToken,
) -> Result<AccountState, PrepareError> {
    loop {
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(PrepareError::Cancelled),
            result = client.get_number_sequence(address) => result,
        };

        match result {
            Ok((account_number, initial_sequence)) => {
                debug!(
                    account = index,
                    address,
                    account_number,
                    initial_sequence,
                    "Fetched account"
                );
                return Ok(AccountState { account_number, initial_sequence });
            }
            Err(e) if e.is_retryable() => {
                warn!(account = index, address, error = %e, "Account query failed, retrying");
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(PrepareError::Cancelled),
                    _ = tokio::time::sleep(retry_interval) => {}
                }
            }
            Err(source) => return Err(PrepareError::Query { account: index, source }),
        }
    }
}

/// Enumerates requests account-major, transaction index ascending.
fn build_requests(
    accounts: &[Account],
    states: &[AccountState],
    config: &PreparerConfig,
) -> Vec<TransactionRequest> {
    let count = accounts.len();
    let mut requests = Vec::with_capacity(count * config.transactions_per_account);

    for (account_index, (sender, state)) in accounts.iter().zip(states).enumerate() {
        let receiver = &accounts[receiver_index(account_index, count)];
        for tx_index in 0..config.transactions_per_account {
            requests.push(TransactionRequest {
                account_index,
                tx_index,
                input: BankSendInput {
                    sender: sender.clone(),
                    account_number: state.account_number,
                    sequence: state.initial_sequence + tx_index as u64,
                    receiver: receiver.address.clone(),
                    amount: config.amount.clone(),
                    gas_limit: config.gas_limit,
                    fee: config.fee.clone(),
                    memo: config.memo.clone(),
                },
            });
        }
    }

    requests
}

async fn produce_requests(
    requests: Vec<TransactionRequest>,
    work_tx: mpsc::Sender<TransactionRequest>,
    cancel: CancellationToken,
) {
    for request in requests {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            sent = work_tx.send(request) => {
                if sent.is_err() {
                    return;
                }
            }
        }
    }
}

async fn sign_worker<C: ChainClient>(
    worker: usize,
    client: Arc<C>,
    work_rx: Arc<Mutex<mpsc::Receiver<TransactionRequest>>>,
    result_tx: mpsc::Sender<Result<SignedTransaction, PrepareError>>,
    cancel: CancellationToken,
) {
    loop {
        let request = {
            let mut rx = work_rx.lock().await;
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                request = rx.recv() => request,
            }
        };
        let Some(TransactionRequest { account_index, tx_index, input }) = request else {
            debug!(worker, "Work queue drained");
            return;
        };

        let signed = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            signed = client.prepare_tx_bank_send(input) => signed,
        };
        let result = signed
            .map(|bytes| SignedTransaction { account_index, tx_index, bytes })
            .map_err(|source| PrepareError::Signing { account: account_index, tx_index, source });
        let failed = result.is_err();

        if result_tx.send(result).await.is_err() || failed {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::mock::{MockChainClient, decode, test_accounts};

    fn test_config(transactions: usize, workers: usize) -> PreparerConfig {
        PreparerConfig {
            transactions_per_account: transactions,
            workers,
            retry_interval: Duration::from_millis(1),
            amount: Coin::new("udevcore", 10),
            fee: Coin::new("udevcore", 5_000),
            gas_limit: 80_000,
            memo: String::new(),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_batches_are_ordered_by_sequence() {
        let accounts = test_accounts(3);
        let initial = [7, 0, 42];
        let client = Arc::new(MockChainClient::with_accounts(&accounts, &initial));

        let batches = prepare_transactions(
            Arc::clone(&client),
            &accounts,
            &test_config(5, 4),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(batches.len(), 3);
        assert_eq!(client.sign_calls.load(std::sync::atomic::Ordering::SeqCst), 15);
        for (i, batch) in batches.iter().enumerate() {
            assert_eq!(batch.account_index, i);
            assert_eq!(batch.initial_sequence, initial[i]);
            assert_eq!(batch.len(), 5);
            for (j, bytes) in batch.transactions.iter().enumerate() {
                let (sender, receiver, sequence) = decode(bytes);
                assert_eq!(sender, format!("acc{i}"));
                assert_eq!(receiver, format!("acc{}", (i + 1) % 3));
                assert_eq!(sequence, initial[i] + j as u64);
            }
        }
    }

    #[tokio::test]
    async fn test_single_worker_matches_pool() {
        let accounts = test_accounts(2);
        let client = Arc::new(MockChainClient::with_accounts(&accounts, &[3, 9]));
        let cancel = CancellationToken::new();

        let one = prepare_transactions(Arc::clone(&client), &accounts, &test_config(4, 1), &cancel)
            .await
            .unwrap();
        let many = prepare_transactions(Arc::clone(&client), &accounts, &test_config(4, 8), &cancel)
            .await
            .unwrap();

        for (a, b) in one.iter().zip(&many) {
            assert_eq!(a.transactions, b.transactions);
        }
    }

    #[tokio::test]
    async fn test_single_account_sends_to_itself() {
        let accounts = test_accounts(1);
        let client = Arc::new(MockChainClient::with_accounts(&accounts, &[0]));

        let batches =
            prepare_transactions(client, &accounts, &test_config(2, 2), &CancellationToken::new())
                .await
                .unwrap();
        let (sender, receiver, _) = decode(&batches[0].transactions[0]);
        assert_eq!(sender, receiver);
    }

    #[tokio::test]
    async fn test_signing_error_aborts() {
        let accounts = test_accounts(2);
        let client = Arc::new(MockChainClient::with_accounts(&accounts, &[0, 10]));
        client.fail_signing("acc1", 12);

        let err =
            prepare_transactions(client, &accounts, &test_config(5, 2), &CancellationToken::new())
                .await
                .unwrap_err();
        assert!(matches!(err, PrepareError::Signing { account: 1, tx_index: 2, .. }));
    }

    #[tokio::test]
    async fn test_transient_query_failures_are_retried() {
        let accounts = test_accounts(2);
        let client = Arc::new(MockChainClient::with_accounts(&accounts, &[1, 2]));
        client.fail_queries(3);

        let batches =
            prepare_transactions(client, &accounts, &test_config(1, 1), &CancellationToken::new())
                .await
                .unwrap();
        assert_eq!(batches[0].initial_sequence, 1);
        assert_eq!(batches[1].initial_sequence, 2);
    }

    #[tokio::test]
    async fn test_unknown_account_is_fatal() {
        let accounts = test_accounts(2);
        let client = Arc::new(MockChainClient::with_accounts(&accounts[..1], &[0]));

        let err =
            prepare_transactions(client, &accounts, &test_config(1, 1), &CancellationToken::new())
                .await
                .unwrap_err();
        assert!(matches!(err, PrepareError::Query { account: 1, .. }));
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let accounts = test_accounts(2);
        let client = Arc::new(MockChainClient::with_accounts(&accounts, &[0, 0]));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = prepare_transactions(client, &accounts, &test_config(3, 2), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, PrepareError::Cancelled));
    }

    #[tokio::test]
    async fn test_panicked_query_is_reported() {
        let accounts = test_accounts(2);
        let client = Arc::new(MockChainClient::with_accounts(&accounts, &[0, 0]));
        client.panic_on("acc1");

        let err =
            prepare_transactions(client, &accounts, &test_config(1, 1), &CancellationToken::new())
                .await
                .unwrap_err();
        assert!(matches!(err, PrepareError::TaskFailed(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancel_while_signing() {
        let accounts = test_accounts(2);
        let client = Arc::new(MockChainClient::with_accounts(&accounts, &[0, 0]));
        client.block_signing();
        let cancel = CancellationToken::new();
        let config = test_config(20, 1);
        assert!(accounts.len() * config.transactions_per_account > config.queue_capacity());

        let task_client = Arc::clone(&client);
        let task_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            prepare_transactions(task_client, &accounts, &config, &task_cancel).await
        });

        // the only worker is stuck signing and the producer is waiting on a full queue
        tokio::time::timeout(Duration::from_secs(5), async {
            while client.sign_calls.load(std::sync::atomic::Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("signing never started");
        cancel.cancel();

        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("preparation did not stop after cancellation")
            .unwrap();
        assert!(matches!(result, Err(PrepareError::Cancelled)));
        assert_eq!(client.sign_calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_while_queries_keep_failing() {
        let accounts = test_accounts(1);
        let client = Arc::new(MockChainClient::with_accounts(&accounts, &[0]));
        client.fail_queries(usize::MAX);
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            prepare_transactions(client, &accounts, &test_config(1, 1), &cancel),
        )
        .await
        .expect("preparation did not stop after cancellation");
        assert!(matches!(result, Err(PrepareError::Cancelled)));
    }
}
