//! [`ChainClient`] backed by a Cosmos SDK node's REST gateway.
//!
//! Signing happens locally with `cosmrs`; only account queries and broadcasts
//! go over the wire.

use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use cosmrs::{
    AccountId, Denom,
    bank::MsgSend,
    crypto::secp256k1::SigningKey,
    tendermint::{block::Height, chain},
    tx::{self, Fee, Msg, SignDoc, SignerInfo},
};
use reqwest::StatusCode;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::{
    account::{Account, PrivateKey},
    client::{BankSendInput, BroadcastError, BroadcastResult, ChainClient, ChainError, Coin},
    config::StressConfig,
};

/// `sdk` codespace error codes the broadcaster reacts to
const CODE_INSUFFICIENT_FEE: u32 = 13;
const CODE_TX_IN_MEMPOOL_CACHE: u32 = 19;
const CODE_MEMPOOL_IS_FULL: u32 = 20;
const CODE_WRONG_SEQUENCE: u32 = 32;

const SEQUENCE_MISMATCH_MARKER: &str = "account sequence mismatch";

/// Derives the bech32 address of `key` under `prefix`.
pub fn derive_account(key: PrivateKey, prefix: &str) -> Result<Account> {
    let signing_key = SigningKey::from_slice(key.as_bytes())
        .map_err(|e| anyhow!("failed to load signing key: {e}"))?;
    let account_id = signing_key
        .public_key()
        .account_id(prefix)
        .map_err(|e| anyhow!("failed to derive address with prefix {prefix}: {e}"))?;
    Ok(Account::new(account_id.to_string(), key))
}

#[derive(Debug, Deserialize)]
struct TxResponseEnvelope {
    tx_response: TxResponse,
}

#[derive(Debug, Deserialize)]
struct TxResponse {
    txhash: String,
    #[serde(default)]
    code: u32,
    #[serde(default)]
    codespace: String,
    #[serde(default)]
    raw_log: String,
    #[serde(default)]
    gas_used: String,
}

impl TxResponse {
    fn verdict(&self) -> Verdict {
        classify_code(self.code, &self.codespace, &self.raw_log)
    }

    fn into_result(self) -> BroadcastResult {
        let gas_used = self.gas_used.parse().unwrap_or_else(|e| {
            warn!(
                tx_hash = %self.txhash,
                gas_used = %self.gas_used,
                error = %e,
                "Node reported unparseable gas_used, recording 0"
            );
            0
        });
        BroadcastResult { tx_hash: self.txhash, gas_used }
    }
}

/// How the node answered a transaction
#[derive(Debug, PartialEq, Eq)]
enum Verdict {
    Accepted,
    /// The node already holds these exact bytes, in its mempool or a block
    AlreadyKnown,
    Failed(BroadcastError),
}

/// Comet transaction hash: uppercase hex SHA-256 of the raw bytes
fn hash_tx(tx_bytes: &[u8]) -> String {
    hex::encode_upper(Sha256::digest(tx_bytes))
}

/// REST client for a single cored node
#[derive(Debug, Clone)]
pub struct CosmosClient {
    http: reqwest::Client,
    base_url: String,
    chain_id: chain::Id,
    await_inclusion: bool,
    inclusion_timeout: Duration,
    poll_interval: Duration,
}

impl CosmosClient {
    pub fn new(config: &StressConfig) -> Result<Self> {
        let request_timeout = config.request_timeout()?;
        let http = reqwest::Client::builder()
            .pool_max_idle_per_host(100)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .connect_timeout(Duration::from_secs(30))
            .timeout(request_timeout)
            .build()
            .context("Failed to build HTTP client")?;

        let chain_id = config
            .chain_id
            .parse::<chain::Id>()
            .map_err(|e| anyhow!("invalid chain_id {}: {e}", config.chain_id))?;

        Ok(Self {
            http,
            base_url: config.node_address.trim_end_matches('/').to_string(),
            chain_id,
            await_inclusion: config.broadcast.await_inclusion,
            inclusion_timeout: config.inclusion_timeout()?,
            poll_interval: config.inclusion_poll_interval()?,
        })
    }

    /// Polls the node until `tx_hash` is in a block or the inclusion timeout elapses.
    async fn await_tx(&self, tx_hash: &str) -> Result<BroadcastResult, BroadcastError> {
        let url = format!("{}/cosmos/tx/v1beta1/txs/{tx_hash}", self.base_url);
        let deadline = tokio::time::Instant::now() + self.inclusion_timeout;

        loop {
            match self.http.get(&url).send().await {
                Ok(resp) if resp.status().is_success() => {
                    let envelope: TxResponseEnvelope = resp.json().await.map_err(|e| {
                        BroadcastError::Transient(format!("failed to decode tx {tx_hash}: {e}"))
                    })?;
                    let response = envelope.tx_response;
                    return match response.verdict() {
                        Verdict::Accepted => Ok(response.into_result()),
                        Verdict::AlreadyKnown => Err(BroadcastError::Transient(format!(
                            "tx {tx_hash} delivered with code {}: {}",
                            response.code, response.raw_log
                        ))),
                        Verdict::Failed(e) => Err(e),
                    };
                }
                Ok(resp) => {
                    debug!(tx_hash, status = %resp.status(), "Transaction not included yet");
                }
                Err(e) => {
                    debug!(tx_hash, error = %e, "Failed to query transaction");
                }
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(BroadcastError::Transient(format!(
                    "timed out waiting for inclusion of {tx_hash}"
                )));
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

#[async_trait]
impl ChainClient for CosmosClient {
    async fn get_number_sequence(&self, address: &str) -> Result<(u64, u64), ChainError> {
        let url = format!("{}/cosmos/auth/v1beta1/accounts/{address}", self.base_url);
        let resp =
            self.http.get(&url).send().await.map_err(|e| ChainError::Transport(e.to_string()))?;

        let status = resp.status();
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(ChainError::Transport(format!("account query returned {status}")));
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ChainError::InvalidResponse(format!(
                "account query for {address} returned {status}: {body}"
            )));
        }

        let body: serde_json::Value =
            resp.json().await.map_err(|e| ChainError::Transport(e.to_string()))?;
        parse_number_sequence(&body).ok_or_else(|| {
            ChainError::InvalidResponse(format!("no account number/sequence for {address}"))
        })
    }

    async fn prepare_tx_bank_send(&self, input: BankSendInput) -> Result<Vec<u8>, ChainError> {
        sign_bank_send(&self.chain_id, &input)
    }

    async fn broadcast(&self, tx_bytes: &[u8]) -> Result<BroadcastResult, BroadcastError> {
        let url = format!("{}/cosmos/tx/v1beta1/txs", self.base_url);
        let body = serde_json::json!({
            "tx_bytes": BASE64.encode(tx_bytes),
            "mode": "BROADCAST_MODE_SYNC",
        });

        let resp = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| BroadcastError::Transient(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(classify_http(status, &text));
        }

        let envelope: TxResponseEnvelope = resp
            .json()
            .await
            .map_err(|e| BroadcastError::Transient(format!("failed to decode response: {e}")))?;
        let response = envelope.tx_response;

        match response.verdict() {
            Verdict::Accepted if self.await_inclusion => self.await_tx(&response.txhash).await,
            Verdict::Accepted => Ok(response.into_result()),
            // an earlier attempt got through; find it instead of resending forever
            Verdict::AlreadyKnown => {
                let tx_hash = hash_tx(tx_bytes);
                debug!(tx_hash = %tx_hash, "Transaction already known, awaiting inclusion");
                self.await_tx(&tx_hash).await
            }
            Verdict::Failed(e) => Err(e),
        }
    }
}

fn sign_bank_send(chain_id: &chain::Id, input: &BankSendInput) -> Result<Vec<u8>, ChainError> {
    let signing = |e: cosmrs::ErrorReport| ChainError::Signing(e.to_string());

    let key = SigningKey::from_slice(input.sender.key.as_bytes()).map_err(signing)?;
    let from_address = input.sender.address.parse::<AccountId>().map_err(signing)?;
    let to_address = input.receiver.parse::<AccountId>().map_err(signing)?;

    let msg = MsgSend { from_address, to_address, amount: vec![to_cosmos_coin(&input.amount)?] }
        .to_any()
        .map_err(signing)?;

    let body = tx::Body::new(vec![msg], input.memo.clone(), Height::from(0u32));
    let fee = Fee::from_amount_and_gas(to_cosmos_coin(&input.fee)?, input.gas_limit);
    let auth_info =
        SignerInfo::single_direct(Some(key.public_key()), input.sequence).auth_info(fee);
    let sign_doc =
        SignDoc::new(&body, &auth_info, chain_id, input.account_number).map_err(signing)?;

    sign_doc.sign(&key).map_err(signing)?.to_bytes().map_err(signing)
}

fn to_cosmos_coin(coin: &Coin) -> Result<cosmrs::Coin, ChainError> {
    let denom = coin
        .denom
        .parse::<Denom>()
        .map_err(|e| ChainError::Signing(format!("invalid denom {}: {e}", coin.denom)))?;
    Ok(cosmrs::Coin { denom, amount: coin.amount })
}

/// Finds `account_number`/`sequence` in an auth query response, including
/// accounts wrapped by vesting or module account types.
fn parse_number_sequence(value: &serde_json::Value) -> Option<(u64, u64)> {
    let object = value.as_object()?;
    if let (Some(number), Some(sequence)) = (object.get("account_number"), object.get("sequence"))
    {
        return Some((json_u64(number)?, json_u64(sequence)?));
    }
    object.values().filter(|v| v.is_object()).find_map(parse_number_sequence)
}

fn json_u64(value: &serde_json::Value) -> Option<u64> {
    match value {
        serde_json::Value::String(s) => s.parse().ok(),
        serde_json::Value::Number(n) => n.as_u64(),
        _ => None,
    }
}

fn classify_code(code: u32, codespace: &str, raw_log: &str) -> Verdict {
    let sdk = codespace.is_empty() || codespace == "sdk";
    match code {
        0 => Verdict::Accepted,
        CODE_TX_IN_MEMPOOL_CACHE if sdk => Verdict::AlreadyKnown,
        CODE_WRONG_SEQUENCE if sdk => match parse_expected_sequence(raw_log) {
            Some(expected) => Verdict::Failed(BroadcastError::SequenceMismatch { expected }),
            None => Verdict::Failed(BroadcastError::Transient(format!("code {code}: {raw_log}"))),
        },
        CODE_INSUFFICIENT_FEE | CODE_MEMPOOL_IS_FULL if sdk => {
            Verdict::Failed(BroadcastError::Transient(format!("code {code}: {raw_log}")))
        }
        _ => Verdict::Failed(BroadcastError::Fatal(format!(
            "codespace {codespace} code {code}: {raw_log}"
        ))),
    }
}

fn classify_http(status: StatusCode, body: &str) -> BroadcastError {
    if let Some(expected) = parse_expected_sequence(body) {
        return BroadcastError::SequenceMismatch { expected };
    }
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        BroadcastError::Transient(format!("node returned {status}: {body}"))
    } else {
        BroadcastError::Fatal(format!("node returned {status}: {body}"))
    }
}

/// Extracts `N` from logs like `account sequence mismatch, expected 5, got 3: ...`.
pub(crate) fn parse_expected_sequence(raw_log: &str) -> Option<u64> {
    let start = raw_log.find(SEQUENCE_MISMATCH_MARKER)?;
    let rest = &raw_log[start..];
    let after = &rest[rest.find("expected ")? + "expected ".len()..];
    let digits: String = after.chars().take_while(char::is_ascii_digit).collect();
    digits.parse().ok()
}
