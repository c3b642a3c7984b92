//! Request/response transport
//!
//! The background workers and the follower talk to the ledger through the
//! [`LedgerRpc`] port; tests substitute fakes. [`WsRpcClient`] is the real
//! implementation: a websocket owned by a background I/O task, requests
//! correlated by id, a per-call timeout, and throttling responses surfaced
//! as [`Error::RateLimited`].

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::sleep;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::ledger::types::{AccountInfo, BookOffer, LedgerTxSummary, SubmitResult, TxLookup};

/// Abstract request/response operations against the ledger
#[async_trait]
pub trait LedgerRpc: Send + Sync {
    /// Look up a transaction by hash
    async fn tx(&self, tx_hash: &str) -> Result<TxLookup>;

    /// Recent transactions that touched an account, newest first
    async fn account_tx(&self, account: &str, limit: u32) -> Result<Vec<LedgerTxSummary>>;

    /// Order-book offers for a currency pair
    async fn book_offers(&self, taker_gets: Value, taker_pays: Value) -> Result<Vec<BookOffer>>;

    /// Current account state (sequence number)
    async fn account_info(&self, account: &str) -> Result<AccountInfo>;

    /// Submit a signed transaction blob; the result is provisional
    async fn submit(&self, tx_blob: &str) -> Result<SubmitResult>;
}

/// Submit a blob and poll until the transaction is validated, returning the
/// final `TransactionResult` code
pub async fn submit_and_wait(
    rpc: &dyn LedgerRpc,
    tx_blob: &str,
    tx_hash: &str,
    wait_timeout: Duration,
) -> Result<String> {
    let provisional = rpc.submit(tx_blob).await?;
    debug!("Submitted {}: provisional {}", tx_hash, provisional.engine_result);

    if provisional.engine_result.starts_with("tem") {
        // Malformed transactions will never validate
        return Err(Error::Submission(provisional.engine_result));
    }

    let deadline = tokio::time::Instant::now() + wait_timeout;
    loop {
        sleep(Duration::from_secs(2)).await;
        match rpc.tx(tx_hash).await {
            Ok(lookup) if lookup.validated => {
                return lookup
                    .transaction_result()
                    .map(str::to_string)
                    .ok_or_else(|| Error::Rpc("validated transaction without meta".to_string()));
            }
            Ok(_) => {}
            // Not found yet is expected right after submission
            Err(e) if e.is_retryable() => debug!("Waiting for validation of {}: {}", tx_hash, e),
            Err(e) => return Err(e),
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(Error::RequestTimeout(wait_timeout.as_millis() as u64));
        }
    }
}

struct RpcCommand {
    request: Value,
    reply: oneshot::Sender<Result<Value>>,
}

/// Websocket-backed implementation of [`LedgerRpc`]
pub struct WsRpcClient {
    cmd_tx: mpsc::Sender<RpcCommand>,
    request_timeout: Duration,
}

impl WsRpcClient {
    /// Spawn the I/O task. The connection is established lazily and
    /// re-established on failure; in-flight requests on a dying connection
    /// fail with a retryable error.
    pub fn new(ws_url: String, request_timeout: Duration) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        tokio::spawn(run_io(ws_url, cmd_rx));
        Self {
            cmd_tx,
            request_timeout,
        }
    }

    async fn request(&self, request: Value) -> Result<Value> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(RpcCommand {
                request,
                reply: reply_tx,
            })
            .await
            .map_err(|_| Error::ConnectionClosed("rpc client stopped".to_string()))?;

        match tokio::time::timeout(self.request_timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::ConnectionClosed("rpc connection dropped".to_string())),
            Err(_) => Err(Error::RequestTimeout(self.request_timeout.as_millis() as u64)),
        }
    }
}

#[async_trait]
impl LedgerRpc for WsRpcClient {
    async fn tx(&self, tx_hash: &str) -> Result<TxLookup> {
        let result = self
            .request(json!({ "command": "tx", "transaction": tx_hash }))
            .await?;
        Ok(serde_json::from_value(result)?)
    }

    async fn account_tx(&self, account: &str, limit: u32) -> Result<Vec<LedgerTxSummary>> {
        let result = self
            .request(json!({ "command": "account_tx", "account": account, "limit": limit }))
            .await?;
        let transactions = result
            .get("transactions")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        Ok(transactions
            .into_iter()
            .filter_map(|wrapper| {
                wrapper
                    .get("tx")
                    .cloned()
                    .and_then(|tx| serde_json::from_value(tx).ok())
            })
            .collect())
    }

    async fn book_offers(&self, taker_gets: Value, taker_pays: Value) -> Result<Vec<BookOffer>> {
        let result = self
            .request(json!({
                "command": "book_offers",
                "taker_gets": taker_gets,
                "taker_pays": taker_pays,
            }))
            .await?;
        let offers = result
            .get("offers")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        Ok(offers
            .into_iter()
            .filter_map(|offer| serde_json::from_value(offer).ok())
            .collect())
    }

    async fn account_info(&self, account: &str) -> Result<AccountInfo> {
        let result = self
            .request(json!({
                "command": "account_info",
                "account": account,
                "ledger_index": "current",
            }))
            .await?;
        let sequence = result
            .get("account_data")
            .and_then(|data| data.get("Sequence"))
            .and_then(Value::as_u64)
            .ok_or_else(|| Error::Rpc("account_info response without Sequence".to_string()))?;
        Ok(AccountInfo {
            sequence: sequence as u32,
        })
    }

    async fn submit(&self, tx_blob: &str) -> Result<SubmitResult> {
        let result = self
            .request(json!({ "command": "submit", "tx_blob": tx_blob }))
            .await?;
        Ok(serde_json::from_value(result)?)
    }
}

/// I/O task: owns the websocket, correlates responses by id, reconnects.
async fn run_io(ws_url: String, mut cmd_rx: mpsc::Receiver<RpcCommand>) {
    let mut next_id: u64 = 1;
    let mut reconnect_delay = Duration::from_secs(1);

    'session: loop {
        let ws = match connect_async(ws_url.as_str()).await {
            Ok((ws, _)) => {
                debug!("RPC connection established to {}", ws_url);
                reconnect_delay = Duration::from_secs(1);
                ws
            }
            Err(e) => {
                warn!("RPC connection to {} failed: {}", ws_url, e);
                // Nothing to serve while disconnected; fail the next command fast
                if let Some(cmd) = cmd_rx.recv().await {
                    let _ = cmd.reply.send(Err(Error::Connection(e.to_string())));
                } else {
                    return;
                }
                sleep(reconnect_delay).await;
                reconnect_delay = (reconnect_delay * 2).min(Duration::from_secs(30));
                continue 'session;
            }
        };

        let (mut write, mut read) = ws.split();
        let mut pending: HashMap<u64, oneshot::Sender<Result<Value>>> = HashMap::new();

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    let Some(mut cmd) = cmd else { return };
                    let id = next_id;
                    next_id += 1;
                    cmd.request["id"] = json!(id);
                    match write.send(Message::Text(cmd.request.to_string())).await {
                        Ok(()) => {
                            pending.insert(id, cmd.reply);
                        }
                        Err(e) => {
                            let _ = cmd.reply.send(Err(e.into()));
                            break;
                        }
                    }
                }
                frame = read.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            dispatch_response(&text, &mut pending);
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            let _ = write.send(Message::Pong(payload)).await;
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Err(e)) => {
                            warn!("RPC read error: {}", e);
                            break;
                        }
                        _ => {}
                    }
                }
            }
        }

        // The connection died; every in-flight request gets a retryable error
        for (_, reply) in pending.drain() {
            let _ = reply.send(Err(Error::ConnectionClosed("connection lost".to_string())));
        }
        sleep(reconnect_delay).await;
        reconnect_delay = (reconnect_delay * 2).min(Duration::from_secs(30));
    }
}

fn dispatch_response(text: &str, pending: &mut HashMap<u64, oneshot::Sender<Result<Value>>>) {
    let Ok(message) = serde_json::from_str::<Value>(text) else {
        debug!("Dropping unparseable rpc frame");
        return;
    };
    let Some(id) = message.get("id").and_then(Value::as_u64) else {
        return;
    };
    let Some(reply) = pending.remove(&id) else {
        return;
    };
    let _ = reply.send(classify_response(message));
}

/// Map a ledger response envelope to our error taxonomy
fn classify_response(mut message: Value) -> Result<Value> {
    let status = message
        .get("status")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    if status == "success" {
        return Ok(message
            .get_mut("result")
            .map(Value::take)
            .unwrap_or(Value::Null));
    }

    let error = message
        .get("error")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string();
    if error == "slowDown" || error == "tooBusy" {
        return Err(Error::RateLimited);
    }
    Err(Error::Rpc(error))
}
