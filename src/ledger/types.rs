//! Wire message shapes for the ledger transports
//!
//! Frames arrive with the transaction body under either `transaction` or
//! `tx_json` depending on server version; [`StreamFrame::tx`] is the single
//! place that resolves the alternate keys. Ledger timestamps count seconds
//! since 2000-01-01 UTC and are converted to wall time here and nowhere else.

use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Seconds between the Unix epoch and the ledger epoch (2000-01-01 UTC)
pub const LEDGER_EPOCH_OFFSET: i64 = 946_684_800;

/// AccountSet flag marking a globally frozen issuer
pub const FLAG_GLOBAL_FREEZE: u32 = 0x0010_0000;

/// Convert a ledger timestamp to wall-clock UTC
pub fn ledger_time_to_utc(ledger_seconds: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(LEDGER_EPOCH_OFFSET + ledger_seconds, 0)
        .single()
        .unwrap_or_else(Utc::now)
}

/// A monetary amount on the wire: either a drops string (native coin) or an
/// issued-currency object
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Amount {
    Issued(IssuedCurrency),
    Drops(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IssuedCurrency {
    pub currency: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issuer: Option<String>,
    pub value: String,
}

impl Amount {
    pub fn is_native(&self) -> bool {
        matches!(self, Amount::Drops(_))
    }

    /// Issued-currency value as a decimal, `None` for native amounts
    pub fn issued_value(&self) -> Option<Decimal> {
        match self {
            Amount::Issued(issued) => issued.value.parse().ok(),
            Amount::Drops(_) => None,
        }
    }

    /// Native amount in drops, `None` for issued amounts
    pub fn drops(&self) -> Option<u64> {
        match self {
            Amount::Drops(raw) => raw.parse().ok(),
            Amount::Issued(_) => None,
        }
    }
}

/// A frame from the streaming subscription
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StreamFrame {
    #[serde(rename = "type")]
    pub frame_type: Option<String>,
    #[serde(default)]
    pub validated: bool,
    transaction: Option<Value>,
    tx_json: Option<Value>,
    pub meta: Option<Value>,
    pub hash: Option<String>,
}

impl StreamFrame {
    /// True for validated transaction frames
    pub fn is_validated_transaction(&self) -> bool {
        self.frame_type.as_deref() == Some("transaction") && self.validated
    }

    /// True for command responses (including pongs)
    pub fn is_response(&self) -> bool {
        self.frame_type.as_deref() == Some("response")
    }

    /// The transaction body, whichever key the server used
    pub fn tx(&self) -> Option<&Value> {
        self.transaction.as_ref().or(self.tx_json.as_ref())
    }

    /// Transaction hash: top level on newer servers, inside the body on older ones
    pub fn tx_hash(&self) -> Option<String> {
        self.hash.clone().or_else(|| {
            self.tx()
                .and_then(|tx| tx.get("hash"))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
    }

    /// `meta.TransactionResult`, when present
    pub fn transaction_result(&self) -> Option<&str> {
        self.meta
            .as_ref()
            .and_then(|meta| meta.get("TransactionResult"))
            .and_then(Value::as_str)
    }
}

/// Subscribe to the global transaction stream
pub fn subscribe_transactions_request(id: u64) -> Value {
    json!({ "id": id, "command": "subscribe", "streams": ["transactions"] })
}

/// Subscribe to a single account's transactions
pub fn subscribe_account_request(id: u64, account: &str) -> Value {
    json!({ "id": id, "command": "subscribe", "accounts": [account] })
}

/// Heartbeat ping
pub fn ping_request(id: u64) -> Value {
    json!({ "id": id, "command": "ping" })
}

/// Result of a `tx` lookup
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TxLookup {
    /// Ledger timestamp (seconds since the ledger epoch)
    pub date: Option<i64>,
    #[serde(default)]
    pub validated: bool,
    pub hash: Option<String>,
    pub meta: Option<Value>,
}

impl TxLookup {
    pub fn close_time(&self) -> Option<DateTime<Utc>> {
        self.date.map(ledger_time_to_utc)
    }

    pub fn transaction_result(&self) -> Option<&str> {
        self.meta
            .as_ref()
            .and_then(|meta| meta.get("TransactionResult"))
            .and_then(Value::as_str)
    }
}

/// One entry from an `account_tx` response
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LedgerTxSummary {
    #[serde(rename = "TransactionType")]
    pub transaction_type: Option<String>,
    #[serde(rename = "Account")]
    pub account: Option<String>,
    #[serde(rename = "Flags")]
    pub flags: Option<u32>,
    pub date: Option<i64>,
    pub hash: Option<String>,
}

impl LedgerTxSummary {
    pub fn close_time(&self) -> Option<DateTime<Utc>> {
        self.date.map(ledger_time_to_utc)
    }

    pub fn has_global_freeze(&self) -> bool {
        self.transaction_type.as_deref() == Some("AccountSet")
            && self.flags.is_some_and(|flags| flags & FLAG_GLOBAL_FREEZE != 0)
    }
}

/// One order-book offer
#[derive(Debug, Clone, Deserialize)]
pub struct BookOffer {
    #[serde(rename = "TakerGets")]
    pub taker_gets: Amount,
    #[serde(rename = "TakerPays")]
    pub taker_pays: Amount,
}

/// Account state needed before submitting a transaction
#[derive(Debug, Clone)]
pub struct AccountInfo {
    pub sequence: u32,
}

/// Provisional result of a `submit`
#[derive(Debug, Clone, Deserialize)]
pub struct SubmitResult {
    pub engine_result: String,
    #[serde(default)]
    pub accepted: bool,
}
