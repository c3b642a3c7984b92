//! Persistence port
//!
//! The pipeline writes an append-only event log (trust lines, trades, price
//! samples) and a set of mutable projections (token state, wallet state, max
//! prices) through the [`Store`] trait. Appends are deduplicated by
//! transaction hash because the streaming source redelivers frames after
//! reconnects; everything downstream relies on that idempotence.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::parser::TokenId;

pub use memory::MemoryStore;

/// Result of an append: new row, or already seen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Ok,
    Duplicate,
}

/// Lifecycle status of a token
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenStatus {
    /// Discovered, awaiting analysis
    Pending,
    /// Within the age window; counters accumulate
    Active,
    /// Past the age window. Terminal: never re-promoted.
    TooOld,
    /// Seen after being ruled out; tracked but never counted
    Filtered,
}

/// One trust-line event row. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrustLineRow {
    pub token: TokenId,
    pub wallet: String,
    pub limit: Decimal,
    pub tx_hash: String,
    pub timestamp: DateTime<Utc>,
    pub is_removal: bool,
}

/// One trade row. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRow {
    pub token: TokenId,
    pub buyer: String,
    pub seller: String,
    pub amount: Decimal,
    pub delivered_amount: Decimal,
    /// Native price per token at ingestion time, when a current price was known
    pub price_native: Option<Decimal>,
    pub tx_hash: String,
    pub timestamp: DateTime<Utc>,
}

/// Projection row for a token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenStateRecord {
    pub token: TokenId,
    pub status: TokenStatus,
    pub first_seen: DateTime<Utc>,
    pub first_seen_tx: Option<String>,
    pub trust_lines: u64,
    pub trades: u64,
    pub total_volume: Decimal,
    pub first_trade_at: Option<DateTime<Utc>>,
    pub creation_date: Option<DateTime<Utc>>,
    pub creator: Option<String>,
    pub is_frozen: bool,
    pub unique_holders: u64,
    pub current_price: Option<Decimal>,
    pub first_price: Option<Decimal>,
    pub first_price_at: Option<DateTime<Utc>>,
    pub max_price: Option<Decimal>,
    pub max_price_at: Option<DateTime<Utc>>,
    pub last_updated: DateTime<Utc>,
}

impl TokenStateRecord {
    pub fn new(token: TokenId, status: TokenStatus, now: DateTime<Utc>) -> Self {
        Self {
            token,
            status,
            first_seen: now,
            first_seen_tx: None,
            trust_lines: 0,
            trades: 0,
            total_volume: Decimal::ZERO,
            first_trade_at: None,
            creation_date: None,
            creator: None,
            is_frozen: false,
            unique_holders: 0,
            current_price: None,
            first_price: None,
            first_price_at: None,
            max_price: None,
            max_price_at: None,
            last_updated: now,
        }
    }
}

/// Field-level patch for a token projection; `None` leaves a field untouched
#[derive(Debug, Clone, Default)]
pub struct TokenStatePatch {
    pub first_seen_tx: Option<String>,
    pub trust_lines: Option<u64>,
    pub trades: Option<u64>,
    pub total_volume: Option<Decimal>,
    pub first_trade_at: Option<DateTime<Utc>>,
    pub creation_date: Option<DateTime<Utc>>,
    pub creator: Option<String>,
    pub is_frozen: Option<bool>,
    pub unique_holders: Option<u64>,
    pub current_price: Option<Decimal>,
}

/// Wallet projection row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletRecord {
    pub address: String,
    pub first_seen: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
    pub alpha_score: Option<Decimal>,
    pub score_updated: Option<DateTime<Utc>>,
}

/// One append-only price observation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceSample {
    pub token: TokenId,
    pub price: Decimal,
    pub timestamp: DateTime<Utc>,
}

/// A token awaiting (re-)analysis
#[derive(Debug, Clone)]
pub struct PendingToken {
    pub token: TokenId,
    pub first_seen_tx: Option<String>,
}

/// Persistence operations. Implementations must serialize per-record updates
/// and be safe for concurrent use.
#[async_trait]
pub trait Store: Send + Sync {
    /// Append a trust-line event, deduplicated by (tx_hash, wallet, token)
    async fn append_trust_line(&self, row: TrustLineRow) -> Result<AppendOutcome>;

    /// Append a trade, deduplicated by tx_hash. Rejects empty buyer/seller.
    async fn append_trade(&self, row: TradeRow) -> Result<AppendOutcome>;

    /// Merge a field patch into a token projection, creating it if missing.
    /// Last writer wins per field.
    async fn upsert_token_state(&self, token: &TokenId, patch: TokenStatePatch) -> Result<()>;

    /// Set a token's status. `TooOld` is terminal: once set, other statuses
    /// are ignored.
    async fn mark_token(&self, token: &TokenId, status: TokenStatus) -> Result<()>;

    async fn get_token_state(&self, token: &TokenId) -> Result<Option<TokenStateRecord>>;

    async fn record_price_sample(&self, token: &TokenId, price: Decimal, timestamp: DateTime<Utc>) -> Result<()>;

    /// Raise the max price if `price` exceeds it; returns whether it did
    async fn update_max_price_if_higher(&self, token: &TokenId, price: Decimal, timestamp: DateTime<Utc>) -> Result<bool>;

    async fn get_max_price(&self, token: &TokenId) -> Result<Option<Decimal>>;

    /// Tokens currently `active`, optionally bounded by creation age (hours)
    async fn get_active_tokens(&self, min_age_hours: Option<i64>, max_age_hours: Option<i64>) -> Result<Vec<TokenId>>;

    /// Tokens that are `pending`, plus `active` ones not updated since `cutoff`
    async fn get_unanalyzed_tokens(&self, cutoff: DateTime<Utc>) -> Result<Vec<PendingToken>>;

    /// A wallet's trust-line rows (establishments and removals), oldest first
    async fn get_wallet_trust_lines(&self, wallet: &str, since: Option<DateTime<Utc>>) -> Result<Vec<TrustLineRow>>;

    /// A wallet's trades (as buyer or seller), optionally for one token,
    /// oldest first
    async fn get_wallet_trades(&self, wallet: &str, token: Option<&TokenId>) -> Result<Vec<TradeRow>>;

    async fn get_price_history(&self, token: &TokenId, from: Option<DateTime<Utc>>, to: Option<DateTime<Utc>>) -> Result<Vec<PriceSample>>;

    /// Addresses that opened a trust line or traded since `since`
    async fn get_active_wallets(&self, since: DateTime<Utc>) -> Result<Vec<String>>;

    /// 1-based position a trust line opened at `timestamp` would hold in the
    /// token's timeline (removals excluded)
    async fn get_trustline_position(&self, token: &TokenId, timestamp: DateTime<Utc>) -> Result<u64>;

    async fn update_wallet_alpha_score(&self, wallet: &str, score: Decimal, calculated_at: DateTime<Utc>) -> Result<()>;

    /// Scored wallets, best first
    async fn get_top_alpha_wallets(&self, limit: usize) -> Result<Vec<WalletRecord>>;
}
