//! Background analytics workers
//!
//! Three periodic workers read the store and issue requests against the
//! ledger's request/response transport: the token analyzer (age gating and
//! issuer inspection), the price monitor (order-book polling) and the wallet
//! scorer (alpha scoring over historical events).

pub mod price_monitor;
pub mod rate_limit;
pub mod token_analyzer;
pub mod wallet_scorer;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::json;
use std::sync::Arc;

use crate::error::Result;
use crate::ledger::rpc::LedgerRpc;
use crate::parser::TokenId;
use crate::store::Store;

/// Drops per display unit of the native coin
const DROPS_PER_NATIVE: i64 = 1_000_000;

/// Best native->token offer from the order book, as native price per token.
/// `None` when the book is empty or the offer is malformed.
pub(crate) async fn fetch_best_price(
    rpc: &dyn LedgerRpc,
    token: &TokenId,
) -> Result<Option<Decimal>> {
    let offers = rpc
        .book_offers(
            json!({ "currency": "XRP" }),
            json!({ "currency": token.currency, "issuer": token.issuer }),
        )
        .await?;

    let Some(best) = offers.first() else {
        return Ok(None);
    };
    let (Some(drops), Some(token_amount)) =
        (best.taker_gets.drops(), best.taker_pays.issued_value())
    else {
        return Ok(None);
    };
    if token_amount.is_zero() {
        return Ok(None);
    }

    let native = Decimal::from(drops) / Decimal::new(DROPS_PER_NATIVE, 0);
    Ok(Some(native / token_amount))
}

/// Record one observation: append the sample, refresh the current price, and
/// keep the max monotonic. Returns the max before the update so callers can
/// report notable moves.
pub(crate) async fn record_price_observation(
    store: &Arc<dyn Store>,
    token: &TokenId,
    price: Decimal,
    observed_at: DateTime<Utc>,
) -> Result<Option<Decimal>> {
    let previous_max = store.get_max_price(token).await?;
    store.record_price_sample(token, price, observed_at).await?;
    store.update_max_price_if_higher(token, price, observed_at).await?;
    Ok(previous_max)
}
