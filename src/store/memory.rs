//! In-memory store
//!
//! The shipped [`Store`] implementation: sharded concurrent maps keyed so
//! that every query touches only the rows it returns. Also the substitute
//! used throughout the test suite.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::{DashMap, DashSet};
use rust_decimal::Decimal;

use crate::error::{Error, Result};
use crate::parser::TokenId;
use crate::store::{
    AppendOutcome, PendingToken, PriceSample, Store, TokenStatePatch, TokenStateRecord,
    TokenStatus, TradeRow, TrustLineRow, WalletRecord,
};

#[derive(Default)]
pub struct MemoryStore {
    trust_lines_by_token: DashMap<String, Vec<TrustLineRow>>,
    trust_lines_by_wallet: DashMap<String, Vec<TrustLineRow>>,
    /// Dedup key: (tx_hash, wallet, token)
    trust_line_keys: DashSet<(String, String, String)>,
    trades_by_wallet: DashMap<String, Vec<TradeRow>>,
    trade_hashes: DashSet<String>,
    token_states: DashMap<String, TokenStateRecord>,
    price_samples: DashMap<String, Vec<PriceSample>>,
    wallets: DashMap<String, WalletRecord>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn touch_wallet(&self, address: &str, timestamp: DateTime<Utc>) {
        let mut record = self
            .wallets
            .entry(address.to_string())
            .or_insert_with(|| WalletRecord {
                address: address.to_string(),
                first_seen: timestamp,
                last_active: timestamp,
                alpha_score: None,
                score_updated: None,
            });
        record.first_seen = record.first_seen.min(timestamp);
        record.last_active = record.last_active.max(timestamp);
    }

    fn state_entry(&self, token: &TokenId) -> dashmap::mapref::one::RefMut<'_, String, TokenStateRecord> {
        self.token_states
            .entry(token.key())
            .or_insert_with(|| TokenStateRecord::new(token.clone(), TokenStatus::Pending, Utc::now()))
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn append_trust_line(&self, row: TrustLineRow) -> Result<AppendOutcome> {
        let key = (row.tx_hash.clone(), row.wallet.clone(), row.token.key());
        if !self.trust_line_keys.insert(key) {
            return Ok(AppendOutcome::Duplicate);
        }

        self.touch_wallet(&row.wallet, row.timestamp);
        self.trust_lines_by_token
            .entry(row.token.key())
            .or_default()
            .push(row.clone());
        self.trust_lines_by_wallet
            .entry(row.wallet.clone())
            .or_default()
            .push(row);
        Ok(AppendOutcome::Ok)
    }

    async fn append_trade(&self, row: TradeRow) -> Result<AppendOutcome> {
        if row.buyer.is_empty() || row.seller.is_empty() {
            return Err(Error::Store("trade without buyer or seller".to_string()));
        }
        if !self.trade_hashes.insert(row.tx_hash.clone()) {
            return Ok(AppendOutcome::Duplicate);
        }

        self.touch_wallet(&row.buyer, row.timestamp);
        self.touch_wallet(&row.seller, row.timestamp);
        self.trades_by_wallet
            .entry(row.buyer.clone())
            .or_default()
            .push(row.clone());
        if row.seller != row.buyer {
            self.trades_by_wallet
                .entry(row.seller.clone())
                .or_default()
                .push(row);
        }
        Ok(AppendOutcome::Ok)
    }

    async fn upsert_token_state(&self, token: &TokenId, patch: TokenStatePatch) -> Result<()> {
        let mut state = self.state_entry(token);
        if let Some(first_seen_tx) = patch.first_seen_tx {
            state.first_seen_tx = Some(first_seen_tx);
        }
        if let Some(trust_lines) = patch.trust_lines {
            state.trust_lines = trust_lines;
        }
        if let Some(trades) = patch.trades {
            state.trades = trades;
        }
        if let Some(total_volume) = patch.total_volume {
            state.total_volume = total_volume;
        }
        if let Some(first_trade_at) = patch.first_trade_at {
            state.first_trade_at = Some(first_trade_at);
        }
        if let Some(creation_date) = patch.creation_date {
            state.creation_date = Some(creation_date);
        }
        if let Some(creator) = patch.creator {
            state.creator = Some(creator);
        }
        if let Some(is_frozen) = patch.is_frozen {
            state.is_frozen = is_frozen;
        }
        if let Some(unique_holders) = patch.unique_holders {
            state.unique_holders = unique_holders;
        }
        if let Some(current_price) = patch.current_price {
            state.current_price = Some(current_price);
        }
        state.last_updated = Utc::now();
        Ok(())
    }

    async fn mark_token(&self, token: &TokenId, status: TokenStatus) -> Result<()> {
        let mut state = self.state_entry(token);
        // too_old is terminal
        if state.status == TokenStatus::TooOld && status != TokenStatus::TooOld {
            return Ok(());
        }
        state.status = status;
        state.last_updated = Utc::now();
        Ok(())
    }

    async fn get_token_state(&self, token: &TokenId) -> Result<Option<TokenStateRecord>> {
        Ok(self.token_states.get(&token.key()).map(|state| state.clone()))
    }

    async fn record_price_sample(
        &self,
        token: &TokenId,
        price: Decimal,
        timestamp: DateTime<Utc>,
    ) -> Result<()> {
        self.price_samples
            .entry(token.key())
            .or_default()
            .push(PriceSample {
                token: token.clone(),
                price,
                timestamp,
            });

        let mut state = self.state_entry(token);
        state.current_price = Some(price);
        if state.first_price.is_none() {
            state.first_price = Some(price);
            state.first_price_at = Some(timestamp);
        }
        state.last_updated = Utc::now();
        Ok(())
    }

    async fn update_max_price_if_higher(
        &self,
        token: &TokenId,
        price: Decimal,
        timestamp: DateTime<Utc>,
    ) -> Result<bool> {
        let mut state = self.state_entry(token);
        if state.max_price.is_some_and(|max| price <= max) {
            return Ok(false);
        }
        state.max_price = Some(price);
        state.max_price_at = Some(timestamp);
        state.last_updated = Utc::now();
        Ok(true)
    }

    async fn get_max_price(&self, token: &TokenId) -> Result<Option<Decimal>> {
        Ok(self
            .token_states
            .get(&token.key())
            .and_then(|state| state.max_price))
    }

    async fn get_active_tokens(
        &self,
        min_age_hours: Option<i64>,
        max_age_hours: Option<i64>,
    ) -> Result<Vec<TokenId>> {
        let now = Utc::now();
        let mut tokens = Vec::new();
        for state in self.token_states.iter() {
            if state.status != TokenStatus::Active {
                continue;
            }
            if min_age_hours.is_some() || max_age_hours.is_some() {
                let Some(created) = state.creation_date else { continue };
                if let Some(min) = min_age_hours {
                    if created > now - Duration::hours(min) {
                        continue;
                    }
                }
                if let Some(max) = max_age_hours {
                    if created < now - Duration::hours(max) {
                        continue;
                    }
                }
            }
            tokens.push(state.token.clone());
        }
        Ok(tokens)
    }

    async fn get_unanalyzed_tokens(&self, cutoff: DateTime<Utc>) -> Result<Vec<PendingToken>> {
        let mut tokens = Vec::new();
        for state in self.token_states.iter() {
            let due = match state.status {
                TokenStatus::Pending => true,
                TokenStatus::Active => state.last_updated < cutoff,
                TokenStatus::TooOld | TokenStatus::Filtered => false,
            };
            if due {
                tokens.push(PendingToken {
                    token: state.token.clone(),
                    first_seen_tx: state.first_seen_tx.clone(),
                });
            }
        }
        Ok(tokens)
    }

    async fn get_wallet_trust_lines(
        &self,
        wallet: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<TrustLineRow>> {
        let mut rows: Vec<TrustLineRow> = self
            .trust_lines_by_wallet
            .get(wallet)
            .map(|rows| rows.clone())
            .unwrap_or_default();
        if let Some(since) = since {
            rows.retain(|row| row.timestamp >= since);
        }
        rows.sort_by_key(|row| row.timestamp);
        Ok(rows)
    }

    async fn get_wallet_trades(
        &self,
        wallet: &str,
        token: Option<&TokenId>,
    ) -> Result<Vec<TradeRow>> {
        let mut rows: Vec<TradeRow> = self
            .trades_by_wallet
            .get(wallet)
            .map(|rows| rows.clone())
            .unwrap_or_default();
        if let Some(token) = token {
            rows.retain(|row| &row.token == token);
        }
        rows.sort_by_key(|row| row.timestamp);
        Ok(rows)
    }

    async fn get_price_history(
        &self,
        token: &TokenId,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Vec<PriceSample>> {
        let mut samples: Vec<PriceSample> = self
            .price_samples
            .get(&token.key())
            .map(|samples| samples.clone())
            .unwrap_or_default();
        if let Some(from) = from {
            samples.retain(|sample| sample.timestamp >= from);
        }
        if let Some(to) = to {
            samples.retain(|sample| sample.timestamp <= to);
        }
        samples.sort_by_key(|sample| sample.timestamp);
        Ok(samples)
    }

    async fn get_active_wallets(&self, since: DateTime<Utc>) -> Result<Vec<String>> {
        Ok(self
            .wallets
            .iter()
            .filter(|record| record.last_active >= since)
            .map(|record| record.address.clone())
            .collect())
    }

    async fn get_trustline_position(
        &self,
        token: &TokenId,
        timestamp: DateTime<Utc>,
    ) -> Result<u64> {
        let earlier = self
            .trust_lines_by_token
            .get(&token.key())
            .map(|rows| {
                rows.iter()
                    .filter(|row| !row.is_removal && row.timestamp < timestamp)
                    .count() as u64
            })
            .unwrap_or(0);
        Ok(earlier + 1)
    }

    async fn update_wallet_alpha_score(
        &self,
        wallet: &str,
        score: Decimal,
        calculated_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut record = self
            .wallets
            .entry(wallet.to_string())
            .or_insert_with(|| WalletRecord {
                address: wallet.to_string(),
                first_seen: calculated_at,
                last_active: calculated_at,
                alpha_score: None,
                score_updated: None,
            });
        record.alpha_score = Some(score);
        record.score_updated = Some(calculated_at);
        Ok(())
    }

    async fn get_top_alpha_wallets(&self, limit: usize) -> Result<Vec<WalletRecord>> {
        let mut scored: Vec<WalletRecord> = self
            .wallets
            .iter()
            .filter(|record| record.alpha_score.is_some())
            .map(|record| record.clone())
            .collect();
        scored.sort_by(|a, b| b.alpha_score.cmp(&a.alpha_score));
        scored.truncate(limit);
        Ok(scored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token() -> TokenId {
        TokenId::new("TST", "rIssuer")
    }

    fn trust_line(hash: &str, wallet: &str, ts: DateTime<Utc>, removal: bool) -> TrustLineRow {
        TrustLineRow {
            token: token(),
            wallet: wallet.to_string(),
            limit: if removal { Decimal::ZERO } else { Decimal::new(1000, 0) },
            tx_hash: hash.to_string(),
            timestamp: ts,
            is_removal: removal,
        }
    }

    fn trade(hash: &str, buyer: &str, seller: &str, ts: DateTime<Utc>) -> TradeRow {
        TradeRow {
            token: token(),
            buyer: buyer.to_string(),
            seller: seller.to_string(),
            amount: Decimal::new(2000, 0),
            delivered_amount: Decimal::new(2000, 0),
            price_native: None,
            tx_hash: hash.to_string(),
            timestamp: ts,
        }
    }

    #[tokio::test]
    async fn test_trust_line_dedup() {
        let store = MemoryStore::new();
        let now = Utc::now();

        let first = store.append_trust_line(trust_line("h1", "w1", now, false)).await.unwrap();
        assert_eq!(first, AppendOutcome::Ok);
        let replay = store.append_trust_line(trust_line("h1", "w1", now, false)).await.unwrap();
        assert_eq!(replay, AppendOutcome::Duplicate);

        // Same hash, different wallet is a distinct event
        let other = store.append_trust_line(trust_line("h1", "w2", now, false)).await.unwrap();
        assert_eq!(other, AppendOutcome::Ok);

        let rows = store.get_wallet_trust_lines("w1", None).await.unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn test_trade_dedup_and_rejects() {
        let store = MemoryStore::new();
        let now = Utc::now();

        assert_eq!(
            store.append_trade(trade("t1", "buyer", "seller", now)).await.unwrap(),
            AppendOutcome::Ok
        );
        assert_eq!(
            store.append_trade(trade("t1", "buyer", "seller", now)).await.unwrap(),
            AppendOutcome::Duplicate
        );
        assert!(store.append_trade(trade("t2", "", "seller", now)).await.is_err());

        assert_eq!(store.get_wallet_trades("buyer", None).await.unwrap().len(), 1);
        assert_eq!(store.get_wallet_trades("seller", None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_too_old_is_terminal() {
        let store = MemoryStore::new();
        store.mark_token(&token(), TokenStatus::TooOld).await.unwrap();
        store.mark_token(&token(), TokenStatus::Active).await.unwrap();
        store.mark_token(&token(), TokenStatus::Pending).await.unwrap();

        let state = store.get_token_state(&token()).await.unwrap().unwrap();
        assert_eq!(state.status, TokenStatus::TooOld);
    }

    #[tokio::test]
    async fn test_max_price_only_rises() {
        let store = MemoryStore::new();
        let now = Utc::now();

        assert!(store.update_max_price_if_higher(&token(), Decimal::new(10, 0), now).await.unwrap());
        assert!(!store.update_max_price_if_higher(&token(), Decimal::new(5, 0), now).await.unwrap());
        assert!(store.update_max_price_if_higher(&token(), Decimal::new(12, 0), now).await.unwrap());
        assert_eq!(store.get_max_price(&token()).await.unwrap(), Some(Decimal::new(12, 0)));
    }

    #[tokio::test]
    async fn test_price_samples_set_first_and_current() {
        let store = MemoryStore::new();
        let now = Utc::now();

        store.record_price_sample(&token(), Decimal::new(3, 0), now).await.unwrap();
        store.record_price_sample(&token(), Decimal::new(7, 0), now + Duration::seconds(5)).await.unwrap();

        let state = store.get_token_state(&token()).await.unwrap().unwrap();
        assert_eq!(state.first_price, Some(Decimal::new(3, 0)));
        assert_eq!(state.current_price, Some(Decimal::new(7, 0)));

        let history = store.get_price_history(&token(), None, None).await.unwrap();
        assert_eq!(history.len(), 2);
        assert!(history[0].timestamp < history[1].timestamp);
    }

    #[tokio::test]
    async fn test_trustline_position_excludes_removals() {
        let store = MemoryStore::new();
        let base = Utc::now();

        for i in 0..3 {
            let ts = base + Duration::seconds(i);
            store
                .append_trust_line(trust_line(&format!("h{}", i), &format!("w{}", i), ts, false))
                .await
                .unwrap();
        }
        store
            .append_trust_line(trust_line("hr", "w0", base + Duration::seconds(3), true))
            .await
            .unwrap();

        let position = store
            .get_trustline_position(&token(), base + Duration::seconds(10))
            .await
            .unwrap();
        assert_eq!(position, 4);

        let early = store.get_trustline_position(&token(), base).await.unwrap();
        assert_eq!(early, 1);
    }

    #[tokio::test]
    async fn test_unanalyzed_tokens() {
        let store = MemoryStore::new();
        let stale_token = TokenId::new("OLD", "rIss1");
        let fresh_token = TokenId::new("NEW", "rIss2");
        let pending_token = TokenId::new("PND", "rIss3");

        store.mark_token(&stale_token, TokenStatus::Active).await.unwrap();
        store.mark_token(&fresh_token, TokenStatus::Active).await.unwrap();
        store.mark_token(&pending_token, TokenStatus::Pending).await.unwrap();

        // Everything was touched just now; only pending is due
        let due = store.get_unanalyzed_tokens(Utc::now() - Duration::hours(24)).await.unwrap();
        let keys: Vec<String> = due.iter().map(|p| p.token.key()).collect();
        assert_eq!(keys, vec![pending_token.key()]);

        // With a future cutoff both active tokens are due as well
        let due = store.get_unanalyzed_tokens(Utc::now() + Duration::hours(1)).await.unwrap();
        assert_eq!(due.len(), 3);
    }

    #[tokio::test]
    async fn test_active_wallets_window() {
        let store = MemoryStore::new();
        let now = Utc::now();

        store.append_trust_line(trust_line("h1", "recent", now, false)).await.unwrap();
        store
            .append_trust_line(trust_line("h2", "stale", now - Duration::days(60), false))
            .await
            .unwrap();
        store.append_trade(trade("t1", "trader", "counter", now)).await.unwrap();

        let mut active = store.get_active_wallets(now - Duration::days(30)).await.unwrap();
        active.sort();
        assert_eq!(active, vec!["counter", "recent", "trader"]);
    }

    #[tokio::test]
    async fn test_top_alpha_wallets_sorted() {
        let store = MemoryStore::new();
        let now = Utc::now();

        store.update_wallet_alpha_score("w_low", Decimal::new(71, 1), now).await.unwrap();
        store.update_wallet_alpha_score("w_high", Decimal::new(92, 1), now).await.unwrap();
        store.update_wallet_alpha_score("w_mid", Decimal::new(80, 1), now).await.unwrap();

        let top = store.get_top_alpha_wallets(2).await.unwrap();
        let addresses: Vec<&str> = top.iter().map(|record| record.address.as_str()).collect();
        assert_eq!(addresses, vec!["w_high", "w_mid"]);
    }
}
