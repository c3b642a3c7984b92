//! Wallet alpha scoring
//!
//! Batch analytic over recently-active wallets. A wallet's score weighs how
//! often it is among the first trust lines of a token (40%), how often its
//! entries reached the ROI bar against the token's max price (40%), and how
//! regular its activity cadence is (20%). High scorers are written to the
//! alpha file, best first.

use chrono::{Duration as ChronoDuration, Utc};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::AnalyticsConfig;
use crate::error::Result;
use crate::store::{Store, TradeRow, TrustLineRow};

/// Scores at or above this land in the alpha file
const ALPHA_THRESHOLD: Decimal = Decimal::from_parts(7, 0, 0, false, 0);
/// One week of hour-gaps; the spread that zeroes the consistency component
const MAX_EXPECTED_GAP_STDDEV_HOURS: f64 = 168.0;
/// Entry price is the average of a wallet's first buys for a token
const ENTRY_TRADES: usize = 3;

pub struct WalletScorer {
    store: Arc<dyn Store>,
    scoring_interval: Duration,
    active_window: ChronoDuration,
    min_trades: usize,
    min_roi: Decimal,
    early_adopter_max: u64,
    alpha_file: PathBuf,
}

impl WalletScorer {
    pub fn new(config: &AnalyticsConfig, store: Arc<dyn Store>) -> Self {
        Self {
            store,
            scoring_interval: Duration::from_secs(config.scoring_interval_seconds),
            active_window: ChronoDuration::days(config.active_window_days),
            min_trades: config.min_trades,
            min_roi: config.min_roi,
            early_adopter_max: config.early_adopter_max,
            alpha_file: PathBuf::from(&config.alpha_file),
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        info!("Starting wallet scorer");
        loop {
            if let Err(e) = self.run_cycle().await {
                error!("Scoring cycle failed: {}", e);
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep(self.scoring_interval) => {}
            }
        }
        info!("Wallet scorer stopped");
    }

    /// Score every recently-active wallet and rewrite the alpha file.
    /// Returns the alpha wallets, best first.
    pub async fn run_cycle(&self) -> Result<Vec<(String, Decimal)>> {
        let since = Utc::now() - self.active_window;
        let wallets = self.store.get_active_wallets(since).await?;
        info!("Scoring {} active wallets", wallets.len());

        let mut alpha = Vec::new();
        for wallet in wallets {
            match self.score_wallet(&wallet).await {
                Ok(Some(score)) => {
                    debug!("Wallet {} scored {}", wallet, score);
                    if score >= ALPHA_THRESHOLD {
                        info!("High performer: {} scored {}", wallet, score);
                        alpha.push((wallet, score));
                    }
                }
                Ok(None) => debug!("Wallet {} skipped (too few trust lines)", wallet),
                Err(e) => error!("Failed to score {}: {}", wallet, e),
            }
        }

        alpha.sort_by(|a, b| b.1.cmp(&a.1));
        self.write_alpha_file(&alpha)?;
        info!("Saved {} alpha wallets to {}", alpha.len(), self.alpha_file.display());
        Ok(alpha)
    }

    /// A wallet's score in [0, 10]; `None` when it has too few trust lines
    pub async fn score_wallet(&self, wallet: &str) -> Result<Option<Decimal>> {
        let trust_lines = self.store.get_wallet_trust_lines(wallet, None).await?;
        let established: Vec<TrustLineRow> = trust_lines
            .into_iter()
            .filter(|row| !row.is_removal)
            .collect();
        if established.len() < self.min_trades {
            return Ok(None);
        }

        // First establishment per distinct token
        let mut first_per_token: HashMap<String, &TrustLineRow> = HashMap::new();
        for row in &established {
            first_per_token.entry(row.token.key()).or_insert(row);
        }
        let total_tokens = first_per_token.len() as u64;

        let mut early_adoptions = 0u64;
        for row in first_per_token.values() {
            let position = self
                .store
                .get_trustline_position(&row.token, row.timestamp)
                .await?;
            if position <= self.early_adopter_max {
                early_adoptions += 1;
            }
        }

        let successful_trades = self.successful_trades(wallet).await?;
        let consistency = consistency_score(&established);

        let early_rate = Decimal::from(early_adoptions) / Decimal::from(total_tokens);
        let success_rate =
            Decimal::from(successful_trades.min(total_tokens)) / Decimal::from(total_tokens);

        // 40% early adoption, 40% trading success, 20% consistency
        let score = early_rate * Decimal::new(4, 0)
            + success_rate * Decimal::new(4, 0)
            + consistency * Decimal::new(2, 0);
        let score = score.min(Decimal::new(10, 0)).max(Decimal::ZERO);

        self.store
            .update_wallet_alpha_score(wallet, score, Utc::now())
            .await?;
        Ok(Some(score))
    }

    /// Tokens where the wallet's entry reached the ROI bar against the
    /// token's max observed price
    async fn successful_trades(&self, wallet: &str) -> Result<u64> {
        let trades = self.store.get_wallet_trades(wallet, None).await?;
        let mut by_token: HashMap<String, Vec<&TradeRow>> = HashMap::new();
        for trade in &trades {
            by_token.entry(trade.token.key()).or_default().push(trade);
        }

        let mut successes = 0u64;
        for rows in by_token.values() {
            let token = &rows[0].token;
            let Some(max_price) = self.store.get_max_price(token).await? else {
                continue;
            };

            // Rows arrive oldest first; entry price averages the first buys
            let entry_prices: Vec<Decimal> = rows
                .iter()
                .filter(|row| row.buyer == wallet)
                .filter_map(|row| row.price_native)
                .take(ENTRY_TRADES)
                .collect();
            if entry_prices.is_empty() {
                continue;
            }
            let entry: Decimal = entry_prices.iter().sum::<Decimal>()
                / Decimal::from(entry_prices.len() as u64);
            if entry.is_zero() {
                continue;
            }

            let roi = (max_price - entry) / entry;
            if roi >= self.min_roi {
                successes += 1;
            }
        }
        Ok(successes)
    }

    fn write_alpha_file(&self, alpha: &[(String, Decimal)]) -> Result<()> {
        let mut contents = String::from("PUBLIC_ADDRESS,SCORE\n");
        for (wallet, score) in alpha {
            contents.push_str(&format!("{},{:.2}\n", wallet, score));
        }
        std::fs::write(&self.alpha_file, contents)?;
        Ok(())
    }
}

/// Regularity of activity in [0, 1]: 1 for perfectly even hour-gaps between
/// trust-line events, falling to 0 as the gap spread reaches one week
fn consistency_score(rows: &[TrustLineRow]) -> Decimal {
    if rows.len() < 2 {
        return Decimal::ZERO;
    }
    let mut timestamps: Vec<_> = rows.iter().map(|row| row.timestamp).collect();
    timestamps.sort();

    let gaps: Vec<f64> = timestamps
        .windows(2)
        .map(|pair| (pair[1] - pair[0]).num_seconds() as f64 / 3600.0)
        .collect();

    let mean = gaps.iter().sum::<f64>() / gaps.len() as f64;
    let variance = gaps.iter().map(|gap| (gap - mean).powi(2)).sum::<f64>() / gaps.len() as f64;
    let stddev = variance.sqrt();

    let consistency = 1.0 - (stddev / MAX_EXPECTED_GAP_STDDEV_HOURS).min(1.0);
    Decimal::from_f64(consistency).unwrap_or(Decimal::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::TokenId;
    use crate::store::MemoryStore;
    use chrono::{DateTime, Utc};

    fn trust_line(token: &TokenId, wallet: &str, hash: &str, ts: DateTime<Utc>) -> TrustLineRow {
        TrustLineRow {
            token: token.clone(),
            wallet: wallet.to_string(),
            limit: Decimal::new(1000, 0),
            tx_hash: hash.to_string(),
            timestamp: ts,
            is_removal: false,
        }
    }

    fn trade(
        token: &TokenId,
        buyer: &str,
        hash: &str,
        price: Decimal,
        ts: DateTime<Utc>,
    ) -> TradeRow {
        TradeRow {
            token: token.clone(),
            buyer: buyer.to_string(),
            seller: "rCounter".to_string(),
            amount: Decimal::new(2000, 0),
            delivered_amount: Decimal::new(2000, 0),
            price_native: Some(price),
            tx_hash: hash.to_string(),
            timestamp: ts,
        }
    }

    fn scorer(store: Arc<MemoryStore>, alpha_file: PathBuf) -> WalletScorer {
        let config = AnalyticsConfig {
            alpha_file: alpha_file.to_string_lossy().into_owned(),
            ..AnalyticsConfig::default()
        };
        WalletScorer::new(&config, store as Arc<dyn Store>)
    }

    /// 10 trust lines an hour apart, 8 early, 6 winning entries: 7.6
    #[tokio::test]
    async fn test_alpha_scoring_end_to_end() {
        let store = Arc::new(MemoryStore::new());
        let dir = tempfile::tempdir().unwrap();
        let alpha_path = dir.path().join("alpha_wallets.txt");
        let wallet = "rAlphaWallet";
        let base = Utc::now() - ChronoDuration::days(2);

        let tokens: Vec<TokenId> = (0..10)
            .map(|i| TokenId::new(format!("T{:02}", i), "rIssuer"))
            .collect();

        // Two tokens already have ten earlier trust lines, pushing the
        // wallet's position past the early-adopter cutoff
        for (t, token) in tokens.iter().enumerate().skip(8) {
            for i in 0..10 {
                store
                    .append_trust_line(trust_line(
                        token,
                        &format!("rCrowd{}_{}", t, i),
                        &format!("crowd_{}_{}", t, i),
                        base - ChronoDuration::hours(1),
                    ))
                    .await
                    .unwrap();
            }
        }

        // The wallet's lines, exactly one hour apart (stddev 0)
        for (i, token) in tokens.iter().enumerate() {
            store
                .append_trust_line(trust_line(
                    token,
                    wallet,
                    &format!("tl_{}", i),
                    base + ChronoDuration::hours(i as i64),
                ))
                .await
                .unwrap();
        }

        // Six tokens bought at 1.0 that later reached 3.0 (ROI 2.0)
        for (i, token) in tokens.iter().enumerate().take(6) {
            store
                .append_trade(trade(
                    token,
                    wallet,
                    &format!("tr_{}", i),
                    Decimal::ONE,
                    base + ChronoDuration::hours(i as i64),
                ))
                .await
                .unwrap();
            store
                .update_max_price_if_higher(token, Decimal::new(3, 0), Utc::now())
                .await
                .unwrap();
        }

        let scorer = scorer(store.clone(), alpha_path.clone());
        let score = scorer.score_wallet(wallet).await.unwrap().unwrap();
        assert_eq!(score, "7.6".parse().unwrap());

        let alpha = scorer.run_cycle().await.unwrap();
        assert_eq!(alpha.len(), 1);
        assert_eq!(alpha[0].0, wallet);

        let contents = std::fs::read_to_string(&alpha_path).unwrap();
        let mut lines = contents.lines();
        assert_eq!(lines.next(), Some("PUBLIC_ADDRESS,SCORE"));
        assert_eq!(lines.next(), Some("rAlphaWallet,7.60"));
    }

    #[tokio::test]
    async fn test_too_few_trust_lines_skipped() {
        let store = Arc::new(MemoryStore::new());
        let dir = tempfile::tempdir().unwrap();
        let token = TokenId::new("TST", "rIssuer");
        for i in 0..4 {
            store
                .append_trust_line(trust_line(
                    &token,
                    "rSmall",
                    &format!("h{}", i),
                    Utc::now(),
                ))
                .await
                .unwrap();
        }

        let scorer = scorer(store, dir.path().join("alpha.txt"));
        assert_eq!(scorer.score_wallet("rSmall").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_entry_price_averages_first_three_buys() {
        let store = Arc::new(MemoryStore::new());
        let dir = tempfile::tempdir().unwrap();
        let token = TokenId::new("AVG", "rIssuer");
        let wallet = "rTrader";
        let base = Utc::now() - ChronoDuration::days(1);

        for i in 0..5 {
            store
                .append_trust_line(trust_line(
                    &TokenId::new(format!("F{}", i), "rIssuer"),
                    wallet,
                    &format!("fl_{}", i),
                    base + ChronoDuration::hours(i as i64),
                ))
                .await
                .unwrap();
        }
        // Buys at 1, 2, 3 (entry 2), then a late expensive buy that must be
        // ignored
        for (i, price) in [1i64, 2, 3, 100].iter().enumerate() {
            store
                .append_trade(trade(
                    &token,
                    wallet,
                    &format!("b{}", i),
                    Decimal::new(*price, 0),
                    base + ChronoDuration::minutes(i as i64),
                ))
                .await
                .unwrap();
        }
        store
            .update_max_price_if_higher(&token, Decimal::new(6, 0), Utc::now())
            .await
            .unwrap();

        let scorer = scorer(store, dir.path().join("alpha.txt"));
        // Entry 2, max 6: ROI (6-2)/2 = 2.0, exactly at the bar
        assert_eq!(scorer.successful_trades(wallet).await.unwrap(), 1);
    }

    #[test]
    fn test_consistency_extremes() {
        let token = TokenId::new("TST", "rIssuer");
        let base = Utc::now();

        let even: Vec<TrustLineRow> = (0..5)
            .map(|i| trust_line(&token, "w", &format!("h{}", i), base + ChronoDuration::hours(i)))
            .collect();
        assert_eq!(consistency_score(&even), Decimal::ONE);

        // Gaps spread out over weeks zero the component
        let wild: Vec<TrustLineRow> = [0i64, 1, 400, 401, 1200]
            .iter()
            .map(|h| trust_line(&token, "w", &format!("g{}", h), base + ChronoDuration::hours(*h)))
            .collect();
        assert_eq!(consistency_score(&wild), Decimal::ZERO);

        assert_eq!(consistency_score(&even[..1]), Decimal::ZERO);
    }
}
