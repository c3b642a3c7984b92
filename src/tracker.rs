//! Token state tracking
//!
//! Consumes classified events and maintains the in-memory per-token state
//! plus the hot set. Hotness latches: once a token reaches the trust-line
//! threshold it stays hot even if lines are removed later. State is
//! periodically serialized to a JSON snapshot for observability and crash
//! recovery; the store remains the source of truth.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::MonitoringConfig;
use crate::controller::StatsHandle;
use crate::error::Result;
use crate::monitor::MonitorEvent;
use crate::parser::{ParsedTransaction, PaymentEvent, TokenId, TrustSetEvent, TxParser};
use crate::store::{
    AppendOutcome, Store, TokenStatePatch, TokenStatus, TradeRow, TrustLineRow,
};

/// In-memory state for one token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackedToken {
    pub currency: String,
    pub issuer: String,
    pub first_seen: DateTime<Utc>,
    pub trust_lines: u64,
    pub trades: u64,
    pub total_volume: Decimal,
    pub first_trade_at: Option<DateTime<Utc>>,
    /// Known too-old token: tracked so we recognize it, never counted
    #[serde(skip)]
    pub filtered: bool,
}

/// On-disk snapshot shape
#[derive(Debug, Serialize, Deserialize)]
pub struct Snapshot {
    pub timestamp: DateTime<Utc>,
    pub tokens: BTreeMap<String, TrackedToken>,
    pub hot_tokens: Vec<String>,
}

/// Tracks per-token state; owned by a single consumer task
pub struct TokenTracker {
    hot_threshold: u64,
    snapshot_path: PathBuf,
    save_interval: Duration,
    store: Arc<dyn Store>,
    tokens: HashMap<String, TrackedToken>,
    hot_tokens: HashSet<String>,
}

impl TokenTracker {
    pub fn new(config: &MonitoringConfig, store: Arc<dyn Store>) -> Self {
        Self {
            hot_threshold: config.min_trust_lines as u64,
            snapshot_path: PathBuf::from(&config.data_file),
            save_interval: Duration::from_secs(config.save_interval_minutes * 60),
            store,
            tokens: HashMap::new(),
            hot_tokens: HashSet::new(),
        }
    }

    /// Restore state from the snapshot file if one exists. Restoration only;
    /// the store stays authoritative for token status.
    pub fn restore_snapshot(&mut self) {
        match std::fs::read_to_string(&self.snapshot_path) {
            Ok(raw) => match serde_json::from_str::<Snapshot>(&raw) {
                Ok(snapshot) => {
                    info!(
                        "Loaded snapshot with {} tokens ({} hot) from {}",
                        snapshot.tokens.len(),
                        snapshot.hot_tokens.len(),
                        self.snapshot_path.display()
                    );
                    self.tokens = snapshot.tokens.into_iter().collect();
                    self.hot_tokens = snapshot.hot_tokens.into_iter().collect();
                }
                Err(e) => warn!("Ignoring unreadable snapshot: {}", e),
            },
            Err(_) => {
                info!(
                    "No snapshot at {}, starting fresh",
                    self.snapshot_path.display()
                );
            }
        }
    }

    pub fn save_interval(&self) -> Duration {
        self.save_interval
    }

    pub fn is_hot(&self, token: &TokenId) -> bool {
        self.hot_tokens.contains(&token.key())
    }

    pub fn trust_lines(&self, token: &TokenId) -> u64 {
        self.tokens
            .get(&token.key())
            .map(|state| state.trust_lines)
            .unwrap_or(0)
    }

    pub async fn handle_trust_set(&mut self, event: &TrustSetEvent) {
        if event.is_removal {
            self.handle_trust_line_removal(event).await;
        } else {
            self.handle_trust_line_established(event).await;
        }
    }

    async fn handle_trust_line_established(&mut self, event: &TrustSetEvent) {
        let key = event.token.key();

        if let Some(state) = self.tokens.get(&key) {
            if state.filtered {
                debug!("Ignoring trust line for filtered token {}", event.token);
                return;
            }
        } else {
            // First sighting: a token already ruled too old enters as filtered
            let known_too_old = matches!(
                self.store.get_token_state(&event.token).await,
                Ok(Some(state)) if state.status == TokenStatus::TooOld
            );
            if known_too_old {
                debug!("Token {} is too old, tracking as filtered", event.token);
                self.tokens.insert(key, filtered_state(event));
                return;
            }

            if !self.persist_trust_line(event).await {
                return;
            }
            self.tokens.insert(
                key,
                TrackedToken {
                    currency: event.token.currency.clone(),
                    issuer: event.token.issuer.clone(),
                    first_seen: event.timestamp,
                    trust_lines: 1,
                    trades: 0,
                    total_volume: Decimal::ZERO,
                    first_trade_at: None,
                    filtered: false,
                },
            );
            if let Err(e) = self.store.mark_token(&event.token, TokenStatus::Pending).await {
                error!("Failed to mark {} for analysis: {}", event.token, e);
            }
            self.patch_store(
                &event.token,
                TokenStatePatch {
                    first_seen_tx: Some(event.tx_hash.clone()),
                    trust_lines: Some(1),
                    ..Default::default()
                },
            )
            .await;
            info!(
                "New token discovered: {} (first trust line limit {})",
                event.token, event.limit
            );
            return;
        }

        if !self.persist_trust_line(event).await {
            return;
        }
        let Some(state) = self.tokens.get_mut(&key) else { return };
        state.trust_lines += 1;
        let trust_lines = state.trust_lines;
        let first_seen = state.first_seen;
        self.patch_store(
            &event.token,
            TokenStatePatch {
                trust_lines: Some(trust_lines),
                ..Default::default()
            },
        )
        .await;

        if trust_lines == self.hot_threshold {
            self.hot_tokens.insert(key);
            let time_to_hot = event.timestamp - first_seen;
            info!(
                "Token {} reached {} trust lines in {} (now hot)",
                event.token, trust_lines, time_to_hot
            );
        }
    }

    async fn handle_trust_line_removal(&mut self, event: &TrustSetEvent) {
        let key = event.token.key();
        let Some(state) = self.tokens.get(&key) else {
            return;
        };
        if state.filtered {
            return;
        }
        if !self.persist_trust_line(event).await {
            return;
        }

        let Some(state) = self.tokens.get_mut(&key) else { return };
        state.trust_lines = state.trust_lines.saturating_sub(1);
        let trust_lines = state.trust_lines;
        self.patch_store(
            &event.token,
            TokenStatePatch {
                trust_lines: Some(trust_lines),
                ..Default::default()
            },
        )
        .await;
        // Hotness is latching: removal never shrinks the hot set
        info!(
            "Trust line removed for {} ({} remaining)",
            event.token, trust_lines
        );
    }

    pub async fn handle_payment(&mut self, event: &PaymentEvent) {
        let key = event.token.key();
        let Some(state) = self.tokens.get(&key) else {
            return;
        };
        if state.filtered {
            return;
        }

        // Persist first; a store failure loses the row from the analytic
        // view but the live counters still advance
        let price_native = match self.store.get_token_state(&event.token).await {
            Ok(Some(record)) => record.current_price,
            _ => None,
        };
        match self
            .store
            .append_trade(TradeRow {
                token: event.token.clone(),
                buyer: event.buyer.clone(),
                seller: event.seller.clone(),
                amount: event.amount,
                delivered_amount: event.delivered_amount,
                price_native,
                tx_hash: event.tx_hash.clone(),
                timestamp: event.timestamp,
            })
            .await
        {
            Ok(AppendOutcome::Duplicate) => {
                debug!("Duplicate trade {} ignored", event.tx_hash);
                return;
            }
            Ok(AppendOutcome::Ok) => {}
            Err(e) => error!("Failed to persist trade {}: {}", event.tx_hash, e),
        }

        let Some(state) = self.tokens.get_mut(&key) else { return };
        state.trades += 1;
        state.total_volume += event.delivered_amount;
        let mut first_trade_logged = false;
        if state.first_trade_at.is_none() {
            state.first_trade_at = Some(event.timestamp);
            first_trade_logged = true;
        }
        let patch = TokenStatePatch {
            trades: Some(state.trades),
            total_volume: Some(state.total_volume),
            first_trade_at: state.first_trade_at,
            ..Default::default()
        };
        let (trades, total_volume, first_seen) =
            (state.trades, state.total_volume, state.first_seen);
        self.patch_store(&event.token, patch).await;

        if first_trade_logged {
            info!(
                "First trade for {}: {} ({} after first trust line)",
                event.token,
                event.delivered_amount,
                event.timestamp - first_seen
            );
        }
        if self.hot_tokens.contains(&key) {
            info!(
                "Hot token {} traded: volume {} over {} trades",
                event.token, total_volume, trades
            );
        }
    }

    /// Append the row; false means the event was a duplicate and must not be
    /// counted again
    async fn persist_trust_line(&self, event: &TrustSetEvent) -> bool {
        match self
            .store
            .append_trust_line(TrustLineRow {
                token: event.token.clone(),
                wallet: event.wallet.clone(),
                limit: event.limit,
                tx_hash: event.tx_hash.clone(),
                timestamp: event.timestamp,
                is_removal: event.is_removal,
            })
            .await
        {
            Ok(AppendOutcome::Ok) => true,
            Ok(AppendOutcome::Duplicate) => {
                debug!("Duplicate trust line {} ignored", event.tx_hash);
                false
            }
            Err(e) => {
                // Counters still advance; the row is lost from the store
                error!("Failed to persist trust line {}: {}", event.tx_hash, e);
                true
            }
        }
    }

    async fn patch_store(&self, token: &TokenId, patch: TokenStatePatch) {
        if let Err(e) = self.store.upsert_token_state(token, patch).await {
            error!("Failed to update state for {}: {}", token, e);
        }
    }

    /// Current snapshot; filtered tokens are omitted
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            timestamp: Utc::now(),
            tokens: self
                .tokens
                .iter()
                .filter(|(_, state)| !state.filtered)
                .map(|(key, state)| (key.clone(), state.clone()))
                .collect(),
            hot_tokens: {
                let mut hot: Vec<String> = self.hot_tokens.iter().cloned().collect();
                hot.sort();
                hot
            },
        }
    }

    pub fn save_snapshot(&self) -> Result<()> {
        self.save_snapshot_to(&self.snapshot_path)
    }

    fn save_snapshot_to(&self, path: &Path) -> Result<()> {
        let snapshot = self.snapshot();
        std::fs::write(path, serde_json::to_string_pretty(&snapshot)?)?;
        info!("Saved snapshot with {} tokens", snapshot.tokens.len());
        Ok(())
    }

    pub fn log_summary(&self) {
        let tracked = self.tokens.values().filter(|state| !state.filtered).count();
        let traded = self
            .tokens
            .values()
            .filter(|state| !state.filtered && state.trades > 0)
            .count();
        info!(
            "Final statistics: {} tokens discovered, {} hot, {} traded",
            tracked,
            self.hot_tokens.len(),
            traded
        );
    }

    /// Consumer loop: frames in transport order, periodic snapshots
    pub async fn run(
        mut self,
        mut events: mpsc::Receiver<MonitorEvent>,
        parser: TxParser,
        stats: StatsHandle,
        cancel: CancellationToken,
    ) {
        let mut save_timer = interval(self.save_interval);
        save_timer.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = save_timer.tick() => {
                    if let Err(e) = self.save_snapshot() {
                        error!("Snapshot save failed: {}", e);
                    }
                }
                event = events.recv() => {
                    let Some(event) = event else { break };
                    match event {
                        MonitorEvent::Frame(frame) => {
                            if frame.is_validated_transaction() {
                                stats.record_transaction();
                            }
                            match parser.parse(&frame) {
                                ParsedTransaction::TrustSet(trust_set) => {
                                    self.handle_trust_set(&trust_set).await;
                                }
                                ParsedTransaction::Payment(payment) => {
                                    self.handle_payment(&payment).await;
                                }
                                ParsedTransaction::Other
                                | ParsedTransaction::Unvalidated
                                | ParsedTransaction::Error => {}
                            }
                        }
                        MonitorEvent::Failed(reason) => stats.record_error(&reason),
                        MonitorEvent::Connected
                        | MonitorEvent::Subscribed
                        | MonitorEvent::Disconnected => {}
                    }
                }
            }
        }

        if let Err(e) = self.save_snapshot() {
            error!("Final snapshot save failed: {}", e);
        }
        self.log_summary();
    }
}

fn filtered_state(event: &TrustSetEvent) -> TrackedToken {
    TrackedToken {
        currency: event.token.currency.clone(),
        issuer: event.token.issuer.clone(),
        first_seen: event.timestamp,
        trust_lines: 0,
        trades: 0,
        total_volume: Decimal::ZERO,
        first_trade_at: None,
        filtered: true,
    }
}
