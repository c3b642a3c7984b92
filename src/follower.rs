//! Trust-line follower
//!
//! Watches the target account's stream and mirrors every trust-line opening
//! on the controlled account, clamping the limit into the configured band.
//! At most one submission is in flight per token; duplicate frames arriving
//! before the first submission completes are dropped. In test mode the
//! submission is simulated and nothing is written to the ledger.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::TradingConfig;
use crate::controller::StatsHandle;
use crate::error::{Error, Result};
use crate::ledger::rpc::{submit_and_wait, LedgerRpc};
use crate::monitor::MonitorEvent;
use crate::parser::{ParsedTransaction, TrustSetEvent, TxParser};
use crate::wallet::signer::{IssuedAmount, PaymentTx, TrustSetTx};
use crate::wallet::Wallet;

/// Standard transaction fee in drops
const FEE_DROPS: u64 = 12;
/// How long to wait for ledger validation of a submission
const VALIDATION_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Clone)]
pub struct Follower {
    target_wallet: String,
    wallet: Arc<Wallet>,
    trading: TradingConfig,
    rpc: Arc<dyn LedgerRpc>,
    stats: StatsHandle,
    test_mode: bool,
    parser: TxParser,
    /// Tokens with a submission in flight
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl Follower {
    pub fn new(
        target_wallet: String,
        wallet: Arc<Wallet>,
        trading: TradingConfig,
        rpc: Arc<dyn LedgerRpc>,
        stats: StatsHandle,
        test_mode: bool,
    ) -> Self {
        if test_mode {
            info!("Test mode enabled: trust lines will be simulated, not submitted");
        }
        Self {
            target_wallet,
            wallet,
            trading,
            rpc,
            stats,
            test_mode,
            parser: TxParser::new(Decimal::ZERO),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Consume frames from the follower's account subscription
    pub async fn run(self, mut events: mpsc::Receiver<MonitorEvent>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => {
                    let Some(event) = event else { break };
                    match event {
                        MonitorEvent::Frame(frame) => {
                            if let ParsedTransaction::TrustSet(trust_set) = self.parser.parse(&frame) {
                                self.on_trust_set(trust_set).await;
                            }
                        }
                        MonitorEvent::Failed(reason) => self.stats.record_error(&reason),
                        MonitorEvent::Connected
                        | MonitorEvent::Subscribed
                        | MonitorEvent::Disconnected => {}
                    }
                }
            }
        }
        info!("Follower stopped");
    }

    async fn on_trust_set(&self, event: TrustSetEvent) {
        if event.wallet != self.target_wallet || event.is_removal {
            return;
        }

        let key = event.token.key();
        {
            let mut in_flight = self.in_flight.lock().await;
            if !in_flight.insert(key.clone()) {
                debug!("Submission already in flight for {}, dropping frame", event.token);
                return;
            }
        }

        // Submissions run concurrently with frame consumption; the in-flight
        // set keeps them unique per token
        let follower = self.clone();
        tokio::spawn(async move {
            if let Err(e) = follower.mirror_trust_line(&event).await {
                error!("Failed to mirror trust line for {}: {}", event.token, e);
                follower.stats.record_error(&e.to_string());
            }
            follower.in_flight.lock().await.remove(&key);
        });
    }

    /// Mirror one observed trust-line opening
    pub(crate) async fn mirror_trust_line(&self, event: &TrustSetEvent) -> Result<()> {
        let limit = clamp_limit(
            event.limit,
            self.trading.min_trust_line_amount,
            self.trading.max_trust_line_amount,
        );
        info!(
            "Target wallet opened a trust line: {} limit {} (mirroring with {})",
            event.token, event.limit, limit
        );

        if self.test_mode {
            info!(
                "TEST MODE: would set trust line for {} with limit {}",
                event.token, limit
            );
            self.stats
                .record_trust_line(format!("TrustSet {} limit {} (simulated)", event.token, limit));
            return Ok(());
        }

        let account = self.rpc.account_info(self.wallet.classic_address()).await?;
        let signed = TrustSetTx {
            sequence: account.sequence,
            fee_drops: FEE_DROPS,
            limit_amount: IssuedAmount {
                currency: event.token.currency.clone(),
                issuer: event.token.issuer.clone(),
                value: limit,
            },
        }
        .sign(&self.wallet)?;

        let result = submit_and_wait(
            self.rpc.as_ref(),
            &signed.tx_blob,
            &signed.hash,
            VALIDATION_TIMEOUT,
        )
        .await?;
        if result != "tesSUCCESS" {
            return Err(Error::Submission(result));
        }

        info!("Trust line set for {}: {}", event.token, result);
        self.stats
            .record_trust_line(format!("TrustSet {} limit {}", event.token, limit));

        if self.trading.auto_purchase_on_trust {
            if let Err(e) = self.make_initial_purchase(event).await {
                // The trust line stands; the purchase is best effort
                error!("Initial purchase for {} failed: {}", event.token, e);
                self.stats.record_error(&e.to_string());
            }
        }
        Ok(())
    }

    /// Small partial-payment purchase right after the trust line
    async fn make_initial_purchase(&self, event: &TrustSetEvent) -> Result<()> {
        let amount = self.trading.initial_purchase_amount;
        if self.test_mode {
            info!(
                "TEST MODE: would purchase {} {} via the order book",
                amount, event.token
            );
            return Ok(());
        }
        info!("Attempting purchase of {} {}", amount, event.token);

        let slippage = self.trading.slippage_percent / Decimal::new(100, 0);
        let deliver_min = amount * (Decimal::ONE - slippage);
        let send_max_drops = (self.trading.send_max_native * Decimal::new(1_000_000, 0))
            .trunc()
            .to_u64()
            .ok_or_else(|| Error::Signing("send_max_native out of range".to_string()))?;

        let account = self.rpc.account_info(self.wallet.classic_address()).await?;
        let signed = PaymentTx {
            sequence: account.sequence,
            fee_drops: FEE_DROPS,
            destination: self.wallet.classic_address().to_string(),
            amount: IssuedAmount {
                currency: event.token.currency.clone(),
                issuer: event.token.issuer.clone(),
                value: amount,
            },
            send_max_drops,
            deliver_min: IssuedAmount {
                currency: event.token.currency.clone(),
                issuer: event.token.issuer.clone(),
                value: deliver_min,
            },
        }
        .sign(&self.wallet)?;

        let result = submit_and_wait(
            self.rpc.as_ref(),
            &signed.tx_blob,
            &signed.hash,
            VALIDATION_TIMEOUT,
        )
        .await?;
        if result != "tesSUCCESS" {
            return Err(Error::Submission(result));
        }
        info!("Purchase of {} complete: {}", event.token, result);
        Ok(())
    }
}

/// Mirror the observed limit, bounded into the configured band
fn clamp_limit(limit: Decimal, min: u64, max: u64) -> Decimal {
    limit
        .max(Decimal::from(min))
        .min(Decimal::from(max))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::types::{
        AccountInfo, BookOffer, LedgerTxSummary, SubmitResult, TxLookup,
    };
    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::{json, Value};
    use std::sync::Mutex as StdMutex;

    /// Records submissions and validates them instantly
    struct RecordingRpc {
        submitted: StdMutex<Vec<String>>,
        result: String,
    }

    impl RecordingRpc {
        fn success() -> Self {
            Self {
                submitted: StdMutex::new(Vec::new()),
                result: "tesSUCCESS".to_string(),
            }
        }

        fn failing(code: &str) -> Self {
            Self {
                submitted: StdMutex::new(Vec::new()),
                result: code.to_string(),
            }
        }
    }

    #[async_trait]
    impl LedgerRpc for RecordingRpc {
        async fn tx(&self, _: &str) -> crate::error::Result<TxLookup> {
            Ok(TxLookup {
                validated: true,
                meta: Some(json!({ "TransactionResult": self.result })),
                ..Default::default()
            })
        }
        async fn account_tx(&self, _: &str, _: u32) -> crate::error::Result<Vec<LedgerTxSummary>> {
            Ok(vec![])
        }
        async fn book_offers(&self, _: Value, _: Value) -> crate::error::Result<Vec<BookOffer>> {
            Ok(vec![])
        }
        async fn account_info(&self, _: &str) -> crate::error::Result<AccountInfo> {
            Ok(AccountInfo { sequence: 42 })
        }
        async fn submit(&self, tx_blob: &str) -> crate::error::Result<SubmitResult> {
            self.submitted.lock().unwrap().push(tx_blob.to_string());
            Ok(SubmitResult {
                engine_result: "tesSUCCESS".to_string(),
                accepted: true,
            })
        }
    }

    fn trust_set(limit: &str) -> TrustSetEvent {
        TrustSetEvent {
            token: crate::parser::TokenId::new("TST", test_issuer()),
            wallet: "rTarget".to_string(),
            limit: limit.parse().unwrap(),
            tx_hash: "H1".to_string(),
            timestamp: Utc::now(),
            is_removal: false,
        }
    }

    fn test_issuer() -> String {
        // A stable issuer address derived from a generated wallet
        let (_, wallet) = Wallet::generate().unwrap();
        wallet.classic_address().to_string()
    }

    fn follower(rpc: Arc<RecordingRpc>, test_mode: bool) -> Follower {
        let (_, wallet) = Wallet::generate().unwrap();
        Follower::new(
            "rTarget".to_string(),
            Arc::new(wallet),
            TradingConfig::default(),
            rpc,
            StatsHandle::new(false, test_mode),
            test_mode,
        )
    }

    #[test]
    fn test_clamp_limit() {
        // S4: a 50 limit clamps up to the 1000 floor
        assert_eq!(clamp_limit("50".parse().unwrap(), 1000, 10000), Decimal::from(1000u64));
        assert_eq!(clamp_limit("50000".parse().unwrap(), 1000, 10000), Decimal::from(10000u64));
        assert_eq!(clamp_limit("5000".parse().unwrap(), 1000, 10000), Decimal::from(5000u64));
    }

    #[tokio::test(start_paused = true)]
    async fn test_mirror_submits_clamped_trust_line() {
        let rpc = Arc::new(RecordingRpc::success());
        let follower = follower(rpc.clone(), false);

        follower.mirror_trust_line(&trust_set("50")).await.unwrap();

        let submitted = rpc.submitted.lock().unwrap();
        assert_eq!(submitted.len(), 1);
        // The LimitAmount field (0x63) carries the encoding of 1000
        assert!(submitted[0].contains("63D543"), "blob: {}", submitted[0]);

        assert_eq!(follower.stats.snapshot().trust_lines_today, 1);
    }

    #[tokio::test]
    async fn test_test_mode_submits_nothing() {
        let rpc = Arc::new(RecordingRpc::success());
        let follower = follower(rpc.clone(), true);

        follower.mirror_trust_line(&trust_set("50")).await.unwrap();

        assert!(rpc.submitted.lock().unwrap().is_empty());
        let stats = follower.stats.snapshot();
        assert_eq!(stats.trust_lines_today, 1);
        assert!(stats.last_transaction_summary.unwrap().contains("simulated"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejection_is_recoverable() {
        let rpc = Arc::new(RecordingRpc::failing("tecNO_LINE_INSUF_RESERVE"));
        let follower = follower(rpc.clone(), false);

        let err = follower.mirror_trust_line(&trust_set("50")).await.unwrap_err();
        assert!(matches!(err, Error::Submission(_)));
        assert!(!err.is_fatal());
        assert_eq!(follower.stats.snapshot().trust_lines_today, 0);
    }

    #[tokio::test]
    async fn test_duplicate_frames_dropped_while_in_flight() {
        let rpc = Arc::new(RecordingRpc::success());
        let follower = follower(rpc.clone(), true);
        let event = trust_set("2000");

        follower
            .in_flight
            .lock()
            .await
            .insert(event.token.key());
        follower.on_trust_set(event.clone()).await;

        // The pre-existing in-flight marker swallowed the frame
        assert_eq!(follower.stats.snapshot().trust_lines_today, 0);
    }

    #[tokio::test]
    async fn test_other_accounts_ignored() {
        let rpc = Arc::new(RecordingRpc::success());
        let follower = follower(rpc.clone(), true);

        let mut event = trust_set("2000");
        event.wallet = "rSomeoneElse".to_string();
        follower.on_trust_set(event).await;

        // Give any (wrongly) spawned submission a chance to run
        tokio::task::yield_now().await;
        assert_eq!(follower.stats.snapshot().trust_lines_today, 0);
    }
}
