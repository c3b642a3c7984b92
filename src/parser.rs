//! Transaction parsing and classification
//!
//! Converts raw stream frames into typed events. All downstream code
//! dispatches on [`ParsedTransaction`]; nothing outside this module looks at
//! raw frame JSON. Timestamps are converted from the ledger epoch to
//! wall-clock UTC here.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::ledger::types::{ledger_time_to_utc, Amount, StreamFrame};

/// A token is identified by its currency code and issuing account
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TokenId {
    pub currency: String,
    pub issuer: String,
}

impl TokenId {
    pub fn new(currency: impl Into<String>, issuer: impl Into<String>) -> Self {
        Self {
            currency: currency.into(),
            issuer: issuer.into(),
        }
    }

    /// Stable `CUR:ISSUER` key used in snapshots and map keys
    pub fn key(&self) -> String {
        format!("{}:{}", self.currency, self.issuer)
    }

    pub fn from_key(key: &str) -> Option<Self> {
        let (currency, issuer) = key.split_once(':')?;
        if currency.is_empty() || issuer.is_empty() {
            return None;
        }
        Some(Self::new(currency, issuer))
    }
}

impl std::fmt::Display for TokenId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.currency, self.issuer)
    }
}

/// A trust line established or removed against an issuer
#[derive(Debug, Clone, PartialEq)]
pub struct TrustSetEvent {
    pub token: TokenId,
    pub wallet: String,
    pub limit: Decimal,
    pub tx_hash: String,
    pub timestamp: DateTime<Utc>,
    pub is_removal: bool,
}

/// A token payment between two accounts
#[derive(Debug, Clone, PartialEq)]
pub struct PaymentEvent {
    pub token: TokenId,
    pub buyer: String,
    pub seller: String,
    pub amount: Decimal,
    pub delivered_amount: Decimal,
    pub tx_hash: String,
    pub timestamp: DateTime<Utc>,
}

/// Classification of an incoming frame
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedTransaction {
    TrustSet(TrustSetEvent),
    Payment(PaymentEvent),
    /// Valid transaction we do not track (other types, native payments,
    /// payments below the volume floor)
    Other,
    /// Frame without `validated = true`
    Unvalidated,
    /// Structurally broken frame; dropped after a debug log
    Error,
}

/// Stateless parser; the volume floor comes from configuration
#[derive(Debug, Clone)]
pub struct TxParser {
    min_trade_volume: Decimal,
}

impl TxParser {
    pub fn new(min_trade_volume: Decimal) -> Self {
        Self { min_trade_volume }
    }

    /// Classify a stream frame
    pub fn parse(&self, frame: &StreamFrame) -> ParsedTransaction {
        if !frame.is_validated_transaction() {
            return ParsedTransaction::Unvalidated;
        }

        let Some(tx) = frame.tx() else {
            debug!("Validated frame without transaction body");
            return ParsedTransaction::Error;
        };
        let tx_hash = frame.tx_hash().unwrap_or_else(|| "unknown".to_string());
        let timestamp = tx
            .get("date")
            .and_then(Value::as_i64)
            .map(ledger_time_to_utc)
            .unwrap_or_else(Utc::now);

        match tx.get("TransactionType").and_then(Value::as_str) {
            Some("TrustSet") => self.parse_trust_set(tx, tx_hash, timestamp),
            Some("Payment") => self.parse_payment(frame, tx, tx_hash, timestamp),
            Some(_) => ParsedTransaction::Other,
            None => {
                debug!("Transaction without TransactionType, hash={}", tx_hash);
                ParsedTransaction::Error
            }
        }
    }

    fn parse_trust_set(
        &self,
        tx: &Value,
        tx_hash: String,
        timestamp: DateTime<Utc>,
    ) -> ParsedTransaction {
        let Some(limit_amount) = tx.get("LimitAmount").and_then(Value::as_object) else {
            debug!("TrustSet without object LimitAmount, hash={}", tx_hash);
            return ParsedTransaction::Error;
        };

        let currency = limit_amount.get("currency").and_then(Value::as_str);
        let issuer = limit_amount.get("issuer").and_then(Value::as_str);
        let value = limit_amount.get("value").and_then(Value::as_str);
        let wallet = tx.get("Account").and_then(Value::as_str);

        let (Some(currency), Some(issuer), Some(value), Some(wallet)) =
            (currency, issuer, value, wallet)
        else {
            debug!("TrustSet missing required fields, hash={}", tx_hash);
            return ParsedTransaction::Error;
        };

        let Ok(limit) = value.parse::<Decimal>() else {
            debug!("TrustSet with unparseable limit {:?}, hash={}", value, tx_hash);
            return ParsedTransaction::Error;
        };

        ParsedTransaction::TrustSet(TrustSetEvent {
            token: TokenId::new(currency, issuer),
            wallet: wallet.to_string(),
            is_removal: limit.is_zero(),
            limit,
            tx_hash,
            timestamp,
        })
    }

    fn parse_payment(
        &self,
        frame: &StreamFrame,
        tx: &Value,
        tx_hash: String,
        timestamp: DateTime<Utc>,
    ) -> ParsedTransaction {
        let Some(amount_value) = tx.get("Amount") else {
            debug!("Payment without Amount, hash={}", tx_hash);
            return ParsedTransaction::Error;
        };
        let Ok(amount) = serde_json::from_value::<Amount>(amount_value.clone()) else {
            debug!("Payment with unparseable Amount, hash={}", tx_hash);
            return ParsedTransaction::Error;
        };

        // Native-coin payments are not token trades
        let Amount::Issued(issued) = amount else {
            return ParsedTransaction::Other;
        };
        let Some(issuer) = issued.issuer.clone() else {
            debug!("Token payment without issuer, hash={}", tx_hash);
            return ParsedTransaction::Error;
        };
        let Ok(value) = issued.value.parse::<Decimal>() else {
            debug!("Token payment with unparseable value, hash={}", tx_hash);
            return ParsedTransaction::Error;
        };

        if value < self.min_trade_volume {
            return ParsedTransaction::Other;
        }

        let buyer = tx.get("Destination").and_then(Value::as_str);
        let seller = tx.get("Account").and_then(Value::as_str);
        let (Some(buyer), Some(seller)) = (buyer, seller) else {
            debug!("Payment missing buyer or seller, hash={}", tx_hash);
            return ParsedTransaction::Error;
        };

        // The delivered amount is authoritative when present and object-shaped
        let delivered_amount = delivered_amount_of(frame, tx).unwrap_or(value);

        ParsedTransaction::Payment(PaymentEvent {
            token: TokenId::new(issued.currency, issuer),
            buyer: buyer.to_string(),
            seller: seller.to_string(),
            amount: value,
            delivered_amount,
            tx_hash,
            timestamp,
        })
    }
}

/// `DeliveredAmount` on the transaction or `delivered_amount` in the meta,
/// only when object-shaped
fn delivered_amount_of(frame: &StreamFrame, tx: &Value) -> Option<Decimal> {
    let candidate = tx
        .get("DeliveredAmount")
        .or_else(|| frame.meta.as_ref().and_then(|meta| meta.get("delivered_amount")))?;
    let amount: Amount = serde_json::from_value(candidate.clone()).ok()?;
    amount.issued_value()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn frame(body: Value) -> StreamFrame {
        serde_json::from_value(body).unwrap()
    }

    fn parser() -> TxParser {
        TxParser::new(Decimal::new(1000, 0))
    }

    fn trust_set_frame(value: &str) -> StreamFrame {
        frame(json!({
            "type": "transaction",
            "validated": true,
            "hash": "ABC123",
            "transaction": {
                "TransactionType": "TrustSet",
                "Account": "rWallet",
                "LimitAmount": { "currency": "TST", "issuer": "rIssuer", "value": value },
            },
        }))
    }

    #[test]
    fn test_trust_set_parses() {
        let parsed = parser().parse(&trust_set_frame("1000"));
        let ParsedTransaction::TrustSet(event) = parsed else {
            panic!("expected TrustSet, got {:?}", parsed);
        };
        assert_eq!(event.token, TokenId::new("TST", "rIssuer"));
        assert_eq!(event.wallet, "rWallet");
        assert_eq!(event.limit, Decimal::new(1000, 0));
        assert!(!event.is_removal);
        assert_eq!(event.tx_hash, "ABC123");
    }

    #[test]
    fn test_zero_limit_is_removal() {
        let ParsedTransaction::TrustSet(event) = parser().parse(&trust_set_frame("0")) else {
            panic!("expected TrustSet");
        };
        assert!(event.is_removal);
    }

    #[test]
    fn test_unvalidated_frame() {
        let unvalidated = frame(json!({
            "type": "transaction",
            "validated": false,
            "transaction": { "TransactionType": "TrustSet" },
        }));
        assert_eq!(parser().parse(&unvalidated), ParsedTransaction::Unvalidated);
    }

    #[test]
    fn test_native_payment_is_other() {
        let native = frame(json!({
            "type": "transaction",
            "validated": true,
            "hash": "H",
            "transaction": {
                "TransactionType": "Payment",
                "Account": "rSeller",
                "Destination": "rBuyer",
                "Amount": "5000000",
            },
        }));
        assert_eq!(parser().parse(&native), ParsedTransaction::Other);
    }

    #[test]
    fn test_payment_below_volume_floor_is_other() {
        let small = frame(json!({
            "type": "transaction",
            "validated": true,
            "hash": "H",
            "transaction": {
                "TransactionType": "Payment",
                "Account": "rSeller",
                "Destination": "rBuyer",
                "Amount": { "currency": "TST", "issuer": "rIssuer", "value": "999" },
            },
        }));
        assert_eq!(parser().parse(&small), ParsedTransaction::Other);
    }

    #[test]
    fn test_payment_parses_with_delivered_amount() {
        let payment = frame(json!({
            "type": "transaction",
            "validated": true,
            "hash": "H1",
            "transaction": {
                "TransactionType": "Payment",
                "Account": "rSeller",
                "Destination": "rBuyer",
                "Amount": { "currency": "TST", "issuer": "rIssuer", "value": "2000" },
                "DeliveredAmount": { "currency": "TST", "issuer": "rIssuer", "value": "1990" },
            },
        }));
        let ParsedTransaction::Payment(event) = parser().parse(&payment) else {
            panic!("expected Payment");
        };
        assert_eq!(event.amount, Decimal::new(2000, 0));
        assert_eq!(event.delivered_amount, Decimal::new(1990, 0));
        assert_eq!(event.buyer, "rBuyer");
        assert_eq!(event.seller, "rSeller");
    }

    #[test]
    fn test_delivered_amount_defaults_to_amount() {
        let payment = frame(json!({
            "type": "transaction",
            "validated": true,
            "hash": "H2",
            "transaction": {
                "TransactionType": "Payment",
                "Account": "rSeller",
                "Destination": "rBuyer",
                "Amount": { "currency": "TST", "issuer": "rIssuer", "value": "2000" },
            },
        }));
        let ParsedTransaction::Payment(event) = parser().parse(&payment) else {
            panic!("expected Payment");
        };
        assert_eq!(event.delivered_amount, event.amount);
    }

    #[test]
    fn test_scalar_delivered_amount_is_ignored() {
        let payment = frame(json!({
            "type": "transaction",
            "validated": true,
            "hash": "H3",
            "transaction": {
                "TransactionType": "Payment",
                "Account": "rSeller",
                "Destination": "rBuyer",
                "Amount": { "currency": "TST", "issuer": "rIssuer", "value": "2000" },
                "DeliveredAmount": "12345",
            },
        }));
        let ParsedTransaction::Payment(event) = parser().parse(&payment) else {
            panic!("expected Payment");
        };
        assert_eq!(event.delivered_amount, Decimal::new(2000, 0));
    }

    #[test]
    fn test_malformed_frames_are_errors() {
        let missing_limit = frame(json!({
            "type": "transaction",
            "validated": true,
            "transaction": { "TransactionType": "TrustSet", "Account": "rWallet" },
        }));
        assert_eq!(parser().parse(&missing_limit), ParsedTransaction::Error);

        let scalar_limit = frame(json!({
            "type": "transaction",
            "validated": true,
            "transaction": {
                "TransactionType": "TrustSet",
                "Account": "rWallet",
                "LimitAmount": "1000",
            },
        }));
        assert_eq!(parser().parse(&scalar_limit), ParsedTransaction::Error);
    }

    #[test]
    fn test_other_transaction_types() {
        let offer = frame(json!({
            "type": "transaction",
            "validated": true,
            "transaction": { "TransactionType": "OfferCreate" },
        }));
        assert_eq!(parser().parse(&offer), ParsedTransaction::Other);
    }

    #[test]
    fn test_ledger_date_converted_to_wall_clock() {
        let with_date = frame(json!({
            "type": "transaction",
            "validated": true,
            "hash": "H",
            "transaction": {
                "TransactionType": "TrustSet",
                "Account": "rWallet",
                "LimitAmount": { "currency": "TST", "issuer": "rIssuer", "value": "1" },
                "date": 86_400,
            },
        }));
        let ParsedTransaction::TrustSet(event) = parser().parse(&with_date) else {
            panic!("expected TrustSet");
        };
        assert_eq!(event.timestamp.to_rfc3339(), "2000-01-02T00:00:00+00:00");
    }

    #[test]
    fn test_token_key_round_trip() {
        let token = TokenId::new("TST", "rIssuer");
        assert_eq!(token.key(), "TST:rIssuer");
        assert_eq!(TokenId::from_key("TST:rIssuer"), Some(token));
        assert_eq!(TokenId::from_key("nocolon"), None);
    }
}
