//! Configuration loading and validation
//!
//! Configuration comes from two optional YAML documents, `config.yaml` and
//! `config.local.yaml`, merged deeply on top of built-in defaults. Null and
//! empty values never override. Invalid values revert to their defaults
//! rather than failing the load; only missing credentials are fatal.

use rust_decimal::Decimal;
use serde::Deserialize;
use serde_yaml::Value;
use std::path::Path;
use tracing::warn;

use crate::error::{Error, Result};

/// Hostname suffixes accepted for the ledger websocket endpoint
const ALLOWED_ENDPOINTS: [&str; 4] = [".rippletest.net", "xrpl.org", "ripple.com", "xrplcluster.com"];

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub network: NetworkConfig,
    pub wallets: WalletsConfig,
    pub trading: TradingConfig,
    pub monitoring: MonitoringConfig,
    pub analytics: AnalyticsConfig,
    pub logging: LoggingConfig,
    pub web: WebConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub websocket_url: String,
    pub max_reconnect_attempts: u32,
    pub reconnect_delay_seconds: u64,
    pub ping_interval_seconds: u64,
    pub ping_timeout_seconds: u64,
    pub request_timeout_seconds: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            websocket_url: "wss://s.altnet.rippletest.net:51233".to_string(),
            max_reconnect_attempts: 5,
            reconnect_delay_seconds: 5,
            ping_interval_seconds: 30,
            ping_timeout_seconds: 10,
            request_timeout_seconds: 30,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WalletsConfig {
    /// Account whose trust-line openings are mirrored
    pub target_wallet: String,
    /// Private seed for the controlled account (ed25519 family, `sEd...`)
    pub follower_seed: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TradingConfig {
    pub min_trust_line_amount: u64,
    pub max_trust_line_amount: u64,
    pub initial_purchase_amount: Decimal,
    pub send_max_native: Decimal,
    pub slippage_percent: Decimal,
    /// Buy a small amount right after mirroring a trust line
    pub auto_purchase_on_trust: bool,
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            min_trust_line_amount: 1000,
            max_trust_line_amount: 10000,
            initial_purchase_amount: Decimal::ONE,
            send_max_native: Decimal::ONE,
            slippage_percent: Decimal::new(5, 0),
            auto_purchase_on_trust: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    /// Token payments below this value are ignored
    pub min_trade_volume: Decimal,
    /// Trust-line count at which a token becomes hot
    pub min_trust_lines: u32,
    pub save_interval_minutes: u64,
    pub data_file: String,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            min_trade_volume: Decimal::new(1000, 0),
            min_trust_lines: 5,
            save_interval_minutes: 5,
            data_file: "token_data.json".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AnalyticsConfig {
    pub analysis_interval_seconds: u64,
    pub batch_size: usize,
    pub max_token_age_hours: i64,
    pub price_check_interval_minutes: u64,
    pub wait_between_queries_seconds: u64,
    /// Hysteresis: max price is replaced only on moves above this fraction
    pub min_price_change: Decimal,
    pub min_liquidity: Decimal,
    pub scoring_interval_seconds: u64,
    pub active_window_days: i64,
    pub min_trades: usize,
    pub min_roi: Decimal,
    pub early_adopter_max: u64,
    pub alpha_file: String,
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            analysis_interval_seconds: 300,
            batch_size: 10,
            max_token_age_hours: 12,
            price_check_interval_minutes: 2,
            wait_between_queries_seconds: 5,
            min_price_change: Decimal::new(5, 2),
            min_liquidity: Decimal::ZERO,
            scoring_interval_seconds: 3600,
            active_window_days: 30,
            min_trades: 5,
            min_roi: Decimal::TWO,
            early_adopter_max: 10,
            alpha_file: "alpha_wallets.txt".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub filename: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "full".to_string(),
            filename: None,
        }
    }
}

impl LoggingConfig {
    /// Read just the logging section ahead of full config loading, so the
    /// subscriber exists before load-time warnings are emitted
    pub fn peek(local_path: &str) -> Self {
        let mut merged = Value::Mapping(serde_yaml::Mapping::new());
        for path in ["config.yaml", local_path] {
            if path.is_empty() || !Path::new(path).exists() {
                continue;
            }
            if let Ok(raw) = std::fs::read_to_string(path) {
                if let Ok(doc) = serde_yaml::from_str::<Value>(&raw) {
                    deep_merge(&mut merged, doc);
                }
            }
        }
        merged
            .get("logging")
            .cloned()
            .and_then(|section| serde_yaml::from_value(section).ok())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebConfig {
    pub enabled: bool,
    pub bind: String,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: "127.0.0.1:8000".to_string(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            network: NetworkConfig::default(),
            wallets: WalletsConfig::default(),
            trading: TradingConfig::default(),
            monitoring: MonitoringConfig::default(),
            analytics: AnalyticsConfig::default(),
            logging: LoggingConfig::default(),
            web: WebConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from `config.yaml` plus an optional local override
    pub fn load(local_path: &str) -> Result<Self> {
        let mut merged = Value::Mapping(serde_yaml::Mapping::new());

        for path in ["config.yaml", local_path] {
            if path.is_empty() || !Path::new(path).exists() {
                continue;
            }
            let raw = std::fs::read_to_string(path)?;
            match serde_yaml::from_str::<Value>(&raw) {
                Ok(doc) => deep_merge(&mut merged, doc),
                Err(e) => warn!("Skipping unparseable config file {}: {}", path, e),
            }
        }

        Self::from_value(merged)
    }

    /// Build a config from an already-merged YAML document
    pub fn from_value(mut doc: Value) -> Result<Self> {
        sanitize(&mut doc);
        let config: Config = serde_yaml::from_value(doc)?;
        Ok(config.sanitized())
    }

    /// Apply the cross-field revert rules that need typed values
    fn sanitized(mut self) -> Self {
        let defaults = TradingConfig::default();
        if self.trading.max_trust_line_amount < self.trading.min_trust_line_amount {
            warn!(
                "max_trust_line_amount {} < min_trust_line_amount {}, reverting both to defaults",
                self.trading.max_trust_line_amount, self.trading.min_trust_line_amount
            );
            self.trading.min_trust_line_amount = defaults.min_trust_line_amount;
            self.trading.max_trust_line_amount = defaults.max_trust_line_amount;
        }
        for (value, default) in [
            (&mut self.trading.initial_purchase_amount, defaults.initial_purchase_amount),
            (&mut self.trading.send_max_native, defaults.send_max_native),
            (&mut self.trading.slippage_percent, defaults.slippage_percent),
        ] {
            if *value <= Decimal::ZERO {
                *value = default;
            }
        }
        self
    }

    /// Validate required credentials. Failures here refuse startup.
    pub fn validate(&self) -> Result<()> {
        if self.wallets.target_wallet.is_empty() {
            return Err(Error::MissingConfig("wallets.target_wallet".to_string()));
        }
        if !self.wallets.target_wallet.starts_with('r') {
            return Err(Error::Config(format!(
                "wallets.target_wallet must be a classic address starting with 'r', got {}",
                self.wallets.target_wallet
            )));
        }
        if self.wallets.follower_seed.is_empty() {
            return Err(Error::MissingConfig("wallets.follower_seed".to_string()));
        }
        crate::wallet::Wallet::from_seed(&self.wallets.follower_seed)?;
        Ok(())
    }
}

/// Deep merge `over` onto `base`. Null and empty-string values never override.
fn deep_merge(base: &mut Value, over: Value) {
    match (base, over) {
        (Value::Mapping(base_map), Value::Mapping(over_map)) => {
            for (key, value) in over_map {
                if value.is_null() {
                    continue;
                }
                if matches!(&value, Value::String(s) if s.is_empty()) {
                    continue;
                }
                match base_map.get_mut(&key) {
                    Some(slot) => deep_merge(slot, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => {
            if !value.is_null() {
                *slot = value;
            }
        }
    }
}

/// Coerce and validate individual fields before typed deserialization.
/// Invalid values are removed so serde falls back to the defaults.
fn sanitize(doc: &mut Value) {
    let Value::Mapping(root) = doc else { return };

    if let Some(Value::Mapping(network)) = root.get_mut("network") {
        let url_ok = matches!(
            network.get("websocket_url"),
            Some(Value::String(url)) if is_valid_websocket_url(url)
        );
        if !url_ok && network.contains_key("websocket_url") {
            warn!("Invalid network.websocket_url, reverting to default");
            network.remove("websocket_url");
        }
        coerce_integer(network, "max_reconnect_attempts", 1);
        coerce_integer(network, "reconnect_delay_seconds", 1);
        coerce_integer(network, "ping_interval_seconds", 1);
        coerce_integer(network, "ping_timeout_seconds", 1);
        coerce_integer(network, "request_timeout_seconds", 1);
    }

    if let Some(Value::Mapping(trading)) = root.get_mut("trading") {
        coerce_integer(trading, "min_trust_line_amount", 1);
        coerce_integer(trading, "max_trust_line_amount", 1);
    }

    if let Some(Value::Mapping(monitoring)) = root.get_mut("monitoring") {
        coerce_integer(monitoring, "min_trust_lines", 1);
        coerce_integer(monitoring, "save_interval_minutes", 1);
    }

    if let Some(Value::Mapping(analytics)) = root.get_mut("analytics") {
        coerce_integer(analytics, "analysis_interval_seconds", 1);
        coerce_integer(analytics, "batch_size", 1);
        coerce_integer(analytics, "max_token_age_hours", 1);
        coerce_integer(analytics, "price_check_interval_minutes", 1);
        coerce_integer(analytics, "wait_between_queries_seconds", 1);
    }
}

/// Convert string/float representations of an integer key in place.
/// Out-of-range or unparseable values are removed (reverting to default).
fn coerce_integer(section: &mut serde_yaml::Mapping, key: &str, min: u64) {
    let key_value = Value::String(key.to_string());
    let Some(current) = section.get(&key_value) else { return };

    let coerced = match current {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64)),
        Value::String(s) => s
            .trim()
            .parse::<u64>()
            .ok()
            .or_else(|| s.trim().parse::<f64>().ok().filter(|f| *f >= 0.0).map(|f| f as u64)),
        _ => None,
    };

    match coerced.filter(|v| *v >= min) {
        Some(v) => {
            section.insert(key_value, Value::Number(v.into()));
        }
        None => {
            warn!("Invalid value for {}, reverting to default", key);
            section.remove(&key_value);
        }
    }
}

fn is_valid_websocket_url(raw: &str) -> bool {
    let Ok(parsed) = url::Url::parse(raw) else {
        return false;
    };
    if parsed.scheme() != "ws" && parsed.scheme() != "wss" {
        return false;
    }
    let Some(host) = parsed.host_str() else {
        return false;
    };
    ALLOWED_ENDPOINTS.iter().any(|suffix| host.contains(suffix))
}
