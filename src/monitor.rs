//! Streaming ledger monitor
//!
//! Long-lived websocket subscription with heartbeat supervision and bounded
//! exponential reconnect. Frames are handed to the consumer over an mpsc
//! channel in transport order; the consumer processes them synchronously, so
//! there is no internal queueing beyond the channel itself.
//!
//! State machine: DISCONNECTED -> CONNECTED -> SUBSCRIBED, falling back to
//! RECONNECTING on transport errors or a missed heartbeat, and terminally to
//! FAILED once the reconnect budget is spent.

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, sleep, sleep_until, Instant};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::NetworkConfig;
use crate::error::{Error, Result};
use crate::ledger::types::{
    ping_request, subscribe_account_request, subscribe_transactions_request, StreamFrame,
};

/// Backoff ceiling between reconnect attempts
const MAX_BACKOFF: Duration = Duration::from_secs(320);

/// What the monitor subscribes to
#[derive(Debug, Clone)]
pub enum Subscription {
    /// Every validated transaction on the ledger (market monitoring)
    AllTransactions,
    /// A single account's transactions (the follower's target)
    Account(String),
}

/// Events delivered to the consumer
#[derive(Debug)]
pub enum MonitorEvent {
    Connected,
    Subscribed,
    Frame(StreamFrame),
    Disconnected,
    /// Reconnect budget exhausted; the monitor has stopped
    Failed(String),
}

/// Connection settings for one monitor
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub ws_url: String,
    pub max_reconnect_attempts: u32,
    pub reconnect_delay: Duration,
    pub ping_interval: Duration,
    pub ping_timeout: Duration,
}

impl MonitorConfig {
    pub fn from_network(network: &NetworkConfig) -> Self {
        Self {
            ws_url: network.websocket_url.clone(),
            max_reconnect_attempts: network.max_reconnect_attempts,
            reconnect_delay: Duration::from_secs(network.reconnect_delay_seconds),
            ping_interval: Duration::from_secs(network.ping_interval_seconds),
            ping_timeout: Duration::from_secs(network.ping_timeout_seconds),
        }
    }
}

/// Streaming monitor: owns one websocket connection
pub struct StreamingMonitor {
    config: MonitorConfig,
    subscription: Subscription,
    event_tx: mpsc::Sender<MonitorEvent>,
    cancel: CancellationToken,
}

impl StreamingMonitor {
    pub fn new(
        config: MonitorConfig,
        subscription: Subscription,
        event_tx: mpsc::Sender<MonitorEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            subscription,
            event_tx,
            cancel,
        }
    }

    /// Run until cancelled or the reconnect budget is exhausted
    pub async fn run(&self) -> Result<()> {
        let mut reconnect_attempts = 0u32;
        let mut delay = self.config.reconnect_delay;

        loop {
            if self.cancel.is_cancelled() {
                return Ok(());
            }

            match self.connect_and_stream(&mut reconnect_attempts, &mut delay).await {
                Ok(()) => {
                    info!("Monitor stopped");
                    return Ok(());
                }
                Err(e) => {
                    reconnect_attempts += 1;
                    if reconnect_attempts > self.config.max_reconnect_attempts {
                        error!(
                            "Maximum reconnection attempts ({}) reached, stopping",
                            self.config.max_reconnect_attempts
                        );
                        let _ = self
                            .event_tx
                            .send(MonitorEvent::Failed(e.to_string()))
                            .await;
                        return Err(Error::ReconnectExhausted(self.config.max_reconnect_attempts));
                    }

                    error!("WebSocket error: {}", e);
                    info!(
                        "Reconnection attempt {} of {}, waiting {:?}",
                        reconnect_attempts, self.config.max_reconnect_attempts, delay
                    );
                    let _ = self.event_tx.send(MonitorEvent::Disconnected).await;

                    tokio::select! {
                        _ = self.cancel.cancelled() => return Ok(()),
                        _ = sleep(delay) => {}
                    }
                    delay = next_backoff(delay);
                }
            }
        }
    }

    async fn connect_and_stream(
        &self,
        reconnect_attempts: &mut u32,
        delay: &mut Duration,
    ) -> Result<()> {
        info!("Connecting to {}", self.config.ws_url);
        let (socket, _) = connect_async(self.config.ws_url.as_str()).await?;
        info!("Connected to the ledger");
        let _ = self.event_tx.send(MonitorEvent::Connected).await;

        stream_session(
            socket,
            &self.subscription,
            self.config.ping_interval,
            self.config.ping_timeout,
            &self.event_tx,
            &self.cancel,
            || {
                // Entering SUBSCRIBED resets the reconnect budget
                *reconnect_attempts = 0;
                *delay = self.config.reconnect_delay;
            },
        )
        .await
    }
}

/// Exponential backoff, doubling up to the ceiling
fn next_backoff(current: Duration) -> Duration {
    (current * 2).min(MAX_BACKOFF)
}

/// Subscribe, then pump frames with heartbeat supervision.
///
/// Returns `Ok(())` only on cancellation or when the consumer goes away; any
/// transport problem or missed heartbeat is an `Err` so the caller can
/// reconnect.
async fn stream_session<S>(
    socket: S,
    subscription: &Subscription,
    ping_interval: Duration,
    ping_timeout: Duration,
    event_tx: &mpsc::Sender<MonitorEvent>,
    cancel: &CancellationToken,
    on_subscribed: impl FnOnce(),
) -> Result<()>
where
    S: Stream<Item = std::result::Result<Message, tungstenite::Error>>
        + Sink<Message, Error = tungstenite::Error>
        + Unpin,
{
    let (mut write, mut read) = socket.split();

    let subscribe = match subscription {
        Subscription::AllTransactions => subscribe_transactions_request(1),
        Subscription::Account(account) => subscribe_account_request(1, account),
    };
    write.send(Message::Text(subscribe.to_string())).await?;
    match subscription {
        Subscription::AllTransactions => info!("Subscribed to the transaction stream"),
        Subscription::Account(account) => info!("Subscribed to account {}", account),
    }
    on_subscribed();
    let _ = event_tx.send(MonitorEvent::Subscribed).await;

    let mut ping_timer = interval(ping_interval);
    // The first tick of an interval fires immediately
    ping_timer.tick().await;
    let mut last_pong = Instant::now();
    let mut ping_id: u64 = 1;

    loop {
        let dead_at = last_pong + ping_interval + ping_timeout;
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = write.send(Message::Close(None)).await;
                return Ok(());
            }
            _ = sleep_until(dead_at) => {
                return Err(Error::DeadConnection);
            }
            _ = ping_timer.tick() => {
                ping_id += 1;
                write.send(Message::Text(ping_request(ping_id).to_string())).await?;
                debug!("Ping sent");
            }
            frame = read.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<StreamFrame>(&text) {
                            Ok(parsed) if parsed.is_response() => {
                                last_pong = Instant::now();
                                debug!("Pong received");
                            }
                            Ok(parsed) => {
                                if event_tx.send(MonitorEvent::Frame(parsed)).await.is_err() {
                                    warn!("Frame consumer gone, stopping monitor");
                                    return Ok(());
                                }
                            }
                            Err(e) => debug!("Failed to parse message: {}", e),
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        write.send(Message::Pong(payload)).await?;
                    }
                    Some(Ok(Message::Close(_))) => {
                        return Err(Error::ConnectionClosed("closed by server".to_string()));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                    None => return Err(Error::ConnectionClosed("stream ended".to_string())),
                }
            }
        }
    }
}
