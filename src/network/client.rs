//! Client Connection
//!
//! Client side of the game protocol: a WebSocket connection split into a
//! reader and a writer task, a bounded outbox that sheds the newest message
//! when full, a ping loop feeding a smoothed RTT estimate, and the reconnect
//! backoff schedule.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::core::clock::{Clock, SystemClock};
use crate::network::codec::{decode, encode, ProtocolError};
use crate::network::protocol::{ClientMessage, ServerMessage};

/// Weight of the newest sample in the RTT moving average.
pub const RTT_ALPHA: f64 = 0.5;

/// Default reconnect delays, in seconds.
pub const DEFAULT_BACKOFF_SECS: [u64; 4] = [1, 2, 5, 10];

/// Client failure.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Could not open the WebSocket.
    #[error("connection failed: {0}")]
    Connect(#[from] tokio_tungstenite::tungstenite::Error),

    /// Every reconnect attempt failed.
    #[error("gave up after {0} connection attempts")]
    Exhausted(u32),

    /// Outgoing message could not be encoded.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

// =============================================================================
// BACKOFF
// =============================================================================

/// Reconnect delay schedule. Delays advance one entry per failed attempt,
/// stay on the last entry once exhausted, and restart after a success.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backoff {
    schedule: Vec<Duration>,
    attempt: usize,
}

impl Backoff {
    /// Schedule from explicit delays. An empty list falls back to the default.
    pub fn new(schedule: Vec<Duration>) -> Self {
        if schedule.is_empty() {
            return Self::default();
        }
        Self { schedule, attempt: 0 }
    }

    /// Schedule from whole seconds.
    pub fn from_secs(secs: &[u64]) -> Self {
        Self::new(secs.iter().copied().map(Duration::from_secs).collect())
    }

    /// Delay before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        let idx = self.attempt.min(self.schedule.len() - 1);
        self.attempt += 1;
        self.schedule[idx]
    }

    /// Back to the first entry.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Failed attempts since the last reset.
    pub fn attempts(&self) -> usize {
        self.attempt
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            schedule: DEFAULT_BACKOFF_SECS.iter().copied().map(Duration::from_secs).collect(),
            attempt: 0,
        }
    }
}

// =============================================================================
// RTT
// =============================================================================

/// Exponential moving average of round-trip samples, in seconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RttTracker {
    alpha: f64,
    smoothed: Option<f64>,
}

impl RttTracker {
    /// Tracker with the given weight for new samples.
    pub fn new(alpha: f64) -> Self {
        Self {
            alpha: alpha.clamp(0.0, 1.0),
            smoothed: None,
        }
    }

    /// Fold in one sample. The first sample seeds the average.
    pub fn sample(&mut self, rtt: f64) -> f64 {
        let next = match self.smoothed {
            None => rtt,
            Some(prev) => self.alpha * rtt + (1.0 - self.alpha) * prev,
        };
        self.smoothed = Some(next);
        next
    }

    /// Current estimate.
    pub fn smoothed(&self) -> Option<f64> {
        self.smoothed
    }
}

impl Default for RttTracker {
    fn default() -> Self {
        Self::new(RTT_ALPHA)
    }
}

// =============================================================================
// OUTBOX
// =============================================================================

/// Bounded outgoing queue. A push onto a full queue discards the message
/// being pushed; nothing already queued is lost and the caller never waits.
pub struct Outbox<T> {
    tx: mpsc::Sender<T>,
    dropped: Arc<AtomicU64>,
}

impl<T> Clone for Outbox<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            dropped: self.dropped.clone(),
        }
    }
}

impl<T> Outbox<T> {
    /// Queue with room for `capacity` messages, plus its receiving end.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<T>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            rx,
        )
    }

    /// Enqueue. Returns `false` when the message was shed or the receiver
    /// is gone.
    pub fn push(&self, msg: T) -> bool {
        match self.tx.try_send(msg) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                debug!(dropped = total, "outbox full, dropping newest message");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Messages shed so far.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Whether the receiving end has gone away.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

// =============================================================================
// NET CLIENT
// =============================================================================

/// Client tuning.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Outbox capacity.
    pub outbox_capacity: usize,
    /// Interval between pings.
    pub ping_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            outbox_capacity: 64,
            ping_interval: Duration::from_secs(5),
        }
    }
}

/// A live connection to a game server.
pub struct NetClient {
    outbox: Outbox<ClientMessage>,
    inbound: mpsc::Receiver<ServerMessage>,
    rtt: watch::Receiver<Option<f64>>,
    tasks: Vec<JoinHandle<()>>,
}

impl NetClient {
    /// Open one connection.
    pub async fn connect(url: &str, config: &ClientConfig) -> Result<Self, ClientError> {
        let (ws_stream, _) = connect_async(url).await?;
        info!(url, "connected to game server");

        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let (outbox, mut out_rx) = Outbox::<ClientMessage>::channel(config.outbox_capacity);
        let (in_tx, inbound) = mpsc::channel(config.outbox_capacity.max(1));
        let (rtt_tx, rtt) = watch::channel(None);

        let writer = tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let text = match encode(&msg) {
                    Ok(t) => t,
                    Err(e) => {
                        warn!(error = %e, "dropping unencodable message");
                        continue;
                    }
                };
                if ws_sender.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
        });

        let reply = outbox.clone();
        let reader = tokio::spawn(async move {
            let clock = SystemClock;
            let mut tracker = RttTracker::default();
            while let Some(frame) = ws_receiver.next().await {
                let text = match frame {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => continue,
                };
                match decode::<ServerMessage>(&text) {
                    Ok(ServerMessage::Ping { ts }) => {
                        reply.push(ClientMessage::Pong { ts });
                    }
                    Ok(ServerMessage::Pong { ts }) => {
                        let smoothed = tracker.sample((clock.now() - ts).max(0.0));
                        let _ = rtt_tx.send(Some(smoothed));
                    }
                    Ok(msg) => {
                        if in_tx.send(msg).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => debug!(error = %e, "ignoring undecodable server message"),
                }
            }
            debug!("server connection closed");
        });

        let pinger = outbox.clone();
        let period = config.ping_interval;
        let ping = tokio::spawn(async move {
            let clock = SystemClock;
            let mut ticker = interval(period);
            loop {
                ticker.tick().await;
                if pinger.is_closed() {
                    break;
                }
                pinger.push(ClientMessage::Ping { ts: clock.now() });
            }
        });

        Ok(Self {
            outbox,
            inbound,
            rtt,
            tasks: vec![writer, reader, ping],
        })
    }

    /// Connect, sleeping through `backoff` between failures. The schedule is
    /// reset once a connection succeeds.
    pub async fn connect_with_retry(
        url: &str,
        config: &ClientConfig,
        backoff: &mut Backoff,
        max_attempts: u32,
    ) -> Result<Self, ClientError> {
        for attempt in 1..=max_attempts.max(1) {
            match Self::connect(url, config).await {
                Ok(client) => {
                    backoff.reset();
                    return Ok(client);
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    warn!(attempt, error = %e, delay_secs = delay.as_secs_f64(), "connect failed");
                    if attempt < max_attempts {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
        Err(ClientError::Exhausted(max_attempts.max(1)))
    }

    /// Queue a message. `false` when shed.
    pub fn send(&self, msg: ClientMessage) -> bool {
        self.outbox.push(msg)
    }

    /// Next message from the server; `None` once the connection is gone.
    pub async fn recv(&mut self) -> Option<ServerMessage> {
        self.inbound.recv().await
    }

    /// Smoothed round-trip time in seconds.
    pub fn rtt(&self) -> Option<f64> {
        *self.rtt.borrow()
    }

    /// Outgoing messages shed so far.
    pub fn dropped(&self) -> u64 {
        self.outbox.dropped()
    }
}

impl Drop for NetClient {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
