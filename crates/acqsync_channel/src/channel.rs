//! Persistent websocket channel to the coordinator.
//!
//! ```text
//!            send()                                  SharedState
//!              |                                         ^
//!              v                                         | apply_remote
//!   [outbound FIFO] --> send worker --ws--> coordinator  |
//!                                    <--ws-- connection loop --> [inbound] --> receive worker
//! ```
//!
//! The connection loop owns the socket and reconnects with backoff until
//! [`PersistentChannel::close`] is called. A fresh send worker takes the
//! write half on every connection; it only removes a message from the
//! outbound queue once the socket has accepted it, so messages refused by
//! a dead connection go out on the next one.

use crate::error::{ChannelError, Result};
use crate::state::{ChangeOrigin, SharedState, SubscriptionId};
use acqsync_protocol::defaults::{
    BACKOFF_CAP_SECS, DEFAULT_DRAIN_TIMEOUT_SECS, DEFAULT_HEARTBEAT_INTERVAL_SECS,
    DEFAULT_HEARTBEAT_TIMEOUT_SECS, RAPID_DISCONNECT_THRESHOLD_SECS,
};
use acqsync_protocol::{websocket_url, ChannelMessage};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, timeout, Instant};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

type WsWrite = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// Poll period while waiting for the outbound queue to drain on close.
const DRAIN_POLL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Connected,
    Closing,
    Closed,
}

impl std::fmt::Display for ChannelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ChannelState::Connecting => "connecting",
            ChannelState::Connected => "connected",
            ChannelState::Closing => "closing",
            ChannelState::Closed => "closed",
        })
    }
}

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub url: Url,
    /// Ping period; also the base of the silence timeout
    pub heartbeat_interval: Duration,
    /// Extra silence tolerated after a missed heartbeat
    pub heartbeat_timeout: Duration,
    /// Longest `close()` waits for queued messages to go out
    pub drain_timeout: Duration,
    /// Growth unit of the reconnect backoff
    pub backoff_step: Duration,
    pub backoff_cap: Duration,
    /// Connections shorter than this count as rapid disconnects
    pub rapid_disconnect: Duration,
}

impl ChannelConfig {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            heartbeat_interval: Duration::from_secs(DEFAULT_HEARTBEAT_INTERVAL_SECS),
            heartbeat_timeout: Duration::from_secs(DEFAULT_HEARTBEAT_TIMEOUT_SECS),
            drain_timeout: Duration::from_secs(DEFAULT_DRAIN_TIMEOUT_SECS),
            backoff_step: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(BACKOFF_CAP_SECS),
            rapid_disconnect: Duration::from_secs(RAPID_DISCONNECT_THRESHOLD_SECS),
        }
    }

    /// Endpoint for `client_id` on the coordinator at `base_url`.
    pub fn for_client(base_url: &str, client_id: u32) -> Result<Self> {
        Ok(Self::new(websocket_url(base_url, client_id)?))
    }
}

/// Reconnect delay calculator.
///
/// After a connection that lived at least `rapid_disconnect` the delay
/// resets to zero; otherwise it grows as `prev * 2 + step`, capped.
#[derive(Debug, Clone)]
pub struct Backoff {
    current: Duration,
    step: Duration,
    cap: Duration,
    rapid_disconnect: Duration,
}

impl Backoff {
    pub fn new(step: Duration, cap: Duration, rapid_disconnect: Duration) -> Self {
        Self {
            current: Duration::ZERO,
            step,
            cap,
            rapid_disconnect,
        }
    }

    pub fn from_config(config: &ChannelConfig) -> Self {
        Self::new(config.backoff_step, config.backoff_cap, config.rapid_disconnect)
    }

    /// Delay before the next attempt, given how long the last connection lived.
    pub fn next_delay(&mut self, lived: Duration) -> Duration {
        self.current = if lived >= self.rapid_disconnect {
            Duration::ZERO
        } else {
            (self.current * 2 + self.step).min(self.cap)
        };
        self.current
    }

    pub fn current(&self) -> Duration {
        self.current
    }
}

// ============================================================================
// Shared channel state
// ============================================================================

struct Shared {
    config: ChannelConfig,
    outbound: Mutex<VecDeque<String>>,
    outbound_ready: Notify,
    closing: AtomicBool,
    state: watch::Sender<ChannelState>,
}

impl Shared {
    fn queue(&self) -> MutexGuard<'_, VecDeque<String>> {
        self.outbound.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn enqueue(&self, message: &ChannelMessage) -> Result<()> {
        if self.closing.load(Ordering::SeqCst) {
            return Err(ChannelError::Closed);
        }
        let text = message.encode()?;
        self.queue().push_back(text);
        self.outbound_ready.notify_one();
        Ok(())
    }

    /// Move to `next` unless the channel is already shutting down. Only
    /// `Closed` may replace `Closing`.
    fn transition(&self, next: ChannelState) {
        self.state.send_if_modified(|current| {
            let shutting_down = matches!(*current, ChannelState::Closing | ChannelState::Closed);
            if *current == next || (shutting_down && next != ChannelState::Closed) {
                return false;
            }
            debug!(from = %current, to = %next, "Channel state change");
            *current = next;
            true
        });
    }
}

// ============================================================================
// Channel handle
// ============================================================================

/// Handle to the coordinator channel. Clones share the same connection.
#[derive(Clone)]
pub struct PersistentChannel {
    shared: Arc<Shared>,
    shutdown: Arc<watch::Sender<bool>>,
    workers: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl PersistentChannel {
    /// Start the channel workers on the current tokio runtime. Inbound
    /// updates are applied to `state`.
    pub fn open(config: ChannelConfig, state: SharedState) -> Result<Self> {
        let handle = Handle::try_current().map_err(|_| ChannelError::NoRuntime)?;

        let (state_tx, _) = watch::channel(ChannelState::Connecting);
        let shared = Arc::new(Shared {
            config,
            outbound: Mutex::new(VecDeque::new()),
            outbound_ready: Notify::new(),
            closing: AtomicBool::new(false),
            state: state_tx,
        });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        info!(url = %shared.config.url, "Opening coordinator channel");
        let workers = vec![
            handle.spawn(connection_loop(shared.clone(), inbound_tx, shutdown_rx)),
            handle.spawn(receive_worker(state, inbound_rx)),
        ];

        Ok(Self {
            shared,
            shutdown: Arc::new(shutdown_tx),
            workers: Arc::new(Mutex::new(workers)),
        })
    }

    /// Queue a message for delivery. Never blocks; fails once close began.
    pub fn send(&self, message: &ChannelMessage) -> Result<()> {
        self.shared.enqueue(message)
    }

    pub fn state(&self) -> ChannelState {
        *self.shared.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ChannelState> {
        self.shared.state.subscribe()
    }

    /// Messages waiting to be accepted by a connection.
    pub fn queue_depth(&self) -> usize {
        self.shared.queue().len()
    }

    pub fn url(&self) -> &Url {
        &self.shared.config.url
    }

    /// Forward local changes of `state` to the coordinator. Changes that
    /// arrived from the coordinator are not sent back.
    pub fn bind_state(&self, state: &SharedState) -> SubscriptionId {
        let shared = self.shared.clone();
        state.subscribe_sync(move |change| {
            if change.origin != ChangeOrigin::Local {
                return;
            }
            if let Err(e) = shared.enqueue(&change.to_message()) {
                debug!(key = %change.key, error = %e, "State change not forwarded");
            }
        })
    }

    /// Drain queued messages (bounded by `drain_timeout`), stop the workers
    /// and close the socket. Later calls return immediately.
    pub async fn close(&self) -> Result<()> {
        if self.shared.closing.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shared.transition(ChannelState::Closing);

        let drain = async {
            while !self.shared.queue().is_empty() {
                sleep(DRAIN_POLL).await;
            }
        };
        if timeout(self.shared.config.drain_timeout, drain).await.is_err() {
            warn!(
                dropped = self.queue_depth(),
                "Coordinator unreachable while closing; dropping queued messages"
            );
        }

        let _ = self.shutdown.send(true);
        self.shared.outbound_ready.notify_one();

        let workers = std::mem::take(
            &mut *self.workers.lock().unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        for worker in workers {
            if let Err(e) = worker.await {
                warn!(error = %e, "Channel worker ended abnormally");
            }
        }

        self.shared.transition(ChannelState::Closed);
        info!(url = %self.shared.config.url, "Coordinator channel closed");
        Ok(())
    }
}

// ============================================================================
// Workers
// ============================================================================

#[derive(Debug)]
enum Disconnect {
    Shutdown,
    PeerClosed,
    Silent,
    Error(String),
}

async fn connection_loop(
    shared: Arc<Shared>,
    inbound: mpsc::UnboundedSender<String>,
    mut shutdown: watch::Receiver<bool>,
) {
    let config = &shared.config;
    let mut backoff = Backoff::from_config(config);
    let silence = config.heartbeat_interval + config.heartbeat_timeout;

    loop {
        if *shutdown.borrow() {
            break;
        }
        shared.transition(ChannelState::Connecting);

        let connected = tokio::select! {
            result = connect_async(config.url.as_str()) => result,
            _ = shutdown.changed() => break,
        };

        let lived = match connected {
            Ok((ws_stream, _)) => {
                let started = Instant::now();
                shared.transition(ChannelState::Connected);
                info!(url = %config.url, "Connected to coordinator");

                let (write, mut read) = ws_stream.split();
                let mut sender = tokio::spawn(send_worker(write, shared.clone(), shutdown.clone()));

                let reason = loop {
                    tokio::select! {
                        frame = timeout(silence, read.next()) => match frame {
                            Err(_) => break Disconnect::Silent,
                            Ok(None) | Ok(Some(Ok(Message::Close(_)))) => break Disconnect::PeerClosed,
                            Ok(Some(Err(e))) => break Disconnect::Error(e.to_string()),
                            Ok(Some(Ok(Message::Text(text)))) => {
                                let _ = inbound.send(text);
                            }
                            Ok(Some(Ok(_))) => {}
                        },
                        result = &mut sender => {
                            let reason = match result {
                                Ok(Err(e)) => e.to_string(),
                                Ok(Ok(())) => "send worker stopped".to_string(),
                                Err(e) => e.to_string(),
                            };
                            break Disconnect::Error(reason);
                        }
                        _ = shutdown.changed() => break Disconnect::Shutdown,
                    }
                };

                match reason {
                    Disconnect::Shutdown => {
                        // The send worker sees the same signal and sends Close.
                        let _ = sender.await;
                        break;
                    }
                    other => {
                        sender.abort();
                        warn!(reason = ?other, "Coordinator connection lost");
                    }
                }
                started.elapsed()
            }
            Err(e) => {
                warn!(url = %config.url, error = %e, "Failed to connect to coordinator");
                Duration::ZERO
            }
        };

        shared.transition(ChannelState::Connecting);
        let delay = backoff.next_delay(lived);
        if !delay.is_zero() {
            debug!(delay_ms = delay.as_millis() as u64, "Reconnecting after backoff");
        }
        tokio::select! {
            _ = sleep(delay) => {}
            _ = shutdown.changed() => break,
        }
    }
    // Dropping `inbound` here ends the receive worker once it has drained.
}

async fn send_worker(
    mut write: WsWrite,
    shared: Arc<Shared>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let period = shared.config.heartbeat_interval;
    let mut heartbeat = interval_at(Instant::now() + period, period);

    loop {
        loop {
            let Some(text) = shared.queue().front().cloned() else {
                break;
            };
            write.send(Message::Text(text)).await?;
            shared.queue().pop_front();
        }

        if *shutdown.borrow() {
            let _ = write.send(Message::Close(None)).await;
            return Ok(());
        }

        tokio::select! {
            _ = shared.outbound_ready.notified() => {}
            _ = heartbeat.tick() => write.send(Message::Ping(Vec::new())).await?,
            _ = shutdown.changed() => {}
        }
    }
}

async fn receive_worker(state: SharedState, mut inbound: mpsc::UnboundedReceiver<String>) {
    while let Some(text) = inbound.recv().await {
        match ChannelMessage::decode(&text) {
            Ok(Some(message)) => {
                if let Err(e) = state.apply_remote(&message).await {
                    warn!(attribute = %message.attribute, error = %e, "Failed to apply coordinator update");
                }
            }
            Ok(None) => debug!(frame = %text, "Ignoring coordinator message of unknown type"),
            Err(e) => debug!(error = %e, "Ignoring malformed coordinator message"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backoff() -> Backoff {
        Backoff::new(
            Duration::from_secs(1),
            Duration::from_secs(120),
            Duration::from_secs(5),
        )
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let mut b = backoff();
        let delays: Vec<u64> = (0..9)
            .map(|_| b.next_delay(Duration::from_secs(1)).as_secs())
            .collect();
        assert_eq!(delays, vec![1, 3, 7, 15, 31, 63, 120, 120, 120]);
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_backoff_resets_after_stable_connection() {
        let mut b = backoff();
        b.next_delay(Duration::ZERO);
        b.next_delay(Duration::ZERO);
        assert_eq!(b.current(), Duration::from_secs(3));

        assert_eq!(b.next_delay(Duration::from_secs(5)), Duration::ZERO);
        assert_eq!(b.next_delay(Duration::ZERO), Duration::from_secs(1));
    }

    #[test]
    fn test_config_for_client() {
        let config = ChannelConfig::for_client("https://coord.example:8443", 3).unwrap();
        assert_eq!(config.url.as_str(), "wss://coord.example:8443/ws/test/3");
        assert_eq!(config.backoff_cap, Duration::from_secs(120));
    }

    #[test]
    fn test_open_requires_runtime() {
        let config = ChannelConfig::for_client("http://127.0.0.1:9", 1).unwrap();
        assert!(matches!(
            PersistentChannel::open(config, SharedState::new()),
            Err(ChannelError::NoRuntime)
        ));
    }
}
