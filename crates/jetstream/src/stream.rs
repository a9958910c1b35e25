//! Jetstream websocket subscription management.
//!
//! The connection owns a background read task that parses frames and
//! forwards them as typed signals over an unbounded channel. Reconnection
//! is handled here with capped exponential backoff; the orchestrator only
//! observes `Connected` / `Disconnected` signals. Nothing is buffered
//! beyond the channel: if downstream is slow, events accumulate there,
//! not in this component.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::{Mutex, RwLock, mpsc, watch};
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};
use url::Url;

use crate::error::{Result, StreamError};
use crate::event::{JetstreamEvent, parse_event};

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Signal received from the stream.
#[derive(Debug, Clone)]
pub enum StreamSignal {
    /// The subscription (re)connected.
    Connected,
    /// The subscription dropped; a reconnect attempt follows.
    Disconnected { reason: String },
    /// One parsed commit-stream frame.
    Event(JetstreamEvent),
}

/// Subscription configuration.
#[derive(Debug, Clone)]
pub struct JetstreamConfig {
    pub endpoint: String,
    pub wanted_collections: Vec<String>,
    pub connect_timeout: Duration,
    pub reconnect_base_delay: Duration,
    pub reconnect_max_delay: Duration,
}

impl Default for JetstreamConfig {
    fn default() -> Self {
        Self {
            endpoint: "wss://jetstream2.us-east.bsky.network/subscribe".to_string(),
            wanted_collections: vec![crate::event::POST_COLLECTION.to_string()],
            connect_timeout: Duration::from_secs(10),
            reconnect_base_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(30),
        }
    }
}

/// Jetstream subscription.
#[derive(Debug)]
pub struct JetstreamConnection {
    url: Url,
    config: JetstreamConfig,
    state: Arc<RwLock<ConnectionState>>,
    signal_tx: mpsc::UnboundedSender<StreamSignal>,
    signal_rx: Arc<Mutex<mpsc::UnboundedReceiver<StreamSignal>>>,
    skipped_malformed: Arc<AtomicU64>,
    shutdown_tx: watch::Sender<bool>,
    read_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl JetstreamConnection {
    /// Create a new subscription (not connected until `connect`).
    pub fn new(config: JetstreamConfig) -> Result<Self> {
        let mut url = Url::parse(&config.endpoint)
            .map_err(|error| StreamError::InvalidUrl(error.to_string()))?;
        if url.scheme() != "ws" && url.scheme() != "wss" {
            return Err(StreamError::InvalidUrl(format!(
                "URL must use ws:// or wss:// scheme, got: {}",
                url.scheme()
            )));
        }
        {
            let mut query = url.query_pairs_mut();
            for collection in &config.wanted_collections {
                query.append_pair("wanted_collections", collection);
            }
        }

        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            url,
            config,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            signal_tx,
            signal_rx: Arc::new(Mutex::new(signal_rx)),
            skipped_malformed: Arc::new(AtomicU64::new(0)),
            shutdown_tx,
            read_task: Mutex::new(None),
        })
    }

    /// Subscription URL as string.
    pub fn url(&self) -> &str {
        self.url.as_str()
    }

    /// Current connection state.
    pub async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Malformed frames skipped so far.
    pub fn skipped_malformed(&self) -> u64 {
        self.skipped_malformed.load(Ordering::Relaxed)
    }

    /// Start the background subscription loop.
    pub async fn connect(&self) -> Result<()> {
        let mut task_guard = self.read_task.lock().await;
        if task_guard.is_some() {
            return Err(StreamError::AlreadyConnected);
        }

        let url = self.url.to_string();
        let state = Arc::clone(&self.state);
        let signal_tx = self.signal_tx.clone();
        let skipped = Arc::clone(&self.skipped_malformed);
        let config = self.config.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let task = tokio::spawn(async move {
            let mut delay = config.reconnect_base_delay;
            loop {
                if *shutdown_rx.borrow() {
                    break;
                }
                *state.write().await = ConnectionState::Connecting;

                let connected = timeout(config.connect_timeout, connect_async(url.as_str()))
                    .await
                    .map_err(|_| {
                        StreamError::Timeout(format!(
                            "connection timeout after {:?}",
                            config.connect_timeout
                        ))
                    })
                    .and_then(|result| {
                        result.map_err(|error| StreamError::WebSocket(error.to_string()))
                    });

                let (stream, _response) = match connected {
                    Ok(pair) => pair,
                    Err(error) => {
                        warn!("jetstream connect failed: {}", error);
                        *state.write().await = ConnectionState::Disconnected;
                        if signal_tx
                            .send(StreamSignal::Disconnected {
                                reason: error.to_string(),
                            })
                            .is_err()
                        {
                            break;
                        }
                        if wait_or_shutdown(&mut shutdown_rx, delay).await {
                            break;
                        }
                        delay = (delay * 2).min(config.reconnect_max_delay);
                        continue;
                    }
                };

                *state.write().await = ConnectionState::Connected;
                if signal_tx.send(StreamSignal::Connected).is_err() {
                    break;
                }
                delay = config.reconnect_base_delay;

                let (_writer, mut reader) = stream.split();
                let reason = loop {
                    tokio::select! {
                        changed = shutdown_rx.changed() => {
                            if changed.is_err() || *shutdown_rx.borrow() {
                                break None;
                            }
                        }
                        frame = reader.next() => match frame {
                            Some(Ok(Message::Text(text))) => match parse_event(text.as_str()) {
                                Ok(event) => {
                                    if signal_tx.send(StreamSignal::Event(event)).is_err() {
                                        break None;
                                    }
                                }
                                Err(error) => {
                                    skipped.fetch_add(1, Ordering::Relaxed);
                                    debug!("skipping malformed jetstream frame: {}", error);
                                }
                            },
                            Some(Ok(Message::Ping(payload))) => {
                                debug!("received ping ({} bytes)", payload.len());
                            }
                            Some(Ok(Message::Close(_))) => break Some("server closed".to_string()),
                            Some(Ok(_)) => {}
                            Some(Err(error)) => break Some(error.to_string()),
                            None => break Some("stream ended".to_string()),
                        }
                    }
                };

                *state.write().await = ConnectionState::Disconnected;
                let Some(reason) = reason else { break };
                warn!("jetstream disconnected: {}", reason);
                if signal_tx
                    .send(StreamSignal::Disconnected { reason })
                    .is_err()
                {
                    break;
                }
                if wait_or_shutdown(&mut shutdown_rx, delay).await {
                    break;
                }
                delay = (delay * 2).min(config.reconnect_max_delay);
            }

            *state.write().await = ConnectionState::Disconnected;
        });

        *task_guard = Some(task);
        Ok(())
    }

    /// Receive the next signal.
    pub async fn recv(&self) -> Option<StreamSignal> {
        self.signal_rx.lock().await.recv().await
    }

    /// Stop the subscription loop.
    pub async fn disconnect(&self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(task) = self.read_task.lock().await.take() {
            task.abort();
            let _ = task.await;
        }
        *self.state.write().await = ConnectionState::Disconnected;
    }
}

/// Sleep for `delay`, returning early (true) when shutdown is signalled.
async fn wait_or_shutdown(shutdown_rx: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        changed = shutdown_rx.changed() => changed.is_err() || *shutdown_rx.borrow(),
    }
}
