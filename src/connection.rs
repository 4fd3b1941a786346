//! Outbound streaming connection with automatic reconnect.
//!
//! `Disconnected -> Connecting -> Open`, back to `Disconnected` when the remote
//! goes away (a reconnect is scheduled after a fixed delay), and `Closed` once
//! the owner calls [`ConnectionManager::close`]. `Closed` is terminal: every
//! reconnect path re-checks the active flag under the phase lock before acting.

use crate::config::ConnectionConfig;
use crate::error::{ConnectionError, PagecastError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::{FutureExt, Sink, SinkExt, StreamExt};
use parking_lot::Mutex;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Bound on flushing and closing the sink once the pump stops
const SINK_CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Message queued for the remote consumer
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// Header-prefixed frame, sent as a binary message
    Frame(Bytes),
    /// Structured diagnostics, sent as a text message
    Text(String),
}

/// An open channel: a sink for outbound messages and a future that resolves
/// once the remote side has gone away
pub struct Link {
    pub sink: Pin<Box<dyn Sink<Outbound, Error = PagecastError> + Send>>,
    pub closed: BoxFuture<'static, ()>,
}

/// Opens the underlying channel for a connection manager
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn open(&self, address: &str) -> Result<Link>;
}

/// WebSocket transport
#[derive(Debug, Default, Clone, Copy)]
pub struct WebSocketConnector;

#[async_trait]
impl Connector for WebSocketConnector {
    async fn open(&self, address: &str) -> Result<Link> {
        let (stream, _) = tokio_tungstenite::connect_async(address)
            .await
            .map_err(|e| ConnectionError::OpenFailed {
                address: address.to_string(),
                details: e.to_string(),
            })?;

        let (write, mut read) = stream.split();

        let sink = write
            .with(|outbound: Outbound| async move {
                Ok::<_, tokio_tungstenite::tungstenite::Error>(match outbound {
                    Outbound::Frame(data) => Message::Binary(data),
                    Outbound::Text(text) => Message::Text(text.into()),
                })
            })
            .sink_map_err(|e| {
                PagecastError::from(ConnectionError::SendFailed {
                    details: e.to_string(),
                })
            });

        let closed = async move {
            while let Some(message) = read.next().await {
                match message {
                    Ok(Message::Close(frame)) => {
                        debug!("Remote closed WebSocket: {:?}", frame);
                        break;
                    }
                    Err(e) => {
                        debug!("WebSocket read error: {}", e);
                        break;
                    }
                    Ok(_) => {}
                }
            }
        }
        .boxed();

        Ok(Link {
            sink: Box::pin(sink),
            closed,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    Disconnected,
    Connecting,
    Open,
    Closed,
}

struct Inner {
    address: String,
    reconnect_delay: Duration,
    queue_capacity: usize,
    connector: Arc<dyn Connector>,
    active: AtomicBool,
    ready: AtomicBool,
    phase: Mutex<ConnectionPhase>,
    sender: Mutex<Option<mpsc::Sender<Outbound>>>,
    shutdown: CancellationToken,
    connect_attempts: AtomicU64,
}

/// Owns one outbound connection for a streaming session
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(
        address: impl Into<String>,
        config: &ConnectionConfig,
        connector: Arc<dyn Connector>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                address: address.into(),
                reconnect_delay: config.reconnect_delay(),
                queue_capacity: config.send_queue_capacity.max(1),
                connector,
                active: AtomicBool::new(true),
                ready: AtomicBool::new(false),
                phase: Mutex::new(ConnectionPhase::Disconnected),
                sender: Mutex::new(None),
                shutdown: CancellationToken::new(),
                connect_attempts: AtomicU64::new(0),
            }),
        }
    }

    /// Manager backed by a WebSocket connection
    pub fn websocket(address: impl Into<String>, config: &ConnectionConfig) -> Self {
        Self::new(address, config, Arc::new(WebSocketConnector))
    }

    /// Open the channel unless one is already open or being opened.
    ///
    /// Does nothing once the manager is closed.
    pub fn connect(&self) {
        {
            let mut phase = self.inner.phase.lock();
            if !self.inner.active.load(Ordering::SeqCst) {
                return;
            }
            match *phase {
                ConnectionPhase::Disconnected => *phase = ConnectionPhase::Connecting,
                ConnectionPhase::Connecting | ConnectionPhase::Open | ConnectionPhase::Closed => {
                    return
                }
            }
        }

        let inner = Arc::clone(&self.inner);
        tokio::spawn(establish(inner));
    }

    /// Cheap, non-blocking readiness check: open and with room in the
    /// outbound queue
    pub fn is_ready(&self) -> bool {
        self.inner.ready.load(Ordering::SeqCst)
            && self
                .inner
                .sender
                .lock()
                .as_ref()
                .map_or(false, |tx| !tx.is_closed() && tx.capacity() > 0)
    }

    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::SeqCst)
    }

    pub fn phase(&self) -> ConnectionPhase {
        *self.inner.phase.lock()
    }

    pub fn address(&self) -> &str {
        &self.inner.address
    }

    /// Number of times the underlying channel was opened or attempted
    pub fn connect_attempts(&self) -> u64 {
        self.inner.connect_attempts.load(Ordering::SeqCst)
    }

    /// Queue a message for the writer without waiting.
    ///
    /// A full queue means the consumer is not keeping up; the message is
    /// refused with [`ConnectionError::QueueFull`] and the caller drops it.
    pub fn send(&self, outbound: Outbound) -> Result<()> {
        let tx = self
            .inner
            .sender
            .lock()
            .clone()
            .ok_or(ConnectionError::NotReady)?;
        if !self.inner.ready.load(Ordering::SeqCst) {
            return Err(ConnectionError::NotReady.into());
        }
        tx.try_send(outbound).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => PagecastError::from(ConnectionError::QueueFull),
            mpsc::error::TrySendError::Closed(_) => PagecastError::from(ConnectionError::Closed),
        })
    }

    pub fn send_frame(&self, data: impl Into<Bytes>) -> Result<()> {
        self.send(Outbound::Frame(data.into()))
    }

    pub fn send_text(&self, text: String) -> Result<()> {
        self.send(Outbound::Text(text))
    }

    /// Close for good. Returns `false` if the manager was already closed.
    pub fn close(&self) -> bool {
        {
            let mut phase = self.inner.phase.lock();
            if *phase == ConnectionPhase::Closed {
                return false;
            }
            *phase = ConnectionPhase::Closed;
            self.inner.active.store(false, Ordering::SeqCst);
            self.inner.ready.store(false, Ordering::SeqCst);
            self.inner.sender.lock().take();
        }
        self.inner.shutdown.cancel();
        info!("Connection to {} closed", self.inner.address);
        true
    }
}

async fn establish(inner: Arc<Inner>) {
    inner.connect_attempts.fetch_add(1, Ordering::SeqCst);
    debug!("Connecting to {}", inner.address);

    let opened = tokio::select! {
        _ = inner.shutdown.cancelled() => return,
        result = inner.connector.open(&inner.address) => result,
    };

    match opened {
        Ok(link) => {
            let (tx, rx) = mpsc::channel(inner.queue_capacity);
            {
                let mut phase = inner.phase.lock();
                if !inner.active.load(Ordering::SeqCst) {
                    return;
                }
                *phase = ConnectionPhase::Open;
                *inner.sender.lock() = Some(tx);
                inner.ready.store(true, Ordering::SeqCst);
            }
            info!("Connected to {}", inner.address);

            pump(link, rx, &inner.shutdown).await;

            if inner.active.load(Ordering::SeqCst) {
                warn!("Connection to {} lost", inner.address);
            }
        }
        Err(e) => {
            warn!("Failed to connect to {}: {}", inner.address, e);
        }
    }

    {
        let mut phase = inner.phase.lock();
        inner.ready.store(false, Ordering::SeqCst);
        inner.sender.lock().take();
        if *phase != ConnectionPhase::Closed {
            *phase = ConnectionPhase::Disconnected;
        }
    }

    schedule_reconnect(inner);
}

fn schedule_reconnect(inner: Arc<Inner>) {
    if !inner.active.load(Ordering::SeqCst) {
        return;
    }
    let delay = inner.reconnect_delay;
    debug!("Reconnecting to {} in {:?}", inner.address, delay);

    tokio::spawn(async move {
        tokio::select! {
            _ = inner.shutdown.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
        ConnectionManager { inner }.connect();
    });
}

/// Forward queued messages until the remote closes, the queue is dropped,
/// or the manager shuts down
async fn pump(link: Link, mut rx: mpsc::Receiver<Outbound>, shutdown: &CancellationToken) {
    let Link {
        mut sink,
        mut closed,
    } = link;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = &mut closed => {
                debug!("Remote side closed the connection");
                break;
            }
            outbound = rx.recv() => match outbound {
                Some(outbound) => {
                    let written = tokio::select! {
                        _ = shutdown.cancelled() => break,
                        written = sink.send(outbound) => written,
                    };
                    if let Err(e) = written {
                        warn!("Send failed: {}", e);
                        break;
                    }
                    trace!("Outbound message written");
                }
                None => break,
            }
        }
    }

    match tokio::time::timeout(SINK_CLOSE_TIMEOUT, sink.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!("Error closing sink: {}", e),
        Err(_) => debug!("Sink did not close within {:?}", SINK_CLOSE_TIMEOUT),
    }
}
