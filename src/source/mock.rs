use super::{
    CaptureRequest, CaptureSource, ScreencastFrame, ScreencastOptions, SourceId, SourceProvider,
};
use crate::error::{CaptureError, Result};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Scriptable source for strategy and orchestrator tests
pub struct MockSource {
    id: SourceId,
    capture_delay: Duration,
    ack_delay: Mutex<Duration>,
    identical: bool,
    screencast: bool,
    failing: AtomicBool,
    unavailable: AtomicBool,
    closed: AtomicBool,
    counter: AtomicU64,
    stops: AtomicU64,
    captures: Mutex<Vec<(Instant, CaptureRequest)>>,
    acks: Mutex<Vec<u64>>,
    subscriptions: Mutex<Vec<ScreencastOptions>>,
    emitter: Mutex<Option<mpsc::Sender<ScreencastFrame>>>,
}

impl MockSource {
    pub fn new(id: &str) -> Self {
        Self {
            id: SourceId::new(id),
            capture_delay: Duration::ZERO,
            ack_delay: Mutex::new(Duration::ZERO),
            identical: false,
            screencast: false,
            failing: AtomicBool::new(false),
            unavailable: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            counter: AtomicU64::new(0),
            stops: AtomicU64::new(0),
            captures: Mutex::new(Vec::new()),
            acks: Mutex::new(Vec::new()),
            subscriptions: Mutex::new(Vec::new()),
            emitter: Mutex::new(None),
        }
    }

    pub fn with_capture_delay(mut self, delay: Duration) -> Self {
        self.capture_delay = delay;
        self
    }

    pub fn with_ack_delay(self, delay: Duration) -> Self {
        self.set_ack_delay(delay);
        self
    }

    pub fn set_ack_delay(&self, delay: Duration) {
        *self.ack_delay.lock() = delay;
    }

    pub fn identical_frames(mut self) -> Self {
        self.identical = true;
        self
    }

    pub fn with_screencast(mut self) -> Self {
        self.screencast = true;
        self
    }

    pub fn failing(self) -> Self {
        self.failing.store(true, Ordering::SeqCst);
        self
    }

    /// Captures report the source as unavailable while the provider still
    /// hands it out
    pub fn unavailable(self) -> Self {
        self.unavailable.store(true, Ordering::SeqCst);
        self
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn captures(&self) -> Vec<(Instant, CaptureRequest)> {
        self.captures.lock().clone()
    }

    pub fn capture_count(&self) -> usize {
        self.captures.lock().len()
    }

    pub fn acks(&self) -> Vec<u64> {
        self.acks.lock().clone()
    }

    pub fn subscriptions(&self) -> Vec<ScreencastOptions> {
        self.subscriptions.lock().clone()
    }

    pub fn stops(&self) -> u64 {
        self.stops.load(Ordering::SeqCst)
    }

    /// Emit a screencast frame; `false` when nobody is subscribed
    pub async fn emit(&self, frame_index: u64) -> bool {
        let emitter = self.emitter.lock().clone();
        match emitter {
            Some(tx) => tx
                .send(ScreencastFrame {
                    data: vec![frame_index as u8; 8],
                    frame_index,
                })
                .await
                .is_ok(),
            None => false,
        }
    }
}

#[async_trait]
impl CaptureSource for MockSource {
    fn id(&self) -> SourceId {
        self.id.clone()
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn capture_once(&self, request: CaptureRequest) -> Result<Vec<u8>> {
        if self.is_closed() {
            return Err(CaptureError::SourceUnavailable.into());
        }
        self.captures.lock().push((Instant::now(), request));
        if !self.capture_delay.is_zero() {
            tokio::time::sleep(self.capture_delay).await;
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(CaptureError::SourceUnavailable.into());
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(CaptureError::Failed {
                details: "mock failure".to_string(),
            }
            .into());
        }

        if self.identical {
            Ok(vec![0xFF, 0xD8, 1, 2, 0xFF, 0xD9])
        } else {
            let n = self.counter.fetch_add(1, Ordering::SeqCst);
            Ok(n.to_be_bytes().to_vec())
        }
    }

    fn supports_screencast(&self) -> bool {
        self.screencast
    }

    async fn start_screencast(
        &self,
        options: ScreencastOptions,
    ) -> Result<mpsc::Receiver<ScreencastFrame>> {
        if !self.screencast {
            return Err(CaptureError::ScreencastUnsupported {
                source_id: self.id.to_string(),
            }
            .into());
        }
        let (tx, rx) = mpsc::channel(16);
        *self.emitter.lock() = Some(tx);
        self.subscriptions.lock().push(options);
        Ok(rx)
    }

    async fn ack_frame(&self, frame_index: u64) -> Result<()> {
        let ack_delay = *self.ack_delay.lock();
        if !ack_delay.is_zero() {
            tokio::time::sleep(ack_delay).await;
        }
        self.acks.lock().push(frame_index);
        Ok(())
    }

    async fn stop_screencast(&self) -> Result<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.emitter.lock().take();
        Ok(())
    }
}

/// Provider whose current source tests can swap or remove
pub struct MockProvider {
    current: RwLock<Option<Arc<MockSource>>>,
}

impl MockProvider {
    pub fn new(source: Arc<MockSource>) -> Arc<Self> {
        Arc::new(Self {
            current: RwLock::new(Some(source)),
        })
    }

    pub fn set(&self, source: Arc<MockSource>) {
        *self.current.write() = Some(source);
    }

    pub fn clear(&self) {
        self.current.write().take();
    }
}

impl SourceProvider for MockProvider {
    fn current(&self) -> Option<Arc<dyn CaptureSource>> {
        self.current
            .read()
            .as_ref()
            .filter(|source| !source.is_closed())
            .map(|source| Arc::clone(source) as Arc<dyn CaptureSource>)
    }
}
