use super::{
    CaptureRequest, CaptureSource, ScreencastFrame, ScreencastOptions, SourceId, SourceProvider,
};
use crate::error::{CaptureError, Result};
use async_trait::async_trait;
use image::codecs::jpeg::JpegEncoder;
use image::ColorType;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

/// Frames emitted but not yet acknowledged before the screencast pauses
const MAX_PENDING_ACKS: u64 = 2;

/// Test-pattern source that renders and JPEG-encodes frames in process
pub struct SyntheticSource {
    id: SourceId,
    width: u32,
    height: u32,
    capture_delay: Duration,
    animate: bool,
    screencast: bool,
    tick: AtomicU64,
    closed: AtomicBool,
    emitted: Arc<AtomicU64>,
    acked: Arc<AtomicU64>,
    screencast_token: Mutex<Option<CancellationToken>>,
}

impl SyntheticSource {
    pub fn new(id: impl Into<String>, width: u32, height: u32) -> Self {
        Self {
            id: SourceId::new(id),
            width: width.max(1),
            height: height.max(1),
            capture_delay: Duration::ZERO,
            animate: true,
            screencast: false,
            tick: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            emitted: Arc::new(AtomicU64::new(0)),
            acked: Arc::new(AtomicU64::new(0)),
            screencast_token: Mutex::new(None),
        }
    }

    /// Artificial time each capture takes
    pub fn with_capture_delay(mut self, delay: Duration) -> Self {
        self.capture_delay = delay;
        self
    }

    /// Render the same frame every time when disabled
    pub fn with_animation(mut self, animate: bool) -> Self {
        self.animate = animate;
        self
    }

    /// Advertise source-driven emission
    pub fn with_screencast(mut self, screencast: bool) -> Self {
        self.screencast = screencast;
        self
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(token) = self.screencast_token.lock().take() {
            token.cancel();
        }
    }

    fn next_phase(&self) -> u64 {
        if self.animate {
            self.tick.fetch_add(1, Ordering::Relaxed)
        } else {
            0
        }
    }

    fn dimensions(&self, scale: f64) -> (u32, u32) {
        let scale = scale.clamp(0.01, 1.0);
        (
            ((self.width as f64 * scale).round() as u32).max(1),
            ((self.height as f64 * scale).round() as u32).max(1),
        )
    }
}

/// Moving diagonal gradient encoded as JPEG
fn render_frame(width: u32, height: u32, phase: u64, quality: u8) -> Result<Vec<u8>> {
    let mut pixels = Vec::with_capacity((width * height * 3) as usize);
    let shift = (phase * 4 % 256) as u32;
    for y in 0..height {
        for x in 0..width {
            pixels.push(((x + shift) % 256) as u8);
            pixels.push(((y + shift) % 256) as u8);
            pixels.push(((x + y) / 2 % 256) as u8);
        }
    }

    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100))
        .encode(&pixels, width, height, ColorType::Rgb8)
        .map_err(|e| CaptureError::Encoding {
            details: e.to_string(),
        })?;
    Ok(out)
}

#[async_trait]
impl CaptureSource for SyntheticSource {
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
        if !self.capture_delay.is_zero() {
            tokio::time::sleep(self.capture_delay).await;
        }

        let (width, height) = self.dimensions(request.scale);
        let phase = self.next_phase();
        let quality = request.quality;
        let frame = tokio::task::spawn_blocking(move || render_frame(width, height, phase, quality))
            .await
            .map_err(|e| CaptureError::Failed {
                details: format!("render task failed: {}", e),
            })??;

        trace!("Synthetic capture {} produced {} bytes", self.id, frame.len());
        Ok(frame)
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
        if self.is_closed() {
            return Err(CaptureError::SourceUnavailable.into());
        }

        let token = CancellationToken::new();
        if let Some(previous) = self.screencast_token.lock().replace(token.clone()) {
            previous.cancel();
        }
        // Frames buffered for an earlier subscriber are never acknowledged
        self.acked
            .fetch_max(self.emitted.load(Ordering::SeqCst), Ordering::SeqCst);

        let (tx, rx) = mpsc::channel(4);
        let (width, height) = self.dimensions(options.scale);
        let interval = Duration::from_millis(1000 / u64::from(options.max_fps.max(1)));
        let emitted = Arc::clone(&self.emitted);
        let acked = Arc::clone(&self.acked);
        let animate = self.animate;
        let id = self.id.clone();

        info!("Synthetic screencast started on {} ({}x{})", id, width, height);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            let mut phase = 0u64;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                if emitted
                    .load(Ordering::SeqCst)
                    .saturating_sub(acked.load(Ordering::SeqCst))
                    >= MAX_PENDING_ACKS
                {
                    continue;
                }

                let frame_phase = if animate { phase } else { 0 };
                phase += 1;
                let quality = options.quality;
                let data = match tokio::task::spawn_blocking(move || {
                    render_frame(width, height, frame_phase, quality)
                })
                .await
                {
                    Ok(Ok(data)) => data,
                    _ => continue,
                };

                let frame_index = emitted.fetch_add(1, Ordering::SeqCst) + 1;
                if tx.send(ScreencastFrame { data, frame_index }).await.is_err() {
                    break;
                }
            }
            debug!("Synthetic screencast on {} stopped", id);
        });

        Ok(rx)
    }

    async fn ack_frame(&self, frame_index: u64) -> Result<()> {
        self.acked.fetch_max(frame_index, Ordering::SeqCst);
        Ok(())
    }

    async fn stop_screencast(&self) -> Result<()> {
        if let Some(token) = self.screencast_token.lock().take() {
            token.cancel();
        }
        Ok(())
    }
}

/// Provider whose active source can be swapped to simulate navigation
pub struct SyntheticProvider {
    current: RwLock<Option<Arc<SyntheticSource>>>,
}

impl SyntheticProvider {
    pub fn new(source: SyntheticSource) -> Self {
        Self {
            current: RwLock::new(Some(Arc::new(source))),
        }
    }

    /// Replace the active source with a new target
    pub fn navigate(&self, source: SyntheticSource) {
        let previous = self.current.write().replace(Arc::new(source));
        if let Some(previous) = previous {
            previous.close();
        }
    }

    /// Make the source permanently unavailable
    pub fn close(&self) {
        if let Some(previous) = self.current.write().take() {
            previous.close();
        }
    }
}

impl SourceProvider for SyntheticProvider {
    fn current(&self) -> Option<Arc<dyn CaptureSource>> {
        self.current
            .read()
            .as_ref()
            .filter(|source| !source.is_closed())
            .map(|source| Arc::clone(source) as Arc<dyn CaptureSource>)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_capture_produces_jpeg() {
        let source = SyntheticSource::new("page-1", 64, 48);
        let frame = source
            .capture_once(CaptureRequest {
                quality: 70,
                scale: 0.5,
            })
            .await
            .unwrap();

        assert_eq!(&frame[..2], &[0xFF, 0xD8]);
        assert_eq!(&frame[frame.len() - 2..], &[0xFF, 0xD9]);
    }

    #[tokio::test]
    async fn test_static_source_repeats_frames() {
        let source = SyntheticSource::new("page-1", 32, 32).with_animation(false);
        let request = CaptureRequest {
            quality: 80,
            scale: 1.0,
        };
        let first = source.capture_once(request).await.unwrap();
        let second = source.capture_once(request).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_closed_source_fails() {
        let source = SyntheticSource::new("page-1", 32, 32);
        source.close();
        let result = source
            .capture_once(CaptureRequest {
                quality: 80,
                scale: 1.0,
            })
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_resubscribe_after_unacked_frames_emits() {
        let source = SyntheticSource::new("page-1", 16, 16).with_screencast(true);
        let options = ScreencastOptions {
            quality: 60,
            scale: 1.0,
            max_fps: 20,
        };

        let first = source.start_screencast(options).await.unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;
        drop(first);
        source.stop_screencast().await.unwrap();

        let mut second = source.start_screencast(options).await.unwrap();
        let frame = tokio::time::timeout(Duration::from_secs(2), second.recv())
            .await
            .expect("no frame after re-subscribing")
            .unwrap();
        assert!(frame.frame_index > MAX_PENDING_ACKS);

        source.ack_frame(frame.frame_index).await.unwrap();
        let next = tokio::time::timeout(Duration::from_secs(2), second.recv())
            .await
            .expect("emission stalled after ack")
            .unwrap();
        assert!(next.frame_index > frame.frame_index);
        source.stop_screencast().await.unwrap();
    }

    #[tokio::test]
    async fn test_provider_navigation_changes_identity() {
        let provider = SyntheticProvider::new(SyntheticSource::new("page-1", 8, 8));
        assert_eq!(provider.current().unwrap().id().as_str(), "page-1");

        provider.navigate(SyntheticSource::new("page-2", 8, 8));
        assert_eq!(provider.current().unwrap().id().as_str(), "page-2");

        provider.close();
        assert!(provider.current().is_none());
    }
}
