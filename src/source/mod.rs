//! Capture source collaborator.
//!
//! The engine that physically obtains pixels (a browser page, a compositor)
//! lives outside this crate. These traits are the narrow surface the
//! strategies consume.

#[cfg(test)]
pub(crate) mod mock;
#[cfg(feature = "synthetic")]
mod synthetic;

#[cfg(feature = "synthetic")]
pub use synthetic::{SyntheticProvider, SyntheticSource};

use crate::error::{CaptureError, Result};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Identity of a capture source; a new id means a new target
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceId(String);

impl SourceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Parameters for a single still capture
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CaptureRequest {
    pub quality: u8,
    pub scale: f64,
}

/// Parameters for a source-driven screencast
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScreencastOptions {
    pub quality: u8,
    pub scale: f64,
    /// Upper bound on the emission rate requested from the source
    pub max_fps: u32,
}

/// One frame emitted by a screencast; must be acknowledged by index
#[derive(Debug, Clone, PartialEq)]
pub struct ScreencastFrame {
    pub data: Vec<u8>,
    pub frame_index: u64,
}

#[async_trait]
pub trait CaptureSource: Send + Sync {
    fn id(&self) -> SourceId;

    /// A closed source will never produce frames again
    fn is_closed(&self) -> bool;

    /// Capture one compressed frame
    async fn capture_once(&self, request: CaptureRequest) -> Result<Vec<u8>>;

    fn supports_screencast(&self) -> bool {
        false
    }

    /// Begin source-driven emission; frames arrive on the returned channel
    async fn start_screencast(
        &self,
        _options: ScreencastOptions,
    ) -> Result<mpsc::Receiver<ScreencastFrame>> {
        Err(CaptureError::ScreencastUnsupported {
            source_id: self.id().to_string(),
        }
        .into())
    }

    /// Tell the source the frame was consumed so it keeps emitting
    async fn ack_frame(&self, _frame_index: u64) -> Result<()> {
        Ok(())
    }

    async fn stop_screencast(&self) -> Result<()> {
        Ok(())
    }
}

/// Resolves the source a session should currently capture from
pub trait SourceProvider: Send + Sync {
    /// `None` means the source is permanently gone
    fn current(&self) -> Option<Arc<dyn CaptureSource>>;
}

/// Provider pinned to a single source
pub struct FixedSourceProvider {
    source: Arc<dyn CaptureSource>,
}

impl FixedSourceProvider {
    pub fn new(source: Arc<dyn CaptureSource>) -> Self {
        Self { source }
    }
}

impl SourceProvider for FixedSourceProvider {
    fn current(&self) -> Option<Arc<dyn CaptureSource>> {
        if self.source.is_closed() {
            None
        } else {
            Some(Arc::clone(&self.source))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockSource;
    use super::*;

    #[test]
    fn test_fixed_provider_tracks_source_lifetime() {
        let source = Arc::new(MockSource::new("page-1"));
        let provider = FixedSourceProvider::new(source.clone());
        assert_eq!(provider.current().unwrap().id(), SourceId::new("page-1"));

        source.close();
        assert!(provider.current().is_none());
    }

    #[tokio::test]
    async fn test_default_screencast_is_unsupported() {
        let source = MockSource::new("page-1");
        let result = source
            .start_screencast(ScreencastOptions {
                quality: 80,
                scale: 1.0,
                max_fps: 10,
            })
            .await;
        assert!(result.is_err());
        assert_eq!(SourceId::new("page-1").to_string(), "page-1");
    }
}
