//! Screen capture pipeline: helper supervision plus frame streaming.
//!
//! [`CaptureDaemon`] keeps the on-device helper alive and restarts it on
//! rotation; [`FrameReader`] dials the forwarded socket and demuxes JPEG
//! frames. [`Capturer`] composes the two into one service.

pub mod daemon;
pub mod frames;
pub mod geometry;

pub use daemon::{CaptureConfig, CaptureDaemon};
pub use frames::{FrameBanner, FrameReader, FRAME_CHANNEL_CAPACITY};
pub use geometry::{GeometryInfo, Projection, QualityPreset};

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::device::DeviceBridge;
use crate::error::StfError;
use crate::service::{MultiService, Servicer};

// ── Capturer ─────────────────────────────────────────────────────

/// The full capture service: daemon and reader under one lifecycle.
pub struct Capturer {
    daemon: Arc<CaptureDaemon>,
    reader: Arc<FrameReader>,
    inner: MultiService,
}

impl Capturer {
    pub fn new(device: Arc<dyn DeviceBridge>) -> Self {
        Self::with_config(device, CaptureConfig::default())
    }

    pub fn with_config(device: Arc<dyn DeviceBridge>, config: CaptureConfig) -> Self {
        let reader = Arc::new(FrameReader::new(
            Arc::clone(&device),
            config.socket_name.clone(),
        ));
        let daemon = Arc::new(CaptureDaemon::with_config(device, config));
        let inner = MultiService::new(vec![
            Arc::clone(&daemon) as Arc<dyn Servicer>,
            Arc::clone(&reader) as Arc<dyn Servicer>,
        ]);
        Self {
            daemon,
            reader,
            inner,
        }
    }

    /// Take the JPEG frame receiver. Yields `Some` exactly once.
    pub fn take_frames(&self) -> Option<mpsc::Receiver<Bytes>> {
        self.reader.take_frames()
    }

    /// Banner of the current capture session, if one is open.
    pub fn banner(&self) -> Option<FrameBanner> {
        self.reader.banner()
    }

    /// Projection currently in effect, if the daemon has started.
    pub fn geometry(&self) -> Option<Projection> {
        self.daemon.geometry()
    }

    /// Re-bound the output resolution; restarts the helper.
    pub async fn set_quality(&self, preset: QualityPreset) {
        self.daemon.set_quality(preset).await;
    }

    /// Inform the pipeline of a rotation change; restarts the helper.
    pub async fn set_rotation(&self, rotation: u32) {
        self.daemon.set_rotation(rotation).await;
    }

    /// Sender half of the rotation channel, for wiring a rotation
    /// watcher subscription into the capture pipeline.
    pub fn rotation_sender(&self) -> mpsc::Sender<u32> {
        self.daemon.rotation_sender()
    }
}

#[async_trait]
impl Servicer for Capturer {
    async fn start(&self) -> Result<(), StfError> {
        self.inner.start().await
    }

    async fn stop(&self) -> Result<(), StfError> {
        self.inner.stop().await
    }

    async fn wait(&self) -> Result<(), StfError> {
        self.inner.wait().await
    }
}
