//! Host-side device streaming services over a multiplexing debug bridge.
//!
//! Exposes a bridge-attached mobile device as three long-running services:
//!
//! - [`Capturer`] — a stream of JPEG frames from the on-device capture
//!   helper, restarted automatically on rotation.
//! - [`TouchClient`] — multi-pointer gesture injection over a
//!   line-oriented protocol.
//! - [`RotationWatcher`] — orientation change publish/subscribe.
//!
//! Every service implements [`Servicer`] (start/stop/wait with latched
//! terminal errors); [`MultiService`] composes several into one. The
//! bridge transport itself is supplied by the embedder as an
//! `Arc<dyn DeviceBridge>`.
//!
//! ```no_run
//! use std::sync::Arc;
//! use stf_core::{Capturer, DeviceBridge, Servicer};
//!
//! async fn stream_frames(device: Arc<dyn DeviceBridge>) -> Result<(), stf_core::StfError> {
//!     let capturer = Capturer::new(device);
//!     let mut frames = capturer.take_frames().expect("frames taken once");
//!     capturer.start().await?;
//!     while let Some(jpeg) = frames.recv().await {
//!         // hand `jpeg` to a decoder / websocket / …
//!         let _ = jpeg;
//!     }
//!     capturer.stop().await
//! }
//! ```

pub mod capture;
pub mod device;
mod error;
pub mod provision;
mod rotation;
mod service;
mod touch;

pub use capture::{
    CaptureConfig, CaptureDaemon, Capturer, FrameBanner, FrameReader, GeometryInfo, Projection,
    QualityPreset,
};
pub use device::{CommandStream, DeviceBridge, ForwardEntry, RemoteEndpoint, WriteStream};
pub use error::StfError;
pub use rotation::{RotationWatcher, Subscription, ROTATION_PKG};
pub use service::{ErrorLatch, MultiService, ServiceGate, Servicer};
pub use touch::{TouchClient, TouchCommand, TouchLimits, DEFAULT_PRESSURE};
