//! Framed JPEG stream reader for the forwarded capture socket.
//!
//! ## Wire format
//!
//! One banner when the connection opens (24 bytes, little-endian):
//!
//! ```text
//! version:      u8   (1)
//! header_size:  u8   (1)
//! pid:          u32  (4)
//! real_width:   u32  (4)
//! real_height:  u32  (4)
//! virt_width:   u32  (4)
//! virt_height:  u32  (4)
//! orientation:  u8   (1)
//! quirk_flags:  u8   (1)
//! ```
//!
//! Followed by repeated records of `length: u32` and `length` bytes of
//! JPEG (first two bytes must be the 0xFF 0xD8 magic) until close.
//!
//! Frames are published with a non-blocking send: screen capture is
//! throttled by the consumer, and a stalled consumer must drop frames
//! rather than back-pressure onto the device.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::device::{forward_to_free_port, DeviceBridge, RemoteEndpoint};
use crate::error::StfError;
use crate::service::{ErrorLatch, ServiceGate, Servicer};

/// Bounded frame channel depth; a consumer more than this far behind
/// starts losing frames.
pub const FRAME_CHANNEL_CAPACITY: usize = 3;

const DIAL_RETRIES: u32 = 10;
const DIAL_BACKOFF: Duration = Duration::from_millis(500);

// ── FrameBanner ──────────────────────────────────────────────────

/// Stream header sent by the capture helper on connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameBanner {
    pub version: u8,
    pub header_size: u8,
    pub pid: u32,
    pub real_width: u32,
    pub real_height: u32,
    pub virt_width: u32,
    pub virt_height: u32,
    pub orientation: u8,
    pub quirk_flags: u8,
}

impl FrameBanner {
    /// Encoded size on the wire.
    pub const SIZE: usize = 24;

    /// Serialize to bytes (little-endian).
    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0] = self.version;
        buf[1] = self.header_size;
        buf[2..6].copy_from_slice(&self.pid.to_le_bytes());
        buf[6..10].copy_from_slice(&self.real_width.to_le_bytes());
        buf[10..14].copy_from_slice(&self.real_height.to_le_bytes());
        buf[14..18].copy_from_slice(&self.virt_width.to_le_bytes());
        buf[18..22].copy_from_slice(&self.virt_height.to_le_bytes());
        buf[22] = self.orientation;
        buf[23] = self.quirk_flags;
        buf
    }

    /// Deserialize from bytes.
    pub fn decode(data: &[u8]) -> Result<Self, StfError> {
        if data.len() < Self::SIZE {
            return Err(StfError::BadBanner(format!(
                "banner too short: {} < {}",
                data.len(),
                Self::SIZE,
            )));
        }
        let banner = Self {
            version: data[0],
            header_size: data[1],
            pid: u32::from_le_bytes([data[2], data[3], data[4], data[5]]),
            real_width: u32::from_le_bytes([data[6], data[7], data[8], data[9]]),
            real_height: u32::from_le_bytes([data[10], data[11], data[12], data[13]]),
            virt_width: u32::from_le_bytes([data[14], data[15], data[16], data[17]]),
            virt_height: u32::from_le_bytes([data[18], data[19], data[20], data[21]]),
            orientation: data[22],
            quirk_flags: data[23],
        };
        if banner.header_size as usize != Self::SIZE {
            return Err(StfError::BadBanner(format!(
                "header size {} != {}",
                banner.header_size,
                Self::SIZE,
            )));
        }
        Ok(banner)
    }
}

// ── FrameReader ──────────────────────────────────────────────────

/// Dials the forwarded capture socket and demuxes JPEG frames onto a
/// bounded lossy channel.
pub struct FrameReader {
    device: Arc<dyn DeviceBridge>,
    socket_name: String,
    frames_tx: mpsc::Sender<Bytes>,
    frames_rx: Mutex<Option<mpsc::Receiver<Bytes>>>,
    banner: Arc<Mutex<Option<FrameBanner>>>,
    quit: Mutex<CancellationToken>,
    gate: ServiceGate,
    latch: ErrorLatch,
}

impl FrameReader {
    pub fn new(device: Arc<dyn DeviceBridge>, socket_name: impl Into<String>) -> Self {
        let (frames_tx, frames_rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);
        Self {
            device,
            socket_name: socket_name.into(),
            frames_tx,
            frames_rx: Mutex::new(Some(frames_rx)),
            banner: Arc::new(Mutex::new(None)),
            quit: Mutex::new(CancellationToken::new()),
            gate: ServiceGate::new(),
            latch: ErrorLatch::new(),
        }
    }

    /// Take the frame receiver. Yields `Some` exactly once.
    pub fn take_frames(&self) -> Option<mpsc::Receiver<Bytes>> {
        self.frames_rx.lock().unwrap().take()
    }

    /// The banner of the most recent capture session, if any.
    pub fn banner(&self) -> Option<FrameBanner> {
        *self.banner.lock().unwrap()
    }
}

#[async_trait]
impl Servicer for FrameReader {
    async fn start(&self) -> Result<(), StfError> {
        self.gate
            .start(|| async {
                self.latch.reset();
                let port = forward_to_free_port(
                    self.device.as_ref(),
                    RemoteEndpoint::Abstract(self.socket_name.clone()),
                )
                .await?;
                info!(port, socket = %self.socket_name, "capture stream forwarded");

                let token = CancellationToken::new();
                *self.quit.lock().unwrap() = token.clone();

                tokio::spawn(read_loop(
                    port,
                    self.frames_tx.clone(),
                    Arc::clone(&self.banner),
                    token,
                    self.latch.clone(),
                ));
                Ok(())
            })
            .await
    }

    async fn stop(&self) -> Result<(), StfError> {
        self.gate
            .stop(|| async {
                self.quit.lock().unwrap().cancel();
                self.latch.wait().await
            })
            .await
    }

    async fn wait(&self) -> Result<(), StfError> {
        self.latch.wait().await
    }
}

// ── Read loop ────────────────────────────────────────────────────

/// Dial-and-read retry wrapper.
///
/// The retry budget counts consecutive failures; a session that got as far
/// as a valid banner resets it, so rotation-driven helper restarts never
/// starve the budget.
async fn read_loop(
    port: u16,
    frames: mpsc::Sender<Bytes>,
    banner_slot: Arc<Mutex<Option<FrameBanner>>>,
    quit: CancellationToken,
    latch: ErrorLatch,
) {
    let mut attempts = 0u32;
    loop {
        let outcome = tokio::select! {
            outcome = read_session(port, &frames, &banner_slot) => outcome,
            _ = quit.cancelled() => {
                latch.complete_ok();
                return;
            }
        };

        let (banner_seen, err) = outcome;
        if banner_seen {
            attempts = 0;
        }
        attempts += 1;
        if attempts >= DIAL_RETRIES {
            latch.complete(Err(StfError::RetryExhausted {
                attempts,
                last: Box::new(err),
            }));
            return;
        }
        warn!(%err, attempts, "capture stream interrupted, redialing");

        tokio::select! {
            _ = tokio::time::sleep(DIAL_BACKOFF) => {}
            _ = quit.cancelled() => {
                latch.complete_ok();
                return;
            }
        }
    }
}

/// One dial-read session. Always ends in an error; the boolean reports
/// whether a valid banner was observed before the failure.
async fn read_session(
    port: u16,
    frames: &mpsc::Sender<Bytes>,
    banner_slot: &Arc<Mutex<Option<FrameBanner>>>,
) -> (bool, StfError) {
    let stream = match TcpStream::connect(("127.0.0.1", port)).await {
        Ok(s) => s,
        Err(e) => return (false, e.into()),
    };
    let mut rd = BufReader::new(stream);

    let mut header = [0u8; FrameBanner::SIZE];
    if let Err(e) = rd.read_exact(&mut header).await {
        return (false, e.into());
    }
    let banner = match FrameBanner::decode(&header) {
        Ok(b) => b,
        Err(e) => return (false, e),
    };
    info!(
        pid = banner.pid,
        virt_width = banner.virt_width,
        virt_height = banner.virt_height,
        orientation = banner.orientation,
        "capture session opened"
    );
    *banner_slot.lock().unwrap() = Some(banner);

    loop {
        let mut len_buf = [0u8; 4];
        if let Err(e) = rd.read_exact(&mut len_buf).await {
            return (true, e.into());
        }
        let len = u32::from_le_bytes(len_buf) as usize;

        let mut frame = vec![0u8; len];
        if let Err(e) = rd.read_exact(&mut frame).await {
            return (true, e.into());
        }
        if frame.len() < 2 || frame[0] != 0xFF || frame[1] != 0xD8 {
            return (true, StfError::BadJpeg);
        }

        // Consumer behind: drop the frame rather than stall the socket.
        let _ = frames.try_send(Bytes::from(frame));
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    fn banner() -> FrameBanner {
        FrameBanner {
            version: 1,
            header_size: FrameBanner::SIZE as u8,
            pid: 9355,
            real_width: 1080,
            real_height: 1920,
            virt_width: 720,
            virt_height: 720,
            orientation: 0,
            quirk_flags: 2,
        }
    }

    #[test]
    fn banner_roundtrip() {
        let b = banner();
        let decoded = FrameBanner::decode(&b.encode()).unwrap();
        assert_eq!(decoded, b);
    }

    #[test]
    fn banner_too_short() {
        assert!(matches!(
            FrameBanner::decode(&[0u8; 10]),
            Err(StfError::BadBanner(_))
        ));
    }

    #[test]
    fn banner_wrong_header_size() {
        let mut bytes = banner().encode();
        bytes[1] = 32;
        assert!(matches!(
            FrameBanner::decode(&bytes),
            Err(StfError::BadBanner(_))
        ));
    }

    fn jpeg_frame(len: usize) -> Vec<u8> {
        let mut f = vec![0u8; len];
        f[0] = 0xFF;
        f[1] = 0xD8;
        f
    }

    async fn write_frame(stream: &mut TcpStream, frame: &[u8]) {
        stream
            .write_all(&(frame.len() as u32).to_le_bytes())
            .await
            .unwrap();
        stream.write_all(frame).await.unwrap();
    }

    #[tokio::test]
    async fn session_reads_banner_and_frames() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream.write_all(&banner().encode()).await.unwrap();
            write_frame(&mut stream, &jpeg_frame(100)).await;
            write_frame(&mut stream, &jpeg_frame(64)).await;
            // Close — the session ends with a connection error.
        });

        let (tx, mut rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);
        let slot = Arc::new(Mutex::new(None));
        let (banner_seen, err) = read_session(port, &tx, &slot).await;
        server.await.unwrap();

        assert!(banner_seen);
        assert!(matches!(err, StfError::Connection(_)));
        assert_eq!(slot.lock().unwrap().unwrap().pid, 9355);

        let first = rx.recv().await.unwrap();
        assert_eq!(first.len(), 100);
        assert_eq!(&first[..2], &[0xFF, 0xD8]);
        assert_eq!(rx.recv().await.unwrap().len(), 64);
    }

    #[tokio::test]
    async fn session_rejects_bad_jpeg_magic() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream.write_all(&banner().encode()).await.unwrap();
            write_frame(&mut stream, &[0x00, 0x01, 0x02, 0x03]).await;
            // Keep the socket open long enough for the reader to fail.
            tokio::time::sleep(Duration::from_millis(200)).await;
        });

        let (tx, _rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);
        let slot = Arc::new(Mutex::new(None));
        let (banner_seen, err) = read_session(port, &tx, &slot).await;
        assert!(banner_seen);
        assert_eq!(err, StfError::BadJpeg);
        server.abort();
    }

    #[tokio::test]
    async fn session_drops_frames_when_consumer_is_behind() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream.write_all(&banner().encode()).await.unwrap();
            for _ in 0..20 {
                write_frame(&mut stream, &jpeg_frame(32)).await;
            }
        });

        // Nobody drains `rx` during the session, so at most the channel
        // capacity survives and the producer never blocks.
        let (tx, mut rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);
        let slot = Arc::new(Mutex::new(None));
        let (banner_seen, _err) = read_session(port, &tx, &slot).await;
        server.await.unwrap();
        assert!(banner_seen);

        drop(tx);
        let mut received = 0;
        while rx.recv().await.is_some() {
            received += 1;
        }
        assert!(received <= FRAME_CHANNEL_CAPACITY);
        assert!(received >= 1);
    }
}
