//! On-device capture helper supervision.
//!
//! The helper binds its output projection at startup and cannot rotate
//! live, so the daemon keeps it running under a restart loop: whenever a
//! rotation value arrives the current helper is killed and a fresh one is
//! launched with the new projection. A helper that dies *without* a
//! pending rotation is an unsolicited crash and becomes the service's
//! terminal error.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::capture::geometry::{GeometryInfo, Projection, QualityPreset};
use crate::device::shell::{kill_by_name, SIGKILL};
use crate::device::{CommandStream, DeviceBridge};
use crate::error::StfError;
use crate::provision::{ensure_artifacts, CAPTURE_ARTIFACTS};
use crate::service::{ErrorLatch, ServiceGate, Servicer};

const HELPER_ENV: &str = "LD_LIBRARY_PATH=/data/local/tmp";
const PROBE_RETRIES: u32 = 3;
const PROBE_BACKOFF: Duration = Duration::from_millis(100);
const ROTATION_SEND_TIMEOUT: Duration = Duration::from_millis(100);

// ── CaptureConfig ────────────────────────────────────────────────

/// Configuration for [`CaptureDaemon`].
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Square bound applied to both virtual dimensions.
    pub virt_bound: u32,
    /// Abstract socket name the helper listens on.
    pub socket_name: String,
    /// Primary helper binary path.
    pub helper_path: String,
    /// Fallback helper for devices that reject the primary build.
    pub fallback_path: String,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            virt_bound: QualityPreset::Q720.bound(),
            socket_name: "minicap".into(),
            helper_path: "/data/local/tmp/minicap".into(),
            fallback_path: "/data/local/tmp/minicap-nopie".into(),
        }
    }
}

impl CaptureConfig {
    /// Start from a quality preset instead of the 720 default.
    pub fn with_quality(mut self, preset: QualityPreset) -> Self {
        self.virt_bound = preset.bound();
        self
    }
}

// ── Shared projection state ──────────────────────────────────────

#[derive(Debug, Clone)]
struct HelperState {
    real_width: u32,
    real_height: u32,
    virt_width: u32,
    virt_height: u32,
    rotation: u32,
    /// Helper binary chosen by the smoke test.
    binary: String,
}

impl HelperState {
    fn projection(&self) -> Projection {
        Projection {
            real_width: self.real_width,
            real_height: self.real_height,
            virt_width: self.virt_width,
            virt_height: self.virt_height,
            rotation: self.rotation,
        }
    }

    /// Process name as it appears in `ps` output.
    fn process_name(&self) -> &str {
        self.binary.rsplit('/').next().unwrap_or(&self.binary)
    }
}

// ── CaptureDaemon ────────────────────────────────────────────────

/// Keeps the on-device capture helper provisioned, launched and
/// restarted across rotation changes.
pub struct CaptureDaemon {
    device: Arc<dyn DeviceBridge>,
    config: CaptureConfig,
    state: Arc<Mutex<Option<HelperState>>>,
    rotation_tx: mpsc::Sender<u32>,
    rotation_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<u32>>>,
    quit: Mutex<CancellationToken>,
    gate: ServiceGate,
    latch: ErrorLatch,
}

impl CaptureDaemon {
    pub fn new(device: Arc<dyn DeviceBridge>) -> Self {
        Self::with_config(device, CaptureConfig::default())
    }

    pub fn with_config(device: Arc<dyn DeviceBridge>, config: CaptureConfig) -> Self {
        let (rotation_tx, rotation_rx) = mpsc::channel(1);
        Self {
            device,
            config,
            state: Arc::new(Mutex::new(None)),
            rotation_tx,
            rotation_rx: Arc::new(tokio::sync::Mutex::new(rotation_rx)),
            quit: Mutex::new(CancellationToken::new()),
            gate: ServiceGate::new(),
            latch: ErrorLatch::new(),
        }
    }

    /// Geometry recorded by the last probe, if the daemon has started.
    pub fn geometry(&self) -> Option<Projection> {
        self.state.lock().unwrap().as_ref().map(|s| s.projection())
    }

    /// Sender half of the rotation channel, for wiring a rotation
    /// watcher subscription into the restart loop.
    pub fn rotation_sender(&self) -> mpsc::Sender<u32> {
        self.rotation_tx.clone()
    }

    /// Feed a rotation value into the restart loop.
    ///
    /// The send is bounded by a short timeout so a daemon whose loop is
    /// not yet (or no longer) draining never blocks the caller.
    pub async fn set_rotation(&self, rotation: u32) {
        if self
            .rotation_tx
            .send_timeout(rotation, ROTATION_SEND_TIMEOUT)
            .await
            .is_err()
        {
            debug!(rotation, "rotation value dropped, restart loop not draining");
        }
    }

    /// Re-bound both virtual dimensions and restart the helper by
    /// replaying the current rotation through the rotation channel.
    pub async fn set_quality(&self, preset: QualityPreset) {
        let rotation = {
            let mut state = self.state.lock().unwrap();
            match state.as_mut() {
                Some(s) => {
                    s.virt_width = preset.bound();
                    s.virt_height = preset.bound();
                    s.rotation
                }
                None => return,
            }
        };
        self.set_rotation(rotation).await;
    }

    /// Probe the helper's `-i` output into a [`GeometryInfo`].
    async fn probe(&self, binary: &str) -> Result<GeometryInfo, StfError> {
        let out = self.device.run_shell(&[HELPER_ENV, binary, "-i"]).await?;
        let info: GeometryInfo = serde_json::from_str(out.trim())?;
        Ok(info)
    }

    /// Probe with backoff — the device briefly reports resource-busy
    /// right after a previous helper died.
    async fn probe_with_retry(&self, binary: &str) -> Result<GeometryInfo, StfError> {
        let mut last = StfError::CaptureUnsupported;
        for attempt in 0..PROBE_RETRIES {
            match self.probe(binary).await {
                Ok(info) => return Ok(info),
                Err(e) => {
                    warn!(%e, attempt, binary, "geometry probe failed");
                    last = e;
                }
            }
            if attempt + 1 < PROBE_RETRIES {
                tokio::time::sleep(PROBE_BACKOFF).await;
            }
        }
        Err(last)
    }

    /// Take a one-shot screenshot and verify it looks like a JPEG.
    async fn smoke_test(&self, binary: &str, projection: &Projection) -> Result<(), StfError> {
        let proj = projection.to_string();
        let mut stream = self
            .device
            .open_command(&[HELPER_ENV, binary, "-P", proj.as_str(), "-s"])
            .await?;
        let mut out = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut stream, &mut out).await?;
        if out.len() < 2 || out[0] != 0xFF || out[1] != 0xD8 {
            return Err(StfError::BadJpeg);
        }
        Ok(())
    }

    /// Pick the first helper variant whose probe and screenshot both
    /// work; record the resulting projection state.
    async fn select_helper(&self) -> Result<(), StfError> {
        let candidates = [
            self.config.helper_path.as_str(),
            self.config.fallback_path.as_str(),
        ];
        for binary in candidates {
            let info = match self.probe_with_retry(binary).await {
                Ok(info) => info,
                Err(_) => continue,
            };
            let state = HelperState {
                real_width: info.width,
                real_height: info.height,
                virt_width: self.config.virt_bound,
                virt_height: self.config.virt_bound,
                rotation: info.rotation,
                binary: binary.to_string(),
            };
            match self.smoke_test(binary, &state.projection()).await {
                Ok(()) => {
                    info!(
                        binary,
                        width = info.width,
                        height = info.height,
                        rotation = info.rotation,
                        "capture helper selected"
                    );
                    *self.state.lock().unwrap() = Some(state);
                    return Ok(());
                }
                Err(e) => warn!(%e, binary, "capture smoke test failed"),
            }
        }
        Err(StfError::CaptureUnsupported)
    }

    async fn kill_helpers(&self) {
        for binary in [
            self.config.helper_path.as_str(),
            self.config.fallback_path.as_str(),
        ] {
            let name = binary.rsplit('/').next().unwrap_or(binary);
            if let Err(e) = kill_by_name(self.device.as_ref(), name, SIGKILL).await {
                debug!(%e, name, "defensive helper kill");
            }
        }
    }
}

#[async_trait]
impl Servicer for CaptureDaemon {
    async fn start(&self) -> Result<(), StfError> {
        self.gate
            .start(|| async {
                self.latch.reset();
                self.kill_helpers().await;
                ensure_artifacts(self.device.as_ref(), CAPTURE_ARTIFACTS).await?;
                self.select_helper().await?;

                let token = CancellationToken::new();
                *self.quit.lock().unwrap() = token.clone();

                tokio::spawn(restart_loop(
                    Arc::clone(&self.device),
                    Arc::clone(&self.state),
                    Arc::clone(&self.rotation_rx),
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

// ── Restart loop ─────────────────────────────────────────────────

/// Supervises the helper across rotations.
///
/// Three inputs: worker exit, rotation change, quit. A worker exit with
/// no pending restart latches the error; with a pending restart the
/// helper is simply relaunched under the updated projection.
async fn restart_loop(
    device: Arc<dyn DeviceBridge>,
    state: Arc<Mutex<Option<HelperState>>>,
    rotation_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<u32>>>,
    quit: CancellationToken,
    latch: ErrorLatch,
) {
    let mut rotation_rx = rotation_rx.lock().await;
    let mut worker = spawn_worker(&device, &state);
    let mut need_restart = false;

    loop {
        tokio::select! {
            exit = &mut worker => {
                let err = match exit {
                    Ok(e) => e,
                    Err(join) => StfError::Other(format!("capture worker panicked: {join}")),
                };
                if !need_restart {
                    latch.complete(Err(err));
                    return;
                }
                need_restart = false;
                worker = spawn_worker(&device, &state);
            }
            rotation = rotation_rx.recv() => {
                if let Some(rotation) = rotation {
                    info!(rotation, "restarting capture helper");
                    need_restart = true;
                    if let Some(s) = state.lock().unwrap().as_mut() {
                        s.rotation = rotation;
                    }
                    kill_current(&device, &state).await;
                }
            }
            _ = quit.cancelled() => {
                kill_current(&device, &state).await;
                worker.abort();
                latch.complete_ok();
                return;
            }
        }
    }
}

fn spawn_worker(
    device: &Arc<dyn DeviceBridge>,
    state: &Arc<Mutex<Option<HelperState>>>,
) -> JoinHandle<StfError> {
    let device = Arc::clone(device);
    let snapshot = state.lock().unwrap().clone();
    tokio::spawn(async move {
        match snapshot {
            Some(s) => run_screen_capture(device, s).await,
            None => StfError::Other("capture helper not selected".into()),
        }
    })
}

async fn kill_current(device: &Arc<dyn DeviceBridge>, state: &Arc<Mutex<Option<HelperState>>>) {
    let name = state
        .lock()
        .unwrap()
        .as_ref()
        .map(|s| s.process_name().to_string());
    if let Some(name) = name {
        if let Err(e) = kill_by_name(device.as_ref(), &name, SIGKILL).await {
            debug!(%e, name, "helper kill");
        }
    }
}

/// Run one helper incarnation until its stream closes.
///
/// Expected startup output:
///
/// ```text
/// PID: 9355
/// INFO: Using projection 1080x1920@720x720/0
/// ```
///
/// `WARNING` lines may precede the PID line and are skipped. Anything
/// else in first position means the helper failed to start. The stream
/// closing is always an error here — whether it counts as terminal is
/// the restart loop's decision.
async fn run_screen_capture(device: Arc<dyn DeviceBridge>, state: HelperState) -> StfError {
    let proj = state.projection().to_string();
    let stream: CommandStream = match device
        .open_command(&[HELPER_ENV, state.binary.as_str(), "-P", proj.as_str(), "-S"])
        .await
    {
        Ok(s) => s,
        Err(e) => return e,
    };
    debug!(projection = %proj, binary = %state.binary, "capture helper launched");

    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.contains("WARNING") {
                    continue;
                }
                if !line.contains("PID:") {
                    return StfError::BadBanner(format!(
                        "unexpected capture helper output: {line}"
                    ));
                }
                break;
            }
            Ok(None) => return StfError::HelperExited("capture helper produced no output".into()),
            Err(e) => return e.into(),
        }
    }

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => debug!(target: "stf_core::helper", "{line}"),
            Ok(None) => return StfError::HelperExited("capture helper exited".into()),
            Err(e) => return e.into(),
        }
    }
}
