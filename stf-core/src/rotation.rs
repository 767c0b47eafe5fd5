//! Orientation watching via the on-device rotation watcher app.
//!
//! The watcher package is launched as a bare `app_process` with its APK on
//! the classpath; it prints one decimal orientation per line on stdout.
//! Parsed values fan out to subscribers over capacity-1 channels with a
//! 1-second send timeout — a subscriber that stops draining is evicted
//! rather than blocked on, because rotation events are informational.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::device::shell::package_path;
use crate::device::DeviceBridge;
use crate::error::StfError;
use crate::provision::{install_package, push_from_http, ROTATION_APK};
use crate::service::{ErrorLatch, ServiceGate, Servicer};

/// Package providing the on-device watcher.
pub const ROTATION_PKG: &str = "jp.co.cyberagent.stf.rotationwatcher";

const MAX_RETRY: u32 = 3;
const PUBLISH_TIMEOUT: Duration = Duration::from_secs(1);
const LAST_VALUE_UNSET: i64 = -1;

/// Orientations the device can report.
const VALID_ROTATIONS: [u32; 4] = [0, 90, 180, 270];

// ── Subscription ─────────────────────────────────────────────────

/// A rotation event subscription.
///
/// The channel holds a single value; when the subscriber lags more than
/// the publish timeout it is evicted and `recv` starts returning `None`.
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<u32>,
}

impl Subscription {
    /// Receive the next rotation value, or `None` once unsubscribed,
    /// evicted, or the watcher has shut down.
    pub async fn recv(&mut self) -> Option<u32> {
        self.rx.recv().await
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

type SubscriberMap = Arc<Mutex<HashMap<u64, mpsc::Sender<u32>>>>;

// ── RotationWatcher ──────────────────────────────────────────────

/// Publishes device orientation changes to subscribers.
pub struct RotationWatcher {
    device: Arc<dyn DeviceBridge>,
    subscribers: SubscriberMap,
    next_id: AtomicU64,
    last_value: Arc<AtomicI64>,
    stopped: Arc<AtomicBool>,
    quit: Mutex<CancellationToken>,
    gate: ServiceGate,
    latch: ErrorLatch,
}

impl RotationWatcher {
    pub fn new(device: Arc<dyn DeviceBridge>) -> Self {
        Self {
            device,
            subscribers: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            last_value: Arc::new(AtomicI64::new(LAST_VALUE_UNSET)),
            stopped: Arc::new(AtomicBool::new(false)),
            quit: Mutex::new(CancellationToken::new()),
            gate: ServiceGate::new(),
            latch: ErrorLatch::new(),
        }
    }

    /// Register a new subscriber.
    ///
    /// The last known value is not replayed; call
    /// [`rotation`](Self::rotation) for the current state.
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::channel(1);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.lock().unwrap().insert(id, tx);
        Subscription { id, rx }
    }

    /// Remove a subscriber and close its channel.
    pub fn unsubscribe(&self, subscription: Subscription) {
        self.subscribers.lock().unwrap().remove(&subscription.id);
    }

    /// The most recently observed orientation.
    ///
    /// Fails with [`StfError::NotReady`] before the first value arrives
    /// or after the watcher stopped.
    pub fn rotation(&self) -> Result<u32, StfError> {
        let v = self.last_value.load(Ordering::Relaxed);
        if v == LAST_VALUE_UNSET || self.stopped.load(Ordering::Relaxed) {
            return Err(StfError::NotReady);
        }
        Ok(v as u32)
    }

    /// Make sure the watcher package is installed; returns its APK path.
    async fn ensure_package(&self) -> Result<String, StfError> {
        if let Ok(path) = package_path(self.device.as_ref(), ROTATION_PKG).await {
            return Ok(path);
        }
        push_from_http(
            self.device.as_ref(),
            ROTATION_APK.device_path,
            ROTATION_APK.mode(),
            ROTATION_APK.url_template,
        )
        .await?;
        install_package(self.device.as_ref(), ROTATION_APK.device_path).await?;
        package_path(self.device.as_ref(), ROTATION_PKG).await
    }
}

#[async_trait]
impl Servicer for RotationWatcher {
    async fn start(&self) -> Result<(), StfError> {
        self.gate
            .start(|| async {
                self.latch.reset();
                self.stopped.store(false, Ordering::Relaxed);
                let apk_path = self.ensure_package().await?;
                info!(%apk_path, "rotation watcher package ready");

                let token = CancellationToken::new();
                *self.quit.lock().unwrap() = token.clone();

                tokio::spawn(watch_loop(
                    Arc::clone(&self.device),
                    apk_path,
                    Arc::clone(&self.subscribers),
                    Arc::clone(&self.last_value),
                    Arc::clone(&self.stopped),
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
                self.stopped.store(true, Ordering::Relaxed);
                self.quit.lock().unwrap().cancel();
                self.latch.wait().await
            })
            .await
    }

    async fn wait(&self) -> Result<(), StfError> {
        self.latch.wait().await
    }
}

// ── Watch loop ───────────────────────────────────────────────────

/// Restart the watcher process with a bounded retry budget.
///
/// A cycle that observed at least one value counts as recovery and
/// refills the budget; only consecutive barren cycles burn it down.
async fn watch_loop(
    device: Arc<dyn DeviceBridge>,
    apk_path: String,
    subscribers: SubscriberMap,
    last_value: Arc<AtomicI64>,
    stopped: Arc<AtomicBool>,
    quit: CancellationToken,
    latch: ErrorLatch,
) {
    let mut left_retry = MAX_RETRY;
    let mut last_err = StfError::HelperExited("rotation watcher never ran".into());

    loop {
        match run_cycle(&device, &apk_path, &subscribers, &last_value, &quit).await {
            Ok(()) => left_retry = MAX_RETRY,
            Err(e) => {
                warn!(%e, left_retry, "rotation watcher run failed");
                last_err = e;
            }
        }
        left_retry -= 1;

        if stopped.load(Ordering::Relaxed) {
            close_all(&subscribers);
            latch.complete_ok();
            return;
        }
        if left_retry == 0 {
            close_all(&subscribers);
            latch.complete(Err(StfError::RetryExhausted {
                attempts: MAX_RETRY,
                last: Box::new(last_err),
            }));
            return;
        }
    }
}

/// One incarnation of the on-device watcher process.
///
/// Returns `Ok` when the process streamed at least one value before
/// exiting (or the quit token fired); a barren run is an error.
async fn run_cycle(
    device: &Arc<dyn DeviceBridge>,
    apk_path: &str,
    subscribers: &SubscriberMap,
    last_value: &Arc<AtomicI64>,
    quit: &CancellationToken,
) -> Result<(), StfError> {
    let classpath = format!("CLASSPATH={apk_path}");
    let entry = format!("{ROTATION_PKG}.RotationWatcher");
    let stream = device
        .open_command(&[
            classpath.as_str(),
            "exec",
            "app_process",
            "/system/bin",
            entry.as_str(),
        ])
        .await?;

    let mut lines = BufReader::new(stream).lines();
    let mut read_count = 0usize;
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line,
            // Dropping the stream terminates the remote process.
            _ = quit.cancelled() => return Ok(()),
        };
        match line {
            Ok(Some(line)) => {
                let value = parse_rotation(line.trim())?;
                read_count += 1;
                publish(subscribers, last_value, value).await;
            }
            Ok(None) => break,
            Err(e) => return Err(e.into()),
        }
    }

    if read_count > 0 {
        Ok(())
    } else {
        Err(StfError::HelperExited("rotation watcher got nothing".into()))
    }
}

fn parse_rotation(line: &str) -> Result<u32, StfError> {
    let value: u32 = line
        .parse()
        .map_err(|_| StfError::BadLine(line.to_string()))?;
    if !VALID_ROTATIONS.contains(&value) {
        return Err(StfError::BadLine(line.to_string()));
    }
    Ok(value)
}

/// Fan a value out to every subscriber, evicting the slow ones.
async fn publish(subscribers: &SubscriberMap, last_value: &Arc<AtomicI64>, value: u32) {
    last_value.store(value as i64, Ordering::Relaxed);

    let targets: Vec<(u64, mpsc::Sender<u32>)> = subscribers
        .lock()
        .unwrap()
        .iter()
        .map(|(id, tx)| (*id, tx.clone()))
        .collect();

    for (id, tx) in targets {
        let delivered = matches!(
            tokio::time::timeout(PUBLISH_TIMEOUT, tx.send(value)).await,
            Ok(Ok(()))
        );
        if !delivered {
            warn!(subscriber = id, "evicting slow rotation subscriber");
            subscribers.lock().unwrap().remove(&id);
        }
    }
}

fn close_all(subscribers: &SubscriberMap) {
    subscribers.lock().unwrap().clear();
}

// ── Tests ────────────────────────────────────────────────────────
