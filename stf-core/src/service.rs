//! Service lifecycle substrate shared by every device service.
//!
//! Each service implements the [`Servicer`] contract and is built from two
//! small primitives:
//!
//! - [`ServiceGate`] — a lifecycle mutex enforcing the Idle → Running state
//!   machine (start rejected while running, stop rejected while idle).
//! - [`ErrorLatch`] — a one-shot terminal slot; the first writer wins and
//!   every waiter observes the identical result.
//!
//! [`MultiService`] composes several services into one.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future;
use tokio::sync::{watch, Mutex};

use crate::error::StfError;

// ── Servicer ─────────────────────────────────────────────────────

/// Contract shared by all device services.
///
/// `start` performs synchronous provisioning and handshake work and then
/// launches background tasks. `stop` signals shutdown and returns the
/// result of `wait`. `wait` blocks until the service reaches a terminal
/// state and is safe to call from any number of tasks in any state.
#[async_trait]
pub trait Servicer: Send + Sync {
    async fn start(&self) -> Result<(), StfError>;
    async fn stop(&self) -> Result<(), StfError>;
    async fn wait(&self) -> Result<(), StfError>;
}

// ── ServiceGate ──────────────────────────────────────────────────

/// Lifecycle mutex guarding start/stop transitions.
///
/// The flag only flips to started when the start closure succeeds, so a
/// failed `start` leaves the service restartable.
#[derive(Debug, Default)]
pub struct ServiceGate {
    started: Mutex<bool>,
}

impl ServiceGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` as the start transition.
    ///
    /// Fails with [`StfError::AlreadyStarted`] when the service is running.
    /// The lock is held for the duration of `f`, making the transition
    /// atomic with respect to concurrent starts and stops.
    pub async fn start<F, Fut>(&self, f: F) -> Result<(), StfError>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<(), StfError>> + Send,
    {
        let mut started = self.started.lock().await;
        if *started {
            return Err(StfError::AlreadyStarted);
        }
        f().await?;
        *started = true;
        Ok(())
    }

    /// Run `f` as the stop transition.
    ///
    /// Fails with [`StfError::NotStarted`] when the service is idle. The
    /// started flag clears regardless of what `f` returns; a stop that
    /// surfaces a latched error still leaves the service stopped.
    pub async fn stop<F, Fut>(&self, f: F) -> Result<(), StfError>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<(), StfError>> + Send,
    {
        let mut started = self.started.lock().await;
        if !*started {
            return Err(StfError::NotStarted);
        }
        *started = false;
        f().await
    }

    /// Whether the gate is currently in the started state.
    pub async fn is_started(&self) -> bool {
        *self.started.lock().await
    }
}

// ── ErrorLatch ───────────────────────────────────────────────────

/// One-shot terminal-result slot.
///
/// Background tasks race to [`complete`](Self::complete) the latch; only
/// the first result sticks. [`wait`](Self::wait) blocks until a result is
/// present and returns a clone of it, so every waiter sees the same value.
#[derive(Debug, Clone)]
pub struct ErrorLatch {
    tx: Arc<watch::Sender<Option<Result<(), StfError>>>>,
}

impl Default for ErrorLatch {
    fn default() -> Self {
        Self::new()
    }
}

impl ErrorLatch {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Re-arm the latch for a new start cycle.
    pub fn reset(&self) {
        self.tx.send_replace(None);
    }

    /// Latch a terminal result. Returns `true` if this call won the race.
    pub fn complete(&self, result: Result<(), StfError>) -> bool {
        let mut result = Some(result);
        self.tx.send_if_modified(|slot| {
            if slot.is_none() {
                *slot = result.take();
                true
            } else {
                false
            }
        })
    }

    /// Latch a clean shutdown.
    pub fn complete_ok(&self) -> bool {
        self.complete(Ok(()))
    }

    /// Whether a terminal result has been latched.
    pub fn is_terminal(&self) -> bool {
        self.tx.borrow().is_some()
    }

    /// Block until the latch holds a terminal result and return it.
    pub async fn wait(&self) -> Result<(), StfError> {
        let mut rx = self.tx.subscribe();
        let result = match rx.wait_for(|slot| slot.is_some()).await {
            Ok(slot) => slot.clone().unwrap_or(Ok(())),
            // The sender lives inside this latch, so it cannot drop while
            // `&self` is borrowed; treat the impossible as clean shutdown.
            Err(_) => Ok(()),
        };
        result
    }
}

// ── MultiService ─────────────────────────────────────────────────

/// Combines several services into one.
///
/// - `start` runs sequentially and aborts on the first error; children
///   started before the failure are left running, so the caller is
///   expected to `stop` the aggregate.
/// - `stop` stops every child in order and returns the last error seen.
/// - `wait` resolves as soon as any child reaches a terminal state.
pub struct MultiService {
    services: Vec<Arc<dyn Servicer>>,
}

impl MultiService {
    pub fn new(services: Vec<Arc<dyn Servicer>>) -> Self {
        Self { services }
    }
}

#[async_trait]
impl Servicer for MultiService {
    async fn start(&self) -> Result<(), StfError> {
        for s in &self.services {
            s.start().await?;
        }
        Ok(())
    }

    async fn stop(&self) -> Result<(), StfError> {
        let mut result = Ok(());
        for s in &self.services {
            if let Err(e) = s.stop().await {
                result = Err(e);
            }
        }
        result
    }

    async fn wait(&self) -> Result<(), StfError> {
        if self.services.is_empty() {
            return Ok(());
        }
        let waits: Vec<_> = self.services.iter().map(|s| s.wait()).collect();
        let (result, _index, _rest) = future::select_all(waits).await;
        result
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn gate_rejects_double_start() {
        let gate = ServiceGate::new();
        gate.start(|| async { Ok(()) }).await.unwrap();
        let err = gate.start(|| async { Ok(()) }).await.unwrap_err();
        assert_eq!(err, StfError::AlreadyStarted);
    }

    #[tokio::test]
    async fn gate_rejects_stop_before_start() {
        let gate = ServiceGate::new();
        let err = gate.stop(|| async { Ok(()) }).await.unwrap_err();
        assert_eq!(err, StfError::NotStarted);
    }

    #[tokio::test]
    async fn gate_failed_start_stays_idle() {
        let gate = ServiceGate::new();
        let err = gate
            .start(|| async { Err(StfError::CaptureUnsupported) })
            .await
            .unwrap_err();
        assert_eq!(err, StfError::CaptureUnsupported);
        assert!(!gate.is_started().await);

        // A retry after the failure must be allowed.
        gate.start(|| async { Ok(()) }).await.unwrap();
        assert!(gate.is_started().await);
    }

    #[tokio::test]
    async fn gate_allows_restart_after_stop() {
        let gate = ServiceGate::new();
        gate.start(|| async { Ok(()) }).await.unwrap();
        gate.stop(|| async { Ok(()) }).await.unwrap();
        gate.start(|| async { Ok(()) }).await.unwrap();
    }

    #[tokio::test]
    async fn latch_first_writer_wins() {
        let latch = ErrorLatch::new();
        assert!(latch.complete(Err(StfError::BadJpeg)));
        assert!(!latch.complete_ok());
        assert_eq!(latch.wait().await, Err(StfError::BadJpeg));
    }

    #[tokio::test]
    async fn latch_all_waiters_observe_same_result() {
        let latch = ErrorLatch::new();

        let mut handles = Vec::new();
        for _ in 0..4 {
            let latch = latch.clone();
            handles.push(tokio::spawn(async move { latch.wait().await }));
        }

        tokio::time::sleep(Duration::from_millis(20)).await;
        latch.complete(Err(StfError::NotReady));

        for h in handles {
            assert_eq!(h.await.unwrap(), Err(StfError::NotReady));
        }
    }

    #[tokio::test]
    async fn latch_reset_rearms() {
        let latch = ErrorLatch::new();
        latch.complete(Err(StfError::BadJpeg));
        latch.reset();
        assert!(!latch.is_terminal());
        latch.complete_ok();
        assert_eq!(latch.wait().await, Ok(()));
    }

    /// Minimal servicer for composition tests: start/stop succeed, wait
    /// blocks until the latch is completed.
    struct StubService {
        latch: ErrorLatch,
        started: AtomicUsize,
        stopped: AtomicUsize,
        fail_start: bool,
    }

    impl StubService {
        fn new(fail_start: bool) -> Arc<Self> {
            Arc::new(Self {
                latch: ErrorLatch::new(),
                started: AtomicUsize::new(0),
                stopped: AtomicUsize::new(0),
                fail_start,
            })
        }
    }

    #[async_trait]
    impl Servicer for StubService {
        async fn start(&self) -> Result<(), StfError> {
            if self.fail_start {
                return Err(StfError::CaptureUnsupported);
            }
            self.started.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn stop(&self) -> Result<(), StfError> {
            self.stopped.fetch_add(1, Ordering::SeqCst);
            self.latch.complete_ok();
            self.latch.wait().await
        }

        async fn wait(&self) -> Result<(), StfError> {
            self.latch.wait().await
        }
    }

    #[tokio::test]
    async fn multi_service_start_aborts_on_first_error() {
        let ok = StubService::new(false);
        let bad = StubService::new(true);
        let never = StubService::new(false);
        let multi = MultiService::new(vec![
            ok.clone() as Arc<dyn Servicer>,
            bad,
            never.clone(),
        ]);

        let err = multi.start().await.unwrap_err();
        assert_eq!(err, StfError::CaptureUnsupported);
        assert_eq!(ok.started.load(Ordering::SeqCst), 1);
        // The child after the failure was never reached.
        assert_eq!(never.started.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn multi_service_wait_returns_first_terminal() {
        let a = StubService::new(false);
        let b = StubService::new(false);
        let multi = MultiService::new(vec![a.clone() as Arc<dyn Servicer>, b.clone()]);
        multi.start().await.unwrap();

        b.latch.complete(Err(StfError::BadJpeg));
        assert_eq!(multi.wait().await, Err(StfError::BadJpeg));

        // The other child is still running until explicitly stopped; the
        // aggregate stop surfaces the failed child's latched error.
        assert!(!a.latch.is_terminal());
        assert_eq!(multi.stop().await, Err(StfError::BadJpeg));
    }

    #[tokio::test]
    async fn multi_service_stop_stops_all() {
        let a = StubService::new(false);
        let b = StubService::new(false);
        let multi = MultiService::new(vec![a.clone() as Arc<dyn Servicer>, b.clone()]);
        multi.start().await.unwrap();
        multi.stop().await.unwrap();
        assert_eq!(a.stopped.load(Ordering::SeqCst), 1);
        assert_eq!(b.stopped.load(Ordering::SeqCst), 1);
    }
}
