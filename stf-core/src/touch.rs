//! Multi-pointer touch injection over the forwarded touch socket.
//!
//! ## Wire protocol (ASCII lines)
//!
//! Banner in, three lines on connect:
//!
//! ```text
//! v <protocolVersion>
//! ^ <maxContacts> <maxX> <maxY> <maxPressure>
//! $ <pid>
//! ```
//!
//! Commands out, one line each, committed with `c`:
//!
//! ```text
//! d <id> <x> <y> <pressure>
//! m <id> <x> <y> <pressure>
//! u <id>
//! c
//! ```
//!
//! This client commits after every command; batching clients can be
//! layered on later without changing the wire format.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::device::shell::{kill_by_name, SIGKILL};
use crate::device::{forward_to_free_port, DeviceBridge, RemoteEndpoint};
use crate::error::StfError;
use crate::provision::{ensure_artifacts, TOUCH_ARTIFACTS};
use crate::service::{ErrorLatch, ServiceGate, Servicer};

const HELPER_PATH: &str = "/data/local/tmp/minitouch";
const HELPER_NAME: &str = "minitouch";
const SOCKET_NAME: &str = "minitouch";
const DIAL_RETRIES: u32 = 10;
const DIAL_BACKOFF: Duration = Duration::from_millis(100);

/// Pressure written for down/move events.
pub const DEFAULT_PRESSURE: u32 = 50;

// ── TouchCommand ─────────────────────────────────────────────────

/// One line of the touch wire protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TouchCommand {
    Down { id: u32, x: i32, y: i32, pressure: u32 },
    Move { id: u32, x: i32, y: i32, pressure: u32 },
    Up { id: u32 },
    Commit,
}

impl fmt::Display for TouchCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TouchCommand::Down { id, x, y, pressure } => write!(f, "d {id} {x} {y} {pressure}"),
            TouchCommand::Move { id, x, y, pressure } => write!(f, "m {id} {x} {y} {pressure}"),
            TouchCommand::Up { id } => write!(f, "u {id}"),
            TouchCommand::Commit => write!(f, "c"),
        }
    }
}

// ── TouchLimits ──────────────────────────────────────────────────

/// Device capabilities reported by the helper's banner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TouchLimits {
    pub max_contacts: u32,
    pub max_x: u32,
    pub max_y: u32,
    pub max_pressure: u32,
}

// ── TouchClient ──────────────────────────────────────────────────

/// Sends multi-pointer gestures to the on-device touch helper.
///
/// The producer API (`down`/`move_to`/`up`) is non-blocking: commands
/// queue on an unbounded channel and a drain task serializes them onto
/// the socket, one commit per command.
pub struct TouchClient {
    device: Arc<dyn DeviceBridge>,
    cmd_tx: mpsc::UnboundedSender<TouchCommand>,
    cmd_rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<TouchCommand>>>,
    limits: Arc<Mutex<Option<TouchLimits>>>,
    quit: Mutex<CancellationToken>,
    gate: ServiceGate,
    latch: ErrorLatch,
}

impl TouchClient {
    pub fn new(device: Arc<dyn DeviceBridge>) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        Self {
            device,
            cmd_tx,
            cmd_rx: Arc::new(tokio::sync::Mutex::new(cmd_rx)),
            limits: Arc::new(Mutex::new(None)),
            quit: Mutex::new(CancellationToken::new()),
            gate: ServiceGate::new(),
            latch: ErrorLatch::new(),
        }
    }

    /// Press pointer `id` down at the given position.
    pub fn down(&self, id: u32, x: i32, y: i32) -> Result<(), StfError> {
        self.send(TouchCommand::Down {
            id,
            x,
            y,
            pressure: DEFAULT_PRESSURE,
        })
    }

    /// Move pointer `id` to the given position.
    pub fn move_to(&self, id: u32, x: i32, y: i32) -> Result<(), StfError> {
        self.send(TouchCommand::Move {
            id,
            x,
            y,
            pressure: DEFAULT_PRESSURE,
        })
    }

    /// Lift pointer `id`.
    pub fn up(&self, id: u32) -> Result<(), StfError> {
        self.send(TouchCommand::Up { id })
    }

    fn send(&self, cmd: TouchCommand) -> Result<(), StfError> {
        self.cmd_tx.send(cmd).map_err(|_| StfError::ChannelClosed)
    }

    /// Capabilities from the helper banner, once the handshake is done.
    pub fn limits(&self) -> Option<TouchLimits> {
        *self.limits.lock().unwrap()
    }
}

#[async_trait]
impl Servicer for TouchClient {
    async fn start(&self) -> Result<(), StfError> {
        self.gate
            .start(|| async {
                self.latch.reset();
                ensure_artifacts(self.device.as_ref(), TOUCH_ARTIFACTS).await?;

                let token = CancellationToken::new();
                *self.quit.lock().unwrap() = token.clone();

                tokio::spawn(run_helper(
                    Arc::clone(&self.device),
                    token.clone(),
                    self.latch.clone(),
                ));
                tokio::spawn(drain_commands(
                    Arc::clone(&self.device),
                    Arc::clone(&self.cmd_rx),
                    Arc::clone(&self.limits),
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
                if let Err(e) = kill_by_name(self.device.as_ref(), HELPER_NAME, SIGKILL).await {
                    debug!(%e, "touch helper kill");
                }
                self.quit.lock().unwrap().cancel();
                self.latch.wait().await
            })
            .await
    }

    async fn wait(&self) -> Result<(), StfError> {
        self.latch.wait().await
    }
}

// ── Helper runner ────────────────────────────────────────────────

/// Launch the helper and drain its stdout for log visibility. The stream
/// ending means the helper is gone — on the stop path that is the
/// expected consequence of the kill, so it latches a clean result.
async fn run_helper(device: Arc<dyn DeviceBridge>, quit: CancellationToken, latch: ErrorLatch) {
    let stream = match device.open_command(&[HELPER_PATH]).await {
        Ok(s) => s,
        Err(e) => {
            latch.complete(Err(e));
            return;
        }
    };

    let mut lines = BufReader::new(stream).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => debug!(target: "stf_core::helper", "{line}"),
                Ok(None) | Err(_) => {
                    latch.complete_ok();
                    return;
                }
            },
            _ = quit.cancelled() => {
                // Dropping the stream terminates the remote helper.
                latch.complete_ok();
                return;
            }
        }
    }
}

// ── Command drain ────────────────────────────────────────────────

/// Dial the touch socket (with retry — the helper needs a moment to
/// create it), run the handshake, then forward queued commands.
async fn drain_commands(
    device: Arc<dyn DeviceBridge>,
    cmd_rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<TouchCommand>>>,
    limits: Arc<Mutex<Option<TouchLimits>>>,
    quit: CancellationToken,
    latch: ErrorLatch,
) {
    let mut stream = tokio::select! {
        dialed = dial_with_retry(&device, &limits) => match dialed {
            Ok(s) => s,
            Err(e) => {
                latch.complete(Err(e));
                return;
            }
        },
        _ = quit.cancelled() => {
            latch.complete_ok();
            return;
        }
    };

    let mut cmd_rx = cmd_rx.lock().await;
    loop {
        // Biased: a pending cancellation always wins over queued commands,
        // so commands still sitting in the channel at stop time are not
        // written to the already-killed helper.
        tokio::select! {
            biased;
            _ = quit.cancelled() => return,
            cmd = cmd_rx.recv() => match cmd {
                Some(cmd) => {
                    let line = format!("{cmd}\nc\n");
                    if let Err(e) = stream.write_all(line.as_bytes()).await {
                        // A write that fails because stop already killed
                        // the helper is part of a clean shutdown, not a
                        // terminal error.
                        if quit.is_cancelled() {
                            return;
                        }
                        warn!(%e, "touch command write failed");
                        latch.complete(Err(e.into()));
                        return;
                    }
                }
                None => return,
            },
        }
    }
}

async fn dial_with_retry(
    device: &Arc<dyn DeviceBridge>,
    limits: &Arc<Mutex<Option<TouchLimits>>>,
) -> Result<TcpStream, StfError> {
    let mut last = StfError::Connection("touch socket never dialed".into());
    for attempt in 0..DIAL_RETRIES {
        match dial_once(device.as_ref(), limits).await {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                debug!(%e, attempt, "touch socket dial failed, retrying");
                last = e;
            }
        }
        if attempt + 1 < DIAL_RETRIES {
            tokio::time::sleep(DIAL_BACKOFF).await;
        }
    }
    Err(StfError::RetryExhausted {
        attempts: DIAL_RETRIES,
        last: Box::new(last),
    })
}

async fn dial_once(
    device: &dyn DeviceBridge,
    limits: &Arc<Mutex<Option<TouchLimits>>>,
) -> Result<TcpStream, StfError> {
    let port =
        forward_to_free_port(device, RemoteEndpoint::Abstract(SOCKET_NAME.to_string())).await?;
    let stream = TcpStream::connect(("127.0.0.1", port)).await?;
    let mut rd = BufReader::new(stream);

    let parsed = parse_handshake(&mut rd).await?;
    info!(
        max_contacts = parsed.max_contacts,
        max_x = parsed.max_x,
        max_y = parsed.max_y,
        "touch helper handshake complete"
    );
    *limits.lock().unwrap() = Some(parsed);
    Ok(rd.into_inner())
}

/// Parse the three banner lines, whitespace-tokenised.
async fn parse_handshake(rd: &mut BufReader<TcpStream>) -> Result<TouchLimits, StfError> {
    let version_line = read_line(rd).await?;
    let fields = tokens(&version_line);
    if fields.len() != 2 || fields[0] != "v" {
        return Err(StfError::BadLine(version_line));
    }

    let limits_line = read_line(rd).await?;
    let fields = tokens(&limits_line);
    if fields.len() != 5 || fields[0] != "^" {
        return Err(StfError::BadLine(limits_line));
    }
    let parse = |s: &str| -> Result<u32, StfError> {
        s.parse().map_err(|_| StfError::BadLine(limits_line.clone()))
    };
    let limits = TouchLimits {
        max_contacts: parse(fields[1])?,
        max_x: parse(fields[2])?,
        max_y: parse(fields[3])?,
        max_pressure: parse(fields[4])?,
    };

    let pid_line = read_line(rd).await?;
    let fields = tokens(&pid_line);
    if fields.len() != 2 || fields[0] != "$" || fields[1].parse::<u32>().is_err() {
        return Err(StfError::BadLine(pid_line));
    }

    Ok(limits)
}

async fn read_line(rd: &mut BufReader<TcpStream>) -> Result<String, StfError> {
    let mut line = String::new();
    let n = rd.read_line(&mut line).await?;
    if n == 0 {
        return Err(StfError::Connection("touch socket closed in handshake".into()));
    }
    Ok(line.trim_end().to_string())
}

fn tokens(line: &str) -> Vec<&str> {
    line.split_whitespace().collect()
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn command_wire_lines() {
        assert_eq!(
            TouchCommand::Down {
                id: 0,
                x: 100,
                y: 330,
                pressure: 50
            }
            .to_string(),
            "d 0 100 330 50"
        );
        assert_eq!(
            TouchCommand::Move {
                id: 3,
                x: 5,
                y: 7,
                pressure: 50
            }
            .to_string(),
            "m 3 5 7 50"
        );
        assert_eq!(TouchCommand::Up { id: 1 }.to_string(), "u 1");
        assert_eq!(TouchCommand::Commit.to_string(), "c");
    }

    async fn handshake_fixture(banner: &'static str) -> Result<TouchLimits, StfError> {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            let (mut stream, _) = listener.accept().await.unwrap();
            stream.write_all(banner.as_bytes()).await.unwrap();
            // Hold the socket open while the client parses.
            tokio::time::sleep(Duration::from_millis(100)).await;
        });

        let stream = TcpStream::connect(addr).await.unwrap();
        let mut rd = BufReader::new(stream);
        parse_handshake(&mut rd).await
    }

    #[tokio::test]
    async fn handshake_parses_banner() {
        let limits = handshake_fixture("v 1\n^ 10 1079 1919 2048\n$ 9001\n")
            .await
            .unwrap();
        assert_eq!(
            limits,
            TouchLimits {
                max_contacts: 10,
                max_x: 1079,
                max_y: 1919,
                max_pressure: 2048,
            }
        );
    }

    #[tokio::test]
    async fn handshake_rejects_malformed_limits_line() {
        let err = handshake_fixture("v 1\n^ 10 oops 1919 2048\n$ 9001\n")
            .await
            .unwrap_err();
        assert!(matches!(err, StfError::BadLine(_)));
    }

    #[tokio::test]
    async fn handshake_rejects_wrong_flag() {
        let err = handshake_fixture("x 1\n^ 10 1079 1919 2048\n$ 9001\n")
            .await
            .unwrap_err();
        assert!(matches!(err, StfError::BadLine(_)));
    }
}
