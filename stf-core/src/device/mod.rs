//! Debug-bridge device abstraction.
//!
//! [`DeviceBridge`] is the capability set every service consumes: shell
//! execution, streamed subprocess I/O, file push, stat, port forwarding and
//! property lookup. The concrete transport (the bridge client itself) lives
//! outside this crate; services hold the device as `Arc<dyn DeviceBridge>`
//! and never own it.

pub mod shell;

use std::collections::HashMap;
use std::fmt;
use std::time::SystemTime;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::StfError;

/// Scratch directory used for helper binaries on the device.
pub const DEVICE_TMP_DIR: &str = "/data/local/tmp";

/// Merged stdout+stderr of a remote subprocess. Dropping the stream
/// terminates the remote process.
pub type CommandStream = Box<dyn AsyncRead + Send + Unpin>;

/// Write stream for a file push.
pub type WriteStream = Box<dyn AsyncWrite + Send + Unpin>;

// ── Forward table ────────────────────────────────────────────────

/// The device-side endpoint of a forward.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RemoteEndpoint {
    /// Abstract unix-domain socket, addressed by name only.
    Abstract(String),
    /// TCP port on the device.
    Tcp(u16),
}

impl fmt::Display for RemoteEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteEndpoint::Abstract(name) => write!(f, "localabstract:{name}"),
            RemoteEndpoint::Tcp(port) => write!(f, "tcp:{port}"),
        }
    }
}

/// One entry of the bridge's forward table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardEntry {
    pub local_port: u16,
    pub remote: RemoteEndpoint,
}

// ── DeviceBridge ─────────────────────────────────────────────────

/// Capability set of a bridge-attached device.
#[async_trait]
pub trait DeviceBridge: Send + Sync {
    /// Run a shell command and collect its merged output.
    async fn run_shell(&self, argv: &[&str]) -> Result<String, StfError>;

    /// Run a shell command and stream its merged output. The remote
    /// process is terminated when the returned stream is dropped.
    async fn open_command(&self, argv: &[&str]) -> Result<CommandStream, StfError>;

    /// Open a write stream to a device file with the given posix mode.
    async fn open_write(
        &self,
        path: &str,
        mode: u32,
        mtime: SystemTime,
    ) -> Result<WriteStream, StfError>;

    /// Whether a regular file exists at `path`.
    async fn stat(&self, path: &str) -> Result<bool, StfError>;

    /// Current forward table.
    async fn forward_list(&self) -> Result<Vec<ForwardEntry>, StfError>;

    /// Register a forward from a local TCP port to a remote endpoint.
    async fn add_forward(&self, local_port: u16, remote: RemoteEndpoint) -> Result<(), StfError>;

    /// Device property map (`ro.product.cpu.abi`, `ro.build.version.sdk`, …).
    async fn properties(&self) -> Result<HashMap<String, String>, StfError>;
}

// ── Forward allocation ───────────────────────────────────────────

/// Forward `remote` to a local TCP port, reusing an existing forward when
/// one already targets the same remote endpoint.
///
/// Forwards are never unregistered on service stop — they are cheap, other
/// processes may share them, and reuse keeps restarts from leaking ports.
pub async fn forward_to_free_port(
    device: &dyn DeviceBridge,
    remote: RemoteEndpoint,
) -> Result<u16, StfError> {
    for fw in device.forward_list().await? {
        if fw.remote == remote {
            return Ok(fw.local_port);
        }
    }
    let port = free_local_port()?;
    device.add_forward(port, remote).await?;
    Ok(port)
}

/// Ask the OS for an unused local TCP port.
fn free_local_port() -> Result<u16, StfError> {
    let listener = std::net::TcpListener::bind(("127.0.0.1", 0))?;
    Ok(listener.local_addr()?.port())
}
