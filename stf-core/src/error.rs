//! Domain-specific error types for the device service pipeline.
//!
//! All fallible operations return `Result<T, StfError>`. The enum is
//! `Clone + PartialEq` because a service's terminal error is latched once
//! and then handed out verbatim to every waiter; I/O errors are therefore
//! captured as messages rather than as live `std::io::Error` values.

use thiserror::Error;

/// The canonical error type for the device service pipeline.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StfError {
    // ── Lifecycle Errors ─────────────────────────────────────────
    /// `start` was called on a service that is already running.
    #[error("service already started")]
    AlreadyStarted,

    /// `stop` was called on a service that was never started.
    #[error("service not started")]
    NotStarted,

    // ── Configuration Errors ─────────────────────────────────────
    /// A required device property (ABI, SDK level, …) is absent.
    #[error("missing device property: {0}")]
    MissingProperty(&'static str),

    // ── Provisioning Errors ──────────────────────────────────────
    /// The artifact server answered with a non-200 status.
    #[error("download <{url}> failed with status {status}")]
    DownloadFailed { url: String, status: u16 },

    /// `pm install` rejected an uploaded package.
    #[error("package install failed: {0}")]
    InstallFailed(String),

    /// The expected package is not installed on the device.
    #[error("package not installed: {0}")]
    PackageMissing(String),

    // ── Helper Errors ────────────────────────────────────────────
    /// Neither the primary nor the fallback capture helper produced a
    /// usable screenshot during the probe.
    #[error("screen capture unsupported on this device")]
    CaptureUnsupported,

    /// `ps` found no process with the given name.
    #[error("no process named {0} found")]
    ProcessNotFound(String),

    /// A helper subprocess exited while the service still needed it.
    #[error("helper exited: {0}")]
    HelperExited(String),

    // ── Protocol Errors ──────────────────────────────────────────
    /// The stream banner did not match what the helper is known to emit.
    #[error("unexpected banner: {0}")]
    BadBanner(String),

    /// A frame did not start with the JPEG magic bytes 0xFF 0xD8.
    #[error("jpeg frame does not start with 0xff 0xd8")]
    BadJpeg,

    /// A line-oriented protocol message could not be parsed.
    #[error("unparseable line: {0:?}")]
    BadLine(String),

    /// The `:$?` exit-code sentinel was missing from shell output.
    #[error("shell exit code parse failed")]
    ExitCodeParse,

    /// A shell command exited non-zero.
    #[error("[shell {argv}] exit code {code}")]
    ShellExit { argv: String, code: i32 },

    // ── Transport Errors ─────────────────────────────────────────
    /// TCP dial/read/write or bridge stream failure.
    #[error("connection error: {0}")]
    Connection(String),

    /// An mpsc channel was closed unexpectedly.
    #[error("channel closed")]
    ChannelClosed,

    // ── Retry Errors ─────────────────────────────────────────────
    /// A dial/restart retry budget was consumed without success.
    #[error("retry budget exhausted after {attempts} attempts: {last}")]
    RetryExhausted { attempts: u32, last: Box<StfError> },

    // ── Rotation Errors ──────────────────────────────────────────
    /// No rotation value has been observed yet, or the watcher stopped.
    #[error("rotation not ready")]
    NotReady,

    /// Catch-all for errors that do not fit another variant.
    #[error("{0}")]
    Other(String),
}

// ── Convenient From implementations ──────────────────────────────

impl From<std::io::Error> for StfError {
    fn from(e: std::io::Error) -> Self {
        StfError::Connection(e.to_string())
    }
}

impl From<serde_json::Error> for StfError {
    fn from(e: serde_json::Error) -> Self {
        StfError::BadLine(e.to_string())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for StfError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        StfError::ChannelClosed
    }
}
