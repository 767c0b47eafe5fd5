//! Shell conventions for devices reached through the bridge.
//!
//! The bridge's shell channel reports no exit status of its own, so every
//! checked command appends an `; echo :$?` sentinel and the parser splits
//! on the last `:` in the captured output. `ps` output layout differs
//! across OS builds, which is why the PID column is located from the
//! header instead of being hardcoded.

use tracing::debug;

use crate::device::DeviceBridge;
use crate::error::StfError;

/// Signal number used when killing helper processes.
pub const SIGKILL: i32 = 9;

// ── Checked execution ────────────────────────────────────────────

/// Run a shell command and verify its exit status via the `:$?` sentinel.
///
/// Returns the command's output with the sentinel stripped, or
/// [`StfError::ShellExit`] when the command exited non-zero.
pub async fn check_output(device: &dyn DeviceBridge, argv: &[&str]) -> Result<String, StfError> {
    let mut full: Vec<&str> = argv.to_vec();
    full.extend_from_slice(&[";", "echo", ":$?"]);
    let out = device.run_shell(&full).await?;

    let idx = out.rfind(':').ok_or(StfError::ExitCodeParse)?;
    let code: i32 = out[idx + 1..]
        .trim()
        .parse()
        .map_err(|_| StfError::ExitCodeParse)?;
    if code != 0 {
        return Err(StfError::ShellExit {
            argv: argv.join(" "),
            code,
        });
    }
    Ok(out[..idx].to_string())
}

// ── Process control ──────────────────────────────────────────────

/// Kill every process named `name`, locating the PID column dynamically
/// from the `ps` header.
///
/// Returns [`StfError::ProcessNotFound`] when no row matches — callers
/// that kill defensively before a launch ignore that case.
pub async fn kill_by_name(
    device: &dyn DeviceBridge,
    name: &str,
    signal: i32,
) -> Result<(), StfError> {
    let out = device.run_shell(&["ps", "-C", name]).await?;
    let trimmed = out.trim();
    let mut lines = trimmed.lines();

    let header = lines.next().unwrap_or_default();
    let pid_column = header
        .split_whitespace()
        .position(|col| col == "PID")
        .ok_or_else(|| StfError::ProcessNotFound(name.to_string()))?;

    let sig_arg = format!("-{signal}");
    let mut killed = 0usize;
    for line in lines {
        if !line.contains(name) {
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        let Some(pid) = fields.get(pid_column).copied() else {
            continue;
        };
        debug!(pid, name, signal, "killing helper process");
        let _ = device.run_shell(&["kill", sig_arg.as_str(), pid]).await;
        killed += 1;
    }

    if killed == 0 {
        return Err(StfError::ProcessNotFound(name.to_string()));
    }
    Ok(())
}

// ── Package queries ──────────────────────────────────────────────

/// Resolve the on-device APK path of an installed package via `pm path`.
pub async fn package_path(device: &dyn DeviceBridge, pkg: &str) -> Result<String, StfError> {
    let out = check_output(device, &["pm", "path", pkg]).await?;
    match out.trim().strip_prefix("package:") {
        Some(path) if !path.trim().is_empty() => Ok(path.trim().to_string()),
        _ => Err(StfError::PackageMissing(pkg.to_string())),
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{CommandStream, ForwardEntry, RemoteEndpoint, WriteStream};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::SystemTime;

    /// Shell-only device: maps each joined argv to a canned response and
    /// records every invocation.
    struct ShellDevice {
        responses: HashMap<String, String>,
        calls: Mutex<Vec<String>>,
    }

    impl ShellDevice {
        fn new(responses: &[(&str, &str)]) -> Self {
            Self {
                responses: responses
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl DeviceBridge for ShellDevice {
        async fn run_shell(&self, argv: &[&str]) -> Result<String, StfError> {
            let joined = argv.join(" ");
            self.calls.lock().unwrap().push(joined.clone());
            self.responses
                .get(&joined)
                .cloned()
                .ok_or_else(|| StfError::Other(format!("unexpected shell: {joined}")))
        }

        async fn open_command(&self, _argv: &[&str]) -> Result<CommandStream, StfError> {
            Err(StfError::Other("not supported".into()))
        }

        async fn open_write(
            &self,
            _path: &str,
            _mode: u32,
            _mtime: SystemTime,
        ) -> Result<WriteStream, StfError> {
            Err(StfError::Other("not supported".into()))
        }

        async fn stat(&self, _path: &str) -> Result<bool, StfError> {
            Ok(false)
        }

        async fn forward_list(&self) -> Result<Vec<ForwardEntry>, StfError> {
            Ok(Vec::new())
        }

        async fn add_forward(
            &self,
            _local_port: u16,
            _remote: RemoteEndpoint,
        ) -> Result<(), StfError> {
            Ok(())
        }

        async fn properties(&self) -> Result<HashMap<String, String>, StfError> {
            Ok(HashMap::new())
        }
    }

    #[tokio::test]
    async fn check_output_strips_sentinel() {
        let dev = ShellDevice::new(&[("echo hello ; echo :$?", "hello\r\n:0\n")]);
        let out = check_output(&dev, &["echo", "hello"]).await.unwrap();
        assert_eq!(out, "hello\r\n");
    }

    #[tokio::test]
    async fn check_output_nonzero_exit() {
        let dev = ShellDevice::new(&[("test -f /nope ; echo :$?", ":1\n")]);
        let err = check_output(&dev, &["test", "-f", "/nope"]).await.unwrap_err();
        assert_eq!(
            err,
            StfError::ShellExit {
                argv: "test -f /nope".into(),
                code: 1
            }
        );
    }

    #[tokio::test]
    async fn check_output_missing_sentinel() {
        let dev = ShellDevice::new(&[("true ; echo :$?", "garbled output")]);
        let err = check_output(&dev, &["true"]).await.unwrap_err();
        assert_eq!(err, StfError::ExitCodeParse);
    }

    #[tokio::test]
    async fn kill_by_name_parses_pid_column() {
        // Toybox-style layout: PID is the second column.
        let ps = "USER  PID  PPID  NAME\n\
                  shell 1234 1     minicap\n\
                  shell 5678 1     minicap\n";
        let dev = ShellDevice::new(&[
            ("ps -C minicap", ps),
            ("kill -9 1234", ""),
            ("kill -9 5678", ""),
        ]);

        kill_by_name(&dev, "minicap", SIGKILL).await.unwrap();
        let calls = dev.calls();
        assert!(calls.contains(&"kill -9 1234".to_string()));
        assert!(calls.contains(&"kill -9 5678".to_string()));
    }

    #[tokio::test]
    async fn kill_by_name_pid_first_column() {
        let ps = "PID   USER  NAME\n4321  shell minitouch\n";
        let dev = ShellDevice::new(&[("ps -C minitouch", ps), ("kill -9 4321", "")]);
        kill_by_name(&dev, "minitouch", SIGKILL).await.unwrap();
        assert!(dev.calls().contains(&"kill -9 4321".to_string()));
    }

    #[tokio::test]
    async fn kill_by_name_no_match() {
        let dev = ShellDevice::new(&[("ps -C minicap", "USER PID NAME\n")]);
        let err = kill_by_name(&dev, "minicap", SIGKILL).await.unwrap_err();
        assert_eq!(err, StfError::ProcessNotFound("minicap".into()));
    }

    #[tokio::test]
    async fn package_path_strips_prefix() {
        let dev = ShellDevice::new(&[(
            "pm path jp.co.cyberagent.stf.rotationwatcher ; echo :$?",
            "package:/data/app/rw-1/base.apk\n:0\n",
        )]);
        let path = package_path(&dev, "jp.co.cyberagent.stf.rotationwatcher")
            .await
            .unwrap();
        assert_eq!(path, "/data/app/rw-1/base.apk");
    }

    #[tokio::test]
    async fn package_path_missing_package() {
        let dev = ShellDevice::new(&[("pm path com.nowhere ; echo :$?", "\n:0\n")]);
        let err = package_path(&dev, "com.nowhere").await.unwrap_err();
        assert_eq!(err, StfError::PackageMissing("com.nowhere".into()));
    }
}
