//! Idempotent helper-artifact provisioning.
//!
//! Helpers are prebuilt per ABI (and, for shared objects, per SDK level),
//! so the download URL is a template over the `ro.product.cpu.abi` and
//! `ro.build.version.sdk` device properties. Artifacts already present on
//! the device are skipped, which makes re-provisioning on every service
//! start a no-op.

use std::collections::HashMap;
use std::time::SystemTime;

use tokio::io::AsyncWriteExt;
use tracing::info;

use crate::device::shell::check_output;
use crate::device::DeviceBridge;
use crate::error::StfError;

/// Device property holding the CPU ABI.
pub const PROP_ABI: &str = "ro.product.cpu.abi";
/// Device property holding the SDK level.
pub const PROP_SDK: &str = "ro.build.version.sdk";

// ── Artifact ─────────────────────────────────────────────────────

/// What kind of file an artifact is; determines its posix mode and
/// whether an install step follows the upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    Executable,
    SharedObject,
    Package,
}

/// One helper file that must exist on the device.
///
/// `url_template` may reference `{abi}` and `{sdk}`; the referenced
/// properties must be present on the device or provisioning fails with
/// [`StfError::MissingProperty`].
#[derive(Debug, Clone)]
pub struct Artifact {
    pub name: &'static str,
    pub device_path: &'static str,
    pub kind: ArtifactKind,
    pub url_template: &'static str,
}

impl Artifact {
    /// Posix mode the file is pushed with.
    pub fn mode(&self) -> u32 {
        match self.kind {
            ArtifactKind::SharedObject => 0o644,
            ArtifactKind::Executable | ArtifactKind::Package => 0o755,
        }
    }

    /// Render the download URL from device properties.
    pub fn url(&self, props: &HashMap<String, String>) -> Result<String, StfError> {
        let mut url = self.url_template.to_string();
        if url.contains("{abi}") {
            let abi = props.get(PROP_ABI).ok_or(StfError::MissingProperty(PROP_ABI))?;
            url = url.replace("{abi}", abi);
        }
        if url.contains("{sdk}") {
            let sdk = props.get(PROP_SDK).ok_or(StfError::MissingProperty(PROP_SDK))?;
            url = url.replace("{sdk}", sdk);
        }
        Ok(url)
    }
}

// ── Catalog ──────────────────────────────────────────────────────

/// Primary screen-capture helper with its JNI shared object, plus the
/// non-PIE fallback for devices whose linker rejects the primary build.
pub const CAPTURE_ARTIFACTS: &[Artifact] = &[
    Artifact {
        name: "minicap.so",
        device_path: "/data/local/tmp/minicap.so",
        kind: ArtifactKind::SharedObject,
        url_template:
            "https://github.com/openstf/stf/raw/master/vendor/minicap/shared/android-{sdk}/{abi}/minicap.so",
    },
    Artifact {
        name: "minicap",
        device_path: "/data/local/tmp/minicap",
        kind: ArtifactKind::Executable,
        url_template: "https://github.com/openstf/stf/raw/master/vendor/minicap/bin/{abi}/minicap",
    },
    Artifact {
        name: "minicap-nopie",
        device_path: "/data/local/tmp/minicap-nopie",
        kind: ArtifactKind::Executable,
        url_template:
            "https://github.com/openstf/stf/raw/master/vendor/minicap/bin/{abi}/minicap-nopie",
    },
];

/// Touch-injection helper.
pub const TOUCH_ARTIFACTS: &[Artifact] = &[Artifact {
    name: "minitouch",
    device_path: "/data/local/tmp/minitouch",
    kind: ArtifactKind::Executable,
    url_template: "https://github.com/openstf/stf/raw/master/vendor/minitouch/{abi}/minitouch",
}];

/// Rotation-watcher APK (installed via `pm`, not merely pushed).
pub const ROTATION_APK: Artifact = Artifact {
    name: "RotationWatcher.apk",
    device_path: "/data/local/tmp/RotationWatcher.apk",
    kind: ArtifactKind::Package,
    url_template:
        "https://github.com/openatx/RotationWatcher.apk/releases/download/1.0/RotationWatcher.apk",
};

// ── Provisioning ─────────────────────────────────────────────────

/// Place every artifact on the device, skipping those already present.
pub async fn ensure_artifacts(
    device: &dyn DeviceBridge,
    artifacts: &[Artifact],
) -> Result<(), StfError> {
    // Properties are only fetched once something is actually missing.
    let mut props: Option<HashMap<String, String>> = None;

    for artifact in artifacts {
        if device.stat(artifact.device_path).await? {
            continue;
        }
        if props.is_none() {
            props = Some(device.properties().await?);
        }
        let url = artifact.url(props.as_ref().unwrap_or(&HashMap::new()))?;
        push_from_http(device, artifact.device_path, artifact.mode(), &url).await?;

        if artifact.kind == ArtifactKind::Package {
            install_package(device, artifact.device_path).await?;
        }
    }
    Ok(())
}

/// Stream an HTTP body straight onto the device.
pub async fn push_from_http(
    device: &dyn DeviceBridge,
    dst: &str,
    mode: u32,
    url: &str,
) -> Result<(), StfError> {
    let mut wc = device.open_write(dst, mode, SystemTime::now()).await?;

    let mut resp = reqwest::get(url)
        .await
        .map_err(|e| StfError::Connection(e.to_string()))?;
    let status = resp.status().as_u16();
    if status != 200 {
        return Err(StfError::DownloadFailed {
            url: url.to_string(),
            status,
        });
    }

    info!(url, dst, "downloading helper artifact");
    while let Some(chunk) = resp
        .chunk()
        .await
        .map_err(|e| StfError::Connection(e.to_string()))?
    {
        wc.write_all(&chunk).await?;
    }
    wc.shutdown().await?;
    Ok(())
}

/// Install an uploaded APK, replacing any existing version.
pub async fn install_package(device: &dyn DeviceBridge, apk_path: &str) -> Result<(), StfError> {
    check_output(device, &["pm", "install", "-rt", apk_path])
        .await
        .map_err(|e| StfError::InstallFailed(e.to_string()))?;
    Ok(())
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn props(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn url_renders_both_placeholders() {
        let a = &CAPTURE_ARTIFACTS[0];
        let url = a
            .url(&props(&[(PROP_ABI, "arm64-v8a"), (PROP_SDK, "25")]))
            .unwrap();
        assert_eq!(
            url,
            "https://github.com/openstf/stf/raw/master/vendor/minicap/shared/android-25/arm64-v8a/minicap.so"
        );
    }

    #[test]
    fn url_missing_abi_property() {
        let a = &TOUCH_ARTIFACTS[0];
        let err = a.url(&props(&[(PROP_SDK, "25")])).unwrap_err();
        assert_eq!(err, StfError::MissingProperty(PROP_ABI));
    }

    #[test]
    fn url_without_placeholders_needs_no_properties() {
        let url = ROTATION_APK.url(&HashMap::new()).unwrap();
        assert!(url.ends_with("RotationWatcher.apk"));
    }

    #[test]
    fn modes_per_kind() {
        assert_eq!(CAPTURE_ARTIFACTS[0].mode(), 0o644); // shared object
        assert_eq!(CAPTURE_ARTIFACTS[1].mode(), 0o755); // executable
        assert_eq!(ROTATION_APK.mode(), 0o755); // package
    }
}
