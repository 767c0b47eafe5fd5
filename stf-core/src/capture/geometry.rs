//! Screen geometry probing types and the projection argument.

use std::fmt;

use serde::Deserialize;

// ── GeometryInfo ─────────────────────────────────────────────────

/// Snapshot reported by the capture helper's `-i` probe (JSON).
///
/// Width/height/rotation drive the projection; the remaining fields are
/// informational and default to zero when a helper build omits them.
#[derive(Debug, Clone, Deserialize)]
pub struct GeometryInfo {
    #[serde(default)]
    pub id: i32,
    pub width: u32,
    pub height: u32,
    pub rotation: u32,
    #[serde(default)]
    pub xdpi: f32,
    #[serde(default)]
    pub ydpi: f32,
    #[serde(default)]
    pub size: f32,
    #[serde(default)]
    pub density: f32,
    #[serde(default)]
    pub fps: f32,
    #[serde(default)]
    pub secure: bool,
}

// ── QualityPreset ────────────────────────────────────────────────

/// Square bound applied to the virtual (output) dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QualityPreset {
    Q1080,
    Q720,
    Q480,
    Q240,
}

impl QualityPreset {
    /// The bound in pixels applied to both virtual dimensions.
    pub fn bound(self) -> u32 {
        match self {
            QualityPreset::Q1080 => 1080,
            QualityPreset::Q720 => 720,
            QualityPreset::Q480 => 480,
            QualityPreset::Q240 => 240,
        }
    }
}

// ── Projection ───────────────────────────────────────────────────

/// The helper's projection argument: real size, maximum virtual size and
/// rotation bound into one string, `<RW>x<RH>@<VW>x<VH>/<rot>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Projection {
    pub real_width: u32,
    pub real_height: u32,
    pub virt_width: u32,
    pub virt_height: u32,
    pub rotation: u32,
}

impl fmt::Display for Projection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}x{}@{}x{}/{}",
            self.real_width, self.real_height, self.virt_width, self.virt_height, self.rotation
        )
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn geometry_parses_probe_json() {
        let json = r#"{
            "id": 0,
            "width": 1080,
            "height": 1920,
            "xdpi": 422.03,
            "ydpi": 424.069,
            "size": 5.245,
            "density": 2.625,
            "fps": 60.0,
            "secure": true,
            "rotation": 90
        }"#;
        let info: GeometryInfo = serde_json::from_str(json).unwrap();
        assert_eq!(info.width, 1080);
        assert_eq!(info.height, 1920);
        assert_eq!(info.rotation, 90);
        assert!(info.secure);
    }

    #[test]
    fn geometry_tolerates_missing_informational_fields() {
        let info: GeometryInfo =
            serde_json::from_str(r#"{"width": 720, "height": 1280, "rotation": 0}"#).unwrap();
        assert_eq!(info.fps, 0.0);
        assert!(!info.secure);
    }

    #[test]
    fn projection_format() {
        let p = Projection {
            real_width: 1080,
            real_height: 1920,
            virt_width: 720,
            virt_height: 720,
            rotation: 270,
        };
        assert_eq!(p.to_string(), "1080x1920@720x720/270");
    }

    #[test]
    fn preset_bounds() {
        assert_eq!(QualityPreset::Q1080.bound(), 1080);
        assert_eq!(QualityPreset::Q240.bound(), 240);
    }
}
