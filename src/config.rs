//! Settings file loading.
//!
//! Plane weighting is read from the same ORB-SLAM style YAML settings file as
//! the rest of the system. Those files start with an OpenCV `%YAML:1.0`
//! directive, which is stripped before parsing.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Numerator of the angular information values derived from `PlaneSettings`.
pub const ANGLE_INFORMATION_SCALE: f64 = 3282.8;

/// Plane factor weighting and gating.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct PlaneSettings {
    #[serde(rename = "Plane.AngleInfo")]
    pub angle_info: f64,

    #[serde(rename = "Plane.DistanceInfo")]
    pub distance_info: f64,

    #[serde(rename = "Plane.ParallelInfo")]
    pub parallel_info: f64,

    #[serde(rename = "Plane.VerticalInfo")]
    pub vertical_info: f64,

    /// χ² bound (and squared Huber width) for the full plane relation.
    #[serde(rename = "Plane.Chi")]
    pub chi: f64,

    /// χ² bound for parallel and vertical relations.
    #[serde(rename = "Plane.VPChi")]
    pub vp_chi: f64,
}

impl Default for PlaneSettings {
    fn default() -> Self {
        Self {
            angle_info: 0.5,
            distance_info: 50.0,
            parallel_info: 0.5,
            vertical_info: 0.5,
            chi: 100.0,
            vp_chi: 50.0,
        }
    }
}

impl PlaneSettings {
    pub fn angle_information(&self) -> f64 {
        ANGLE_INFORMATION_SCALE / (self.angle_info * self.angle_info)
    }

    pub fn distance_information(&self) -> f64 {
        self.distance_info * self.distance_info
    }

    pub fn parallel_information(&self) -> f64 {
        ANGLE_INFORMATION_SCALE / (self.parallel_info * self.parallel_info)
    }

    pub fn vertical_information(&self) -> f64 {
        ANGLE_INFORMATION_SCALE / (self.vertical_info * self.vertical_info)
    }
}

/// Everything this crate reads from a settings file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Settings {
    pub plane: PlaneSettings,
}

impl Settings {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let body: String = text
            .lines()
            .filter(|line| !line.trim_start().starts_with('%'))
            .collect::<Vec<_>>()
            .join("\n");
        if body.trim().is_empty() {
            return Ok(Self::default());
        }
        let plane: PlaneSettings =
            serde_yaml::from_str(&body).context("Failed to parse plane settings")?;
        Ok(Self { plane })
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to open {:?}", path))?;
        Self::from_yaml_str(&text).with_context(|| format!("Invalid settings file {:?}", path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_parse_opencv_style_file() {
        let text = "%YAML:1.0\n\
                    Camera.fx: 517.3\n\
                    Plane.AngleInfo: 1.0\n\
                    Plane.DistanceInfo: 100\n\
                    Plane.Chi: 80.0\n";
        let settings = Settings::from_yaml_str(text).unwrap();
        assert_eq!(settings.plane.angle_info, 1.0);
        assert_eq!(settings.plane.distance_info, 100.0);
        assert_eq!(settings.plane.chi, 80.0);
        // Absent keys fall back to defaults.
        assert_eq!(settings.plane.vp_chi, 50.0);
        assert_eq!(settings.plane.parallel_info, 0.5);
    }

    #[test]
    fn test_information_values() {
        let plane = PlaneSettings::default();
        assert_relative_eq!(plane.angle_information(), 3282.8 / 0.25, epsilon = 1e-9);
        assert_relative_eq!(plane.distance_information(), 2500.0, epsilon = 1e-9);
        assert_relative_eq!(plane.vertical_information(), 13131.2, epsilon = 1e-9);
    }

    #[test]
    fn test_empty_and_missing_files() {
        assert_eq!(Settings::from_yaml_str("%YAML:1.0\n").unwrap(), Settings::default());
        assert!(Settings::from_file("/nonexistent/settings.yaml").is_err());
        assert!(Settings::from_yaml_str("Plane.Chi: [1, 2").is_err());
    }
}
