//! Tunables shared by the reslice pipeline and the link broadcasters.
//!
//! Every field has a default, so a host only needs to provide the values it
//! wants to override:
//!
//! ```
//! use volume_reslice::config::Config;
//!
//! let config = Config::from_json(r#"{ "orientation_tolerance": 0.01 }"#).unwrap();
//! assert_eq!(config.orientation_tolerance, 0.01);
//! assert_eq!(config.default_dimensions, [100, 100, 100]);
//! ```

use serde::Deserialize;

use crate::error::ResliceError;

/// Absolute per-component tolerance when comparing slice orientations.
pub const DEFAULT_ORIENTATION_TOLERANCE: f64 = 1e-3;

/// Off-axis terms smaller than this fraction of the dominant term are snapped to zero.
pub const DEFAULT_PERMUTATION_SUPPRESSION: f64 = 1e-3;

/// Output dimensions used until a slice view is attached.
pub const DEFAULT_DIMENSIONS: [u32; 3] = [100, 100, 100];

pub const DEFAULT_UVW_MAX_DIMENSIONS: [u32; 3] = [1024, 1024, 1024];

pub const DEFAULT_FIELD_OF_VIEW: [f64; 3] = [250.0, 250.0, 1.0];

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub orientation_tolerance: f64,
    pub permutation_suppression: f64,
    pub default_dimensions: [u32; 3],
    pub uvw_max_dimensions: [u32; 3],
    pub default_field_of_view: [f64; 3],
    /// Radiological convention for the orientation presets
    pub patient_right_is_screen_left: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            orientation_tolerance: DEFAULT_ORIENTATION_TOLERANCE,
            permutation_suppression: DEFAULT_PERMUTATION_SUPPRESSION,
            default_dimensions: DEFAULT_DIMENSIONS,
            uvw_max_dimensions: DEFAULT_UVW_MAX_DIMENSIONS,
            default_field_of_view: DEFAULT_FIELD_OF_VIEW,
            patient_right_is_screen_left: true,
        }
    }
}

impl Config {
    /// Parse a (possibly partial) JSON configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ResliceError::Config`] on malformed JSON or when a tolerance
    /// is negative.
    pub fn from_json(json: &str) -> Result<Self, ResliceError> {
        let config: Config = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ResliceError> {
        if self.orientation_tolerance < 0.0 {
            return Err(ResliceError::Config(format!(
                "orientation_tolerance must be non-negative, got {}",
                self.orientation_tolerance
            )));
        }
        if !(0.0..1.0).contains(&self.permutation_suppression) {
            return Err(ResliceError::Config(format!(
                "permutation_suppression must be in [0, 1), got {}",
                self.permutation_suppression
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.orientation_tolerance, 1e-3);
        assert_eq!(config.permutation_suppression, 1e-3);
        assert_eq!(config.default_dimensions, [100, 100, 100]);
        assert!(config.patient_right_is_screen_left);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = Config::from_json(r#"{ "uvw_max_dimensions": [256, 256, 1] }"#).unwrap();
        assert_eq!(config.uvw_max_dimensions, [256, 256, 1]);
        assert_eq!(config.default_field_of_view, DEFAULT_FIELD_OF_VIEW);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(matches!(
            Config::from_json(r#"{ "orientation_tolerance": -1.0 }"#),
            Err(ResliceError::Config(_))
        ));
        assert!(matches!(
            Config::from_json(r#"{ "permutation_suppression": 2.0 }"#),
            Err(ResliceError::Config(_))
        ));
        assert!(Config::from_json("not json").is_err());
    }
}
