//! Demo configuration.
//!
//! Settings come from an optional JSON file; every field has a default so a
//! file only needs the values it changes. Command line flags are applied on
//! top with the `with_*` methods.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{DemoError, DemoResult};

/// Configuration for one scenario run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DemoConfig {
    /// Number of particles created at start.
    pub particles: usize,
    /// Number of particles removed and re-added to exercise index reuse.
    pub churn: usize,
    /// Cells per side of the hydro grid.
    pub grid_size: usize,
    /// Softening length of the gravity code.
    pub softening: f64,
    /// Particles beyond this distance from the origin count as escapers.
    pub escape_radius: f64,
    /// Radius of the sphere selection around the origin.
    pub selection_radius: f64,
    /// Particles within this distance of each other are neighbours.
    pub neighbour_radius: f64,
    /// Time step of the gravity code.
    pub time_step: f64,
    /// Number of gravity steps to run.
    pub steps: usize,
    /// Default `tracing` filter directive when `RUST_LOG` is unset.
    pub log_filter: String,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            particles: 16,
            churn: 4,
            grid_size: 8,
            softening: 0.01,
            escape_radius: 2.0,
            selection_radius: 1.0,
            neighbour_radius: 0.75,
            time_step: 0.001,
            steps: 10,
            log_filter: "incode_demo=info,incode_storage=info".to_string(),
        }
    }
}

impl DemoConfig {
    /// Parse a configuration from JSON.
    ///
    /// # Errors
    ///
    /// Returns [`DemoError::ParseConfig`] if the text is not a valid config.
    pub fn from_json(text: &str) -> DemoResult<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Load a configuration from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns [`DemoError::ReadConfig`] or [`DemoError::ParseConfig`].
    pub fn load(path: &Path) -> DemoResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| DemoError::ReadConfig {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&text)
    }

    #[must_use]
    pub fn with_particles(mut self, particles: usize) -> Self {
        self.particles = particles;
        self
    }

    #[must_use]
    pub fn with_grid_size(mut self, grid_size: usize) -> Self {
        self.grid_size = grid_size;
        self
    }

    #[must_use]
    pub fn with_log_filter(mut self, filter: impl Into<String>) -> Self {
        self.log_filter = filter.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = DemoConfig::from_json(r#"{ "particles": 100, "steps": 3 }"#).unwrap();
        assert_eq!(config.particles, 100);
        assert_eq!(config.steps, 3);
        assert_eq!(config.grid_size, DemoConfig::default().grid_size);
    }

    #[test]
    fn test_flags_override_file() {
        let config = DemoConfig::from_json(r#"{ "grid_size": 4 }"#)
            .unwrap()
            .with_grid_size(6)
            .with_log_filter("debug");
        assert_eq!(config.grid_size, 6);
        assert_eq!(config.log_filter, "debug");
    }

    #[test]
    fn test_invalid_json_is_rejected() {
        assert!(matches!(
            DemoConfig::from_json("{ particles: }"),
            Err(DemoError::ParseConfig(_))
        ));
    }

    #[test]
    fn test_missing_file() {
        let err = DemoConfig::load(Path::new("/nonexistent/demo.json")).unwrap_err();
        assert!(matches!(err, DemoError::ReadConfig { .. }));
    }
}
