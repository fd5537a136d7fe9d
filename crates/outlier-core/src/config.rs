//! Detector configuration
//!
//! Every detector carries the shared [`DetectorConfig`] plus its own
//! algorithm parameters. Configs deserialize from JSON with defaults for any
//! missing field, so a settings file only needs to name what it overrides.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::algo::{DbscanDetector, IsolationForest, LofDetector};
use crate::detector::Detector;
use crate::error::{AnomalyError, Result};

/// Shared sensitivity configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Sigma multiplier used by the one-dimensional sibling detectors;
    /// carried and persisted so checkpoints stay interchangeable
    pub sensitivity: f64,
    /// Emit events when detection flips between normal and anomalous
    pub notify_transitions: bool,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            sensitivity: 3.0,
            notify_transitions: true,
        }
    }
}

impl DetectorConfig {
    pub fn with_sensitivity(mut self, sensitivity: f64) -> Self {
        self.sensitivity = sensitivity;
        self
    }

    pub fn with_notify_transitions(mut self, enabled: bool) -> Self {
        self.notify_transitions = enabled;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.sensitivity.is_finite() && self.sensitivity > 0.0) {
            return Err(AnomalyError::invalid(
                "sensitivity",
                format!("must be a positive finite number, got {}", self.sensitivity),
            ));
        }
        Ok(())
    }
}

/// Isolation Forest parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IsolationForestConfig {
    pub common: DetectorConfig,
    /// Number of trees in the ensemble
    pub num_trees: usize,
    /// Bootstrap sample size per tree
    pub sub_sample_size: usize,
    /// Depth limit; `None` derives `ceil(log2(sub_sample_size))`
    pub max_depth: Option<usize>,
    /// Decision threshold used until the first training recalculates it
    pub threshold: f64,
    /// Train automatically once the buffer holds this many points
    pub auto_train_threshold: Option<usize>,
    /// Seed for reproducible forests
    pub seed: Option<u64>,
}

impl Default for IsolationForestConfig {
    fn default() -> Self {
        Self {
            common: DetectorConfig::default(),
            num_trees: 100,
            sub_sample_size: 256,
            max_depth: None,
            threshold: 0.6,
            auto_train_threshold: None,
            seed: None,
        }
    }
}

impl IsolationForestConfig {
    pub fn with_num_trees(mut self, num_trees: usize) -> Self {
        self.num_trees = num_trees;
        self
    }

    pub fn with_sub_sample_size(mut self, size: usize) -> Self {
        self.sub_sample_size = size;
        self
    }

    pub fn with_max_depth(mut self, depth: usize) -> Self {
        self.max_depth = Some(depth);
        self
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn with_auto_train_threshold(mut self, size: usize) -> Self {
        self.auto_train_threshold = Some(size);
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Depth limit actually applied when growing trees
    pub fn effective_max_depth(&self) -> usize {
        self.max_depth.unwrap_or_else(|| {
            let size = self.sub_sample_size.max(2) as f64;
            size.log2().ceil() as usize
        })
    }

    pub fn validate(&self) -> Result<()> {
        self.common.validate()?;
        if self.num_trees == 0 {
            return Err(AnomalyError::invalid("num_trees", "must be at least 1"));
        }
        if self.sub_sample_size == 0 {
            return Err(AnomalyError::invalid("sub_sample_size", "must be at least 1"));
        }
        if !(self.threshold > 0.0 && self.threshold <= 1.0) {
            return Err(AnomalyError::invalid(
                "threshold",
                format!("must lie in (0, 1], got {}", self.threshold),
            ));
        }
        if self.auto_train_threshold == Some(0) {
            return Err(AnomalyError::invalid(
                "auto_train_threshold",
                "must be at least 1 when set",
            ));
        }
        Ok(())
    }
}

/// DBSCAN parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DbscanConfig {
    pub common: DetectorConfig,
    /// Neighbourhood radius
    pub epsilon: f64,
    /// Neighbourhood size (including the point itself) that makes a core point
    pub min_points: usize,
    /// Oldest points are evicted once the history grows past this
    pub max_history_size: usize,
    pub auto_recluster: bool,
    /// Recluster whenever the history length is a multiple of this
    pub recluster_threshold: usize,
}

impl Default for DbscanConfig {
    fn default() -> Self {
        Self {
            common: DetectorConfig::default(),
            epsilon: 0.5,
            min_points: 5,
            max_history_size: 1000,
            auto_recluster: true,
            recluster_threshold: 100,
        }
    }
}

impl DbscanConfig {
    pub fn new(epsilon: f64, min_points: usize) -> Self {
        Self {
            epsilon,
            min_points,
            ..Self::default()
        }
    }

    pub fn with_max_history_size(mut self, size: usize) -> Self {
        self.max_history_size = size;
        self
    }

    pub fn with_auto_recluster(mut self, enabled: bool, threshold: usize) -> Self {
        self.auto_recluster = enabled;
        self.recluster_threshold = threshold;
        self
    }

    pub fn validate(&self) -> Result<()> {
        self.common.validate()?;
        if !(self.epsilon.is_finite() && self.epsilon > 0.0) {
            return Err(AnomalyError::invalid(
                "epsilon",
                format!("must be a positive finite number, got {}", self.epsilon),
            ));
        }
        if self.min_points == 0 {
            return Err(AnomalyError::invalid("min_points", "must be at least 1"));
        }
        if self.max_history_size < self.min_points {
            return Err(AnomalyError::invalid(
                "max_history_size",
                format!(
                    "must be at least min_points ({}), got {}",
                    self.min_points, self.max_history_size
                ),
            ));
        }
        if self.auto_recluster && self.recluster_threshold == 0 {
            return Err(AnomalyError::invalid(
                "recluster_threshold",
                "must be at least 1 when auto_recluster is enabled",
            ));
        }
        Ok(())
    }
}

/// Local Outlier Factor parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LofConfig {
    pub common: DetectorConfig,
    pub k_neighbors: usize,
    /// LOF ratio above which a point is anomalous
    pub threshold: f64,
}

impl Default for LofConfig {
    fn default() -> Self {
        Self {
            common: DetectorConfig::default(),
            k_neighbors: 5,
            threshold: 1.5,
        }
    }
}

impl LofConfig {
    pub fn new(k_neighbors: usize) -> Self {
        Self {
            k_neighbors,
            ..Self::default()
        }
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    /// Points required before a model can be built
    pub fn min_pts(&self) -> usize {
        self.k_neighbors + 1
    }

    pub fn validate(&self) -> Result<()> {
        self.common.validate()?;
        if self.k_neighbors == 0 {
            return Err(AnomalyError::invalid("k_neighbors", "must be at least 1"));
        }
        if !(self.threshold.is_finite() && self.threshold > 0.0) {
            return Err(AnomalyError::invalid(
                "threshold",
                format!("must be a positive finite number, got {}", self.threshold),
            ));
        }
        Ok(())
    }
}

/// Algorithm selection as it appears in a settings file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "algorithm", rename_all = "snake_case")]
pub enum DetectorSettings {
    IsolationForest(IsolationForestConfig),
    Dbscan(DbscanConfig),
    Lof(LofConfig),
}

impl DetectorSettings {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let settings: Self = serde_json::from_str(json)
            .map_err(|e| AnomalyError::invalid("settings", e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            AnomalyError::invalid("settings", format!("{}: {}", path.display(), e))
        })?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            Self::IsolationForest(config) => config.validate(),
            Self::Dbscan(config) => config.validate(),
            Self::Lof(config) => config.validate(),
        }
    }

    /// Construct the configured detector behind the lifecycle contract
    pub fn build(self) -> Result<Box<dyn Detector>> {
        Ok(match self {
            Self::IsolationForest(config) => Box::new(IsolationForest::new(config)?),
            Self::Dbscan(config) => Box::new(DbscanDetector::new(config)?),
            Self::Lof(config) => Box::new(LofDetector::new(config)?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::DetectorKind;

    #[test]
    fn test_defaults() {
        let lof = LofConfig::default();
        assert_eq!(lof.threshold, 1.5);
        assert_eq!(lof.min_pts(), 6);

        let forest = IsolationForestConfig::default();
        assert_eq!(forest.effective_max_depth(), 8);
        assert!(forest.validate().is_ok());
        assert!(DbscanConfig::default().validate().is_ok());
    }

    #[test]
    fn test_invalid_parameters() {
        assert!(matches!(
            DbscanConfig::new(0.0, 3).validate(),
            Err(AnomalyError::InvalidParameter { name: "epsilon", .. })
        ));
        assert!(matches!(
            LofConfig::new(0).validate(),
            Err(AnomalyError::InvalidParameter {
                name: "k_neighbors",
                ..
            })
        ));
        assert!(matches!(
            IsolationForestConfig::default().with_num_trees(0).validate(),
            Err(AnomalyError::InvalidParameter {
                name: "num_trees",
                ..
            })
        ));
        assert!(matches!(
            DbscanConfig::new(1.0, 10).with_max_history_size(5).validate(),
            Err(AnomalyError::InvalidParameter {
                name: "max_history_size",
                ..
            })
        ));
    }

    #[test]
    fn test_settings_from_json_fills_defaults() {
        let settings = DetectorSettings::from_json_str(
            r#"{ "algorithm": "dbscan", "epsilon": 1.0, "min_points": 3 }"#,
        )
        .unwrap();

        match &settings {
            DetectorSettings::Dbscan(config) => {
                assert_eq!(config.epsilon, 1.0);
                assert_eq!(config.min_points, 3);
                assert_eq!(config.max_history_size, 1000);
                assert!(config.common.notify_transitions);
            }
            other => panic!("unexpected settings: {:?}", other),
        }

        let detector = settings.build().unwrap();
        assert_eq!(detector.kind(), DetectorKind::Dbscan);
    }

    #[test]
    fn test_settings_nested_common() {
        let settings = DetectorSettings::from_json_str(
            r#"{ "algorithm": "lof", "k_neighbors": 4, "common": { "sensitivity": 2.0 } }"#,
        )
        .unwrap();
        let detector = settings.build().unwrap();
        assert_eq!(detector.kind(), DetectorKind::Lof);
        assert_eq!(detector.config().sensitivity, 2.0);
    }

    #[test]
    fn test_settings_rejects_unknown_algorithm() {
        let result = DetectorSettings::from_json_str(r#"{ "algorithm": "kmeans" }"#);
        assert!(matches!(
            result,
            Err(AnomalyError::InvalidParameter {
                name: "settings",
                ..
            })
        ));
    }

    #[test]
    fn test_settings_validation_runs_on_load() {
        let result =
            DetectorSettings::from_json_str(r#"{ "algorithm": "isolation_forest", "threshold": 2.0 }"#);
        assert!(matches!(
            result,
            Err(AnomalyError::InvalidParameter {
                name: "threshold",
                ..
            })
        ));
    }
}
