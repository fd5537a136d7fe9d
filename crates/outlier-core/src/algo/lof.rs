//! Local Outlier Factor (LOF) anomaly detection
//!
//! Compares the local reachability density of a point with that of its k
//! nearest neighbours. LOF near 1 means the point is as dense as its
//! neighbourhood; LOF well above 1 means it sits in a much sparser region.
//! LOF below 1 (denser than the neighbours) is never flagged.
//!
//! Reference: "LOF: Identifying Density-Based Local Outliers"
//! (Breunig et al., SIGMOD 2000)

use std::io::{Read, Write};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::checkpoint::{self, Checkpointable, CheckpointError};
use crate::config::{DetectorConfig, LofConfig};
use crate::detector::{DetectionResult, Detector, DetectorKind, Dimensionality};
use crate::distance::{Neighbor, k_nearest};
use crate::error::{AnomalyError, Result};

/// z-score reported for a query with no neighbours at all
pub const ISOLATED_POINT_Z_SCORE: f64 = 1.0e9;

#[derive(Debug, Clone)]
struct LofPoint {
    features: Vec<f64>,
    score: f64,
    processed: bool,
}

/// Local Outlier Factor detector
#[derive(Debug, Clone)]
pub struct LofDetector {
    config: LofConfig,
    points: Vec<LofPoint>,
    dims: Dimensionality,
    /// Distance from each stored point to its k-th nearest neighbour
    k_distances: Vec<f64>,
    /// Local reachability density of each stored point
    lrds: Vec<f64>,
    /// Model matches the current point set
    built: bool,
}

impl LofDetector {
    pub fn new(config: LofConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            points: Vec::new(),
            dims: Dimensionality::default(),
            k_distances: Vec::new(),
            lrds: Vec::new(),
            built: false,
        })
    }

    pub fn settings(&self) -> &LofConfig {
        &self.config
    }

    pub fn threshold(&self) -> f64 {
        self.config.threshold
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn is_built(&self) -> bool {
        self.built
    }

    /// LOF scores of the stored points; `None` until `build()` succeeds
    pub fn scores(&self) -> Option<Vec<f64>> {
        self.built
            .then(|| self.points.iter().map(|p| p.score).collect())
    }

    /// Indices of stored points whose LOF exceeds the threshold
    pub fn outliers(&self) -> Vec<usize> {
        if !self.built {
            return Vec::new();
        }
        self.points
            .iter()
            .enumerate()
            .filter(|(_, p)| p.score > self.config.threshold)
            .map(|(i, _)| i)
            .collect()
    }

    pub fn add_point(&mut self, point: &[f64]) -> Result<()> {
        self.dims.admit(point)?;
        self.points.push(LofPoint {
            features: point.to_vec(),
            score: 0.0,
            processed: false,
        });
        self.built = false;
        Ok(())
    }

    pub fn clear(&mut self) {
        self.points.clear();
        self.dims.reset();
        self.k_distances.clear();
        self.lrds.clear();
        self.built = false;
    }

    fn neighbors_of(&self, query: &[f64], skip: Option<usize>) -> Vec<Neighbor> {
        k_nearest(
            self.points.iter().map(|p| p.features.as_slice()),
            query,
            self.config.k_neighbors,
            skip,
        )
    }

    /// Compute k-distance, LRD and LOF for every stored point
    pub fn build(&mut self) -> Result<()> {
        let required = self.config.min_pts();
        if self.points.len() < required {
            return Err(AnomalyError::InsufficientData {
                required,
                got: self.points.len(),
            });
        }

        let neighborhoods: Vec<Vec<Neighbor>> = (0..self.points.len())
            .map(|i| self.neighbors_of(&self.points[i].features, Some(i)))
            .collect();

        self.k_distances = neighborhoods
            .iter()
            .map(|n| n.last().map_or(0.0, |nb| nb.distance))
            .collect();

        self.lrds = neighborhoods
            .iter()
            .map(|n| local_reachability_density(n, &self.k_distances))
            .collect();

        for (i, neighbors) in neighborhoods.iter().enumerate() {
            let point = &mut self.points[i];
            point.score = local_outlier_factor(neighbors, &self.lrds, self.lrds[i]);
            point.processed = true;
        }

        self.built = true;
        debug!(
            points = self.points.len(),
            k = self.config.k_neighbors,
            outliers = self.outliers().len(),
            "LOF model built"
        );
        Ok(())
    }

    /// LOF of an arbitrary query against the built model.
    ///
    /// A query equal to a stored point is not its own neighbour, so it
    /// scores exactly what `build()` gave that point.
    pub fn score(&self, point: &[f64]) -> Result<Option<f64>> {
        self.require_built()?;
        self.dims.check(point)?;

        let stored = self.points.iter().position(|p| p.features == point);
        let neighbors = self.neighbors_of(point, stored);
        if neighbors.is_empty() {
            return Ok(None);
        }
        let lrd = local_reachability_density(&neighbors, &self.k_distances);
        Ok(Some(local_outlier_factor(&neighbors, &self.lrds, lrd)))
    }

    fn require_built(&self) -> Result<()> {
        if self.built {
            Ok(())
        } else if self.points.iter().any(|p| p.processed) {
            Err(AnomalyError::NotTrained(
                "points added since the last build()",
            ))
        } else {
            Err(AnomalyError::NotTrained("call build() before detect()"))
        }
    }

    /// Recompute the k-distance and LRD tables for restored, already
    /// processed points without touching their stored scores.
    fn rebuild_tables(&mut self) {
        let neighborhoods: Vec<Vec<Neighbor>> = (0..self.points.len())
            .map(|i| self.neighbors_of(&self.points[i].features, Some(i)))
            .collect();
        self.k_distances = neighborhoods
            .iter()
            .map(|n| n.last().map_or(0.0, |nb| nb.distance))
            .collect();
        self.lrds = neighborhoods
            .iter()
            .map(|n| local_reachability_density(n, &self.k_distances))
            .collect();
        self.built = true;
    }
}

/// `k / sum(max(d(p, o), k_distance(o)))`, or 1.0 when every neighbour
/// coincides with the point
fn local_reachability_density(neighbors: &[Neighbor], k_distances: &[f64]) -> f64 {
    if neighbors.is_empty() {
        return 1.0;
    }
    let reach_sum: f64 = neighbors
        .iter()
        .map(|n| n.distance.max(k_distances[n.index]))
        .sum();

    if reach_sum > 0.0 {
        neighbors.len() as f64 / reach_sum
    } else {
        1.0
    }
}

/// Mean neighbour LRD divided by the point's own LRD
fn local_outlier_factor(neighbors: &[Neighbor], lrds: &[f64], own_lrd: f64) -> f64 {
    if neighbors.is_empty() {
        return 1.0;
    }
    let mean = neighbors.iter().map(|n| lrds[n.index]).sum::<f64>() / neighbors.len() as f64;
    mean / own_lrd
}

/// Persisted state; the k-distance/LRD tables are recomputed on load
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LofState {
    pub common: DetectorConfig,
    pub k_neighbors: usize,
    pub dimensions: Option<usize>,
    pub threshold: f64,
    pub points: Vec<Vec<f64>>,
    pub scores: Vec<f64>,
    pub processed: Vec<bool>,
}

impl Checkpointable for LofDetector {
    type State = LofState;

    const KIND: DetectorKind = DetectorKind::Lof;

    fn to_state(&self) -> Self::State {
        LofState {
            common: self.config.common.clone(),
            k_neighbors: self.config.k_neighbors,
            dimensions: self.dims.get(),
            threshold: self.config.threshold,
            points: self.points.iter().map(|p| p.features.clone()).collect(),
            scores: self.points.iter().map(|p| p.score).collect(),
            processed: self.points.iter().map(|p| p.processed).collect(),
        }
    }

    fn restore_state(&mut self, state: Self::State) -> Result<()> {
        let n = state.points.len();
        if state.scores.len() != n || state.processed.len() != n {
            return Err(CheckpointError::DeserializationFailed(format!(
                "{} points, {} scores, {} processed flags",
                n,
                state.scores.len(),
                state.processed.len()
            ))
            .into());
        }

        let config = LofConfig {
            common: state.common,
            k_neighbors: state.k_neighbors,
            threshold: state.threshold,
        };
        let mut restored = Self::new(config)?;
        restored.dims = Dimensionality::from(state.dimensions);

        let rows = state
            .points
            .into_iter()
            .zip(state.scores)
            .zip(state.processed);
        for ((features, score), processed) in rows {
            restored.dims.admit(&features).map_err(|e| {
                CheckpointError::DeserializationFailed(format!("stored point rejected: {}", e))
            })?;
            restored.points.push(LofPoint {
                features,
                score,
                processed,
            });
        }

        let was_built = n >= restored.config.min_pts() && restored.points.iter().all(|p| p.processed);
        if was_built {
            restored.rebuild_tables();
        }

        info!(points = n, built = was_built, "LOF detector restored");
        *self = restored;
        Ok(())
    }
}

impl Detector for LofDetector {
    fn kind(&self) -> DetectorKind {
        DetectorKind::Lof
    }

    fn config(&self) -> &DetectorConfig {
        &self.config.common
    }

    fn dimensions(&self) -> Option<usize> {
        self.dims.get()
    }

    fn add_training_data(&mut self, point: &[f64]) -> Result<()> {
        self.add_point(point)
    }

    fn train(&mut self) -> Result<()> {
        self.build()
    }

    fn detect_multi(&mut self, point: &[f64]) -> Result<DetectionResult> {
        let threshold = self.config.threshold;

        let Some(lof) = self.score(point)? else {
            return Ok(
                DetectionResult::anomaly(f64::INFINITY, ISOLATED_POINT_Z_SCORE, 0.0, threshold)
                    .with_description("Isolated point: no neighbors found"),
            );
        };

        let z_score = lof / threshold;
        let result = if lof > threshold {
            DetectionResult::anomaly(lof, z_score, 0.0, threshold).with_description(format!(
                "LOF {:.3} exceeds threshold {:.3}",
                lof, threshold
            ))
        } else {
            DetectionResult::normal(lof, z_score, 0.0, threshold).with_description(format!(
                "LOF {:.3} within threshold {:.3}",
                lof, threshold
            ))
        };
        Ok(result)
    }

    fn is_initialized(&self) -> bool {
        self.built
    }

    fn save(&self, writer: &mut dyn Write) -> Result<()> {
        checkpoint::save(self, writer)
    }

    fn load(&mut self, reader: &mut dyn Read) -> Result<()> {
        checkpoint::load(self, reader)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid(center: (f64, f64), step: f64) -> Vec<Vec<f64>> {
        let mut points = Vec::new();
        for i in -3..=3 {
            for j in -3..=3 {
                points.push(vec![center.0 + i as f64 * step, center.1 + j as f64 * step]);
            }
        }
        points
    }

    fn built(points: &[Vec<f64>], k: usize) -> LofDetector {
        let mut lof = LofDetector::new(LofConfig::new(k)).unwrap();
        for p in points {
            lof.add_point(p).unwrap();
        }
        lof.build().unwrap();
        lof
    }

    #[test]
    fn test_build_requires_min_pts() {
        let mut lof = LofDetector::new(LofConfig::new(3)).unwrap();
        for x in [1.0, 2.0, 3.0] {
            lof.add_value(x).unwrap();
        }
        assert!(matches!(
            lof.build(),
            Err(AnomalyError::InsufficientData {
                required: 4,
                got: 3
            })
        ));
        assert!(lof.scores().is_none());

        lof.add_value(4.0).unwrap();
        assert!(lof.build().is_ok());
        assert_eq!(lof.scores().unwrap().len(), 4);
    }

    #[test]
    fn test_detect_before_build_fails() {
        let mut lof = LofDetector::new(LofConfig::new(2)).unwrap();
        assert!(matches!(
            lof.detect(1.0),
            Err(AnomalyError::NotTrained(_))
        ));

        for x in [1.0, 2.0, 3.0] {
            lof.add_value(x).unwrap();
        }
        lof.build().unwrap();
        lof.add_value(4.0).unwrap();
        assert!(matches!(
            lof.detect(1.0),
            Err(AnomalyError::NotTrained("points added since the last build()"))
        ));
    }

    #[test]
    fn test_grid_center_scores_near_one() {
        let lof = built(&grid((0.0, 0.0), 1.0), 4);

        let center = lof.score(&[0.0, 0.0]).unwrap().unwrap();
        assert!((center - 1.0).abs() < 0.05, "center LOF {}", center);
    }

    #[test]
    fn test_far_point_exceeds_threshold() {
        let mut points = grid((0.0, 0.0), 1.0);
        points.push(vec![30.0, 30.0]);
        let lof = built(&points, 4);

        let scores = lof.scores().unwrap();
        assert!(scores[points.len() - 1] > lof.threshold());
        assert_eq!(lof.outliers(), vec![points.len() - 1]);
    }

    #[test]
    fn test_denser_than_neighbors_is_not_flagged() {
        let mut lof = built(&grid((0.0, 0.0), 1.0), 4);
        let result = lof.detect_multi(&[0.1, 0.1]).unwrap();
        assert!(!result.is_anomaly);
    }

    #[test]
    fn test_duplicate_points_use_unit_density() {
        let points = vec![vec![2.0]; 5];
        let lof = built(&points, 3);

        for score in lof.scores().unwrap() {
            assert_eq!(score, 1.0);
        }
        assert_eq!(lof.score(&[2.0]).unwrap(), Some(1.0));
    }

    #[test]
    fn test_lrd_formula() {
        let neighbors = vec![
            Neighbor {
                index: 0,
                distance: 1.0,
            },
            Neighbor {
                index: 1,
                distance: 3.0,
            },
        ];
        let k_distances = vec![2.0, 1.0];
        // reach distances: max(1, 2) = 2 and max(3, 1) = 3
        assert!((local_reachability_density(&neighbors, &k_distances) - 0.4).abs() < 1e-12);
        assert_eq!(local_reachability_density(&[], &k_distances), 1.0);
    }

    #[test]
    fn test_rebuild_is_idempotent() {
        let mut points = grid((5.0, 5.0), 0.5);
        points.push(vec![9.0, -2.0]);
        let mut lof = built(&points, 5);

        let first = lof.detect_multi(&[6.0, 4.0]).unwrap();
        let scores = lof.scores();
        lof.build().unwrap();

        assert_eq!(lof.detect_multi(&[6.0, 4.0]).unwrap(), first);
        assert_eq!(lof.scores(), scores);
    }

    #[test]
    fn test_stored_query_matches_build_score() {
        let mut points: Vec<Vec<f64>> = (0..11).map(|i| vec![9.5 + i as f64 * 0.1]).collect();
        points.push(vec![100.0]);
        let mut lof = built(&points, 3);
        let scores = lof.scores().unwrap();

        let far = lof.detect(100.0).unwrap();
        assert_eq!(far.value, scores[11]);
        assert!(far.is_anomaly);

        let inner = lof.detect_multi(&points[5]).unwrap();
        assert_eq!(inner.value, scores[5]);
    }

    #[test]
    fn test_dimension_mismatch() {
        let mut lof = built(&grid((0.0, 0.0), 1.0), 3);
        assert!(matches!(
            lof.add_point(&[1.0]),
            Err(AnomalyError::DimensionMismatch {
                expected: 2,
                got: 1
            })
        ));
        assert!(matches!(
            lof.detect_multi(&[1.0, 2.0, 3.0]),
            Err(AnomalyError::DimensionMismatch {
                expected: 2,
                got: 3
            })
        ));
    }
}
