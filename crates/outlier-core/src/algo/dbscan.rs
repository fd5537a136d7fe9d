//! DBSCAN density-clustering detector
//!
//! Keeps a bounded FIFO history of points and clusters it by
//! density-reachability. A query is anomalous when its epsilon-neighbourhood
//! is too sparse, or when none of its neighbours belongs to a cluster.
//!
//! Reference: "A Density-Based Algorithm for Discovering Clusters in Large
//! Spatial Databases with Noise" (Ester et al., KDD 1996)

use std::collections::VecDeque;
use std::io::{Read, Write};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::checkpoint::{self, Checkpointable, CheckpointError};
use crate::config::{DbscanConfig, DetectorConfig};
use crate::detector::{DetectionResult, Detector, DetectorKind, Dimensionality};
use crate::distance::euclidean_unchecked;
use crate::error::Result;

/// Cluster assignment of a stored point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ClusterLabel {
    #[default]
    Unclassified,
    Noise,
    Cluster(u32),
}

impl ClusterLabel {
    /// Integer id: 0 unclassified, -1 noise, positive cluster id
    pub fn id(&self) -> i64 {
        match self {
            Self::Unclassified => 0,
            Self::Noise => -1,
            Self::Cluster(id) => i64::from(*id),
        }
    }

    pub fn from_id(id: i64) -> Self {
        match id {
            i64::MIN..=-1 => Self::Noise,
            0 => Self::Unclassified,
            _ => Self::Cluster(u32::try_from(id).unwrap_or(u32::MAX)),
        }
    }

    pub fn is_cluster(&self) -> bool {
        matches!(self, Self::Cluster(_))
    }
}

#[derive(Debug, Clone)]
struct ClusterPoint {
    features: Vec<f64>,
    label: ClusterLabel,
    /// Only meaningful while clustering
    visited: bool,
}

/// DBSCAN-based anomaly detector
#[derive(Debug, Clone)]
pub struct DbscanDetector {
    config: DbscanConfig,
    history: VecDeque<ClusterPoint>,
    dims: Dimensionality,
    cluster_count: usize,
    outlier_count: usize,
    /// Clustering has run at least once
    clustered: bool,
}

impl DbscanDetector {
    pub fn new(config: DbscanConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            history: VecDeque::with_capacity(config.max_history_size.min(4096)),
            config,
            dims: Dimensionality::default(),
            cluster_count: 0,
            outlier_count: 0,
            clustered: false,
        })
    }

    pub fn settings(&self) -> &DbscanConfig {
        &self.config
    }

    pub fn cluster_count(&self) -> usize {
        self.cluster_count
    }

    pub fn outlier_count(&self) -> usize {
        self.outlier_count
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    pub fn is_clustered(&self) -> bool {
        self.clustered
    }

    /// Labels of the stored points, oldest first
    pub fn labels(&self) -> Vec<ClusterLabel> {
        self.history.iter().map(|p| p.label).collect()
    }

    /// Stored feature vectors, oldest first
    pub fn points(&self) -> impl Iterator<Item = &[f64]> {
        self.history.iter().map(|p| p.features.as_slice())
    }

    pub fn clear(&mut self) {
        self.history.clear();
        self.dims.reset();
        self.cluster_count = 0;
        self.outlier_count = 0;
        self.clustered = false;
    }

    /// Append a point, evicting the oldest beyond `max_history_size`, and
    /// recluster whenever the history length is a multiple of
    /// `recluster_threshold`. A full history sitting on such a multiple
    /// reclusters on every add.
    pub fn add_point(&mut self, point: &[f64]) -> Result<()> {
        self.dims.admit(point)?;
        self.history.push_back(ClusterPoint {
            features: point.to_vec(),
            label: ClusterLabel::Unclassified,
            visited: false,
        });

        while self.history.len() > self.config.max_history_size {
            if let Some(evicted) = self.history.pop_front() {
                if evicted.label == ClusterLabel::Noise {
                    self.outlier_count -= 1;
                }
            }
        }

        if self.config.auto_recluster && self.history.len() % self.config.recluster_threshold == 0 {
            self.recluster();
        }
        Ok(())
    }

    /// Indices of stored points within `epsilon` of `point`, itself included
    fn region_query(&self, point: &[f64]) -> Vec<usize> {
        let epsilon = self.config.epsilon;
        self.history
            .iter()
            .enumerate()
            .filter(|(_, p)| euclidean_unchecked(point, &p.features) <= epsilon)
            .map(|(i, _)| i)
            .collect()
    }

    /// Run DBSCAN over the whole history
    pub fn recluster(&mut self) {
        for point in self.history.iter_mut() {
            point.label = ClusterLabel::Unclassified;
            point.visited = false;
        }
        self.cluster_count = 0;
        self.outlier_count = 0;

        for i in 0..self.history.len() {
            if self.history[i].visited {
                continue;
            }
            self.history[i].visited = true;

            let neighbors = self.region_query(&self.history[i].features);
            if neighbors.len() < self.config.min_points {
                self.history[i].label = ClusterLabel::Noise;
                self.outlier_count += 1;
                continue;
            }

            self.cluster_count += 1;
            let cluster = ClusterLabel::Cluster(self.cluster_count as u32);
            self.expand_cluster(i, neighbors, cluster);
        }

        self.clustered = true;
        debug!(
            points = self.history.len(),
            clusters = self.cluster_count,
            outliers = self.outlier_count,
            "DBSCAN reclustered"
        );
    }

    fn expand_cluster(&mut self, seed: usize, neighbors: Vec<usize>, cluster: ClusterLabel) {
        self.assign(seed, cluster);

        let mut queued = vec![false; self.history.len()];
        for &n in &neighbors {
            queued[n] = true;
        }
        let mut queue = neighbors;

        let mut cursor = 0;
        while cursor < queue.len() {
            let current = queue[cursor];
            cursor += 1;

            if !self.history[current].visited {
                self.history[current].visited = true;
                let reachable = self.region_query(&self.history[current].features);
                // Border points join the cluster but do not grow it
                if reachable.len() >= self.config.min_points {
                    for r in reachable {
                        if !queued[r] {
                            queued[r] = true;
                            queue.push(r);
                        }
                    }
                }
            }

            self.assign(current, cluster);
        }
    }

    /// Claim an unclassified or noise point for `cluster`
    fn assign(&mut self, index: usize, cluster: ClusterLabel) {
        let point = &mut self.history[index];
        match point.label {
            ClusterLabel::Unclassified => point.label = cluster,
            ClusterLabel::Noise => {
                point.label = cluster;
                self.outlier_count -= 1;
            }
            ClusterLabel::Cluster(_) => {}
        }
    }

    /// Classify `point` against the clustered history.
    ///
    /// A vector of the wrong length is reported as an anomalous result rather
    /// than an error, unlike [`DbscanDetector::add_point`].
    pub fn detect_point(&mut self, point: &[f64]) -> DetectionResult {
        let min_points = self.config.min_points;
        let epsilon = self.config.epsilon;

        if self.history.len() < min_points {
            return DetectionResult::normal(0.0, 0.0, 0.0, epsilon).with_description(format!(
                "Not enough samples ({}/{})",
                self.history.len(),
                min_points
            ));
        }

        if let Err(e) = self.dims.check(point) {
            return DetectionResult::anomaly(0.0, 0.0, 0.0, epsilon)
                .with_description(format!("Invalid dimension: {}", e));
        }

        if !self.clustered {
            self.recluster();
        }

        let neighbors = self.region_query(point);
        if neighbors.len() < min_points {
            let min = min_points as f64;
            let z_score = (min - neighbors.len() as f64) / min.sqrt();
            return DetectionResult::anomaly(neighbors.len() as f64, z_score, 0.0, epsilon)
                .with_description(format!(
                    "Low density region: {} neighbors within {:.3} (need {})",
                    neighbors.len(),
                    epsilon,
                    min_points
                ));
        }

        let nearest = neighbors
            .iter()
            .filter(|&&i| self.history[i].label.is_cluster())
            .map(|&i| {
                (
                    euclidean_unchecked(point, &self.history[i].features),
                    self.history[i].label,
                )
            })
            .min_by(|a, b| a.0.total_cmp(&b.0));

        match nearest {
            None => DetectionResult::anomaly(neighbors.len() as f64, 0.0, 0.0, epsilon)
                .with_description("Not in any cluster"),
            Some((distance, label)) => {
                DetectionResult::normal(distance, distance / epsilon, 0.0, epsilon)
                    .with_description(format!(
                        "Member of cluster {} (distance {:.3})",
                        label.id(),
                        distance
                    ))
            }
        }
    }
}

/// Persisted state; cluster ids are stored per point in history order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbscanState {
    pub common: DetectorConfig,
    pub epsilon: f64,
    pub min_points: usize,
    pub dimensions: Option<usize>,
    pub max_history_size: usize,
    pub auto_recluster: bool,
    pub recluster_threshold: usize,
    pub points: Vec<Vec<f64>>,
    pub cluster_ids: Vec<i64>,
}

impl Checkpointable for DbscanDetector {
    type State = DbscanState;

    const KIND: DetectorKind = DetectorKind::Dbscan;

    fn to_state(&self) -> Self::State {
        DbscanState {
            common: self.config.common.clone(),
            epsilon: self.config.epsilon,
            min_points: self.config.min_points,
            dimensions: self.dims.get(),
            max_history_size: self.config.max_history_size,
            auto_recluster: self.config.auto_recluster,
            recluster_threshold: self.config.recluster_threshold,
            points: self.history.iter().map(|p| p.features.clone()).collect(),
            cluster_ids: self.history.iter().map(|p| p.label.id()).collect(),
        }
    }

    fn restore_state(&mut self, state: Self::State) -> Result<()> {
        if state.points.len() != state.cluster_ids.len() {
            return Err(CheckpointError::DeserializationFailed(format!(
                "{} points but {} cluster ids",
                state.points.len(),
                state.cluster_ids.len()
            ))
            .into());
        }

        let config = DbscanConfig {
            common: state.common,
            epsilon: state.epsilon,
            min_points: state.min_points,
            max_history_size: state.max_history_size,
            auto_recluster: state.auto_recluster,
            recluster_threshold: state.recluster_threshold,
        };
        let mut restored = Self::new(config)?;
        restored.dims = Dimensionality::from(state.dimensions);

        for (features, id) in state.points.into_iter().zip(state.cluster_ids) {
            restored.dims.admit(&features).map_err(|e| {
                CheckpointError::DeserializationFailed(format!("stored point rejected: {}", e))
            })?;
            let label = ClusterLabel::from_id(id);
            if label == ClusterLabel::Noise {
                restored.outlier_count += 1;
            }
            restored.history.push_back(ClusterPoint {
                features,
                label,
                visited: false,
            });
        }

        if restored.history.len() >= restored.config.min_points {
            restored.recluster();
        }

        info!(
            points = restored.history.len(),
            clusters = restored.cluster_count,
            "DBSCAN detector restored"
        );
        *self = restored;
        Ok(())
    }
}

impl Detector for DbscanDetector {
    fn kind(&self) -> DetectorKind {
        DetectorKind::Dbscan
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
        self.recluster();
        Ok(())
    }

    fn detect_multi(&mut self, point: &[f64]) -> Result<DetectionResult> {
        Ok(self.detect_point(point))
    }

    fn is_initialized(&self) -> bool {
        self.clustered
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
    use crate::error::AnomalyError;
    use std::collections::HashSet;

    fn detector(epsilon: f64, min_points: usize) -> DbscanDetector {
        DbscanDetector::new(DbscanConfig::new(epsilon, min_points).with_auto_recluster(false, 100))
            .unwrap()
    }

    fn assert_label_invariants(dbscan: &DbscanDetector) {
        let labels = dbscan.labels();
        assert!(labels.iter().all(|l| *l != ClusterLabel::Unclassified));

        let noise = labels.iter().filter(|l| **l == ClusterLabel::Noise).count();
        assert_eq!(noise, dbscan.outlier_count());

        let ids: HashSet<i64> = labels.iter().filter(|l| l.is_cluster()).map(|l| l.id()).collect();
        assert_eq!(ids.len(), dbscan.cluster_count());
        assert_eq!(
            ids.iter().copied().max().unwrap_or(0),
            dbscan.cluster_count() as i64
        );
    }

    #[test]
    fn test_label_ids() {
        assert_eq!(ClusterLabel::Unclassified.id(), 0);
        assert_eq!(ClusterLabel::Noise.id(), -1);
        assert_eq!(ClusterLabel::Cluster(4).id(), 4);
        assert_eq!(ClusterLabel::from_id(-1), ClusterLabel::Noise);
        assert_eq!(ClusterLabel::from_id(0), ClusterLabel::Unclassified);
        assert_eq!(ClusterLabel::from_id(2), ClusterLabel::Cluster(2));
    }

    #[test]
    fn test_two_clusters_and_noise() {
        let mut dbscan = detector(0.5, 3);
        for i in 0..10 {
            dbscan.add_point(&[i as f64 * 0.1, 0.0]).unwrap();
            dbscan.add_point(&[10.0 + i as f64 * 0.1, 10.0]).unwrap();
        }
        dbscan.add_point(&[5.0, 5.0]).unwrap();
        dbscan.recluster();

        assert_eq!(dbscan.cluster_count(), 2);
        assert_eq!(dbscan.outlier_count(), 1);
        assert_eq!(dbscan.labels()[20], ClusterLabel::Noise);
        assert_label_invariants(&dbscan);
    }

    #[test]
    fn test_border_point_reclaimed_from_noise() {
        // The first point only has two neighbours, so it is noise when first
        // visited, but it lies within epsilon of the core point at 0.5.
        let mut dbscan = detector(0.6, 3);
        for x in [0.0, 0.5, 0.9, 1.0, 1.1] {
            dbscan.add_point(&[x]).unwrap();
        }
        dbscan.recluster();

        assert_eq!(dbscan.labels()[0], ClusterLabel::Cluster(1));
        assert_eq!(dbscan.outlier_count(), 0);
        assert_label_invariants(&dbscan);
    }

    #[test]
    fn test_recluster_is_idempotent() {
        let mut dbscan = detector(1.0, 3);
        for i in 0..30 {
            dbscan.add_point(&[(i % 7) as f64 * 0.3, (i % 5) as f64 * 0.4]).unwrap();
        }
        dbscan.add_point(&[50.0, 50.0]).unwrap();

        dbscan.recluster();
        let labels = dbscan.labels();
        let first = dbscan.detect_point(&[0.5, 0.5]);

        dbscan.recluster();
        assert_eq!(dbscan.labels(), labels);
        assert_eq!(dbscan.detect_point(&[0.5, 0.5]), first);
    }

    #[test]
    fn test_not_enough_samples() {
        let mut dbscan = detector(1.0, 5);
        dbscan.add_point(&[1.0]).unwrap();

        let result = dbscan.detect_point(&[1.0]);
        assert!(!result.is_anomaly);
        assert!(result.description.starts_with("Not enough samples"));
        assert!(!dbscan.is_clustered());
    }

    #[test]
    fn test_lazy_clustering_on_first_detect() {
        let mut dbscan = detector(1.0, 3);
        for i in 0..10 {
            dbscan.add_point(&[i as f64 * 0.2]).unwrap();
        }
        assert!(!dbscan.is_clustered());

        let result = dbscan.detect_point(&[1.0]);
        assert!(dbscan.is_clustered());
        assert!(!result.is_anomaly);
        assert!(result.z_score <= 1.0);
    }

    #[test]
    fn test_sparse_query_z_score() {
        let mut dbscan = detector(1.0, 4);
        for i in 0..10 {
            dbscan.add_point(&[i as f64 * 0.1]).unwrap();
        }

        let result = dbscan.detect_point(&[50.0]);
        assert!(result.is_anomaly);
        assert_eq!(result.value, 0.0);
        assert!((result.z_score - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_outer_points_join_through_core() {
        let mut dbscan = detector(1.0, 3);
        for x in [-0.9, 0.0, 0.9] {
            dbscan.add_point(&[x, 0.0]).unwrap();
        }
        for x in [-0.9, 0.0, 0.9] {
            dbscan.add_point(&[x, 20.0]).unwrap();
        }
        dbscan.recluster();

        // middle points are core: each sees itself and both outer points
        assert_eq!(dbscan.cluster_count(), 2);
        assert_eq!(dbscan.outlier_count(), 0);
        assert_label_invariants(&dbscan);
    }

    #[test]
    fn test_dense_but_unclustered_query() {
        // Both stored points fall within epsilon of the query, but neither has
        // a second neighbour of its own, so both are noise.
        let mut sparse = detector(0.5, 2);
        sparse.add_point(&[0.0]).unwrap();
        sparse.add_point(&[0.8]).unwrap();
        sparse.recluster();
        assert_eq!(sparse.outlier_count(), 2);

        let result = sparse.detect_point(&[0.4]);
        assert!(result.is_anomaly);
        assert_eq!(result.description, "Not in any cluster");
    }

    #[test]
    fn test_dimension_mismatch_on_detect_is_a_result() {
        let mut dbscan = detector(1.0, 2);
        dbscan.add_point(&[0.0, 0.0]).unwrap();
        dbscan.add_point(&[0.1, 0.0]).unwrap();

        let result = dbscan.detect_point(&[0.0]);
        assert!(result.is_anomaly);
        assert!(result.description.starts_with("Invalid dimension"));

        assert!(matches!(
            dbscan.add_point(&[0.0]),
            Err(AnomalyError::DimensionMismatch {
                expected: 2,
                got: 1
            })
        ));
    }

    #[test]
    fn test_history_is_bounded() {
        let mut dbscan = DbscanDetector::new(
            DbscanConfig::new(1.0, 2)
                .with_max_history_size(5)
                .with_auto_recluster(false, 1),
        )
        .unwrap();
        for i in 0..8 {
            dbscan.add_point(&[i as f64]).unwrap();
        }

        assert_eq!(dbscan.history_len(), 5);
        let first: Vec<f64> = dbscan.points().next().unwrap().to_vec();
        assert_eq!(first, vec![3.0]);
    }

    #[test]
    fn test_eviction_keeps_outlier_count() {
        let mut dbscan = DbscanDetector::new(
            DbscanConfig::new(0.5, 2)
                .with_max_history_size(4)
                .with_auto_recluster(false, 1),
        )
        .unwrap();
        for x in [100.0, 0.0, 0.1, 0.2] {
            dbscan.add_point(&[x]).unwrap();
        }
        dbscan.recluster();
        assert_eq!(dbscan.outlier_count(), 1);

        dbscan.add_point(&[0.3]).unwrap();
        assert_eq!(dbscan.outlier_count(), 0);
    }

    #[test]
    fn test_auto_recluster_every_threshold_points() {
        let mut dbscan =
            DbscanDetector::new(DbscanConfig::new(1.0, 3).with_auto_recluster(true, 5)).unwrap();
        for i in 0..4 {
            dbscan.add_point(&[i as f64 * 0.1]).unwrap();
        }
        assert!(!dbscan.is_clustered());

        dbscan.add_point(&[0.4]).unwrap();
        assert!(dbscan.is_clustered());
        assert_eq!(dbscan.cluster_count(), 1);
        assert_label_invariants(&dbscan);
    }

    #[test]
    fn test_auto_recluster_after_manual_recluster() {
        let mut dbscan =
            DbscanDetector::new(DbscanConfig::new(1.0, 2).with_auto_recluster(true, 5)).unwrap();
        for i in 0..3 {
            dbscan.add_point(&[i as f64 * 0.1]).unwrap();
        }
        dbscan.recluster();

        dbscan.add_point(&[0.3]).unwrap();
        assert_eq!(dbscan.labels()[3], ClusterLabel::Unclassified);

        dbscan.add_point(&[0.4]).unwrap();
        assert_eq!(dbscan.history_len(), 5);
        assert!(dbscan.labels().iter().all(|l| *l == ClusterLabel::Cluster(1)));
    }

    #[test]
    fn test_full_history_reclusters_on_every_add() {
        let mut dbscan = DbscanDetector::new(
            DbscanConfig::new(1.0, 2)
                .with_max_history_size(10)
                .with_auto_recluster(true, 5),
        )
        .unwrap();
        for i in 0..10 {
            dbscan.add_point(&[i as f64 * 0.1]).unwrap();
        }
        assert!(dbscan.labels().iter().all(|l| l.is_cluster()));

        dbscan.add_point(&[1.0]).unwrap();
        assert_eq!(dbscan.history_len(), 10);
        assert!(dbscan.labels().iter().all(|l| l.is_cluster()));

        dbscan.add_point(&[1.1]).unwrap();
        assert_eq!(dbscan.labels()[9], ClusterLabel::Cluster(1));
    }
}
