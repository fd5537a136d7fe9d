//! Isolation Forest for Multivariate Anomaly Detection
//!
//! An ensemble of randomly grown partition trees. Anomalies are "few and
//! different", so random axis-aligned cuts isolate them in fewer steps than
//! well-embedded points. The anomaly score compares the mean path length of a
//! query across all trees with the expected path length of an unsuccessful
//! BST search over the same sample size:
//!
//! `score = 2^(-mean_path_length / c(n))`
//!
//! Scores lie in (0, 1]; values near 1 mean short paths (isolated points).
//!
//! Reference: "Isolation Forest" (Liu, Ting, Zhou, ICDM 2008)

use std::io::{Read, Write};

use rand::rngs::StdRng;
use rand::seq::{SliceRandom, index};
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::checkpoint::{self, Checkpointable, CheckpointError};
use crate::config::{DetectorConfig, IsolationForestConfig};
use crate::detector::{DetectionResult, Detector, DetectorKind, Dimensionality};
use crate::error::{AnomalyError, Result};

/// Euler–Mascheroni constant
pub const EULER_GAMMA: f64 = 0.5772156649;

/// Training points scored when recalculating the decision threshold
const THRESHOLD_SAMPLE_SIZE: usize = 100;
const THRESHOLD_PERCENTILE: f64 = 0.9;
const MIN_THRESHOLD: f64 = 0.5;
const MAX_THRESHOLD: f64 = 0.9;

/// Expected path length of an unsuccessful search in a BST of `n` nodes
pub fn average_path_length(n: usize) -> f64 {
    match n {
        0 | 1 => 0.0,
        2 => 1.0,
        _ => {
            let n = n as f64;
            2.0 * ((n - 1.0).ln() + EULER_GAMMA) - 2.0 * (n - 1.0) / n
        }
    }
}

/// A node in an isolation tree. Children are owned by their parent; an empty
/// partition leaves the corresponding child absent.
#[derive(Debug, Clone)]
enum Node {
    Leaf {
        /// Number of sample points that reached this node
        size: usize,
    },
    Split {
        feature: usize,
        /// Points with `value < threshold` go left, the rest go right
        threshold: f64,
        left: Option<Box<Node>>,
        right: Option<Box<Node>>,
    },
}

/// A single isolation tree, immutable once grown
#[derive(Debug, Clone)]
pub struct IsolationTree {
    root: Node,
}

impl IsolationTree {
    /// Grow a tree over `sample`, a set of indices into `data`
    fn grow(
        data: &[Vec<f64>],
        sample: &[usize],
        max_depth: usize,
        dimensions: usize,
        rng: &mut impl Rng,
    ) -> Self {
        Self {
            root: grow_node(data, sample.to_vec(), 0, max_depth, dimensions, rng),
        }
    }

    /// Edges walked from the root for `point`, plus `c(size)` at the leaf.
    /// `point` must have the dimensionality the tree was grown with.
    pub(crate) fn path_length(&self, point: &[f64]) -> f64 {
        let mut node = &self.root;
        let mut depth = 0usize;

        loop {
            match node {
                Node::Leaf { size } => return depth as f64 + average_path_length(*size),
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    let child = if point[*feature] < *threshold { left } else { right };
                    depth += 1;
                    match child {
                        Some(next) => node = &**next,
                        None => return depth as f64,
                    }
                }
            }
        }
    }

    /// Number of sample points stored in the leaves
    pub fn size(&self) -> usize {
        fn count(node: &Node) -> usize {
            match node {
                Node::Leaf { size } => *size,
                Node::Split { left, right, .. } => {
                    left.as_deref().map_or(0, count) + right.as_deref().map_or(0, count)
                }
            }
        }
        count(&self.root)
    }

    /// Longest root-to-leaf edge count
    pub fn depth(&self) -> usize {
        fn depth(node: &Node) -> usize {
            match node {
                Node::Leaf { .. } => 0,
                Node::Split { left, right, .. } => {
                    1 + left
                        .as_deref()
                        .map_or(0, depth)
                        .max(right.as_deref().map_or(0, depth))
                }
            }
        }
        depth(&self.root)
    }
}

fn grow_node(
    data: &[Vec<f64>],
    indices: Vec<usize>,
    depth: usize,
    max_depth: usize,
    dimensions: usize,
    rng: &mut impl Rng,
) -> Node {
    if indices.len() <= 1 || depth >= max_depth {
        return Node::Leaf {
            size: indices.len(),
        };
    }

    let feature = rng.random_range(0..dimensions);
    let (min, max) = indices
        .iter()
        .map(|&i| data[i][feature])
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
            (lo.min(v), hi.max(v))
        });
    let threshold = rng.random_range(min..=max);

    let (left, right): (Vec<usize>, Vec<usize>) = indices
        .into_iter()
        .partition(|&i| data[i][feature] < threshold);

    let left = if left.is_empty() {
        None
    } else {
        Some(Box::new(grow_node(data, left, depth + 1, max_depth, dimensions, rng)))
    };
    let right = if right.is_empty() {
        None
    } else {
        Some(Box::new(grow_node(data, right, depth + 1, max_depth, dimensions, rng)))
    };

    Node::Split {
        feature,
        threshold,
        left,
        right,
    }
}

fn make_rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_os_rng(),
    }
}

/// Isolation Forest anomaly detector
#[derive(Debug, Clone)]
pub struct IsolationForest {
    config: IsolationForestConfig,
    trees: Vec<IsolationTree>,
    /// Append-only until `train()`
    training_data: Vec<Vec<f64>>,
    dims: Dimensionality,
    /// `c(n)` for the per-tree sample size
    average_path_length: f64,
    threshold: f64,
    /// Training data changed since the trees were grown
    stale: bool,
    rng: StdRng,
}

impl IsolationForest {
    pub fn new(config: IsolationForestConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            trees: Vec::new(),
            training_data: Vec::new(),
            dims: Dimensionality::default(),
            average_path_length: 0.0,
            threshold: config.threshold,
            stale: false,
            rng: make_rng(config.seed),
            config,
        })
    }

    pub fn settings(&self) -> &IsolationForestConfig {
        &self.config
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn average_path_length(&self) -> f64 {
        self.average_path_length
    }

    pub fn tree_count(&self) -> usize {
        self.trees.len()
    }

    pub fn trees(&self) -> &[IsolationTree] {
        &self.trees
    }

    pub fn training_len(&self) -> usize {
        self.training_data.len()
    }

    /// Drop the training buffer and the model built from it
    pub fn clear_training_data(&mut self) {
        self.training_data.clear();
        self.trees.clear();
        self.dims.reset();
        self.average_path_length = 0.0;
        self.threshold = self.config.threshold;
        self.stale = false;
    }

    /// Grow `num_trees` trees from bootstrap samples of the training buffer,
    /// then recalculate the decision threshold.
    pub fn train(&mut self) -> Result<()> {
        let len = self.training_data.len();
        let Some(dimensions) = self.dims.get().filter(|_| len > 0) else {
            return Err(AnomalyError::InsufficientData {
                required: 1,
                got: len,
            });
        };

        if let Some(seed) = self.config.seed {
            self.rng = StdRng::seed_from_u64(seed);
        }

        let sample_size = self.config.sub_sample_size.min(len);
        let max_depth = self.config.effective_max_depth();
        let mut indices: Vec<usize> = (0..len).collect();
        let mut trees = Vec::with_capacity(self.config.num_trees);

        for _ in 0..self.config.num_trees {
            indices.shuffle(&mut self.rng);
            trees.push(IsolationTree::grow(
                &self.training_data,
                &indices[..sample_size],
                max_depth,
                dimensions,
                &mut self.rng,
            ));
        }

        self.trees = trees;
        self.average_path_length = average_path_length(sample_size);
        self.stale = false;
        self.calculate_optimal_threshold()?;

        debug!(
            trees = self.trees.len(),
            sample_size,
            max_depth,
            threshold = self.threshold,
            "Isolation forest trained"
        );
        Ok(())
    }

    /// Set the threshold to the 90th percentile of scores over up to 100
    /// sampled training points, clamped to [0.5, 0.9].
    pub fn calculate_optimal_threshold(&mut self) -> Result<f64> {
        if self.trees.is_empty() {
            return Err(AnomalyError::NotTrained("call train() first"));
        }

        let len = self.training_data.len();
        let amount = len.min(THRESHOLD_SAMPLE_SIZE);
        if amount == 0 {
            return Ok(self.threshold);
        }

        let sampled = index::sample(&mut self.rng, len, amount);
        let mut scores: Vec<f64> = sampled
            .iter()
            .map(|i| self.score_unchecked(&self.training_data[i]))
            .collect();
        scores.sort_by(f64::total_cmp);

        let position = ((scores.len() as f64 * THRESHOLD_PERCENTILE) as usize).min(scores.len() - 1);
        self.threshold = scores[position].clamp(MIN_THRESHOLD, MAX_THRESHOLD);
        Ok(self.threshold)
    }

    /// Anomaly score of `point` against the current forest, in (0, 1]
    pub fn score(&self, point: &[f64]) -> Result<f64> {
        self.require_current()?;
        self.dims.check(point)?;
        Ok(self.score_unchecked(point))
    }

    fn require_current(&self) -> Result<()> {
        if self.trees.is_empty() {
            return Err(AnomalyError::NotTrained("call train() before scoring"));
        }
        if self.stale {
            return Err(AnomalyError::NotTrained(
                "training data changed since the last train()",
            ));
        }
        Ok(())
    }

    /// Mean path length of `point` across all trees
    pub fn mean_path_length(&self, point: &[f64]) -> Result<f64> {
        self.require_current()?;
        self.dims.check(point)?;
        Ok(self.mean_path_length_unchecked(point))
    }

    fn mean_path_length_unchecked(&self, point: &[f64]) -> f64 {
        if self.trees.is_empty() {
            return 0.0;
        }
        self.trees.iter().map(|tree| tree.path_length(point)).sum::<f64>() / self.trees.len() as f64
    }

    fn score_unchecked(&self, point: &[f64]) -> f64 {
        // c(n) is zero for samples of one point; no path can be compared.
        if self.average_path_length <= 0.0 {
            return 0.5;
        }
        2f64.powf(-self.mean_path_length_unchecked(point) / self.average_path_length)
    }
}

/// Persisted state. Trees are never stored; they are regrown from
/// `training_data` after loading.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IsolationForestState {
    pub common: DetectorConfig,
    pub num_trees: usize,
    pub sub_sample_size: usize,
    pub max_depth: usize,
    pub threshold: f64,
    pub auto_train_threshold: Option<usize>,
    pub seed: Option<u64>,
    pub training_data: Vec<Vec<f64>>,
}

impl Checkpointable for IsolationForest {
    type State = IsolationForestState;

    const KIND: DetectorKind = DetectorKind::IsolationForest;

    fn to_state(&self) -> Self::State {
        IsolationForestState {
            common: self.config.common.clone(),
            num_trees: self.config.num_trees,
            sub_sample_size: self.config.sub_sample_size,
            max_depth: self.config.effective_max_depth(),
            threshold: self.threshold,
            auto_train_threshold: self.config.auto_train_threshold,
            seed: self.config.seed,
            training_data: self.training_data.clone(),
        }
    }

    fn restore_state(&mut self, state: Self::State) -> Result<()> {
        let config = IsolationForestConfig {
            common: state.common,
            num_trees: state.num_trees,
            sub_sample_size: state.sub_sample_size,
            max_depth: Some(state.max_depth),
            threshold: state.threshold,
            auto_train_threshold: state.auto_train_threshold,
            seed: state.seed,
        };
        config.validate()?;

        let mut dims = Dimensionality::default();
        for point in &state.training_data {
            dims.admit(point).map_err(|e| {
                CheckpointError::DeserializationFailed(format!("training point rejected: {}", e))
            })?;
        }

        *self = Self::new(config)?;
        self.training_data = state.training_data;
        self.dims = dims;

        info!(
            points = self.training_data.len(),
            "Isolation forest restored; retrain required"
        );
        Ok(())
    }
}

impl Detector for IsolationForest {
    fn kind(&self) -> DetectorKind {
        DetectorKind::IsolationForest
    }

    fn config(&self) -> &DetectorConfig {
        &self.config.common
    }

    fn dimensions(&self) -> Option<usize> {
        self.dims.get()
    }

    fn add_training_data(&mut self, point: &[f64]) -> Result<()> {
        self.dims.admit(point)?;
        self.training_data.push(point.to_vec());
        self.stale = true;

        if self.config.auto_train_threshold == Some(self.training_data.len()) {
            info!(
                points = self.training_data.len(),
                "Auto-train threshold reached"
            );
            self.train()?;
        }
        Ok(())
    }

    fn train(&mut self) -> Result<()> {
        IsolationForest::train(self)
    }

    fn detect_multi(&mut self, point: &[f64]) -> Result<DetectionResult> {
        if self.training_data.is_empty() {
            return Err(AnomalyError::NotTrained("no training data"));
        }
        self.dims.check(point)?;

        if self.trees.is_empty() || self.stale {
            debug!(
                points = self.training_data.len(),
                "Training isolation forest before detection"
            );
            self.train()?;
        }

        let score = self.score_unchecked(point);
        let threshold = self.threshold;
        let z_score = score / threshold;

        let result = if score > threshold {
            DetectionResult::anomaly(score, z_score, 0.0, threshold).with_description(format!(
                "Isolation score {:.3} exceeds threshold {:.3}",
                score, threshold
            ))
        } else {
            DetectionResult::normal(score, z_score, 0.0, threshold).with_description(format!(
                "Isolation score {:.3} within threshold {:.3}",
                score, threshold
            ))
        };
        Ok(result)
    }

    fn is_initialized(&self) -> bool {
        !self.trees.is_empty() && !self.stale
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

    fn cluster(n: usize, seed: u64) -> Vec<Vec<f64>> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n)
            .map(|_| {
                vec![
                    100.0 + rng.random_range(-2.0..2.0),
                    50.0 + rng.random_range(-2.0..2.0),
                ]
            })
            .collect()
    }

    fn trained_forest(points: &[Vec<f64>], seed: u64) -> IsolationForest {
        let config = IsolationForestConfig::default()
            .with_num_trees(50)
            .with_seed(seed);
        let mut forest = IsolationForest::new(config).unwrap();
        for point in points {
            forest.add_training_data(point).unwrap();
        }
        forest.train().unwrap();
        forest
    }

    #[test]
    fn test_average_path_length() {
        assert_eq!(average_path_length(0), 0.0);
        assert_eq!(average_path_length(1), 0.0);
        assert_eq!(average_path_length(2), 1.0);

        let expected = 2.0 * (255f64.ln() + EULER_GAMMA) - 2.0 * 255.0 / 256.0;
        assert!((average_path_length(256) - expected).abs() < 1e-12);
        assert!(average_path_length(256) > average_path_length(64));
    }

    #[test]
    fn test_trees_hold_whole_sample() {
        let points = cluster(300, 1);
        let forest = trained_forest(&points, 3);

        assert_eq!(forest.tree_count(), 50);
        for tree in forest.trees() {
            assert_eq!(tree.size(), 256);
            assert!(tree.depth() <= 8);
        }
        assert!((forest.average_path_length() - average_path_length(256)).abs() < 1e-12);
    }

    #[test]
    fn test_small_buffer_uses_whole_buffer() {
        let points = cluster(20, 2);
        let forest = trained_forest(&points, 5);
        assert!(forest.trees().iter().all(|tree| tree.size() == 20));
        assert!((forest.average_path_length() - average_path_length(20)).abs() < 1e-12);
    }

    #[test]
    fn test_scores_in_unit_interval() {
        let points = cluster(200, 4);
        let forest = trained_forest(&points, 9);

        for point in points.iter().chain([vec![0.0, 0.0], vec![1e6, -1e6]].iter()) {
            let score = forest.score(point).unwrap();
            assert!(score > 0.0 && score <= 1.0, "score out of range: {}", score);
        }
    }

    #[test]
    fn test_outlier_scores_higher_than_center() {
        let points = cluster(256, 6);
        let forest = trained_forest(&points, 11);

        let center = forest.score(&[100.0, 50.0]).unwrap();
        let outlier = forest.score(&[400.0, -300.0]).unwrap();
        assert!(outlier > center, "outlier {} vs center {}", outlier, center);
    }

    #[test]
    fn test_threshold_is_clamped() {
        let points = cluster(150, 7);
        let forest = trained_forest(&points, 13);
        assert!((MIN_THRESHOLD..=MAX_THRESHOLD).contains(&forest.threshold()));
    }

    #[test]
    fn test_train_requires_data() {
        let mut forest = IsolationForest::new(IsolationForestConfig::default()).unwrap();
        assert!(matches!(
            forest.train(),
            Err(AnomalyError::InsufficientData {
                required: 1,
                got: 0
            })
        ));
        assert!(matches!(
            forest.detect_multi(&[1.0, 2.0]),
            Err(AnomalyError::NotTrained(_))
        ));
    }

    #[test]
    fn test_detect_trains_implicitly() {
        let mut forest =
            IsolationForest::new(IsolationForestConfig::default().with_seed(21)).unwrap();
        for point in cluster(64, 8) {
            forest.add_training_data(&point).unwrap();
        }
        assert!(!forest.is_initialized());

        let result = forest.detect_multi(&[100.0, 50.0]).unwrap();
        assert!(forest.is_initialized());
        assert!(result.value > 0.0 && result.value <= 1.0);
        assert_eq!(result.upper_limit, forest.threshold());
    }

    #[test]
    fn test_new_data_marks_model_stale() {
        let points = cluster(64, 10);
        let mut forest = trained_forest(&points, 15);
        assert!(forest.is_initialized());

        forest.add_training_data(&[100.0, 50.0]).unwrap();
        assert!(!forest.is_initialized());
        assert!(matches!(
            forest.score(&[100.0, 50.0]),
            Err(AnomalyError::NotTrained(_))
        ));

        forest.detect_multi(&[100.0, 50.0]).unwrap();
        assert!(forest.is_initialized());
    }

    #[test]
    fn test_auto_train_threshold() {
        let config = IsolationForestConfig::default()
            .with_seed(17)
            .with_auto_train_threshold(32);
        let mut forest = IsolationForest::new(config).unwrap();

        let points = cluster(32, 12);
        for point in &points[..31] {
            forest.add_training_data(point).unwrap();
        }
        assert_eq!(forest.tree_count(), 0);

        forest.add_training_data(&points[31]).unwrap();
        assert!(forest.is_initialized());
        assert_eq!(forest.tree_count(), 100);
    }

    #[test]
    fn test_dimension_mismatch() {
        let points = cluster(32, 14);
        let mut forest = trained_forest(&points, 19);

        assert!(matches!(
            forest.add_training_data(&[1.0, 2.0, 3.0]),
            Err(AnomalyError::DimensionMismatch {
                expected: 2,
                got: 3
            })
        ));
        assert!(matches!(
            forest.detect_multi(&[1.0]),
            Err(AnomalyError::DimensionMismatch {
                expected: 2,
                got: 1
            })
        ));
    }

    #[test]
    fn test_mean_path_length_checks_dimensions() {
        let untrained = IsolationForest::new(IsolationForestConfig::default()).unwrap();
        assert!(matches!(
            untrained.mean_path_length(&[1.0, 2.0]),
            Err(AnomalyError::NotTrained(_))
        ));

        let points = cluster(64, 18);
        let forest = trained_forest(&points, 27);
        assert!(matches!(
            forest.mean_path_length(&[1.0]),
            Err(AnomalyError::DimensionMismatch {
                expected: 2,
                got: 1
            })
        ));

        let depth = forest.mean_path_length(&[100.0, 50.0]).unwrap();
        let expected = 2f64.powf(-depth / forest.average_path_length());
        assert_eq!(forest.score(&[100.0, 50.0]).unwrap(), expected);
    }

    #[test]
    fn test_retrain_with_seed_is_idempotent() {
        let points = cluster(200, 16);
        let mut forest = trained_forest(&points, 23);
        let probe = [103.0, 47.5];

        let first = forest.score(&probe).unwrap();
        let first_threshold = forest.threshold();
        forest.train().unwrap();

        assert_eq!(forest.score(&probe).unwrap(), first);
        assert_eq!(forest.threshold(), first_threshold);
    }

    #[test]
    fn test_single_point_gives_neutral_score() {
        let mut forest =
            IsolationForest::new(IsolationForestConfig::default().with_seed(1)).unwrap();
        forest.add_training_data(&[1.0, 1.0]).unwrap();
        forest.train().unwrap();

        assert_eq!(forest.average_path_length(), 0.0);
        assert_eq!(forest.score(&[5.0, 5.0]).unwrap(), 0.5);
        assert!(!forest.detect_multi(&[5.0, 5.0]).unwrap().is_anomaly);
    }

    #[test]
    fn test_identical_points_do_not_panic() {
        let mut forest =
            IsolationForest::new(IsolationForestConfig::default().with_seed(2)).unwrap();
        for _ in 0..40 {
            forest.add_training_data(&[3.0, 3.0]).unwrap();
        }
        forest.train().unwrap();

        let score = forest.score(&[3.0, 3.0]).unwrap();
        assert!(score > 0.0 && score <= 1.0);
    }
}
