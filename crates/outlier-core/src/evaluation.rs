//! Ground-truth evaluation of detectors.
//!
//! Pure client of the [`Detector`] contract: feed labelled samples through
//! `detect_multi` and tally the outcomes.

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use crate::detector::Detector;
use crate::error::{AnomalyError, Result};

/// Feature vector with its ground-truth label
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabeledPoint {
    pub features: Vec<f64>,
    pub is_anomaly: bool,
}

impl LabeledPoint {
    pub fn normal(features: Vec<f64>) -> Self {
        Self {
            features,
            is_anomaly: false,
        }
    }

    pub fn anomaly(features: Vec<f64>) -> Self {
        Self {
            features,
            is_anomaly: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfusionMatrix {
    pub true_positives: u64,
    pub false_positives: u64,
    pub true_negatives: u64,
    pub false_negatives: u64,
}

impl ConfusionMatrix {
    pub fn record(&mut self, actual: bool, predicted: bool) {
        match (actual, predicted) {
            (true, true) => self.true_positives += 1,
            (false, true) => self.false_positives += 1,
            (false, false) => self.true_negatives += 1,
            (true, false) => self.false_negatives += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.true_positives + self.false_positives + self.true_negatives + self.false_negatives
    }

    pub fn precision(&self) -> f64 {
        ratio(self.true_positives, self.true_positives + self.false_positives)
    }

    pub fn recall(&self) -> f64 {
        ratio(self.true_positives, self.true_positives + self.false_negatives)
    }

    pub fn f1_score(&self) -> f64 {
        let (precision, recall) = (self.precision(), self.recall());
        if precision + recall > 0.0 {
            2.0 * precision * recall / (precision + recall)
        } else {
            0.0
        }
    }

    pub fn accuracy(&self) -> f64 {
        ratio(self.true_positives + self.true_negatives, self.total())
    }

    pub fn merge(&mut self, other: &ConfusionMatrix) {
        self.true_positives += other.true_positives;
        self.false_positives += other.false_positives;
        self.true_negatives += other.true_negatives;
        self.false_negatives += other.false_negatives;
    }
}

fn ratio(numerator: u64, denominator: u64) -> f64 {
    if denominator > 0 {
        numerator as f64 / denominator as f64
    } else {
        0.0
    }
}

/// Run every sample through an already trained detector
pub fn evaluate<D>(detector: &mut D, samples: &[LabeledPoint]) -> Result<ConfusionMatrix>
where
    D: Detector + ?Sized,
{
    let mut matrix = ConfusionMatrix::default();
    for sample in samples {
        let result = detector.detect_multi(&sample.features)?;
        matrix.record(sample.is_anomaly, result.is_anomaly);
    }
    Ok(matrix)
}

/// Shuffle with a fixed seed and split off `test_ratio` of the samples.
///
/// Returns `(train, test)`; the test set holds `round(len * test_ratio)`
/// samples.
pub fn train_test_split<T: Clone>(
    samples: &[T],
    test_ratio: f64,
    seed: u64,
) -> Result<(Vec<T>, Vec<T>)> {
    if !(0.0..=1.0).contains(&test_ratio) {
        return Err(AnomalyError::invalid(
            "test_ratio",
            format!("must be within [0, 1], got {}", test_ratio),
        ));
    }

    let mut shuffled = samples.to_vec();
    shuffled.shuffle(&mut StdRng::seed_from_u64(seed));

    let test_len = (samples.len() as f64 * test_ratio).round() as usize;
    let train = shuffled.split_off(test_len);
    Ok((train, shuffled))
}
