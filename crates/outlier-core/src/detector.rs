//! Detector lifecycle contract.
//!
//! Every detector follows the same three phases: accumulate training data,
//! train (or build / recluster) a model, then detect points against it.

use std::io::{Read, Write};

use serde::{Deserialize, Serialize};

use crate::config::DetectorConfig;
use crate::error::{AnomalyError, Result};

/// Detector identifiers, also used to tag checkpoints
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DetectorKind {
    IsolationForest = 0,
    Dbscan = 1,
    Lof = 2,
}

impl DetectorKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::IsolationForest => "IsolationForest",
            Self::Dbscan => "DBSCAN",
            Self::Lof => "LOF",
        }
    }
}

/// Outcome of a single detection call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionResult {
    pub is_anomaly: bool,
    /// Primary metric of the detector (isolation score, LOF ratio, ...)
    pub value: f64,
    pub z_score: f64,
    pub lower_limit: f64,
    pub upper_limit: f64,
    pub description: String,
}

impl DetectionResult {
    pub fn normal(value: f64, z_score: f64, lower_limit: f64, upper_limit: f64) -> Self {
        Self {
            is_anomaly: false,
            value,
            z_score,
            lower_limit,
            upper_limit,
            description: String::new(),
        }
    }

    pub fn anomaly(value: f64, z_score: f64, lower_limit: f64, upper_limit: f64) -> Self {
        Self {
            is_anomaly: true,
            ..Self::normal(value, z_score, lower_limit, upper_limit)
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// Trait for all detectors
pub trait Detector: Send {
    fn name(&self) -> &'static str {
        self.kind().name()
    }

    fn kind(&self) -> DetectorKind;

    /// Shared sensitivity configuration
    fn config(&self) -> &DetectorConfig;

    /// Feature dimensionality, fixed by the first ingested point
    fn dimensions(&self) -> Option<usize>;

    /// Append a feature vector to the training data.
    ///
    /// Fails with [`AnomalyError::DimensionMismatch`] when the vector length
    /// disagrees with the fixed dimensionality, regardless of training state.
    fn add_training_data(&mut self, point: &[f64]) -> Result<()>;

    fn add_value(&mut self, value: f64) -> Result<()> {
        self.add_training_data(&[value])
    }

    /// Rebuild the model from the currently buffered data
    fn train(&mut self) -> Result<()>;

    fn detect(&mut self, value: f64) -> Result<DetectionResult> {
        self.detect_multi(&[value])
    }

    fn detect_multi(&mut self, point: &[f64]) -> Result<DetectionResult>;

    fn is_initialized(&self) -> bool;

    fn save(&self, writer: &mut dyn Write) -> Result<()>;

    /// Replace this detector's state with a checkpoint read from `reader`
    fn load(&mut self, reader: &mut dyn Read) -> Result<()>;
}

impl<D: Detector + ?Sized> Detector for Box<D> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn kind(&self) -> DetectorKind {
        (**self).kind()
    }

    fn config(&self) -> &DetectorConfig {
        (**self).config()
    }

    fn dimensions(&self) -> Option<usize> {
        (**self).dimensions()
    }

    fn add_training_data(&mut self, point: &[f64]) -> Result<()> {
        (**self).add_training_data(point)
    }

    fn add_value(&mut self, value: f64) -> Result<()> {
        (**self).add_value(value)
    }

    fn train(&mut self) -> Result<()> {
        (**self).train()
    }

    fn detect(&mut self, value: f64) -> Result<DetectionResult> {
        (**self).detect(value)
    }

    fn detect_multi(&mut self, point: &[f64]) -> Result<DetectionResult> {
        (**self).detect_multi(point)
    }

    fn is_initialized(&self) -> bool {
        (**self).is_initialized()
    }

    fn save(&self, writer: &mut dyn Write) -> Result<()> {
        (**self).save(writer)
    }

    fn load(&mut self, reader: &mut dyn Read) -> Result<()> {
        (**self).load(reader)
    }
}

/// Feature dimensionality fixed at first ingestion
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Dimensionality(Option<usize>);

impl Dimensionality {
    pub fn get(&self) -> Option<usize> {
        self.0
    }

    pub fn reset(&mut self) {
        self.0 = None;
    }

    /// Validate `point` for ingestion, fixing the dimensionality on first use
    pub fn admit(&mut self, point: &[f64]) -> Result<()> {
        if point.is_empty() {
            return Err(AnomalyError::invalid(
                "point",
                "feature vector must not be empty",
            ));
        }
        if point.iter().any(|v| !v.is_finite()) {
            return Err(AnomalyError::invalid(
                "point",
                "feature values must be finite",
            ));
        }
        match self.0 {
            None => {
                self.0 = Some(point.len());
                Ok(())
            }
            Some(expected) => Self::compare(expected, point.len()),
        }
    }

    /// Validate `point` against the fixed dimensionality without changing it
    pub fn check(&self, point: &[f64]) -> Result<()> {
        match self.0 {
            Some(expected) => Self::compare(expected, point.len()),
            None if point.is_empty() => Err(AnomalyError::invalid(
                "point",
                "feature vector must not be empty",
            )),
            None => Ok(()),
        }
    }

    fn compare(expected: usize, got: usize) -> Result<()> {
        if expected == got {
            Ok(())
        } else {
            Err(AnomalyError::DimensionMismatch { expected, got })
        }
    }
}

impl From<Option<usize>> for Dimensionality {
    fn from(dims: Option<usize>) -> Self {
        Self(dims)
    }
}
