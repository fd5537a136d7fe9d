//! Outlier detection core
//!
//! Three unsupervised detectors behind one lifecycle contract:
//! - [`IsolationForest`]: random partitioning, short paths mean anomalies
//! - [`DbscanDetector`]: density clustering over a bounded history
//! - [`LofDetector`]: local density ratio against the k nearest neighbours
//!
//! Every detector accumulates training data, builds a model and then
//! classifies feature vectors, returning a [`DetectionResult`]. Wrap one in
//! a [`SharedDetector`] to use it from several threads and to receive
//! [`AnomalyEvent`]s when the verdict flips.
//!
//! ```
//! use outlier_core::{Detector, LofConfig, LofDetector};
//!
//! let mut lof = LofDetector::new(LofConfig::new(3)).unwrap();
//! for i in 0..11 {
//!     lof.add_value(9.5 + i as f64 * 0.1).unwrap();
//! }
//! lof.train().unwrap();
//!
//! assert!(!lof.detect(10.2).unwrap().is_anomaly);
//! assert!(lof.detect(90.0).unwrap().is_anomaly);
//! ```

pub mod algo;
pub mod checkpoint;
pub mod config;
pub mod detector;
pub mod distance;
pub mod error;
pub mod evaluation;
pub mod shared;

pub use algo::{ClusterLabel, DbscanDetector, IsolationForest, LofDetector};
pub use checkpoint::{CheckpointError, Checkpointable, load_from_path, save_to_path};
pub use config::{DbscanConfig, DetectorConfig, DetectorSettings, IsolationForestConfig, LofConfig};
pub use detector::{DetectionResult, Detector, DetectorKind};
pub use distance::{Neighbor, euclidean, find_k_nearest_neighbors};
pub use error::{AnomalyError, Result};
pub use evaluation::{ConfusionMatrix, LabeledPoint, evaluate, train_test_split};
pub use shared::{AnomalyEvent, SharedDetector, Transition};
